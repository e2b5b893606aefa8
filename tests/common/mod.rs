//! Shared fixtures for the integration tests.
//!
//! Every test runs against [`SimulatedBench::demo`]:
//!
//! | resource                                         | model        | alias        |
//! |--------------------------------------------------|--------------|--------------|
//! | usb_tmc:USB0::0x0699::0x03A4::C012345::INSTR     | MSO2024      | `scope`      |
//! | usb_tmc:USB0::0xF4EC::0xEE38::574B21101::INSTR   | B&K 4063     | `awg`        |
//! | gpib:GPIB0::22::INSTR                            | 34401A       | `dmm`        |
//! | gpib:GPIB0::5::INSTR                             | E3631A       | `psu`        |
//! | serial:/dev/ttyUSB0                              | JDS6600      | `awg_jds`    |
//! | serial:/dev/ttyUSB1                              | MPS-6010H-1C | `psu_matrix` |

#![allow(dead_code)]

use lab_bench::config::BenchConfig;
use lab_bench::error::BenchError;
use lab_bench::interpreter::{Interpreter, Reply};
use lab_bench::transport::sim::SimulatedBench;
use lab_bench::transport::TransportKind;
use std::sync::Arc;

pub const SCOPE: (TransportKind, &str) = (TransportKind::UsbTmc, "USB0::0x0699::0x03A4::C012345::INSTR");
pub const AWG: (TransportKind, &str) = (TransportKind::UsbTmc, "USB0::0xF4EC::0xEE38::574B21101::INSTR");
pub const DMM: (TransportKind, &str) = (TransportKind::Gpib, "GPIB0::22::INSTR");
pub const PSU: (TransportKind, &str) = (TransportKind::Gpib, "GPIB0::5::INSTR");
pub const JDS: (TransportKind, &str) = (TransportKind::Serial, "/dev/ttyUSB0");
pub const MATRIX: (TransportKind, &str) = (TransportKind::Serial, "/dev/ttyUSB1");

/// Interpreter over the demo bench, before any scan.
pub fn interpreter(bench: &SimulatedBench, config: BenchConfig) -> Interpreter {
    Interpreter::new(Arc::new(bench.clone()), config)
}

/// Demo bench, scanned and auto-bound.
pub async fn scanned_bench() -> (SimulatedBench, Interpreter) {
    let bench = SimulatedBench::demo();
    let mut repl = interpreter(&bench, BenchConfig::ephemeral());
    run(&mut repl, "scan").await;
    (bench, repl)
}

/// Configuration with auto-binding off.
pub fn manual_config() -> BenchConfig {
    let mut config = BenchConfig::ephemeral();
    config.session.auto_bind = false;
    config
}

/// Execute a line that must succeed and return its text.
pub async fn run(repl: &mut Interpreter, line: &str) -> String {
    match repl.execute(line).await {
        Ok(reply) => reply.to_string(),
        Err(e) => panic!("`{line}` failed: {e}"),
    }
}

/// Execute a line that must fail.
pub async fn fail(repl: &mut Interpreter, line: &str) -> BenchError {
    match repl.execute(line).await {
        Ok(Reply::Text(text)) => panic!("`{line}` unexpectedly succeeded: {text}"),
        Ok(reply) => panic!("`{line}` unexpectedly succeeded: {reply:?}"),
        Err(e) => e,
    }
}

/// Commands a device received since the last traffic reset.
pub fn sent(bench: &SimulatedBench, device: (TransportKind, &str)) -> Vec<String> {
    bench.commands(device.0, device.1)
}
