//! Integration tests for command dispatch

mod common;

use common::{fail, run, sent, AWG, DMM, JDS, MATRIX, PSU, SCOPE};
use lab_bench::error::ErrorKind;
use lab_bench::interpreter::Reply;
use lab_bench::session::Outcome;
use lab_bench::transport::sim::{SimDevice, SimulatedBench};
use lab_bench::transport::TransportKind;
use tempfile::TempDir;

// =============================================================================
// Power supplies
// =============================================================================

#[tokio::test]
async fn test_supply_set_selects_channel_then_programs() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();

    let reply = run(&mut repl, "psu set p6v 5.0 0.2").await;

    assert_eq!(reply, "P6V: 5.000 V, limit 0.200 A");
    let commands = sent(&bench, PSU);
    assert_eq!(commands.first().map(String::as_str), Some("INST:SEL P6V"));
    assert!(commands.contains(&"VOLT 5.000".to_string()), "{commands:?}");
    assert!(commands.iter().any(|c| c.starts_with("CURR ")), "{commands:?}");
}

#[tokio::test]
async fn test_over_voltage_writes_nothing() {
    let (bench, mut repl) = common::scanned_bench().await;
    let before = bench.bytes_written(PSU.0, PSU.1);

    let err = fail(&mut repl, "psu set p6v 7.5").await;

    assert_eq!(err.kind(), ErrorKind::Safety);
    assert_eq!(bench.bytes_written(PSU.0, PSU.1), before);
}

#[tokio::test]
async fn test_configured_cap_is_enforced_below_model_limit() {
    let bench = SimulatedBench::demo();
    let mut config = lab_bench::config::BenchConfig::ephemeral();
    config.safety.max_voltage = Some(12.0);
    let mut repl = common::interpreter(&bench, config);
    run(&mut repl, "scan").await;
    let before = bench.bytes_written(MATRIX.0, MATRIX.1);

    let err = fail(&mut repl, "psu_matrix set 24").await;

    assert_eq!(err.kind(), ErrorKind::Safety);
    assert_eq!(bench.bytes_written(MATRIX.0, MATRIX.1), before);
    run(&mut repl, "psu_matrix set 12").await;
}

#[tokio::test]
async fn test_single_channel_supply_needs_no_channel() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();

    assert_eq!(run(&mut repl, "psu_matrix set 12 1.5").await, "OUT: 12.000 V, limit 1.500 A");
    assert_eq!(run(&mut repl, "psu_matrix meas").await, "OUT: 12.0000 V  0.2500 A");
    run(&mut repl, "psu_matrix output on").await;

    assert!(sent(&bench, MATRIX).contains(&"OUTP ON".to_string()));
}

#[tokio::test]
async fn test_single_channel_supply_reads_numbers_as_values() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();

    // "1" is also a channel alias on this model.
    assert_eq!(run(&mut repl, "psu_matrix set 1 0.5").await, "OUT: 1.000 V, limit 0.500 A");
    assert_eq!(sent(&bench, MATRIX), vec!["VOLT 1.000", "CURR 0.500"]);

    bench.clear_traffic();
    assert_eq!(run(&mut repl, "psu_matrix volt 1").await, "OUT: 1.000 V");
    assert_eq!(run(&mut repl, "psu_matrix curr 1").await, "OUT: limit 1.000 A");
    assert_eq!(sent(&bench, MATRIX), vec!["VOLT 1.000", "CURR 1.000"]);

    // Named channels still work.
    assert_eq!(run(&mut repl, "psu_matrix volt ch1 2").await, "OUT: 2.000 V");
}

#[tokio::test]
async fn test_multi_channel_supply_requires_known_channel() {
    let (_bench, mut repl) = common::scanned_bench().await;
    let err = fail(&mut repl, "psu set p12v 5").await;
    assert_eq!(err.kind(), ErrorKind::Usage);
    let err = fail(&mut repl, "psu meas").await;
    assert_eq!(err.kind(), ErrorKind::Usage);
}

// =============================================================================
// Generators, scopes and meters
// =============================================================================

#[tokio::test]
async fn test_generator_wave_with_engineering_suffixes() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();

    run(&mut repl, "awg wave 2 square freq=1.5k amp=500m offset=0.1").await;
    run(&mut repl, "awg output both on").await;

    assert_eq!(
        sent(&bench, AWG),
        vec![
            "C2:BSWV WVTP,SQUARE,FRQ,1500,AMP,0.5,OFST,0.1",
            "C1:OUTP ON",
            "C2:OUTP ON",
        ]
    );
}

#[tokio::test]
async fn test_register_generator_through_same_verbs() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();

    run(&mut repl, "awg_jds wave 1 sine freq=1000 amp=2").await;
    run(&mut repl, "awg_jds output 1 on").await;

    let commands = sent(&bench, JDS);
    assert!(commands.contains(&":w21=0.".to_string()), "{commands:?}");
    assert!(commands.contains(&":w20=1,0.".to_string()), "{commands:?}");
}

#[tokio::test]
async fn test_scope_acquire_summarises_waveform() {
    let (_bench, mut repl) = common::scanned_bench().await;
    let reply = run(&mut repl, "scope acquire 1").await;
    assert!(reply.starts_with("CH1: 8 samples, min -0.2000 V, max 0.2000 V"), "{reply}");
}

#[tokio::test]
async fn test_scope_configure_needs_a_setting() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();

    let err = fail(&mut repl, "scope configure ch=2").await;
    assert_eq!(err.kind(), ErrorKind::Usage);
    let err = fail(&mut repl, "scope configure bogus=1").await;
    assert_eq!(err.kind(), ErrorKind::Usage);

    run(&mut repl, "scope configure ch=2 vscale=500m coupling=ac").await;
    let commands = sent(&bench, SCOPE);
    assert!(commands.contains(&"CH2:SCAle 0.5".to_string()), "{commands:?}");
    assert!(commands.contains(&"CH2:COUPling AC".to_string()), "{commands:?}");
}

#[tokio::test]
async fn test_meter_read_and_measure() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();

    assert_eq!(run(&mut repl, "dmm read").await, "1.23456 V");
    run(&mut repl, "dmm meas res 1k").await;

    let commands = sent(&bench, DMM);
    assert_eq!(commands[0], "MEAS:VOLT:DC? DEF,DEF");
    assert_eq!(commands[1], "MEAS:RES? 1000,DEF");
}

#[tokio::test]
async fn test_readings_land_in_measurement_log() {
    let (_bench, mut repl) = common::scanned_bench().await;
    assert_eq!(run(&mut repl, "log print").await, "No measurements recorded.");

    run(&mut repl, "psu meas p6v label=rail").await;
    run(&mut repl, "dmm read").await;
    // Settings are not measurements.
    run(&mut repl, "psu set p6v 3.3").await;

    let log = repl.session().measurements();
    assert_eq!(log.len(), 3);
    assert_eq!(log.latest("rail_v").map(|m| m.value), Some(5.0012));
    assert_eq!(log.latest("rail_i").map(|m| m.unit.as_str()), Some("A"));
    let meter = log.latest("dmm_volt_dc").unwrap();
    assert_eq!(meter.value, 1.23456);
    assert_eq!(meter.source, "dmm.read");

    let table = run(&mut repl, "log print").await;
    assert!(table.contains("rail_v"), "{table}");
    assert!(table.contains("dmm_volt_dc"), "{table}");

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.csv");
    let reply = run(&mut repl, &format!("log save {}", path.display())).await;
    assert!(reply.starts_with("Saved 3 measurement(s)"), "{reply}");
    let saved = std::fs::read_to_string(&path).unwrap();
    assert!(saved.starts_with("timestamp,label,value,unit,source"), "{saved}");
    assert!(saved.contains(",rail_v,5.0012,V,psu.meas"), "{saved}");

    let text_path = dir.path().join("bench.dat");
    assert_eq!(
        fail(&mut repl, &format!("log save {}", text_path.display())).await.kind(),
        ErrorKind::Usage
    );
    run(&mut repl, &format!("log save {} txt", text_path.display())).await;
    assert!(std::fs::read_to_string(&text_path).unwrap().contains("rail_i"));

    assert_eq!(run(&mut repl, "log clear").await, "Cleared 3 measurement(s)");
    assert!(repl.session().measurements().is_empty());
}

#[tokio::test]
async fn test_meter_label_overrides_derived_name() {
    let (_bench, mut repl) = common::scanned_bench().await;

    run(&mut repl, "dmm meas res 1k label=r_load").await;
    assert_eq!(fail(&mut repl, "dmm read tag=x").await.kind(), ErrorKind::Usage);

    let log = repl.session().measurements();
    assert_eq!(log.len(), 1);
    assert_eq!(log.entries()[0].label, "r_load");
    assert_eq!(log.entries()[0].source, "dmm.meas");
}

// =============================================================================
// Capability dispatch
// =============================================================================

#[tokio::test]
async fn test_verb_outside_declared_capabilities() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();

    let err = fail(&mut repl, "dmm wave 1 sine").await;
    assert_eq!(err.kind(), ErrorKind::Capability);
    let err = fail(&mut repl, "psu awg output 1 on").await;
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert!(sent(&bench, DMM).is_empty());
    assert!(sent(&bench, PSU).is_empty());
}

#[tokio::test]
async fn test_unknown_model_only_accepts_uniform_verbs() {
    let bench = SimulatedBench::demo();
    bench.add(TransportKind::Gpib, "GPIB0::9::INSTR", SimDevice::new("ACME,WIDGET-9,42,0.1"));
    let mut repl = common::interpreter(&bench, lab_bench::config::BenchConfig::ephemeral());
    run(&mut repl, "scan").await;

    // Unknown models are not auto-bound.
    assert!(repl.session().bindings().all(|(_, d)| d.record().model != "WIDGET-9"));
    run(&mut repl, "bind widget gpib:GPIB0::9::INSTR").await;

    let err = fail(&mut repl, "widget set 1 5").await;
    assert_eq!(err.kind(), ErrorKind::Capability);
    assert_eq!(run(&mut repl, "widget idn").await, "ACME,WIDGET-9,42,0.1");
    assert_eq!(run(&mut repl, "idn widget").await, "ACME,WIDGET-9,42,0.1");
}

#[tokio::test]
async fn test_raw_passthrough() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();

    assert_eq!(run(&mut repl, "raw psu MEAS:VOLT?").await, "+5.00120000E+00");
    assert_eq!(
        repl.execute("raw psu \"SYST:BEEP\"").await.unwrap(),
        Reply::Empty
    );
    assert_eq!(sent(&bench, PSU), vec!["MEAS:VOLT?", "SYST:BEEP"]);
}

// =============================================================================
// History and session verbs
// =============================================================================

#[tokio::test]
async fn test_every_dispatch_is_in_history() {
    let (_bench, mut repl) = common::scanned_bench().await;

    run(&mut repl, "psu output on").await;
    fail(&mut repl, "psu set p6v 99").await;
    fail(&mut repl, "nosuch thing").await;

    let history = repl.session().history();
    let tail: Vec<_> = history[history.len() - 3..].iter().collect();
    assert_eq!(tail[0].raw_text, "psu output on");
    assert_eq!(tail[0].resolved_alias.as_deref(), Some("psu"));
    assert_eq!(tail[0].verb, "output");
    assert_eq!(tail[0].args, vec!["on"]);
    assert!(tail[0].outcome.is_success());
    assert!(matches!(
        tail[1].outcome,
        Outcome::Failure {
            kind: ErrorKind::Safety,
            ..
        }
    ));
    assert!(matches!(
        tail[2].outcome,
        Outcome::Failure {
            kind: ErrorKind::UnknownAlias,
            ..
        }
    ));
}

#[tokio::test]
async fn test_listing_status_and_help() {
    let (_bench, mut repl) = common::scanned_bench().await;

    let listing = run(&mut repl, "list").await;
    assert!(listing.contains("HP E3631A"), "{listing}");
    assert!(listing.contains("psu_matrix"), "{listing}");

    run(&mut repl, "use dmm").await;
    let status = run(&mut repl, "status").await;
    assert!(status.contains("Selected: dmm"), "{status}");
    assert!(status.contains("Recording: off"), "{status}");

    let help = run(&mut repl, "help psu").await;
    assert!(help.contains("psu set [ch] <volts> [amps]"), "{help}");
    assert!(!help.contains("wave"), "{help}");
    assert_eq!(fail(&mut repl, "help nonsense").await.kind(), ErrorKind::Usage);
}

#[tokio::test]
async fn test_sleep_rejects_negative_durations() {
    let (_bench, mut repl) = common::scanned_bench().await;
    assert_eq!(repl.execute("sleep 10m").await.unwrap(), Reply::Empty);
    assert_eq!(fail(&mut repl, "sleep -1").await.kind(), ErrorKind::Usage);
}

#[tokio::test]
async fn test_exit_and_quit() {
    let (_bench, mut repl) = common::scanned_bench().await;
    assert_eq!(repl.execute("exit").await.unwrap(), Reply::Exit);
    assert_eq!(repl.execute("QUIT").await.unwrap(), Reply::Exit);
}
