//! lab_bench: one command surface for a bench full of instruments.
//!
//! The crate is organised leaves-first:
//!
//! - [`transport`]: transport kinds, resource addresses, the backend traits,
//!   exclusive resource locks, and the serial and simulated backends.
//! - [`hardware`]: the model registry, capability traits, and drivers.
//! - [`discovery`]: probing of transports and construction of the catalog.
//! - [`session`]: alias bindings, history, and safe-state policy.
//! - [`sequence`]: recording and replay of command sequences.
//! - [`measurement`]: the labelled log of supply and meter readings.
//! - [`interpreter`]: the line-oriented command surface tying it together.
//!
//! [`config`], [`logging`], and [`error`] carry the ambient concerns.
//!
//! # Example
//!
//! ```
//! use lab_bench::config::BenchConfig;
//! use lab_bench::interpreter::Interpreter;
//! use lab_bench::transport::sim::SimulatedBench;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let bench = SimulatedBench::demo();
//! let mut repl = Interpreter::new(Arc::new(bench), BenchConfig::ephemeral());
//! repl.execute("scan").await.unwrap();
//! repl.execute("psu set p6v 5.0 0.2").await.unwrap();
//! repl.execute("psu output on").await.unwrap();
//! # })
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod hardware;
pub mod interpreter;
pub mod logging;
pub mod measurement;
pub mod sequence;
pub mod session;
pub mod transport;
