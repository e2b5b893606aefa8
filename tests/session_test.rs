//! Integration tests for bindings, resource exclusivity and safe state

mod common;

use common::{fail, run, sent, AWG, DMM, JDS, MATRIX, PSU, SCOPE};
use lab_bench::error::{BenchError, ErrorKind};
use lab_bench::interpreter::Interpreter;
use lab_bench::session::Session;
use lab_bench::transport::sim::SimulatedBench;
use lab_bench::transport::{ResourceId, ResourceLocks};
use std::sync::Arc;

const PSU_ID: &str = "gpib:GPIB0::5::INSTR";

// =============================================================================
// Binding
// =============================================================================

#[tokio::test]
async fn test_bind_unbind_bind() {
    let bench = SimulatedBench::demo();
    let mut repl = common::interpreter(&bench, common::manual_config());
    run(&mut repl, "scan").await;

    run(&mut repl, &format!("bind supply {PSU_ID}")).await;
    run(&mut repl, "unbind supply").await;
    run(&mut repl, &format!("bind supply {PSU_ID}")).await;

    assert!(repl.session().is_bound("supply"));
    assert_eq!(repl.session().locks().held_count(), 1);
    let reply = run(&mut repl, "supply meas p6v").await;
    assert!(reply.starts_with("P6V: 5.0012 V"), "{reply}");
}

#[tokio::test]
async fn test_bind_by_catalog_index() {
    let bench = SimulatedBench::demo();
    let mut repl = common::interpreter(&bench, common::manual_config());
    run(&mut repl, "scan").await;

    let reply = run(&mut repl, "bind meter #3").await;
    assert!(reply.contains("34401A"), "{reply}");
    assert_eq!(
        repl.session().driver("meter").unwrap().record().resource_id.as_str(),
        "gpib:GPIB0::22::INSTR"
    );
}

#[tokio::test]
async fn test_binding_outside_catalog_is_unknown_resource() {
    let bench = SimulatedBench::demo();
    let mut repl = common::interpreter(&bench, common::manual_config());

    // Nothing scanned yet.
    let err = fail(&mut repl, &format!("bind supply {PSU_ID}")).await;
    assert_eq!(err.kind(), ErrorKind::UnknownResource);

    run(&mut repl, "scan").await;
    let err = fail(&mut repl, "bind supply gpib:GPIB0::30::INSTR").await;
    assert_eq!(err.kind(), ErrorKind::UnknownResource);
}

#[tokio::test]
async fn test_reserved_words_are_not_aliases() {
    let bench = SimulatedBench::demo();
    let mut repl = common::interpreter(&bench, common::manual_config());
    run(&mut repl, "scan").await;

    let err = fail(&mut repl, &format!("bind history {PSU_ID}")).await;
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert_eq!(repl.session().locks().held_count(), 0);
}

// =============================================================================
// Exclusivity
// =============================================================================

#[tokio::test]
async fn test_second_alias_on_same_resource_is_busy() {
    let (_bench, mut repl) = common::scanned_bench().await;

    let err = fail(&mut repl, &format!("bind other {PSU_ID}")).await;
    match err {
        BenchError::ResourceBusy { resource, holder } => {
            assert_eq!(resource, PSU_ID);
            assert_eq!(holder, "psu");
        }
        other => panic!("expected ResourceBusy, got {other:?}"),
    }

    // The first binding still works.
    run(&mut repl, "psu set p6v 3.3").await;
    assert!(!repl.session().is_bound("other"));
}

#[tokio::test]
async fn test_sessions_sharing_locks_contend() {
    let bench = SimulatedBench::demo();
    let locks = ResourceLocks::new();
    let session = |config| {
        Session::new(Arc::new(bench.clone()), config).with_locks(locks.clone())
    };
    let mut first = Interpreter::with_session(session(common::manual_config()));
    let mut second = Interpreter::with_session(session(common::manual_config()));
    run(&mut first, "scan").await;
    run(&mut second, "scan").await;

    run(&mut first, &format!("bind psu {PSU_ID}")).await;
    let err = fail(&mut second, &format!("bind psu {PSU_ID}")).await;
    match err {
        BenchError::ResourceBusy { holder, .. } => assert!(holder.starts_with("psu@"), "{holder}"),
        other => panic!("expected ResourceBusy, got {other:?}"),
    }

    run(&mut first, "unbind psu").await;
    run(&mut second, &format!("bind psu {PSU_ID}")).await;
    let resource: ResourceId = PSU_ID.parse().unwrap();
    assert!(locks.holder(&resource).is_some());
}

// =============================================================================
// Safe state
// =============================================================================

#[tokio::test]
async fn test_safe_state_visits_every_instrument_despite_failure() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();
    bench.fail_commands(PSU.0, PSU.1, "OUTP");

    let report = repl.session().enter_safe_state().await;

    assert_eq!(report.failed_aliases(), vec!["psu"]);
    assert_eq!(report.applied.len(), 5);
    assert!(sent(&bench, PSU).iter().any(|c| c.starts_with("OUTP")));
    assert!(sent(&bench, SCOPE).contains(&"ACQuire:STATE STOP".to_string()));
    assert!(sent(&bench, AWG).contains(&"C1:OUTP OFF".to_string()));
    assert!(sent(&bench, AWG).contains(&"C2:OUTP OFF".to_string()));
    assert!(sent(&bench, JDS).iter().any(|c| c.starts_with(":w20=")));
    assert!(sent(&bench, MATRIX).contains(&"OUTP OFF".to_string()));
    // Meters are left alone.
    assert!(sent(&bench, DMM).is_empty());
}

#[tokio::test]
async fn test_state_safe_reports_aggregate_failure() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.fail_commands(MATRIX.0, MATRIX.1, "OUTP");

    let err = fail(&mut repl, "state safe").await;
    match &err {
        BenchError::SafeStateFailed(failures) => {
            let aliases: Vec<_> = failures.iter().map(|(a, _)| a.as_str()).collect();
            assert_eq!(aliases, vec!["psu_matrix"]);
        }
        other => panic!("expected SafeStateFailed, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::SafeState);
}

#[tokio::test]
async fn test_safe_state_reaches_every_channel_of_a_failing_instrument() {
    let (bench, mut repl) = common::scanned_bench().await;
    run(&mut repl, "awg output both on").await;
    bench.clear_traffic();
    bench.fail_commands(AWG.0, AWG.1, "C1:OUTP");

    let err = fail(&mut repl, "state safe").await;

    match &err {
        BenchError::SafeStateFailed(failures) => {
            let aliases: Vec<_> = failures.iter().map(|(a, _)| a.as_str()).collect();
            assert_eq!(aliases, vec!["awg"]);
        }
        other => panic!("expected SafeStateFailed, got {other:?}"),
    }
    assert_eq!(sent(&bench, AWG), vec!["C1:OUTP OFF", "C2:OUTP OFF"]);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.clear_traffic();

    let report = repl.shutdown().await;

    assert!(report.is_clean());
    assert_eq!(repl.session().bindings().count(), 0);
    assert_eq!(repl.session().locks().held_count(), 0);
    assert!(sent(&bench, PSU).iter().any(|c| c == "OUTP:STAT OFF"));
}

#[tokio::test]
async fn test_close_makes_safe_then_releases_and_clears_history() {
    let (bench, mut repl) = common::scanned_bench().await;
    run(&mut repl, "psu output on").await;
    run(&mut repl, "dmm read").await;
    bench.clear_traffic();
    let catalog = repl.session().catalog().len();

    let reply = run(&mut repl, "close").await;

    assert_eq!(reply, "Closed 6 instrument(s); history cleared");
    assert!(sent(&bench, PSU).iter().any(|c| c == "OUTP:STAT OFF"));
    assert_eq!(repl.session().bindings().count(), 0);
    assert_eq!(repl.session().locks().held_count(), 0);
    assert_eq!(repl.session().catalog().len(), catalog);
    assert_eq!(repl.session().measurements().len(), 1);
    let history = repl.session().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].raw_text, "close");

    // The catalog survives, so instruments can be bound again.
    run(&mut repl, &format!("bind supply {PSU_ID}")).await;
    assert!(repl.session().is_bound("supply"));
}

#[tokio::test]
async fn test_close_tears_down_even_when_safe_state_fails() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.fail_commands(MATRIX.0, MATRIX.1, "OUTP");

    let err = fail(&mut repl, "close").await;

    assert_eq!(err.kind(), ErrorKind::SafeState);
    assert_eq!(repl.session().bindings().count(), 0);
    assert_eq!(repl.session().locks().held_count(), 0);
}

#[tokio::test]
async fn test_rescan_keeps_bindings_and_flags_vanished_instruments() {
    let (bench, mut repl) = common::scanned_bench().await;
    bench.remove(MATRIX.0, MATRIX.1);

    run(&mut repl, "scan").await;
    let listing = run(&mut repl, "list").await;

    assert!(repl.session().is_bound("psu_matrix"));
    assert!(listing.contains("'psu_matrix' is bound to serial:/dev/ttyUSB1"), "{listing}");
    // Still-present bound instruments were not reopened.
    assert_eq!(bench.open_count(PSU.0, PSU.1), 2);
}
