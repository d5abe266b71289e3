//! What a provisioned device sends with its own certificate

use flotta_sim::device::Phase;

use super::helpers::{run_device, test_config, Call, Presented, RecordingBackend, Script};

/// Story: Two iterations mean eight polls and two heartbeats, all as the device
///
/// Before registration the device speaks with the bootstrap credential;
/// afterwards every management call carries its issued certificate. The
/// backend answers half of the polls with 503, which the device shrugs off.
#[tokio::test]
async fn story_steady_state_uses_issued_identity() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.iteration_count = 2;
    let backend = RecordingBackend::new(Script::default());

    let outcome = run_device("dev-steady", config, &backend).await;
    assert!(outcome.is_success(), "{:?}", outcome.status);

    let issued = backend.issued_to("dev-steady").unwrap();
    let calls = backend.calls_for("dev-steady");

    let polls: Vec<_> = calls
        .iter()
        .filter(|r| matches!(r.call, Call::GetUpdates(_)))
        .collect();
    let heartbeats: Vec<_> = calls.iter().filter(|r| r.call == Call::Heartbeat).collect();
    assert_eq!(polls.len(), 8);
    assert_eq!(heartbeats.len(), 2);

    let own = Presented::Issued("dev-steady".to_string(), issued);
    assert!(polls.iter().all(|r| r.presented == own));
    assert!(heartbeats.iter().all(|r| r.presented == own));

    for r in &calls {
        if matches!(r.call, Call::Enrol | Call::Register) {
            assert_eq!(r.presented, Presented::Bootstrap);
        }
    }
}

/// Story: Each iteration polls four times, then sends its heartbeat
#[tokio::test]
async fn story_iteration_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.iteration_count = 2;
    let backend = RecordingBackend::new(Script::default());

    run_device("dev-order", config, &backend).await;

    let steady: Vec<Call> = backend
        .calls_for("dev-order")
        .into_iter()
        .map(|r| r.call)
        .filter(|c| matches!(c, Call::GetUpdates(_) | Call::Heartbeat))
        .collect();

    let one_iteration = vec![
        Call::GetUpdates(0),
        Call::GetUpdates(1),
        Call::GetUpdates(2),
        Call::GetUpdates(3),
        Call::Heartbeat,
    ];
    assert_eq!(steady[..5], one_iteration[..]);
    assert_eq!(steady[5..], one_iteration[..]);
}

/// Story: Zero iterations still walks the device to Done
#[tokio::test]
async fn story_zero_iterations_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.iteration_count = 0;
    config.workload_count = 0;
    let backend = RecordingBackend::new(Script::default());

    let outcome = run_device("dev-idle", config, &backend).await;

    assert!(outcome.is_success(), "{:?}", outcome.status);
    assert_eq!(outcome.phase_history.last(), Some(&Phase::Done));
    assert_eq!(
        backend.count("dev-idle", |c| matches!(
            c,
            Call::GetUpdates(_) | Call::Heartbeat | Call::CreateWorkload(_)
        )),
        0
    );
}
