//! Single-device stories against a slow or failing control plane

use std::time::Duration;

use flotta_sim::device::Phase;
use flotta_sim::pki::{certificate_common_name, public_keys_match, signed_by};
use flotta_sim::Error;

use super::helpers::{run_device, test_config, Call, Presented, RecordingBackend, Script};

// =============================================================================
// Registration while approval propagates
// =============================================================================

/// Story: Registration is pending twice, then the certificate is issued
///
/// The management plane answers 404 until the approval becomes visible. The
/// device backs off between attempts, keeps retrying with the bootstrap
/// credential and ends up with a stored certificate issued for its own key.
#[tokio::test(start_paused = true)]
async fn story_registration_succeeds_on_third_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.timings.backoff_min = Duration::from_secs(5);
    config.timings.backoff_max = Duration::from_secs(5);
    let backend = RecordingBackend::new(Script::default().register(&[404, 404, 200]));

    let started = tokio::time::Instant::now();
    let outcome = run_device("dev-pending", config, &backend).await;

    assert!(outcome.is_success(), "{:?}", outcome.status);
    assert_eq!(outcome.register_attempts, 3);
    assert!(
        started.elapsed() >= Duration::from_secs(10),
        "two backoffs expected, {:?} elapsed",
        started.elapsed()
    );
    assert_eq!(backend.count("dev-pending", |c| *c == Call::Register), 3);
    assert_eq!(backend.accepted_registrations("dev-pending"), 1);

    let stored = std::fs::read_to_string(dir.path().join("dev-pending.pem")).unwrap();
    assert_eq!(Some(stored.clone()), backend.issued_to("dev-pending"));
    assert_eq!(certificate_common_name(&stored).unwrap(), "dev-pending");
    assert!(signed_by(&stored, backend.ca_pem()).unwrap());

    let csr = backend.csr_of("dev-pending").unwrap();
    assert!(public_keys_match(&stored, &csr).unwrap());

    let registrations: Vec<_> = backend
        .calls_for("dev-pending")
        .into_iter()
        .filter(|r| r.call == Call::Register)
        .collect();
    assert!(registrations
        .iter()
        .all(|r| r.presented == Presented::Bootstrap));
}

/// Story: Registration that never becomes visible fails the device
///
/// After the bound is reached the device stops: no label, no workloads, no
/// steady-state traffic.
#[tokio::test]
async fn story_registration_bound_stops_device() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.retry_limits.max_register_attempts = 3;
    let backend = RecordingBackend::new(Script::default().register(&[404; 10]));

    let outcome = run_device("dev-lost", config, &backend).await;

    assert_eq!(outcome.failed_phase(), Some(Phase::Registered));
    assert_eq!(outcome.register_attempts, 3);
    assert!(matches!(
        outcome.error(),
        Some(Error::RetryBoundExceeded { attempts: 3, .. })
    ));
    assert_eq!(backend.count("dev-lost", |c| *c == Call::Register), 3);
    assert_eq!(
        backend.count("dev-lost", |c| matches!(
            c,
            Call::Label(_) | Call::CreateWorkload(_) | Call::GetUpdates(_) | Call::Heartbeat
        )),
        0
    );
    assert!(!dir.path().join("dev-lost.pem").exists());
}

/// Story: The default bound allows nine registration attempts
#[tokio::test]
async fn story_default_bound_allows_nine_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let mut statuses = vec![404; 8];
    statuses.push(200);
    let backend = RecordingBackend::new(Script::default().register(&statuses));

    let outcome = run_device("dev-nine", test_config(dir.path()), &backend).await;

    assert!(outcome.is_success(), "{:?}", outcome.status);
    assert_eq!(outcome.register_attempts, 9);
}

// =============================================================================
// Approval
// =============================================================================

/// Story: Approval keeps failing for a while and the device just waits
///
/// No cap is configured, so five rejections are retried and exactly one
/// approval is acted upon.
#[tokio::test]
async fn story_slow_approval_is_retried_without_cap() {
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::new(Script::default().approve(&[500, 409, 500, 404, 500]));

    let outcome = run_device("dev-slow", test_config(dir.path()), &backend).await;

    assert!(outcome.is_success(), "{:?}", outcome.status);
    assert_eq!(outcome.approve_attempts, 6);
    assert_eq!(backend.count("dev-slow", |c| *c == Call::Approve), 6);
    assert_eq!(backend.accepted_approvals("dev-slow"), 1);
}

/// Story: An operator-configured approval cap turns a stuck approval into a failure
#[tokio::test]
async fn story_approval_cap_fails_device() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.retry_limits.approve_max_attempts = Some(2);
    let backend = RecordingBackend::new(Script::default().approve(&[500; 5]));

    let outcome = run_device("dev-capped", config, &backend).await;

    assert_eq!(outcome.failed_phase(), Some(Phase::Approved));
    assert_eq!(backend.count("dev-capped", |c| *c == Call::Approve), 2);
    assert_eq!(backend.count("dev-capped", |c| *c == Call::Register), 0);
}

// =============================================================================
// Early failures
// =============================================================================

/// Story: A device whose enrolment is refused never goes further
#[tokio::test]
async fn story_failed_enrolment_makes_no_further_calls() {
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::new(Script::default().enrol(&[403]));

    let outcome = run_device("dev-refused", test_config(dir.path()), &backend).await;

    assert_eq!(outcome.failed_phase(), Some(Phase::Enrolled));
    assert_eq!(outcome.phase_history, vec![Phase::Start]);

    let calls = backend.calls_for("dev-refused");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].call, Call::Enrol);
    assert_eq!(calls[0].presented, Presented::Bootstrap);
}

/// Story: Three workloads are created, named after the device
#[tokio::test]
async fn story_workloads_named_by_index() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.workload_count = 3;
    let backend = RecordingBackend::new(Script::default());

    let outcome = run_device("dev-w", config, &backend).await;

    assert!(outcome.is_success(), "{:?}", outcome.status);
    let workloads: Vec<_> = backend
        .calls_for("dev-w")
        .into_iter()
        .filter_map(|r| match r.call {
            Call::CreateWorkload(name) => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(workloads, vec!["dev-w-0", "dev-w-1", "dev-w-2"]);
    assert_eq!(
        backend.count("dev-w", |c| *c == Call::Label("region".to_string())),
        1
    );
}

/// Story: A rejected workload stops the device without undoing earlier ones
#[tokio::test]
async fn story_rejected_workload_stops_device() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.workload_count = 4;
    let backend = RecordingBackend::new(Script::default().create_workload(&[201, 422]));

    let outcome = run_device("dev-wf", config, &backend).await;

    assert_eq!(outcome.failed_phase(), Some(Phase::WorkloadsCreated));
    assert_eq!(outcome.error().and_then(Error::status), Some(422));
    assert_eq!(
        backend.count("dev-wf", |c| matches!(c, Call::CreateWorkload(_))),
        2
    );
    assert_eq!(backend.count("dev-wf", |c| *c == Call::Heartbeat), 0);
}

/// Story: Phases only move forward for a device that succeeds
#[tokio::test]
async fn story_phase_history_is_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::new(Script::default().register(&[404]).approve(&[500]));

    let outcome = run_device("dev-mono", test_config(dir.path()), &backend).await;

    assert!(outcome.is_success(), "{:?}", outcome.status);
    assert_eq!(outcome.phase_history, Phase::ALL.to_vec());
    assert!(outcome.phase_history.windows(2).all(|w| w[0] < w[1]));
}
