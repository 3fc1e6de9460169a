//! Failure and abort paths of a coordinator run: workers crashing together,
//! operator abort with workers mid-scenario, during the build, and while
//! queued at the gate.

mod support;

use std::sync::Arc;
use std::time::Duration;

use study_runner::gate::ConcurrencyGate;
use study_types::{FailureKind, LockState, LockToken, RunPhase, ScenarioId};
use support::{
    run_to_exit, wait_until, Behavior, BuildHook, Harness, HookedPreparer, RecordingMerger,
    ScriptedLauncher,
};
use tokio::sync::Barrier;

const SCENARIOS: &[(i64, i64)] = &[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1)];

#[tokio::test]
async fn test_workers_crashing_together_fail_the_run_and_release_lock() {
    let harness = Harness::new(SCENARIOS).await;
    let launcher = ScriptedLauncher::new(Behavior::CrashAfterClaim(Arc::new(Barrier::new(2))));
    let merger = RecordingMerger::new();
    let coordinator = harness.coordinator(
        harness.settings(2),
        harness.deps(launcher.clone(), merger.clone()),
    );

    let report = run_to_exit(coordinator).await;

    assert!(!report.is_success());
    assert_eq!(
        report.outcome.failure().map(|f| f.kind),
        Some(FailureKind::WorkerCrash)
    );
    assert!(report.status_line().starts_with("Study run failed: "));
    assert!(report.visited(RunPhase::Restore));
    assert!(!report.visited(RunPhase::Postrun));
    assert!(report.lock_released);
    assert_eq!(harness.stored_token().await.state, LockState::None);

    // The baseline scenario finished; everything else was abandoned.
    assert_eq!(report.ledger.retired, vec![ScenarioId(1)]);
    assert_eq!(report.ledger.lost.len(), 4);
    assert!(report.ledger.balances(0, 0));

    assert!(merger.calls().is_empty());
    assert!(harness.temp_files().is_empty());
    assert_eq!(harness.staged_rows().await, 0);
}

#[tokio::test]
async fn test_abort_kills_busy_workers_then_restores() {
    let harness = Harness::new(SCENARIOS).await;
    let launcher = ScriptedLauncher::new(Behavior::Hang);
    let merger = RecordingMerger::new();
    let mut settings = harness.settings(2);
    settings.prerun = false;
    let coordinator = harness.coordinator(settings, harness.deps(launcher.clone(), merger.clone()));
    let control = coordinator.control();

    let run = tokio::spawn(run_to_exit(coordinator));
    wait_until(|| {
        let snapshot = control.snapshot();
        snapshot.phase == RunPhase::Running
            && snapshot.workers.len() == 2
            && snapshot.workers.iter().all(|w| w.pending.is_some())
    })
    .await;

    assert!(control.abort());
    let report = run.await.unwrap();

    assert_eq!(
        report.outcome.failure().map(|f| f.kind),
        Some(FailureKind::Aborted)
    );
    assert!(report.visited(RunPhase::Restore));
    assert!(report.lock_released);
    assert_eq!(report.ledger.retired_items(), 0);
    assert!(report.ledger.balances(0, 0));
    assert!(merger.calls().is_empty());
    assert!(harness.temp_files().is_empty());

    // Nothing left to abort.
    assert!(control.is_finished());
    assert!(!control.abort());
}

#[tokio::test]
async fn test_abort_during_build_releases_lock_without_restore_phase() {
    let harness = Harness::new(SCENARIOS).await;
    let launcher = ScriptedLauncher::new(Behavior::Cooperative);
    let merger = RecordingMerger::new();
    let mut deps = harness.deps(launcher.clone(), merger.clone());
    deps.preparer = HookedPreparer::new(&harness.pool, BuildHook::StallUntilCancelled);
    let coordinator = harness.coordinator(harness.settings(2), deps);
    let control = coordinator.control();

    let run = tokio::spawn(run_to_exit(coordinator));
    wait_until(|| control.snapshot().phase == RunPhase::Build).await;
    // Abort only once the build holds the lock and has staged its rows.
    for _ in 0..1000 {
        if harness.staged_rows().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.staged_rows().await, SCENARIOS.len() as i64);
    assert_eq!(harness.stored_token().await.state, LockState::RunExclusive);

    assert!(control.abort());
    let report = run.await.unwrap();

    assert_eq!(
        report.outcome.failure().map(|f| f.kind),
        Some(FailureKind::Aborted)
    );
    assert_eq!(
        report.phases,
        vec![
            RunPhase::Init,
            RunPhase::Wait,
            RunPhase::Build,
            RunPhase::Exiting,
            RunPhase::Exit
        ]
    );

    // The build task undid its work and released the lock itself.
    let initial = report.initial_token.counter;
    assert_eq!(
        report.released_from,
        Some(LockToken::new(LockState::RunExclusive, initial + 1))
    );
    assert!(report.lock_released);
    assert_eq!(
        harness.stored_token().await,
        LockToken::new(LockState::None, initial + 2)
    );
    assert_eq!(harness.staged_rows().await, 0);
    assert!(launcher.launched().is_empty());
    assert!(merger.calls().is_empty());
}

#[tokio::test]
async fn test_abort_while_waiting_withdraws_gate_request() {
    let harness = Harness::new(SCENARIOS).await;
    let gate = ConcurrencyGate::new();
    let mut holder = gate.request(1.0);
    let _held = holder.try_acquire().unwrap();

    let launcher = ScriptedLauncher::new(Behavior::Cooperative);
    let merger = RecordingMerger::new();
    let mut deps = harness.deps(launcher.clone(), merger.clone());
    deps.gate = Arc::clone(&gate);
    let coordinator = harness.coordinator(harness.settings(2), deps);
    let control = coordinator.control();
    let before = harness.stored_token().await;

    let run = tokio::spawn(run_to_exit(coordinator));
    wait_until(|| control.snapshot().phase == RunPhase::Wait).await;
    assert_eq!(gate.waiting(), 1);
    assert!(control.bump());

    assert!(control.abort());
    let report = run.await.unwrap();

    assert_eq!(
        report.phases,
        vec![RunPhase::Init, RunPhase::Wait, RunPhase::Exiting, RunPhase::Exit]
    );
    assert_eq!(gate.waiting(), 0);
    assert!(launcher.launched().is_empty());
    assert!(!report.lock_released);
    assert_eq!(harness.stored_token().await, before);
}

#[tokio::test]
async fn test_runs_queue_behind_a_full_gate() {
    let first = Harness::new(&[(1, 1), (2, 1)]).await;
    let second = Harness::new(&[(1, 1)]).await;
    let gate = ConcurrencyGate::new();

    let mut deps_a = first.deps(ScriptedLauncher::new(Behavior::Cooperative), RecordingMerger::new());
    deps_a.gate = Arc::clone(&gate);
    let mut deps_b = second.deps(ScriptedLauncher::new(Behavior::Cooperative), RecordingMerger::new());
    deps_b.gate = Arc::clone(&gate);

    let a = first.coordinator(first.settings(1), deps_a);
    let b = second.coordinator(second.settings(1), deps_b);

    let (report_a, report_b) = tokio::join!(run_to_exit(a), run_to_exit(b));
    assert!(report_a.is_success(), "{}", report_a.status_line());
    assert!(report_b.is_success(), "{}", report_b.status_line());
    assert!(gate.in_use().abs() < 1e-9);
    assert_eq!(gate.waiting(), 0);
}
