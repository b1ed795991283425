//! Lifecycle sequencer behaviour against real child processes

use convoy::exec::{LifecycleSequencer, ProcessSpec, SequenceOutcome, Step, SupervisionPolicy};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::sync::mpsc;

fn sh(name: &str, script: &str) -> ProcessSpec {
    ProcessSpec::new(name, "sh").arg("-c").arg(script)
}

#[tokio::test]
async fn test_failure_aborts_remaining_steps() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let c = dir.path().join("c");
    let sequencer = LifecycleSequencer::new();

    let handle = sequencer.sequence(
        "chain",
        vec![
            Step::process("a", sh("a", &format!("touch {}", a.display())), SupervisionPolicy::once()),
            Step::process("b", sh("b", "exit 4"), SupervisionPolicy::once()),
            Step::process("c", sh("c", &format!("touch {}", c.display())), SupervisionPolicy::once()),
        ],
    );
    assert_eq!(handle.steps(), ["a", "b", "c"]);

    match handle.outcome().await {
        SequenceOutcome::Failed { step, reason } => {
            assert_eq!(step, "b");
            assert!(reason.contains("code 4"), "reason: {}", reason);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(a.exists());
    assert!(!c.exists());
    assert_eq!(sequencer.launched_processes(), 2);
}

#[tokio::test]
async fn test_notify_fires_after_process_succeeds() {
    let (tx, mut rx) = mpsc::channel(4);
    let sequencer = LifecycleSequencer::new();
    let handle = sequencer.sequence(
        "init",
        vec![
            Step::process("prepare", sh("prepare", "exit 0"), SupervisionPolicy::once()),
            Step::notify("review", Duration::from_millis(50), tx),
        ],
    );

    let notification = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification not delivered")
        .unwrap();
    assert_eq!(notification.sequence, "init");
    assert_eq!(notification.step, "review");
    assert_eq!(handle.outcome().await, SequenceOutcome::Completed);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_process_suppresses_notification() {
    let (tx, mut rx) = mpsc::channel(4);
    let handle = LifecycleSequencer::new().sequence(
        "init",
        vec![
            Step::process("prepare", sh("prepare", "exit 1"), SupervisionPolicy::once()),
            Step::notify("review", Duration::ZERO, tx),
        ],
    );
    assert!(matches!(handle.outcome().await, SequenceOutcome::Failed { ref step, .. } if step == "prepare"));
    // The sender was dropped with the unexecuted step
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_deadline_fails_step() {
    let handle = LifecycleSequencer::new().sequence(
        "slow",
        vec![Step::process(
            "sleeper",
            sh("sleeper", "sleep 30"),
            SupervisionPolicy::once().with_deadline(Duration::from_millis(200)),
        )],
    );
    let outcome = tokio::time::timeout(Duration::from_secs(10), handle.outcome())
        .await
        .expect("deadline not enforced");
    assert_eq!(
        outcome,
        SequenceOutcome::Failed {
            step: "sleeper".into(),
            reason: "timed out".into(),
        }
    );
}

#[tokio::test]
async fn test_cancel_kills_active_step() {
    let (tx, mut rx) = mpsc::channel(4);
    let handle = LifecycleSequencer::new().sequence(
        "long",
        vec![
            Step::process("sleeper", sh("sleeper", "sleep 30"), SupervisionPolicy::once()),
            Step::notify("review", Duration::ZERO, tx),
        ],
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(10), handle.outcome())
        .await
        .expect("cancel not honoured");
    assert!(matches!(outcome, SequenceOutcome::Cancelled { .. }), "{:?}", outcome);
    assert!(rx.recv().await.is_none());
}
