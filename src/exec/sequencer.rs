//! Lifecycle sequencer
//!
//! Runs an ordered chain of steps in a background task: supervised process
//! launches and deferred notifications. Step N+1 starts only after step N
//! succeeded. The first failure aborts the chain; nothing is retried and
//! completed steps are never undone.

use crate::exec::process::{cancelled, ProcessSpec, SupervisedProcess, SupervisionPolicy};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Delivered to a review queue when a notify step fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub sequence: String,
    pub step: String,
    pub fired_at: DateTime<Utc>,
}

/// One link of a lifecycle chain
#[derive(Debug)]
pub enum Step {
    Process {
        name: String,
        spec: ProcessSpec,
        policy: SupervisionPolicy,
    },
    /// Sends a notification `delay` after the previous step succeeded
    Notify {
        name: String,
        delay: Duration,
        target: mpsc::Sender<Notification>,
    },
}

impl Step {
    pub fn process(name: impl Into<String>, spec: ProcessSpec, policy: SupervisionPolicy) -> Self {
        Self::Process {
            name: name.into(),
            spec,
            policy,
        }
    }

    pub fn notify(name: impl Into<String>, delay: Duration, target: mpsc::Sender<Notification>) -> Self {
        Self::Notify {
            name: name.into(),
            delay,
            target,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Process { name, .. } | Self::Notify { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    Running,
    Completed,
    /// `step` is the step the failure is attributable to
    Failed { step: String, reason: String },
    /// `step` is the step that was active when cancelled, if any
    Cancelled { step: Option<String> },
}

impl SequenceOutcome {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Registrant's view of a running sequence
#[derive(Clone)]
pub struct SequenceHandle {
    name: String,
    steps: Vec<String>,
    outcome_rx: watch::Receiver<SequenceOutcome>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for SequenceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceHandle")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("outcome", &*self.outcome_rx.borrow())
            .finish()
    }
}

impl SequenceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn current(&self) -> SequenceOutcome {
        self.outcome_rx.borrow().clone()
    }

    /// Wait for the chain to finish
    pub async fn outcome(&self) -> SequenceOutcome {
        let mut rx = self.outcome_rx.clone();
        let result = rx.wait_for(SequenceOutcome::is_finished).await.map(|o| o.clone());
        match result {
            Ok(outcome) => outcome,
            Err(_) => rx.borrow().clone(),
        }
    }

    /// Kill the active process step and skip everything after it
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }
}

/// Starts lifecycle chains; clones share the launch counter
#[derive(Clone, Default)]
pub struct LifecycleSequencer {
    launched: Arc<AtomicUsize>,
}

impl LifecycleSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of process steps this sequencer has launched
    pub fn launched_processes(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn sequence(&self, name: impl Into<String>, steps: Vec<Step>) -> SequenceHandle {
        let name = name.into();
        let step_names = steps.iter().map(|s| s.name().to_string()).collect();
        let (outcome_tx, outcome_rx) = watch::channel(SequenceOutcome::Running);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        tokio::spawn(run_sequence(
            name.clone(),
            steps,
            self.launched.clone(),
            outcome_tx,
            cancel_rx,
        ));

        SequenceHandle {
            name,
            steps: step_names,
            outcome_rx,
            cancel_tx: Arc::new(cancel_tx),
        }
    }
}

async fn run_sequence(
    sequence: String,
    steps: Vec<Step>,
    launched: Arc<AtomicUsize>,
    outcome_tx: watch::Sender<SequenceOutcome>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    for step in steps {
        if *cancel_rx.borrow() {
            info!(sequence = %sequence, step = %step.name(), "Sequence cancelled before step");
            outcome_tx.send_replace(SequenceOutcome::Cancelled { step: None });
            return;
        }

        let step_name = step.name().to_string();
        info!(sequence = %sequence, step = %step_name, "Starting step");

        let failure = match step {
            Step::Process { spec, policy, .. } => {
                let handle = SupervisedProcess::launch(spec, policy);
                launched.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    status = handle.on_exit() => {
                        if status.is_success() {
                            None
                        } else {
                            Some(status.to_string())
                        }
                    }
                    _ = cancelled(&mut cancel_rx) => {
                        handle.kill();
                        handle.on_exit().await;
                        info!(sequence = %sequence, step = %step_name, "Sequence cancelled");
                        outcome_tx.send_replace(SequenceOutcome::Cancelled { step: Some(step_name) });
                        return;
                    }
                }
            }
            Step::Notify { delay, target, .. } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let notification = Notification {
                            sequence: sequence.clone(),
                            step: step_name.clone(),
                            fired_at: Utc::now(),
                        };
                        match target.send(notification).await {
                            Ok(()) => None,
                            Err(_) => Some("notification target closed".to_string()),
                        }
                    }
                    _ = cancelled(&mut cancel_rx) => {
                        info!(sequence = %sequence, step = %step_name, "Sequence cancelled");
                        outcome_tx.send_replace(SequenceOutcome::Cancelled { step: Some(step_name) });
                        return;
                    }
                }
            }
        };

        if let Some(reason) = failure {
            warn!(sequence = %sequence, step = %step_name, reason = %reason, "Step failed, aborting sequence");
            outcome_tx.send_replace(SequenceOutcome::Failed {
                step: step_name,
                reason,
            });
            return;
        }
    }

    info!(sequence = %sequence, "Sequence completed");
    outcome_tx.send_replace(SequenceOutcome::Completed);
}
