//! Reconciliation engine
//!
//! One actor task per cluster owns the desired spec and every role
//! instance. Control commands, internal events from spawned tasks and
//! review notifications arrive on channels and are applied one at a time;
//! after each mutation a fresh status snapshot is published on a watch
//! channel so readers never wait on the loop.

use crate::core::config::MasterConfig;
use crate::core::errors::{ConvoyError, ErrorKind, Result};
use crate::engine::resources::{ResourceManager, SlotRequest};
use crate::engine::status::{ClusterPhase, ClusterStatus};
use crate::exec::{
    ExecutionContext, ExitStatus, LifecycleSequencer, Notification, ProcessHandle, ProcessState, SequenceHandle,
    SequenceOutcome, SupervisedProcess, SupervisionPolicy,
};
use crate::provider::{
    run_probe, ActionContext, ActionOutcome, LifecycleAction, Probe, ProbeReport, ProbeTarget, Provider,
};
use crate::spec::{
    ClusterSpec, InstanceError, InstanceHealth, InstanceState, RoleInstance, Slot, OPTION_FAILURE_WINDOW,
    OPTION_MAX_PROCESS_FAILURES, OPTION_MAX_ROLE_FAILURES,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Terminal instances kept for status reporting before the oldest are dropped
const MAX_RETAINED_TERMINAL: usize = 32;

/// Requests from the control surface
pub enum EngineCommand {
    /// Change desired instance counts
    Flex {
        roles: BTreeMap<String, u32>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Re-run a failed lifecycle action
    RetryLifecycle {
        reply: oneshot::Sender<Result<()>>,
    },
    Review,
}

/// Completions reported by tasks the engine spawned
enum EngineEvent {
    ActionResolved {
        attempt: u64,
        result: Result<Option<SequenceHandle>>,
    },
    SequenceFinished {
        attempt: u64,
        outcome: SequenceOutcome,
    },
    SlotGranted {
        instance: Uuid,
        slot: Slot,
    },
    SlotRefused {
        instance: Uuid,
        error: ConvoyError,
    },
    Staged {
        instance: Uuid,
        context: ExecutionContext,
        result: Result<()>,
    },
    ProcessStarted {
        instance: Uuid,
        pid: Option<u32>,
    },
    ProcessExited {
        instance: Uuid,
        status: ExitStatus,
    },
    Probed(ProbeReport),
}

/// Control and observation handle for one running engine
#[derive(Clone)]
pub struct EngineHandle {
    name: String,
    cmd_tx: mpsc::Sender<EngineCommand>,
    status_rx: watch::Receiver<Arc<ClusterStatus>>,
    provider: Arc<dyn Provider>,
}

impl EngineHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Latest published snapshot
    pub fn status(&self) -> Arc<ClusterStatus> {
        self.status_rx.borrow().clone()
    }

    /// Snapshot plus lazily refreshed provider status
    pub async fn status_with_provider(&self) -> ClusterStatus {
        let mut status = (*self.status()).clone();
        status.provider_status = self.provider.build_status(&status.spec).await;
        status.monitor_details = self.provider.build_monitor_details(&status.provider_status);
        status
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterStatus>> {
        self.status_rx.clone()
    }

    /// Wait for a snapshot matching `predicate`
    pub async fn wait_for<F>(&self, predicate: F) -> Arc<ClusterStatus>
    where
        F: Fn(&ClusterStatus) -> bool,
    {
        let mut rx = self.status_rx.clone();
        let result = rx.wait_for(|status| predicate(status)).await.map(|s| s.clone());
        match result {
            Ok(status) => status,
            Err(_) => rx.borrow().clone(),
        }
    }

    pub async fn flex(&self, roles: BTreeMap<String, u32>) -> Result<()> {
        self.request(|reply| EngineCommand::Flex { roles, reply }).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Stop { reply }).await?
    }

    pub async fn retry_lifecycle(&self) -> Result<()> {
        self.request(|reply| EngineCommand::RetryLifecycle { reply }).await?
    }

    pub async fn review(&self) -> Result<()> {
        self.cmd_tx
            .send(EngineCommand::Review)
            .await
            .map_err(|_| self.gone())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(make(reply_tx)).await.map_err(|_| self.gone())?;
        reply_rx.await.map_err(|_| self.gone())
    }

    fn gone(&self) -> ConvoyError {
        ConvoyError::channel(format!("engine for cluster '{}' is no longer running", self.name))
    }
}

/// Owns the state of one cluster until started
pub struct ReconciliationEngine {
    engine: Engine,
    evt_rx: mpsc::Receiver<EngineEvent>,
    review_rx: mpsc::Receiver<Notification>,
}

/// Loop-owned cluster state; only the engine task touches it
struct Engine {
    spec: ClusterSpec,
    provider: Arc<dyn Provider>,
    resources: Arc<dyn ResourceManager>,
    config: MasterConfig,
    sequencer: LifecycleSequencer,
    supervision: SupervisionPolicy,
    role_failures: RoleFailures,
    instances: Vec<RoleInstance>,
    phase: ClusterPhase,
    lifecycle: Option<SequenceHandle>,
    lifecycle_error: Option<InstanceError>,
    attempt: u64,
    probes: BTreeMap<String, Vec<Arc<dyn Probe>>>,
    probe_results: HashMap<Uuid, BTreeMap<String, Option<String>>>,
    evt_tx: mpsc::Sender<EngineEvent>,
    review_tx: mpsc::Sender<Notification>,
    status_tx: watch::Sender<Arc<ClusterStatus>>,
}

impl ReconciliationEngine {
    /// Validates the spec against the provider; nothing is allocated on failure
    pub fn new(
        spec: ClusterSpec,
        provider: Arc<dyn Provider>,
        resources: Arc<dyn ResourceManager>,
        config: MasterConfig,
    ) -> Result<Self> {
        provider.validate(&spec)?;
        let supervision = supervision_policy(&spec, &config)?;
        let role_failures = RoleFailures::from_spec(&spec, &config)?;

        let capacity = config.channel_capacity.max(1);
        let (evt_tx, evt_rx) = mpsc::channel(capacity);
        let (review_tx, review_rx) = mpsc::channel(capacity);
        let initial = ClusterStatus::new(spec.clone(), ClusterPhase::Initializing, Vec::new());
        let (status_tx, _) = watch::channel(Arc::new(initial));

        let probes = spec
            .roles
            .keys()
            .map(|role| (role.clone(), provider.create_probes(role, &spec)))
            .collect();

        let engine = Engine {
            spec,
            provider,
            resources,
            config,
            sequencer: LifecycleSequencer::new(),
            supervision,
            role_failures,
            instances: Vec::new(),
            phase: ClusterPhase::Initializing,
            lifecycle: None,
            lifecycle_error: None,
            attempt: 0,
            probes,
            probe_results: HashMap::new(),
            evt_tx,
            review_tx,
            status_tx,
        };
        Ok(Self {
            engine,
            evt_rx,
            review_rx,
        })
    }

    /// Share a sequencer, e.g. to observe launch counts
    pub fn with_sequencer(mut self, sequencer: LifecycleSequencer) -> Self {
        self.engine.sequencer = sequencer;
        self
    }

    /// Spawn the engine loop
    pub fn start(self) -> EngineHandle {
        let Self {
            engine,
            evt_rx,
            review_rx,
        } = self;
        let (cmd_tx, cmd_rx) = mpsc::channel(engine.config.channel_capacity.max(1));
        let handle = EngineHandle {
            name: engine.spec.name.clone(),
            cmd_tx,
            status_rx: engine.status_tx.subscribe(),
            provider: engine.provider.clone(),
        };
        tokio::spawn(engine.run(cmd_rx, evt_rx, review_rx));
        handle
    }
}

impl Engine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut evt_rx: mpsc::Receiver<EngineEvent>,
        mut review_rx: mpsc::Receiver<Notification>,
    ) {
        info!(cluster = %self.spec.name, provider = %self.provider.name(), "Engine started");
        self.start_lifecycle();
        self.publish();

        let mut review_timer = tokio::time::interval(self.config.review_interval());
        review_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe_timer = tokio::time::interval(self.config.probe_interval());
        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.apply_command(cmd),
                    None => {
                        info!(cluster = %self.spec.name, "All handles dropped, shutting down engine");
                        self.stop_all();
                        break;
                    }
                },
                Some(event) = evt_rx.recv() => self.apply_event(event),
                Some(notification) = review_rx.recv() => {
                    info!(
                        cluster = %self.spec.name,
                        sequence = %notification.sequence,
                        step = %notification.step,
                        "Review requested"
                    );
                    if self.phase == ClusterPhase::Initializing {
                        self.phase = ClusterPhase::Active;
                    }
                    self.review();
                }
                _ = review_timer.tick() => self.review(),
                _ = probe_timer.tick() => self.run_probes(),
            }
            self.publish();
        }
        self.publish();
    }

    fn apply_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Flex { roles, reply } => {
                let result = self.flex(roles);
                if result.is_ok() {
                    self.review();
                }
                let _ = reply.send(result);
            }
            EngineCommand::Stop { reply } => {
                self.stop_all();
                let _ = reply.send(Ok(()));
            }
            EngineCommand::RetryLifecycle { reply } => {
                let result = match self.phase {
                    ClusterPhase::Failed => {
                        info!(cluster = %self.spec.name, "Retrying lifecycle action");
                        self.start_lifecycle();
                        Ok(())
                    }
                    phase => Err(ConvoyError::BadClusterState(format!(
                        "cluster '{}' is {}, only a failed lifecycle action can be retried",
                        self.spec.name, phase
                    ))),
                };
                let _ = reply.send(result);
            }
            EngineCommand::Review => self.review(),
        }
    }

    fn flex(&mut self, roles: BTreeMap<String, u32>) -> Result<()> {
        if self.phase == ClusterPhase::Stopped {
            return Err(ConvoyError::BadClusterState(format!("cluster '{}' is stopped", self.spec.name)));
        }
        let mut updated = self.spec.clone();
        for (role, count) in &roles {
            updated.roles.entry(role.clone()).or_default().instances = *count;
        }
        self.provider.validate(&updated)?;

        for role in roles.keys() {
            if !self.probes.contains_key(role) {
                let probes = self.provider.create_probes(role, &updated);
                self.probes.insert(role.clone(), probes);
            }
        }
        for role in roles.keys() {
            if self.role_failures.reset(role) {
                info!(cluster = %self.spec.name, role = %role, "Halted role re-armed by flex");
            }
        }
        info!(cluster = %self.spec.name, roles = ?roles, "Flexed cluster");
        self.spec = updated;
        Ok(())
    }

    fn apply_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ActionResolved { attempt, result } => self.on_action_resolved(attempt, result),
            EngineEvent::SequenceFinished { attempt, outcome } => self.on_sequence_finished(attempt, outcome),
            EngineEvent::SlotGranted { instance, slot } => self.on_slot_granted(instance, slot),
            EngineEvent::SlotRefused { instance, error } => {
                warn!(cluster = %self.spec.name, instance = %instance, error = %error, "Slot request refused");
                let role = match self.instance_mut(instance) {
                    Some(inst) if inst.state == InstanceState::Requested => {
                        fail(inst, &error);
                        inst.role.clone()
                    }
                    _ => return,
                };
                self.instance_failed(&role, &error);
            }
            EngineEvent::Staged { instance, context, result } => self.on_staged(instance, context, result),
            EngineEvent::ProcessStarted { instance, pid } => {
                if let Some(inst) = self.instance_mut(instance) {
                    if inst.state == InstanceState::Launching {
                        inst.state = InstanceState::Running;
                        inst.started_at = Some(Utc::now());
                        info!(instance = %instance, role = %inst.role, pid = ?pid, "Instance running");
                    }
                }
            }
            EngineEvent::ProcessExited { instance, status } => self.on_process_exited(instance, status),
            EngineEvent::Probed(report) => self.on_probe_report(report),
        }
    }

    fn start_lifecycle(&mut self) {
        self.attempt += 1;
        self.phase = ClusterPhase::Initializing;
        self.lifecycle_error = None;

        let attempt = self.attempt;
        let provider = self.provider.clone();
        let spec = self.spec.clone();
        let ctx = ActionContext::new(&self.config, self.sequencer.clone(), self.review_tx.clone());
        let evt_tx = self.evt_tx.clone();
        tokio::spawn(async move {
            let result = provider
                .run_lifecycle_action(LifecycleAction::Initialize, &spec, &ctx)
                .await;
            match result {
                Ok(ActionOutcome::NothingToDo) => {
                    let _ = evt_tx
                        .send(EngineEvent::ActionResolved { attempt, result: Ok(None) })
                        .await;
                }
                Ok(ActionOutcome::Started(handle)) => {
                    let _ = evt_tx
                        .send(EngineEvent::ActionResolved {
                            attempt,
                            result: Ok(Some(handle.clone())),
                        })
                        .await;
                    let outcome = handle.outcome().await;
                    let _ = evt_tx.send(EngineEvent::SequenceFinished { attempt, outcome }).await;
                }
                Err(e) => {
                    let _ = evt_tx
                        .send(EngineEvent::ActionResolved { attempt, result: Err(e) })
                        .await;
                }
            }
        });
    }

    fn on_action_resolved(&mut self, attempt: u64, result: Result<Option<SequenceHandle>>) {
        if attempt != self.attempt || self.phase == ClusterPhase::Stopped {
            if let Ok(Some(handle)) = result {
                handle.cancel();
            }
            return;
        }
        match result {
            Ok(None) => {
                info!(cluster = %self.spec.name, "Nothing to initialize, cluster active");
                self.phase = ClusterPhase::Active;
                self.review();
            }
            Ok(Some(handle)) => {
                info!(cluster = %self.spec.name, sequence = %handle.name(), steps = ?handle.steps(), "Lifecycle sequence started");
                self.lifecycle = Some(handle);
            }
            Err(e) => {
                error!(cluster = %self.spec.name, error = %e, "Lifecycle action failed");
                self.phase = ClusterPhase::Failed;
                self.lifecycle_error = Some(InstanceError {
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn on_sequence_finished(&mut self, attempt: u64, outcome: SequenceOutcome) {
        if attempt != self.attempt {
            return;
        }
        self.lifecycle = None;
        match outcome {
            SequenceOutcome::Completed => {
                if self.phase == ClusterPhase::Initializing {
                    self.phase = ClusterPhase::Active;
                    self.review();
                }
            }
            SequenceOutcome::Failed { step, reason } => {
                let e = ConvoyError::process_failure(step, reason);
                error!(cluster = %self.spec.name, error = %e, "Lifecycle sequence failed");
                self.phase = ClusterPhase::Failed;
                self.lifecycle_error = Some(InstanceError {
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
            SequenceOutcome::Cancelled { step } => {
                debug!(cluster = %self.spec.name, step = ?step, "Lifecycle sequence cancelled");
            }
            SequenceOutcome::Running => {}
        }
    }

    /// Bring live instance counts to the desired counts
    fn review(&mut self) {
        if self.phase != ClusterPhase::Active {
            return;
        }
        let desired: Vec<(String, u32)> = self
            .spec
            .roles
            .iter()
            .map(|(role, spec)| (role.clone(), spec.instances))
            .collect();

        for (role, want) in desired {
            let live: Vec<usize> = self
                .instances
                .iter()
                .enumerate()
                .filter(|(_, i)| i.role == role && i.state.is_live())
                .map(|(idx, _)| idx)
                .collect();
            let have = live.len() as u32;

            if have < want && self.role_failures.is_halted(&role) {
                debug!(cluster = %self.spec.name, role = %role, have, want, "Role halted, not replacing");
            } else if have < want {
                debug!(cluster = %self.spec.name, role = %role, have, want, "Requesting slots");
                for _ in have..want {
                    self.request_slot(&role);
                }
            } else if have > want {
                let mut newest = live;
                newest.sort_by_key(|&idx| std::cmp::Reverse((self.instances[idx].requested_at, idx)));
                for idx in newest.into_iter().take((have - want) as usize) {
                    info!(role = %role, instance = %self.instances[idx].id, "Releasing surplus instance");
                    if let Some(slot) = teardown(&mut self.instances[idx]) {
                        release_slot(self.resources.clone(), slot);
                    }
                }
            }
        }
        self.prune_terminal();
    }

    fn request_slot(&mut self, role: &str) {
        let instance = RoleInstance::requested(role);
        let request = SlotRequest {
            cluster: self.spec.name.clone(),
            role: role.to_string(),
            instance: instance.id,
        };
        self.instances.push(instance);

        let resources = self.resources.clone();
        let evt_tx = self.evt_tx.clone();
        tokio::spawn(async move {
            let event = match resources.allocate(&request).await {
                Ok(slot) => EngineEvent::SlotGranted {
                    instance: request.instance,
                    slot,
                },
                Err(error) => EngineEvent::SlotRefused {
                    instance: request.instance,
                    error,
                },
            };
            let _ = evt_tx.send(event).await;
        });
    }

    fn on_slot_granted(&mut self, id: Uuid, slot: Slot) {
        let resources = self.resources.clone();
        let Some(inst) = self.instances.iter_mut().find(|i| i.id == id) else {
            release_slot(resources, slot);
            return;
        };
        if inst.state != InstanceState::Requested {
            // Stopped while the request was in flight
            release_slot(resources, slot);
            return;
        }
        inst.slot = Some(slot.clone());
        inst.state = InstanceState::Allocated;

        match self.provider.build_context(&inst.role, &slot, &self.spec) {
            Ok(context) => {
                inst.state = InstanceState::ContextBuilt;
                debug!(instance = %id, role = %inst.role, command = %context.command_line(), "Context built");
                let evt_tx = self.evt_tx.clone();
                tokio::spawn(async move {
                    let result = resources.stage(&slot, &context).await;
                    let _ = evt_tx
                        .send(EngineEvent::Staged {
                            instance: id,
                            context,
                            result,
                        })
                        .await;
                });
            }
            Err(e) => {
                warn!(instance = %id, role = %inst.role, error = %e, "Context build failed");
                fail(inst, &e);
                let role = inst.role.clone();
                release_slot(resources, slot);
                self.instance_failed(&role, &e);
            }
        }
    }

    fn on_staged(&mut self, id: Uuid, context: ExecutionContext, result: Result<()>) {
        let resources = self.resources.clone();
        let supervision = self.supervision.clone();
        let evt_tx = self.evt_tx.clone();
        let Some(inst) = self.instances.iter_mut().find(|i| i.id == id) else {
            return;
        };
        if inst.state != InstanceState::ContextBuilt {
            return;
        }
        if let Err(e) = result {
            warn!(instance = %id, role = %inst.role, error = %e, "Staging failed");
            fail(inst, &e);
            if let Some(slot) = inst.slot.clone() {
                release_slot(resources, slot);
            }
            let role = inst.role.clone();
            self.instance_failed(&role, &e);
            return;
        }

        inst.state = InstanceState::Launching;
        let handle = SupervisedProcess::launch(context.to_process_spec(), supervision);
        inst.process = Some(handle.clone());
        watch_process(id, handle, evt_tx);
    }

    fn on_process_exited(&mut self, id: Uuid, status: ExitStatus) {
        let resources = self.resources.clone();
        let Some(inst) = self.instances.iter_mut().find(|i| i.id == id) else {
            return;
        };
        if inst.state.is_terminal() {
            return;
        }
        let process = inst
            .process
            .as_ref()
            .map(|p| p.name().to_string())
            .unwrap_or_else(|| inst.role.clone());
        let error = status
            .to_error(&process)
            .unwrap_or_else(|| ConvoyError::process_failure(&process, "exited"));
        warn!(instance = %id, role = %inst.role, status = %status, "Instance process exited");
        fail(inst, &error);
        inst.process = None;
        if let Some(slot) = inst.slot.clone() {
            release_slot(resources, slot);
        }
        let role = inst.role.clone();
        self.probe_results.remove(&id);
        self.instance_failed(&role, &error);
    }

    /// Configuration errors fail the cluster; anything else counts against
    /// the role, which is halted once it crosses its threshold
    fn instance_failed(&mut self, role: &str, error: &ConvoyError) {
        if error.kind() == ErrorKind::Configuration {
            if self.phase == ClusterPhase::Active {
                error!(cluster = %self.spec.name, role = %role, error = %error, "Configuration error, cluster failed");
                self.phase = ClusterPhase::Failed;
                self.lifecycle_error = Some(InstanceError {
                    kind: error.kind(),
                    message: error.to_string(),
                });
            }
            return;
        }
        let threshold = self.role_failures.max;
        if let Some(reason) = self.role_failures.record(role, error).map(|e| e.message.clone()) {
            error!(cluster = %self.spec.name, role = %role, threshold, reason = %reason, "Role halted");
        }
    }

    fn run_probes(&self) {
        let timeout = self.config.probe_timeout();
        for inst in self.instances.iter().filter(|i| i.state == InstanceState::Running) {
            let Some(probes) = self.probes.get(&inst.role).filter(|p| !p.is_empty()) else {
                continue;
            };
            let Some(slot) = &inst.slot else {
                continue;
            };
            let target = ProbeTarget {
                instance: inst.id,
                role: inst.role.clone(),
                host: slot.host.clone(),
            };
            for probe in probes.iter().cloned() {
                let target = target.clone();
                let evt_tx = self.evt_tx.clone();
                tokio::spawn(async move {
                    let report = run_probe(probe.as_ref(), &target, timeout).await;
                    let _ = evt_tx.send(EngineEvent::Probed(report)).await;
                });
            }
        }
    }

    fn on_probe_report(&mut self, report: ProbeReport) {
        let Some(inst) = self.instances.iter_mut().find(|i| i.id == report.instance) else {
            return;
        };
        if inst.state != InstanceState::Running {
            return;
        }
        let results = self.probe_results.entry(report.instance).or_default();
        let failure = if report.healthy {
            None
        } else {
            Some(report.message.unwrap_or_else(|| "probe failed".to_string()))
        };
        results.insert(report.probe, failure);

        let reasons: Vec<String> = results
            .iter()
            .filter_map(|(probe, failure)| failure.as_ref().map(|f| format!("{}: {}", probe, f)))
            .collect();
        let health = if reasons.is_empty() {
            InstanceHealth::Healthy
        } else {
            InstanceHealth::Degraded {
                reason: reasons.join("; "),
            }
        };
        if inst.health != health {
            info!(instance = %inst.id, role = %inst.role, health = ?health, "Instance health changed");
            inst.health = health;
        }
    }

    /// Operator teardown of everything
    fn stop_all(&mut self) {
        if let Some(handle) = self.lifecycle.take() {
            handle.cancel();
        }
        for inst in self.instances.iter_mut() {
            if let Some(slot) = teardown(inst) {
                release_slot(self.resources.clone(), slot);
            }
        }
        self.probe_results.clear();
        if self.phase != ClusterPhase::Stopped {
            info!(cluster = %self.spec.name, "Cluster stopped");
        }
        self.phase = ClusterPhase::Stopped;
    }

    fn prune_terminal(&mut self) {
        let terminal = self.instances.iter().filter(|i| i.state.is_terminal()).count();
        if terminal <= MAX_RETAINED_TERMINAL {
            return;
        }
        let mut excess = terminal - MAX_RETAINED_TERMINAL;
        self.instances.retain(|i| {
            if excess > 0 && i.state.is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    fn instance_mut(&mut self, id: Uuid) -> Option<&mut RoleInstance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    fn publish(&self) {
        let views = self.instances.iter().map(RoleInstance::view).collect();
        let status = ClusterStatus::new(self.spec.clone(), self.phase, views)
            .with_lifecycle_error(self.lifecycle_error.clone())
            .with_halted_roles(&self.role_failures.halted);
        self.status_tx.send_replace(Arc::new(status));
    }
}

fn supervision_policy(spec: &ClusterSpec, config: &MasterConfig) -> Result<SupervisionPolicy> {
    let max_failures = spec.get_option_u64(OPTION_MAX_PROCESS_FAILURES, config.max_process_failures as u64)?;
    let window = spec.get_option_u64(OPTION_FAILURE_WINDOW, config.failure_window_ms)?;
    Ok(SupervisionPolicy::default().with_failures(
        u32::try_from(max_failures).unwrap_or(u32::MAX),
        Duration::from_millis(window),
    ))
}

/// Sliding-window count of failed instances per role
struct RoleFailures {
    max: u32,
    window: Duration,
    recent: HashMap<String, VecDeque<Instant>>,
    halted: BTreeMap<String, InstanceError>,
}

impl RoleFailures {
    fn from_spec(spec: &ClusterSpec, config: &MasterConfig) -> Result<Self> {
        let max = spec.get_option_u64(OPTION_MAX_ROLE_FAILURES, config.max_role_failures as u64)?;
        let window = spec.get_option_u64(OPTION_FAILURE_WINDOW, config.failure_window_ms)?;
        Ok(Self {
            max: u32::try_from(max).unwrap_or(u32::MAX),
            window: Duration::from_millis(window),
            recent: HashMap::new(),
            halted: BTreeMap::new(),
        })
    }

    fn is_halted(&self, role: &str) -> bool {
        self.halted.contains_key(role)
    }

    /// Returns the halt reason when this failure crosses the threshold
    fn record(&mut self, role: &str, error: &ConvoyError) -> Option<&InstanceError> {
        if self.max == 0 || self.is_halted(role) {
            return None;
        }
        let now = Instant::now();
        let recent = self.recent.entry(role.to_string()).or_default();
        while recent.front().map_or(false, |t| now.duration_since(*t) > self.window) {
            recent.pop_front();
        }
        recent.push_back(now);
        if (recent.len() as u32) < self.max {
            return None;
        }
        let reason = InstanceError {
            kind: error.kind(),
            message: format!(
                "role '{}' failed {} times within {:?}, last: {}",
                role,
                recent.len(),
                self.window,
                error
            ),
        };
        Some(self.halted.entry(role.to_string()).or_insert(reason))
    }

    /// Clear the history of a role; true if it was halted
    fn reset(&mut self, role: &str) -> bool {
        self.recent.remove(role);
        self.halted.remove(role).is_some()
    }
}

fn fail(inst: &mut RoleInstance, error: &ConvoyError) {
    inst.state = InstanceState::Failed;
    inst.health = InstanceHealth::Unknown;
    inst.error = Some(InstanceError {
        kind: error.kind(),
        message: error.to_string(),
    });
}

/// Stop a live instance; returns the slot to hand back
fn teardown(inst: &mut RoleInstance) -> Option<Slot> {
    if inst.state.is_terminal() {
        return None;
    }
    if let Some(process) = inst.process.take() {
        process.kill();
    }
    inst.state = InstanceState::Stopped;
    inst.health = InstanceHealth::Unknown;
    inst.slot.clone()
}

fn release_slot(resources: Arc<dyn ResourceManager>, slot: Slot) {
    tokio::spawn(async move {
        if let Err(e) = resources.release(&slot).await {
            warn!(slot = %slot.id, error = %e, "Slot release failed");
        }
    });
}

fn watch_process(instance: Uuid, handle: ProcessHandle, evt_tx: mpsc::Sender<EngineEvent>) {
    tokio::spawn(async move {
        if let ProcessState::Running { pid, .. } = handle.started().await {
            let _ = evt_tx.send(EngineEvent::ProcessStarted { instance, pid }).await;
        }
        let status = handle.on_exit().await;
        let _ = evt_tx.send(EngineEvent::ProcessExited { instance, status }).await;
    });
}
