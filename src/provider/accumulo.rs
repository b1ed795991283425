//! Accumulo provider
//!
//! Accumulo needs its data directory initialized exactly once before the
//! master can start. Initialization only makes sense while ZooKeeper is up,
//! so the lifecycle action checks coordination liveness first, then the
//! `instance_id` marker under the data path, and only then runs
//! `accumulo init` followed by a delayed review notification.

use super::{ActionContext, ActionOutcome, LifecycleAction, Probe, Provider, ProviderRole};
use crate::coordination::{read_published_text, CoordinationClient, CoordinationFactory};
use crate::core::errors::{ConvoyError, Result};
use crate::exec::{
    ContextBuilder, ExecutionContext, LaunchTemplate, ProcessSpec, RoleCommand, Step, SupervisionPolicy,
};
use crate::spec::{ClusterSpec, Slot, OPTION_CONTAINER_STARTUP_DELAY};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ROLE_MASTER: &str = "master";
pub const ROLE_TABLET: &str = "worker";
pub const ROLE_MONITOR: &str = "monitor";
pub const ROLE_GARBAGE_COLLECTOR: &str = "garbage-collector";

pub const OPTION_ZK_HOME: &str = "zkHome";
pub const OPTION_ZK_HOSTS: &str = "zkHosts";
pub const OPTION_ACCUMULO_PASSWORD: &str = "accumuloPassword";
pub const OPTION_APP_HOME: &str = "appHome";
pub const OPTION_HADOOP_HOME: &str = "hadoopHome";
/// Deadline for `accumulo init` (ms)
pub const OPTION_ACCUMULO_INIT_TIMEOUT: &str = "accumuloInitTimeout";
/// Bounded wait for the ZooKeeper liveness check (ms)
pub const OPTION_COORDINATION_TIMEOUT: &str = "coordinationTimeout";

pub const MASTER_ADDRESS: &str = "master.address";
pub const MONITOR_ADDRESS: &str = "monitor.address";

/// Marker written by `accumulo init` under the data path
pub const INSTANCE_ID_MARKER: &str = "instance_id";

const INIT_TIMEOUT_DEFAULT_MS: u64 = 240_000;
const DEFAULT_JVM_HEAP: &str = "256M";
const MASTER_LABEL: &str = "Active Accumulo Master (RPC): ";
const MONITOR_LABEL: &str = "Active Accumulo Monitor: ";
const NOT_AVAILABLE: &str = "N/A";

/// Cached coordination access and last-known published addresses
#[derive(Default)]
struct AccumuloState {
    client: Option<(String, Arc<dyn CoordinationClient>)>,
    master_address: String,
    monitor_address: String,
}

pub struct AccumuloProvider {
    roles: Vec<ProviderRole>,
    builder: ContextBuilder,
    coordination: CoordinationFactory,
    state: Mutex<AccumuloState>,
}

impl AccumuloProvider {
    pub fn new(coordination: CoordinationFactory) -> Self {
        Self {
            roles: vec![
                ProviderRole::new(ROLE_MASTER, 1),
                ProviderRole::new(ROLE_TABLET, 0),
                ProviderRole::new(ROLE_MONITOR, 0),
                ProviderRole::new(ROLE_GARBAGE_COLLECTOR, 0),
            ],
            builder: ContextBuilder::new(launch_template()),
            coordination,
            state: Mutex::new(AccumuloState::default()),
        }
    }

    /// Reuse the cached client while the quorum string is unchanged
    fn client_for(&self, quorum: &str) -> Result<Arc<dyn CoordinationClient>> {
        let mut state = self.state.lock();
        if let Some((cached, client)) = &state.client {
            if cached == quorum {
                return Ok(client.clone());
            }
        }
        let client = (self.coordination)(quorum)?;
        state.client = Some((quorum.to_string(), client.clone()));
        Ok(client)
    }

    /// `accumulo init` in its own directory, with the image staged there
    /// exactly as it would be in a role slot
    async fn init_process(&self, spec: &ClusterSpec, env: &ActionContext, password: &str) -> Result<ProcessSpec> {
        let dir = env.work_dir.join(&spec.name).join("init");
        let slot = Slot {
            id: "init".to_string(),
            host: "localhost".to_string(),
            work_dir: dir.clone(),
            log_dir: dir.join("logs"),
            conf_dir: None,
        };
        let ctx = self.build_context(ROLE_MASTER, &slot, spec)?;
        let script = ctx
            .command
            .first()
            .map(PathBuf::from)
            .ok_or_else(|| ConvoyError::internal("launch context has no script"))?;
        let program = if script.is_relative() { slot.work_dir.join(script) } else { script };

        tokio::fs::create_dir_all(&slot.log_dir)
            .await
            .map_err(|e| ConvoyError::io(format!("create {}", slot.log_dir.display()), e))?;
        ctx.stage_into(&slot.work_dir).await?;

        Ok(ProcessSpec::new("accumulo-init", program.display().to_string())
            .args([
                "init".to_string(),
                "--instance-name".to_string(),
                format!("{}-{}", env.user, spec.name),
                "--password".to_string(),
                password.to_string(),
                "--clear-instance-name".to_string(),
            ])
            .envs(ctx.environment)
            .working_dir(slot.work_dir.clone())
            .stdout(slot.log_dir.join("out.txt"))
            .stderr(slot.log_dir.join("err.txt")))
    }

    async fn refresh_published(&self, spec: &ClusterSpec) -> Option<(Option<String>, Option<String>)> {
        let quorum = spec.get_option(OPTION_ZK_HOSTS)?;
        let marker = marker_path(spec).ok()?;
        let instance_id = match instance_id(&marker).await {
            Ok(id) => id,
            Err(e) => {
                debug!(cluster = %spec.name, error = %e, "Accumulo instance id not available yet");
                return None;
            }
        };
        let client = match self.client_for(quorum) {
            Ok(client) => client,
            Err(e) => {
                warn!(cluster = %spec.name, error = %e, "Cannot create coordination client");
                return None;
            }
        };

        let root = format!("/accumulo/{}", instance_id);
        let lock_path = format!("{}/masters/lock", root);
        let master = match client.list_children(&lock_path).await {
            Ok(Some(mut children)) if !children.is_empty() => {
                children.sort();
                read_published_text(client.as_ref(), &format!("{}/{}", lock_path, children[0])).await
            }
            Ok(_) => None,
            Err(e) => {
                debug!(path = %lock_path, error = %e, "Master lock not readable");
                None
            }
        };
        let monitor = read_published_text(client.as_ref(), &format!("{}/monitor/http_addr", root)).await;
        Some((master, monitor))
    }
}

fn launch_template() -> LaunchTemplate {
    LaunchTemplate::new("accumulo", OPTION_APP_HOME)
        .mandatory(OPTION_ZK_HOME, "ZOOKEEPER_HOME")
        .role(ROLE_MASTER, RoleCommand::new("master").with_heap_env("ACCUMULO_MASTER_OPTS"))
        .role(ROLE_TABLET, RoleCommand::new("tserver").with_heap_env("ACCUMULO_TSERVER_OPTS"))
        .role(ROLE_MONITOR, RoleCommand::new("monitor").with_heap_env("ACCUMULO_MONITOR_OPTS"))
        .role(ROLE_GARBAGE_COLLECTOR, RoleCommand::new("gc").with_heap_env("ACCUMULO_GC_OPTS"))
        .heap(DEFAULT_JVM_HEAP, "ACCUMULO_OTHER_OPTS")
        .log_dir_env("ACCUMULO_LOG_DIR")
        .conf_dir_env("ACCUMULO_CONF_DIR")
}

/// Local path of the initialization marker
pub fn marker_path(spec: &ClusterSpec) -> Result<PathBuf> {
    let data_path = spec
        .data_path
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ConvoyError::missing_option("dataPath"))?;
    let local = data_path.strip_prefix("file://").unwrap_or(data_path);
    Ok(Path::new(local).join(INSTANCE_ID_MARKER))
}

/// The marker directory holds exactly one entry named after the instance id
async fn instance_id(marker: &Path) -> Result<String> {
    let mut entries = tokio::fs::read_dir(marker)
        .await
        .map_err(|e| ConvoyError::io(format!("list {}", marker.display()), e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ConvoyError::io(format!("list {}", marker.display()), e))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    match names.len() {
        1 => Ok(names.remove(0)),
        n => Err(ConvoyError::BadClusterState(format!(
            "expected exactly one instance id under {}, found {}",
            marker.display(),
            n
        ))),
    }
}

fn monitor_url(address: &str) -> Option<String> {
    let (host, port) = address.trim().rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("http://{}:{}", host, port))
}

#[async_trait]
impl Provider for AccumuloProvider {
    fn name(&self) -> &str {
        "accumulo"
    }

    fn roles(&self) -> &[ProviderRole] {
        &self.roles
    }

    fn validate(&self, spec: &ClusterSpec) -> Result<()> {
        spec.validate()?;
        self.validate_roles(spec)?;
        for key in [OPTION_ZK_HOME, OPTION_ZK_HOSTS, OPTION_ACCUMULO_PASSWORD] {
            spec.get_mandatory_option(key)?;
        }
        if !spec.is_image_path_set() {
            spec.get_mandatory_option(OPTION_APP_HOME).map_err(|_| ConvoyError::Configuration {
                message: format!("either an image path or option '{}' must be set", OPTION_APP_HOME),
                key: Some(OPTION_APP_HOME.to_string()),
            })?;
        }
        marker_path(spec)?;
        spec.get_option_u64(OPTION_ACCUMULO_INIT_TIMEOUT, INIT_TIMEOUT_DEFAULT_MS)?;
        spec.get_option_u64(OPTION_COORDINATION_TIMEOUT, 0)?;
        spec.get_option_u64(OPTION_CONTAINER_STARTUP_DELAY, 0)?;
        Ok(())
    }

    fn build_context(&self, role: &str, slot: &Slot, spec: &ClusterSpec) -> Result<ExecutionContext> {
        let mut ctx = self.builder.build(role, slot, spec)?;
        if let Some(hadoop_home) = spec.get_option(OPTION_HADOOP_HOME) {
            ctx.environment.insert("HADOOP_HOME".to_string(), hadoop_home.to_string());
            ctx.environment.insert("HADOOP_PREFIX".to_string(), hadoop_home.to_string());
        }
        Ok(ctx)
    }

    async fn run_lifecycle_action(
        &self,
        action: LifecycleAction,
        spec: &ClusterSpec,
        env: &ActionContext,
    ) -> Result<ActionOutcome> {
        let LifecycleAction::Initialize = action;

        // Everything the init command needs is resolved before touching ZooKeeper
        let password = spec.get_mandatory_option(OPTION_ACCUMULO_PASSWORD)?.to_string();
        let quorum = spec.get_mandatory_option(OPTION_ZK_HOSTS)?;
        let marker = marker_path(spec)?;
        let init_timeout = spec.get_option_u64(OPTION_ACCUMULO_INIT_TIMEOUT, INIT_TIMEOUT_DEFAULT_MS)?;
        let startup_delay = spec.get_option_u64(
            OPTION_CONTAINER_STARTUP_DELAY,
            env.container_startup_delay.as_millis() as u64,
        )?;
        let coordination_timeout = spec.get_option_u64(
            OPTION_COORDINATION_TIMEOUT,
            env.coordination_timeout.as_millis() as u64,
        )?;

        let client = self.client_for(quorum)?;
        client
            .verify_live(Duration::from_millis(coordination_timeout))
            .await?;
        info!(cluster = %spec.name, quorum = %quorum, "ZooKeeper is live");

        let initialized = tokio::fs::try_exists(&marker)
            .await
            .map_err(|e| ConvoyError::io(format!("check {}", marker.display()), e))?;
        if initialized {
            info!(cluster = %spec.name, marker = %marker.display(), "Accumulo already initialized");
            return Ok(ActionOutcome::NothingToDo);
        }

        info!(cluster = %spec.name, data_path = ?spec.data_path, "Initializing Accumulo datastore");
        let process = self.init_process(spec, env, &password).await?;
        let steps = vec![
            Step::process(
                "accumulo-init",
                process,
                SupervisionPolicy::once().with_deadline(Duration::from_millis(init_timeout)),
            ),
            Step::notify(
                "review",
                Duration::from_millis(startup_delay),
                env.review_tx.clone(),
            ),
        ];
        let handle = env
            .sequencer
            .sequence(format!("{}-{}", spec.name, action), steps);
        Ok(ActionOutcome::Started(handle))
    }

    async fn build_status(&self, spec: &ClusterSpec) -> BTreeMap<String, String> {
        let refreshed = self.refresh_published(spec).await;

        let mut state = self.state.lock();
        if let Some((master, monitor)) = refreshed {
            if let Some(master) = master {
                state.master_address = master;
            }
            if let Some(monitor) = monitor {
                state.monitor_address = monitor;
            }
        }
        BTreeMap::from([
            (MASTER_ADDRESS.to_string(), state.master_address.clone()),
            (MONITOR_ADDRESS.to_string(), state.monitor_address.clone()),
        ])
    }

    fn create_probes(&self, _role: &str, _spec: &ClusterSpec) -> Vec<Arc<dyn Probe>> {
        Vec::new()
    }

    fn build_monitor_details(&self, status: &BTreeMap<String, String>) -> BTreeMap<String, Option<String>> {
        let known = |key: &str| {
            status
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let mut details = BTreeMap::new();
        let master = known(MASTER_ADDRESS).unwrap_or_else(|| NOT_AVAILABLE.to_string());
        details.insert(format!("{}{}", MASTER_LABEL, master), None);

        match known(MONITOR_ADDRESS).as_deref().map(|addr| (addr, monitor_url(addr))) {
            Some((_, Some(url))) => {
                details.insert(MONITOR_LABEL.to_string(), Some(url));
            }
            Some((addr, None)) => {
                debug!(address = %addr, "Unparsable Accumulo monitor address");
                details.insert(format!("{}{}", MONITOR_LABEL, NOT_AVAILABLE), None);
            }
            None => {
                details.insert(format!("{}{}", MONITOR_LABEL, NOT_AVAILABLE), None);
            }
        }
        details
    }
}
