//! Execution context builder
//!
//! Turns (role, slot, cluster spec) into the environment, command line and
//! local resources a container launch consumes. Output is fully ordered so
//! identical inputs always produce identical contexts.

use crate::core::errors::{ConvoyError, Result};
use crate::exec::process::ProcessSpec;
use crate::spec::{ClusterSpec, Slot, OPTION_APP_ARGS, OPTION_JVM_HEAP};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Logical name of the staged application image
pub const IMAGE_RESOURCE_NAME: &str = "image";
/// Logical name of the staged configuration directory
pub const CONF_RESOURCE_NAME: &str = "propagatedconf";

/// How a local resource is materialised in the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    File,
    Directory,
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalResource {
    pub source: String,
    pub kind: ResourceKind,
}

/// Launch descriptor handed to the container launch mechanism
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub role: String,
    pub slot_id: String,
    pub working_dir: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub local_resources: BTreeMap<String, LocalResource>,
}

impl ExecutionContext {
    /// Command tokens joined for a shell, redirections included
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Link every local resource into `dir` under its logical name.
    /// Existing entries are left alone so restaging is a no-op.
    pub async fn stage_into(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ConvoyError::io(format!("create {}", dir.display()), e))?;
        for (name, resource) in &self.local_resources {
            let link = dir.join(name);
            if tokio::fs::symlink_metadata(&link).await.is_ok() {
                continue;
            }
            let source = Path::new(&resource.source);
            if !tokio::fs::try_exists(source).await.unwrap_or(false) {
                return Err(ConvoyError::configuration(format!(
                    "local resource '{}' not found at {}",
                    name,
                    source.display()
                )));
            }
            tokio::fs::symlink(source, &link)
                .await
                .map_err(|e| ConvoyError::io(format!("stage {} into {}", name, dir.display()), e))?;
            if resource.kind == ResourceKind::Archive {
                tracing::debug!(resource = %name, dir = %dir.display(), "Archive staged unexpanded");
            }
        }
        Ok(())
    }

    /// Process description that runs this context through `sh -c`; the
    /// shell execs the script so killing the child kills the script
    pub fn to_process_spec(&self) -> ProcessSpec {
        ProcessSpec::new(format!("{}-{}", self.role, self.slot_id), "sh")
            .arg("-c")
            .arg(format!("exec {}", self.command_line()))
            .envs(self.environment.clone())
            .working_dir(self.working_dir.clone())
    }
}

/// Per-role launch details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCommand {
    /// Sub-command passed to the launch script
    pub subcommand: String,
    /// Environment variable receiving the heap flag
    pub heap_env: Option<String>,
}

impl RoleCommand {
    pub fn new(subcommand: impl Into<String>) -> Self {
        Self {
            subcommand: subcommand.into(),
            heap_env: None,
        }
    }

    pub fn with_heap_env(mut self, var: impl Into<String>) -> Self {
        self.heap_env = Some(var.into());
        self
    }
}

/// Provider-known launch layout
#[derive(Debug, Clone, Default)]
pub struct LaunchTemplate {
    /// Launch script file name, found under `bin/`
    pub script: String,
    /// Option naming the host installation, used when no image is staged
    pub home_option: String,
    /// Lowest-precedence environment layer
    pub default_env: BTreeMap<String, String>,
    /// Mandatory option key -> environment variable
    pub mandatory_env: BTreeMap<String, String>,
    pub roles: BTreeMap<String, RoleCommand>,
    pub default_heap: Option<String>,
    /// Heap variable for roles without their own
    pub default_heap_env: Option<String>,
    pub log_dir_env: Option<String>,
    pub conf_dir_env: Option<String>,
}

impl LaunchTemplate {
    pub fn new(script: impl Into<String>, home_option: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            home_option: home_option.into(),
            ..Default::default()
        }
    }

    pub fn default_env(mut self, var: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_env.insert(var.into(), value.into());
        self
    }

    pub fn mandatory(mut self, option: impl Into<String>, var: impl Into<String>) -> Self {
        self.mandatory_env.insert(option.into(), var.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>, command: RoleCommand) -> Self {
        self.roles.insert(role.into(), command);
        self
    }

    pub fn heap(mut self, default_heap: impl Into<String>, default_env: impl Into<String>) -> Self {
        self.default_heap = Some(default_heap.into());
        self.default_heap_env = Some(default_env.into());
        self
    }

    pub fn log_dir_env(mut self, var: impl Into<String>) -> Self {
        self.log_dir_env = Some(var.into());
        self
    }

    pub fn conf_dir_env(mut self, var: impl Into<String>) -> Self {
        self.conf_dir_env = Some(var.into());
        self
    }

    /// Launch script path. Stays relative when the image is staged into the slot.
    pub fn script_path(&self, spec: &ClusterSpec) -> Result<String> {
        if spec.is_image_path_set() {
            Ok(format!("{}/bin/{}", IMAGE_RESOURCE_NAME, self.script))
        } else {
            let home = spec.get_mandatory_option(&self.home_option)?;
            Ok(format!("{}/bin/{}", home.trim_end_matches('/'), self.script))
        }
    }
}

/// Builds execution contexts from a provider's launch template
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    template: LaunchTemplate,
}

impl ContextBuilder {
    pub fn new(template: LaunchTemplate) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &LaunchTemplate {
        &self.template
    }

    pub fn build(&self, role: &str, slot: &Slot, spec: &ClusterSpec) -> Result<ExecutionContext> {
        let role_spec = spec.roles.get(role).ok_or_else(|| {
            ConvoyError::configuration(format!("role '{}' is not part of cluster '{}'", role, spec.name))
        })?;
        let command_spec = self.template.roles.get(role).ok_or_else(|| {
            ConvoyError::configuration(format!("no launch command known for role '{}'", role))
        })?;

        // Resolve every mandatory binding before producing anything
        let mut bindings = BTreeMap::new();
        for (option, var) in &self.template.mandatory_env {
            let value = spec.get_mandatory_option(option)?;
            bindings.insert(var.clone(), value.to_string());
        }
        let script = self.template.script_path(spec)?;

        let mut env = self.template.default_env.clone();
        env.extend(spec.global_env());
        env.extend(spec.role_env(role));
        env.extend(bindings);
        if let Some(var) = &self.template.log_dir_env {
            env.insert(var.clone(), slot.log_dir.display().to_string());
        }
        if let (Some(var), Some(_)) = (&self.template.conf_dir_env, &slot.conf_dir) {
            env.insert(var.clone(), slot.work_dir.join(CONF_RESOURCE_NAME).display().to_string());
        }

        let heap = role_spec
            .jvm_heap
            .as_deref()
            .or_else(|| role_spec.options.get(OPTION_JVM_HEAP).map(String::as_str))
            .or(self.template.default_heap.as_deref())
            .filter(|h| !h.trim().is_empty());
        let heap_env = command_spec
            .heap_env
            .as_ref()
            .or(self.template.default_heap_env.as_ref());
        if let (Some(heap), Some(var)) = (heap, heap_env) {
            env.insert(var.clone(), format!("-Xmx{}", heap));
        }

        let mut local_resources = BTreeMap::new();
        if let Some(conf_dir) = &slot.conf_dir {
            local_resources.insert(
                CONF_RESOURCE_NAME.to_string(),
                LocalResource {
                    source: conf_dir.display().to_string(),
                    kind: ResourceKind::Directory,
                },
            );
        }
        if let Some(image) = spec.image_path.as_deref().filter(|_| spec.is_image_path_set()) {
            tracing::debug!(image = %image, role = %role, "Staging application image");
            local_resources.insert(
                IMAGE_RESOURCE_NAME.to_string(),
                LocalResource {
                    source: image.to_string(),
                    kind: ResourceKind::Archive,
                },
            );
        }

        let mut command = vec![script, command_spec.subcommand.clone()];
        if let Some(args) = role_spec.options.get(OPTION_APP_ARGS) {
            command.extend(args.split_whitespace().map(String::from));
        }
        command.push(format!("1>{}/out.txt", slot.log_dir.display()));
        command.push(format!("2>{}/err.txt", slot.log_dir.display()));

        Ok(ExecutionContext {
            role: role.to_string(),
            slot_id: slot.id.clone(),
            working_dir: slot.work_dir.clone(),
            environment: env,
            command,
            local_resources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::RoleSpec;
    use pretty_assertions::assert_eq;

    fn template() -> LaunchTemplate {
        LaunchTemplate::new("app", "appHome")
            .default_env("MODE", "default")
            .default_env("KEEP", "provider")
            .mandatory("zkHome", "ZOOKEEPER_HOME")
            .role("tablet", RoleCommand::new("tablet-server").with_heap_env("TABLET_OPTS"))
            .role("gc", RoleCommand::new("gc"))
            .heap("128m", "OTHER_OPTS")
            .log_dir_env("APP_LOG_DIR")
            .conf_dir_env("APP_CONF_DIR")
    }

    fn slot() -> Slot {
        Slot {
            id: "slot-1".into(),
            host: "localhost".into(),
            work_dir: PathBuf::from("/work/slot-1"),
            log_dir: PathBuf::from("/logs/slot-1"),
            conf_dir: Some(PathBuf::from("/conf/generated")),
        }
    }

    fn spec() -> ClusterSpec {
        ClusterSpec::new("c1", "test")
            .with_role(
                "tablet",
                RoleSpec::new(2)
                    .with_heap("512m")
                    .with_option("env.MODE", "role")
                    .with_option("appArgs", "--port 9997"),
            )
            .with_role("gc", RoleSpec::new(1))
            .with_option("env.MODE", "global")
            .with_option("env.GLOBAL_ONLY", "yes")
            .with_option("zkHome", "/zk")
            .with_option("appHome", "/opt/app/")
    }

    #[test]
    fn test_command_and_env() {
        let ctx = ContextBuilder::new(template()).build("tablet", &slot(), &spec()).unwrap();
        assert_eq!(
            ctx.command,
            vec![
                "/opt/app/bin/app",
                "tablet-server",
                "--port",
                "9997",
                "1>/logs/slot-1/out.txt",
                "2>/logs/slot-1/err.txt",
            ]
        );
        assert_eq!(ctx.environment["MODE"], "role");
        assert_eq!(ctx.environment["GLOBAL_ONLY"], "yes");
        assert_eq!(ctx.environment["KEEP"], "provider");
        assert_eq!(ctx.environment["ZOOKEEPER_HOME"], "/zk");
        assert_eq!(ctx.environment["TABLET_OPTS"], "-Xmx512m");
        assert_eq!(ctx.environment["APP_LOG_DIR"], "/logs/slot-1");
        assert_eq!(ctx.environment["APP_CONF_DIR"], "/work/slot-1/propagatedconf");
        assert!(ctx.local_resources.contains_key(CONF_RESOURCE_NAME));
        assert!(!ctx.local_resources.contains_key(IMAGE_RESOURCE_NAME));
    }

    #[test]
    fn test_default_heap_goes_to_fallback_var() {
        let ctx = ContextBuilder::new(template()).build("gc", &slot(), &spec()).unwrap();
        assert_eq!(ctx.environment["OTHER_OPTS"], "-Xmx128m");
    }

    #[test]
    fn test_missing_mandatory_option_fails_fast() {
        let mut spec = spec();
        spec.options.remove("zkHome");
        let err = ContextBuilder::new(template()).build("tablet", &slot(), &spec).unwrap_err();
        assert_eq!(err.missing_key(), Some("zkHome"));
    }

    #[test]
    fn test_image_makes_script_relative() {
        let mut spec = spec().with_image_path("/dist/app.tar.gz");
        spec.options.remove("appHome");
        let ctx = ContextBuilder::new(template()).build("tablet", &slot(), &spec).unwrap();
        assert_eq!(ctx.command[0], "image/bin/app");
        assert_eq!(
            ctx.local_resources[IMAGE_RESOURCE_NAME],
            LocalResource {
                source: "/dist/app.tar.gz".into(),
                kind: ResourceKind::Archive,
            }
        );
    }

    #[test]
    fn test_unknown_role_rejected() {
        let spec = spec().with_role("ghost", RoleSpec::new(1));
        let err = ContextBuilder::new(template()).build("ghost", &slot(), &spec).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = ContextBuilder::new(template());
        let a = builder.build("tablet", &slot(), &spec()).unwrap().to_json().unwrap();
        let b = builder.build("tablet", &slot(), &spec()).unwrap().to_json().unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
