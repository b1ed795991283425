//! Shared fixtures: a fake `accumulo` launch script and specs pointing at it

#![allow(dead_code)]

use convoy::coordination::MemoryCoordination;
use convoy::provider::ProviderDeps;
use convoy::{ClusterStatus, EngineHandle, MasterConfig};
use convoy::spec::{ClusterSpec, RoleSpec};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Records every invocation, creates the instance marker on `init` and
/// otherwise stays up like a daemon. `tserver` exits early when
/// WORKER_FAILS is set.
const FAKE_ACCUMULO: &str = r#"#!/bin/sh
echo "$*" >> "$CALLS_FILE"
case "$1" in
  init)
    mkdir -p "$DATA_DIR/instance_id/test-instance"
    exit "${INIT_EXIT:-0}"
    ;;
  tserver)
    if [ -n "$WORKER_FAILS" ]; then
      exit 3
    fi
    ;;
esac
exec sleep 30
"#;

pub const WAIT: Duration = Duration::from_secs(15);

pub fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub struct Fixture {
    pub dir: TempDir,
    pub app_home: PathBuf,
    pub data_dir: PathBuf,
    pub calls: PathBuf,
    pub coordination: MemoryCoordination,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let app_home = dir.path().join("accumulo");
        let data_dir = dir.path().join("data");
        let calls = dir.path().join("calls.txt");
        write_script(&app_home.join("bin").join("accumulo"), FAKE_ACCUMULO);
        std::fs::create_dir_all(&data_dir).unwrap();
        Self {
            dir,
            app_home,
            data_dir,
            calls,
            coordination: MemoryCoordination::new("zk1:2181"),
        }
    }

    /// One master and two workers
    pub fn spec(&self, name: &str) -> ClusterSpec {
        ClusterSpec::new(name, "accumulo")
            .with_role("master", RoleSpec::new(1))
            .with_role("worker", RoleSpec::new(2))
            .with_option("zkHome", "/opt/zookeeper")
            .with_option("zkHosts", "zk1:2181")
            .with_option("accumuloPassword", "secret")
            .with_option("appHome", self.app_home.display().to_string())
            .with_option("containerStartupDelay", "20")
            .with_option("env.CALLS_FILE", self.calls.display().to_string())
            .with_option("env.DATA_DIR", self.data_dir.display().to_string())
            .with_data_path(format!("file://{}", self.data_dir.display()))
    }

    pub fn config(&self) -> MasterConfig {
        MasterConfig {
            work_dir: self.dir.path().join("work"),
            ..MasterConfig::development()
        }
    }

    pub fn deps(&self) -> ProviderDeps {
        ProviderDeps {
            coordination: self.coordination.factory(),
        }
    }

    /// Pretend `accumulo init` already ran
    pub fn mark_initialized(&self) {
        std::fs::create_dir_all(self.data_dir.join("instance_id").join("test-instance")).unwrap();
    }

    pub fn is_initialized(&self) -> bool {
        self.data_dir.join("instance_id").exists()
    }

    /// Lines written by the fake script, one per invocation
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.calls)
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn calls_starting_with(&self, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.split_whitespace().next() == Some(subcommand))
            .count()
    }
}

/// Wait for a status snapshot matching `predicate`, failing the test after [`WAIT`]
pub async fn wait_until<F>(handle: &EngineHandle, what: &str, predicate: F) -> Arc<ClusterStatus>
where
    F: Fn(&ClusterStatus) -> bool,
{
    match tokio::time::timeout(WAIT, handle.wait_for(predicate)).await {
        Ok(status) => status,
        Err(_) => panic!("timed out waiting for {}; last status:\n{}", what, handle.status().to_json()),
    }
}

/// Poll `check` until it holds, failing the test after [`WAIT`]
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
