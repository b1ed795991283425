//! Reconciliation engine driving the fake Accumulo script end to end

mod common;

use common::{eventually, wait_until, Fixture};
use convoy::engine::{ClusterPhase, EngineHandle, LocalResourceManager, ReconciliationEngine};
use convoy::exec::LifecycleSequencer;
use convoy::provider::ProviderKind;
use convoy::spec::{ClusterSpec, InstanceState, RoleSpec};
use convoy::ErrorKind;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Running {
    handle: EngineHandle,
    resources: Arc<LocalResourceManager>,
    sequencer: LifecycleSequencer,
}

fn start(fixture: &Fixture, spec: ClusterSpec) -> Running {
    let config = fixture.config();
    let resources = Arc::new(LocalResourceManager::from_config(&config));
    let sequencer = LifecycleSequencer::new();
    let provider = ProviderKind::Accumulo.create(&fixture.deps());
    let engine = ReconciliationEngine::new(spec, provider, resources.clone(), config)
        .unwrap()
        .with_sequencer(sequencer.clone());
    Running {
        handle: engine.start(),
        resources,
        sequencer,
    }
}

async fn fully_running(run: &Running) {
    wait_until(&run.handle, "one master and two workers", |s| {
        s.running("master") == 1 && s.running("worker") == 2
    })
    .await;
}

#[tokio::test]
async fn test_invalid_spec_allocates_nothing() {
    let fixture = Fixture::new();
    let config = fixture.config();
    let resources = Arc::new(LocalResourceManager::from_config(&config));
    let provider = ProviderKind::Accumulo.create(&fixture.deps());

    let unknown_role = fixture.spec("c1").with_role("tablet", RoleSpec::new(1));
    let err = ReconciliationEngine::new(unknown_role, provider.clone(), resources.clone(), config.clone())
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let no_master = fixture.spec("c1").with_role("master", RoleSpec::new(0));
    assert!(ReconciliationEngine::new(no_master, provider.clone(), resources.clone(), config.clone()).is_err());

    let mut no_zk = fixture.spec("c1");
    no_zk.options.remove("zkHosts");
    let err = ReconciliationEngine::new(no_zk, provider, resources.clone(), config)
        .err()
        .unwrap();
    assert_eq!(err.missing_key(), Some("zkHosts"));

    assert_eq!(resources.allocations(), 0);
}

#[tokio::test]
async fn test_initialized_cluster_reaches_desired_counts() {
    let fixture = Fixture::new();
    fixture.mark_initialized();
    let run = start(&fixture, fixture.spec("c1"));

    fully_running(&run).await;
    let status = run.handle.status();
    assert_eq!(status.phase, ClusterPhase::Active);
    assert_eq!(status.roles["worker"].desired, 2);
    assert!(status.instances.iter().all(|i| i.error.is_none()));
    assert_eq!(run.resources.in_use(), 3);
    assert_eq!(run.sequencer.launched_processes(), 0);

    eventually("role processes to start", || {
        fixture.calls_starting_with("master") == 1 && fixture.calls_starting_with("tserver") == 2
    })
    .await;
    assert_eq!(fixture.calls_starting_with("init"), 0);
}

#[tokio::test]
async fn test_flex_releases_newest_surplus() {
    let fixture = Fixture::new();
    fixture.mark_initialized();
    let run = start(&fixture, fixture.spec("c1"));
    fully_running(&run).await;

    let before = run.handle.status();
    let newest = before
        .instances
        .iter()
        .filter(|i| i.role == "worker")
        .max_by_key(|i| i.requested_at)
        .map(|i| i.id)
        .unwrap();

    run.handle.flex(BTreeMap::from([("worker".to_string(), 1)])).await.unwrap();
    let status = wait_until(&run.handle, "worker count to drop", |s| s.running("worker") == 1).await;
    let stopped: Vec<_> = status.instances_in(InstanceState::Stopped).collect();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].id, newest);
    assert_eq!(status.running("master"), 1);
    eventually("surplus slot release", || run.resources.in_use() == 2).await;

    run.handle.flex(BTreeMap::from([("worker".to_string(), 3)])).await.unwrap();
    wait_until(&run.handle, "worker count to grow", |s| s.running("worker") == 3).await;

    let err = run
        .handle
        .flex(BTreeMap::from([("master".to_string(), 0)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(run.handle.status().roles["master"].desired, 1);
}

#[tokio::test]
async fn test_stop_tears_everything_down() {
    let fixture = Fixture::new();
    fixture.mark_initialized();
    let run = start(&fixture, fixture.spec("c1"));
    fully_running(&run).await;

    run.handle.stop().await.unwrap();
    let status = wait_until(&run.handle, "stopped phase", |s| s.phase == ClusterPhase::Stopped).await;
    assert!(status.instances.iter().all(|i| i.state == InstanceState::Stopped));
    eventually("all slots released", || run.resources.in_use() == 0).await;

    let err = run
        .handle
        .flex(BTreeMap::from([("worker".to_string(), 4)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadClusterState);
}

#[tokio::test]
async fn test_initialization_precedes_role_launch() {
    let fixture = Fixture::new();
    let run = start(&fixture, fixture.spec("c1"));

    fully_running(&run).await;
    assert!(fixture.is_initialized());
    assert_eq!(run.sequencer.launched_processes(), 1);

    eventually("role processes to start", || fixture.calls().len() == 4).await;
    let calls = fixture.calls();
    assert!(calls[0].starts_with("init "), "calls: {:?}", calls);
    assert_eq!(fixture.calls_starting_with("init"), 1);
}

#[tokio::test]
async fn test_coordination_outage_fails_then_retry_recovers() {
    let fixture = Fixture::new();
    fixture.coordination.set_reachable(false);
    let run = start(&fixture, fixture.spec("c1"));

    let status = wait_until(&run.handle, "failed phase", |s| s.phase == ClusterPhase::Failed).await;
    let error = status.lifecycle_error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::CoordinationUnavailable);
    assert!(status.instances.is_empty());
    assert_eq!(run.resources.allocations(), 0);
    assert_eq!(run.sequencer.launched_processes(), 0);

    fixture.coordination.set_reachable(true);
    run.handle.retry_lifecycle().await.unwrap();
    fully_running(&run).await;
    assert!(run.handle.status().lifecycle_error.is_none());
    assert_eq!(run.sequencer.launched_processes(), 1);

    let err = run.handle.retry_lifecycle().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadClusterState);
}

#[tokio::test]
async fn test_failing_worker_does_not_disturb_master() {
    let fixture = Fixture::new();
    fixture.mark_initialized();
    let spec = fixture
        .spec("c1")
        .with_role("worker", RoleSpec::new(1).with_option("env.WORKER_FAILS", "1"))
        .with_option("maxProcessFailures", "1");
    let run = start(&fixture, spec);

    let status = wait_until(&run.handle, "a failed worker next to a running master", |s| {
        s.running("master") == 1 && s.roles.get("worker").map_or(false, |w| w.failed > 0)
    })
    .await;

    let failed = status
        .instances_in(InstanceState::Failed)
        .find(|i| i.role == "worker")
        .unwrap();
    assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::ProcessFailure);
    assert_eq!(status.phase, ClusterPhase::Active);

    let master = status
        .instances
        .iter()
        .find(|i| i.role == "master")
        .unwrap();
    assert_eq!(master.state, InstanceState::Running);
    assert!(master.error.is_none());
}

#[tokio::test]
async fn test_configuration_error_fails_cluster_without_retrying() {
    let fixture = Fixture::new();
    fixture.mark_initialized();
    let mut spec = fixture.spec("c1").with_image_path("/nonexistent/accumulo.tar.gz");
    spec.options.remove("appHome");
    let run = start(&fixture, spec);

    let status = wait_until(&run.handle, "failed phase", |s| s.phase == ClusterPhase::Failed).await;
    assert_eq!(status.lifecycle_error.as_ref().unwrap().kind, ErrorKind::Configuration);
    eventually("slots released", || run.resources.in_use() == 0).await;

    // Several review intervals later nothing new has been requested
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(run.resources.allocations(), 3);
    assert_eq!(run.handle.status().phase, ClusterPhase::Failed);
    assert!(fixture.calls().is_empty());
}

#[tokio::test]
async fn test_crash_looping_role_is_halted_until_flexed() {
    let fixture = Fixture::new();
    fixture.mark_initialized();
    let spec = fixture
        .spec("c1")
        .with_role("worker", RoleSpec::new(1).with_option("env.WORKER_FAILS", "1"))
        .with_option("maxProcessFailures", "1")
        .with_option("maxRoleFailures", "3");
    let run = start(&fixture, spec);

    let status = wait_until(&run.handle, "worker role halted", |s| s.halted("worker").is_some()).await;
    assert_eq!(status.halted("worker").unwrap().kind, ErrorKind::ProcessFailure);
    assert_eq!(status.roles["worker"].failed, 3);
    assert_eq!(status.phase, ClusterPhase::Active);
    assert!(status.halted("master").is_none());

    let before = run.resources.allocations();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(run.resources.allocations(), before);
    assert_eq!(run.handle.status().running("master"), 1);

    run.handle.flex(BTreeMap::from([("worker".to_string(), 1)])).await.unwrap();
    eventually("replacement after flex", || run.resources.allocations() > before).await;
}
