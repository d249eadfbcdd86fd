//! Stories about bringing project environments up and down

use chrono::Utc;

use canopy::cluster::fake::FakeOp;
use canopy::cluster::{ApiError, ResourceKind};
use canopy::graph::StartupOrder;
use canopy::model::{ContainerStatus, EnvironmentStatus};
use canopy::naming::ResourceNamer;
use canopy::reconciler::ContainerOutcome;
use canopy::storage::archive_key;
use canopy::Error;

use super::fixtures::Env;

// =============================================================================
// Start
// =============================================================================

/// Story: a three-container project comes up in dependency order with every
/// container running
#[tokio::test]
async fn story_start_brings_every_container_up() {
    let env = Env::new();
    let p = env.web_app("shop", Utc::now());

    let report = env.environments.start(p.id).await.unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.status, EnvironmentStatus::Active);
    assert_eq!(report.ready.len(), 3);

    let names: Vec<String> = report
        .plan
        .containers
        .iter()
        .map(|c| c.container_name.clone())
        .collect();
    assert_eq!(names, vec!["db", "api", "frontend"]);
    assert!(matches!(report.order, StartupOrder::Ordered(_)));

    assert!(env.cluster.exists(&env.volume(&p)));
    for c in env.containers(p.id).await {
        assert_eq!(c.status, ContainerStatus::Running, "{}", c.name);
        assert!(c.last_started_at.is_some());
    }
}

/// Story: starting an already-running project changes nothing in the cluster
#[tokio::test]
async fn story_repeated_start_is_idempotent() {
    let env = Env::new();
    let p = env.web_app("shop", Utc::now());

    env.environments.start(p.id).await.unwrap();
    let creates_after_first = env.cluster.calls(FakeOp::Create);
    let second = env.environments.start(p.id).await.unwrap();

    assert!(second.is_success());
    assert_eq!(env.cluster.calls(FakeOp::Create), creates_after_first);
    assert_eq!(env.cluster.create_count(&env.workload(&p, "api")), 1);
    assert_eq!(env.cluster.objects(ResourceKind::Deployment).len(), 3);
    assert_eq!(env.cluster.objects(ResourceKind::Namespace).len(), 1);
}

/// Story: a short control-plane hiccup is absorbed by retries
#[tokio::test]
async fn story_transient_failures_are_retried() {
    let env = Env::new();
    let p = env.web_app("shop", Utc::now());
    env.cluster
        .fail_times(FakeOp::Create, ApiError::Transient("etcd leader changed".into()), 2);

    let report = env.environments.start(p.id).await.unwrap();

    assert!(report.is_success(), "{}", report.summary());
}

/// Story: one container hitting a quota does not stop its siblings
#[tokio::test]
async fn story_failed_container_is_isolated() {
    let env = Env::new();
    let p = env.web_app("shop", Utc::now());
    let api = ResourceNamer::names(p.id, "api").workload;
    env.cluster.fail_always(
        FakeOp::Create,
        api,
        ApiError::Fatal("exceeded quota: compute-resources".into()),
    );

    let report = env.environments.start(p.id).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.ready.len(), 2);
    let problems = report.problems();
    assert_eq!(problems.len(), 1);
    assert_eq!(problems[0].0, "api");
    assert!(matches!(problems[0].1, ContainerOutcome::Failed(ref m) if m.contains("quota")));

    for c in env.containers(p.id).await {
        let expected = if c.name == "api" {
            ContainerStatus::Error
        } else {
            ContainerStatus::Running
        };
        assert_eq!(c.status, expected, "{}", c.name);
    }
    assert_eq!(
        env.stored(p.id).await.environment_status,
        EnvironmentStatus::Active
    );
}

/// Story: the namespace itself failing leaves every container unapplied
#[tokio::test]
async fn story_shared_failure_skips_containers() {
    let env = Env::new();
    let p = env.web_app("shop", Utc::now());
    env.cluster.fail_always(
        FakeOp::Create,
        ResourceNamer::namespace(p.id),
        ApiError::Fatal("namespaces is forbidden".into()),
    );

    let report = env.environments.start(p.id).await.unwrap();

    assert!(!report.plan.shared_ok());
    assert!(report
        .plan
        .containers
        .iter()
        .all(|c| c.outcome == ContainerOutcome::Skipped));
    assert!(report.summary().contains("forbidden"));
    assert!(env.cluster.objects(ResourceKind::Deployment).is_empty());
}

/// Story: unknown projects are reported, not created
#[tokio::test]
async fn story_start_unknown_project() {
    let env = Env::new();
    let err = env.environments.start(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

// =============================================================================
// Teardown
// =============================================================================

/// Story: teardown removes every resource and, on request, the archive
#[tokio::test]
async fn story_teardown_removes_project_resources() {
    let env = Env::new();
    let p = env.web_app("shop", Utc::now());
    env.environments.start(p.id).await.unwrap();
    let key = archive_key(p.user_id, p.id);
    env.store.insert(&key, b"old".to_vec());

    env.environments.teardown(p.id, true).await.unwrap();

    assert!(env.cluster.objects(ResourceKind::Namespace).is_empty());
    assert!(env.cluster.objects(ResourceKind::Deployment).is_empty());
    assert!(env.store.object(&key).is_none());
    for c in env.containers(p.id).await {
        assert_eq!(c.status, ContainerStatus::Stopped);
    }
}

/// Story: tearing down a project that was never started succeeds
#[tokio::test]
async fn story_teardown_of_absent_namespace() {
    let env = Env::new();
    let p = env.web_app("shop", Utc::now());
    env.environments.teardown(p.id, false).await.unwrap();
}
