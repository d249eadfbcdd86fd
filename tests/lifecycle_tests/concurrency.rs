//! Stories about transitions racing on the same project

use std::time::Duration;

use chrono::Utc;

use canopy::cluster::ResourceKind;
use canopy::config::LockPolicy;
use canopy::controller::HibernationOutcome;
use canopy::model::EnvironmentStatus;
use canopy::Error;

use super::fixtures::Env;

/// Wait until the fake has created the project's workloads
async fn until_workloads(env: &Env, count: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while env.cluster.objects(ResourceKind::Deployment).len() < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
}

// =============================================================================
// Reject policy
// =============================================================================

/// Story: a hibernate request during a start is refused with a busy signal
#[tokio::test]
async fn story_reject_policy_reports_busy() {
    let env = Env::with_policy(LockPolicy::Reject);
    let p = env.web_app("race", Utc::now());
    env.cluster.set_manual_ready(true);

    let start = {
        let environments = env.environments.clone();
        let id = p.id;
        tokio::spawn(async move { environments.start(id).await })
    };
    until_workloads(&env, 3).await;

    let err = env.hibernation.hibernate(p.id).await.unwrap_err();
    assert!(matches!(err, Error::Busy { ref operation, .. } if operation == "start"));
    assert!(env.ctx.locks.is_busy(p.id));

    env.cluster.set_ready(&env.workload(&p, "db"), 1);
    let report = start.await.unwrap().unwrap();
    assert_eq!(report.ready.len(), 1);
    assert!(!env.ctx.locks.is_busy(p.id));
}

/// Story: the idle checker skips a project another transition is holding
#[tokio::test]
async fn story_idle_check_skips_busy_project() {
    let env = Env::with_policy(LockPolicy::Wait);
    let p = env.web_app("race", Utc::now() - chrono::Duration::hours(2));
    env.cluster.set_manual_ready(true);

    let start = {
        let environments = env.environments.clone();
        let id = p.id;
        tokio::spawn(async move { environments.start(id).await })
    };
    until_workloads(&env, 3).await;

    let report = env.hibernation.check_idle().await.unwrap();
    assert_eq!(report.busy, vec![p.id]);
    assert!(report.hibernated.is_empty());

    env.cluster.set_ready(&env.workload(&p, "api"), 1);
    start.await.unwrap().unwrap();
}

// =============================================================================
// Wait policy
// =============================================================================

/// Story: with the wait policy a hibernate request queues behind the start
/// and then runs to completion
#[tokio::test]
async fn story_wait_policy_serializes_transitions() {
    let env = Env::with_policy(LockPolicy::Wait);
    let p = env.web_app("race", Utc::now());
    env.archive_on_termination(&p);
    env.cluster.set_manual_ready(true);

    let start = {
        let environments = env.environments.clone();
        let id = p.id;
        tokio::spawn(async move { environments.start(id).await })
    };
    until_workloads(&env, 3).await;

    let hibernate = {
        let hibernation = env.hibernation.clone();
        let id = p.id;
        tokio::spawn(async move { hibernation.hibernate(id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!hibernate.is_finished());
    assert!(env.cluster.exists(&env.volume(&p)));

    env.cluster.set_ready(&env.workload(&p, "frontend"), 1);
    start.await.unwrap().unwrap();

    let outcome = hibernate.await.unwrap().unwrap();
    assert!(matches!(outcome, HibernationOutcome::Hibernated { .. }));
    assert_eq!(
        env.stored(p.id).await.environment_status,
        EnvironmentStatus::Hibernated
    );
}

/// Story: a caller giving up does not interrupt a running hibernation
#[tokio::test]
async fn story_cancelled_caller_does_not_abort_hibernation() {
    let env = Env::new();
    let p = env.web_app("race", Utc::now());
    env.environments.start(p.id).await.unwrap();
    env.archive_on_termination(&p);
    env.cluster
        .hold_pods(canopy::naming::ResourceNamer::namespace(p.id), 1);

    // Give up while the cycle waits for the held pod
    let _ = tokio::time::timeout(Duration::from_millis(50), env.hibernation.hibernate(p.id)).await;
    env.cluster
        .hold_pods(canopy::naming::ResourceNamer::namespace(p.id), 0);

    tokio::time::timeout(Duration::from_secs(3), async {
        while env.stored(p.id).await.environment_status != EnvironmentStatus::Hibernated {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!env.cluster.exists(&env.volume(&p)));
}

/// Story: different projects never wait on each other
#[tokio::test]
async fn story_distinct_projects_proceed_in_parallel() {
    let env = Env::with_policy(LockPolicy::Reject);
    let a = env.web_app("alpha", Utc::now());
    let b = env.web_app("beta", Utc::now());

    let (ra, rb) = tokio::join!(env.environments.start(a.id), env.environments.start(b.id));

    assert!(ra.unwrap().is_success());
    assert!(rb.unwrap().is_success());
}
