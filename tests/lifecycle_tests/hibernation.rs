//! Stories about idle projects going to sleep and coming back

use std::fs;

use chrono::{Duration, Utc};

use canopy::archive::{self, HydrationOutcome};
use canopy::cluster::ResourceKind;
use canopy::controller::HibernationOutcome;
use canopy::model::{ContainerStatus, EnvironmentStatus};
use canopy::storage::archive_key;
use canopy::Error;

use super::fixtures::Env;

// =============================================================================
// Idle detection
// =============================================================================

/// Story: the idle threshold is a strict boundary
#[tokio::test]
async fn story_idle_boundary_is_exclusive() {
    let env = Env::new();
    let now = Utc::now();
    let threshold = Duration::seconds(env.ctx.config.idle_threshold_secs as i64);
    let at_threshold = env.web_app("edge", now - threshold);
    let past_threshold = env.web_app("past", now - threshold - Duration::seconds(1));
    env.environments.start(at_threshold.id).await.unwrap();
    env.environments.start(past_threshold.id).await.unwrap();
    // start records activity; put the timestamps back where the story needs them
    env.projects.insert(
        at_threshold.clone(),
        env.containers(at_threshold.id).await,
        vec![],
    );
    env.projects.insert(
        past_threshold.clone(),
        env.containers(past_threshold.id).await,
        vec![],
    );
    env.archive_on_termination(&past_threshold);

    let report = env.hibernation.check_idle_at(now).await.unwrap();

    assert_eq!(report.checked, 1);
    assert_eq!(report.hibernated, vec![past_threshold.id]);
    assert_eq!(
        env.stored(at_threshold.id).await.environment_status,
        EnvironmentStatus::Active
    );
    assert_eq!(
        env.stored(past_threshold.id).await.environment_status,
        EnvironmentStatus::Hibernated
    );
}

/// Story: hibernated projects are not checked again
#[tokio::test]
async fn story_hibernated_projects_are_not_candidates() {
    let env = Env::new();
    let p = env.web_app("sleepy", Utc::now() - Duration::hours(3));
    env.environments.start(p.id).await.unwrap();
    env.archive_on_termination(&p);
    env.hibernation.hibernate(p.id).await.unwrap();

    let report = env
        .hibernation
        .check_idle_at(Utc::now() + Duration::days(1))
        .await
        .unwrap();

    assert_eq!(report.checked, 0);
}

// =============================================================================
// Archive round trip
// =============================================================================

/// Story: a file written before hibernation comes back bit for bit after resume
#[tokio::test]
async fn story_hibernate_resume_round_trip() {
    let env = Env::new();
    let p = env.web_app("notes", Utc::now());
    let volume = env.dir.path().join("volume");
    let source = volume.join("frontend").join("src");
    fs::create_dir_all(&source).unwrap();
    let app: Vec<u8> = (0..500u32).map(|i| b"abcdefghij"[(i % 10) as usize]).collect();
    fs::write(source.join("App.jsx"), &app).unwrap();

    env.environments.start(p.id).await.unwrap();
    env.dehydrate_volume_on_termination(&p, volume.clone());

    let outcome = env.hibernation.hibernate(p.id).await.unwrap();

    let HibernationOutcome::Hibernated { archive_size_bytes } = outcome else {
        panic!("expected hibernation, got {outcome:?}");
    };
    let key = archive_key(p.user_id, p.id);
    assert_eq!(
        archive_size_bytes,
        env.store.object(&key).unwrap().len() as u64
    );
    let stored = env.stored(p.id).await;
    assert_eq!(stored.environment_status, EnvironmentStatus::Hibernated);
    assert_eq!(stored.archive_size_bytes, Some(archive_size_bytes));
    assert!(!env.cluster.exists(&env.volume(&p)));
    assert!(env.cluster.objects(ResourceKind::Deployment).is_empty());
    for c in env.containers(p.id).await {
        assert_eq!(c.status, ContainerStatus::Stopped);
    }

    // The volume is gone; resume provisions a new, empty one
    let report = env.hibernation.resume(p.id).await.unwrap();
    assert!(report.is_success(), "{}", report.summary());
    assert!(env.cluster.exists(&env.volume(&p)));

    // What the init containers of the new pods do
    let fresh = env.dir.path().join("restored");
    fs::create_dir_all(&fresh).unwrap();
    let first = archive::hydrate(env.store.as_ref(), &fresh, &key, std::time::Duration::from_secs(1))
        .await
        .unwrap();
    assert!(matches!(first, HydrationOutcome::Restored { .. }));
    let second = archive::hydrate(env.store.as_ref(), &fresh, &key, std::time::Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(second, HydrationOutcome::AlreadyHydrated);

    assert_eq!(
        fs::read(fresh.join("frontend").join("src").join("App.jsx")).unwrap(),
        app
    );

    let stored = env.stored(p.id).await;
    assert_eq!(stored.environment_status, EnvironmentStatus::Active);
    assert!(stored.hibernated_at.is_none());
}

/// Story: a request for a hibernated project wakes it up
#[tokio::test]
async fn story_touch_resumes_hibernated_project() {
    let env = Env::new();
    let p = env.web_app("notes", Utc::now() - Duration::hours(1));
    env.environments.start(p.id).await.unwrap();
    env.archive_on_termination(&p);
    env.hibernation.hibernate(p.id).await.unwrap();

    let report = env.environments.touch(p.id).await.unwrap();

    let report = report.expect("hibernated project should be resumed");
    assert_eq!(report.status, EnvironmentStatus::Active);
    assert_eq!(report.ready.len(), 3);
    assert!(env.environments.touch(p.id).await.unwrap().is_none());
}

/// Story: a resume whose containers never become ready gives the volume and
/// workloads back instead of leaving them running behind a hibernated status
#[tokio::test]
async fn story_resume_without_ready_containers_is_released() {
    let env = Env::new();
    let p = env.web_app("notes", Utc::now() - Duration::hours(1));
    env.environments.start(p.id).await.unwrap();
    env.archive_on_termination(&p);
    env.hibernation.hibernate(p.id).await.unwrap();
    env.cluster.set_manual_ready(true);

    let report = env.hibernation.resume(p.id).await.unwrap();

    assert!(report.ready.is_empty());
    assert!(!report.is_success());
    assert_eq!(report.status, EnvironmentStatus::Hibernated);
    let stored = env.stored(p.id).await;
    assert_eq!(stored.environment_status, EnvironmentStatus::Hibernated);
    assert!(!env.cluster.exists(&env.volume(&p)));
    assert!(env.cluster.objects(ResourceKind::Deployment).is_empty());
    for c in env.containers(p.id).await {
        assert_eq!(c.status, ContainerStatus::Stopped);
    }

    // The next request tries again from the same archive
    env.cluster.set_manual_ready(false);
    let report = env.hibernation.resume(p.id).await.unwrap();
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(
        env.stored(p.id).await.environment_status,
        EnvironmentStatus::Active
    );
    assert!(env.cluster.exists(&env.volume(&p)));
}

// =============================================================================
// Dehydration failures
// =============================================================================

/// Story: storage being down never costs the volume
#[tokio::test]
async fn story_storage_outage_keeps_volume() {
    let env = Env::new();
    let p = env.web_app("notes", Utc::now() - Duration::hours(1));
    env.environments.start(p.id).await.unwrap();
    env.store.set_unavailable(true);

    let report = env.hibernation.check_idle().await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, p.id);
    assert!(env.cluster.exists(&env.volume(&p)));
    assert_eq!(
        env.stored(p.id).await.environment_status,
        EnvironmentStatus::Hibernating
    );

    // A request while stuck cancels the hibernation; no hydration needed
    let report = env.environments.start(p.id).await.unwrap();
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(
        env.stored(p.id).await.environment_status,
        EnvironmentStatus::Active
    );
    assert_eq!(env.cluster.create_count(&env.volume(&p)), 1);
    assert_eq!(env.cluster.replicas(&env.workload(&p, "api")), Some(1));
}

/// Story: pods that refuse to terminate fail the cycle without data loss
#[tokio::test]
async fn story_stuck_pods_fail_dehydration() {
    let env = Env::new();
    let p = env.web_app("notes", Utc::now() - Duration::hours(1));
    env.environments.start(p.id).await.unwrap();
    env.archive_on_termination(&p);
    env.cluster
        .hold_pods(canopy::naming::ResourceNamer::namespace(p.id), 1);

    let err = env.hibernation.hibernate(p.id).await.unwrap_err();

    assert!(matches!(err, Error::DehydrationFailed { .. }));
    assert!(env.cluster.exists(&env.volume(&p)));
}
