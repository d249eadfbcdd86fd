//! Stories about regional routing as projects come and go

use chrono::Utc;

use canopy::routing::{DynamicConfig, RoutingGenerator};

use super::fixtures::Env;

fn read_routes(generator: &RoutingGenerator) -> DynamicConfig {
    let text = std::fs::read_to_string(generator.path()).unwrap();
    serde_yaml::from_str(&text).unwrap()
}

/// Story: adding a project never moves existing projects between regions
#[tokio::test]
async fn story_existing_routes_survive_new_projects() {
    let env = Env::with(|c| c.region_count = 2);
    env.web_app("alpha", Utc::now());
    env.web_app("beta", Utc::now());

    let first = env.environments.refresh_routes().await.unwrap();
    assert_eq!(first.len(), 2);
    let before = read_routes(&env.ctx.routing);

    env.web_app("gamma", Utc::now());
    env.environments.refresh_routes().await.unwrap();
    let after = read_routes(&env.ctx.routing);

    assert_eq!(after.http.routers.len(), 3);
    for slug in ["alpha", "beta"] {
        let name = format!("project-{slug}");
        assert_eq!(before.http.routers[&name], after.http.routers[&name]);
    }
}

/// Story: a torn-down project disappears from the routing file
#[tokio::test]
async fn story_teardown_drops_route() {
    let env = Env::with(|c| c.region_count = 2);
    let alpha = env.web_app("alpha", Utc::now());
    env.web_app("beta", Utc::now());
    env.environments.refresh_routes().await.unwrap();

    env.environments.teardown(alpha.id, false).await.unwrap();

    let routes = read_routes(&env.ctx.routing);
    assert!(!routes.http.routers.contains_key("project-alpha"));
    assert!(routes.http.routers.contains_key("project-beta"));
}

/// Story: hibernated projects keep their route so a request can wake them
#[tokio::test]
async fn story_hibernated_projects_stay_routed() {
    let env = Env::new();
    let p = env.web_app("alpha", Utc::now());
    env.environments.start(p.id).await.unwrap();
    env.archive_on_termination(&p);
    env.hibernation.hibernate(p.id).await.unwrap();

    let slugs = env.environments.refresh_routes().await.unwrap();

    assert_eq!(slugs, vec!["alpha".to_string()]);
    let routes = read_routes(&env.ctx.routing);
    let router = &routes.http.routers["project-alpha"];
    assert!(routes.http.services.contains_key(&router.service));
}
