//! Regional routing for the edge gateway
//!
//! The edge proxy cannot pick a backend by hash, so the mapping is computed
//! here: every project slug is hashed (SHA-256), reduced modulo the region
//! count, and written out as a static host rule pointing at the chosen
//! regional gateway. The output is a Traefik dynamic configuration file that
//! is always replaced atomically.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EngineConfig;
use crate::persistence::ProjectStore;
use crate::{Error, Result};

/// Regional gateway selected for a project
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionalTarget {
    /// Project slug
    pub slug: String,
    /// Region index in `0..region_count`
    pub region: u32,
    /// Gateway URL for the region
    pub gateway_url: String,
}

// =============================================================================
// Dynamic configuration document
// =============================================================================

/// Root of the dynamic configuration file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    /// HTTP section
    pub http: HttpConfig,
}

/// Routers and services
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Host rules keyed by router name
    pub routers: BTreeMap<String, Router>,
    /// Regional gateways keyed by service name
    pub services: BTreeMap<String, GatewayService>,
}

/// One host rule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    /// Match expression
    pub rule: String,
    /// Target service name
    pub service: String,
    /// Entry points the rule listens on
    pub entry_points: Vec<String>,
}

/// A regional gateway backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayService {
    /// Load balancer definition
    pub load_balancer: LoadBalancer,
}

/// Servers behind a service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    /// Backend servers
    pub servers: Vec<Server>,
    /// Forward the original Host header
    pub pass_host_header: bool,
}

/// A backend server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Server URL
    pub url: String,
}

// =============================================================================
// Generator
// =============================================================================

const ENTRY_POINT: &str = "web";

/// Computes and writes the slug to region mapping
#[derive(Clone, Debug)]
pub struct RoutingGenerator {
    region_count: u32,
    gateway_template: String,
    base_domain: String,
    path: PathBuf,
}

impl RoutingGenerator {
    /// Generator from engine configuration
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            region_count: config.region_count.max(1),
            gateway_template: config.regional_gateway_template.clone(),
            base_domain: config.base_domain.clone(),
            path: config.routing_file.clone(),
        }
    }

    /// Path of the routing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn gateway_url(&self, region: u32) -> String {
        self.gateway_template.replace("{index}", &region.to_string())
    }

    /// Region index for a slug
    pub fn region_for(&self, slug: &str) -> u32 {
        use aws_lc_rs::digest;
        let hash = digest::digest(&digest::SHA256, slug.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_ref()[..8]);
        (u64::from_be_bytes(prefix) % u64::from(self.region_count)) as u32
    }

    /// Select the regional gateway for a project
    pub fn route(&self, slug: &str) -> RegionalTarget {
        let region = self.region_for(slug);
        RegionalTarget {
            slug: slug.to_string(),
            region,
            gateway_url: self.gateway_url(region),
        }
    }

    /// Host pattern matching every external host of a project
    pub fn host_pattern(&self, slug: &str) -> String {
        format!(
            "^[a-z0-9-]+-{}\\.{}$",
            regex::escape(slug),
            regex::escape(&self.base_domain)
        )
    }

    fn host_rule(&self, slug: &str) -> String {
        format!("HostRegexp(`{}`)", self.host_pattern(slug))
    }

    /// Build the dynamic configuration for a set of slugs
    ///
    /// Duplicate slugs collapse into one rule; output is ordered by slug so
    /// the same input always renders the same file.
    pub fn build(&self, slugs: &[String]) -> DynamicConfig {
        let mut config = DynamicConfig::default();
        for slug in slugs {
            let target = self.route(slug);
            let service = format!("region-{}", target.region);
            config.http.routers.insert(
                format!("project-{slug}"),
                Router {
                    rule: self.host_rule(slug),
                    service: service.clone(),
                    entry_points: vec![ENTRY_POINT.to_string()],
                },
            );
            config
                .http
                .services
                .entry(service)
                .or_insert_with(|| GatewayService {
                    load_balancer: LoadBalancer {
                        servers: vec![Server {
                            url: target.gateway_url,
                        }],
                        pass_host_header: true,
                    },
                });
        }
        config
    }

    /// Render the dynamic configuration as YAML
    pub fn render(&self, slugs: &[String]) -> Result<String> {
        serde_yaml::to_string(&self.build(slugs))
            .map_err(|e| Error::serialization_for_kind("routing", e.to_string()))
    }

    /// Rewrite the routing file for a set of slugs
    pub fn write(&self, slugs: &[String]) -> Result<()> {
        let rendered = self.render(slugs)?;
        write_atomic(&self.path, rendered.as_bytes())?;
        info!(path = %self.path.display(), projects = slugs.len(), "wrote routing file");
        Ok(())
    }

    /// Rewrite the routing file from every known project
    pub async fn regenerate(&self, store: &dyn ProjectStore) -> Result<Vec<String>> {
        let slugs: Vec<String> = store
            .list_projects()
            .await?
            .into_iter()
            .map(|p| p.slug)
            .collect();
        let generator = self.clone();
        let written = slugs.clone();
        tokio::task::spawn_blocking(move || generator.write(&written))
            .await
            .map_err(|e| Error::internal_with_context("routing", e.to_string()))??;
        Ok(slugs)
    }
}

/// Replace a file atomically: write a sibling temp file, then rename it
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let fail = |e: std::io::Error| {
        Error::internal_with_context("write_atomic", format!("{}: {}", path.display(), e))
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(fail)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(fail)?;
    tmp.write_all(contents).map_err(fail)?;
    tmp.as_file().sync_all().map_err(fail)?;
    tmp.persist(path).map_err(|e| fail(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::host_for;

    fn generator(dir: &Path, regions: u32) -> RoutingGenerator {
        RoutingGenerator::new(&EngineConfig {
            region_count: regions,
            base_domain: "dev.example.com".to_string(),
            regional_gateway_template: "http://gateway-{index}.edge:8080".to_string(),
            routing_file: dir.join("dynamic").join("projects.yaml"),
            ..Default::default()
        })
    }

    fn slugs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // ==========================================================================
    // Story Tests: Stable region selection
    // ==========================================================================

    /// Story: two projects over two regions keep their regions across runs
    #[test]
    fn story_alpha_beta_routes_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let g = generator(dir.path(), 2);
        let input = slugs(&["alpha", "beta"]);

        let first = g.build(&input);
        let second = g.build(&input);
        assert_eq!(first, second);
        assert_eq!(first.http.routers.len(), 2);

        for slug in ["alpha", "beta"] {
            let target = g.route(slug);
            assert!(target.region < 2);
            assert_eq!(g.route(slug), target);
            let router = &first.http.routers[&format!("project-{slug}")];
            assert_eq!(router.service, format!("region-{}", target.region));
        }
    }

    #[test]
    fn story_single_region_takes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let g = generator(dir.path(), 1);
        for slug in ["a", "b", "c", "todo-app"] {
            assert_eq!(g.route(slug).region, 0);
        }
    }

    #[test]
    fn story_regions_spread_across_many_slugs() {
        let dir = tempfile::tempdir().unwrap();
        let g = generator(dir.path(), 4);
        let mut seen = std::collections::BTreeSet::new();
        for i in 0..200 {
            seen.insert(g.route(&format!("project-{i}")).region);
        }
        assert_eq!(seen.len(), 4);
    }

    // ==========================================================================
    // Story Tests: Rendered file
    // ==========================================================================

    #[test]
    fn story_rule_matches_project_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let g = generator(dir.path(), 2);
        let config = g.build(&slugs(&["todo-app"]));
        let router = &config.http.routers["project-todo-app"];
        assert_eq!(
            router.rule,
            "HostRegexp(`^[a-z0-9-]+-todo\\-app\\.dev\\.example\\.com$`)"
        );
        let service = &config.http.services[&router.service];
        assert_eq!(
            service.load_balancer.servers[0].url,
            g.route("todo-app").gateway_url
        );
    }

    #[test]
    fn story_rule_matches_every_container_host() {
        let dir = tempfile::tempdir().unwrap();
        let g = generator(dir.path(), 2);
        let pattern = regex::Regex::new(&g.host_pattern("todo-app")).unwrap();

        for name in ["frontend", "Frontend", "My App", "3d viewer", "x".repeat(80).as_str()] {
            let host = host_for("todo-app", name, "dev.example.com");
            assert!(pattern.is_match(&host), "{host} from {name:?}");
        }
        assert!(!pattern.is_match("frontend-other.dev.example.com"));
        assert!(!pattern.is_match("frontend-todo-app.devxexample.com"));
    }

    #[test]
    fn story_metacharacters_in_names_are_escaped() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = generator(dir.path(), 1);
        g.base_domain = "dev+1.example.com".to_string();
        let pattern = regex::Regex::new(&g.host_pattern("a.b")).unwrap();
        assert!(pattern.is_match("web-a.b.dev+1.example.com"));
        assert!(!pattern.is_match("web-axb.dev+1.example.com"));
        assert!(!pattern.is_match("web-a.b.devv1.example.com"));
    }

    #[test]
    fn story_write_replaces_file_with_valid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let g = generator(dir.path(), 2);

        g.write(&slugs(&["alpha", "beta"])).unwrap();
        g.write(&slugs(&["alpha"])).unwrap();

        let text = std::fs::read_to_string(g.path()).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        let routers = parsed["http"]["routers"].as_mapping().unwrap();
        assert_eq!(routers.len(), 1);
        assert!(text.contains("loadBalancer"));
        assert!(text.contains("entryPoints"));

        let leftovers: Vec<_> = std::fs::read_dir(g.path().parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn story_regenerate_uses_every_project() {
        use crate::model::{EnvironmentStatus, Project};
        use crate::persistence::InMemoryProjectStore;

        let dir = tempfile::tempdir().unwrap();
        let g = generator(dir.path(), 2);
        let store = InMemoryProjectStore::default();
        for slug in ["alpha", "beta"] {
            store.insert(
                Project {
                    id: uuid::Uuid::new_v4(),
                    user_id: uuid::Uuid::new_v4(),
                    slug: slug.to_string(),
                    namespace: None,
                    environment_status: EnvironmentStatus::Active,
                    last_activity: chrono::Utc::now(),
                    hibernated_at: None,
                    archive_size_bytes: None,
                },
                vec![],
                vec![],
            );
        }

        let written = g.regenerate(&store).await.unwrap();
        assert_eq!(written.len(), 2);
        let text = std::fs::read_to_string(g.path()).unwrap();
        assert!(text.contains("project-alpha"));
        assert!(text.contains("project-beta"));
    }
}
