//! Engine configuration
//!
//! Every setting has a long flag, a `CANOPY_*` environment variable and a
//! default, so the binary can be configured entirely from a Deployment's env.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::{Error, Result};

/// Default engine image (also used by the hydration init container)
pub const DEFAULT_ENGINE_IMAGE: &str = "ghcr.io/canopy-dev/canopy:latest";
/// Default base domain for project hosts
pub const DEFAULT_BASE_DOMAIN: &str = "dev.localhost";
/// Default shared volume size
pub const DEFAULT_VOLUME_SIZE: &str = "5Gi";
/// Default archive bucket
pub const DEFAULT_ARCHIVE_BUCKET: &str = "canopy-archives";
/// Default idle threshold before hibernation (30 minutes)
pub const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 30 * 60;
/// Default interval between idle checks
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;
/// Default number of regional gateways
pub const DEFAULT_REGION_COUNT: u32 = 1;
/// Default regional gateway URL template
pub const DEFAULT_REGIONAL_GATEWAY_TEMPLATE: &str = "http://gateway-{index}.canopy-system.svc:80";
/// Default dynamic routing file
pub const DEFAULT_ROUTING_FILE: &str = "/etc/traefik/dynamic/regions.yaml";
/// Default namespace of the ingress controller
pub const DEFAULT_INGRESS_NAMESPACE: &str = "ingress-system";
/// Default ingress class
pub const DEFAULT_INGRESS_CLASS: &str = "traefik";
/// Ranges carved out of external egress: RFC 1918 plus the shared address
/// space some CNIs allocate pod and service addresses from
pub const DEFAULT_EGRESS_EXCEPT_CIDRS: &str = "10.0.0.0/8,172.16.0.0/12,192.168.0.0/16,100.64.0.0/10";

/// What to do when a transition is requested while another is in flight
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Queue behind the in-flight transition
    #[default]
    Wait,
    /// Reject immediately with a busy error
    Reject,
}

/// CPU and memory sizing for one container role
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoleResources {
    /// CPU request
    pub cpu_request: String,
    /// Memory request
    pub memory_request: String,
    /// Memory limit
    pub memory_limit: String,
}

/// Configuration for the orchestration engine
#[derive(Args, Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine image used by hydration init containers
    #[arg(long, env = "CANOPY_ENGINE_IMAGE", default_value = DEFAULT_ENGINE_IMAGE)]
    pub engine_image: String,

    /// Base domain for user-facing hosts (`<container>-<slug>.<domain>`)
    #[arg(long, env = "CANOPY_BASE_DOMAIN", default_value = DEFAULT_BASE_DOMAIN)]
    pub base_domain: String,

    /// Storage class for shared project volumes (must support ReadWriteMany)
    #[arg(long, env = "CANOPY_STORAGE_CLASS")]
    pub storage_class: Option<String>,

    /// Size of each project's shared volume
    #[arg(long, env = "CANOPY_VOLUME_SIZE", default_value = DEFAULT_VOLUME_SIZE)]
    pub volume_size: String,

    /// Bucket holding project archives
    #[arg(long, env = "CANOPY_ARCHIVE_BUCKET", default_value = DEFAULT_ARCHIVE_BUCKET)]
    pub archive_bucket: String,

    /// Secret with object storage credentials, mounted into hydration/dehydration steps
    #[arg(long, env = "CANOPY_STORAGE_CREDENTIALS_SECRET")]
    pub storage_credentials_secret: Option<String>,

    /// Idle duration after which an active project hibernates
    #[arg(long, env = "CANOPY_IDLE_THRESHOLD_SECS", default_value_t = DEFAULT_IDLE_THRESHOLD_SECS)]
    pub idle_threshold_secs: u64,

    /// Interval between idle checks
    #[arg(long, env = "CANOPY_CHECK_INTERVAL_SECS", default_value_t = DEFAULT_CHECK_INTERVAL_SECS)]
    pub check_interval_secs: u64,

    /// Number of regional gateways
    #[arg(long, env = "CANOPY_REGION_COUNT", default_value_t = DEFAULT_REGION_COUNT)]
    pub region_count: u32,

    /// Regional gateway URL template; `{index}` is replaced by the region index
    #[arg(long, env = "CANOPY_REGIONAL_GATEWAY_TEMPLATE", default_value = DEFAULT_REGIONAL_GATEWAY_TEMPLATE)]
    pub regional_gateway_template: String,

    /// Dynamic routing file consumed by the edge gateway
    #[arg(long, env = "CANOPY_ROUTING_FILE", default_value = DEFAULT_ROUTING_FILE)]
    pub routing_file: PathBuf,

    /// Namespace of the ingress controller (allowed into project namespaces)
    #[arg(long, env = "CANOPY_INGRESS_NAMESPACE", default_value = DEFAULT_INGRESS_NAMESPACE)]
    pub ingress_namespace: String,

    /// Ingress class for user-facing routes
    #[arg(long, env = "CANOPY_INGRESS_CLASS", default_value = DEFAULT_INGRESS_CLASS)]
    pub ingress_class: String,

    /// CIDRs project workloads may reach outside their namespace (object storage, registries)
    #[arg(long, env = "CANOPY_EGRESS_CIDRS", value_delimiter = ',', default_value = "0.0.0.0/0")]
    pub egress_cidrs: Vec<String>,

    /// Ranges carved out of `egress_cidrs` so projects cannot reach other pods
    ///
    /// Must cover the cluster's pod and service CIDRs.
    #[arg(
        long,
        env = "CANOPY_EGRESS_EXCEPT_CIDRS",
        value_delimiter = ',',
        default_value = DEFAULT_EGRESS_EXCEPT_CIDRS
    )]
    pub egress_except_cidrs: Vec<String>,

    /// Maximum concurrently executing project operations
    #[arg(long, env = "CANOPY_MAX_CONCURRENT_OPERATIONS", default_value_t = 16)]
    pub max_concurrent_operations: usize,

    /// Attempt ceiling for transient control-plane failures
    #[arg(long, env = "CANOPY_APPLY_MAX_ATTEMPTS", default_value_t = 5)]
    pub apply_max_attempts: u32,

    /// Initial retry delay in milliseconds
    #[arg(long, env = "CANOPY_RETRY_INITIAL_DELAY_MS", default_value_t = 200)]
    pub retry_initial_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    #[arg(long, env = "CANOPY_RETRY_MAX_DELAY_MS", default_value_t = 10_000)]
    pub retry_max_delay_ms: u64,

    /// How long to wait for a workload to become ready
    #[arg(long, env = "CANOPY_READY_TIMEOUT_SECS", default_value_t = 300)]
    pub ready_timeout_secs: u64,

    /// How long to wait for workloads to terminate (covers the dehydration hook)
    #[arg(long, env = "CANOPY_TERMINATE_TIMEOUT_SECS", default_value_t = 600)]
    pub terminate_timeout_secs: u64,

    /// How long to wait for a fresh archive object after workloads terminate
    #[arg(long, env = "CANOPY_ARCHIVE_TIMEOUT_SECS", default_value_t = 60)]
    pub archive_timeout_secs: u64,

    /// Grace period given to the dehydration hook on termination
    #[arg(long, env = "CANOPY_TERMINATION_GRACE_SECS", default_value_t = 300)]
    pub termination_grace_secs: u64,

    /// Poll interval for wait-for-status loops, in milliseconds
    #[arg(long, env = "CANOPY_POLL_INTERVAL_MS", default_value_t = 2_000)]
    pub poll_interval_ms: u64,

    /// Behaviour when a transition is requested for a busy project
    #[arg(long, env = "CANOPY_LOCK_POLICY", value_enum, default_value_t = LockPolicy::Wait)]
    pub lock_policy: LockPolicy,

    /// CPU request for application containers
    #[arg(long, env = "CANOPY_APP_CPU_REQUEST", default_value = "500m")]
    pub app_cpu_request: String,

    /// Memory request for application containers
    #[arg(long, env = "CANOPY_APP_MEMORY_REQUEST", default_value = "1Gi")]
    pub app_memory_request: String,

    /// Memory limit for application containers
    #[arg(long, env = "CANOPY_APP_MEMORY_LIMIT", default_value = "2Gi")]
    pub app_memory_limit: String,

    /// CPU request for service containers
    #[arg(long, env = "CANOPY_SERVICE_CPU_REQUEST", default_value = "100m")]
    pub service_cpu_request: String,

    /// Memory request for service containers
    #[arg(long, env = "CANOPY_SERVICE_MEMORY_REQUEST", default_value = "256Mi")]
    pub service_memory_request: String,

    /// Memory limit for service containers
    #[arg(long, env = "CANOPY_SERVICE_MEMORY_LIMIT", default_value = "512Mi")]
    pub service_memory_limit: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_image: DEFAULT_ENGINE_IMAGE.to_string(),
            base_domain: DEFAULT_BASE_DOMAIN.to_string(),
            storage_class: None,
            volume_size: DEFAULT_VOLUME_SIZE.to_string(),
            archive_bucket: DEFAULT_ARCHIVE_BUCKET.to_string(),
            storage_credentials_secret: None,
            idle_threshold_secs: DEFAULT_IDLE_THRESHOLD_SECS,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            region_count: DEFAULT_REGION_COUNT,
            regional_gateway_template: DEFAULT_REGIONAL_GATEWAY_TEMPLATE.to_string(),
            routing_file: PathBuf::from(DEFAULT_ROUTING_FILE),
            ingress_namespace: DEFAULT_INGRESS_NAMESPACE.to_string(),
            ingress_class: DEFAULT_INGRESS_CLASS.to_string(),
            egress_cidrs: vec!["0.0.0.0/0".to_string()],
            egress_except_cidrs: DEFAULT_EGRESS_EXCEPT_CIDRS
                .split(',')
                .map(str::to_string)
                .collect(),
            max_concurrent_operations: 16,
            apply_max_attempts: 5,
            retry_initial_delay_ms: 200,
            retry_max_delay_ms: 10_000,
            ready_timeout_secs: 300,
            terminate_timeout_secs: 600,
            archive_timeout_secs: 60,
            termination_grace_secs: 300,
            poll_interval_ms: 2_000,
            lock_policy: LockPolicy::Wait,
            app_cpu_request: "500m".to_string(),
            app_memory_request: "1Gi".to_string(),
            app_memory_limit: "2Gi".to_string(),
            service_cpu_request: "100m".to_string(),
            service_memory_request: "256Mi".to_string(),
            service_memory_limit: "512Mi".to_string(),
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.base_domain.trim().is_empty() {
            return Err(Error::validation_for_field("base_domain", "must not be empty"));
        }
        if self.region_count == 0 {
            return Err(Error::validation_for_field("region_count", "must be at least 1"));
        }
        if self.apply_max_attempts == 0 {
            return Err(Error::validation_for_field(
                "apply_max_attempts",
                "must be at least 1",
            ));
        }
        if self.archive_bucket.trim().is_empty() {
            return Err(Error::validation_for_field("archive_bucket", "must not be empty"));
        }
        if self.check_interval_secs == 0 {
            return Err(Error::validation_for_field(
                "check_interval_secs",
                "must be at least 1",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::validation_for_field("poll_interval_ms", "must be at least 1"));
        }
        if self.max_concurrent_operations == 0 {
            return Err(Error::validation_for_field(
                "max_concurrent_operations",
                "must be at least 1",
            ));
        }
        if !self.regional_gateway_template.contains("{index}") && self.region_count > 1 {
            return Err(Error::validation_for_field(
                "regional_gateway_template",
                "must contain {index} when more than one region is configured",
            ));
        }
        Ok(())
    }

    /// Retry policy for control-plane and storage calls
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.apply_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: 2.0,
        }
    }

    /// Idle threshold as a chrono duration
    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_threshold_secs.min(i64::MAX as u64) as i64)
    }

    /// Interval between idle checks
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Readiness wait timeout
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Termination wait timeout
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    /// Archive confirmation timeout
    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_secs)
    }

    /// Poll interval for wait loops
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Sizing for application containers
    pub fn application_resources(&self) -> RoleResources {
        RoleResources {
            cpu_request: self.app_cpu_request.clone(),
            memory_request: self.app_memory_request.clone(),
            memory_limit: self.app_memory_limit.clone(),
        }
    }

    /// Sizing for service containers
    pub fn service_resources(&self) -> RoleResources {
        RoleResources {
            cpu_request: self.service_cpu_request.clone(),
            memory_request: self.service_memory_request.clone(),
            memory_limit: self.service_memory_limit.clone(),
        }
    }

    /// URL of the regional gateway with the given index
    pub fn regional_gateway_url(&self, index: u32) -> String {
        self.regional_gateway_template
            .replace("{index}", &index.to_string())
    }
}
