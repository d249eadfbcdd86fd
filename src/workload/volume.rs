//! Shared project volume
//!
//! Each project owns exactly one ReadWriteMany claim. Every container workload
//! mounts its own subdirectory of it, and the hydration/dehydration steps mount
//! the whole claim so archives cover the entire project filesystem.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ObjectMeta, PvcVolumeSource, Volume, WORKSPACE_VOLUME};
use crate::cluster::{impl_api_defaults, HasApiResource};
use crate::config::EngineConfig;
use crate::model::Project;
use crate::naming::ResourceNamer;
use crate::LABEL_PROJECT;

/// Access mode for the shared volume
pub const ACCESS_MODE_RWX: &str = "ReadWriteMany";

/// Kubernetes PersistentVolumeClaim
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaim {
    /// API version (v1)
    #[serde(default = "PersistentVolumeClaim::default_api_version")]
    pub api_version: String,
    /// Resource kind (PersistentVolumeClaim)
    #[serde(default = "PersistentVolumeClaim::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// PVC spec
    pub spec: PvcSpec,
}

impl HasApiResource for PersistentVolumeClaim {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "PersistentVolumeClaim";
}

impl_api_defaults!(PersistentVolumeClaim);

/// PVC spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    /// Access modes (ReadWriteOnce, ReadWriteMany, ReadOnlyMany)
    pub access_modes: Vec<String>,
    /// Resource requirements
    pub resources: PvcResources,
    /// Storage class name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// PVC resource requirements
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcResources {
    /// Storage requests
    pub requests: PvcStorage,
}

/// PVC storage request
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcStorage {
    /// Storage size (e.g., "5Gi")
    pub storage: String,
}

/// Compile the shared volume claim for a project
pub fn compile_volume(project: &Project, config: &EngineConfig) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        api_version: PersistentVolumeClaim::default_api_version(),
        kind: PersistentVolumeClaim::default_kind(),
        metadata: ObjectMeta::new(
            ResourceNamer::volume(project.id),
            ResourceNamer::namespace(project.id),
        )
        .with_label(LABEL_PROJECT, project.id.to_string()),
        spec: PvcSpec {
            access_modes: vec![ACCESS_MODE_RWX.to_string()],
            resources: PvcResources {
                requests: PvcStorage {
                    storage: config.volume_size.clone(),
                },
            },
            storage_class_name: config.storage_class.clone(),
        },
    }
}

/// Pod volume referencing the project's shared claim
pub fn workspace_volume(project_id: Uuid) -> Volume {
    Volume {
        name: WORKSPACE_VOLUME.to_string(),
        persistent_volume_claim: Some(PvcVolumeSource {
            claim_name: ResourceNamer::volume(project_id),
        }),
        empty_dir: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EnvironmentStatus;
    use chrono::Utc;

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            slug: "demo".to_string(),
            namespace: None,
            environment_status: EnvironmentStatus::Active,
            last_activity: Utc::now(),
            hibernated_at: None,
            archive_size_bytes: None,
        }
    }

    #[test]
    fn story_volume_is_read_write_many_and_sized_from_config() {
        let p = project();
        let config = EngineConfig {
            volume_size: "20Gi".to_string(),
            storage_class: Some("efs".to_string()),
            ..Default::default()
        };
        let pvc = compile_volume(&p, &config);

        assert_eq!(pvc.metadata.name, ResourceNamer::volume(p.id));
        assert_eq!(pvc.metadata.namespace, ResourceNamer::namespace(p.id));
        assert_eq!(pvc.spec.access_modes, vec!["ReadWriteMany"]);
        assert_eq!(pvc.spec.resources.requests.storage, "20Gi");
        assert_eq!(pvc.spec.storage_class_name.as_deref(), Some("efs"));
    }

    #[test]
    fn story_default_storage_class_is_omitted() {
        let pvc = compile_volume(&project(), &EngineConfig::default());
        let json = serde_json::to_value(&pvc).unwrap();
        assert!(json["spec"].get("storageClassName").is_none());
        assert_eq!(json["kind"], "PersistentVolumeClaim");
    }
}
