//! Hydration init step and dehydration hook
//!
//! Every pod carries:
//! - an init container running the engine image: it installs the engine
//!   binary into a shared `emptyDir` and restores the project archive into the
//!   volume when the volume has not been hydrated yet
//! - a `preStop` hook on the main container that runs the installed binary to
//!   archive the whole volume to object storage
//!
//! Both steps mount the whole shared volume at [`VOLUME_ROOT_PATH`]. The hook
//! runs on every graceful termination; archiving is idempotent (the archive
//! object is overwritten).

use super::{
    Container, EmptyDirVolumeSource, EnvFromSource, ExecAction, Lifecycle, LifecycleHandler,
    SecretEnvSource, Volume, VolumeMount, WORKSPACE_VOLUME,
};
use crate::config::EngineConfig;
use crate::model::Project;
use crate::storage::archive_key;

/// Name of the hydration init container
pub const HYDRATE_CONTAINER: &str = "hydrate";

/// Name of the `emptyDir` holding the engine binary
pub const TOOL_VOLUME: &str = "canopy-tools";

/// Mount path of the engine binary directory
pub const TOOL_MOUNT_PATH: &str = "/canopy/bin";

/// Mount path of the whole shared volume for hydration and dehydration
pub const VOLUME_ROOT_PATH: &str = "/canopy/volume";

/// Engine binary name inside the image and the tool directory
pub const ENGINE_BINARY: &str = "canopy";

/// Everything needed to wire archive restore/save into a pod
#[derive(Clone, Debug, PartialEq)]
pub struct HydrationSpec {
    /// Engine image
    pub image: String,
    /// Archive bucket
    pub bucket: String,
    /// Archive object key
    pub key: String,
    /// Secret with storage credentials
    pub credentials_secret: Option<String>,
}

impl HydrationSpec {
    /// Hydration settings for a project
    pub fn for_project(project: &Project, config: &EngineConfig) -> Self {
        Self {
            image: config.engine_image.clone(),
            bucket: config.archive_bucket.clone(),
            key: archive_key(project.user_id, project.id),
            credentials_secret: config.storage_credentials_secret.clone(),
        }
    }

    fn archive_args(&self) -> Vec<String> {
        vec![
            "--root".to_string(),
            VOLUME_ROOT_PATH.to_string(),
            "--bucket".to_string(),
            self.bucket.clone(),
            "--key".to_string(),
            self.key.clone(),
        ]
    }

    /// Storage credentials exposed to both steps
    pub fn env_from(&self) -> Vec<EnvFromSource> {
        self.credentials_secret
            .iter()
            .map(|name| EnvFromSource {
                secret_ref: SecretEnvSource { name: name.clone() },
            })
            .collect()
    }

    /// Init container restoring the archive before the main process starts
    pub fn init_container(&self) -> Container {
        let mut command = vec![ENGINE_BINARY.to_string(), "hydrate".to_string()];
        command.extend(self.archive_args());
        command.push("--install-to".to_string());
        command.push(TOOL_MOUNT_PATH.to_string());

        Container {
            name: HYDRATE_CONTAINER.to_string(),
            image: self.image.clone(),
            command: Some(command),
            env_from: self.env_from(),
            volume_mounts: vec![
                VolumeMount {
                    name: WORKSPACE_VOLUME.to_string(),
                    mount_path: VOLUME_ROOT_PATH.to_string(),
                    sub_path: None,
                    read_only: None,
                },
                VolumeMount {
                    name: TOOL_VOLUME.to_string(),
                    mount_path: TOOL_MOUNT_PATH.to_string(),
                    sub_path: None,
                    read_only: None,
                },
            ],
            ..Default::default()
        }
    }

    /// `preStop` hook archiving the volume on graceful termination
    pub fn pre_stop(&self) -> Lifecycle {
        let mut command = vec![
            format!("{}/{}", TOOL_MOUNT_PATH, ENGINE_BINARY),
            "dehydrate".to_string(),
        ];
        command.extend(self.archive_args());
        Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: ExecAction { command },
            }),
        }
    }

    /// Extra mounts the main container needs for the hook
    pub fn hook_mounts(&self) -> Vec<VolumeMount> {
        vec![
            VolumeMount {
                name: WORKSPACE_VOLUME.to_string(),
                mount_path: VOLUME_ROOT_PATH.to_string(),
                sub_path: None,
                read_only: None,
            },
            VolumeMount {
                name: TOOL_VOLUME.to_string(),
                mount_path: TOOL_MOUNT_PATH.to_string(),
                sub_path: None,
                read_only: Some(true),
            },
        ]
    }
}

/// `emptyDir` the init container installs the engine binary into
pub fn tool_volume() -> Volume {
    Volume {
        name: TOOL_VOLUME.to_string(),
        persistent_volume_claim: None,
        empty_dir: Some(EmptyDirVolumeSource {}),
    }
}
