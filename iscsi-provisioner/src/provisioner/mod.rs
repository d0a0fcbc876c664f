//! Provisioner contract and its iSCSI implementation.
//!
//! This module contains:
//! - `Provisioner`: the two-operation contract driven by the controller
//! - `VolumeOptions`: everything the controller knows about a claim to provision
//! - `IscsiProvisioner`: provisions through iscsi-target-api (in `iscsi` submodule)
//! - `StorageClassParameters`: typed StorageClass parameters (in `parameters` submodule)

mod iscsi;
mod parameters;

pub use iscsi::IscsiProvisioner;
pub use parameters::StorageClassParameters;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};

use crate::credentials::ChapCredentials;
use crate::error::Result;

pub const PROVISIONER_NAME: &str = "iscsi-target-api";
pub const DEFAULT_FS_TYPE: &str = "xfs";
pub const DEFAULT_VOLUME_GROUP: &str = "vg-targetd";
/// Every target exports exactly one LUN.
pub const VOLUME_LUN: i32 = 1;

/// Access modes an iSCSI volume can honor.
pub const SUPPORTED_ACCESS_MODES: &[&str] = &["ReadWriteOnce", "ReadOnlyMany"];

/// PV annotations recording where the backing volume lives.
pub const ANN_VOLUME_NAME: &str = "iscsi-provisioner/volume-name";
pub const ANN_VOLUME_GROUP: &str = "iscsi-provisioner/volume-group";
pub const ANN_VOLUME_TYPE: &str = "iscsi-provisioner/volume-type";
pub const ANN_INITIATORS: &str = "iscsi-provisioner/initiators";

/// Claim annotation requesting a thin-provisioned volume.
pub const ANN_THIN: &str = "thin";

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Must match the `provisioner` field of the StorageClasses we serve.
    pub provisioner_name: String,
    /// Filesystem written to the PV when the StorageClass has no `fsType`.
    pub default_fs: String,
    /// Pushed to the target for every initiator when session CHAP is on.
    pub chap_credentials: Option<ChapCredentials>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provisioner_name: PROVISIONER_NAME.to_string(),
            default_fs: DEFAULT_FS_TYPE.to_string(),
            chap_credentials: None,
        }
    }
}

impl Config {
    /// Name of the Secret the kubelet reads CHAP credentials from.
    pub fn chap_secret_name(&self) -> String {
        format!("{}-chap-secret", self.provisioner_name)
    }
}

/// A provisioning request assembled by the controller.
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    /// Name the resulting PersistentVolume must have.
    pub pv_name: String,
    pub claim: PersistentVolumeClaim,
    /// StorageClass `parameters`.
    pub parameters: BTreeMap<String, String>,
    /// StorageClass `reclaimPolicy`.
    pub reclaim_policy: String,
    /// StorageClass `mountOptions`.
    pub mount_options: Vec<String>,
}

/// Storage backend driven by the provision controller.
///
/// Implementations hold no per-call state: the controller may run
/// `provision` and `delete` concurrently for different objects.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the backing storage for a claim and describe it as a PV.
    ///
    /// The controller fills in the claim reference and storage class.
    async fn provision(&self, options: VolumeOptions) -> Result<PersistentVolume>;

    /// Remove the backing storage of a PV previously returned by `provision`.
    async fn delete(&self, volume: &PersistentVolume) -> Result<()>;

    /// Whether claims with `volumeMode: Block` can be served.
    fn supports_block(&self) -> bool {
        false
    }
}
