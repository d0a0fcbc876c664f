//! iscsi-provisioner: dynamic provisioner for iSCSI volumes.
//!
//! Watches PersistentVolumeClaims whose StorageClass names this provisioner,
//! creates the backing volume and target through iscsi-target-api, and
//! publishes a PersistentVolume with an iSCSI source. Released volumes with
//! a Delete reclaim policy are torn down the same way in reverse.

pub mod controller;
pub mod credentials;
pub mod error;
pub mod provisioner;
pub mod types;

pub use controller::{ControllerConfig, ProvisionController};
pub use credentials::ChapCredentials;
pub use error::{Error, Result};
pub use provisioner::{Config, IscsiProvisioner, Provisioner, VolumeOptions};
pub use types::{Iqn, TargetPortal};

#[cfg(test)]
pub(crate) mod test_util;
