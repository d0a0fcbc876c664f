//! Request objects accepted by the iscsi-target-api service.
//!
//! Field names on the wire follow the service's JSON schema, which is why
//! several fields carry explicit `serde` renames.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes per MiB.
pub const BYTES_PER_MIB: u64 = 1 << 20;
/// Bytes per GiB.
pub const BYTES_PER_GIB: u64 = 1 << 30;

const _: () = {
    assert!(BYTES_PER_GIB % BYTES_PER_MIB == 0);
};

/// Errors returned by target API calls.
#[derive(Debug, Error)]
pub enum TargetApiError {
    #[error("{operation} rejected by target api (status {status}): {message}")]
    Rejected {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("invalid target api endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("unknown volume type: {0}")]
    UnknownVolumeType(String),

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Backing store of a volume on the storage host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    /// LVM logical volume inside a volume group.
    #[default]
    Lvm,
    /// Sparse image file managed by tgtimg.
    Tgtimg,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lvm => "lvm",
            Self::Tgtimg => "tgtimg",
        }
    }

    /// Only LVM volumes can be carved out of a thin pool.
    pub fn supports_thin_pool(&self) -> bool {
        matches!(self, Self::Lvm)
    }
}

impl FromStr for VolumeType {
    type Err = TargetApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lvm" => Ok(Self::Lvm),
            "tgtimg" => Ok(Self::Tgtimg),
            other => Err(TargetApiError::UnknownVolumeType(other.to_string())),
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size unit understood by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeUnit {
    #[serde(rename = "MiB")]
    MiB,
    #[serde(rename = "GiB")]
    GiB,
}

impl SizeUnit {
    pub fn bytes(&self) -> u64 {
        match self {
            Self::MiB => BYTES_PER_MIB,
            Self::GiB => BYTES_PER_GIB,
        }
    }
}

/// Volume size expressed in the service's units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSize {
    pub size: u64,
    pub unit: SizeUnit,
}

impl VolumeSize {
    /// Convert a byte count into the largest unit that represents it exactly.
    ///
    /// Sizes that are not a whole number of GiB are expressed in MiB, rounded
    /// up so the volume is never smaller than requested.
    pub fn from_bytes(bytes: u64) -> Self {
        if bytes > 0 && bytes % BYTES_PER_GIB == 0 {
            Self {
                size: bytes / BYTES_PER_GIB,
                unit: SizeUnit::GiB,
            }
        } else {
            Self {
                size: bytes.div_ceil(BYTES_PER_MIB).max(1),
                unit: SizeUnit::MiB,
            }
        }
    }

    pub fn as_bytes(&self) -> u64 {
        self.size.saturating_mul(self.unit.bytes())
    }
}

impl fmt::Display for VolumeSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            SizeUnit::MiB => "MiB",
            SizeUnit::GiB => "GiB",
        };
        write!(f, "{}{unit}", self.size)
    }
}

/// A volume on the storage host, identified by `(group, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCfg {
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    pub group: String,
    pub name: String,
    #[serde(flatten)]
    pub size: VolumeSize,
    #[serde(rename = "thin", default)]
    pub thin_provision: bool,
    #[serde(rename = "thinPool", default, skip_serializing_if = "Option::is_none")]
    pub thin_pool: Option<String>,
}

/// Export of a volume as a LUN behind a newly created target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunCfg {
    #[serde(rename = "targetIQN")]
    pub target_iqn: String,
    pub volume: VolumeCfg,
    /// Initiator addresses allowed to log in. Empty means no ACL.
    #[serde(rename = "aclList", default, skip_serializing_if = "Vec::is_empty")]
    pub acl_list: Vec<String>,
    #[serde(rename = "enableChap", default)]
    pub enable_chap: bool,
}

/// Identifies a target for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCfg {
    #[serde(rename = "targetIQN")]
    pub target_iqn: String,
}

impl TargetCfg {
    pub fn new(target_iqn: impl Into<String>) -> Self {
        Self {
            target_iqn: target_iqn.into(),
        }
    }
}

/// CHAP credentials for one initiator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorAuth {
    #[serde(rename = "initiator_wwn")]
    pub initiator: String,
    pub in_user: String,
    #[serde(rename = "in_pass")]
    pub in_password: String,
    pub out_user: String,
    #[serde(rename = "out_pass")]
    pub out_password: String,
}

impl fmt::Debug for InitiatorAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitiatorAuth")
            .field("initiator", &self.initiator)
            .field("in_user", &self.in_user)
            .field("in_password", &"<redacted>")
            .field("out_user", &self.out_user)
            .field("out_password", &"<redacted>")
            .finish()
    }
}
