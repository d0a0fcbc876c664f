//! Typed view of StorageClass parameters.

use std::collections::BTreeMap;

use target_api::VolumeType;
use tracing::debug;

use crate::error::{Error, Require, Result};
use crate::types::{TargetPortal, parse_flag};

use super::DEFAULT_VOLUME_GROUP;

const KNOWN_PARAMETERS: &[&str] = &[
    "targetPortal",
    "volumeType",
    "volumeGroup",
    "thinPool",
    "initiators",
    "chapAuthDiscovery",
    "chapAuthSession",
    "fsType",
    "readonly",
];

/// StorageClass parameters understood by the iSCSI provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageClassParameters {
    pub target_portal: TargetPortal,
    pub volume_type: VolumeType,
    pub volume_group: String,
    /// Pool for a thin volume, set only when the claim asked for one.
    pub thin_pool: Option<String>,
    /// Initiator addresses for the target ACL. Empty means unrestricted.
    pub initiators: Vec<String>,
    pub chap_auth_discovery: bool,
    pub chap_auth_session: bool,
    pub fs_type: String,
    pub read_only: bool,
}

impl StorageClassParameters {
    /// Parse the class parameters for one claim.
    ///
    /// Thin provisioning is checked before any other required parameter.
    pub fn parse(
        parameters: &BTreeMap<String, String>,
        default_fs: &str,
        thin_requested: bool,
    ) -> Result<Self> {
        for key in parameters.keys() {
            if !KNOWN_PARAMETERS.contains(&key.as_str()) {
                debug!(parameter = %key, "ignoring unknown storage class parameter");
            }
        }

        let get = |key: &str| {
            parameters
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let volume_type = match get("volumeType") {
            Some(value) => value.parse::<VolumeType>().map_err(|e| {
                Error::InvalidParameter {
                    name: "volumeType",
                    reason: e.to_string(),
                }
            })?,
            None => VolumeType::default(),
        };
        let thin_pool = thin_pool_for(volume_type, get("thinPool"), thin_requested)?;

        let target_portal =
            TargetPortal::parse(parameters.get("targetPortal").require("targetPortal")?)?;

        let initiators = get("initiators")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            target_portal,
            volume_type,
            volume_group: get("volumeGroup")
                .unwrap_or(DEFAULT_VOLUME_GROUP)
                .to_string(),
            thin_pool,
            initiators,
            chap_auth_discovery: parse_flag(get("chapAuthDiscovery")),
            chap_auth_session: parse_flag(get("chapAuthSession")),
            fs_type: get("fsType").unwrap_or(default_fs).to_string(),
            read_only: parse_flag(get("readonly")),
        })
    }

    pub fn uses_chap(&self) -> bool {
        self.chap_auth_discovery || self.chap_auth_session
    }
}

/// Thin pool for the new volume, or `None` for a fully allocated one.
fn thin_pool_for(
    volume_type: VolumeType,
    pool: Option<&str>,
    thin_requested: bool,
) -> Result<Option<String>> {
    if !thin_requested {
        return Ok(None);
    }
    if !volume_type.supports_thin_pool() {
        return Err(Error::ThinProvisioning {
            reason: format!("volume type {volume_type} has no thin pools"),
        });
    }
    pool.map(|pool| Some(pool.to_string()))
        .ok_or_else(|| Error::ThinProvisioning {
            reason: "the storage class has no thinPool parameter".to_string(),
        })
}
