//! Provisioner backed by iscsi-target-api.
//!
//! A provision is two remote calls: create the volume, then create a target
//! exporting it as a single LUN. A delete reverses them, target first.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ISCSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec,
    SecretReference,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use target_api::{LunCfg, TargetApi, TargetCfg, VolumeCfg, VolumeSize, VolumeType};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::types::{Iqn, parse_flag, parse_quantity_bytes};

use super::{
    ANN_INITIATORS, ANN_THIN, ANN_VOLUME_GROUP, ANN_VOLUME_NAME, ANN_VOLUME_TYPE, Config,
    DEFAULT_VOLUME_GROUP, Provisioner, SUPPORTED_ACCESS_MODES, StorageClassParameters, VOLUME_LUN,
    VolumeOptions,
};

/// Provisions iSCSI volumes through a shared [`TargetApi`] handle.
pub struct IscsiProvisioner {
    config: Config,
    client: Arc<dyn TargetApi>,
}

impl IscsiProvisioner {
    pub fn new(config: Config, client: Arc<dyn TargetApi>) -> Self {
        Self { config, client }
    }

    fn claim_ref(claim: &PersistentVolumeClaim) -> String {
        format!(
            "{}/{}",
            claim.namespace().unwrap_or_default(),
            claim.name_any()
        )
    }

    fn validate_access_modes(claim: &PersistentVolumeClaim) -> Result<()> {
        let requested = claim
            .spec
            .as_ref()
            .and_then(|spec| spec.access_modes.clone())
            .unwrap_or_default();

        if requested
            .iter()
            .all(|mode| SUPPORTED_ACCESS_MODES.contains(&mode.as_str()))
        {
            Ok(())
        } else {
            Err(Error::UnsupportedAccessMode {
                requested,
                supported: SUPPORTED_ACCESS_MODES,
            })
        }
    }

    /// The claim's storage request, as given and in bytes.
    fn requested_storage(claim: &PersistentVolumeClaim) -> Result<(Quantity, u64)> {
        let quantity = claim
            .spec
            .as_ref()
            .and_then(|spec| spec.resources.as_ref())
            .and_then(|resources| resources.requests.as_ref())
            .and_then(|requests| requests.get("storage"))
            .cloned()
            .ok_or_else(|| Error::InvalidClaim {
                claim: Self::claim_ref(claim),
                reason: "no storage request",
            })?;

        let bytes = parse_quantity_bytes(&quantity.0)?;
        if bytes == 0 {
            return Err(Error::InvalidCapacity {
                quantity: quantity.0,
                reason: "must be positive",
            });
        }
        Ok((quantity, bytes))
    }

    fn thin_requested(claim: &PersistentVolumeClaim) -> bool {
        parse_flag(claim.annotations().get(ANN_THIN).map(String::as_str))
    }

    /// Create the volume and export it. Returns the target IQN.
    ///
    /// A failed export leaves the volume behind; the next attempt for the
    /// same claim reuses the same names.
    async fn create_volume(
        &self,
        claim: &PersistentVolumeClaim,
        params: &StorageClassParameters,
        volume: &VolumeCfg,
    ) -> Result<Iqn> {
        let namespace = claim.namespace().ok_or_else(|| Error::InvalidClaim {
            claim: claim.name_any(),
            reason: "no namespace",
        })?;
        let iqn = Iqn::for_claim(chrono::Local::now(), &namespace, &claim.name_any());

        if let Err(e) = self.client.create_volume(volume).await {
            error!(volume = %volume.name, group = %volume.group, error = %e, "create volume failed");
            return Err(e.into());
        }

        let lun = LunCfg {
            target_iqn: iqn.as_str().to_string(),
            volume: volume.clone(),
            acl_list: params.initiators.clone(),
            enable_chap: params.chap_auth_session,
        };
        if let Err(e) = self.client.attach_lun(&lun).await {
            error!(volume = %volume.name, %iqn, error = %e, "attach lun failed, volume left in place");
            return Err(e.into());
        }

        if params.chap_auth_session {
            self.set_initiator_auth(params).await?;
        }

        info!(%iqn, volume = %volume.name, size = %volume.size, "volume created with target");
        Ok(iqn)
    }

    async fn set_initiator_auth(&self, params: &StorageClassParameters) -> Result<()> {
        let Some(credentials) = &self.config.chap_credentials else {
            warn!("session CHAP requested but no credentials are configured");
            return Ok(());
        };

        for initiator in &params.initiators {
            self.client
                .set_initiator_auth(&credentials.for_initiator(initiator))
                .await?;
            debug!(initiator, "initiator CHAP credentials set");
        }
        Ok(())
    }

    fn build_volume(
        &self,
        options: VolumeOptions,
        params: &StorageClassParameters,
        volume: &VolumeCfg,
        capacity: Quantity,
        iqn: Iqn,
    ) -> PersistentVolume {
        let annotations = BTreeMap::from([
            (ANN_VOLUME_NAME.to_string(), volume.name.clone()),
            (ANN_VOLUME_GROUP.to_string(), volume.group.clone()),
            (
                ANN_VOLUME_TYPE.to_string(),
                volume.volume_type.as_str().to_string(),
            ),
            (ANN_INITIATORS.to_string(), params.initiators.join(",")),
        ]);

        let secret_ref = params.uses_chap().then(|| SecretReference {
            name: Some(self.config.chap_secret_name()),
            namespace: None,
        });

        let claim_spec = options.claim.spec.unwrap_or_default();

        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(options.pv_name),
                labels: Some(BTreeMap::new()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(options.reclaim_policy),
                access_modes: claim_spec.access_modes,
                capacity: Some(BTreeMap::from([("storage".to_string(), capacity)])),
                volume_mode: claim_spec.volume_mode,
                mount_options: (!options.mount_options.is_empty())
                    .then_some(options.mount_options),
                iscsi: Some(ISCSIPersistentVolumeSource {
                    target_portal: params.target_portal.as_str().to_string(),
                    iqn: iqn.into_string(),
                    lun: VOLUME_LUN,
                    read_only: Some(params.read_only),
                    fs_type: Some(params.fs_type.clone()),
                    chap_auth_discovery: Some(params.chap_auth_discovery),
                    chap_auth_session: Some(params.chap_auth_session),
                    secret_ref,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Remote volume coordinates recorded on a PV by `provision`.
    fn volume_for(&self, pv: &PersistentVolume) -> Result<VolumeCfg> {
        let annotations = pv.annotations();
        let volume_type = match annotations.get(ANN_VOLUME_TYPE) {
            Some(value) => value.parse::<VolumeType>().map_err(|_| Error::InvalidVolume {
                name: pv.name_any(),
                reason: "unknown volume type annotation",
            })?,
            None => VolumeType::default(),
        };

        let capacity_bytes = pv
            .spec
            .as_ref()
            .and_then(|spec| spec.capacity.as_ref())
            .and_then(|capacity| capacity.get("storage"))
            .and_then(|quantity| parse_quantity_bytes(&quantity.0).ok())
            .unwrap_or(0);

        Ok(VolumeCfg {
            volume_type,
            group: annotations
                .get(ANN_VOLUME_GROUP)
                .cloned()
                .unwrap_or_else(|| DEFAULT_VOLUME_GROUP.to_string()),
            name: annotations
                .get(ANN_VOLUME_NAME)
                .cloned()
                .unwrap_or_else(|| pv.name_any()),
            size: VolumeSize::from_bytes(capacity_bytes),
            thin_provision: false,
            thin_pool: None,
        })
    }
}

#[async_trait]
impl Provisioner for IscsiProvisioner {
    async fn provision(&self, options: VolumeOptions) -> Result<PersistentVolume> {
        Self::validate_access_modes(&options.claim)?;
        debug!(pv = %options.pv_name, claim = %Self::claim_ref(&options.claim), "new provision request received");

        let params = StorageClassParameters::parse(
            &options.parameters,
            &self.config.default_fs,
            Self::thin_requested(&options.claim),
        )?;
        let (capacity, bytes) = Self::requested_storage(&options.claim)?;
        let size = VolumeSize::from_bytes(bytes);
        if size.as_bytes() != bytes {
            debug!(
                requested = bytes,
                allocated = size.as_bytes(),
                "capacity rounded up to whole MiB"
            );
        }
        debug!(
            portal_host = params.target_portal.host(),
            portal_port = params.target_portal.port(),
            volume_type = %params.volume_type,
            group = %params.volume_group,
            "storage class parameters parsed"
        );

        let volume = VolumeCfg {
            volume_type: params.volume_type,
            group: params.volume_group.clone(),
            name: options.pv_name.clone(),
            size,
            thin_provision: params.thin_pool.is_some(),
            thin_pool: params.thin_pool.clone(),
        };

        let iqn = self.create_volume(&options.claim, &params, &volume).await?;
        Ok(self.build_volume(options, &params, &volume, capacity, iqn))
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume.name_any();
        debug!(pv = %name, "volume deletion request received");

        let iqn = volume
            .spec
            .as_ref()
            .and_then(|spec| spec.iscsi.as_ref())
            .map(|iscsi| iscsi.iqn.clone())
            .filter(|iqn| !iqn.is_empty())
            .ok_or_else(|| Error::InvalidVolume {
                name: name.clone(),
                reason: "no iscsi source",
            })?;
        let backing = self.volume_for(volume)?;

        if let Err(e) = self.client.delete_target(&TargetCfg::new(iqn.as_str())).await {
            error!(pv = %name, %iqn, error = %e, "delete target failed");
            return Err(e.into());
        }
        debug!(pv = %name, %iqn, "target removed");

        if let Err(e) = self.client.delete_volume(&backing).await {
            error!(pv = %name, volume = %backing.name, group = %backing.group, error = %e, "delete volume failed");
            return Err(e.into());
        }

        info!(pv = %name, %iqn, volume = %backing.name, "volume deleted");
        Ok(())
    }

    fn supports_block(&self) -> bool {
        true
    }
}
