//! Provision controller.
//!
//! Two kube-runtime controllers share one [`Provisioner`]: the claim loop turns
//! pending claims of our StorageClasses into bound PersistentVolumes, and the
//! volume loop removes the storage behind released volumes we provisioned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{DeleteParams, PostParams};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::provisioner::{PROVISIONER_NAME, Provisioner, VolumeOptions};

pub const ANN_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";
pub const ANN_STORAGE_CLASS_BETA: &str = "volume.beta.kubernetes.io/storage-class";
pub const ANN_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";

const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);
const DEFAULT_RECLAIM_POLICY: &str = "Delete";

/// Controller loop configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// StorageClass `provisioner` value this controller serves.
    pub provisioner_name: String,
    /// Requeue interval after a successful reconcile.
    pub resync_period: Duration,
    pub exponential_backoff: bool,
    /// Consecutive failures after which an object is left until it changes. 0 retries forever.
    pub fail_retry_threshold: u32,
    pub lease_period: Duration,
    pub renew_deadline: Duration,
    /// Base delay before retrying a failed reconcile.
    pub retry_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            provisioner_name: PROVISIONER_NAME.to_string(),
            resync_period: Duration::from_secs(15 * 60),
            exponential_backoff: true,
            fail_retry_threshold: 10,
            lease_period: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.provisioner_name.is_empty() {
            return Err(Error::InvalidConfig {
                field: "provisioner-name",
                reason: "must not be empty",
            });
        }
        if self.resync_period.is_zero() {
            return Err(Error::InvalidConfig {
                field: "resync-period",
                reason: "must be positive",
            });
        }
        if self.renew_deadline >= self.lease_period {
            return Err(Error::InvalidConfig {
                field: "renew-deadline",
                reason: "must be shorter than lease-period",
            });
        }
        if self.retry_period >= self.renew_deadline {
            return Err(Error::InvalidConfig {
                field: "retry-period",
                reason: "must be shorter than renew-deadline",
            });
        }
        if self.retry_period.is_zero() {
            return Err(Error::InvalidConfig {
                field: "retry-period",
                reason: "must be positive",
            });
        }
        Ok(())
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// or `None` once the retry threshold is reached.
    pub fn retry_delay(&self, failures: u32) -> Option<Duration> {
        if self.fail_retry_threshold > 0 && failures >= self.fail_retry_threshold {
            return None;
        }
        if !self.exponential_backoff {
            return Some(self.retry_period);
        }
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        Some(
            self.retry_period
                .checked_mul(factor)
                .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY)),
        )
    }
}

/// Consecutive reconcile failures per object.
#[derive(Debug, Default)]
struct FailureTracker {
    failures: Mutex<HashMap<String, u32>>,
}

impl FailureTracker {
    fn record_failure(&self, key: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_default();
        *count = count.saturating_add(1);
        *count
    }

    fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Record a failure and pick the retry delay. Giving up forgets the object,
    /// so its next change starts a fresh series.
    fn next_retry(&self, key: &str, config: &ControllerConfig) -> (u32, Option<Duration>) {
        let failures = self.record_failure(key);
        let delay = config.retry_delay(failures);
        if delay.is_none() {
            self.reset(key);
        }
        (failures, delay)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct Context {
    client: Client,
    provisioner: Arc<dyn Provisioner>,
    config: ControllerConfig,
    failures: FailureTracker,
}

fn object_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    key_for::<K>(obj.namespace().as_deref(), &obj.name_any())
}

fn key_for<K: Resource<DynamicType = ()>>(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) => format!("{}/{}/{}", K::kind(&()), namespace, name),
        None => format!("{}/{}", K::kind(&()), name),
    }
}

fn is_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == code)
}

/// Pending and not yet bound to a volume.
pub fn claim_needs_provisioning(claim: &PersistentVolumeClaim) -> bool {
    let pending = claim
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .is_none_or(|phase| phase == "Pending");
    let unbound = claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .is_none_or(str::is_empty);
    pending && unbound && claim.meta().deletion_timestamp.is_none()
}

/// StorageClass requested by a claim, from the spec or the beta annotation.
pub fn storage_class_name(claim: &PersistentVolumeClaim) -> Option<String> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.clone())
        .filter(|name| !name.is_empty())
        .or_else(|| claim.annotations().get(ANN_STORAGE_CLASS_BETA).cloned())
        .filter(|name| !name.is_empty())
}

/// Delayed-binding classes wait for the scheduler to pick a node.
pub fn binding_ready(claim: &PersistentVolumeClaim, class: &StorageClass) -> bool {
    class.volume_binding_mode.as_deref() != Some("WaitForFirstConsumer")
        || claim.annotations().contains_key(ANN_SELECTED_NODE)
}

/// Name of the volume provisioned for a claim: `pvc-<claim uid>`.
pub fn volume_name(claim: &PersistentVolumeClaim) -> Result<String> {
    claim
        .uid()
        .map(|uid| format!("pvc-{uid}"))
        .ok_or_else(|| Error::InvalidClaim {
            claim: object_key(claim),
            reason: "no uid",
        })
}

pub fn ensure_volume_mode(claim: &PersistentVolumeClaim, supports_block: bool) -> Result<()> {
    let block = claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_mode.as_deref())
        == Some("Block");
    if block && !supports_block {
        return Err(Error::BlockModeUnsupported(object_key(claim)));
    }
    Ok(())
}

pub fn volume_options(
    claim: &PersistentVolumeClaim,
    class: &StorageClass,
    pv_name: String,
) -> VolumeOptions {
    VolumeOptions {
        pv_name,
        claim: claim.clone(),
        parameters: class.parameters.clone().unwrap_or_default(),
        reclaim_policy: class
            .reclaim_policy
            .clone()
            .unwrap_or_else(|| DEFAULT_RECLAIM_POLICY.to_string()),
        mount_options: class.mount_options.clone().unwrap_or_default(),
    }
}

/// Pre-bind a provisioned volume to its claim and mark it as ours.
pub fn bind_to_claim(
    volume: &mut PersistentVolume,
    claim: &PersistentVolumeClaim,
    class_name: &str,
    provisioner_name: &str,
) {
    volume
        .annotations_mut()
        .insert(ANN_PROVISIONED_BY.to_string(), provisioner_name.to_string());

    let spec = volume.spec.get_or_insert_with(Default::default);
    spec.claim_ref = Some(ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        namespace: claim.namespace(),
        name: Some(claim.name_any()),
        uid: claim.uid(),
        resource_version: claim.resource_version(),
        ..Default::default()
    });
    spec.storage_class_name = Some(class_name.to_string());
}

/// Released, reclaim policy Delete, provisioned by us and not already being removed.
pub fn volume_needs_deletion(volume: &PersistentVolume, provisioner_name: &str) -> bool {
    let released = volume
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Released");
    let delete_policy = volume
        .spec
        .as_ref()
        .and_then(|spec| spec.persistent_volume_reclaim_policy.as_deref())
        == Some(DEFAULT_RECLAIM_POLICY);
    let ours = volume.annotations().get(ANN_PROVISIONED_BY).map(String::as_str)
        == Some(provisioner_name);
    released && delete_policy && ours && volume.meta().deletion_timestamp.is_none()
}

async fn provision_claim(claim: &PersistentVolumeClaim, ctx: &Context) -> Result<()> {
    if !claim_needs_provisioning(claim) {
        return Ok(());
    }
    let Some(class_name) = storage_class_name(claim) else {
        return Ok(());
    };

    let classes: Api<StorageClass> = Api::all(ctx.client.clone());
    let Some(class) = classes.get_opt(&class_name).await? else {
        debug!(claim = %object_key(claim), class = %class_name, "storage class not found");
        return Ok(());
    };
    if class.provisioner != ctx.config.provisioner_name {
        return Ok(());
    }
    if !binding_ready(claim, &class) {
        debug!(claim = %object_key(claim), "waiting for node selection");
        return Ok(());
    }

    let pv_name = volume_name(claim)?;
    let volumes: Api<PersistentVolume> = Api::all(ctx.client.clone());
    if volumes.get_opt(&pv_name).await?.is_some() {
        debug!(claim = %object_key(claim), pv = %pv_name, "volume already exists");
        return Ok(());
    }

    ensure_volume_mode(claim, ctx.provisioner.supports_block())?;

    info!(claim = %object_key(claim), pv = %pv_name, class = %class_name, "provisioning volume");
    let mut volume = ctx
        .provisioner
        .provision(volume_options(claim, &class, pv_name.clone()))
        .await?;
    bind_to_claim(&mut volume, claim, &class_name, &ctx.config.provisioner_name);

    match volumes.create(&PostParams::default(), &volume).await {
        Ok(_) => info!(claim = %object_key(claim), pv = %pv_name, "volume provisioned"),
        Err(e) if is_status(&e, 409) => {
            debug!(pv = %pv_name, "volume object already created")
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn delete_volume(volume: &PersistentVolume, ctx: &Context) -> Result<()> {
    if !volume_needs_deletion(volume, &ctx.config.provisioner_name) {
        return Ok(());
    }

    let name = volume.name_any();
    info!(pv = %name, "deleting released volume");
    ctx.provisioner.delete(volume).await?;

    let volumes: Api<PersistentVolume> = Api::all(ctx.client.clone());
    match volumes.delete(&name, &DeleteParams::default()).await {
        Ok(_) => info!(pv = %name, "volume deleted"),
        Err(e) if is_status(&e, 404) => debug!(pv = %name, "volume object already gone"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn reconcile_claim(claim: Arc<PersistentVolumeClaim>, ctx: Arc<Context>) -> Result<Action> {
    provision_claim(&claim, &ctx).await?;
    ctx.failures.reset(&object_key(claim.as_ref()));
    Ok(Action::requeue(ctx.config.resync_period))
}

async fn reconcile_volume(volume: Arc<PersistentVolume>, ctx: Arc<Context>) -> Result<Action> {
    delete_volume(&volume, &ctx).await?;
    ctx.failures.reset(&object_key(volume.as_ref()));
    Ok(Action::requeue(ctx.config.resync_period))
}

fn error_policy<K: Resource<DynamicType = ()>>(
    obj: Arc<K>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    let key = object_key(obj.as_ref());
    let (failures, delay) = ctx.failures.next_retry(&key, &ctx.config);

    match delay {
        Some(delay) => {
            if error.is_validation() {
                warn!(object = %key, failures, ?delay, error = %error, "reconcile failed");
            } else {
                error!(object = %key, failures, ?delay, error = %error, "reconcile failed");
            }
            Action::requeue(delay)
        }
        None => {
            error!(object = %key, failures, error = %error, "retry threshold reached, waiting for the object to change");
            Action::await_change()
        }
    }
}

fn log_result<K>(
    result: std::result::Result<
        (kube::runtime::reflector::ObjectRef<K>, Action),
        controller::Error<Error, watcher::Error>,
    >,
    failures: &FailureTracker,
) where
    K: Resource<DynamicType = ()>,
{
    match result {
        Ok((object, _)) => debug!(%object, "reconciled"),
        // Already logged by the error policy.
        Err(controller::Error::ReconcilerFailed(..)) => {}
        // Deleted while a retry was pending.
        Err(controller::Error::ObjectNotFound(object)) => {
            failures.reset(&key_for::<K>(object.namespace.as_deref(), &object.name));
            debug!(name = %object.name, "object gone before retry");
        }
        Err(e) => warn!(error = %e, "controller stream error"),
    }
}

/// Drives a [`Provisioner`] from PersistentVolumeClaim and PersistentVolume events.
pub struct ProvisionController {
    client: Client,
    provisioner: Arc<dyn Provisioner>,
    config: ControllerConfig,
}

impl ProvisionController {
    pub fn new(
        client: Client,
        provisioner: Arc<dyn Provisioner>,
        config: ControllerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            provisioner,
            config,
        })
    }

    /// Run both loops until a termination signal is received.
    pub async fn run(self) {
        info!(
            provisioner = %self.config.provisioner_name,
            resync_period = ?self.config.resync_period,
            exponential_backoff = self.config.exponential_backoff,
            fail_retry_threshold = self.config.fail_retry_threshold,
            lease_period = ?self.config.lease_period,
            renew_deadline = ?self.config.renew_deadline,
            retry_period = ?self.config.retry_period,
            "starting provision controller"
        );

        let ctx = Arc::new(Context {
            client: self.client.clone(),
            provisioner: self.provisioner,
            config: self.config,
            failures: FailureTracker::default(),
        });

        let claims = Controller::new(
            Api::<PersistentVolumeClaim>::all(self.client.clone()),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(
            reconcile_claim,
            error_policy::<PersistentVolumeClaim>,
            ctx.clone(),
        )
        .for_each(|result| {
            let ctx = ctx.clone();
            async move { log_result(result, &ctx.failures) }
        });

        let volumes = Controller::new(
            Api::<PersistentVolume>::all(self.client),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile_volume, error_policy::<PersistentVolume>, ctx.clone())
        .for_each(|result| {
            let ctx = ctx.clone();
            async move { log_result(result, &ctx.failures) }
        });

        futures::join!(claims, volumes);
        info!("provision controller stopped");
    }
}
