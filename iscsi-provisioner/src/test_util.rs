//! Shared test utilities for provisioner and controller tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use k8s_openapi::api::core::v1::{
    ISCSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use target_api::{
    InitiatorAuth, LunCfg, Operation, TargetApi, TargetApiError, TargetCfg, VolumeCfg,
};

use crate::credentials::ChapCredentials;
use crate::provisioner::{
    ANN_VOLUME_GROUP, ANN_VOLUME_NAME, ANN_VOLUME_TYPE, Config, IscsiProvisioner, VolumeOptions,
};

/// A recorded call to [`FakeTargetApi`].
#[derive(Debug, Clone)]
pub enum Call {
    CreateVolume(VolumeCfg),
    DeleteVolume(VolumeCfg),
    AttachLun(LunCfg),
    DeleteTarget(TargetCfg),
    SetInitiatorAuth(InitiatorAuth),
}

/// In-memory [`TargetApi`] that records every call and fails on demand.
#[derive(Default)]
pub struct FakeTargetApi {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FakeTargetApi {
    pub const FAILURE_MESSAGE: &'static str = "injected failure";

    /// Make every later call of `operation` fail with a 500.
    pub fn fail_on(&self, operation: Operation) {
        self.failing.lock().unwrap().insert(operation.name());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn created_volumes(&self) -> Vec<VolumeCfg> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateVolume(volume) => Some(volume),
                _ => None,
            })
            .collect()
    }

    fn record(&self, operation: Operation, call: Call) -> Result<(), TargetApiError> {
        self.calls.lock().unwrap().push(call);
        if self.failing.lock().unwrap().contains(operation.name()) {
            return Err(TargetApiError::Rejected {
                operation: operation.name(),
                status: 500,
                message: Self::FAILURE_MESSAGE.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TargetApi for FakeTargetApi {
    async fn create_volume(&self, volume: &VolumeCfg) -> Result<(), TargetApiError> {
        self.record(Operation::CreateVolume, Call::CreateVolume(volume.clone()))
    }

    async fn delete_volume(&self, volume: &VolumeCfg) -> Result<(), TargetApiError> {
        self.record(Operation::DeleteVolume, Call::DeleteVolume(volume.clone()))
    }

    async fn attach_lun(&self, lun: &LunCfg) -> Result<(), TargetApiError> {
        self.record(Operation::AttachLun, Call::AttachLun(lun.clone()))
    }

    async fn delete_target(&self, target: &TargetCfg) -> Result<(), TargetApiError> {
        self.record(Operation::DeleteTarget, Call::DeleteTarget(target.clone()))
    }

    async fn set_initiator_auth(&self, auth: &InitiatorAuth) -> Result<(), TargetApiError> {
        self.record(
            Operation::SetInitiatorAuth,
            Call::SetInitiatorAuth(auth.clone()),
        )
    }
}

/// Test fixture wiring an [`IscsiProvisioner`] to a [`FakeTargetApi`].
pub struct TestFixture {
    pub api: Arc<FakeTargetApi>,
    pub provisioner: IscsiProvisioner,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_api(Arc::new(FakeTargetApi::default()))
    }

    pub fn with_api(api: Arc<FakeTargetApi>) -> Self {
        Self::build(api, Config::default())
    }

    pub fn with_chap_credentials() -> Self {
        let config = Config {
            chap_credentials: Some(ChapCredentials {
                in_user: "initiator".to_string(),
                in_password: "initiator-secret".to_string(),
                out_user: String::new(),
                out_password: String::new(),
            }),
            ..Default::default()
        };
        Self::build(Arc::new(FakeTargetApi::default()), config)
    }

    fn build(api: Arc<FakeTargetApi>, config: Config) -> Self {
        let provisioner = IscsiProvisioner::new(config, api.clone());
        Self { api, provisioner }
    }
}

/// Builder for claims as the API server would hand them to the controller.
pub struct ClaimBuilder {
    claim: PersistentVolumeClaim,
}

impl ClaimBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                uid: Some("test".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("1Gi".to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        };
        Self { claim }
    }

    fn spec(&mut self) -> &mut PersistentVolumeClaimSpec {
        self.claim.spec.get_or_insert_with(Default::default)
    }

    pub fn access_modes(mut self, modes: &[&str]) -> Self {
        self.spec().access_modes = Some(modes.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn storage(mut self, quantity: &str) -> Self {
        self.spec().resources = Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(quantity.to_string()),
            )])),
            ..Default::default()
        });
        self
    }

    pub fn no_storage(mut self) -> Self {
        self.spec().resources = None;
        self
    }

    pub fn volume_mode(mut self, mode: &str) -> Self {
        self.spec().volume_mode = Some(mode.to_string());
        self
    }

    pub fn storage_class(mut self, class: &str) -> Self {
        self.spec().storage_class_name = Some(class.to_string());
        self
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.claim
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.claim.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
        self
    }

    pub fn build(self) -> PersistentVolumeClaim {
        self.claim
    }
}

/// Provision request for `claim` with a Delete reclaim policy and PV name "pvc-test".
pub fn options_for(claim: PersistentVolumeClaim, parameters: &[(&str, &str)]) -> VolumeOptions {
    VolumeOptions {
        pv_name: "pvc-test".to_string(),
        claim,
        parameters: parameters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        reclaim_policy: "Delete".to_string(),
        mount_options: Vec::new(),
    }
}

/// A PV shaped like the output of a provision into lvm group "vg0".
pub fn provisioned_volume(name: &str, iqn: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(BTreeMap::from([
                (ANN_VOLUME_NAME.to_string(), name.to_string()),
                (ANN_VOLUME_GROUP.to_string(), "vg0".to_string()),
                (ANN_VOLUME_TYPE.to_string(), "lvm".to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity("1Gi".to_string()),
            )])),
            persistent_volume_reclaim_policy: Some("Delete".to_string()),
            iscsi: Some(ISCSIPersistentVolumeSource {
                target_portal: "10.0.0.5:3260".to_string(),
                iqn: iqn.to_string(),
                lun: 1,
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// A request seen by [`MockApiServer`].
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub body: serde_json::Value,
}

/// Minimal Kubernetes API server for StorageClass and PersistentVolume calls.
///
/// Serves one StorageClass, answers PV lookups from `existing_volume`, and
/// replies to PV create and delete with the configured status codes.
#[derive(Clone)]
pub struct MockApiServer {
    requests: Arc<Mutex<Vec<ApiRequest>>>,
    pub storage_class: StorageClass,
    pub existing_volume: Option<PersistentVolume>,
    pub create_status: StatusCode,
    pub delete_status: StatusCode,
}

const STORAGE_CLASS_PATH: &str = "/apis/storage.k8s.io/v1/storageclasses/";
const VOLUMES_PATH: &str = "/api/v1/persistentvolumes";

impl MockApiServer {
    pub fn new(storage_class: StorageClass) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            storage_class,
            existing_volume: None,
            create_status: StatusCode::CREATED,
            delete_status: StatusCode::OK,
        }
    }

    /// Serve on a local port and return a client pointed at it.
    pub async fn start(self) -> (Client, Self) {
        let app = Router::new().fallback(answer).with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = kube::Config::new(format!("http://{addr}").parse().unwrap());
        (Client::try_from(config).unwrap(), self)
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_with(&self, method: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }
}

fn status(code: StatusCode) -> (StatusCode, String) {
    let reason = match code {
        StatusCode::NOT_FOUND => "NotFound",
        StatusCode::CONFLICT => "AlreadyExists",
        _ => "InternalError",
    };
    let body = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("mock api server: {reason}"),
        "reason": reason,
        "code": code.as_u16(),
    });
    (code, body.to_string())
}

async fn answer(
    State(server): State<MockApiServer>,
    method: Method,
    uri: Uri,
    body: String,
) -> (StatusCode, String) {
    let path = uri.path().to_string();
    server.requests.lock().unwrap().push(ApiRequest {
        method: method.to_string(),
        path: path.clone(),
        body: serde_json::from_str(&body).unwrap_or(serde_json::Value::Null),
    });

    let volume_name = path
        .strip_prefix(VOLUMES_PATH)
        .and_then(|rest| rest.strip_prefix('/'));

    match (method, volume_name) {
        (Method::GET, _) if path.starts_with(STORAGE_CLASS_PATH) => {
            let name = &path[STORAGE_CLASS_PATH.len()..];
            if server.storage_class.metadata.name.as_deref() == Some(name) {
                (
                    StatusCode::OK,
                    serde_json::to_string(&server.storage_class).unwrap(),
                )
            } else {
                status(StatusCode::NOT_FOUND)
            }
        }
        (Method::GET, Some(_)) => match &server.existing_volume {
            Some(volume) => (StatusCode::OK, serde_json::to_string(volume).unwrap()),
            None => status(StatusCode::NOT_FOUND),
        },
        (Method::POST, None) if path == VOLUMES_PATH => {
            if server.create_status.is_success() {
                (server.create_status, body)
            } else {
                status(server.create_status)
            }
        }
        (Method::DELETE, Some(name)) => {
            if server.delete_status.is_success() {
                let volume = PersistentVolume {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                (server.delete_status, serde_json::to_string(&volume).unwrap())
            } else {
                status(server.delete_status)
            }
        }
        _ => status(StatusCode::NOT_FOUND),
    }
}
