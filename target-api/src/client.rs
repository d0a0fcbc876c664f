//! HTTP client for the iscsi-target-api service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::protocol::{InitiatorAuth, LunCfg, TargetApiError, TargetCfg, VolumeCfg};

/// Remote operations the provisioner needs from the storage host.
///
/// Every call either fully succeeds or returns the service's error; there is
/// no partial result.
#[async_trait]
pub trait TargetApi: Send + Sync {
    async fn create_volume(&self, volume: &VolumeCfg) -> Result<(), TargetApiError>;

    async fn delete_volume(&self, volume: &VolumeCfg) -> Result<(), TargetApiError>;

    /// Create a target for `lun.target_iqn` and export the volume behind it.
    async fn attach_lun(&self, lun: &LunCfg) -> Result<(), TargetApiError>;

    async fn delete_target(&self, target: &TargetCfg) -> Result<(), TargetApiError>;

    async fn set_initiator_auth(&self, auth: &InitiatorAuth) -> Result<(), TargetApiError>;
}

/// A remote operation and the route that serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateVolume,
    DeleteVolume,
    AttachLun,
    DeleteTarget,
    SetInitiatorAuth,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateVolume => "create volume",
            Self::DeleteVolume => "delete volume",
            Self::AttachLun => "attach lun",
            Self::DeleteTarget => "delete target",
            Self::SetInitiatorAuth => "set initiator auth",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::CreateVolume => "createVol",
            Self::DeleteVolume => "deleteVol",
            Self::AttachLun => "attachLun",
            Self::DeleteTarget => "deleteTarget",
            Self::SetInitiatorAuth => "setInitiatorAuth",
        }
    }

    fn method(&self) -> Method {
        match self {
            Self::CreateVolume | Self::AttachLun | Self::SetInitiatorAuth => Method::POST,
            Self::DeleteVolume | Self::DeleteTarget => Method::DELETE,
        }
    }
}

/// Connection settings for the service.
#[derive(Debug, Clone)]
pub struct ServerCfg {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Upper bound on a single request, including connect.
    pub timeout: Duration,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: 8811,
            username: "admin".to_string(),
            password: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// [`TargetApi`] over HTTP with basic authentication and JSON bodies.
pub struct HttpClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

impl HttpClient {
    pub fn new(cfg: ServerCfg) -> Result<Self, TargetApiError> {
        let endpoint = format!("http://{}:{}/", cfg.address, cfg.port);
        let base_url = Url::parse(&endpoint).map_err(|e| TargetApiError::InvalidEndpoint {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;

        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;

        Ok(Self {
            http,
            base_url,
            username: cfg.username,
            password: cfg.password,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn call<T: Serialize + Sync>(
        &self,
        operation: Operation,
        body: &T,
    ) -> Result<(), TargetApiError> {
        let url = self
            .base_url
            .join(operation.path())
            .map_err(|e| TargetApiError::InvalidEndpoint {
                endpoint: self.base_url.to_string(),
                reason: e.to_string(),
            })?;

        debug!(operation = operation.name(), %url, "calling target api");

        let response = self
            .http
            .request(operation.method(), url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // The body is the only diagnostic the service gives us.
        let message = response.text().await.unwrap_or_default();
        Err(TargetApiError::Rejected {
            operation: operation.name(),
            status: status.as_u16(),
            message: message.trim().to_string(),
        })
    }
}

#[async_trait]
impl TargetApi for HttpClient {
    async fn create_volume(&self, volume: &VolumeCfg) -> Result<(), TargetApiError> {
        self.call(Operation::CreateVolume, volume).await
    }

    async fn delete_volume(&self, volume: &VolumeCfg) -> Result<(), TargetApiError> {
        self.call(Operation::DeleteVolume, volume).await
    }

    async fn attach_lun(&self, lun: &LunCfg) -> Result<(), TargetApiError> {
        self.call(Operation::AttachLun, lun).await
    }

    async fn delete_target(&self, target: &TargetCfg) -> Result<(), TargetApiError> {
        self.call(Operation::DeleteTarget, target).await
    }

    async fn set_initiator_auth(&self, auth: &InitiatorAuth) -> Result<(), TargetApiError> {
        self.call(Operation::SetInitiatorAuth, auth).await
    }
}
