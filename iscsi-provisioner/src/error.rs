//! Error types for the provisioner.

use std::io;
use std::path::PathBuf;

use target_api::TargetApiError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for required StorageClass parameters.
///
/// Returns [`Error::MissingParameter`] if the value is absent or empty.
pub trait Require<T> {
    fn require(self, name: &'static str) -> Result<T>;
}

impl Require<String> for Option<&String> {
    fn require(self, name: &'static str) -> Result<String> {
        match self {
            Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            _ => Err(Error::MissingParameter(name)),
        }
    }
}

/// Provisioner errors.
///
/// Validation variants are raised before any remote call is made. Remote
/// failures are carried unchanged in [`Error::TargetApi`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid AccessModes {requested:?}: only AccessModes {supported:?} are supported")]
    UnsupportedAccessMode {
        requested: Vec<String>,
        supported: &'static [&'static str],
    },

    #[error("storage class parameter {0} is required")]
    MissingParameter(&'static str),

    #[error("invalid storage class parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("thin provisioning requested but {reason}")]
    ThinProvisioning { reason: String },

    #[error("invalid capacity request {quantity:?}: {reason}")]
    InvalidCapacity {
        quantity: String,
        reason: &'static str,
    },

    #[error("invalid claim {claim}: {reason}")]
    InvalidClaim {
        claim: String,
        reason: &'static str,
    },

    #[error("invalid persistent volume {name}: {reason}")]
    InvalidVolume { name: String, reason: &'static str },

    #[error("claim {0} requests volume mode Block, which this provisioner does not support")]
    BlockModeUnsupported(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },

    #[error("failed to read CHAP credentials from {}: {source}", .path.display())]
    CredentialsRead { path: PathBuf, source: io::Error },

    #[error("failed to parse CHAP credentials in {}: {source}", .path.display())]
    CredentialsParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(transparent)]
    TargetApi(#[from] TargetApiError),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// True for errors raised before any remote call was attempted.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            Error::TargetApi(_)
                | Error::Kube(_)
                | Error::CredentialsRead { .. }
                | Error::CredentialsParse { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_rejects_missing_and_blank() {
        let blank = "  ".to_string();
        assert!(matches!(
            None::<&String>.require("targetPortal"),
            Err(Error::MissingParameter("targetPortal"))
        ));
        assert!(matches!(
            Some(&blank).require("targetPortal"),
            Err(Error::MissingParameter("targetPortal"))
        ));
    }

    #[test]
    fn require_trims_value() {
        let value = " 10.0.0.1:3260 ".to_string();
        assert_eq!(Some(&value).require("targetPortal").unwrap(), "10.0.0.1:3260");
    }

    #[test]
    fn target_api_error_is_transparent() {
        let err: Error = TargetApiError::Rejected {
            operation: "delete target",
            status: 404,
            message: "no such target".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "delete target rejected by target api (status 404): no such target"
        );
        assert!(!err.is_validation());
    }

    #[test]
    fn access_mode_error_lists_modes() {
        let err = Error::UnsupportedAccessMode {
            requested: vec!["ReadWriteMany".to_string()],
            supported: &["ReadWriteOnce", "ReadOnlyMany"],
        };
        let message = err.to_string();
        assert!(message.contains("ReadWriteMany"));
        assert!(message.contains("ReadOnlyMany"));
        assert!(err.is_validation());
    }
}
