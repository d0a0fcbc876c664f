//! Session CHAP credentials pushed to the target for each allowed initiator.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use target_api::InitiatorAuth;

use crate::error::{Error, Result};

/// Credentials file contents.
///
/// ```toml
/// in_user = "initiator-user"
/// in_password = "initiator-secret"
/// # mutual CHAP, optional
/// out_user = "target-user"
/// out_password = "target-secret"
/// ```
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ChapCredentials {
    pub in_user: String,
    pub in_password: String,
    #[serde(default)]
    pub out_user: String,
    #[serde(default)]
    pub out_password: String,
}

impl ChapCredentials {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| Error::CredentialsRead {
            path: path.to_path_buf(),
            source,
        })?;
        let credentials: ChapCredentials =
            toml::from_str(&content).map_err(|source| Error::CredentialsParse {
                path: path.to_path_buf(),
                source,
            })?;
        credentials.validate()?;
        Ok(credentials)
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_user.is_empty() || self.in_password.is_empty() {
            return Err(Error::InvalidConfig {
                field: "session-chap-credential-file",
                reason: "in_user and in_password are required",
            });
        }
        if self.out_user.is_empty() != self.out_password.is_empty() {
            return Err(Error::InvalidConfig {
                field: "session-chap-credential-file",
                reason: "out_user and out_password must be set together",
            });
        }
        Ok(())
    }

    pub fn for_initiator(&self, initiator: &str) -> InitiatorAuth {
        InitiatorAuth {
            initiator: initiator.to_string(),
            in_user: self.in_user.clone(),
            in_password: self.in_password.clone(),
            out_user: self.out_user.clone(),
            out_password: self.out_password.clone(),
        }
    }
}

impl fmt::Debug for ChapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChapCredentials")
            .field("in_user", &self.in_user)
            .field("out_user", &self.out_user)
            .finish_non_exhaustive()
    }
}
