//! C4: credential schemes the HTTP command layer can attach to a request.
//!
//! Each scheme is a distinct module rather than one sprawling match on
//! strings, the same way the wire layer keeps TLS and plaintext as
//! separate types behind `Conn` instead of one struct with optional
//! fields for each.

pub mod basic;
pub mod digest;
pub mod sigv4;

use serde::Deserialize;

use crate::config::HostConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    None,
    Basic,
    Digest,
    #[serde(rename = "aws_sigv4")]
    AwsSigV4,
}

impl Default for AuthType {
    fn default() -> Self {
        AuthType::None
    }
}

/// Per-connection authentication state. `Digest` carries challenge state
/// that must survive from a 401 response to the retried request, and from
/// one request to the next while the server keeps issuing `nextnonce`.
pub enum AuthState {
    None,
    Basic { user: String, password: String },
    Digest(digest::DigestState),
    AwsSigV4(sigv4::SigningContext),
}

impl AuthState {
    pub fn new(config: &HostConfig) -> Result<AuthState> {
        match config.auth_type {
            AuthType::None => Ok(AuthState::None),
            AuthType::Basic => {
                let user = config.user.clone().ok_or(Error::AuthProtocol)?;
                let password = config.password.clone().ok_or(Error::AuthProtocol)?;
                Ok(AuthState::Basic { user, password })
            }
            AuthType::Digest => {
                let user = config.user.clone().ok_or(Error::AuthProtocol)?;
                let password = config.password.clone().ok_or(Error::AuthProtocol)?;
                Ok(AuthState::Digest(digest::DigestState::new(user, password)))
            }
            AuthType::AwsSigV4 => {
                let access_key = config.aws_access_key_id.clone().ok_or(Error::AuthProtocol)?;
                let secret_key = config.aws_secret_access_key.clone().ok_or(Error::AuthProtocol)?;
                Ok(AuthState::AwsSigV4(sigv4::SigningContext::new(
                    access_key,
                    secret_key,
                    config.region.clone(),
                    config.service.clone(),
                    config.sigv4_listing_version,
                )))
            }
        }
    }

    /// True once we have a scheme that can preemptively attach a header
    /// to a request without waiting for a 401 challenge first.
    pub fn can_preempt(&self) -> bool {
        matches!(self, AuthState::Basic { .. } | AuthState::AwsSigV4(_))
            || matches!(self, AuthState::Digest(d) if d.has_challenge())
    }
}
