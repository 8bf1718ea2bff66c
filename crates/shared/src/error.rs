use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ApiErrorBody;

pub const CODE_AUTH_FAILED: u32 = 5;
pub const CODE_TOO_MANY_REQUESTS: u32 = 6;
pub const CODE_PERMISSION_DENIED: u32 = 7;
pub const CODE_FLOOD_CONTROL: u32 = 9;
pub const CODE_INTERNAL: u32 = 10;
pub const CODE_CAPTCHA_NEEDED: u32 = 14;
pub const CODE_ACCESS_DENIED: u32 = 15;
pub const CODE_USER_DEACTIVATED: u32 = 18;
pub const CODE_INVALID_USER_ID: u32 = 113;

/// Application codes that mean "nothing to return" rather than failure.
pub const SOFT_ERROR_CODES: [u32; 3] = [CODE_FLOOD_CONTROL, CODE_USER_DEACTIVATED, CODE_INVALID_USER_ID];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaChallenge {
    pub sid: String,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("rate limited by remote api")]
    RateLimited,
    #[error("captcha required (sid {})", .0.sid)]
    CaptchaRequired(CaptchaChallenge),
    #[error("credentials revoked: {0}")]
    CredentialsRevoked(String),
    #[error("credentials invalid: {0}")]
    CredentialsInvalid(String),
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("remote internal error: {0}")]
    InternalError(String),
    #[error("remote error {code}: {message}")]
    Unknown { code: u32, message: String },
}

impl RemoteError {
    /// Maps an application-level error body onto the taxonomy.
    ///
    /// Returns `None` for soft codes, which callers treat as an empty result.
    pub fn from_api(body: &ApiErrorBody) -> Option<Self> {
        let message = body.error_msg.clone();
        let error = match body.error_code {
            code if SOFT_ERROR_CODES.contains(&code) => return None,
            CODE_AUTH_FAILED if message.to_ascii_lowercase().contains("revoke") => {
                Self::CredentialsRevoked(message)
            }
            CODE_AUTH_FAILED => Self::CredentialsInvalid(message),
            CODE_TOO_MANY_REQUESTS => Self::RateLimited,
            CODE_CAPTCHA_NEEDED => Self::CaptchaRequired(CaptchaChallenge {
                sid: body.captcha_sid_string().unwrap_or_default(),
                image_url: body.captcha_img.clone().unwrap_or_default(),
                answer: None,
            }),
            CODE_PERMISSION_DENIED | CODE_ACCESS_DENIED => Self::NotAllowed(message),
            CODE_INTERNAL => Self::InternalError(message),
            code => Self::Unknown { code, message },
        };
        Some(error)
    }

    /// Fatal to the whole session: teardown, record deletion, unsubscribe.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            Self::CredentialsRevoked(_) | Self::CredentialsInvalid(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Internal,
}

/// Error body returned by the admin HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
