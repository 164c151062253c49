//! API error types and classification

use crate::models::ApiErrorEntry;
use thiserror::Error;

/// URL shown in every remediation message about token problems
pub const TOKEN_DASHBOARD_URL: &str = "https://dash.cloudflare.com/profile/api-tokens";

/// Provider error code: invalid or expired credentials
const CODE_AUTH: i64 = 1003;
/// Provider error code: a tunnel with that name already exists
const CODE_TUNNEL_NAME_CONFLICT: i64 = 9109;
/// Provider error code: a DNS record with that name already exists
const CODE_DNS_RECORD_CONFLICT: i64 = 81053;

/// How an API failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Not worth retrying; surface to the user with remediation
    Fatal,
    /// The conflicting resource can be fetched and reused
    Recoverable,
    /// Retry may succeed (rate limit, server error, network)
    Transient,
}

/// Classify a failed response from its HTTP status and error list.
///
/// The HTTP status dominates: when the status is one of the explicitly
/// mapped values, the error-code scan cannot change the verdict.
pub fn classify(status: u16, errors: &[ApiErrorEntry]) -> ErrorClass {
    match status {
        401 | 403 => return ErrorClass::Fatal,
        409 => return ErrorClass::Recoverable,
        429 => return ErrorClass::Transient,
        s if s >= 500 => return ErrorClass::Transient,
        _ => {}
    }

    for entry in errors {
        match entry.code {
            CODE_AUTH => return ErrorClass::Fatal,
            CODE_TUNNEL_NAME_CONFLICT | CODE_DNS_RECORD_CONFLICT => {
                return ErrorClass::Recoverable
            }
            _ => {}
        }
    }

    ErrorClass::Fatal
}

/// Errors raised by the API client
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(
        "Cloudflare rejected the API token (HTTP {status}): {message}\n\
         The token needs Account:Cloudflare Tunnel:Edit, Zone:Zone:Read and Zone:DNS:Edit.\n\
         Manage tokens at {TOKEN_DASHBOARD_URL}"
    )]
    Auth { status: u16, message: String },

    #[error("Cloudflare API request failed (HTTP {status}): {message}")]
    Provider {
        status: u16,
        message: String,
        errors: Vec<ApiErrorEntry>,
    },

    #[error("Cloudflare API response did not match the expected schema (HTTP {status}): {detail}")]
    Schema { status: u16, detail: String },

    #[error("network error talking to the Cloudflare API: {0}")]
    Network(#[from] reqwest::Error),

    #[error(
        "no zones are visible to this API token; it needs at least Zone:Zone:Read on one zone.\n\
         Manage tokens at {TOKEN_DASHBOARD_URL}"
    )]
    NoZones,

    #[error("{0}")]
    InvalidToken(String),
}

impl ApiError {
    /// Build the raised error for a failed envelope, picking the Auth variant
    /// when the failure is credential-shaped.
    pub(crate) fn from_envelope(status: u16, errors: Vec<ApiErrorEntry>) -> Self {
        let message = if errors.is_empty() {
            format!("request failed with HTTP {status}")
        } else {
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };

        let auth_shaped =
            status == 401 || status == 403 || errors.iter().any(|e| e.code == CODE_AUTH);
        if auth_shaped {
            ApiError::Auth { status, message }
        } else {
            ApiError::Provider {
                status,
                message,
                errors,
            }
        }
    }
}

/// Reject a Global API Key passed where a scoped token is required.
///
/// Global keys are exactly 37 hex characters; scoped tokens are longer and
/// mix cases.
pub fn validate_token_shape(token: &str) -> Result<(), ApiError> {
    let token = token.trim();
    if token.len() == 37 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ApiError::InvalidToken(format!(
            "this looks like a Global API Key, not an API token; tuinnel requires a scoped \
             API token. Create one at {TOKEN_DASHBOARD_URL}"
        )));
    }
    Ok(())
}
