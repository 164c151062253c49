//! Account-ID discovery
//!
//! The account identifier is recovered from the first zone visible to the
//! token and cached process-wide. Tests that exercise discovery must call
//! [`clear_cached_account_id`] first.

use crate::client::ApiClient;
use crate::error::ApiError;
use crate::models::Zone;
use std::sync::Mutex;
use tracing::debug;

static CACHED_ACCOUNT_ID: Mutex<Option<String>> = Mutex::new(None);

/// Resolve (and cache) the account id backing this token's zones
pub async fn account_id(client: &ApiClient) -> Result<String, ApiError> {
    if let Some(id) = CACHED_ACCOUNT_ID.lock().unwrap().clone() {
        return Ok(id);
    }

    let zones: Vec<Zone> = client
        .get("/zones", &[("per_page", "1".to_string())])
        .await?
        .into_result()?;

    let zone = zones.first().ok_or(ApiError::NoZones)?;
    let id = zone.account.id.clone();
    debug!("discovered account id {} via zone {}", id, zone.name);

    *CACHED_ACCOUNT_ID.lock().unwrap() = Some(id.clone());
    Ok(id)
}

/// Drop the cached account id (test isolation)
pub fn clear_cached_account_id() {
    *CACHED_ACCOUNT_ID.lock().unwrap() = None;
}
