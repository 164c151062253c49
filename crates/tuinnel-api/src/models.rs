//! Wire types for the Cloudflare v4 API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response envelope wrapping every v4 API payload
///
/// `result` stays untyped here; the client deserializes it into the caller's
/// type only after the envelope itself has validated.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiErrorEntry>,
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
    #[serde(default = "default_null")]
    pub result: serde_json::Value,
    pub result_info: Option<ResultInfo>,
}

fn default_null() -> serde_json::Value {
    serde_json::Value::Null
}

/// One entry of the envelope's `errors` array
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiErrorEntry {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for ApiErrorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Pagination metadata (`result_info`)
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ResultInfo {
    pub page: u32,
    pub per_page: u32,
    pub count: u32,
    pub total_count: Option<u32>,
    pub total_pages: Option<u32>,
}

/// A DNS zone
#[derive(Debug, Clone, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub account: ZoneAccount,
}

/// Account reference embedded in a zone listing
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneAccount {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A named tunnel (`cfd_tunnel` resource)
#[derive(Debug, Clone, Deserialize)]
pub struct Tunnel {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connections: Vec<TunnelConnection>,
}

/// An edge connection reported on a tunnel resource
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConnection {
    #[serde(default)]
    pub colo_name: Option<String>,
    #[serde(default)]
    pub is_pending_reconnect: Option<bool>,
}

/// A DNS record
#[derive(Debug, Clone, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub proxied: bool,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

fn default_ttl() -> u32 {
    1
}
