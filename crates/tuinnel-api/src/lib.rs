//! Cloudflare v4 REST client
//!
//! Typed request/response layer used by the orchestrator: bearer auth,
//! per-attempt timeouts, bounded retries, envelope validation, error
//! classification and lazy pagination.

pub mod account;
pub mod client;
pub mod error;
pub mod models;
pub mod pagination;

pub use account::{account_id, clear_cached_account_id};
pub use client::{ApiClient, ApiOutcome, DEFAULT_BASE_URL};
pub use error::{classify, validate_token_shape, ApiError, ErrorClass};
pub use models::{
    ApiErrorEntry, DnsRecord, Envelope, ResultInfo, Tunnel, TunnelConnection, Zone, ZoneAccount,
};
pub use pagination::Paginated;
