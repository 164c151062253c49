//! Tunnel orchestration engine
//!
//! The authoritative per-process view of every configured tunnel: the
//! lifecycle orchestrator that drives the provider API, the runtime state
//! hub shared by the UI and the command surface, the on-disk pid registry
//! guarding against concurrent instances, and the persisted configuration.

pub mod config;
pub mod error;
pub mod fs_util;
pub mod loopback;
pub mod orchestrator;
pub mod pid_registry;
pub mod runtime;
pub mod service;

pub use config::{ConfigStore, GlobalConfig, LastState, Protocol, TunnelConfig};
pub use error::ServiceError;
pub use loopback::resolve_loopback;
pub use orchestrator::{CleanupInfo, DnsOutcome, StartedTunnel, TunnelCredentials};
pub use pid_registry::{PidEntry, PidRegistry};
pub use runtime::{ConnectionEvent, TunnelSnapshot, TunnelState, CONNECTION_LOG_CAP};
pub use service::{AdoptedTunnel, TunnelEvent, TunnelPatch, TunnelService};
