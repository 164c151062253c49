//! Per-tunnel runtime state
//!
//! One [`TunnelRuntime`] exists per configured tunnel. It is owned by the
//! service and mutated only there; everyone else receives [`TunnelSnapshot`]
//! clones.

use crate::config::TunnelConfig;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tuinnel_connector::log_parser::{extract_registration, ParsedLogLine};
use tuinnel_connector::LogLevel;

/// Bound on the per-tunnel connection event ring
pub const CONNECTION_LOG_CAP: usize = 1000;

/// Runtime state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Creating,
    Stopped,
    Connecting,
    Connected,
    Disconnected,
    Restarting,
    Error,
    PortDown,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TunnelState::Creating => "creating",
            TunnelState::Stopped => "stopped",
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
            TunnelState::Disconnected => "disconnected",
            TunnelState::Restarting => "restarting",
            TunnelState::Error => "error",
            TunnelState::PortDown => "port_down",
        };
        write!(f, "{name}")
    }
}

/// One parsed connector log line, kept in the runtime's bounded ring
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub conn_index: Option<u8>,
    pub connection_id: Option<String>,
    pub location: Option<String>,
    pub edge_ip: Option<String>,
    pub protocol: Option<String>,
}

impl ConnectionEvent {
    /// Build from a parsed log line, lifting the registration fields when
    /// the line carries them
    pub fn from_log_line(raw_line: &str, parsed: ParsedLogLine) -> Self {
        let registration = extract_registration(raw_line);
        Self {
            timestamp: parsed.timestamp,
            level: parsed.level,
            message: parsed.message,
            conn_index: registration.as_ref().map(|r| r.conn_index),
            connection_id: registration.as_ref().map(|r| r.connection_id.clone()),
            location: registration.as_ref().map(|r| r.location.clone()),
            edge_ip: registration.as_ref().map(|r| r.edge_ip.clone()),
            protocol: registration.map(|r| r.protocol),
        }
    }
}

/// Authoritative in-memory state of one tunnel
#[derive(Debug)]
pub struct TunnelRuntime {
    pub name: String,
    pub config: TunnelConfig,
    pub state: TunnelState,
    pub pid: Option<u32>,
    pub tunnel_id: Option<String>,
    pub public_url: String,
    pub connector_token: Option<String>,
    pub metrics_addr: Option<String>,
    /// DNS bookkeeping from the last successful start, used by clean stops
    pub dns_zone_id: Option<String>,
    pub dns_record_id: Option<String>,
    /// Millis since epoch; 0 iff not currently connected
    pub connected_at: u64,
    pub last_error: Option<String>,
    pub connections: VecDeque<ConnectionEvent>,
}

impl TunnelRuntime {
    pub fn new(name: impl Into<String>, config: TunnelConfig) -> Self {
        let public_url = config.public_url();
        Self {
            name: name.into(),
            config,
            state: TunnelState::Stopped,
            pid: None,
            tunnel_id: None,
            public_url,
            connector_token: None,
            metrics_addr: None,
            dns_zone_id: None,
            dns_record_id: None,
            connected_at: 0,
            last_error: None,
            connections: VecDeque::new(),
        }
    }

    /// Append to the bounded ring, dropping the oldest event past the cap
    pub fn push_event(&mut self, event: ConnectionEvent) {
        if self.connections.len() >= CONNECTION_LOG_CAP {
            self.connections.pop_front();
        }
        self.connections.push_back(event);
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        TunnelSnapshot {
            name: self.name.clone(),
            config: self.config.clone(),
            state: self.state,
            pid: self.pid,
            tunnel_id: self.tunnel_id.clone(),
            public_url: self.public_url.clone(),
            metrics_addr: self.metrics_addr.clone(),
            connected_at: self.connected_at,
            last_error: self.last_error.clone(),
            connections: self.connections.iter().cloned().collect(),
        }
    }
}

/// Immutable copy handed to observers
#[derive(Debug, Clone)]
pub struct TunnelSnapshot {
    pub name: String,
    pub config: TunnelConfig,
    pub state: TunnelState,
    pub pid: Option<u32>,
    pub tunnel_id: Option<String>,
    pub public_url: String,
    pub metrics_addr: Option<String>,
    pub connected_at: u64,
    pub last_error: Option<String>,
    pub connections: Vec<ConnectionEvent>,
}
