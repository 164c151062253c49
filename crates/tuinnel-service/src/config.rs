//! Persisted configuration
//!
//! One JSON file at `~/.tuinnel/config.json`, schema version 1, mode 0600,
//! written atomically. Unknown top-level fields are dropped on read; an
//! unknown schema version is fatal.

use crate::error::ServiceError;
use crate::fs_util::{data_dir, write_atomic};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const CONFIG_VERSION: u32 = 1;

const CONFIG_FILE: &str = "config.json";

/// Origin protocol of a tunnelled service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// Last observed runtime state, persisted so `autostart` can resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastState {
    Running,
    Stopped,
}

/// One tunnel's persisted configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub port: u16,
    pub subdomain: String,
    pub zone: String,
    pub protocol: Protocol,
    #[serde(rename = "lastState", skip_serializing_if = "Option::is_none", default)]
    pub last_state: Option<LastState>,
    #[serde(rename = "tunnelId", skip_serializing_if = "Option::is_none", default)]
    pub tunnel_id: Option<String>,
}

impl TunnelConfig {
    /// The public hostname this tunnel serves
    pub fn hostname(&self) -> String {
        format!("{}.{}", self.subdomain, self.zone)
    }

    /// The public URL (tunnels always terminate TLS at the edge)
    pub fn public_url(&self) -> String {
        format!("https://{}", self.hostname())
    }
}

/// The whole config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub version: u32,
    #[serde(rename = "apiToken", skip_serializing_if = "Option::is_none", default)]
    pub api_token: Option<String>,
    #[serde(rename = "defaultZone", skip_serializing_if = "Option::is_none", default)]
    pub default_zone: Option<String>,
    #[serde(default)]
    pub tunnels: BTreeMap<String, TunnelConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            api_token: None,
            default_zone: None,
            tunnels: BTreeMap::new(),
        }
    }
}

/// Loads and saves the config file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new() -> Result<Self, ServiceError> {
        Ok(Self {
            path: data_dir()?.join(CONFIG_FILE),
        })
    }

    /// Custom location (tests)
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<GlobalConfig, ServiceError> {
        if !self.path.exists() {
            return Ok(GlobalConfig::default());
        }

        let json = std::fs::read_to_string(&self.path)?;
        let config: GlobalConfig =
            serde_json::from_str(&json).map_err(|source| ServiceError::Parse {
                path: self.path.display().to_string(),
                source,
            })?;

        if config.version != CONFIG_VERSION {
            return Err(ServiceError::UnsupportedConfigVersion(config.version));
        }

        Ok(config)
    }

    pub fn save(&self, config: &GlobalConfig) -> Result<(), ServiceError> {
        let json = serde_json::to_string_pretty(config).map_err(|source| ServiceError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;
        write_atomic(&self.path, json.as_bytes())
    }

    /// Read-modify-write helper
    pub fn update<F>(&self, mutate: F) -> Result<GlobalConfig, ServiceError>
    where
        F: FnOnce(&mut GlobalConfig),
    {
        let mut config = self.load()?;
        mutate(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}

/// Resolve the API token: environment overrides the config file, and a
/// Global API Key is rejected as the wrong credential type.
pub fn resolve_api_token(config: &GlobalConfig) -> Result<String, ServiceError> {
    let token = std::env::var("CLOUDFLARE_API_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
        .or_else(|| std::env::var("TUINNEL_API_TOKEN").ok().filter(|t| !t.is_empty()))
        .or_else(|| config.api_token.clone())
        .ok_or(ServiceError::MissingToken)?;

    tuinnel_api::validate_token_shape(&token)?;
    Ok(token)
}

/// Ports are a 1..=65535 range; the type already excludes greater values
pub fn validate_port(port: u16) -> Result<(), ServiceError> {
    if port == 0 {
        return Err(ServiceError::InvalidPort);
    }
    Ok(())
}

/// Subdomains must be a single lowercase RFC-1123 label
pub fn validate_subdomain(subdomain: &str) -> Result<(), ServiceError> {
    let valid = !subdomain.is_empty()
        && subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(ServiceError::InvalidSubdomain(subdomain.to_string()));
    }
    Ok(())
}
