//! Service-layer errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Api(#[from] tuinnel_api::ApiError),

    #[error(transparent)]
    Connector(#[from] tuinnel_connector::ConnectorError),

    #[error("unsupported config schema version {0}; this build understands version 1")]
    UnsupportedConfigVersion(u32),

    #[error("no API token configured; set CLOUDFLARE_API_TOKEN or run `tuinnel token set <token>`")]
    MissingToken,

    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error(
        "invalid subdomain {0:?}: use a lowercase DNS label (letters, digits, hyphens, \
         at most 63 characters, not starting or ending with a hyphen)"
    )]
    InvalidSubdomain(String),

    #[error("no tunnel named {0:?} is configured; run `tuinnel list` to see configured tunnels")]
    UnknownTunnel(String),

    #[error("a tunnel named {0:?} already exists; pick another name or `tuinnel remove {0}` first")]
    DuplicateTunnel(String),

    #[error("tunnel {name:?} is already running (pid {pid}); `tuinnel down {name}` to stop it")]
    AlreadyRunning { name: String, pid: u32 },

    #[error(
        "zone {zone:?} is not reachable with this API token; available zones: {}",
        available.join(", ")
    )]
    ZoneNotFound {
        zone: String,
        available: Vec<String>,
    },

    #[error(
        "the provider reported tunnel {0:?} as existing but it could not be found; \
         `tuinnel purge {0}` may clear the stale resource"
    )]
    TunnelLookup(String),

    #[error(
        "the provider reported a DNS record for {0:?} as existing but it could not be found"
    )]
    DnsLookup(String),

    #[error("could not determine the home directory")]
    NoHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
