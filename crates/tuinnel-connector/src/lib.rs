//! cloudflared connector plumbing
//!
//! Everything between the orchestrator and the vendor connector binary:
//! downloading and verifying the binary, spawning and supervising the child
//! process, parsing its structured stderr, and scraping its metrics endpoint.

pub mod binary;
pub mod error;
pub mod log_parser;
pub mod metrics;
pub mod supervisor;

pub use binary::BinaryManager;
pub use error::ConnectorError;
pub use log_parser::{LogLevel, ParsedLogLine, Registration};
pub use metrics::{LatencyPercentiles, MetricsScraper, QuicRtt, TunnelMetrics};
pub use supervisor::{pid_is_alive, terminate_pid, ConnectorProcess, ExitInfo, SpawnOptions};
