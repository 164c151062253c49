//! Parsing of cloudflared's structured stderr
//!
//! Lines look like `<RFC3339-Z> <LVL> <message...> [k=v]...`. Parsing is
//! stateless; the extractors below pull specific signals (registration,
//! metrics address, quick-tunnel URL) out of individual lines.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// cloudflared's five log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "DBG" => Some(LogLevel::Debug),
            "INF" => Some(LogLevel::Info),
            "WRN" => Some(LogLevel::Warn),
            "ERR" => Some(LogLevel::Error),
            "FTL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            LogLevel::Debug => "DBG",
            LogLevel::Info => "INF",
            LogLevel::Warn => "WRN",
            LogLevel::Error => "ERR",
            LogLevel::Fatal => "FTL",
        };
        write!(f, "{token}")
    }
}

/// One parsed stderr line
#[derive(Debug, Clone)]
pub struct ParsedLogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Message text with the trailing `k=v` pairs removed
    pub message: String,
    /// All `k=v` pairs found on the line
    pub fields: HashMap<String, String>,
}

/// A tunnel registration event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub conn_index: u8,
    pub connection_id: String,
    pub edge_ip: String,
    pub location: String,
    pub protocol: String,
}

static KEY_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*=\S+$").unwrap());

static METRICS_ADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Starting metrics server on ((?:\d{1,3}\.){3}\d{1,3}:\d+)/metrics").unwrap()
});

static REGISTRATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"connIndex=(\d+) connection=(\S+) event=(\S+) ip=(\S+) location=(\S+) protocol=(\S+)",
    )
    .unwrap()
});

static QUICK_TUNNEL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://[a-z]+-[a-z]+-[a-z]+-[a-z]+\.trycloudflare\.com").unwrap()
});

static VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"Version (\S+)").unwrap());

static CONNECTOR_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Generated Connector ID: (\S+)").unwrap());

/// Parse one stderr line; returns `None` for anything off-format
pub fn parse_line(line: &str) -> Option<ParsedLogLine> {
    let mut tokens = line.split_whitespace();
    let timestamp = DateTime::parse_from_rfc3339(tokens.next()?)
        .ok()?
        .with_timezone(&Utc);
    let level = LogLevel::from_token(tokens.next()?)?;

    let rest: Vec<&str> = tokens.collect();
    let first_kv = rest
        .iter()
        .position(|token| KEY_VALUE.is_match(token))
        .unwrap_or(rest.len());

    let message = rest[..first_kv].join(" ");
    let fields = rest
        .iter()
        .filter(|token| KEY_VALUE.is_match(token))
        .filter_map(|token| {
            let (key, value) = token.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect();

    Some(ParsedLogLine {
        timestamp,
        level,
        message,
        fields,
    })
}

/// `Starting metrics server on <ipv4:port>/metrics` -> `"ip:port"`.
/// IPv6 metrics listeners are not supported.
pub fn extract_metrics_addr(line: &str) -> Option<String> {
    METRICS_ADDR
        .captures(line)
        .map(|caps| caps[1].to_string())
}

/// A registration line carries all six fields, in order
pub fn extract_registration(line: &str) -> Option<Registration> {
    let caps = REGISTRATION.captures(line)?;
    Some(Registration {
        conn_index: caps[1].parse().ok()?,
        connection_id: caps[2].to_string(),
        edge_ip: caps[4].to_string(),
        location: caps[5].to_string(),
        protocol: caps[6].to_string(),
    })
}

/// The ephemeral `https://<four-words>.trycloudflare.com` hostname
pub fn extract_quick_tunnel_url(line: &str) -> Option<String> {
    QUICK_TUNNEL_URL
        .find(line)
        .map(|m| m.as_str().to_string())
}

/// `Version <token>`
pub fn extract_version(line: &str) -> Option<String> {
    VERSION.captures(line).map(|caps| caps[1].to_string())
}

/// `Generated Connector ID: <token>`
pub fn extract_connector_id(line: &str) -> Option<String> {
    CONNECTOR_ID.captures(line).map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRATION_LINE: &str = "2024-03-07T09:15:02Z INF Registered tunnel connection \
        connIndex=0 connection=7f3a2b9c-11d4-4e5f-9c2d-0a1b2c3d4e5f event=0 \
        ip=198.41.200.23 location=ams01 protocol=quic";

    #[test]
    fn parses_level_message_and_fields() {
        let parsed = parse_line(REGISTRATION_LINE).unwrap();
        assert_eq!(parsed.level, LogLevel::Info);
        assert_eq!(parsed.message, "Registered tunnel connection");
        assert_eq!(parsed.fields.len(), 6);
        assert_eq!(parsed.fields["location"], "ams01");
        assert_eq!(parsed.timestamp.to_rfc3339(), "2024-03-07T09:15:02+00:00");
    }

    #[test]
    fn rejects_lines_without_level_or_timestamp() {
        assert!(parse_line("not a log line").is_none());
        assert!(parse_line("2024-03-07T09:15:02Z TRACE message").is_none());
        assert!(parse_line("yesterday INF message").is_none());
    }

    #[test]
    fn message_without_fields_is_kept_whole() {
        let parsed =
            parse_line("2024-03-07T09:15:02Z WRN Cannot determine default origin certificate path")
                .unwrap();
        assert_eq!(parsed.level, LogLevel::Warn);
        assert!(parsed.fields.is_empty());
        assert_eq!(
            parsed.message,
            "Cannot determine default origin certificate path"
        );
    }

    #[test]
    fn extracts_registration_with_all_six_fields() {
        let reg = extract_registration(REGISTRATION_LINE).unwrap();
        assert_eq!(reg.conn_index, 0);
        assert_eq!(reg.connection_id, "7f3a2b9c-11d4-4e5f-9c2d-0a1b2c3d4e5f");
        assert_eq!(reg.edge_ip, "198.41.200.23");
        assert_eq!(reg.location, "ams01");
        assert_eq!(reg.protocol, "quic");
    }

    #[test]
    fn registration_requires_every_field_in_order() {
        // Missing the location field
        let line = "2024-03-07T09:15:02Z INF Registered tunnel connection \
            connIndex=0 connection=abc event=0 ip=198.41.200.23 protocol=quic";
        assert!(extract_registration(line).is_none());

        // Fields present but out of order
        let line = "2024-03-07T09:15:02Z INF Registered tunnel connection \
            connection=abc connIndex=0 event=0 ip=198.41.200.23 location=ams01 protocol=quic";
        assert!(extract_registration(line).is_none());
    }

    #[test]
    fn extracts_metrics_addr_ipv4_only() {
        let line = "2024-03-07T09:15:01Z INF Starting metrics server on 127.0.0.1:49123/metrics";
        assert_eq!(
            extract_metrics_addr(line),
            Some("127.0.0.1:49123".to_string())
        );
        assert!(extract_metrics_addr(
            "2024-03-07T09:15:01Z INF Starting metrics server on [::1]:49123/metrics"
        )
        .is_none());
    }

    #[test]
    fn extracts_quick_tunnel_url_of_exactly_four_words() {
        let line = "2024-03-07T09:15:03Z INF +  https://wet-noise-grows-louder.trycloudflare.com  +";
        assert_eq!(
            extract_quick_tunnel_url(line),
            Some("https://wet-noise-grows-louder.trycloudflare.com".to_string())
        );
        assert!(extract_quick_tunnel_url("https://too-few-words.trycloudflare.com").is_none());
    }

    #[test]
    fn extracts_version_and_connector_id() {
        assert_eq!(
            extract_version("2024-03-07T09:15:00Z INF Version 2024.2.1"),
            Some("2024.2.1".to_string())
        );
        assert_eq!(
            extract_connector_id(
                "2024-03-07T09:15:00Z INF Generated Connector ID: 1a2b3c4d-5e6f-7081-92a3-b4c5d6e7f809"
            ),
            Some("1a2b3c4d-5e6f-7081-92a3-b4c5d6e7f809".to_string())
        );
    }
}
