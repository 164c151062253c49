//! Tunnel lifecycle orchestration
//!
//! Composes API calls into idempotent create / start / stop / delete
//! sequences. Every operation converges on the same cloud state when
//! re-run; `start_tunnel` is a compensating transaction that rolls back
//! partially created cloud resources in reverse order before re-raising
//! the original failure.

use crate::config::{Protocol, TunnelConfig};
use crate::error::ServiceError;
use crate::loopback::resolve_loopback;
use crate::pid_registry::PidRegistry;
use serde_json::json;
use tracing::{info, warn};
use tuinnel_api::{account_id, ApiClient, ApiOutcome, DnsRecord, Tunnel, Zone};
use tuinnel_connector::{terminate_pid, BinaryManager, ConnectorProcess, SpawnOptions};

/// Provider-side tunnel names carry a stable prefix; the local name is
/// stored without it
pub const TUNNEL_NAME_PREFIX: &str = "tuinnel-";

/// CNAME records point the public hostname at this per-tunnel target
const TUNNEL_CNAME_SUFFIX: &str = ".cfargotunnel.com";

pub fn provider_tunnel_name(name: &str) -> String {
    format!("{TUNNEL_NAME_PREFIX}{name}")
}

fn dns_target(tunnel_id: &str) -> String {
    format!("{tunnel_id}{TUNNEL_CNAME_SUFFIX}")
}

/// Result of tunnel creation or recovery
#[derive(Debug, Clone)]
pub struct TunnelCredentials {
    pub tunnel_id: String,
    pub connector_token: String,
    /// False when an existing tunnel was recovered from a name conflict
    pub created: bool,
}

/// Result of DNS reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsOutcome {
    pub record_id: String,
    pub created: bool,
    /// The old CNAME target when an existing record had to be rewritten
    pub conflict: Option<String>,
}

/// Everything `start_tunnel` produced
#[derive(Debug)]
pub struct StartedTunnel {
    pub tunnel_id: String,
    pub connector_token: String,
    pub dns_record_id: String,
    pub dns_zone_id: String,
    pub process: ConnectorProcess,
    pub public_url: String,
}

/// Cloud resource ids needed for a clean stop
#[derive(Debug, Clone, Default)]
pub struct CleanupInfo {
    pub tunnel_id: Option<String>,
    pub dns_zone_id: Option<String>,
    pub dns_record_id: Option<String>,
}

/// Create the named tunnel, or recover the existing one on a name conflict,
/// and fetch its connector token.
pub async fn create_or_get_tunnel(
    api: &ApiClient,
    account_id: &str,
    name: &str,
) -> Result<TunnelCredentials, ServiceError> {
    let provider_name = provider_tunnel_name(name);
    let endpoint = format!("/accounts/{account_id}/cfd_tunnel");

    let outcome = api
        .post::<Tunnel>(
            &endpoint,
            json!({ "name": provider_name, "config_src": "cloudflare" }),
        )
        .await?;

    let (tunnel_id, created) = match outcome {
        ApiOutcome::Success { result, .. } => (result.id.to_string(), true),
        ApiOutcome::Recoverable { .. } => {
            info!("tunnel {} already exists, recovering it", provider_name);
            let tunnels: Vec<Tunnel> = api
                .get(
                    &endpoint,
                    &[
                        ("name", provider_name.clone()),
                        ("is_deleted", "false".to_string()),
                    ],
                )
                .await?
                .into_result()?;
            let tunnel = tunnels
                .into_iter()
                .find(|t| t.name == provider_name)
                .ok_or_else(|| ServiceError::TunnelLookup(name.to_string()))?;
            (tunnel.id.to_string(), false)
        }
    };

    let connector_token: String = api
        .get(&format!("{endpoint}/{tunnel_id}/token"), &[])
        .await?
        .into_result()?;

    Ok(TunnelCredentials {
        tunnel_id,
        connector_token,
        created,
    })
}

/// Re-apply the ingress configuration: the hostname rule followed by the
/// catch-all. Always submitted in full so drift heals on every start.
pub async fn update_ingress(
    api: &ApiClient,
    account_id: &str,
    tunnel_id: &str,
    hostname: &str,
    port: u16,
    protocol: Protocol,
    loopback: &str,
) -> Result<(), ServiceError> {
    let mut origin_request = json!({ "httpHostHeader": format!("localhost:{port}") });
    if protocol == Protocol::Https {
        // Local dev certs never match the public hostname
        origin_request["noTLSVerify"] = json!(true);
    }

    let body = json!({
        "config": {
            "ingress": [
                {
                    "hostname": hostname,
                    "service": format!("{protocol}://{loopback}:{port}"),
                    "originRequest": origin_request,
                },
                { "service": "http_status:404" },
            ]
        }
    });

    api.put::<serde_json::Value>(
        &format!("/accounts/{account_id}/cfd_tunnel/{tunnel_id}/configurations"),
        body,
    )
    .await?
    .into_result()?;
    Ok(())
}

/// Point `hostname` at the tunnel: no-op when an identical CNAME exists,
/// rewrite a differing one, create otherwise.
pub async fn create_or_verify_dns(
    api: &ApiClient,
    zone_id: &str,
    hostname: &str,
    tunnel_id: &str,
) -> Result<DnsOutcome, ServiceError> {
    let target = dns_target(tunnel_id);
    let endpoint = format!("/zones/{zone_id}/dns_records");
    let filter = [
        ("type", "CNAME".to_string()),
        ("name", hostname.to_string()),
    ];

    let existing: Vec<DnsRecord> = api.paginate(&endpoint, &filter).collect_all().await?;

    let body = json!({
        "type": "CNAME",
        "name": hostname,
        "content": target,
        "proxied": true,
        "ttl": 1,
    });

    if let Some(record) = existing.first() {
        if record.content == target {
            return Ok(DnsOutcome {
                record_id: record.id.clone(),
                created: false,
                conflict: None,
            });
        }

        warn!(
            "CNAME {} points at {}, rewriting to {}",
            hostname, record.content, target
        );
        let updated: DnsRecord = api
            .put(&format!("{endpoint}/{}", record.id), body)
            .await?
            .into_result()?;
        return Ok(DnsOutcome {
            record_id: updated.id,
            created: false,
            conflict: Some(record.content.clone()),
        });
    }

    match api.post::<DnsRecord>(&endpoint, body).await? {
        ApiOutcome::Success { result, .. } => Ok(DnsOutcome {
            record_id: result.id,
            created: true,
            conflict: None,
        }),
        ApiOutcome::Recoverable { .. } => {
            // Created by someone else between our list and our create;
            // re-read and treat the record as already reconciled
            let refetched: Vec<DnsRecord> = api.paginate(&endpoint, &filter).collect_all().await?;
            let record = refetched
                .into_iter()
                .next()
                .ok_or_else(|| ServiceError::DnsLookup(hostname.to_string()))?;
            Ok(DnsOutcome {
                record_id: record.id,
                created: false,
                conflict: None,
            })
        }
    }
}

/// Cloud resources created so far, for reverse-order rollback. Only
/// resources this start actually created are recorded; pre-existing ones
/// survive a failed start.
#[derive(Default)]
struct Compensation {
    pid: Option<u32>,
    dns_record: Option<(String, String)>,
    tunnel_id: Option<String>,
}

/// The compensating transaction behind `tuinnel up`
pub async fn start_tunnel(
    api: &ApiClient,
    binary: &BinaryManager,
    registry: &PidRegistry,
    name: &str,
    cfg: &TunnelConfig,
    opts: &SpawnOptions,
) -> Result<StartedTunnel, ServiceError> {
    let account = account_id(api).await?;

    let zones: Vec<Zone> = api.paginate("/zones", &[]).collect_all().await?;
    let zone = zones
        .iter()
        .find(|z| z.name == cfg.zone)
        .ok_or_else(|| ServiceError::ZoneNotFound {
            zone: cfg.zone.clone(),
            available: zones.iter().map(|z| z.name.clone()).collect(),
        })?
        .clone();

    let hostname = cfg.hostname();
    let public_url = cfg.public_url();
    let loopback = resolve_loopback(cfg.port).await;

    let mut comp = Compensation::default();
    let result = run_start_steps(
        api, binary, registry, name, cfg, opts, &account, &zone, &hostname, loopback, &public_url,
        &mut comp,
    )
    .await;

    match result {
        Ok(started) => Ok(started),
        Err(err) => {
            let failures = rollback(api, &account, &mut comp).await;
            if !failures.is_empty() {
                warn!(
                    "cleanup after failed start of {} was incomplete ({}); \
                     run `tuinnel purge {}` to remove leftover cloud resources",
                    name,
                    failures.join("; "),
                    name
                );
            }
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_start_steps(
    api: &ApiClient,
    binary: &BinaryManager,
    registry: &PidRegistry,
    name: &str,
    cfg: &TunnelConfig,
    opts: &SpawnOptions,
    account: &str,
    zone: &Zone,
    hostname: &str,
    loopback: &str,
    public_url: &str,
    comp: &mut Compensation,
) -> Result<StartedTunnel, ServiceError> {
    let creds = create_or_get_tunnel(api, account, name).await?;
    if creds.created {
        comp.tunnel_id = Some(creds.tunnel_id.clone());
    }

    update_ingress(
        api,
        account,
        &creds.tunnel_id,
        hostname,
        cfg.port,
        cfg.protocol,
        loopback,
    )
    .await?;

    let dns = create_or_verify_dns(api, &zone.id, hostname, &creds.tunnel_id).await?;
    if dns.created {
        comp.dns_record = Some((zone.id.clone(), dns.record_id.clone()));
    }

    let binary_path = binary.ensure(None).await?;
    let process = ConnectorProcess::spawn(&binary_path, &creds.connector_token, opts).await?;
    comp.pid = Some(process.pid());

    registry.record(name, process.pid())?;

    Ok(StartedTunnel {
        tunnel_id: creds.tunnel_id,
        connector_token: creds.connector_token,
        dns_record_id: dns.record_id,
        dns_zone_id: zone.id.clone(),
        process,
        public_url: public_url.to_string(),
    })
}

/// Best-effort cleanup in reverse creation order. Failures are collected,
/// never raised: the original start error is what the user sees.
async fn rollback(api: &ApiClient, account: &str, comp: &mut Compensation) -> Vec<String> {
    let mut failures = Vec::new();

    if let Some(pid) = comp.pid.take() {
        terminate_pid(pid).await;
    }

    if let Some((zone_id, record_id)) = comp.dns_record.take() {
        if let Err(err) = delete_dns_record(api, &zone_id, &record_id).await {
            failures.push(format!("delete DNS record {record_id}: {err}"));
        }
    }

    if let Some(tunnel_id) = comp.tunnel_id.take() {
        if let Err(err) = delete_provider_tunnel(api, account, &tunnel_id).await {
            failures.push(format!("delete tunnel {tunnel_id}: {err}"));
        }
    }

    failures
}

async fn delete_dns_record(
    api: &ApiClient,
    zone_id: &str,
    record_id: &str,
) -> Result<(), ServiceError> {
    api.delete::<serde_json::Value>(&format!("/zones/{zone_id}/dns_records/{record_id}"))
        .await?
        .into_result()?;
    Ok(())
}

async fn delete_provider_tunnel(
    api: &ApiClient,
    account: &str,
    tunnel_id: &str,
) -> Result<(), ServiceError> {
    api.delete::<serde_json::Value>(&format!("/accounts/{account}/cfd_tunnel/{tunnel_id}"))
        .await?
        .into_result()?;
    Ok(())
}

/// How to reach the connector being stopped
pub enum StopTarget<'a> {
    /// A child this process spawned and still supervises
    Owned(&'a ConnectorProcess),
    /// A pid adopted from the registry; the spawning process is gone
    Detached(u32),
}

/// Kill the connector and drop its registry entry. With `clean`, also
/// delete the DNS record and the tunnel; those failures are logged, not
/// raised.
pub async fn stop_tunnel(
    api: &ApiClient,
    registry: &PidRegistry,
    name: &str,
    target: StopTarget<'_>,
    clean: bool,
    cleanup: Option<&CleanupInfo>,
) -> Result<(), ServiceError> {
    match target {
        StopTarget::Owned(process) => process.kill().await,
        StopTarget::Detached(pid) => {
            terminate_pid(pid).await;
        }
    }

    registry.remove(name)?;

    if clean {
        if let Some(info) = cleanup {
            if let (Some(zone_id), Some(record_id)) = (&info.dns_zone_id, &info.dns_record_id) {
                if let Err(err) = delete_dns_record(api, zone_id, record_id).await {
                    warn!("could not delete DNS record for {}: {}", name, err);
                }
            }
            if let Some(tunnel_id) = &info.tunnel_id {
                match account_id(api).await {
                    Ok(account) => {
                        if let Err(err) = delete_provider_tunnel(api, &account, tunnel_id).await {
                            warn!("could not delete tunnel for {}: {}", name, err);
                        }
                    }
                    Err(err) => warn!("could not resolve account for cleanup: {}", err),
                }
            }
        }
    }

    Ok(())
}

/// Find and delete every cloud resource belonging to a tunnel name: the
/// CNAME pointing at a `cfargotunnel.com` target and the provider tunnel.
/// Returns a description of each action taken.
pub async fn purge_cloud_resources(
    api: &ApiClient,
    name: &str,
    cfg: &TunnelConfig,
) -> Result<Vec<String>, ServiceError> {
    let account = account_id(api).await?;
    let mut actions = Vec::new();

    let zones: Vec<Zone> = api.paginate("/zones", &[]).collect_all().await?;
    if let Some(zone) = zones.iter().find(|z| z.name == cfg.zone) {
        let hostname = cfg.hostname();
        let records: Vec<DnsRecord> = api
            .paginate(
                &format!("/zones/{}/dns_records", zone.id),
                &[
                    ("type", "CNAME".to_string()),
                    ("name", hostname.clone()),
                ],
            )
            .collect_all()
            .await?;
        for record in records
            .iter()
            .filter(|r| r.content.ends_with(TUNNEL_CNAME_SUFFIX))
        {
            delete_dns_record(api, &zone.id, &record.id).await?;
            actions.push(format!("deleted DNS record {} -> {}", hostname, record.content));
        }
    }

    let provider_name = provider_tunnel_name(name);
    let tunnels: Vec<Tunnel> = api
        .paginate(
            &format!("/accounts/{account}/cfd_tunnel"),
            &[
                ("name", provider_name.clone()),
                ("is_deleted", "false".to_string()),
            ],
        )
        .collect_all()
        .await?;
    for tunnel in tunnels.iter().filter(|t| t.name == provider_name) {
        delete_provider_tunnel(api, &account, &tunnel.id.to_string()).await?;
        actions.push(format!("deleted tunnel {} ({})", provider_name, tunnel.id));
    }

    Ok(actions)
}
