//! tuinnel - expose local ports through Cloudflare tunnels

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use tuinnel_connector::{log_parser, BinaryManager, ConnectorProcess, SpawnOptions};
use tuinnel_service::config::{resolve_api_token, validate_port, validate_subdomain};
use tuinnel_service::{
    orchestrator, resolve_loopback, ConfigStore, PidRegistry, Protocol, TunnelConfig,
    TunnelService, TunnelState,
};

/// How long `up` waits for the first edge registration
const CONNECT_WAIT: Duration = Duration::from_secs(45);

/// tuinnel - expose local ports through Cloudflare tunnels
#[derive(Parser, Debug)]
#[command(name = "tuinnel")]
#[command(about = "Expose local ports through Cloudflare tunnels", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a new tunnel configuration
    Add {
        /// Tunnel name (also the default subdomain)
        name: String,
        /// Local port to expose
        #[arg(short, long)]
        port: u16,
        /// DNS zone the hostname lives under (defaults to the configured default zone)
        #[arg(short, long)]
        zone: Option<String>,
        /// Subdomain (defaults to the tunnel name)
        #[arg(short, long)]
        subdomain: Option<String>,
        /// Origin protocol (http, https)
        #[arg(long, default_value = "http")]
        protocol: String,
    },
    /// Change a tunnel's configuration
    Edit {
        /// Tunnel name
        name: String,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        zone: Option<String>,
        #[arg(short, long)]
        subdomain: Option<String>,
        #[arg(long)]
        protocol: Option<String>,
    },
    /// Remove a tunnel configuration and its cloud resources
    Remove {
        /// Tunnel name
        name: String,
        /// Leave the provider tunnel and DNS record in place
        #[arg(long)]
        keep_cloud: bool,
    },
    /// List configured tunnels
    List,
    /// Show tunnel status
    Status {
        /// Tunnel name (all tunnels when omitted)
        name: Option<String>,
    },
    /// Start tunnels and leave their connectors running
    Up {
        /// Tunnel names
        names: Vec<String>,
        /// Start every configured tunnel
        #[arg(long)]
        all: bool,
        /// Stay in the foreground supervising the tunnels; Ctrl-C stops them
        #[arg(long)]
        watch: bool,
    },
    /// Stop running tunnels
    Down {
        /// Tunnel names
        names: Vec<String>,
        /// Stop every running tunnel
        #[arg(long)]
        all: bool,
        /// Also delete the DNS record and the provider tunnel
        #[arg(long)]
        clean: bool,
    },
    /// Open an ephemeral trycloudflare tunnel to a local port
    Quick {
        /// Local port to expose
        port: u16,
    },
    /// Delete leftover cloud resources of a tunnel (after a failed start)
    Purge {
        /// Tunnel name
        name: String,
    },
    /// Manage the stored API token
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TokenCommands {
    /// Store an API token in the config file
    Set { token: String },
    /// Show whether a token is configured and where it comes from
    Show,
    /// Remove the stored token
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    ignore_benign_signals();

    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tuinnel={level},tuinnel_cli={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// SIGPIPE and SIGHUP must not kill the process; SIGINT/SIGTERM are handled
/// where a long-running command needs them
fn ignore_benign_signals() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        let _ = signal(Signal::SIGHUP, SigHandler::SigIgn);
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Add {
            name,
            port,
            zone,
            subdomain,
            protocol,
        } => add(name, port, zone, subdomain, protocol),
        Commands::Edit {
            name,
            port,
            zone,
            subdomain,
            protocol,
        } => edit(name, port, zone, subdomain, protocol).await,
        Commands::Remove { name, keep_cloud } => remove(name, keep_cloud).await,
        Commands::List => list(),
        Commands::Status { name } => status(name),
        Commands::Up { names, all, watch } => up(names, all, watch).await,
        Commands::Down { names, all, clean } => down(names, all, clean).await,
        Commands::Quick { port } => quick(port).await,
        Commands::Purge { name } => purge(name).await,
        Commands::Token { command } => token(command),
    }
}

fn parse_protocol(raw: &str) -> Result<Protocol> {
    match raw {
        "http" => Ok(Protocol::Http),
        "https" => Ok(Protocol::Https),
        other => bail!("unknown protocol {other:?}; use http or https"),
    }
}

fn add(
    name: String,
    port: u16,
    zone: Option<String>,
    subdomain: Option<String>,
    protocol: String,
) -> Result<ExitCode> {
    let store = ConfigStore::new()?;
    let config = store.load()?;

    let zone = zone
        .or_else(|| config.default_zone.clone())
        .context("no zone given and no default zone configured; pass --zone")?;
    let subdomain = subdomain.unwrap_or_else(|| name.clone());
    let protocol = parse_protocol(&protocol)?;

    validate_port(port)?;
    validate_subdomain(&name)?;
    validate_subdomain(&subdomain)?;
    if config.tunnels.contains_key(&name) {
        bail!("a tunnel named {name:?} already exists");
    }

    let tunnel = TunnelConfig {
        port,
        subdomain,
        zone,
        protocol,
        last_state: None,
        tunnel_id: None,
    };
    let public_url = tunnel.public_url();

    store.update(|global| {
        global.tunnels.insert(name.clone(), tunnel);
    })?;

    println!("Added {name}: localhost:{port} -> {public_url}");
    println!("Start it with: tuinnel up {name}");
    Ok(ExitCode::SUCCESS)
}

async fn edit(
    name: String,
    port: Option<u16>,
    zone: Option<String>,
    subdomain: Option<String>,
    protocol: Option<String>,
) -> Result<ExitCode> {
    let protocol = protocol.as_deref().map(parse_protocol).transpose()?;

    let service = TunnelService::from_home()?;
    service
        .update(
            &name,
            tuinnel_service::TunnelPatch {
                port,
                subdomain,
                zone,
                protocol,
            },
        )
        .await?;

    let snapshot = service
        .get(&name)
        .await
        .with_context(|| format!("tunnel {name:?} vanished during edit"))?;
    println!(
        "Updated {name}: localhost:{} -> {}",
        snapshot.config.port, snapshot.public_url
    );
    Ok(ExitCode::SUCCESS)
}

async fn remove(name: String, keep_cloud: bool) -> Result<ExitCode> {
    if keep_cloud {
        // Purely local: no API client required
        let store = ConfigStore::new()?;
        let registry = PidRegistry::new()?;
        if let Some(entry) = registry.get_running()?.get(&name) {
            tuinnel_connector::terminate_pid(entry.pid).await;
            registry.remove(&name)?;
        }
        let mut found = false;
        store.update(|global| {
            found = global.tunnels.remove(&name).is_some();
        })?;
        if !found {
            bail!("no tunnel named {name:?} is configured");
        }
    } else {
        let service = TunnelService::from_home()?;
        service.remove(&name, false).await?;
    }
    println!("Removed {name}");
    Ok(ExitCode::SUCCESS)
}

fn list() -> Result<ExitCode> {
    let store = ConfigStore::new()?;
    let config = store.load()?;
    if config.tunnels.is_empty() {
        println!("No tunnels configured. Add one with: tuinnel add <name> --port <port>");
        return Ok(ExitCode::SUCCESS);
    }

    let running = PidRegistry::new()?.get_running()?;
    println!(
        "{:<16} {:<8} {:<40} {:<10} {}",
        "NAME", "PORT", "URL", "PROTOCOL", "STATUS"
    );
    for (name, tunnel) in &config.tunnels {
        let status = match running.get(name) {
            Some(entry) => format!("running (pid {})", entry.pid),
            None => "stopped".to_string(),
        };
        println!(
            "{:<16} {:<8} {:<40} {:<10} {}",
            name,
            tunnel.port,
            tunnel.public_url(),
            tunnel.protocol,
            status
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn status(name: Option<String>) -> Result<ExitCode> {
    let store = ConfigStore::new()?;
    let config = store.load()?;
    let running = PidRegistry::new()?.get_running()?;

    let names: Vec<String> = match name {
        Some(name) => {
            if !config.tunnels.contains_key(&name) {
                bail!("no tunnel named {name:?} is configured");
            }
            vec![name]
        }
        None => config.tunnels.keys().cloned().collect(),
    };

    for name in names {
        let tunnel = &config.tunnels[&name];
        println!("{name}");
        println!("  url:      {}", tunnel.public_url());
        println!("  origin:   {}://localhost:{}", tunnel.protocol, tunnel.port);
        match running.get(&name) {
            Some(entry) => {
                println!("  status:   running (pid {})", entry.pid);
                if entry.started_at > 0 {
                    let seconds =
                        (chrono_now_millis().saturating_sub(entry.started_at as u64)) / 1000;
                    println!("  uptime:   {}s", seconds);
                }
            }
            None => println!("  status:   stopped"),
        }
        if let Some(id) = &tunnel.tunnel_id {
            println!("  tunnel:   {id}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn chrono_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn up(names: Vec<String>, all: bool, watch: bool) -> Result<ExitCode> {
    let service = TunnelService::from_home()?;

    let names = if all {
        service
            .list()
            .await
            .into_iter()
            .map(|s| s.name)
            .collect::<Vec<_>>()
    } else if names.is_empty() {
        eprintln!("Nothing to start: give tunnel names or --all");
        return Ok(ExitCode::from(2));
    } else {
        names
    };
    if names.is_empty() {
        eprintln!("No tunnels configured. Add one with: tuinnel add <name> --port <port>");
        return Ok(ExitCode::FAILURE);
    }

    let mut started = 0usize;
    for name in &names {
        match service.start(name).await {
            Ok(snapshot) => {
                print!("{name}: connecting...");
                use std::io::Write;
                std::io::stdout().flush().ok();

                match wait_for_connection(&service, name).await {
                    Some(TunnelState::Connected) => {
                        println!("\r{name}: {}", snapshot.public_url);
                        started += 1;
                    }
                    Some(TunnelState::Error) => {
                        let detail = service
                            .get(name)
                            .await
                            .and_then(|s| s.last_error)
                            .unwrap_or_else(|| "unknown error".to_string());
                        println!("\r{name}: failed: {detail}");
                        service.stop(name, false).await.ok();
                    }
                    _ => {
                        // Still connecting; the connector keeps trying in
                        // the background
                        println!("\r{name}: started (pending edge registration)");
                        started += 1;
                    }
                }
            }
            Err(err) => {
                eprintln!("{name}: {err:#}");
            }
        }
    }

    if started == 0 {
        return Ok(ExitCode::FAILURE);
    }

    if watch {
        println!("Watching tunnels; press Ctrl-C to stop them");
        wait_for_shutdown_signal().await;
        println!("Shutting down...");
        let failures = service.shutdown().await;
        for (name, err) in failures {
            warn!("shutdown of {} left an error: {}", name, err);
        }
    } else {
        println!("Connectors keep running in the background; stop them with: tuinnel down --all");
    }
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_connection(service: &TunnelService, name: &str) -> Option<TunnelState> {
    let deadline = tokio::time::Instant::now() + CONNECT_WAIT;
    while tokio::time::Instant::now() < deadline {
        match service.get(name).await.map(|s| s.state) {
            Some(TunnelState::Connected) => return Some(TunnelState::Connected),
            Some(TunnelState::Error) => return Some(TunnelState::Error),
            other => debug!("waiting for {}: {:?}", name, other),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    service.get(name).await.map(|s| s.state)
}

async fn down(names: Vec<String>, all: bool, clean: bool) -> Result<ExitCode> {
    let registry = PidRegistry::new()?;
    let running = registry.get_running()?;

    let names: Vec<String> = if all {
        running.keys().cloned().collect()
    } else if names.is_empty() {
        eprintln!("Nothing to stop: give tunnel names or --all");
        return Ok(ExitCode::from(2));
    } else {
        names
    };

    if names.is_empty() {
        println!("No tunnels are running");
        return Ok(ExitCode::SUCCESS);
    }

    let store = ConfigStore::new()?;
    let config = store.load()?;

    for name in &names {
        match running.get(name) {
            Some(entry) => {
                tuinnel_connector::terminate_pid(entry.pid).await;
                registry.remove(name)?;
                println!("Stopped {name} (pid {})", entry.pid);
            }
            None => {
                println!("{name} is not running");
            }
        }

        if clean {
            let Some(tunnel) = config.tunnels.get(name) else {
                warn!("{} has no configuration; skipping cloud cleanup", name);
                continue;
            };
            let token = resolve_api_token(&config)?;
            let api = tuinnel_api::ApiClient::new(token)?;
            match orchestrator::purge_cloud_resources(&api, name, tunnel).await {
                Ok(actions) => {
                    for action in actions {
                        println!("  {action}");
                    }
                }
                Err(err) => warn!("cloud cleanup for {} failed: {}", name, err),
            }
        }

        store.update(|global| {
            if let Some(tunnel) = global.tunnels.get_mut(name) {
                tunnel.last_state = Some(tuinnel_service::LastState::Stopped);
            }
        })?;
    }

    Ok(ExitCode::SUCCESS)
}

async fn quick(port: u16) -> Result<ExitCode> {
    validate_port(port)?;

    let binary = BinaryManager::new(tuinnel_service::fs_util::data_dir()?.join("bin"));
    let binary_path = binary
        .ensure(Some(Box::new(|done, total| {
            if let Some(total) = total {
                eprint!("\rdownloading cloudflared... {}%", done * 100 / total.max(1));
            }
        })))
        .await?;

    let loopback = resolve_loopback(port).await;
    let origin = format!("http://{loopback}:{port}");
    let process =
        ConnectorProcess::spawn_quick(&binary_path, &origin, &SpawnOptions::default()).await?;

    // The ephemeral hostname arrives on stderr
    let mut stderr = process.subscribe_stderr();
    let url = tokio::time::timeout(CONNECT_WAIT, async {
        loop {
            match stderr.recv().await {
                Ok(line) => {
                    debug!("cloudflared: {}", line);
                    if let Some(url) = log_parser::extract_quick_tunnel_url(&line) {
                        return Some(url);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();

    let Some(url) = url else {
        process.kill().await;
        bail!("cloudflared did not report a quick-tunnel URL; run with --log-level debug for its output");
    };

    println!("{url} -> {origin}");
    println!("Press Ctrl-C to close the tunnel");

    // Quick tunnels live and die with this process
    wait_for_shutdown_signal().await;
    process.kill().await;
    println!("Closed");
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!("could not install SIGTERM handler: {}", err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

async fn purge(name: String) -> Result<ExitCode> {
    let store = ConfigStore::new()?;
    let config = store.load()?;
    let tunnel = config
        .tunnels
        .get(&name)
        .with_context(|| format!("no tunnel named {name:?} is configured"))?;

    let token = resolve_api_token(&config)?;
    let api = tuinnel_api::ApiClient::new(token)?;
    let actions = orchestrator::purge_cloud_resources(&api, &name, tunnel).await?;

    if actions.is_empty() {
        println!("Nothing to purge for {name}");
    } else {
        for action in actions {
            println!("{action}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn token(command: TokenCommands) -> Result<ExitCode> {
    let store = ConfigStore::new()?;
    match command {
        TokenCommands::Set { token } => {
            tuinnel_api::validate_token_shape(&token)?;
            store.update(|global| {
                global.api_token = Some(token.clone());
            })?;
            println!("Token stored");
        }
        TokenCommands::Show => {
            if std::env::var("CLOUDFLARE_API_TOKEN").is_ok() {
                println!("Using token from CLOUDFLARE_API_TOKEN");
            } else if std::env::var("TUINNEL_API_TOKEN").is_ok() {
                println!("Using token from TUINNEL_API_TOKEN");
            } else if store.load()?.api_token.is_some() {
                println!("Using token from the config file");
            } else {
                println!("No token configured. Set one with: tuinnel token set <token>");
            }
        }
        TokenCommands::Clear => {
            store.update(|global| {
                global.api_token = None;
            })?;
            println!("Token cleared");
        }
    }
    Ok(ExitCode::SUCCESS)
}
