//! The tunnel state hub
//!
//! Owns every [`TunnelRuntime`] and every live connector process in this
//! process. All mutations happen behind one async mutex with short critical
//! sections; a per-tunnel operation lock gives strict ordering for one name
//! while different tunnels interleave freely. Observers subscribe to a
//! broadcast channel and receive events synchronously; they must not block.

use crate::config::{
    resolve_api_token, validate_port, validate_subdomain, ConfigStore, LastState, Protocol,
    TunnelConfig,
};
use crate::error::ServiceError;
use crate::loopback::port_answers;
use crate::orchestrator::{self, CleanupInfo, StopTarget};
use crate::pid_registry::PidRegistry;
use crate::runtime::{ConnectionEvent, TunnelRuntime, TunnelSnapshot, TunnelState};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use tuinnel_api::ApiClient;
use tuinnel_connector::log_parser;
use tuinnel_connector::{
    BinaryManager, ConnectorProcess, ExitInfo, MetricsScraper, SpawnOptions, TunnelMetrics,
};

/// Cadence of the local-port health probe
const PORT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events published by the service
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    StateChanged { name: String, state: TunnelState },
    TunnelAdded { name: String },
    TunnelRemoved { name: String },
}

/// A running connector handed to the service from outside (for instance a
/// connector surviving from a previous tuinnel process)
#[derive(Debug, Clone)]
pub struct AdoptedTunnel {
    pub tunnel_id: String,
    pub connector_token: String,
    pub public_url: String,
}

/// Partial update applied by `edit`
#[derive(Debug, Clone, Default)]
pub struct TunnelPatch {
    pub port: Option<u16>,
    pub subdomain: Option<String>,
    pub zone: Option<String>,
    pub protocol: Option<Protocol>,
}

struct ServiceState {
    runtimes: HashMap<String, TunnelRuntime>,
    processes: HashMap<String, Arc<ConnectorProcess>>,
    scrapers: HashMap<String, MetricsScraper>,
    /// Wiring generation per tunnel; stale watcher tasks check it and bail
    epochs: HashMap<String, u64>,
    next_epoch: u64,
    /// Names with a deliberate stop in flight, so the exit watcher does not
    /// report the exit as a disconnect
    stopping: HashSet<String>,
}

struct Inner {
    api: ApiClient,
    binary: BinaryManager,
    registry: PidRegistry,
    config_store: ConfigStore,
    spawn_opts: SpawnOptions,
    state: Mutex<ServiceState>,
    op_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<TunnelEvent>,
}

/// The per-process tunnel registry and state machine
#[derive(Clone)]
pub struct TunnelService {
    inner: Arc<Inner>,
}

impl TunnelService {
    /// Build the service from its collaborators and load the configured
    /// tunnels as stopped runtimes
    pub fn new(
        api: ApiClient,
        binary: BinaryManager,
        registry: PidRegistry,
        config_store: ConfigStore,
    ) -> Result<Self, ServiceError> {
        let config = config_store.load()?;
        let runtimes = config
            .tunnels
            .iter()
            .map(|(name, cfg)| {
                let mut runtime = TunnelRuntime::new(name.clone(), cfg.clone());
                runtime.tunnel_id = cfg.tunnel_id.clone();
                (name.clone(), runtime)
            })
            .collect();

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                api,
                binary,
                registry,
                config_store,
                spawn_opts: SpawnOptions::default(),
                state: Mutex::new(ServiceState {
                    runtimes,
                    processes: HashMap::new(),
                    scrapers: HashMap::new(),
                    epochs: HashMap::new(),
                    next_epoch: 0,
                    stopping: HashSet::new(),
                }),
                op_locks: std::sync::Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    /// Build the default production wiring under `~/.tuinnel`
    pub fn from_home() -> Result<Self, ServiceError> {
        let config_store = ConfigStore::new()?;
        let config = config_store.load()?;
        let token = resolve_api_token(&config)?;
        let api = ApiClient::new(token).map_err(ServiceError::Api)?;
        let binary = BinaryManager::new(crate::fs_util::data_dir()?.join("bin"));
        let registry = PidRegistry::new()?;
        Self::new(api, binary, registry, config_store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &PidRegistry {
        &self.inner.registry
    }

    fn op_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.op_locks.lock().unwrap();
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Snapshots of every tunnel, sorted by name
    pub async fn list(&self) -> Vec<TunnelSnapshot> {
        let state = self.inner.state.lock().await;
        let mut snapshots: Vec<TunnelSnapshot> =
            state.runtimes.values().map(TunnelRuntime::snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub async fn get(&self, name: &str) -> Option<TunnelSnapshot> {
        let state = self.inner.state.lock().await;
        state.runtimes.get(name).map(TunnelRuntime::snapshot)
    }

    /// The last good metrics snapshot for a tunnel, if its scraper has one
    pub async fn metrics(&self, name: &str) -> Option<TunnelMetrics> {
        let state = self.inner.state.lock().await;
        state.scrapers.get(name).and_then(MetricsScraper::snapshot)
    }

    /// Register a new tunnel configuration. The config is persisted before
    /// any cloud resource is requested, so a crash mid-startup still leaves
    /// enough on disk to clean up.
    pub async fn add(&self, name: &str, config: TunnelConfig) -> Result<TunnelSnapshot, ServiceError> {
        validate_port(config.port)?;
        validate_subdomain(&config.subdomain)?;
        validate_subdomain(name)?;

        {
            let mut state = self.inner.state.lock().await;
            if state.runtimes.contains_key(name) {
                return Err(ServiceError::DuplicateTunnel(name.to_string()));
            }
            let mut runtime = TunnelRuntime::new(name.to_string(), config.clone());
            runtime.state = TunnelState::Creating;
            state.runtimes.insert(name.to_string(), runtime);
        }
        self.emit(TunnelEvent::TunnelAdded {
            name: name.to_string(),
        });

        let persisted = self.inner.config_store.update(|global| {
            global.tunnels.insert(name.to_string(), config.clone());
        });

        match persisted {
            Ok(_) => {
                let snapshot = self.transition(name, TunnelState::Stopped).await;
                info!("added tunnel {} -> {}", name, config.public_url());
                snapshot.ok_or_else(|| ServiceError::UnknownTunnel(name.to_string()))
            }
            Err(err) => {
                // Creation failed: the runtime is removed entirely
                let mut state = self.inner.state.lock().await;
                state.runtimes.remove(name);
                drop(state);
                self.emit(TunnelEvent::TunnelRemoved {
                    name: name.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Start a tunnel: provision cloud resources, spawn the connector and
    /// wire its stderr into this runtime
    pub async fn start(&self, name: &str) -> Result<TunnelSnapshot, ServiceError> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.start_locked(name).await
    }

    async fn start_locked(&self, name: &str) -> Result<TunnelSnapshot, ServiceError> {
        let config = {
            let state = self.inner.state.lock().await;
            let runtime = state
                .runtimes
                .get(name)
                .ok_or_else(|| ServiceError::UnknownTunnel(name.to_string()))?;
            if matches!(runtime.state, TunnelState::Connecting | TunnelState::Connected) {
                return Err(ServiceError::AlreadyRunning {
                    name: name.to_string(),
                    pid: runtime.pid.unwrap_or_default(),
                });
            }
            runtime.config.clone()
        };
        self.inner.registry.assert_not_running(name)?;

        self.transition(name, TunnelState::Connecting).await;

        let started = orchestrator::start_tunnel(
            &self.inner.api,
            &self.inner.binary,
            &self.inner.registry,
            name,
            &config,
            &self.inner.spawn_opts,
        )
        .await;

        let started = match started {
            Ok(started) => started,
            Err(err) => {
                self.record_failure(name, err.to_string()).await;
                return Err(err);
            }
        };

        let process = Arc::new(started.process);
        let (epoch, snapshot) = {
            let mut state = self.inner.state.lock().await;
            state.next_epoch += 1;
            let epoch = state.next_epoch;
            state.epochs.insert(name.to_string(), epoch);
            state.processes.insert(name.to_string(), Arc::clone(&process));

            let runtime = state
                .runtimes
                .get_mut(name)
                .ok_or_else(|| ServiceError::UnknownTunnel(name.to_string()))?;
            runtime.pid = Some(process.pid());
            runtime.tunnel_id = Some(started.tunnel_id.clone());
            runtime.connector_token = Some(started.connector_token.clone());
            runtime.public_url = started.public_url.clone();
            runtime.dns_zone_id = Some(started.dns_zone_id.clone());
            runtime.dns_record_id = Some(started.dns_record_id.clone());
            runtime.last_error = None;
            (epoch, runtime.snapshot())
        };

        self.persist_tunnel_id(name, &started.tunnel_id).await;
        self.persist_states().await;
        self.wire_process(name, config.port, process, epoch);

        info!("started tunnel {} -> {}", name, snapshot.public_url);
        Ok(snapshot)
    }

    /// Stop a tunnel. With `clean`, its DNS record and provider tunnel are
    /// deleted as well.
    pub async fn stop(&self, name: &str, clean: bool) -> Result<(), ServiceError> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.stop_locked(name, clean, TunnelState::Stopped).await
    }

    async fn stop_locked(
        &self,
        name: &str,
        clean: bool,
        final_state: TunnelState,
    ) -> Result<(), ServiceError> {
        let (process, cleanup) = {
            let mut state = self.inner.state.lock().await;
            let runtime = state
                .runtimes
                .get(name)
                .ok_or_else(|| ServiceError::UnknownTunnel(name.to_string()))?;
            let cleanup = CleanupInfo {
                tunnel_id: runtime.tunnel_id.clone(),
                dns_zone_id: runtime.dns_zone_id.clone(),
                dns_record_id: runtime.dns_record_id.clone(),
            };
            state.stopping.insert(name.to_string());
            (state.processes.get(name).cloned(), cleanup)
        };

        let result = if let Some(process) = process {
            orchestrator::stop_tunnel(
                &self.inner.api,
                &self.inner.registry,
                name,
                StopTarget::Owned(&process),
                clean,
                Some(&cleanup),
            )
            .await
        } else if let Some(entry) = self.inner.registry.get_running()?.get(name) {
            // A connector left behind by an earlier tuinnel process
            orchestrator::stop_tunnel(
                &self.inner.api,
                &self.inner.registry,
                name,
                StopTarget::Detached(entry.pid),
                clean,
                Some(&cleanup),
            )
            .await
        } else {
            self.inner.registry.remove(name)?;
            Ok(())
        };

        {
            let mut state = self.inner.state.lock().await;
            state.stopping.remove(name);
            state.processes.remove(name);
            if let Some(scraper) = state.scrapers.get_mut(name) {
                scraper.set_addr(None);
            }
            if let Some(runtime) = state.runtimes.get_mut(name) {
                runtime.pid = None;
                runtime.connected_at = 0;
                runtime.metrics_addr = None;
                runtime.last_error = None;
            }
        }
        self.transition(name, final_state).await;
        self.persist_states().await;
        result
    }

    /// `stop` then `start`, passing through the `restarting` state
    pub async fn restart(&self, name: &str) -> Result<TunnelSnapshot, ServiceError> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        self.stop_locked(name, false, TunnelState::Restarting).await?;
        self.start_locked(name).await
    }

    /// Delete a tunnel: stop it when running, delete its cloud resources
    /// unless told otherwise, drop it from the config and remove the runtime
    pub async fn remove(&self, name: &str, keep_cloud: bool) -> Result<(), ServiceError> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        let config = {
            let state = self.inner.state.lock().await;
            state
                .runtimes
                .get(name)
                .ok_or_else(|| ServiceError::UnknownTunnel(name.to_string()))?
                .config
                .clone()
        };

        let running = {
            let state = self.inner.state.lock().await;
            state.processes.contains_key(name)
        } || self.inner.registry.get_running()?.contains_key(name);
        if running {
            self.stop_locked(name, false, TunnelState::Stopped).await?;
        }

        if !keep_cloud {
            let actions = orchestrator::purge_cloud_resources(&self.inner.api, name, &config).await?;
            for action in &actions {
                debug!("{}", action);
            }
        }

        self.inner.config_store.update(|global| {
            global.tunnels.remove(name);
        })?;

        {
            let mut state = self.inner.state.lock().await;
            state.runtimes.remove(name);
            state.epochs.remove(name);
            state.scrapers.remove(name);
        }
        self.emit(TunnelEvent::TunnelRemoved {
            name: name.to_string(),
        });
        info!("removed tunnel {}", name);
        Ok(())
    }

    /// Apply a config change. A change of subdomain or zone is a change of
    /// identity: the old cloud resources are deleted and, when the tunnel
    /// was running, it is started again under the new hostname. Port and
    /// protocol changes only need a restart.
    pub async fn update(&self, name: &str, patch: TunnelPatch) -> Result<(), ServiceError> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        let old_config = {
            let state = self.inner.state.lock().await;
            state
                .runtimes
                .get(name)
                .ok_or_else(|| ServiceError::UnknownTunnel(name.to_string()))?
                .config
                .clone()
        };

        let mut new_config = old_config.clone();
        if let Some(port) = patch.port {
            new_config.port = port;
        }
        if let Some(subdomain) = patch.subdomain {
            new_config.subdomain = subdomain;
        }
        if let Some(zone) = patch.zone {
            new_config.zone = zone;
        }
        if let Some(protocol) = patch.protocol {
            new_config.protocol = protocol;
        }
        validate_port(new_config.port)?;
        validate_subdomain(&new_config.subdomain)?;

        if new_config == old_config {
            return Ok(());
        }

        let was_running = {
            let state = self.inner.state.lock().await;
            state.processes.contains_key(name)
        } || self.inner.registry.get_running()?.contains_key(name);

        let identity_changed = new_config.subdomain != old_config.subdomain
            || new_config.zone != old_config.zone;

        if identity_changed {
            if was_running {
                self.stop_locked(name, false, TunnelState::Stopped).await?;
            }
            // The old hostname and tunnel are gone for good
            let actions =
                orchestrator::purge_cloud_resources(&self.inner.api, name, &old_config).await?;
            for action in &actions {
                debug!("{}", action);
            }
            new_config.tunnel_id = None;
        }

        self.inner.config_store.update(|global| {
            global.tunnels.insert(name.to_string(), new_config.clone());
        })?;
        {
            let mut state = self.inner.state.lock().await;
            if let Some(runtime) = state.runtimes.get_mut(name) {
                runtime.config = new_config.clone();
                runtime.public_url = new_config.public_url();
                if identity_changed {
                    runtime.tunnel_id = None;
                    runtime.dns_zone_id = None;
                    runtime.dns_record_id = None;
                }
            }
        }

        if was_running {
            if identity_changed {
                self.start_locked(name).await?;
            } else {
                self.stop_locked(name, false, TunnelState::Restarting).await?;
                self.start_locked(name).await?;
            }
        }
        Ok(())
    }

    /// Wire up a connector that something else spawned, as if this service
    /// had started it. The runtime moves to `connecting` until a
    /// registration line arrives.
    pub async fn adopt(
        &self,
        name: &str,
        process: ConnectorProcess,
        info: AdoptedTunnel,
    ) -> Result<(), ServiceError> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        let process = Arc::new(process);
        let (epoch, port) = {
            let mut state = self.inner.state.lock().await;
            state.next_epoch += 1;
            let epoch = state.next_epoch;

            let runtime = state
                .runtimes
                .get_mut(name)
                .ok_or_else(|| ServiceError::UnknownTunnel(name.to_string()))?;
            runtime.pid = Some(process.pid());
            runtime.tunnel_id = Some(info.tunnel_id.clone());
            runtime.connector_token = Some(info.connector_token.clone());
            runtime.public_url = info.public_url.clone();
            runtime.last_error = None;
            let port = runtime.config.port;

            state.epochs.insert(name.to_string(), epoch);
            state.processes.insert(name.to_string(), Arc::clone(&process));
            (epoch, port)
        };

        self.inner.registry.record(name, process.pid())?;
        self.transition(name, TunnelState::Connecting).await;
        self.persist_states().await;
        self.wire_process(name, port, process, epoch);
        info!("adopted running connector for {} (pid known to registry)", name);
        Ok(())
    }

    /// Start every tunnel whose persisted state says it was running
    pub async fn auto_start(&self) -> Vec<(String, ServiceError)> {
        let names: Vec<String> = {
            let state = self.inner.state.lock().await;
            state
                .runtimes
                .values()
                .filter(|r| r.config.last_state == Some(LastState::Running))
                .map(|r| r.name.clone())
                .collect()
        };

        let mut failures = Vec::new();
        for name in names {
            if let Err(err) = self.start(&name).await {
                warn!("autostart of {} failed: {}", name, err);
                failures.push((name, err));
            }
        }
        failures
    }

    /// Save state, then stop every live connector concurrently. Errors are
    /// collected, not re-raised; shutdown always completes.
    ///
    /// The state snapshot is written before the kills: tunnels running at
    /// shutdown keep `lastState = running` on disk, which is what lets
    /// `auto_start` resume them in the next session.
    pub async fn shutdown(&self) -> Vec<(String, ServiceError)> {
        self.persist_states().await;

        let processes: Vec<(String, Arc<ConnectorProcess>)> = {
            let mut state = self.inner.state.lock().await;
            let drained: Vec<_> = state.processes.drain().collect();
            for (name, _) in &drained {
                state.stopping.insert(name.clone());
            }
            drained
        };

        let kills = processes.iter().map(|(name, process)| {
            let name = name.clone();
            let process = Arc::clone(process);
            async move {
                process.kill().await;
                name
            }
        });
        let stopped = futures::future::join_all(kills).await;

        let mut failures = Vec::new();
        for name in stopped {
            if let Err(err) = self.inner.registry.remove(&name) {
                failures.push((name.clone(), err));
            }
            {
                let mut state = self.inner.state.lock().await;
                state.stopping.remove(&name);
                if let Some(runtime) = state.runtimes.get_mut(&name) {
                    runtime.pid = None;
                    runtime.connected_at = 0;
                    runtime.metrics_addr = None;
                }
                if let Some(scraper) = state.scrapers.get_mut(&name) {
                    scraper.set_addr(None);
                }
            }
            self.transition(&name, TunnelState::Stopped).await;
        }

        info!("service shut down");
        failures
    }

    // ---- internal plumbing -------------------------------------------------

    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Set a tunnel's state and publish the change
    async fn transition(&self, name: &str, new_state: TunnelState) -> Option<TunnelSnapshot> {
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            let runtime = state.runtimes.get_mut(name)?;
            if runtime.state == new_state {
                return Some(runtime.snapshot());
            }
            runtime.state = new_state;
            runtime.snapshot()
        };
        debug!("tunnel {} -> {}", name, new_state);
        self.emit(TunnelEvent::StateChanged {
            name: name.to_string(),
            state: new_state,
        });
        Some(snapshot)
    }

    async fn record_failure(&self, name: &str, message: String) {
        {
            let mut state = self.inner.state.lock().await;
            if let Some(runtime) = state.runtimes.get_mut(name) {
                runtime.last_error = Some(message);
            }
        }
        self.transition(name, TunnelState::Error).await;
        self.persist_states().await;
    }

    /// Remember the provider tunnel id in the config file
    async fn persist_tunnel_id(&self, name: &str, tunnel_id: &str) {
        let result = self.inner.config_store.update(|global| {
            if let Some(cfg) = global.tunnels.get_mut(name) {
                cfg.tunnel_id = Some(tunnel_id.to_string());
            }
        });
        if let Err(err) = result {
            warn!("could not persist tunnel id for {}: {}", name, err);
        }
    }

    /// Write `lastState` for every tunnel: running iff a process exists
    async fn persist_states(&self) {
        let running: HashSet<String> = {
            let state = self.inner.state.lock().await;
            state.processes.keys().cloned().collect()
        };
        let result = self.inner.config_store.update(|global| {
            for (name, cfg) in global.tunnels.iter_mut() {
                cfg.last_state = Some(if running.contains(name) {
                    LastState::Running
                } else {
                    LastState::Stopped
                });
            }
        });
        if let Err(err) = result {
            warn!("could not persist tunnel states: {}", err);
        }
    }

    /// Attach the stderr parser, exit watcher and port prober to a process
    fn wire_process(&self, name: &str, port: u16, process: Arc<ConnectorProcess>, epoch: u64) {
        let service = self.clone();
        let task_name = name.to_string();
        let mut stderr_rx = process.subscribe_stderr();
        tokio::spawn(async move {
            loop {
                match stderr_rx.recv().await {
                    Ok(line) => service.handle_stderr_line(&task_name, epoch, &line).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("{}: dropped {} stderr lines", task_name, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let service = self.clone();
        let task_name = name.to_string();
        let mut exit_rx = process.exit_watch();
        tokio::spawn(async move {
            let info = match exit_rx.wait_for(|info| info.is_some()).await {
                Ok(info) => info.unwrap_or(ExitInfo { code: None }),
                Err(_) => ExitInfo { code: None },
            };
            service.handle_exit(&task_name, epoch, info).await;
        });

        let service = self.clone();
        let task_name = name.to_string();
        tokio::spawn(async move {
            service.probe_port_loop(task_name, epoch, port).await;
        });
    }

    async fn handle_stderr_line(&self, name: &str, epoch: u64, line: &str) {
        let Some(parsed) = log_parser::parse_line(line) else {
            return;
        };
        let registered = log_parser::extract_registration(line).is_some();
        let metrics_addr = log_parser::extract_metrics_addr(line);

        let became_connected = {
            let mut state = self.inner.state.lock().await;
            if state.epochs.get(name) != Some(&epoch) {
                return;
            }
            let state = &mut *state;
            let Some(runtime) = state.runtimes.get_mut(name) else {
                return;
            };

            runtime.push_event(ConnectionEvent::from_log_line(line, parsed));

            if let Some(addr) = metrics_addr {
                runtime.metrics_addr = Some(addr.clone());
                state
                    .scrapers
                    .entry(name.to_string())
                    .or_default()
                    .set_addr(Some(addr));
            }

            if registered && runtime.state != TunnelState::Connected {
                runtime.connected_at = chrono::Utc::now().timestamp_millis() as u64;
                true
            } else {
                false
            }
        };

        if became_connected {
            self.transition(name, TunnelState::Connected).await;
            self.persist_states().await;
        }
    }

    async fn handle_exit(&self, name: &str, epoch: u64, info: ExitInfo) {
        let outcome = {
            let mut state = self.inner.state.lock().await;
            if state.epochs.get(name) != Some(&epoch) {
                return;
            }
            state.processes.remove(name);
            if let Some(scraper) = state.scrapers.get_mut(name) {
                scraper.set_addr(None);
            }
            let deliberate = state.stopping.contains(name);
            let Some(runtime) = state.runtimes.get_mut(name) else {
                return;
            };
            runtime.pid = None;
            runtime.connected_at = 0;
            runtime.metrics_addr = None;

            if deliberate {
                // The stop path owns the state transition
                None
            } else {
                match info.code {
                    Some(0) | None => Some((TunnelState::Disconnected, None)),
                    Some(code) => Some((
                        TunnelState::Error,
                        Some(format!("cloudflared exited with code {code}")),
                    )),
                }
            }
        };

        if let Some((new_state, error)) = outcome {
            if let Some(message) = error {
                let mut state = self.inner.state.lock().await;
                if let Some(runtime) = state.runtimes.get_mut(name) {
                    runtime.last_error = Some(message);
                }
            }
            if let Err(err) = self.inner.registry.remove(name) {
                warn!("could not drop pid entry for {}: {}", name, err);
            }
            self.transition(name, new_state).await;
            self.persist_states().await;
        }
    }

    /// Flip a healthy tunnel to `port_down` while its local origin refuses
    /// connections, and back once it answers again
    async fn probe_port_loop(&self, name: String, epoch: u64, port: u16) {
        let mut ticker = tokio::time::interval(PORT_PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let current = {
                let state = self.inner.state.lock().await;
                if state.epochs.get(&name) != Some(&epoch)
                    || !state.processes.contains_key(&name)
                {
                    return;
                }
                state.runtimes.get(&name).map(|r| r.state)
            };

            match current {
                Some(TunnelState::Connected) => {
                    if !port_answers(port).await {
                        warn!("local port {} for {} is not answering", port, name);
                        self.transition(&name, TunnelState::PortDown).await;
                    }
                }
                Some(TunnelState::PortDown) => {
                    if port_answers(port).await {
                        info!("local port {} for {} is back", port, name);
                        self.transition(&name, TunnelState::Connected).await;
                    }
                }
                _ => {}
            }
        }
    }
}
