//! State hub behaviour: lifecycle, events, persistence, adoption
//!
//! The connector stub speaks the same stderr grammar as cloudflared, so
//! registration and metrics-address detection run against realistic lines.

use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;
use tuinnel_api::ApiClient;
use tuinnel_service::config::Protocol;
use tuinnel_service::{
    AdoptedTunnel, ConfigStore, LastState, PidRegistry, ServiceError, TunnelConfig, TunnelEvent,
    TunnelService, TunnelState,
};
use tuinnel_connector::{BinaryManager, ConnectorProcess, SpawnOptions};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

static API_LOCK: Mutex<()> = Mutex::new(());

const TUNNEL_ID: &str = "11111111-2222-3333-4444-555555555555";

fn ok_envelope(result: Value) -> Value {
    json!({ "success": true, "errors": [], "messages": [], "result": result })
}

/// Stub that announces its metrics listener, registers a connection, then
/// idles until SIGTERM
const CONNECTED_STUB: &str = r#"
sleep 0.2
echo "2024-03-07T09:15:01Z INF Starting metrics server on 127.0.0.1:49123/metrics" >&2
echo "2024-03-07T09:15:02Z INF Registered tunnel connection connIndex=0 connection=abc event=0 ip=198.41.200.23 location=ams01 protocol=quic" >&2
trap 'exit 0' TERM
while :; do sleep 1; done
"#;

/// Stub that dies with a non-zero code shortly after starting
const CRASHING_STUB: &str = "sleep 0.3\nexit 3\n";

struct TestEnv {
    _dir: TempDir,
    _server: MockServer,
    service: TunnelService,
    config_store: ConfigStore,
    registry: PidRegistry,
    port: u16,
    _listener: tokio::net::TcpListener,
}

async fn test_env(stub_body: &str) -> TestEnv {
    use std::os::unix::fs::PermissionsExt;

    tuinnel_api::clear_cached_account_id();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = MockServer::start().await;
    let zone = json!([{ "id": "Z", "name": "example.com", "account": { "id": "A" } }]);
    Mock::given(method("GET"))
        .and(path("/zones"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_envelope(zone)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/accounts/A/cfd_tunnel"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_envelope(json!({
            "id": TUNNEL_ID,
            "name": "tuinnel-app"
        }))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/accounts/A/cfd_tunnel/{TUNNEL_ID}/token")))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_envelope(json!("tok"))))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/accounts/A/cfd_tunnel/{TUNNEL_ID}/configurations")))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_envelope(json!(null))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/zones/Z/dns_records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_envelope(json!([]))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/zones/Z/dns_records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_envelope(json!({
            "id": "R1",
            "type": "CNAME",
            "name": "app.example.com",
            "content": format!("{TUNNEL_ID}.cfargotunnel.com")
        }))))
        .mount(&server)
        .await;
    // Deletions for remove()/update() paths
    Mock::given(method("DELETE"))
        .and(path(format!("/accounts/A/cfd_tunnel/{TUNNEL_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_envelope(json!(null))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/accounts/A/cfd_tunnel"))
        .and(query_param("name", "tuinnel-app"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_envelope(json!([]))))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let bin_dir = dir.path().join("bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    let stub = bin_dir.join("cloudflared");
    std::fs::write(&stub, format!("#!/bin/sh\n{stub_body}")).unwrap();
    std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config_store = ConfigStore::with_path(dir.path().join("config.json"));
    let registry = PidRegistry::with_path(dir.path().join(".pids.json"));
    let api = ApiClient::with_base_url("t", server.uri()).unwrap();
    let binary = BinaryManager::new(&bin_dir);

    let service = TunnelService::new(
        api,
        binary,
        registry.clone(),
        config_store.clone(),
    )
    .unwrap();

    TestEnv {
        _dir: dir,
        _server: server,
        service,
        config_store,
        registry,
        port,
        _listener: listener,
    }
}

fn app_config(port: u16) -> TunnelConfig {
    TunnelConfig {
        port,
        subdomain: "app".to_string(),
        zone: "example.com".to_string(),
        protocol: Protocol::Http,
        last_state: None,
        tunnel_id: None,
    }
}

async fn wait_for_state(service: &TunnelService, name: &str, wanted: TunnelState) {
    timeout(Duration::from_secs(10), async {
        loop {
            if let Some(snapshot) = service.get(name).await {
                if snapshot.state == wanted {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("tunnel {name} never reached {wanted}"));
}

#[tokio::test]
async fn add_validates_and_persists_before_any_cloud_call() {
    let _guard = API_LOCK.lock().unwrap();
    let env = test_env(CONNECTED_STUB).await;

    let snapshot = env.service.add("app", app_config(env.port)).await.unwrap();
    assert_eq!(snapshot.state, TunnelState::Stopped);
    assert_eq!(snapshot.public_url, "https://app.example.com");

    // Persisted on disk already
    let config = env.config_store.load().unwrap();
    assert!(config.tunnels.contains_key("app"));

    // The provider saw nothing yet
    assert!(env._server.received_requests().await.unwrap().is_empty());

    // Names are unique per process
    let err = env.service.add("app", app_config(env.port)).await.unwrap_err();
    assert!(matches!(err, ServiceError::DuplicateTunnel(_)));

    // Validation is pre-flight
    let mut bad = app_config(env.port);
    bad.subdomain = "Not-Valid".to_string();
    assert!(matches!(
        env.service.add("other", bad).await.unwrap_err(),
        ServiceError::InvalidSubdomain(_)
    ));
    let mut bad = app_config(env.port);
    bad.port = 0;
    assert!(matches!(
        env.service.add("other", bad).await.unwrap_err(),
        ServiceError::InvalidPort
    ));
}

#[tokio::test]
async fn start_reaches_connected_on_registration_and_fills_the_ring() {
    let _guard = API_LOCK.lock().unwrap();
    let env = test_env(CONNECTED_STUB).await;
    env.service.add("app", app_config(env.port)).await.unwrap();

    let mut events = env.service.subscribe();
    let snapshot = env.service.start("app").await.unwrap();
    assert_eq!(snapshot.state, TunnelState::Connecting);
    assert!(snapshot.pid.is_some());
    assert_eq!(snapshot.tunnel_id.as_deref(), Some(TUNNEL_ID));

    wait_for_state(&env.service, "app", TunnelState::Connected).await;

    let snapshot = env.service.get("app").await.unwrap();
    assert!(snapshot.connected_at > 0);
    assert_eq!(snapshot.metrics_addr.as_deref(), Some("127.0.0.1:49123"));
    // Both stub lines landed in the connections ring, newest last
    assert!(snapshot.connections.len() >= 2);
    assert!(snapshot
        .connections
        .iter()
        .any(|e| e.message.contains("Registered tunnel connection")));
    assert_eq!(
        snapshot
            .connections
            .iter()
            .find(|e| e.connection_id.is_some())
            .and_then(|e| e.location.clone())
            .as_deref(),
        Some("ams01")
    );

    // State changes arrived in transition order
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TunnelEvent::StateChanged { state, .. } = event {
            seen.push(state);
        }
    }
    assert_eq!(
        seen,
        vec![TunnelState::Connecting, TunnelState::Connected]
    );

    // lastState persisted as running while the process lives
    let config = env.config_store.load().unwrap();
    assert_eq!(config.tunnels["app"].last_state, Some(LastState::Running));
    assert_eq!(config.tunnels["app"].tunnel_id.as_deref(), Some(TUNNEL_ID));

    env.service.stop("app", false).await.unwrap();
}

#[tokio::test]
async fn start_twice_reports_the_running_pid() {
    let _guard = API_LOCK.lock().unwrap();
    let env = test_env(CONNECTED_STUB).await;
    env.service.add("app", app_config(env.port)).await.unwrap();

    let snapshot = env.service.start("app").await.unwrap();
    let pid = snapshot.pid.unwrap();

    let err = env.service.start("app").await.unwrap_err();
    match err {
        ServiceError::AlreadyRunning { pid: reported, .. } => assert_eq!(reported, pid),
        other => panic!("unexpected error: {other}"),
    }

    env.service.stop("app", false).await.unwrap();
}

#[tokio::test]
async fn stop_clears_process_registry_and_persists_stopped() {
    let _guard = API_LOCK.lock().unwrap();
    let env = test_env(CONNECTED_STUB).await;
    env.service.add("app", app_config(env.port)).await.unwrap();

    env.service.start("app").await.unwrap();
    wait_for_state(&env.service, "app", TunnelState::Connected).await;
    assert!(env.registry.get("app").unwrap().is_some());

    env.service.stop("app", false).await.unwrap();

    let snapshot = env.service.get("app").await.unwrap();
    assert_eq!(snapshot.state, TunnelState::Stopped);
    assert!(snapshot.pid.is_none());
    assert_eq!(snapshot.connected_at, 0);
    assert!(env.registry.get("app").unwrap().is_none());

    let config = env.config_store.load().unwrap();
    assert_eq!(config.tunnels["app"].last_state, Some(LastState::Stopped));

    // Stopping again is not an error
    env.service.stop("app", false).await.unwrap();
}

#[tokio::test]
async fn crashing_connector_moves_the_tunnel_to_error() {
    let _guard = API_LOCK.lock().unwrap();
    let env = test_env(CRASHING_STUB).await;
    env.service.add("app", app_config(env.port)).await.unwrap();

    env.service.start("app").await.unwrap();
    wait_for_state(&env.service, "app", TunnelState::Error).await;

    let snapshot = env.service.get("app").await.unwrap();
    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("cloudflared exited with code 3")
    );
    assert!(snapshot.pid.is_none());
    // The dead pid was dropped from the registry
    assert!(env.registry.get("app").unwrap().is_none());
}

#[tokio::test]
async fn restart_passes_through_restarting() {
    let _guard = API_LOCK.lock().unwrap();
    let env = test_env(CONNECTED_STUB).await;
    env.service.add("app", app_config(env.port)).await.unwrap();

    env.service.start("app").await.unwrap();
    wait_for_state(&env.service, "app", TunnelState::Connected).await;
    let first_pid = env.service.get("app").await.unwrap().pid;

    let mut events = env.service.subscribe();
    env.service.restart("app").await.unwrap();
    wait_for_state(&env.service, "app", TunnelState::Connected).await;

    let second_pid = env.service.get("app").await.unwrap().pid;
    assert_ne!(first_pid, second_pid);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TunnelEvent::StateChanged { state, .. } = event {
            seen.push(state);
        }
    }
    assert!(seen.contains(&TunnelState::Restarting));

    env.service.stop("app", false).await.unwrap();
}

#[tokio::test]
async fn remove_deletes_config_runtime_and_emits() {
    let _guard = API_LOCK.lock().unwrap();
    let env = test_env(CONNECTED_STUB).await;
    env.service.add("app", app_config(env.port)).await.unwrap();

    let mut events = env.service.subscribe();
    env.service.remove("app", true).await.unwrap();

    assert!(env.service.get("app").await.is_none());
    assert!(!env
        .config_store
        .load()
        .unwrap()
        .tunnels
        .contains_key("app"));
    assert!(matches!(
        events.try_recv().unwrap(),
        TunnelEvent::TunnelRemoved { .. }
    ));

    assert!(matches!(
        env.service.stop("app", false).await.unwrap_err(),
        ServiceError::UnknownTunnel(_)
    ));
}

#[tokio::test]
async fn adopt_wires_an_external_connector() {
    let _guard = API_LOCK.lock().unwrap();
    let env = test_env(CONNECTED_STUB).await;
    env.service.add("app", app_config(env.port)).await.unwrap();

    // Something else spawned this connector (say, a previous process)
    let stub = env._dir.path().join("bin").join("cloudflared");
    let process = ConnectorProcess::spawn(&stub, "tok", &SpawnOptions::default())
        .await
        .unwrap();
    let pid = process.pid();

    env.service
        .adopt(
            "app",
            process,
            AdoptedTunnel {
                tunnel_id: TUNNEL_ID.to_string(),
                connector_token: "tok".to_string(),
                public_url: "https://app.example.com".to_string(),
            },
        )
        .await
        .unwrap();

    // The registration line from the adopted child drives the same
    // transition as a spawned one
    wait_for_state(&env.service, "app", TunnelState::Connected).await;
    let snapshot = env.service.get("app").await.unwrap();
    assert_eq!(snapshot.pid, Some(pid));
    assert_eq!(env.registry.get("app").unwrap().unwrap().pid, pid);

    env.service.stop("app", false).await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_everything_and_persists() {
    let _guard = API_LOCK.lock().unwrap();
    let env = test_env(CONNECTED_STUB).await;
    env.service.add("app", app_config(env.port)).await.unwrap();

    env.service.start("app").await.unwrap();
    wait_for_state(&env.service, "app", TunnelState::Connected).await;
    let pid = env.service.get("app").await.unwrap().pid.unwrap();

    let failures = env.service.shutdown().await;
    assert!(failures.is_empty());

    assert!(!tuinnel_connector::pid_is_alive(pid));
    let snapshot = env.service.get("app").await.unwrap();
    assert_eq!(snapshot.state, TunnelState::Stopped);
    assert!(env.registry.get("app").unwrap().is_none());

    // The state snapshot taken before the kills survives: a tunnel running
    // at shutdown stays persisted as running, so the next session's
    // auto_start resumes it
    let config = env.config_store.load().unwrap();
    assert_eq!(config.tunnels["app"].last_state, Some(LastState::Running));
}

#[tokio::test]
async fn auto_start_skips_tunnels_persisted_as_stopped() {
    let _guard = API_LOCK.lock().unwrap();
    let env = test_env(CONNECTED_STUB).await;

    let mut config = app_config(env.port);
    config.last_state = Some(LastState::Stopped);
    env.config_store
        .update(|global| {
            global.tunnels.insert("app".to_string(), config.clone());
        })
        .unwrap();

    // Rebuild the service so it loads the persisted tunnel
    let api = ApiClient::with_base_url("t", env._server.uri()).unwrap();
    let binary = BinaryManager::new(env._dir.path().join("bin"));
    let service = TunnelService::new(
        api,
        binary,
        env.registry.clone(),
        env.config_store.clone(),
    )
    .unwrap();

    let failures = service.auto_start().await;
    assert!(failures.is_empty());
    assert_eq!(
        service.get("app").await.unwrap().state,
        TunnelState::Stopped
    );
}
