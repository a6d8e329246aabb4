//! End-to-end tests against a real listener
//!
//! The live scheduler is driven by hand with `run_cycle` so each test decides
//! exactly when appended lines are picked up.

use assert_matches::assert_matches;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode};
use clap::Parser;
use futures::StreamExt;
use serde_json::{json, Value};
use sharelog_relay::relay::{router, serve, LiveScheduler, RelayState, SharedState};
use sharelog_relay::Config;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const TOKEN: &str = "test-token";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Relay {
    addr: SocketAddr,
    state: SharedState,
    scheduler: LiveScheduler,
    _dir: TempDir,
    root: PathBuf,
}

fn config(root: &Path, token: Option<&str>) -> Config {
    let root = root.to_str().unwrap().to_string();
    let mut args = vec![
        "sharelog-relay".to_string(),
        "--logs-dir".to_string(),
        root,
        "--fresh-file-grace-ms".to_string(),
        "0".to_string(),
        "--host".to_string(),
        "127.0.0.1".to_string(),
    ];
    if let Some(token) = token {
        args.push("--ws-token".to_string());
        args.push(token.to_string());
    }
    Config::try_parse_from(args).unwrap()
}

async fn start(token: Option<&str>) -> Relay {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let state = RelayState::new(config(&root, token), CancellationToken::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state.clone()));

    Relay {
        addr,
        scheduler: state.live_scheduler(),
        state,
        _dir: dir,
        root,
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64()
}

fn share_line(workername: &str, username: Option<&str>, nonce: u32) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    let mut record = json!({
        "workername": workername,
        "createdate": format!("{},{:09}", now.as_secs(), now.subsec_nanos()),
        "nonce": nonce,
        "result": true,
    });
    if let Some(username) = username {
        record["username"] = json!(username);
    }
    format!("{}\n", record)
}

fn append(path: &Path, data: &str) {
    let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
    f.write_all(data.as_bytes()).unwrap();
}

/// Backdate a file so the tailer treats it as already consumed
fn backdate(path: &Path) {
    let f = OpenOptions::new().write(true).open(path).unwrap();
    f.set_modified(SystemTime::now() - Duration::from_secs(2)).unwrap();
}

async fn connect(relay: &Relay, query: &str, token: Option<&str>) -> Result<Client, WsError> {
    let url = format!("ws://{}/ws/shares?{}", relay.addr, query);
    connect_url(&url, token).await
}

async fn connect_url(url: &str, token: Option<&str>) -> Result<Client, WsError> {
    let mut request = url.into_client_request().unwrap();
    if let Some(token) = token {
        request
            .headers_mut()
            .insert("authorization", format!("Bearer {}", token).parse().unwrap());
    }
    connect_async(request).await.map(|(ws, _)| ws)
}

async fn next_event(ws: &mut Client) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for an event")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

async fn assert_quiet(ws: &mut Client) {
    let waited = timeout(Duration::from_millis(300), ws.next()).await;
    assert!(waited.is_err(), "unexpected event: {:?}", waited);
}

fn status_of(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_replay_then_live_for_worker_subscription() {
    let mut relay = start(Some(TOKEN)).await;
    let round = relay.root.join("00000001");
    fs::create_dir(&round).unwrap();
    let file = round.join("x.sharelog");
    append(&file, &share_line("addrA.workerA", None, 1));
    append(&file, &share_line("addrA.workerB", None, 2));
    backdate(&file);

    // Existing content belongs to history, not to the live tail
    assert!(relay.scheduler.run_cycle().await.is_empty());

    let mut ws = connect(&relay, "address=addrA&worker=workerB&minutes=5", Some(TOKEN))
        .await
        .unwrap();

    let hello = next_event(&mut ws).await;
    assert_eq!(hello, json!({"type": "hello", "address": "addra", "worker": "workerb", "minutes": 5.0}));

    let replayed = next_event(&mut ws).await;
    assert_eq!(replayed["type"], "share");
    assert_eq!(replayed["replay"], true);
    assert_eq!(replayed["share"]["raw"]["nonce"], 2);
    assert_eq!(replayed["share"]["round"], "00000001");

    let end = next_event(&mut ws).await;
    assert_eq!(end["type"], "history_end");
    assert_eq!(end["sent"], 1);
    assert_eq!(end["minutes"], 5.0);

    assert!(relay.scheduler.run_cycle().await.is_empty());
    assert_quiet(&mut ws).await;

    append(&file, &share_line("addrA.workerA", None, 3));
    append(&file, &share_line("addrA.workerB", None, 4));
    let report = relay.scheduler.run_cycle().await;
    assert_eq!(report.lines, 2);
    assert_eq!(report.delivered, 1);

    let live = next_event(&mut ws).await;
    assert_eq!(live["type"], "share");
    assert_eq!(live["replay"], false);
    assert_eq!(live["share"]["raw"]["nonce"], 4);
    assert_quiet(&mut ws).await;
}

#[tokio::test]
async fn test_address_subscription_uses_account_field() {
    let mut relay = start(Some(TOKEN)).await;
    let round = relay.root.join("0000000a");
    fs::create_dir(&round).unwrap();
    let file = round.join("a.sharelog");
    append(&file, "");
    backdate(&file);
    relay.scheduler.run_cycle().await;

    let mut ws = connect(&relay, "address=BC1QXYZ", Some(TOKEN)).await.unwrap();
    assert_eq!(next_event(&mut ws).await["type"], "hello");
    let end = next_event(&mut ws).await;
    assert_eq!(end["sent"], 0);
    assert_eq!(end["minutes"], 10.0);

    append(&file, &share_line("bc1qXYZ.Rig1", Some("bc1qxyz"), 1));
    append(&file, &share_line("other.Rig1", Some("other"), 2));
    relay.scheduler.run_cycle().await;

    let live = next_event(&mut ws).await;
    assert_eq!(live["share"]["address"], "bc1qxyz");
    assert_eq!(live["share"]["worker"], "rig1");
    assert_eq!(live["share"]["workername"], "bc1qXYZ.Rig1");
    assert_quiet(&mut ws).await;
}

#[tokio::test]
async fn test_failed_replay_reports_error_and_stays_live() {
    let mut relay = start(Some(TOKEN)).await;
    fs::remove_dir(&relay.root).unwrap();
    fs::write(&relay.root, b"not a directory").unwrap();

    let mut ws = connect(&relay, "address=addrA", Some(TOKEN)).await.unwrap();
    assert_eq!(next_event(&mut ws).await["type"], "hello");

    let error = next_event(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "history_failed");
    assert!(error["detail"].as_str().unwrap().starts_with("Replay error"));
    assert_quiet(&mut ws).await;
    assert_eq!(relay.state.registry.len(), 1);

    fs::remove_file(&relay.root).unwrap();
    fs::create_dir_all(relay.root.join("00000001")).unwrap();
    let file = relay.root.join("00000001/x.sharelog");
    append(&file, "");
    backdate(&file);
    relay.scheduler.run_cycle().await;

    append(&file, &share_line("addrA.rig", None, 9));
    assert_eq!(relay.scheduler.run_cycle().await.delivered, 1);
    let live = next_event(&mut ws).await;
    assert_eq!(live["replay"], false);
    assert_eq!(live["share"]["raw"]["nonce"], 9);
}

#[tokio::test]
async fn test_upgrade_requires_bearer_token() {
    let relay = start(Some(TOKEN)).await;

    let err = connect(&relay, "address=a", None).await.unwrap_err();
    assert_eq!(status_of(err), 401);

    let err = connect(&relay, "address=a", Some("wrong")).await.unwrap_err();
    assert_eq!(status_of(err), 401);

    assert_eq!(relay.state.admission.open_connections(), 0);
}

#[tokio::test]
async fn test_upgrade_without_configured_token_fails_closed() {
    let relay = start(None).await;
    let err = connect(&relay, "address=a", Some("anything")).await.unwrap_err();
    assert_eq!(status_of(err), 500);
}

#[tokio::test]
async fn test_unknown_stream_path_is_refused() {
    let relay = start(Some(TOKEN)).await;
    let url = format!("ws://{}/ws/other?address=a", relay.addr);
    let err = connect_url(&url, Some(TOKEN)).await.unwrap_err();
    assert_eq!(status_of(err), 404);
}

#[tokio::test]
async fn test_missing_address_closes_with_policy_code() {
    let relay = start(Some(TOKEN)).await;
    let mut ws = connect(&relay, "worker=rig", Some(TOKEN)).await.unwrap();

    let message = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_matches!(message, Message::Close(Some(frame)) => {
        assert_eq!(frame.code, CloseCode::Policy);
        assert!(frame.reason.as_str().starts_with("Missing address param"));
    });
}

#[tokio::test]
async fn test_connection_slot_released_on_close() {
    let relay = start(Some(TOKEN)).await;
    let mut ws = connect(&relay, "address=a&minutes=0", Some(TOKEN)).await.unwrap();
    assert_eq!(next_event(&mut ws).await["type"], "hello");
    assert_eq!(next_event(&mut ws).await["type"], "history_end");
    assert_eq!(relay.state.admission.open_connections(), 1);
    assert_eq!(relay.state.registry.len(), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let deadline = now_secs() + 5.0;
    while relay.state.admission.open_connections() > 0 && now_secs() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(relay.state.admission.open_connections(), 0);
    assert_eq!(relay.state.registry.len(), 0);
}

#[tokio::test]
async fn test_per_ip_cap_rejects_extra_connections() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), Some(TOKEN));
    config.max_conns_per_ip = 1;
    let state = RelayState::new(config, CancellationToken::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state.clone()));

    let url = format!("ws://{}/ws/shares?address=a", addr);
    let mut first = connect_url(&url, Some(TOKEN)).await.unwrap();
    assert_eq!(next_event(&mut first).await["type"], "hello");

    let err = connect_url(&url, Some(TOKEN)).await.unwrap_err();
    assert_eq!(status_of(err), 429);
}

#[tokio::test]
async fn test_health_reports_limits() {
    let relay = start(Some(TOKEN)).await;
    let response = router(relay.state.clone())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["ok"], true);
    assert_eq!(health["tickMs"], 1000);
    assert_eq!(health["trackLastRounds"], 6);
    assert_eq!(health["maxConnsGlobal"], 200);
    assert_eq!(health["maxConnsPerIp"], 30);
    assert_eq!(health["maxUpgradesPerWindow"], 60);
    assert_eq!(health["upgradeWindowMs"], 10000);
    assert_eq!(health["openConnections"], 0);
    assert_eq!(health["logsDir"], relay.root.to_str().unwrap());
}

#[tokio::test]
async fn test_plain_http_elsewhere_is_not_found() {
    let relay = start(Some(TOKEN)).await;
    let app = router(relay.state.clone()).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9))));

    let response = app
        .oneshot(Request::get("/ws/shares").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(relay.state.admission.tracked_ips(), 0);
}
