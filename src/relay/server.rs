//! HTTP front end
//!
//! `/health` reports liveness and the active limits. Every other request goes
//! through the upgrade gate, which runs admission in a fixed order before a
//! socket is promoted to the share stream.

use super::admission::{check_bearer, resolve_client_ip, ConnectionPermit, Rejection};
use super::connection::run_connection;
use super::SharedState;
use crate::types::StreamParams;
use crate::Result;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Path of the share stream
pub const STREAM_PATH: &str = "/ws/shares";

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub ok: bool,
    pub logs_dir: PathBuf,
    pub tick_ms: u64,
    pub track_last_rounds: usize,
    pub max_conns_global: usize,
    pub max_conns_per_ip: usize,
    pub max_upgrades_per_window: u32,
    pub upgrade_window_ms: u64,
    pub open_connections: usize,
    pub subscriptions: usize,
    pub tracked_ips: usize,
    pub started_at: DateTime<Utc>,
}

/// Build the application router
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(upgrade_gate)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn serve(listener: TcpListener, state: SharedState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let local = listener.local_addr()?;
    info!(addr = %local, path = STREAM_PATH, "Relay listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    info!("Relay stopped accepting connections");
    Ok(())
}

async fn health(State(state): State<SharedState>) -> Json<HealthReport> {
    let config = &state.config;
    Json(HealthReport {
        ok: true,
        logs_dir: config.logs_dir.clone(),
        tick_ms: config.tick_ms,
        track_last_rounds: config.track_last_rounds,
        max_conns_global: config.max_conns_global,
        max_conns_per_ip: config.max_conns_per_ip,
        max_upgrades_per_window: config.max_upgrades_per_window,
        upgrade_window_ms: config.upgrade_window_ms,
        open_connections: state.admission.open_connections(),
        subscriptions: state.registry.len(),
        tracked_ips: state.admission.tracked_ips(),
        started_at: state.started_at,
    })
}

async fn upgrade_gate(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Plain HTTP never touches admission state
    let Ok(upgrade) = upgrade else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let permit = match admit(&state, peer, &uri, &headers) {
        Ok(permit) => permit,
        Err(rejection) => {
            debug!(peer = %peer, path = uri.path(), reason = %rejection, "Upgrade rejected");
            return rejection.into_response();
        }
    };

    let params = Query::<StreamParams>::try_from_uri(&uri)
        .map(|Query(params)| params)
        .unwrap_or_default();

    upgrade.on_upgrade(move |socket| run_connection(socket, state, params, permit))
}

/// Admission checks in their fixed order; the permit is taken last
fn admit(
    state: &SharedState,
    peer: SocketAddr,
    uri: &Uri,
    headers: &HeaderMap,
) -> std::result::Result<ConnectionPermit, Rejection> {
    let ip = resolve_client_ip(headers, peer, state.config.trust_proxy)
        .ok_or(Rejection::UnresolvedIp)?;
    state.admission.screen(ip)?;

    if uri.path() != STREAM_PATH {
        return Err(Rejection::UnknownPath);
    }
    check_bearer(headers, state.config.ws_token.as_deref())?;

    state.admission.try_admit(ip)
}
