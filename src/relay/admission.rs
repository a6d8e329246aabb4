//! Admission control for stream upgrades
//!
//! Per-IP fixed-window upgrade throttling, temporary bans and connection caps.
//! The per-IP table and the global open-connection count sit behind one lock
//! so the cap checks and the increment on promotion cannot interleave.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rate limits and connection caps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub upgrade_window: Duration,
    pub max_upgrades_per_window: u32,
    pub ban_duration: Duration,
    pub max_conns_global: usize,
    pub max_conns_per_ip: usize,
}

/// Why an upgrade was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("client address could not be resolved")]
    UnresolvedIp,
    #[error("client is banned")]
    Banned,
    #[error("upgrade rate exceeded")]
    RateLimited,
    #[error("global connection limit reached")]
    GlobalCapacity,
    #[error("per-IP connection limit reached")]
    PerIpCapacity,
    #[error("unknown stream path")]
    UnknownPath,
    #[error("no stream token configured")]
    Misconfigured,
    #[error("missing or invalid bearer token")]
    Unauthorized,
}

impl Rejection {
    /// HTTP status returned to the client
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::UnresolvedIp
            | Rejection::Banned
            | Rejection::RateLimited
            | Rejection::PerIpCapacity => StatusCode::TOO_MANY_REQUESTS,
            Rejection::GlobalCapacity => StatusCode::SERVICE_UNAVAILABLE,
            Rejection::UnknownPath => StatusCode::NOT_FOUND,
            Rejection::Misconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            Rejection::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_string()).into_response();
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        response
    }
}

#[derive(Debug)]
struct IpState {
    window_start: Instant,
    upgrades: u32,
    banned_until: Option<Instant>,
    open: usize,
}

impl IpState {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            upgrades: 0,
            banned_until: None,
            open: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    ips: HashMap<IpAddr, IpState>,
    open_total: usize,
}

/// Shared admission state
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    limits: AdmissionLimits,
    tables: Arc<Mutex<Tables>>,
}

impl AdmissionControl {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }

    /// Ban, rate and capacity checks for one upgrade attempt
    pub fn screen(&self, ip: IpAddr) -> Result<(), Rejection> {
        self.screen_at(ip, Instant::now())
    }

    /// [`screen`](Self::screen) at an explicit instant
    pub fn screen_at(&self, ip: IpAddr, now: Instant) -> Result<(), Rejection> {
        let mut tables = self.tables.lock();
        let open_total = tables.open_total;
        let state = tables.ips.entry(ip).or_insert_with(|| IpState::new(now));

        if let Some(until) = state.banned_until {
            if now < until {
                return Err(Rejection::Banned);
            }
            state.banned_until = None;
        }

        if now.duration_since(state.window_start) >= self.limits.upgrade_window {
            state.window_start = now;
            state.upgrades = 0;
        }
        state.upgrades += 1;
        if state.upgrades > self.limits.max_upgrades_per_window {
            state.banned_until = Some(now + self.limits.ban_duration);
            warn!(
                ip = %ip,
                upgrades = state.upgrades,
                ban = %crate::utils::format_duration(self.limits.ban_duration),
                "Upgrade rate exceeded, banning"
            );
            return Err(Rejection::RateLimited);
        }

        if open_total >= self.limits.max_conns_global {
            return Err(Rejection::GlobalCapacity);
        }
        if state.open >= self.limits.max_conns_per_ip {
            return Err(Rejection::PerIpCapacity);
        }

        Ok(())
    }

    /// Count a promoted connection against both caps
    ///
    /// The caps are checked again under the same lock as the increment; the
    /// returned permit gives the slot back when dropped.
    pub fn try_admit(&self, ip: IpAddr) -> Result<ConnectionPermit, Rejection> {
        let mut tables = self.tables.lock();
        if tables.open_total >= self.limits.max_conns_global {
            return Err(Rejection::GlobalCapacity);
        }
        let now = Instant::now();
        let state = tables.ips.entry(ip).or_insert_with(|| IpState::new(now));
        if state.open >= self.limits.max_conns_per_ip {
            return Err(Rejection::PerIpCapacity);
        }
        state.open += 1;
        tables.open_total += 1;

        Ok(ConnectionPermit {
            ip,
            tables: Arc::clone(&self.tables),
        })
    }

    /// Open connections across all IPs
    pub fn open_connections(&self) -> usize {
        self.tables.lock().open_total
    }

    /// Open connections from one IP
    pub fn open_connections_for(&self, ip: IpAddr) -> usize {
        self.tables.lock().ips.get(&ip).map_or(0, |s| s.open)
    }

    /// IPs with admission state
    pub fn tracked_ips(&self) -> usize {
        self.tables.lock().ips.len()
    }

    /// Drop entries with no open connection, no running window and no
    /// active ban; returns how many were removed
    pub fn sweep_at(&self, now: Instant) -> usize {
        let window = self.limits.upgrade_window;
        let mut tables = self.tables.lock();
        let before = tables.ips.len();
        tables.ips.retain(|_, state| {
            state.open > 0
                || state.banned_until.is_some_and(|until| now < until)
                || now.duration_since(state.window_start) < window
        });
        before - tables.ips.len()
    }
}

/// One admitted connection's claim on the caps
#[derive(Debug)]
pub struct ConnectionPermit {
    ip: IpAddr,
    tables: Arc<Mutex<Tables>>,
}

impl ConnectionPermit {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let mut tables = self.tables.lock();
        tables.open_total = tables.open_total.saturating_sub(1);
        if let Some(state) = tables.ips.get_mut(&self.ip) {
            state.open = state.open.saturating_sub(1);
        }
    }
}

/// Periodically evict idle per-IP entries until cancelled
pub async fn run_admission_sweeper(
    admission: AdmissionControl,
    every: Duration,
    cancellation: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval = %crate::utils::format_duration(every), "Admission sweeper started");

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = ticker.tick() => {
                let removed = admission.sweep_at(Instant::now());
                if removed > 0 {
                    debug!(removed, remaining = admission.tracked_ips(), "Swept idle admission entries");
                }
            }
        }
    }

    debug!("Admission sweeper stopped");
}

/// Client IP for admission
///
/// `X-Forwarded-For` is only consulted when the proxy is trusted; its first
/// entry must then be an IP address or the client is unresolved.
pub fn resolve_client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> Option<IpAddr> {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(value) = forwarded {
            let first = value.split(',').next().unwrap_or_default().trim();
            return first.parse::<IpAddr>().ok().map(|ip| ip.to_canonical());
        }
    }
    Some(peer.ip().to_canonical())
}

/// Check `Authorization: Bearer <token>` against the configured token
pub fn check_bearer(headers: &HeaderMap, expected: Option<&str>) -> Result<(), Rejection> {
    let expected = match expected {
        Some(token) if !token.is_empty() => token,
        _ => return Err(Rejection::Misconfigured),
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();

    if presented.is_empty() || !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return Err(Rejection::Unauthorized);
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
