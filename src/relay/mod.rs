//! WebSocket relay
//!
//! Admission control in front of the streaming endpoint, the registry of live
//! subscribers, fan-out of live shares and the poll loop feeding it.

pub mod admission;
pub mod broadcast;
pub mod connection;
pub mod registry;
pub mod scheduler;
pub mod server;

pub use admission::{AdmissionControl, AdmissionLimits, ConnectionPermit, Rejection};
pub use broadcast::{broadcast_live_share, BroadcastOutcome};
pub use registry::{ConnectionHandle, ConnectionRegistry, LiveFrame};
pub use scheduler::{CycleReport, LiveScheduler};
pub use server::{router, serve, STREAM_PATH};

use crate::config::{Config, StreamSettings};
use crate::sharelog::HistoryReplayer;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// State shared by the HTTP handlers and connection tasks
#[derive(Debug)]
pub struct RelayState {
    pub config: Arc<Config>,
    pub admission: AdmissionControl,
    pub registry: Arc<ConnectionRegistry>,
    pub history: HistoryReplayer,
    pub stream: StreamSettings,
    pub live_buffer: usize,
    pub started_at: DateTime<Utc>,
    /// Cancelled when the process is shutting down
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<RelayState>;

impl RelayState {
    pub fn new(config: Config, shutdown: CancellationToken) -> SharedState {
        Arc::new(Self {
            admission: AdmissionControl::new(config.admission_limits()),
            registry: Arc::new(ConnectionRegistry::new()),
            history: HistoryReplayer::new(config.history_settings()),
            stream: config.stream_settings(),
            live_buffer: config.live_buffer,
            started_at: Utc::now(),
            shutdown,
            config: Arc::new(config),
        })
    }

    /// Scheduler feeding this state's registry
    pub fn live_scheduler(&self) -> LiveScheduler {
        LiveScheduler::new(
            self.config.watcher_settings(),
            Arc::clone(&self.registry),
            self.config.tick_duration(),
        )
    }
}
