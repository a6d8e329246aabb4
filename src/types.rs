//! Core types for the sharelog relay
//!
//! The parsed share record, consumer subscriptions and the event envelope
//! delivered over the streaming endpoint.

use crate::config::StreamSettings;
use crate::utils::{clamp, fold_case};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// One share submission parsed from a sharelog line
///
/// Identifier, difficulty and outcome fields are passed through exactly as
/// they appear in the log. `address` and `worker` are the canonical,
/// case-folded values used for matching.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub workinfoid: Option<Value>,
    pub clientid: Option<Value>,
    pub diff: Option<Value>,
    pub sdiff: Option<Value>,
    pub hash: Option<Value>,
    pub result: Option<Value>,
    pub errn: Option<Value>,
    pub createdate: Option<Value>,
    /// Submission time in fractional epoch seconds
    pub ts: f64,
    pub workername: Option<String>,
    pub username: Option<String>,
    pub address: Option<String>,
    pub worker: Option<String>,
    /// Address part of `workername`, verbatim
    pub workername_addr: Option<String>,
    /// Miner IP (the log's `address` field)
    pub ip: Option<Value>,
    pub agent: Option<Value>,
    pub reject_reason: Option<Value>,
    pub round: Option<String>,
    pub file: Option<PathBuf>,
    pub raw: Map<String, Value>,
}

/// Query parameters accepted by the streaming endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamParams {
    pub address: Option<String>,
    pub worker: Option<String>,
    pub minutes: Option<String>,
}

/// A live consumer's filter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    /// Case-folded address, never empty
    pub address: String,
    /// Case-folded worker suffix
    pub worker: Option<String>,
    /// Replay window in minutes
    pub minutes: f64,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Build a subscription; `None` when the address folds to nothing
    pub fn new(address: &str, worker: Option<&str>, minutes: f64) -> Option<Self> {
        let address = fold_case(address)?;
        Some(Self {
            address,
            worker: worker.and_then(fold_case),
            minutes,
            created_at: Utc::now(),
        })
    }

    /// Resolve a subscription from request parameters
    ///
    /// `minutes` falls back to the configured default when absent or not a
    /// number, then is clamped to `[0, max]`.
    pub fn from_params(params: &StreamParams, settings: &StreamSettings) -> Option<Self> {
        let minutes = params
            .minutes
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .and_then(|m| m.parse::<f64>().ok())
            .filter(|m| m.is_finite())
            .unwrap_or(settings.default_minutes);
        let minutes = clamp(minutes, 0.0, settings.max_minutes);

        Self::new(
            params.address.as_deref().unwrap_or_default(),
            params.worker.as_deref(),
            minutes,
        )
    }
}

/// File position of a tailed line
///
/// `end` is the byte offset just past the line's terminator in the file
/// identified by `path` and `inode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineOrigin {
    pub path: PathBuf,
    pub inode: u64,
    pub end: u64,
}

/// Identifier of one streaming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random connection id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event envelope sent to stream consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Hello {
        address: String,
        worker: Option<String>,
        minutes: f64,
    },
    Share {
        replay: bool,
        share: Arc<Share>,
    },
    HistoryEnd {
        sent: u64,
        minutes: f64,
    },
    Error {
        message: String,
        detail: String,
    },
}

impl StreamEvent {
    /// Greeting echoing the resolved subscription
    pub fn hello(subscription: &Subscription) -> Self {
        StreamEvent::Hello {
            address: subscription.address.clone(),
            worker: subscription.worker.clone(),
            minutes: subscription.minutes,
        }
    }

    /// Error notice that leaves the connection open
    pub fn error(message: impl Into<String>, detail: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
            detail: detail.into(),
        }
    }

    /// Serialize to the JSON text frame sent on the wire
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Destination for stream events
///
/// Implemented by the WebSocket writer half; replay writes through it so the
/// same code path can be exercised without a socket.
#[async_trait]
pub trait EventSink: Send {
    /// Deliver one event, failing once the consumer is gone
    async fn send_event(&mut self, event: &StreamEvent) -> Result<()>;
}
