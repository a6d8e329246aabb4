//! Live subscription registry

use crate::types::{ConnectionId, LineOrigin, Subscription};
use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outcome of queueing one frame for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Buffer full; the frame is lost for this connection only
    Dropped,
    /// The connection task is gone
    Closed,
}

/// A serialized live event and the sharelog line it was read from
#[derive(Debug, Clone)]
pub struct LiveFrame {
    pub text: Utf8Bytes,
    pub origin: Arc<LineOrigin>,
}

/// A registered connection as seen by the broadcaster
#[derive(Debug)]
pub struct ConnectionHandle {
    subscription: Arc<Subscription>,
    frames: mpsc::Sender<LiveFrame>,
}

impl ConnectionHandle {
    pub fn new(subscription: Arc<Subscription>, frames: mpsc::Sender<LiveFrame>) -> Self {
        Self {
            subscription,
            frames,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Whether the connection is still consuming frames
    pub fn is_open(&self) -> bool {
        !self.frames.is_closed()
    }

    /// Queue a frame without waiting
    pub fn offer(&self, frame: LiveFrame) -> Delivery {
        match self.frames.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// All connections that completed the upgrade
///
/// Each connection task inserts and removes only its own entry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId, handle: ConnectionHandle) {
        self.connections.insert(id, handle);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Visit every registered connection
    pub fn for_each(&self, mut f: impl FnMut(&ConnectionId, &ConnectionHandle)) {
        for entry in self.connections.iter() {
            f(entry.key(), entry.value());
        }
    }
}
