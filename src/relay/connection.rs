//! Per-connection stream task
//!
//! `hello`, then the history replay ending in `history_end`, then live frames
//! until either side goes away. Live frames that arrive during the replay wait
//! in the connection's bounded buffer; those for lines the replay already
//! sent are skipped.

use super::admission::ConnectionPermit;
use super::registry::{ConnectionHandle, LiveFrame};
use super::SharedState;
use crate::sharelog::ReplayCoverage;
use crate::types::{ConnectionId, EventSink, StreamEvent, StreamParams, Subscription};
use crate::utils::current_timestamp_secs;
use crate::{Error, Result};
use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Close reason sent when the request names no address
pub const MISSING_ADDRESS_REASON: &str = "Missing address param (matches share.username)";

/// Writer half of a stream connection
pub struct WsEventSink {
    id: ConnectionId,
    sink: SplitSink<WebSocket, Message>,
}

impl WsEventSink {
    pub fn new(id: ConnectionId, sink: SplitSink<WebSocket, Message>) -> Self {
        Self { id, sink }
    }

    /// Send an already serialized frame
    pub async fn send_text(&mut self, text: Utf8Bytes) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|_| Error::connection_closed(self.id.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
    }
}

#[async_trait]
impl EventSink for WsEventSink {
    async fn send_event(&mut self, event: &StreamEvent) -> Result<()> {
        let text = event.to_json()?;
        self.send_text(Utf8Bytes::from(text)).await
    }
}

/// Drive one upgraded connection to completion
///
/// The permit is held for the whole lifetime of the socket and released when
/// this returns.
pub async fn run_connection(
    mut socket: WebSocket,
    state: SharedState,
    params: StreamParams,
    permit: ConnectionPermit,
) {
    let ip = permit.ip();
    let Some(subscription) = Subscription::from_params(&params, &state.stream) else {
        debug!(ip = %ip, "Stream request without address, closing");
        let frame = CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static(MISSING_ADDRESS_REASON),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
        return;
    };

    let id = ConnectionId::new();
    let span = info_span!(
        "connection",
        id = %id,
        ip = %ip,
        address = %subscription.address,
        worker = subscription.worker.as_deref().unwrap_or("*"),
    );

    serve_subscription(socket, state, id, Arc::new(subscription), permit)
        .instrument(span)
        .await;
}

async fn serve_subscription(
    socket: WebSocket,
    state: SharedState,
    id: ConnectionId,
    subscription: Arc<Subscription>,
    permit: ConnectionPermit,
) {
    let (sink, stream) = socket.split();
    let (frames_tx, frames_rx) = mpsc::channel(state.live_buffer);

    // Registered before replay so no live share between the replay scan and
    // the live phase is missed
    state.registry.register(
        id,
        ConnectionHandle::new(Arc::clone(&subscription), frames_tx),
    );
    info!(
        minutes = subscription.minutes,
        open = state.admission.open_connections(),
        "Stream connected"
    );

    let mut sink = WsEventSink::new(id, sink);
    let outcome = stream_events(&state, &subscription, &mut sink, stream, frames_rx).await;

    state.registry.remove(&id);
    drop(permit);

    match outcome {
        Ok(()) => info!("Stream closed"),
        Err(e) if e.is_connection_closed() => info!("Stream closed by peer"),
        Err(e) => warn!(error = %e, category = e.category(), "Stream ended with error"),
    }
}

async fn stream_events(
    state: &SharedState,
    subscription: &Subscription,
    sink: &mut WsEventSink,
    mut incoming: SplitStream<WebSocket>,
    mut frames: mpsc::Receiver<LiveFrame>,
) -> Result<()> {
    sink.send_event(&StreamEvent::hello(subscription)).await?;

    let replayed = match state
        .history
        .replay(subscription, current_timestamp_secs(), sink)
        .await
    {
        Ok(summary) => {
            debug!(
                sent = summary.sent,
                files = summary.coverage.len(),
                "Replay delivered"
            );
            summary.coverage
        }
        Err(e) if e.is_connection_closed() => return Err(e),
        Err(e) => {
            warn!(error = %e, "History replay failed");
            sink.send_event(&StreamEvent::error("history_failed", e.to_string()))
                .await?;
            ReplayCoverage::default()
        }
    };

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                sink.close(close_code::AWAY, "Server shutting down").await;
                return Ok(());
            }
            frame = frames.recv() => match frame {
                Some(frame) if replayed.covers(&frame.origin) => {
                    trace!(end = frame.origin.end, "Skipping live frame already replayed");
                }
                Some(frame) => sink.send_text(frame.text).await?,
                None => return Ok(()),
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(Error::from(e)),
                // Consumers have nothing to say; pings are answered by the transport
                Some(Ok(_)) => {}
            },
        }
    }
}
