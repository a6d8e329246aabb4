//! Live fan-out
//!
//! Each live share is serialized once and the same frame is offered to every
//! open, matching connection. Nothing is retried.

use super::registry::{ConnectionRegistry, Delivery, LiveFrame};
use crate::sharelog::share_matches;
use crate::types::{LineOrigin, Share, StreamEvent};
use crate::Result;
use axum::extract::ws::Utf8Bytes;
use std::sync::Arc;
use tracing::trace;

/// Per-share delivery counts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub matched: usize,
    pub delivered: usize,
    pub dropped: usize,
}

/// Offer one live share to every matching subscriber
///
/// `origin` travels with the frame so a connection can skip lines its
/// replay already delivered.
pub fn broadcast_live_share(
    registry: &ConnectionRegistry,
    share: Arc<Share>,
    origin: LineOrigin,
) -> Result<BroadcastOutcome> {
    let mut outcome = BroadcastOutcome::default();
    let mut frame: Option<LiveFrame> = None;

    let event = StreamEvent::Share {
        replay: false,
        share: Arc::clone(&share),
    };

    let mut failed = None;
    registry.for_each(|id, handle| {
        if failed.is_some() || !handle.is_open() || !share_matches(&share, handle.subscription()) {
            return;
        }
        outcome.matched += 1;

        let payload = match &frame {
            Some(payload) => payload.clone(),
            None => match event.to_json() {
                Ok(json) => frame
                    .insert(LiveFrame {
                        text: Utf8Bytes::from(json),
                        origin: Arc::new(origin.clone()),
                    })
                    .clone(),
                Err(e) => {
                    failed = Some(e);
                    return;
                }
            },
        };

        match handle.offer(payload) {
            Delivery::Queued => outcome.delivered += 1,
            Delivery::Dropped | Delivery::Closed => {
                trace!(connection = %id, "Live frame dropped");
                outcome.dropped += 1;
            }
        }
    });

    match failed {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::ConnectionHandle;
    use crate::sharelog::parser::parse_share_line_at;
    use crate::types::{ConnectionId, Subscription};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn subscribe(
        registry: &ConnectionRegistry,
        address: &str,
        worker: Option<&str>,
        capacity: usize,
    ) -> mpsc::Receiver<LiveFrame> {
        let (tx, rx) = mpsc::channel(capacity);
        let sub = Arc::new(Subscription::new(address, worker, 10.0).unwrap());
        registry.register(ConnectionId::new(), ConnectionHandle::new(sub, tx));
        rx
    }

    fn origin(end: u64) -> LineOrigin {
        LineOrigin {
            path: "00000001/a.sharelog".into(),
            inode: 7,
            end,
        }
    }

    fn share(workername: &str) -> Arc<Share> {
        Arc::new(parse_share_line_at(&json!({ "workername": workername }).to_string(), 0.0).unwrap())
    }

    #[test]
    fn test_only_matching_subscribers_receive() {
        let registry = ConnectionRegistry::new();
        let mut all = subscribe(&registry, "addrA", None, 8);
        let mut rig_b = subscribe(&registry, "addrA", Some("workerB"), 8);
        let mut other = subscribe(&registry, "addrZ", None, 8);

        let outcome = broadcast_live_share(&registry, share("addrA.workerA"), origin(40)).unwrap();
        assert_eq!(outcome, BroadcastOutcome { matched: 1, delivered: 1, dropped: 0 });

        let frame = all.try_recv().unwrap();
        assert_eq!(frame.origin.end, 40);
        let event: Value = serde_json::from_str(frame.text.as_str()).unwrap();
        assert_eq!(event["type"], "share");
        assert_eq!(event["replay"], false);
        assert_eq!(event["share"]["worker"], "workera");

        assert!(rig_b.try_recv().is_err());
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_full_or_closed_connections_are_skipped() {
        let registry = ConnectionRegistry::new();
        let mut slow = subscribe(&registry, "addr", None, 1);
        let gone = subscribe(&registry, "addr", None, 1);
        drop(gone);

        let first = broadcast_live_share(&registry, share("addr.rig"), origin(10)).unwrap();
        assert_eq!(first.matched, 1);
        assert_eq!(first.delivered, 1);

        let second = broadcast_live_share(&registry, share("addr.rig"), origin(20)).unwrap();
        assert_eq!(second.dropped, 1);

        assert!(slow.try_recv().is_ok());
        assert!(slow.try_recv().is_err());
    }
}
