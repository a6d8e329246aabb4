//! Live poll loop
//!
//! Owns the watcher outright: every cycle tails the tracked sharelogs, parses
//! the new lines and fans each share out to the registry.

use super::broadcast::broadcast_live_share;
use super::registry::ConnectionRegistry;
use crate::sharelog::{parse_share_line, ShareLogWatcher, WatcherSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one cycle did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Complete lines read
    pub lines: usize,
    /// Lines that parsed as shares
    pub parsed: usize,
    /// Frames queued to subscribers
    pub delivered: usize,
    /// Frames lost to full or closed buffers
    pub dropped: usize,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }
}

pub struct LiveScheduler {
    watcher: ShareLogWatcher,
    registry: Arc<ConnectionRegistry>,
    tick: Duration,
}

impl LiveScheduler {
    pub fn new(settings: WatcherSettings, registry: Arc<ConnectionRegistry>, tick: Duration) -> Self {
        Self {
            watcher: ShareLogWatcher::new(settings),
            registry,
            tick,
        }
    }

    /// Run one poll cycle
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        for tailed in self.watcher.tick().await {
            report.lines += 1;
            let Some(mut share) = parse_share_line(&tailed.line) else {
                continue;
            };
            report.parsed += 1;
            let origin = tailed.origin();
            share.round = Some(tailed.round);
            share.file = Some(tailed.path);

            match broadcast_live_share(&self.registry, Arc::new(share), origin) {
                Ok(outcome) => {
                    report.delivered += outcome.delivered;
                    report.dropped += outcome.dropped;
                }
                Err(e) => warn!(error = %e, "Failed to encode live share"),
            }
        }

        report
    }

    /// Poll at the configured interval until cancelled
    pub async fn run(mut self, cancellation: CancellationToken) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            tick = %crate::utils::format_duration(self.tick),
            "Live scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if !report.is_empty() {
                        debug!(
                            lines = report.lines,
                            parsed = report.parsed,
                            delivered = report.delivered,
                            dropped = report.dropped,
                            backlog = self.watcher.backlog_len(),
                            rounds = self.watcher.tracked_rounds().len(),
                            files = self.watcher.tracked_files(),
                            "Cycle complete"
                        );
                    }
                }
            }
        }

        info!("Live scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::{ConnectionHandle, LiveFrame};
    use crate::sharelog::{HistoryReplayer, HistorySettings};
    use crate::types::{ConnectionId, EventSink, StreamEvent, Subscription};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn append(path: &Path, data: &str) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    fn scheduler(root: &Path, registry: Arc<ConnectionRegistry>, budget: usize) -> LiveScheduler {
        LiveScheduler::new(
            WatcherSettings {
                logs_dir: root.to_path_buf(),
                suffix: ".sharelog".to_string(),
                track_last_rounds: 6,
                max_lines_per_tick: budget,
                fresh_file_grace: Duration::ZERO,
            },
            registry,
            Duration::from_millis(10),
        )
    }

    fn subscribe(registry: &ConnectionRegistry, address: &str) -> mpsc::Receiver<LiveFrame> {
        let (tx, rx) = mpsc::channel(64);
        let sub = Arc::new(Subscription::new(address, None, 10.0).unwrap());
        registry.register(ConnectionId::new(), ConnectionHandle::new(sub, tx));
        rx
    }

    fn line(workername: &str, n: u32) -> String {
        format!("{}\n", json!({ "workername": workername, "nonce": n }))
    }

    #[tokio::test]
    async fn test_cycle_parses_and_delivers() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("0000abcd")).unwrap();
        let file = dir.path().join("0000abcd/0000abcd00000001.sharelog");
        append(&file, &line("addr.old", 0));

        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx = subscribe(&registry, "addr");
        let mut s = scheduler(dir.path(), Arc::clone(&registry), 100);

        assert!(s.run_cycle().await.is_empty());

        append(&file, &line("addr.rig", 1));
        append(&file, "garbage\n");
        append(&file, &line("other.rig", 2));

        let report = s.run_cycle().await;
        assert_eq!(
            report,
            CycleReport { lines: 3, parsed: 2, delivered: 1, dropped: 0 }
        );

        let live = rx.try_recv().unwrap();
        assert_eq!(live.origin.path, file);
        assert_eq!(live.origin.end, 2 * line("addr.old", 0).len() as u64);
        let frame: Value = serde_json::from_str(live.text.as_str()).unwrap();
        assert_eq!(frame["replay"], false);
        assert_eq!(frame["share"]["raw"]["nonce"], 1);
        assert_eq!(frame["share"]["round"], "0000abcd");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_budget_spreads_lines_over_cycles() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("00000001")).unwrap();
        let file = dir.path().join("00000001/a.sharelog");
        append(&file, "");

        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx = subscribe(&registry, "addr");
        let mut s = scheduler(dir.path(), Arc::clone(&registry), 2);
        s.run_cycle().await;

        for n in 0..5 {
            append(&file, &line("addr.rig", n));
        }

        let mut delivered = Vec::new();
        for expected in [2, 2, 1, 0] {
            assert_eq!(s.run_cycle().await.delivered, expected);
            while let Ok(frame) = rx.try_recv() {
                let v: Value = serde_json::from_str(frame.text.as_str()).unwrap();
                delivered.push(v["share"]["raw"]["nonce"].as_u64().unwrap());
            }
        }
        assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<StreamEvent>,
    }

    #[async_trait]
    impl EventSink for Recorder {
        async fn send_event(&mut self, event: &StreamEvent) -> crate::Result<()> {
            self.events.push(event.clone());
            Ok(())
        }
    }

    fn nonces_of(events: &[StreamEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Share { share, .. } => share.raw["nonce"].as_u64(),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_line_tailed_before_replay_reads_it_is_sent_once() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("00000001")).unwrap();
        let file = dir.path().join("00000001/a.sharelog");
        append(&file, "");

        let registry = Arc::new(ConnectionRegistry::new());
        let mut s = scheduler(dir.path(), Arc::clone(&registry), 100);
        s.run_cycle().await;

        // Connection order: register, then replay; the tail wins the race
        let mut rx = subscribe(&registry, "addr");
        append(&file, &line("addr.rig", 42));
        assert_eq!(s.run_cycle().await.delivered, 1);

        let replayer = HistoryReplayer::new(HistorySettings {
            logs_dir: dir.path().to_path_buf(),
            suffix: ".sharelog".to_string(),
            scan_rounds: 15,
            max_files: 200,
        });
        let sub = Subscription::new("addr", None, 10.0).unwrap();
        let mut sink = Recorder::default();
        let summary = replayer
            .replay(&sub, crate::utils::current_timestamp_secs(), &mut sink)
            .await
            .unwrap();
        assert_eq!(summary.sent, 1);

        append(&file, &line("addr.rig", 43));
        assert_eq!(s.run_cycle().await.delivered, 1);

        let mut delivered = nonces_of(&sink.events);
        while let Ok(frame) = rx.try_recv() {
            if summary.coverage.covers(&frame.origin) {
                continue;
            }
            let v: Value = serde_json::from_str(frame.text.as_str()).unwrap();
            delivered.push(v["share"]["raw"]["nonce"].as_u64().unwrap());
        }
        assert_eq!(delivered, vec![42, 43]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(dir.path(), Arc::new(ConnectionRegistry::new()), 10);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(s.run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
