// =============================================================================
// Position stream — diffs position frames and emits close events
// =============================================================================
//
// Three stages:
//
//   session read task   — enqueue raw elements (bounded, drop-newest).
//   classifier (1 task) — persist the snapshot row, diff against the
//                         last-known size per pid, claim the dedup key, and
//                         emit CloseEvents. Single-threaded so per-pid uTime
//                         order is preserved.
//   close worker (1)    — drive the reconciliation engine.
//
// `last_by_pid` is sharded to avoid one hot mutex when many symbols are
// active; no lock is held across a channel send.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::dedup::DedupRegistry;
use crate::reconciler::ReconciliationEngine;
use crate::store::Store;
use crate::stream::frames::{parse_decimal, PositionMsg, PushKind};
use crate::types::{CloseEvent, DedupKey, SIZE_EPSILON};

/// Number of shards in the last-known-position map.
const TRACKER_SHARDS: usize = 16;

/// One raw position element awaiting classification.
#[derive(Debug)]
pub struct PositionJob {
    pub kind: PushKind,
    pub msg: PositionMsg,
}

/// Session-side half of the position pipeline.
pub struct PositionStream {
    tx: Mutex<Option<mpsc::Sender<PositionJob>>>,
}

impl PositionStream {
    pub fn new(queue_size: usize) -> (Arc<Self>, mpsc::Receiver<PositionJob>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Enqueue the elements of one position frame. Called from the session
    /// read task; never blocks.
    pub fn handle(&self, kind: PushKind, data: Vec<PositionMsg>) {
        for msg in data {
            let guard = self.tx.lock();
            let Some(tx) = guard.as_ref() else { return };
            match tx.try_send(PositionJob { kind, msg }) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    error!(
                        pid = %job.msg.pos_id,
                        u_time = %job.msg.u_time,
                        "position queue saturated, dropping newest element"
                    );
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Close the queue; the classifier drains what is buffered and exits.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

// ---------------------------------------------------------------------------
// Last-known position tracker
// ---------------------------------------------------------------------------

/// Sharded map pid -> (size, u_time) of the last observed state.
pub struct PositionTracker {
    shards: Vec<Mutex<HashMap<String, (f64, i64)>>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            shards: (0..TRACKER_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, pid: &str) -> &Mutex<HashMap<String, (f64, i64)>> {
        let mut hasher = DefaultHasher::new();
        pid.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % TRACKER_SHARDS]
    }

    pub fn last(&self, pid: &str) -> Option<(f64, i64)> {
        self.shard(pid).lock().get(pid).copied()
    }

    pub fn update(&self, pid: &str, pos: f64, u_time: i64) {
        self.shard(pid).lock().insert(pid.to_string(), (pos, u_time));
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// A detected decrease: `(close_amount, is_full_close)`.
pub type CloseDecision = (f64, bool);

/// Decide whether a position observation is a close. Sizes are compared by
/// magnitude so hedged and net accounts classify alike.
///
/// Full close: size reached zero, and either the previous state is unknown
/// (conservative emit, the ledger no-ops if the trade is already closed) or
/// it was positive. Snapshots only emit for unknown pids: a snapshot
/// re-stating a zero we already observed is not news.
///
/// Partial close: a known positive size shrank but not to zero.
pub fn classify(kind: PushKind, pos: f64, prev: Option<f64>) -> Option<CloseDecision> {
    let pos = pos.abs();
    let prev = prev.map(f64::abs);

    if pos <= SIZE_EPSILON {
        let emit = match kind {
            PushKind::EventUpdate => prev.map_or(true, |p| p > SIZE_EPSILON),
            PushKind::Snapshot => prev.is_none(),
        };
        return emit.then(|| (prev.unwrap_or(0.0), true));
    }

    match prev {
        Some(p) if pos + SIZE_EPSILON < p => Some((p - pos, false)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Spawn the single classifier task.
pub fn spawn_classifier(
    mut rx: mpsc::Receiver<PositionJob>,
    tracker: Arc<PositionTracker>,
    dedup: Arc<DedupRegistry>,
    store: Arc<Store>,
    close_tx: mpsc::Sender<(DedupKey, CloseEvent)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("position classifier started");
        while let Some(job) = rx.recv().await {
            classify_one(job, &tracker, &dedup, &store, &close_tx);
        }
        debug!("position classifier stopped");
    })
}

fn classify_one(
    job: PositionJob,
    tracker: &PositionTracker,
    dedup: &DedupRegistry,
    store: &Store,
    close_tx: &mpsc::Sender<(DedupKey, CloseEvent)>,
) {
    let msg = job.msg;
    let Some(pos) = msg.pos_f64() else {
        warn!(pid = %msg.pos_id, raw = %msg.pos, "unparseable position size dropped");
        return;
    };
    let u_time = msg.u_time_ms();

    if let Some(snap) = msg.snapshot() {
        if let Err(e) = store.insert_position_snapshot(&snap) {
            warn!(pid = %msg.pos_id, error = %e, "snapshot persist failed");
        }
    }

    let prev = tracker.last(&msg.pos_id);

    // Out-of-order frame for this pid: the venue stamps uTime monotonically,
    // so anything older than the recorded state is a replay.
    if let Some((_, prev_ut)) = prev {
        if u_time < prev_ut {
            debug!(pid = %msg.pos_id, u_time, prev_ut, "stale position frame dropped");
            return;
        }
    }

    if let Some((close_amount, is_full_close)) = classify(job.kind, pos, prev.map(|(p, _)| p)) {
        let key = DedupKey::new(msg.pos_id.clone(), u_time);
        if dedup.is_processed(&key) {
            debug!(key = %key, "close event already processed");
        } else if dedup.try_claim(&key) {
            let ev = CloseEvent {
                pid: msg.pos_id.clone(),
                symbol: msg.inst_id.clone(),
                pos_side: msg.pos_side_parsed(),
                close_amount,
                is_full_close,
                u_time,
                mark_px: parse_decimal(&msg.mark_px),
            };
            match close_tx.try_send((key, ev)) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    error!(
                        key = %dropped.0,
                        "close-event queue saturated, dropping newest event"
                    );
                }
                Err(TrySendError::Closed(_)) => return,
            }
        } else {
            debug!(key = %key, "close event already in flight");
        }
    }

    // State is updated after the enqueue decision so the diff stays stable.
    tracker.update(&msg.pos_id, pos, u_time);
}

/// Spawn the close-event worker driving the reconciliation engine.
pub fn spawn_close_worker(
    mut rx: mpsc::Receiver<(DedupKey, CloseEvent)>,
    reconciler: Arc<ReconciliationEngine>,
    dedup: Arc<DedupRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("close worker started");
        while let Some((key, ev)) = rx.recv().await {
            if let Err(e) = reconciler.on_position_change(&ev).await {
                warn!(pid = %ev.pid, error = %e, "position reconciliation failed");
            }
            dedup.mark_processed(&key);
        }
        debug!("close worker stopped");
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn position_msg(pid: &str, pos: &str, u_time: &str) -> PositionMsg {
        serde_json::from_value(serde_json::json!({
            "posId": pid,
            "instId": "ETH-USDT-SWAP",
            "posSide": "long",
            "pos": pos,
            "availPos": pos,
            "avgPx": "3000",
            "uTime": u_time,
            "markPx": "3100",
            "lever": "3",
            "mgnMode": "isolated"
        }))
        .unwrap()
    }

    // --- classification table -------------------------------------------------

    #[test]
    fn full_close_on_event_update() {
        assert_eq!(
            classify(PushKind::EventUpdate, 0.0, Some(1.0)),
            Some((1.0, true))
        );
    }

    #[test]
    fn full_close_with_unknown_previous_state() {
        // Conservative emit with zero amount; the ledger no-ops when the
        // trade is already closed.
        assert_eq!(
            classify(PushKind::EventUpdate, 0.0, None),
            Some((0.0, true))
        );
        assert_eq!(classify(PushKind::Snapshot, 0.0, None), Some((0.0, true)));
    }

    #[test]
    fn snapshot_restating_known_zero_is_silent() {
        assert_eq!(classify(PushKind::Snapshot, 0.0, Some(0.0)), None);
        // Known-positive snapshots hitting zero still emit on event updates
        // only; the snapshot variant is silent once state exists.
        assert_eq!(classify(PushKind::Snapshot, 0.0, Some(1.0)), None);
    }

    #[test]
    fn zero_after_known_zero_is_silent() {
        assert_eq!(classify(PushKind::EventUpdate, 0.0, Some(0.0)), None);
    }

    #[test]
    fn partial_close_reports_the_difference() {
        assert_eq!(
            classify(PushKind::EventUpdate, 0.5, Some(2.0)),
            Some((1.5, false))
        );
    }

    #[test]
    fn unchanged_and_increase_emit_nothing() {
        assert_eq!(classify(PushKind::EventUpdate, 1.0, Some(1.0)), None);
        assert_eq!(classify(PushKind::EventUpdate, 2.0, Some(1.0)), None);
        assert_eq!(classify(PushKind::EventUpdate, 1.0, None), None);
    }

    #[test]
    fn short_positions_classify_by_magnitude() {
        assert_eq!(
            classify(PushKind::EventUpdate, -0.5, Some(-2.0)),
            Some((1.5, false))
        );
        assert_eq!(
            classify(PushKind::EventUpdate, 0.0, Some(-1.0)),
            Some((1.0, true))
        );
    }

    // --- tracker -------------------------------------------------------------

    #[test]
    fn tracker_remembers_the_last_observation() {
        let tracker = PositionTracker::new();
        assert_eq!(tracker.last("P1"), None);
        tracker.update("P1", 2.0, 1700000000000);
        tracker.update("P2", 1.0, 1700000000001);
        assert_eq!(tracker.last("P1"), Some((2.0, 1700000000000)));
        assert_eq!(tracker.last("P2"), Some((1.0, 1700000000001)));
        tracker.update("P1", 0.0, 1700000000002);
        assert_eq!(tracker.last("P1"), Some((0.0, 1700000000002)));
    }

    // --- classifier end-to-end -----------------------------------------------

    fn classifier_fixture() -> (
        Arc<PositionTracker>,
        Arc<DedupRegistry>,
        Arc<Store>,
        mpsc::Sender<(DedupKey, CloseEvent)>,
        mpsc::Receiver<(DedupKey, CloseEvent)>,
    ) {
        let (close_tx, close_rx) = mpsc::channel(16);
        (
            Arc::new(PositionTracker::new()),
            Arc::new(DedupRegistry::for_positions()),
            Arc::new(Store::open_in_memory().unwrap()),
            close_tx,
            close_rx,
        )
    }

    #[tokio::test]
    async fn external_full_close_emits_one_event() {
        let (tracker, dedup, store, close_tx, mut close_rx) = classifier_fixture();

        // Prior state arrives first.
        classify_one(
            PositionJob {
                kind: PushKind::Snapshot,
                msg: position_msg("P1", "1", "1700000000000"),
            },
            &tracker,
            &dedup,
            &store,
            &close_tx,
        );
        assert!(close_rx.try_recv().is_err());

        // Then the externally-triggered flat position.
        classify_one(
            PositionJob {
                kind: PushKind::EventUpdate,
                msg: position_msg("P1", "0", "1700000000001"),
            },
            &tracker,
            &dedup,
            &store,
            &close_tx,
        );

        let (key, ev) = close_rx.try_recv().unwrap();
        assert_eq!(key, DedupKey::new("P1", 1700000000001));
        assert_eq!(ev.close_amount, 1.0);
        assert!(ev.is_full_close);
        assert_eq!(ev.mark_px, Some(3100.0));

        // The duplicate frame is swallowed by the dedup gate.
        classify_one(
            PositionJob {
                kind: PushKind::EventUpdate,
                msg: position_msg("P1", "0", "1700000000001"),
            },
            &tracker,
            &dedup,
            &store,
            &close_tx,
        );
        assert!(close_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn snapshots_are_persisted_once_per_key() {
        let (tracker, dedup, store, close_tx, _close_rx) = classifier_fixture();

        for _ in 0..2 {
            classify_one(
                PositionJob {
                    kind: PushKind::Snapshot,
                    msg: position_msg("P1", "2", "1700000000000"),
                },
                &tracker,
                &dedup,
                &store,
                &close_tx,
            );
        }
        // Second insert was ignored by the (pid, u_time) primary key; the
        // classifier itself never errors on the replay.
        assert_eq!(tracker.last("P1"), Some((2.0, 1700000000000)));
    }

    #[tokio::test]
    async fn stale_frames_are_dropped() {
        let (tracker, dedup, store, close_tx, mut close_rx) = classifier_fixture();
        tracker.update("P1", 2.0, 1700000000005);

        classify_one(
            PositionJob {
                kind: PushKind::EventUpdate,
                msg: position_msg("P1", "0", "1700000000001"),
            },
            &tracker,
            &dedup,
            &store,
            &close_tx,
        );
        assert!(close_rx.try_recv().is_err());
        // State untouched by the stale frame.
        assert_eq!(tracker.last("P1"), Some((2.0, 1700000000005)));
    }
}
