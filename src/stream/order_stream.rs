// =============================================================================
// Order stream — order-channel consumer with dedup gate and worker pool
// =============================================================================
//
// Stage 1 (session read task): dedup-gate each element and enqueue it on a
// bounded channel. A full queue drops the NEWEST element with an ERROR log;
// the periodic REST reconciliation run by the embedder recovers anything
// dropped here.
//
// Stage 2 (worker pool, default size 1): normalize, upsert into the store
// with the monotonic-state guard, and hand fill deltas to the reconciler.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::dedup::DedupRegistry;
use crate::error::EngineError;
use crate::reconciler::ReconciliationEngine;
use crate::store::Store;
use crate::stream::frames::OrderMsg;
use crate::types::{DedupKey, OrderState, SIZE_EPSILON};

/// One claimed order element awaiting a worker.
#[derive(Debug)]
pub struct OrderJob {
    pub key: DedupKey,
    pub msg: OrderMsg,
}

/// Session-side half of the order pipeline.
pub struct OrderStream {
    dedup: Arc<DedupRegistry>,
    tx: Mutex<Option<mpsc::Sender<OrderJob>>>,
}

impl OrderStream {
    pub fn new(
        queue_size: usize,
        dedup: Arc<DedupRegistry>,
    ) -> (Arc<Self>, mpsc::Receiver<OrderJob>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (
            Arc::new(Self {
                dedup,
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Gate and enqueue the elements of one order frame. Called from the
    /// session read task; never blocks.
    pub fn handle(&self, data: Vec<OrderMsg>) {
        for msg in data {
            let key = DedupKey::new(msg.ord_id.clone(), msg.u_time_ms());

            if self.dedup.is_processed(&key) {
                debug!(key = %key, "order event already processed");
                continue;
            }
            if !self.dedup.try_claim(&key) {
                debug!(key = %key, "order event already in flight");
                continue;
            }

            let guard = self.tx.lock();
            let Some(tx) = guard.as_ref() else { return };
            match tx.try_send(OrderJob { key, msg }) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    let e = EngineError::QueueFull {
                        key: job.key.to_string(),
                    };
                    error!(key = %job.key, error = %e, "order queue saturated, dropping newest event");
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Close the queue; workers drain what is buffered and exit.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

/// Spawn the worker pool draining `rx`.
pub fn spawn_workers(
    count: usize,
    rx: mpsc::Receiver<OrderJob>,
    store: Arc<Store>,
    reconciler: Arc<ReconciliationEngine>,
    dedup: Arc<DedupRegistry>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..count.max(1))
        .map(|id| {
            let rx = rx.clone();
            let store = store.clone();
            let reconciler = reconciler.clone();
            let dedup = dedup.clone();
            tokio::spawn(async move {
                debug!(worker = id, "order worker started");
                loop {
                    // The receiver lock is released between jobs so siblings
                    // interleave.
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    process_order(job, &store, &reconciler, &dedup).await;
                }
                debug!(worker = id, "order worker stopped");
            })
        })
        .collect()
}

async fn process_order(
    job: OrderJob,
    store: &Store,
    reconciler: &ReconciliationEngine,
    dedup: &DedupRegistry,
) {
    let OrderJob { key, msg } = job;

    let Some(rec) = msg.normalize() else {
        warn!(key = %key, side = %msg.side, state = %msg.state, "unparseable order element dropped");
        dedup.mark_processed(&key);
        return;
    };

    match store.upsert_order(&rec) {
        Err(e) => {
            error!(oid = %rec.oid, error = %e, "order upsert failed");
        }
        Ok(up) => {
            if up.applied
                && matches!(
                    rec.state,
                    OrderState::Filled | OrderState::PartiallyFilled
                )
            {
                let fill_delta = rec.fill_sz - up.prev_fill_sz;
                if fill_delta > SIZE_EPSILON {
                    match reconciler.on_order_fill(&rec, fill_delta).await {
                        Ok(()) => {}
                        // Orphans are journaled inside the reconciler; the
                        // conflict only matters to REST callers.
                        Err(EngineError::LedgerConflict { .. }) => {}
                        Err(e) => {
                            warn!(oid = %rec.oid, error = %e, "fill reconciliation failed");
                        }
                    }
                }
            }
        }
    }

    dedup.mark_processed(&key);
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::Result;
    use crate::exchange::{AlgoRequest, ExchangeClient, OrderRequest};
    use crate::ledger::{OpenParams, TradeLedger};
    use crate::types::{ActionType, MarginMode, PosSide};

    struct NullExchange;

    #[async_trait]
    impl ExchangeClient for NullExchange {
        async fn submit_order(&self, _req: &OrderRequest) -> Result<String> {
            Ok("O-null".into())
        }
        async fn cancel_order(&self, _symbol: &str, _oid: &str) -> Result<()> {
            Ok(())
        }
        async fn place_algo(&self, req: &AlgoRequest) -> Result<String> {
            Ok(req.cloid.clone())
        }
        async fn cancel_algo(&self, _symbol: &str, _algo_cloid: &str) -> Result<()> {
            Ok(())
        }
        async fn set_leverage(
            &self,
            _symbol: &str,
            _leverage: f64,
            _margin_mode: MarginMode,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn order_msg(oid: &str, cloid: &str, state: &str, acc_fill: &str, u_time: &str) -> OrderMsg {
        serde_json::from_value(serde_json::json!({
            "ordId": oid,
            "clOrdId": cloid,
            "instId": "ETH-USDT-SWAP",
            "side": "buy",
            "posSide": "long",
            "ordType": "market",
            "sz": "1",
            "accFillSz": acc_fill,
            "avgPx": "3000",
            "state": state,
            "tdMode": "isolated",
            "uTime": u_time
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_elements_are_enqueued_once() {
        let dedup = Arc::new(DedupRegistry::for_orders());
        let (stream, mut rx) = OrderStream::new(10, dedup);

        let msg = order_msg("O1", "C1", "filled", "1", "1700000000000");
        stream.handle(vec![msg.clone()]);
        stream.handle(vec![msg]);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_the_newest() {
        let dedup = Arc::new(DedupRegistry::for_orders());
        let (stream, mut rx) = OrderStream::new(1, dedup);

        stream.handle(vec![
            order_msg("O1", "C1", "live", "0", "1700000000000"),
            order_msg("O2", "C2", "live", "0", "1700000000001"),
        ]);

        // Only the oldest survived; the newest was dropped.
        let job = rx.try_recv().unwrap();
        assert_eq!(job.key.id, "O1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn worker_persists_and_applies_fill_deltas() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(TradeLedger::new(store.clone(), Arc::new(NullExchange)));
        let reconciler = Arc::new(ReconciliationEngine::new(ledger.clone()));
        let dedup = Arc::new(DedupRegistry::for_orders());
        let (stream, rx) = OrderStream::new(16, dedup.clone());

        let ticket = ledger
            .open(OpenParams {
                symbol: "ETH-USDT-SWAP".into(),
                pos_side: PosSide::Long,
                size: 1.0,
                leverage: 3.0,
                signal_id: None,
                stop_loss: None,
                take_profit: None,
            })
            .unwrap();
        ledger
            .record_submit(&ticket.cloid, "O1", ActionType::Open)
            .unwrap();

        // Partial fill, then the terminal fill: deltas 0.4 and 0.6.
        stream.handle(vec![
            order_msg("O1", &ticket.cloid, "partially_filled", "0.4", "1700000000000"),
            order_msg("O1", &ticket.cloid, "filled", "1", "1700000000001"),
        ]);
        stream.close();

        let workers = spawn_workers(1, rx, store.clone(), reconciler, dedup.clone());
        for w in workers {
            w.await.unwrap();
        }

        let trade = ledger.get_by_cloid(&ticket.cloid).unwrap();
        assert!((trade.current_size - 1.0).abs() < 1e-9);
        let stored = store.get_order("O1").unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Filled);
        assert!(dedup.is_processed(&DedupKey::new("O1", 1700000000000)));
        assert!(dedup.is_processed(&DedupKey::new("O1", 1700000000001)));
    }

    #[tokio::test]
    async fn order_without_cloid_is_stored_and_does_not_fault() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(TradeLedger::new(store.clone(), Arc::new(NullExchange)));
        let reconciler = Arc::new(ReconciliationEngine::new(ledger));
        let dedup = Arc::new(DedupRegistry::for_orders());
        let (stream, rx) = OrderStream::new(16, dedup.clone());

        let msg: OrderMsg = serde_json::from_value(serde_json::json!({
            "ordId": "O-ext",
            "instId": "ETH-USDT-SWAP",
            "side": "sell",
            "state": "filled",
            "accFillSz": "2",
            "avgPx": "3100",
            "uTime": "1700000000005"
        }))
        .unwrap();
        stream.handle(vec![msg]);
        stream.close();

        for w in spawn_workers(1, rx, store.clone(), reconciler, dedup.clone()) {
            w.await.unwrap();
        }

        let stored = store.get_order("O-ext").unwrap().unwrap();
        assert_eq!(stored.cloid, None);
        // The orphan fill is journaled for audit under cloid = NULL.
        assert_eq!(store.actions_for(None).unwrap().len(), 1);
        assert!(dedup.is_processed(&DedupKey::new("O-ext", 1700000000005)));
    }
}
