// =============================================================================
// Reconciliation engine — correlates stream events with the trade ledger
// =============================================================================
//
// Two entry points, both invoked from stream workers:
//
//   on_order_fill     — a fill observed on the order channel. The intended
//                       action comes from the submit-time association; fills
//                       of a stop/take-profit cloid close their parent trade;
//                       anything else is an orphan.
//
//   on_position_change — a position decrease observed on the position
//                       channel. Resolved pid -> cloid via the ledger, with
//                       a (symbol, posSide) fallback that learns the binding.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::ledger::TradeLedger;
use crate::types::{ActionType, CloseEvent, OrderRecord, SIZE_EPSILON};

pub struct ReconciliationEngine {
    ledger: Arc<TradeLedger>,
}

impl ReconciliationEngine {
    pub fn new(ledger: Arc<TradeLedger>) -> Self {
        Self { ledger }
    }

    /// Handle a fill delta for `rec`. Resolution order:
    ///   1. submit-time `oid` association (knows the intended action),
    ///   2. the record's own `cloid` if the ledger tracks it,
    ///   3. the stop/take-profit index (fill of an exit order closes the
    ///      parent),
    ///   4. orphan: journaled under `cloid = NULL` and reported as a
    ///      conflict.
    pub async fn on_order_fill(&self, rec: &OrderRecord, fill_delta: f64) -> Result<()> {
        if fill_delta <= SIZE_EPSILON {
            return Ok(());
        }
        let fill_px = rec.fill_px.or(rec.px).unwrap_or(0.0);

        if let Some((cloid, action)) = self.ledger.pending_action(&rec.oid) {
            self.ledger
                .apply_fill(&cloid, Some(&rec.oid), action, fill_delta, fill_px)
                .await?;
            return Ok(());
        }

        if let Some(cloid) = rec.cloid.as_deref() {
            if let Some(trade) = self.ledger.get_by_cloid(cloid) {
                // No submit association: infer direction from current state.
                let action = if trade.current_size > SIZE_EPSILON {
                    ActionType::Add
                } else {
                    ActionType::Open
                };
                debug!(cloid, oid = %rec.oid, action = %action, "fill without submit record");
                self.ledger
                    .apply_fill(cloid, Some(&rec.oid), action, fill_delta, fill_px)
                    .await?;
                return Ok(());
            }

            if let Some(parent) = self.ledger.exit_parent(cloid) {
                debug!(
                    parent = %parent,
                    exit_cloid = %cloid,
                    "exit order filled, closing parent trade"
                );
                self.ledger
                    .apply_fill(&parent, Some(&rec.oid), ActionType::Close, fill_delta, fill_px)
                    .await?;
                return Ok(());
            }
        }

        warn!(
            oid = %rec.oid,
            cloid = ?rec.cloid,
            symbol = %rec.symbol,
            fill_delta,
            "fill for unknown trade, journaling as orphan"
        );
        self.ledger
            .record_unattributed(&rec.symbol, rec.pos_side, Some(&rec.oid), fill_delta)?;
        Err(EngineError::LedgerConflict {
            cloid: rec.cloid.clone().unwrap_or_default(),
        })
    }

    /// Handle a detected position decrease. Unresolvable events are journaled
    /// with `cloid = NULL` and otherwise ignored.
    pub async fn on_position_change(&self, ev: &CloseEvent) -> Result<()> {
        let cloid = match self.ledger.cloid_for_pid(&ev.pid) {
            Some(c) => Some(c),
            None => {
                // First position event for this pid: learn the binding from
                // the unique open trade on (symbol, posSide).
                let found = self.ledger.find_open(&ev.symbol, ev.pos_side);
                if let Some(c) = &found {
                    self.ledger.bind_pid(c, &ev.pid);
                }
                found
            }
        };

        match cloid {
            None => {
                self.ledger.record_unattributed_close(ev)?;
                Ok(())
            }
            Some(cloid) => {
                let outcome = self
                    .ledger
                    .apply_external_close(&cloid, ev.close_amount, ev.is_full_close, ev.u_time)
                    .await?;
                debug!(
                    pid = %ev.pid,
                    cloid = %cloid,
                    outcome = ?outcome,
                    "position change reconciled"
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::exchange::{AlgoRequest, ExchangeClient, OrderRequest};
    use crate::ledger::OpenParams;
    use crate::store::Store;
    use crate::types::{
        MarginMode, OrdType, OrderState, PosSide, Side, TradeState,
    };

    struct NullExchange;

    #[async_trait]
    impl ExchangeClient for NullExchange {
        async fn submit_order(&self, _req: &OrderRequest) -> Result<String> {
            Ok("O-null".to_string())
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

    fn setup() -> (Arc<TradeLedger>, ReconciliationEngine, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(TradeLedger::new(store.clone(), Arc::new(NullExchange)));
        let engine = ReconciliationEngine::new(ledger.clone());
        (ledger, engine, store)
    }

    fn fill_record(oid: &str, cloid: Option<&str>, fill_sz: f64, px: f64) -> OrderRecord {
        OrderRecord {
            oid: oid.into(),
            cloid: cloid.map(str::to_string),
            symbol: "ETH-USDT-SWAP".into(),
            side: Side::Buy,
            pos_side: PosSide::Long,
            ord_type: OrdType::Market,
            px: None,
            sz: fill_sz,
            fill_px: Some(px),
            fill_sz,
            state: OrderState::Filled,
            leverage: Some(3.0),
            margin_mode: MarginMode::Isolated,
            tag: None,
            created_at: 1700000000000,
            updated_at: 1700000000000,
        }
    }

    fn close_event(pid: &str, amount: f64, full: bool, u_time: i64) -> CloseEvent {
        CloseEvent {
            pid: pid.into(),
            symbol: "ETH-USDT-SWAP".into(),
            pos_side: PosSide::Long,
            close_amount: amount,
            is_full_close: full,
            u_time,
            mark_px: Some(3100.0),
        }
    }

    #[tokio::test]
    async fn fill_with_submit_association_uses_recorded_action() {
        let (ledger, engine, _store) = setup();
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

        engine
            .on_order_fill(&fill_record("O1", Some(&ticket.cloid), 1.0, 3000.0), 1.0)
            .await
            .unwrap();

        let trade = ledger.get_by_cloid(&ticket.cloid).unwrap();
        assert_eq!(trade.current_size, 1.0);
        assert_eq!(trade.entry_price, 3000.0);
    }

    #[tokio::test]
    async fn exit_order_fill_closes_the_parent() {
        let (ledger, engine, _store) = setup();
        let ticket = ledger
            .open(OpenParams {
                symbol: "ETH-USDT-SWAP".into(),
                pos_side: PosSide::Long,
                size: 1.0,
                leverage: 3.0,
                signal_id: None,
                stop_loss: Some(2800.0),
                take_profit: None,
            })
            .unwrap();
        ledger
            .apply_fill(&ticket.cloid, Some("O1"), ActionType::Open, 1.0, 3000.0)
            .await
            .unwrap();

        let sl = ticket.stop_loss_cloid.clone().unwrap();
        engine
            .on_order_fill(&fill_record("O9", Some(&sl), 1.0, 2800.0), 1.0)
            .await
            .unwrap();

        let trade = ledger.get_by_cloid(&ticket.cloid).unwrap();
        assert_eq!(trade.state, TradeState::Closed);
        assert_eq!(trade.current_size, 0.0);
    }

    #[tokio::test]
    async fn orphan_fill_is_journaled_and_reported() {
        let (_ledger, engine, store) = setup();
        let err = engine
            .on_order_fill(&fill_record("O7", Some("unknown-cloid"), 1.0, 3000.0), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LedgerConflict { .. }));

        let orphans = store.actions_for(None).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].oid.as_deref(), Some("O7"));
    }

    #[tokio::test]
    async fn zero_delta_fill_is_ignored() {
        let (_ledger, engine, store) = setup();
        engine
            .on_order_fill(&fill_record("O1", Some("whatever"), 1.0, 3000.0), 0.0)
            .await
            .unwrap();
        assert!(store.actions_for(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn position_change_learns_pid_binding_via_fallback() {
        let (ledger, engine, _store) = setup();
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
            .apply_fill(&ticket.cloid, Some("O1"), ActionType::Open, 1.0, 3000.0)
            .await
            .unwrap();

        engine
            .on_position_change(&close_event("P1", 0.4, false, 1700000000001))
            .await
            .unwrap();

        // The binding was learned and the close applied.
        assert_eq!(ledger.cloid_for_pid("P1"), Some(ticket.cloid.clone()));
        let trade = ledger.get_by_cloid(&ticket.cloid).unwrap();
        assert!((trade.current_size - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unresolvable_position_change_is_journaled_unattributed() {
        let (_ledger, engine, store) = setup();
        engine
            .on_position_change(&close_event("P-unknown", 1.0, true, 1700000000001))
            .await
            .unwrap();

        let orphans = store.actions_for(None).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].action, ActionType::ExternalClose);
        assert_eq!(orphans[0].amount, 1.0);
    }
}
