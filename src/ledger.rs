// =============================================================================
// Trade ledger — per-cloid serialized bookkeeping of logical trades
// =============================================================================
//
// The ledger is the single writer of trade state. Two caller groups share it:
// the embedding REST layer (open / record_submit / mark_intent) and the
// reconciliation engine (apply_fill / apply_external_close). Every mutation
// of one trade is serialized through that trade's async operation lock;
// snapshot reads take a brief inner lock only.
//
// Trades are never deleted: a CLOSED trade stays resident so late stream
// events resolve to a no-op instead of an orphan.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::exchange::ExchangeClient;
use crate::store::Store;
use crate::types::{
    ActionType, CloseEvent, Intent, IntentKind, PosSide, Trade, TradeAction, TradeState,
    SIZE_EPSILON,
};

/// How long a declared local intent stays valid.
const INTENT_TTL: Duration = Duration::from_secs(60);

struct TradeCell {
    /// Serializes multi-step transitions (mutate, persist, cancel exits).
    op_lock: tokio::sync::Mutex<()>,
    inner: parking_lot::Mutex<Trade>,
}

/// Parameters for opening a logical trade.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub symbol: String,
    pub pos_side: PosSide,
    pub size: f64,
    pub leverage: f64,
    pub signal_id: Option<i64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Identifiers assigned by [`TradeLedger::open`], used for order submission.
#[derive(Debug, Clone)]
pub struct OpenTicket {
    pub cloid: String,
    pub stop_loss_cloid: Option<String>,
    pub take_profit_cloid: Option<String>,
}

/// Result of applying a fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillOutcome {
    Applied { closed: bool, remaining: f64 },
    /// The trade was already CLOSED; the fill is a late duplicate of a
    /// transition that has happened.
    AlreadyClosed,
}

/// Result of applying an externally-observed close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CloseOutcome {
    Applied {
        action: ActionType,
        closed: bool,
        remaining: f64,
    },
    AlreadyClosed,
    /// Replay at or below the last applied `u_time`; ignored.
    StaleReplay,
}

pub struct TradeLedger {
    store: Arc<Store>,
    exchange: Arc<dyn ExchangeClient>,
    trades: RwLock<HashMap<String, Arc<TradeCell>>>,
    /// Venue position id -> cloid, set once per pid.
    by_pid: RwLock<HashMap<String, String>>,
    /// Stop/take-profit cloid -> parent trade cloid.
    exit_index: RwLock<HashMap<String, String>>,
    /// Submitted oid -> (cloid, intended action), set by `record_submit`.
    pending_orders: RwLock<HashMap<String, (String, ActionType)>>,
}

impl TradeLedger {
    pub fn new(store: Arc<Store>, exchange: Arc<dyn ExchangeClient>) -> Self {
        Self {
            store,
            exchange,
            trades: RwLock::new(HashMap::new()),
            by_pid: RwLock::new(HashMap::new()),
            exit_index: RwLock::new(HashMap::new()),
            pending_orders: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory state from persisted non-CLOSED trades. Returns
    /// the number of trades recovered. `pid` bindings are re-learned from the
    /// stream, not persisted.
    pub fn load_open(&self) -> Result<usize> {
        let open = self.store.open_trades()?;
        let count = open.len();
        let mut trades = self.trades.write();
        let mut exits = self.exit_index.write();
        for trade in open {
            if let Some(sl) = &trade.stop_loss_cloid {
                exits.insert(sl.clone(), trade.cloid.clone());
            }
            if let Some(tp) = &trade.take_profit_cloid {
                exits.insert(tp.clone(), trade.cloid.clone());
            }
            trades.insert(
                trade.cloid.clone(),
                Arc::new(TradeCell {
                    op_lock: tokio::sync::Mutex::new(()),
                    inner: parking_lot::Mutex::new(trade),
                }),
            );
        }
        if count > 0 {
            info!(count, "recovered open trades from store");
        }
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // REST-layer surface
    // -------------------------------------------------------------------------

    /// Create a logical trade pre-submission and return its identifiers.
    /// `current_size` starts at zero; the trade is confirmed by its first
    /// fill.
    pub fn open(&self, params: OpenParams) -> Result<OpenTicket> {
        let cloid = gen_cloid(&params.symbol, params.pos_side);
        let stop_loss_cloid = params
            .stop_loss
            .map(|_| gen_cloid(&params.symbol, params.pos_side));
        let take_profit_cloid = params
            .take_profit
            .map(|_| gen_cloid(&params.symbol, params.pos_side));

        let trade = Trade {
            cloid: cloid.clone(),
            symbol: params.symbol.clone(),
            pos_side: params.pos_side,
            signal_id: params.signal_id,
            current_size: 0.0,
            entry_price: 0.0,
            leverage: params.leverage,
            stop_loss_cloid: stop_loss_cloid.clone(),
            take_profit_cloid: take_profit_cloid.clone(),
            state: TradeState::Open,
            opened_at: Utc::now(),
            closed_at: None,
            pending_intent: None,
            last_external_utime: 0,
        };

        self.store.upsert_trade(&trade)?;

        {
            let mut exits = self.exit_index.write();
            if let Some(sl) = &stop_loss_cloid {
                exits.insert(sl.clone(), cloid.clone());
            }
            if let Some(tp) = &take_profit_cloid {
                exits.insert(tp.clone(), cloid.clone());
            }
        }
        self.trades.write().insert(
            cloid.clone(),
            Arc::new(TradeCell {
                op_lock: tokio::sync::Mutex::new(()),
                inner: parking_lot::Mutex::new(trade),
            }),
        );

        info!(
            cloid = %cloid,
            symbol = %params.symbol,
            pos_side = %params.pos_side,
            size = params.size,
            leverage = params.leverage,
            "trade opened (pre-submit)"
        );

        Ok(OpenTicket {
            cloid,
            stop_loss_cloid,
            take_profit_cloid,
        })
    }

    /// Associate a submitted venue order id with its trade and intended
    /// action. The journal row for the action is written once the fill
    /// arrives and the amount is known.
    pub fn record_submit(&self, cloid: &str, oid: &str, action: ActionType) -> Result<()> {
        if self.cell(cloid).is_none() {
            return Err(EngineError::LedgerConflict {
                cloid: cloid.to_string(),
            });
        }
        self.pending_orders
            .write()
            .insert(oid.to_string(), (cloid.to_string(), action));
        debug!(cloid, oid, action = %action, "submission recorded");
        Ok(())
    }

    /// Declare a local reduce/close intent. Valid for 60 s; a position
    /// decrease observed while the intent is active is journaled as the
    /// intended action instead of EXTERNAL_CLOSE. A Close intent moves the
    /// trade to CLOSING.
    pub fn mark_intent(&self, cloid: &str, kind: IntentKind) -> Result<()> {
        let cell = self.cell(cloid).ok_or_else(|| EngineError::LedgerConflict {
            cloid: cloid.to_string(),
        })?;
        let snapshot = {
            let mut trade = cell.inner.lock();
            if trade.state == TradeState::Closed {
                return Ok(());
            }
            trade.pending_intent = Some(Intent {
                kind,
                set_at: Instant::now(),
            });
            if kind == IntentKind::Close && trade.state == TradeState::Open {
                trade.state = TradeState::Closing;
            }
            trade.clone()
        };
        self.store.upsert_trade(&snapshot)?;
        debug!(cloid, kind = ?kind, "intent marked");
        Ok(())
    }

    /// Bind a venue position id to a trade. Idempotent; an existing binding
    /// to a different trade is kept and the attempt logged.
    pub fn bind_pid(&self, cloid: &str, pid: &str) {
        let mut by_pid = self.by_pid.write();
        if let Some(existing) = by_pid.get(pid) {
            if existing != cloid {
                warn!(
                    pid,
                    bound = %existing,
                    attempted = %cloid,
                    "refusing to rebind position id"
                );
            }
            return;
        }
        by_pid.insert(pid.to_string(), cloid.to_string());
        debug!(pid, cloid, "position id bound");
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub fn get_by_cloid(&self, cloid: &str) -> Option<Trade> {
        self.cell(cloid).map(|c| c.inner.lock().clone())
    }

    pub fn get_by_pid(&self, pid: &str) -> Option<Trade> {
        let cloid = self.cloid_for_pid(pid)?;
        self.get_by_cloid(&cloid)
    }

    pub fn cloid_for_pid(&self, pid: &str) -> Option<String> {
        self.by_pid.read().get(pid).cloned()
    }

    /// Parent trade of a stop/take-profit cloid, if any.
    pub fn exit_parent(&self, exit_cloid: &str) -> Option<String> {
        self.exit_index.read().get(exit_cloid).cloned()
    }

    /// Trade and intended action associated with a submitted oid.
    pub fn pending_action(&self, oid: &str) -> Option<(String, ActionType)> {
        self.pending_orders.read().get(oid).cloned()
    }

    /// The single non-CLOSED trade for `(symbol, pos_side)`. Ambiguity (more
    /// than one candidate) returns `None`; binding the wrong trade is worse
    /// than journaling an unattributed close.
    pub fn find_open(&self, symbol: &str, pos_side: PosSide) -> Option<String> {
        let trades = self.trades.read();
        let mut found: Option<String> = None;
        for cell in trades.values() {
            let trade = cell.inner.lock();
            if trade.state != TradeState::Closed
                && trade.symbol == symbol
                && trade.pos_side == pos_side
            {
                if found.is_some() {
                    warn!(symbol, pos_side = %pos_side, "multiple open trades match, not binding");
                    return None;
                }
                found = Some(trade.cloid.clone());
            }
        }
        found
    }

    // -------------------------------------------------------------------------
    // Engine surface
    // -------------------------------------------------------------------------

    /// Apply a fill delta to a trade. `action` decides the bookkeeping
    /// direction: OPEN/ADD grow the position and re-weight the entry price,
    /// REDUCE/CLOSE shrink it; a CLOSE reaching zero finishes the trade and
    /// cancels its conditional orders.
    pub async fn apply_fill(
        &self,
        cloid: &str,
        oid: Option<&str>,
        action: ActionType,
        fill_delta: f64,
        fill_px: f64,
    ) -> Result<FillOutcome> {
        let cell = self.cell(cloid).ok_or_else(|| EngineError::LedgerConflict {
            cloid: cloid.to_string(),
        })?;
        let _op = cell.op_lock.lock().await;

        let (snapshot, closed) = {
            let mut trade = cell.inner.lock();
            if trade.state == TradeState::Closed {
                debug!(cloid, "fill after close, ignoring");
                return Ok(FillOutcome::AlreadyClosed);
            }

            match action {
                ActionType::Open | ActionType::Add => {
                    let new_size = trade.current_size + fill_delta;
                    if new_size > SIZE_EPSILON {
                        trade.entry_price = (trade.entry_price * trade.current_size
                            + fill_px * fill_delta)
                            / new_size;
                    }
                    trade.current_size = new_size;
                }
                ActionType::Reduce => {
                    trade.current_size = (trade.current_size - fill_delta).max(0.0);
                }
                ActionType::Close | ActionType::ExternalClose => {
                    if trade.state == TradeState::Open {
                        trade.state = TradeState::Closing;
                    }
                    trade.current_size = (trade.current_size - fill_delta).max(0.0);
                    if trade.current_size <= SIZE_EPSILON {
                        trade.current_size = 0.0;
                        trade.state = TradeState::Closed;
                        trade.closed_at = Some(Utc::now());
                        trade.pending_intent = None;
                    }
                }
            }

            let closed = trade.state == TradeState::Closed;
            (trade.clone(), closed)
        };

        self.store.append_action(&TradeAction {
            id: None,
            cloid: Some(snapshot.cloid.clone()),
            signal_id: snapshot.signal_id,
            symbol: snapshot.symbol.clone(),
            pos_side: snapshot.pos_side,
            action,
            oid: oid.map(str::to_string),
            amount: fill_delta,
            ts: now_ms(),
        })?;
        self.store.upsert_trade(&snapshot)?;

        info!(
            cloid,
            action = %action,
            fill_delta,
            fill_px,
            remaining = snapshot.current_size,
            closed,
            "fill applied"
        );

        if closed {
            self.cancel_exit_orders(&snapshot).await;
        }

        Ok(FillOutcome::Applied {
            closed,
            remaining: snapshot.current_size,
        })
    }

    /// Apply an externally-observed position decrease. When a local intent is
    /// active the action is journaled as that intent (the decrease is ours,
    /// seen through the stream); otherwise as EXTERNAL_CLOSE.
    ///
    /// Idempotent per `(cloid, u_time)`: replays at or below the last applied
    /// `u_time` change nothing.
    pub async fn apply_external_close(
        &self,
        cloid: &str,
        amount: f64,
        is_full_close: bool,
        u_time: i64,
    ) -> Result<CloseOutcome> {
        let cell = self.cell(cloid).ok_or_else(|| EngineError::LedgerConflict {
            cloid: cloid.to_string(),
        })?;
        let _op = cell.op_lock.lock().await;

        let (snapshot, action, closed) = {
            let mut trade = cell.inner.lock();
            if trade.state == TradeState::Closed {
                debug!(cloid, u_time, "external close for CLOSED trade, no-op");
                return Ok(CloseOutcome::AlreadyClosed);
            }
            if u_time <= trade.last_external_utime {
                debug!(cloid, u_time, "replayed external close, no-op");
                return Ok(CloseOutcome::StaleReplay);
            }

            let action = trade
                .active_intent(INTENT_TTL)
                .map(|k| k.action())
                .unwrap_or(ActionType::ExternalClose);

            trade.current_size = (trade.current_size - amount).max(0.0);
            trade.last_external_utime = u_time;

            let closed = is_full_close || trade.current_size <= SIZE_EPSILON;
            if closed {
                trade.current_size = 0.0;
                trade.state = TradeState::Closed;
                trade.closed_at = Some(Utc::now());
                trade.pending_intent = None;
            }
            (trade.clone(), action, closed)
        };

        self.store.append_action(&TradeAction {
            id: None,
            cloid: Some(snapshot.cloid.clone()),
            signal_id: snapshot.signal_id,
            symbol: snapshot.symbol.clone(),
            pos_side: snapshot.pos_side,
            action,
            oid: None,
            amount,
            ts: now_ms(),
        })?;
        self.store.upsert_trade(&snapshot)?;

        info!(
            cloid,
            action = %action,
            amount,
            u_time,
            remaining = snapshot.current_size,
            closed,
            "position decrease applied"
        );

        if closed {
            self.cancel_exit_orders(&snapshot).await;
        }

        Ok(CloseOutcome::Applied {
            action,
            closed,
            remaining: snapshot.current_size,
        })
    }

    /// Journal an event that could not be attributed to any trade. Kept with
    /// `cloid = NULL` for audit; the periodic REST reconciliation picks these
    /// up out of band.
    pub fn record_unattributed(
        &self,
        symbol: &str,
        pos_side: PosSide,
        oid: Option<&str>,
        amount: f64,
    ) -> Result<()> {
        self.store.append_action(&TradeAction {
            id: None,
            cloid: None,
            signal_id: None,
            symbol: symbol.to_string(),
            pos_side,
            action: ActionType::ExternalClose,
            oid: oid.map(str::to_string),
            amount,
            ts: now_ms(),
        })?;
        warn!(symbol, pos_side = %pos_side, amount, "unattributed event journaled");
        Ok(())
    }

    /// Journal an unattributed close event.
    pub fn record_unattributed_close(&self, ev: &CloseEvent) -> Result<()> {
        self.record_unattributed(&ev.symbol, ev.pos_side, None, ev.close_amount)
    }

    // -------------------------------------------------------------------------
    // Internal
    // -------------------------------------------------------------------------

    fn cell(&self, cloid: &str) -> Option<Arc<TradeCell>> {
        self.trades.read().get(cloid).cloned()
    }

    /// Best-effort cancellation of a closed trade's conditional orders.
    /// Failures are logged, never fatal, and not retried.
    async fn cancel_exit_orders(&self, trade: &Trade) {
        for exit_cloid in [&trade.stop_loss_cloid, &trade.take_profit_cloid]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.exchange.cancel_algo(&trade.symbol, exit_cloid).await {
                warn!(
                    cloid = %trade.cloid,
                    exit_cloid = %exit_cloid,
                    error = %e,
                    "failed to cancel conditional order"
                );
            }
        }
    }
}

impl std::fmt::Debug for TradeLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeLedger")
            .field("trades", &self.trades.read().len())
            .field("pid_bindings", &self.by_pid.read().len())
            .finish()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `{symbol}_{side}_{yyyymmddHHMMSS}_{rand}`.
fn gen_cloid(symbol: &str, pos_side: PosSide) -> String {
    let ts = Utc::now().format("%Y%m%d%H%M%S");
    let rand = Uuid::new_v4().simple().to_string();
    format!("{symbol}_{}_{ts}_{}", pos_side.as_str(), &rand[..6])
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::exchange::{AlgoRequest, OrderRequest};
    use crate::types::MarginMode;

    #[derive(Default)]
    struct MockExchange {
        canceled_algos: Mutex<Vec<(String, String)>>,
        fail_cancels: bool,
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        async fn submit_order(&self, _req: &OrderRequest) -> Result<String> {
            Ok("O-mock".to_string())
        }

        async fn cancel_order(&self, _symbol: &str, _oid: &str) -> Result<()> {
            Ok(())
        }

        async fn place_algo(&self, req: &AlgoRequest) -> Result<String> {
            Ok(req.cloid.clone())
        }

        async fn cancel_algo(&self, symbol: &str, algo_cloid: &str) -> Result<()> {
            if self.fail_cancels {
                return Err(EngineError::Exchange {
                    code: "51400".into(),
                    msg: "cancellation failed".into(),
                });
            }
            self.canceled_algos
                .lock()
                .push((symbol.to_string(), algo_cloid.to_string()));
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

    fn ledger_with(exchange: Arc<MockExchange>) -> TradeLedger {
        let store = Arc::new(Store::open_in_memory().unwrap());
        TradeLedger::new(store, exchange)
    }

    fn open_params() -> OpenParams {
        OpenParams {
            symbol: "ETH-USDT-SWAP".into(),
            pos_side: PosSide::Long,
            size: 1.0,
            leverage: 3.0,
            signal_id: Some(42),
            stop_loss: Some(2800.0),
            take_profit: Some(3400.0),
        }
    }

    #[test]
    fn open_assigns_cloid_and_exit_cloids() {
        let ledger = ledger_with(Arc::new(MockExchange::default()));
        let ticket = ledger.open(open_params()).unwrap();

        assert!(ticket.cloid.starts_with("ETH-USDT-SWAP_long_"));
        let sl = ticket.stop_loss_cloid.clone().unwrap();
        let tp = ticket.take_profit_cloid.clone().unwrap();
        assert_ne!(sl, tp);
        assert_eq!(ledger.exit_parent(&sl), Some(ticket.cloid.clone()));
        assert_eq!(ledger.exit_parent(&tp), Some(ticket.cloid.clone()));

        let trade = ledger.get_by_cloid(&ticket.cloid).unwrap();
        assert_eq!(trade.state, TradeState::Open);
        assert_eq!(trade.current_size, 0.0);
        assert_eq!(trade.signal_id, Some(42));
    }

    #[tokio::test]
    async fn fills_weight_the_entry_price() {
        let ledger = ledger_with(Arc::new(MockExchange::default()));
        let ticket = ledger.open(open_params()).unwrap();

        ledger
            .apply_fill(&ticket.cloid, Some("O1"), ActionType::Open, 1.0, 3000.0)
            .await
            .unwrap();
        ledger
            .apply_fill(&ticket.cloid, Some("O2"), ActionType::Add, 1.0, 3100.0)
            .await
            .unwrap();

        let trade = ledger.get_by_cloid(&ticket.cloid).unwrap();
        assert_eq!(trade.current_size, 2.0);
        assert!((trade.entry_price - 3050.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn external_full_close_cancels_both_exit_orders() {
        let exchange = Arc::new(MockExchange::default());
        let ledger = ledger_with(exchange.clone());
        let ticket = ledger.open(open_params()).unwrap();
        ledger
            .apply_fill(&ticket.cloid, Some("O1"), ActionType::Open, 1.0, 3000.0)
            .await
            .unwrap();
        ledger.bind_pid(&ticket.cloid, "P1");

        let outcome = ledger
            .apply_external_close(&ticket.cloid, 1.0, true, 1700000000001)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CloseOutcome::Applied {
                action: ActionType::ExternalClose,
                closed: true,
                remaining: 0.0,
            }
        );

        let trade = ledger.get_by_cloid(&ticket.cloid).unwrap();
        assert_eq!(trade.state, TradeState::Closed);
        assert_eq!(trade.current_size, 0.0);
        assert!(trade.closed_at.is_some());

        let canceled = exchange.canceled_algos.lock();
        assert_eq!(canceled.len(), 2);
        assert!(canceled.iter().any(|(_, c)| Some(c) == ticket.stop_loss_cloid.as_ref()));
        assert!(canceled.iter().any(|(_, c)| Some(c) == ticket.take_profit_cloid.as_ref()));

        // Exactly one EXTERNAL_CLOSE journal row with the event amount.
        let rows = ledger.store.actions_for(Some(&ticket.cloid)).unwrap();
        let ext: Vec<_> = rows
            .iter()
            .filter(|a| a.action == ActionType::ExternalClose)
            .collect();
        assert_eq!(ext.len(), 1);
        assert_eq!(ext[0].amount, 1.0);
    }

    #[tokio::test]
    async fn partial_external_close_keeps_trade_open() {
        let exchange = Arc::new(MockExchange::default());
        let ledger = ledger_with(exchange.clone());
        let ticket = ledger.open(open_params()).unwrap();
        ledger
            .apply_fill(&ticket.cloid, Some("O1"), ActionType::Open, 2.0, 3000.0)
            .await
            .unwrap();

        let outcome = ledger
            .apply_external_close(&ticket.cloid, 1.5, false, 1700000000001)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CloseOutcome::Applied {
                action: ActionType::ExternalClose,
                closed: false,
                remaining: 0.5,
            }
        );

        let trade = ledger.get_by_cloid(&ticket.cloid).unwrap();
        assert_eq!(trade.state, TradeState::Open);
        assert!((trade.current_size - 0.5).abs() < 1e-9);
        assert!(exchange.canceled_algos.lock().is_empty());
    }

    #[tokio::test]
    async fn external_close_is_idempotent_per_utime() {
        let ledger = ledger_with(Arc::new(MockExchange::default()));
        let ticket = ledger.open(open_params()).unwrap();
        ledger
            .apply_fill(&ticket.cloid, Some("O1"), ActionType::Open, 2.0, 3000.0)
            .await
            .unwrap();

        ledger
            .apply_external_close(&ticket.cloid, 0.5, false, 1700000000001)
            .await
            .unwrap();
        let replay = ledger
            .apply_external_close(&ticket.cloid, 0.5, false, 1700000000001)
            .await
            .unwrap();
        assert_eq!(replay, CloseOutcome::StaleReplay);

        let trade = ledger.get_by_cloid(&ticket.cloid).unwrap();
        assert!((trade.current_size - 1.5).abs() < 1e-9);
        let rows = ledger.store.actions_for(Some(&ticket.cloid)).unwrap();
        let ext = rows
            .iter()
            .filter(|a| a.action == ActionType::ExternalClose)
            .count();
        assert_eq!(ext, 1);
    }

    #[tokio::test]
    async fn external_close_on_closed_trade_is_a_noop() {
        let ledger = ledger_with(Arc::new(MockExchange::default()));
        let ticket = ledger.open(open_params()).unwrap();
        ledger
            .apply_fill(&ticket.cloid, Some("O1"), ActionType::Open, 1.0, 3000.0)
            .await
            .unwrap();
        ledger
            .apply_external_close(&ticket.cloid, 1.0, true, 1700000000001)
            .await
            .unwrap();

        let rows_before = ledger.store.actions_for(Some(&ticket.cloid)).unwrap().len();
        let outcome = ledger
            .apply_external_close(&ticket.cloid, 1.0, true, 1700000000099)
            .await
            .unwrap();
        assert_eq!(outcome, CloseOutcome::AlreadyClosed);
        let rows_after = ledger.store.actions_for(Some(&ticket.cloid)).unwrap().len();
        assert_eq!(rows_before, rows_after);
    }

    #[tokio::test]
    async fn local_intent_wins_the_close_race() {
        let ledger = ledger_with(Arc::new(MockExchange::default()));
        let ticket = ledger.open(open_params()).unwrap();
        ledger
            .apply_fill(&ticket.cloid, Some("O1"), ActionType::Open, 1.0, 3000.0)
            .await
            .unwrap();

        // Local close declared, close order submitted; the position event
        // beats the fill frame.
        ledger.mark_intent(&ticket.cloid, IntentKind::Close).unwrap();
        assert_eq!(
            ledger.get_by_cloid(&ticket.cloid).unwrap().state,
            TradeState::Closing
        );

        let outcome = ledger
            .apply_external_close(&ticket.cloid, 1.0, true, 1700000000001)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CloseOutcome::Applied {
                action: ActionType::Close,
                closed: true,
                remaining: 0.0,
            }
        );

        // The late fill frame produces no duplicate transition.
        let fill = ledger
            .apply_fill(&ticket.cloid, Some("O2"), ActionType::Close, 1.0, 3100.0)
            .await
            .unwrap();
        assert_eq!(fill, FillOutcome::AlreadyClosed);

        // Exactly one terminal journal row, typed CLOSE.
        let rows = ledger.store.actions_for(Some(&ticket.cloid)).unwrap();
        let terminal: Vec<_> = rows
            .iter()
            .filter(|a| {
                matches!(a.action, ActionType::Close | ActionType::ExternalClose)
            })
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].action, ActionType::Close);
    }

    #[tokio::test]
    async fn current_size_clamps_at_zero() {
        let ledger = ledger_with(Arc::new(MockExchange::default()));
        let ticket = ledger.open(open_params()).unwrap();
        ledger
            .apply_fill(&ticket.cloid, Some("O1"), ActionType::Open, 1.0, 3000.0)
            .await
            .unwrap();

        let outcome = ledger
            .apply_external_close(&ticket.cloid, 5.0, false, 1700000000001)
            .await
            .unwrap();
        // Oversized decrement clamps and therefore terminates the trade.
        assert_eq!(
            outcome,
            CloseOutcome::Applied {
                action: ActionType::ExternalClose,
                closed: true,
                remaining: 0.0,
            }
        );
        assert!(ledger.get_by_cloid(&ticket.cloid).unwrap().current_size >= 0.0);
    }

    #[test]
    fn pid_binding_is_never_silently_rebound() {
        let ledger = ledger_with(Arc::new(MockExchange::default()));
        let a = ledger.open(open_params()).unwrap();
        let b = ledger.open(open_params()).unwrap();

        ledger.bind_pid(&a.cloid, "P1");
        ledger.bind_pid(&b.cloid, "P1");
        assert_eq!(ledger.cloid_for_pid("P1"), Some(a.cloid.clone()));
        // Re-binding the same pair is fine.
        ledger.bind_pid(&a.cloid, "P1");
        assert_eq!(ledger.cloid_for_pid("P1"), Some(a.cloid));
    }

    #[tokio::test]
    async fn fill_for_unknown_cloid_is_a_conflict() {
        let ledger = ledger_with(Arc::new(MockExchange::default()));
        let err = ledger
            .apply_fill("nope", None, ActionType::Open, 1.0, 3000.0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LedgerConflict { .. }));
    }

    #[tokio::test]
    async fn failed_algo_cancel_does_not_fail_the_close() {
        let exchange = Arc::new(MockExchange {
            fail_cancels: true,
            ..Default::default()
        });
        let ledger = ledger_with(exchange);
        let ticket = ledger.open(open_params()).unwrap();
        ledger
            .apply_fill(&ticket.cloid, Some("O1"), ActionType::Open, 1.0, 3000.0)
            .await
            .unwrap();

        let outcome = ledger
            .apply_external_close(&ticket.cloid, 1.0, true, 1700000000001)
            .await
            .unwrap();
        assert!(matches!(outcome, CloseOutcome::Applied { closed: true, .. }));
        assert_eq!(
            ledger.get_by_cloid(&ticket.cloid).unwrap().state,
            TradeState::Closed
        );
    }

    #[test]
    fn find_open_requires_a_unique_match() {
        let ledger = ledger_with(Arc::new(MockExchange::default()));
        let a = ledger.open(open_params()).unwrap();
        assert_eq!(
            ledger.find_open("ETH-USDT-SWAP", PosSide::Long),
            Some(a.cloid)
        );
        // A second open trade on the same (symbol, side) makes it ambiguous.
        ledger.open(open_params()).unwrap();
        assert_eq!(ledger.find_open("ETH-USDT-SWAP", PosSide::Long), None);
        assert_eq!(ledger.find_open("ETH-USDT-SWAP", PosSide::Short), None);
    }

    #[test]
    fn generated_cloids_follow_the_format() {
        let cloid = gen_cloid("ETH-USDT-SWAP", PosSide::Short);
        let parts: Vec<&str> = cloid.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "ETH-USDT-SWAP");
        assert_eq!(parts[1], "short");
        assert_eq!(parts[2].len(), 14);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[3].len(), 6);
    }
}
