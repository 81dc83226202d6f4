// =============================================================================
// Persistent store — orders, position snapshots, trades, journal, signals
// =============================================================================
//
// Embedded SQLite behind a single connection mutex, plus a sharded in-memory
// order cache so the hot path (stream upserts, monotonic-state checks) never
// waits on the database reader.
//
// Write rules:
//   - orders: upsert by `oid`, refusing state regressions.
//   - position_snapshots: append-only, one row per (pid, u_time).
//   - trade_actions: append-only journal.
//   - trades: upsert by `cloid`; in-memory state is authoritative for reads.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{
    ActionType, MarginMode, OrdType, OrderRecord, OrderState, PosSide, PositionSnapshot, Side,
    Trade, TradeAction, TradeState,
};

/// Number of shards in the in-memory order cache.
const ORDER_SHARDS: usize = 16;

/// Outcome of an order upsert.
#[derive(Debug, Clone, Copy)]
pub struct OrderUpsert {
    /// Whether the write was applied (false on a state regression).
    pub applied: bool,
    /// Cumulative fill size before this write, for fill-delta computation.
    pub prev_fill_sz: f64,
}

pub struct Store {
    db: Mutex<Connection>,
    order_shards: Vec<Mutex<HashMap<String, OrderRecord>>>,
}

impl Store {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::error::EngineError::Transport(format!(
                        "creating store directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        info!(path = %path.display(), "store opened");
        Ok(Self::with_connection(conn))
    }

    /// In-memory store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
            order_shards: (0..ORDER_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, oid: &str) -> &Mutex<HashMap<String, OrderRecord>> {
        let mut hasher = DefaultHasher::new();
        oid.hash(&mut hasher);
        &self.order_shards[(hasher.finish() as usize) % ORDER_SHARDS]
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Upsert an order by `oid`, enforcing monotonic state progression. An
    /// update that would move a terminal order backwards is refused (and the
    /// previous fill size still returned so callers can diff).
    pub fn upsert_order(&self, rec: &OrderRecord) -> Result<OrderUpsert> {
        let mut shard = self.shard(&rec.oid).lock();

        let existing = match shard.get(&rec.oid) {
            Some(cached) => Some(cached.clone()),
            None => self.fetch_order(&rec.oid)?,
        };

        let prev_fill_sz = existing.as_ref().map(|e| e.fill_sz).unwrap_or(0.0);

        if let Some(prev) = &existing {
            if !prev.state.may_transition_to(rec.state) {
                debug!(
                    oid = %rec.oid,
                    prev_state = %prev.state,
                    next_state = %rec.state,
                    "refusing order state regression"
                );
                return Ok(OrderUpsert {
                    applied: false,
                    prev_fill_sz,
                });
            }
        }

        shard.insert(rec.oid.clone(), rec.clone());

        let db = self.db.lock();
        db.execute(
            "INSERT INTO orders (oid, cloid, symbol, side, pos_side, ord_type, px, sz,
                                 fill_px, fill_sz, state, leverage, margin_mode, tag,
                                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(oid) DO UPDATE SET
                 cloid = excluded.cloid,
                 px = excluded.px,
                 sz = excluded.sz,
                 fill_px = excluded.fill_px,
                 fill_sz = excluded.fill_sz,
                 state = excluded.state,
                 leverage = excluded.leverage,
                 tag = excluded.tag,
                 updated_at = excluded.updated_at",
            params![
                rec.oid,
                rec.cloid,
                rec.symbol,
                rec.side.as_str(),
                rec.pos_side.as_str(),
                rec.ord_type.as_str(),
                rec.px,
                rec.sz,
                rec.fill_px,
                rec.fill_sz,
                rec.state.as_str(),
                rec.leverage,
                rec.margin_mode.as_str(),
                rec.tag,
                rec.created_at,
                rec.updated_at,
            ],
        )?;

        Ok(OrderUpsert {
            applied: true,
            prev_fill_sz,
        })
    }

    /// Latest known record for `oid` (cache first, then database).
    pub fn get_order(&self, oid: &str) -> Result<Option<OrderRecord>> {
        if let Some(cached) = self.shard(oid).lock().get(oid) {
            return Ok(Some(cached.clone()));
        }
        self.fetch_order(oid)
    }

    fn fetch_order(&self, oid: &str) -> Result<Option<OrderRecord>> {
        let db = self.db.lock();
        let rec = db
            .query_row(
                "SELECT oid, cloid, symbol, side, pos_side, ord_type, px, sz, fill_px,
                        fill_sz, state, leverage, margin_mode, tag, created_at, updated_at
                 FROM orders WHERE oid = ?1",
                params![oid],
                |row| {
                    Ok(OrderRecord {
                        oid: row.get(0)?,
                        cloid: row.get(1)?,
                        symbol: row.get(2)?,
                        side: Side::parse(&row.get::<_, String>(3)?).unwrap_or(Side::Buy),
                        pos_side: PosSide::parse(&row.get::<_, String>(4)?)
                            .unwrap_or(PosSide::Net),
                        ord_type: OrdType::parse(&row.get::<_, String>(5)?)
                            .unwrap_or(OrdType::Market),
                        px: row.get(6)?,
                        sz: row.get(7)?,
                        fill_px: row.get(8)?,
                        fill_sz: row.get(9)?,
                        state: OrderState::parse(&row.get::<_, String>(10)?)
                            .unwrap_or(OrderState::Live),
                        leverage: row.get(11)?,
                        margin_mode: MarginMode::parse(&row.get::<_, String>(12)?)
                            .unwrap_or(MarginMode::Cross),
                        tag: row.get(13)?,
                        created_at: row.get(14)?,
                        updated_at: row.get(15)?,
                    })
                },
            )
            .optional()?;
        Ok(rec)
    }

    // -------------------------------------------------------------------------
    // Position snapshots
    // -------------------------------------------------------------------------

    /// Append one position observation. Returns `true` if the row was new;
    /// a replayed `(pid, u_time)` is ignored.
    pub fn insert_position_snapshot(&self, snap: &PositionSnapshot) -> Result<bool> {
        let db = self.db.lock();
        let changed = db.execute(
            "INSERT OR IGNORE INTO position_snapshots
                 (pid, u_time, symbol, pos_side, pos, avail_pos, avg_px, mark_px,
                  lever, margin_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                snap.pid,
                snap.u_time,
                snap.symbol,
                snap.pos_side.as_str(),
                snap.pos,
                snap.avail_pos,
                snap.avg_px,
                snap.mark_px,
                snap.lever,
                snap.margin_mode.map(|m| m.as_str()),
            ],
        )?;
        Ok(changed > 0)
    }

    // -------------------------------------------------------------------------
    // Journal
    // -------------------------------------------------------------------------

    /// Append a journal row and return its id.
    pub fn append_action(&self, action: &TradeAction) -> Result<i64> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO trade_actions (cloid, signal_id, symbol, pos_side, action,
                                        oid, amount, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                action.cloid,
                action.signal_id,
                action.symbol,
                action.pos_side.as_str(),
                action.action.as_str(),
                action.oid,
                action.amount,
                action.ts,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// All journal rows for a `cloid` (or the unattributed rows when `None`),
    /// oldest first.
    pub fn actions_for(&self, cloid: Option<&str>) -> Result<Vec<TradeAction>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT id, cloid, signal_id, symbol, pos_side, action, oid, amount, ts
             FROM trade_actions
             WHERE (?1 IS NULL AND cloid IS NULL) OR cloid = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![cloid], |row| {
            Ok(TradeAction {
                id: row.get(0)?,
                cloid: row.get(1)?,
                signal_id: row.get(2)?,
                symbol: row.get(3)?,
                pos_side: PosSide::parse(&row.get::<_, String>(4)?).unwrap_or(PosSide::Net),
                action: ActionType::parse(&row.get::<_, String>(5)?)
                    .unwrap_or(ActionType::ExternalClose),
                oid: row.get(6)?,
                amount: row.get(7)?,
                ts: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// Upsert a trade row by `cloid`.
    pub fn upsert_trade(&self, trade: &Trade) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO trades (cloid, symbol, pos_side, signal_id, current_size,
                                 entry_price, leverage, stop_loss_cloid,
                                 take_profit_cloid, state, opened_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(cloid) DO UPDATE SET
                 current_size = excluded.current_size,
                 entry_price = excluded.entry_price,
                 stop_loss_cloid = excluded.stop_loss_cloid,
                 take_profit_cloid = excluded.take_profit_cloid,
                 state = excluded.state,
                 closed_at = excluded.closed_at",
            params![
                trade.cloid,
                trade.symbol,
                trade.pos_side.as_str(),
                trade.signal_id,
                trade.current_size,
                trade.entry_price,
                trade.leverage,
                trade.stop_loss_cloid,
                trade.take_profit_cloid,
                trade.state.as_str(),
                trade.opened_at.timestamp_millis(),
                trade.closed_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    /// All trades not yet CLOSED, for ledger recovery after a restart.
    pub fn open_trades(&self) -> Result<Vec<Trade>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT cloid, symbol, pos_side, signal_id, current_size, entry_price,
                    leverage, stop_loss_cloid, take_profit_cloid, state, opened_at,
                    closed_at
             FROM trades WHERE state != 'CLOSED'",
        )?;
        let rows = stmt.query_map([], |row| {
            let opened_ms: i64 = row.get(10)?;
            let closed_ms: Option<i64> = row.get(11)?;
            Ok(Trade {
                cloid: row.get(0)?,
                symbol: row.get(1)?,
                pos_side: PosSide::parse(&row.get::<_, String>(2)?).unwrap_or(PosSide::Net),
                signal_id: row.get(3)?,
                current_size: row.get(4)?,
                entry_price: row.get(5)?,
                leverage: row.get(6)?,
                stop_loss_cloid: row.get(7)?,
                take_profit_cloid: row.get(8)?,
                state: TradeState::parse(&row.get::<_, String>(9)?).unwrap_or(TradeState::Open),
                opened_at: Utc
                    .timestamp_millis_opt(opened_ms)
                    .single()
                    .unwrap_or_else(Utc::now),
                closed_at: closed_ms
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                pending_intent: None,
                last_external_utime: 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(trade) => out.push(trade),
                Err(e) => warn!(error = %e, "skipping unreadable trade row"),
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    /// Record a detector signal and return its id.
    pub fn record_signal(&self, symbol: &str, kind: &str) -> Result<i64> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO signals (symbol, kind, created_at) VALUES (?1, ?2, ?3)",
            params![symbol, kind, Utc::now().timestamp_millis()],
        )?;
        Ok(db.last_insert_rowid())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cached: usize = self.order_shards.iter().map(|s| s.lock().len()).sum();
        f.debug_struct("Store")
            .field("cached_orders", &cached)
            .finish()
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS orders (
            oid          TEXT PRIMARY KEY,
            cloid        TEXT,
            symbol       TEXT NOT NULL,
            side         TEXT NOT NULL,
            pos_side     TEXT NOT NULL,
            ord_type     TEXT NOT NULL,
            px           REAL,
            sz           REAL NOT NULL,
            fill_px      REAL,
            fill_sz      REAL NOT NULL DEFAULT 0,
            state        TEXT NOT NULL,
            leverage     REAL,
            margin_mode  TEXT NOT NULL,
            tag          TEXT,
            created_at   INTEGER NOT NULL,
            updated_at   INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_cloid ON orders(cloid);

        CREATE TABLE IF NOT EXISTS position_snapshots (
            pid          TEXT NOT NULL,
            u_time       INTEGER NOT NULL,
            symbol       TEXT NOT NULL,
            pos_side     TEXT NOT NULL,
            pos          REAL NOT NULL,
            avail_pos    REAL NOT NULL,
            avg_px       REAL,
            mark_px      REAL,
            lever        REAL,
            margin_mode  TEXT,
            PRIMARY KEY (pid, u_time)
        );

        CREATE TABLE IF NOT EXISTS trades (
            cloid              TEXT PRIMARY KEY,
            symbol             TEXT NOT NULL,
            pos_side           TEXT NOT NULL,
            signal_id          INTEGER,
            current_size       REAL NOT NULL,
            entry_price        REAL NOT NULL,
            leverage           REAL NOT NULL,
            stop_loss_cloid    TEXT,
            take_profit_cloid  TEXT,
            state              TEXT NOT NULL,
            opened_at          INTEGER NOT NULL,
            closed_at          INTEGER
        );

        CREATE TABLE IF NOT EXISTS trade_actions (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            cloid      TEXT,
            signal_id  INTEGER,
            symbol     TEXT NOT NULL,
            pos_side   TEXT NOT NULL,
            action     TEXT NOT NULL,
            oid        TEXT,
            amount     REAL NOT NULL,
            ts         INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_actions_cloid ON trade_actions(cloid);

        CREATE TABLE IF NOT EXISTS signals (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol      TEXT NOT NULL,
            kind        TEXT NOT NULL,
            created_at  INTEGER NOT NULL
        );
        ",
    )?;
    Ok(())
}
