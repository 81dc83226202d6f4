// =============================================================================
// Shared domain types for the reconciliation engine
// =============================================================================
//
// Wire payloads carry decimal fields as strings; everything in this module is
// the already-normalized form. Parsing from the wire lives in stream::frames.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Size comparisons tolerate this much float noise.
pub const SIZE_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Order enums
// ---------------------------------------------------------------------------

/// Order side as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position side. `Net` appears in one-way accounts; close classification
/// treats it by magnitude like the hedged sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosSide {
    Long,
    Short,
    Net,
}

impl PosSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
            Self::Net => "net",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            "net" => Some(Self::Net),
            _ => None,
        }
    }
}

impl std::fmt::Display for PosSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Venue order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrdType {
    Market,
    Limit,
    PostOnly,
    Fok,
    Ioc,
    Trigger,
}

impl OrdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::PostOnly => "post_only",
            Self::Fok => "fok",
            Self::Ioc => "ioc",
            Self::Trigger => "trigger",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "market" => Some(Self::Market),
            "limit" => Some(Self::Limit),
            "post_only" => Some(Self::PostOnly),
            "fok" => Some(Self::Fok),
            "ioc" => Some(Self::Ioc),
            "trigger" => Some(Self::Trigger),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Margin mode of an order or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Cross,
    Isolated,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cross => "cross",
            Self::Isolated => "isolated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cross" => Some(Self::Cross),
            "isolated" => Some(Self::Isolated),
            _ => None,
        }
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an individual exchange order.
///
/// States progress monotonically toward a terminal state; the store refuses
/// writes that would move an order backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Live,
    PartiallyFilled,
    Filled,
    Canceled,
    Failed,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(Self::Live),
            "partially_filled" => Some(Self::PartiallyFilled),
            "filled" => Some(Self::Filled),
            "canceled" => Some(Self::Canceled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Live => 0,
            Self::PartiallyFilled => 1,
            Self::Filled | Self::Canceled | Self::Failed => 2,
        }
    }

    /// Whether an update may move an order from `self` to `next`. Terminal
    /// states accept only a re-delivery of themselves.
    pub fn may_transition_to(&self, next: OrderState) -> bool {
        if self.is_terminal() {
            *self == next
        } else {
            next.rank() >= self.rank()
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order record
// ---------------------------------------------------------------------------

/// Normalized record of a single exchange order, keyed by `oid`.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    /// Venue-assigned order id.
    pub oid: String,
    /// Client-assigned order id; absent for orders not placed by this process.
    pub cloid: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub pos_side: PosSide,
    pub ord_type: OrdType,
    pub px: Option<f64>,
    pub sz: f64,
    pub fill_px: Option<f64>,
    /// Cumulative filled size as reported by the venue.
    pub fill_sz: f64,
    pub state: OrderState,
    pub leverage: Option<f64>,
    pub margin_mode: MarginMode,
    pub tag: Option<String>,
    /// Venue creation timestamp, ms since epoch.
    pub created_at: i64,
    /// Venue update timestamp, ms since epoch.
    pub updated_at: i64,
}

// ---------------------------------------------------------------------------
// Position snapshot
// ---------------------------------------------------------------------------

/// One observation of a venue-side position. Append-only; each `(pid, u_time)`
/// pair is written at most once.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub pid: String,
    pub symbol: String,
    pub pos_side: PosSide,
    /// Signed position size.
    pub pos: f64,
    pub avail_pos: f64,
    pub avg_px: Option<f64>,
    /// Venue update timestamp, ms since epoch.
    pub u_time: i64,
    pub mark_px: Option<f64>,
    pub lever: Option<f64>,
    pub margin_mode: Option<MarginMode>,
}

// ---------------------------------------------------------------------------
// Trade (logical)
// ---------------------------------------------------------------------------

/// Lifecycle state of a logical trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Open,
    Closing,
    Closed,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "CLOSING" => Some(Self::Closing),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Journal action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Open,
    Add,
    Reduce,
    Close,
    ExternalClose,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Add => "ADD",
            Self::Reduce => "REDUCE",
            Self::Close => "CLOSE",
            Self::ExternalClose => "EXTERNAL_CLOSE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "ADD" => Some(Self::Add),
            "REDUCE" => Some(Self::Reduce),
            "CLOSE" => Some(Self::Close),
            "EXTERNAL_CLOSE" => Some(Self::ExternalClose),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a locally-declared intent (set before submitting a reduce/close
/// order so the stream-observed decrease is attributed correctly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    Reduce,
    Close,
}

impl IntentKind {
    pub fn action(&self) -> ActionType {
        match self {
            Self::Reduce => ActionType::Reduce,
            Self::Close => ActionType::Close,
        }
    }
}

/// A pending local intent with its set time.
#[derive(Debug, Clone, Copy)]
pub struct Intent {
    pub kind: IntentKind,
    pub set_at: Instant,
}

/// A logical trade, keyed by its client order id. One `cloid` spans every
/// order message of the trade (open, adds, reduces, close).
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub cloid: String,
    pub symbol: String,
    pub pos_side: PosSide,
    pub signal_id: Option<i64>,
    /// Remaining open size; `> 0` iff the trade is not CLOSED.
    pub current_size: f64,
    /// Size-weighted average entry price.
    pub entry_price: f64,
    pub leverage: f64,
    pub stop_loss_cloid: Option<String>,
    pub take_profit_cloid: Option<String>,
    pub state: TradeState,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub pending_intent: Option<Intent>,
    /// Highest external-close `u_time` applied; replays at or below this are
    /// no-ops even if the dedup layer is bypassed.
    #[serde(skip)]
    pub last_external_utime: i64,
}

impl Trade {
    /// The intent flag, if set and not yet expired.
    pub fn active_intent(&self, ttl: std::time::Duration) -> Option<IntentKind> {
        self.pending_intent
            .filter(|i| i.set_at.elapsed() < ttl)
            .map(|i| i.kind)
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Append-only journal row recording one bookkeeping action.
#[derive(Debug, Clone, Serialize)]
pub struct TradeAction {
    /// Row id once persisted.
    pub id: Option<i64>,
    /// `None` for unattributed (orphan) events kept for audit.
    pub cloid: Option<String>,
    pub signal_id: Option<i64>,
    pub symbol: String,
    pub pos_side: PosSide,
    pub action: ActionType,
    pub oid: Option<String>,
    pub amount: f64,
    /// Wall-clock ms since epoch.
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Close events
// ---------------------------------------------------------------------------

/// A detected external position decrease, emitted by the position stream and
/// consumed by the reconciliation engine.
#[derive(Debug, Clone)]
pub struct CloseEvent {
    pub pid: String,
    pub symbol: String,
    pub pos_side: PosSide,
    /// Size removed from the position by this event.
    pub close_amount: f64,
    pub is_full_close: bool,
    pub u_time: i64,
    pub mark_px: Option<f64>,
}

// ---------------------------------------------------------------------------
// Dedup keys
// ---------------------------------------------------------------------------

/// One observation of an update: `(oid, uTime)` for orders, `(pid, uTime)`
/// for positions. Orders and positions use separate registries, so the two
/// flavours cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub id: String,
    pub u_time: i64,
}

impl DedupKey {
    pub fn new(id: impl Into<String>, u_time: i64) -> Self {
        Self {
            id: id.into(),
            u_time,
        }
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.u_time)
    }
}
