// =============================================================================
// Wire frames — typed views of the private WebSocket protocol
// =============================================================================
//
// Text frames only; the literal `ping` / `pong` strings bypass JSON. Every
// other frame is a JSON envelope carrying either an `event` (login,
// subscribe, error, pong) or an `arg.channel` push (orders, positions).
// Unknown events and channels are reported as `None` so the caller can log
// and drop them.
// =============================================================================

use serde::Deserialize;
use serde_json::json;

use crate::config::Credentials;
use crate::error::Result;
use crate::types::{
    MarginMode, OrdType, OrderRecord, OrderState, PosSide, PositionSnapshot, Side,
};

/// Literal heartbeat frames.
pub const PING_FRAME: &str = "ping";
pub const PONG_FRAME: &str = "pong";

// ---------------------------------------------------------------------------
// Parsed frame variants
// ---------------------------------------------------------------------------

/// Whether a push frame is a full snapshot or an incremental update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    Snapshot,
    EventUpdate,
}

impl PushKind {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("snapshot") => Self::Snapshot,
            _ => Self::EventUpdate,
        }
    }
}

/// A parsed incoming frame.
#[derive(Debug, Clone)]
pub enum WsFrame {
    LoginAck { code: String, msg: String },
    SubscribeAck { channel: String, code: String, msg: String },
    ErrorEvent { code: String, msg: String },
    Pong,
    Orders { kind: PushKind, data: Vec<OrderMsg> },
    Positions { kind: PushKind, data: Vec<PositionMsg> },
}

#[derive(Debug, Clone, Deserialize)]
struct FrameArg {
    #[serde(default)]
    channel: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    arg: Option<FrameArg>,
    #[serde(default, rename = "eventType")]
    event_type: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Parse one text frame. `Ok(None)` means a well-formed frame this engine
/// does not recognize (unknown event or channel); the caller logs and drops.
pub fn parse_frame(text: &str) -> Result<Option<WsFrame>> {
    if text == PONG_FRAME {
        return Ok(Some(WsFrame::Pong));
    }

    let env: Envelope = serde_json::from_str(text)?;

    if let Some(event) = env.event.as_deref() {
        let code = env.code.unwrap_or_default();
        let msg = env.msg.unwrap_or_default();
        return Ok(match event {
            "login" => Some(WsFrame::LoginAck { code, msg }),
            "subscribe" => Some(WsFrame::SubscribeAck {
                channel: env.arg.map(|a| a.channel).unwrap_or_default(),
                code,
                msg,
            }),
            "error" => Some(WsFrame::ErrorEvent { code, msg }),
            "pong" => Some(WsFrame::Pong),
            _ => None,
        });
    }

    let channel = match env.arg.as_ref() {
        Some(arg) => arg.channel.as_str(),
        None => return Ok(None),
    };
    let kind = PushKind::parse(env.event_type.as_deref());
    let data = env.data.unwrap_or(serde_json::Value::Null);

    match channel {
        "orders" => {
            let data: Vec<OrderMsg> = serde_json::from_value(data)?;
            Ok(Some(WsFrame::Orders { kind, data }))
        }
        "positions" => {
            let data: Vec<PositionMsg> = serde_json::from_value(data)?;
            Ok(Some(WsFrame::Positions { kind, data }))
        }
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Outgoing frames
// ---------------------------------------------------------------------------

/// Build the login request for the given signature.
pub fn login_request(creds: &Credentials, timestamp: &str, sign: &str) -> String {
    json!({
        "op": "login",
        "args": [{
            "apiKey": creds.api_key,
            "passphrase": creds.passphrase,
            "timestamp": timestamp,
            "sign": sign,
        }]
    })
    .to_string()
}

/// Build a subscribe request for one private channel.
pub fn subscribe_request(channel: &str) -> String {
    json!({
        "op": "subscribe",
        "args": [{ "channel": channel, "instType": "SWAP" }]
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Order channel payload
// ---------------------------------------------------------------------------

/// Raw order-channel element. Decimal fields stay strings here; `normalize`
/// produces the typed record.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMsg {
    pub ord_id: String,
    #[serde(default)]
    pub cl_ord_id: String,
    pub inst_id: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub pos_side: String,
    #[serde(default)]
    pub ord_type: String,
    #[serde(default)]
    pub px: String,
    #[serde(default)]
    pub sz: String,
    #[serde(default)]
    pub acc_fill_sz: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub lever: String,
    #[serde(default)]
    pub td_mode: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub fill_time: String,
    #[serde(default)]
    pub c_time: String,
    #[serde(default)]
    pub u_time: String,
}

impl OrderMsg {
    pub fn u_time_ms(&self) -> i64 {
        parse_millis(&self.u_time)
    }

    /// Convert into a typed [`OrderRecord`]. Returns `None` when a required
    /// enum field is unparseable; an absent `clOrdId` is fine and maps to
    /// `cloid = None`.
    pub fn normalize(&self) -> Option<OrderRecord> {
        let side = Side::parse(&self.side)?;
        let state = OrderState::parse(&self.state)?;
        let pos_side = PosSide::parse(&self.pos_side).unwrap_or(PosSide::Net);
        let ord_type = OrdType::parse(&self.ord_type).unwrap_or(OrdType::Market);
        let margin_mode = MarginMode::parse(&self.td_mode).unwrap_or(MarginMode::Cross);

        Some(OrderRecord {
            oid: self.ord_id.clone(),
            cloid: non_empty(&self.cl_ord_id),
            symbol: self.inst_id.clone(),
            side,
            pos_side,
            ord_type,
            px: parse_decimal(&self.px),
            sz: parse_decimal(&self.sz).unwrap_or(0.0),
            fill_px: parse_decimal(&self.avg_px),
            fill_sz: parse_decimal(&self.acc_fill_sz).unwrap_or(0.0),
            state,
            leverage: parse_decimal(&self.lever),
            margin_mode,
            tag: non_empty(&self.tag),
            created_at: parse_millis(&self.c_time),
            updated_at: self.u_time_ms(),
        })
    }
}

// ---------------------------------------------------------------------------
// Position channel payload
// ---------------------------------------------------------------------------

/// Raw position-channel element.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionMsg {
    pub pos_id: String,
    pub inst_id: String,
    #[serde(default)]
    pub pos_side: String,
    #[serde(default)]
    pub pos: String,
    #[serde(default)]
    pub avail_pos: String,
    #[serde(default)]
    pub avg_px: String,
    #[serde(default)]
    pub u_time: String,
    #[serde(default)]
    pub mark_px: String,
    #[serde(default)]
    pub lever: String,
    #[serde(default)]
    pub mgn_mode: String,
}

impl PositionMsg {
    pub fn u_time_ms(&self) -> i64 {
        parse_millis(&self.u_time)
    }

    pub fn pos_f64(&self) -> Option<f64> {
        parse_decimal(&self.pos)
    }

    pub fn pos_side_parsed(&self) -> PosSide {
        PosSide::parse(&self.pos_side).unwrap_or(PosSide::Net)
    }

    /// Typed snapshot row for persistence.
    pub fn snapshot(&self) -> Option<PositionSnapshot> {
        Some(PositionSnapshot {
            pid: self.pos_id.clone(),
            symbol: self.inst_id.clone(),
            pos_side: self.pos_side_parsed(),
            pos: self.pos_f64()?,
            avail_pos: parse_decimal(&self.avail_pos).unwrap_or(0.0),
            avg_px: parse_decimal(&self.avg_px),
            u_time: self.u_time_ms(),
            mark_px: parse_decimal(&self.mark_px),
            lever: parse_decimal(&self.lever),
            margin_mode: MarginMode::parse(&self.mgn_mode),
        })
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Parse a venue decimal string; empty means absent.
pub(crate) fn parse_decimal(s: &str) -> Option<f64> {
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok()
}

fn parse_millis(s: &str) -> i64 {
    s.parse::<i64>().unwrap_or(0)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
