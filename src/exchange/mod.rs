// =============================================================================
// Exchange client abstraction
// =============================================================================
//
// The engine drives the venue exclusively through `ExchangeClient`, so tests
// and embedders can substitute their own implementation. All operations are
// idempotent on the client-assigned order id.
// =============================================================================

pub mod rate_limit;
pub mod rest;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{MarginMode, OrdType, PosSide, Side};

/// Parameters for a regular order submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Client-assigned order id; stable across the logical trade.
    pub cloid: String,
    pub symbol: String,
    pub side: Side,
    pub pos_side: PosSide,
    pub ord_type: OrdType,
    pub sz: f64,
    /// Required for limit-style orders.
    pub px: Option<f64>,
    pub margin_mode: MarginMode,
    pub tag: Option<String>,
}

/// Parameters for a conditional (stop-loss / take-profit) order.
#[derive(Debug, Clone)]
pub struct AlgoRequest {
    /// Client-assigned algo order id.
    pub cloid: String,
    pub symbol: String,
    pub side: Side,
    pub pos_side: PosSide,
    pub trigger_px: f64,
    pub sz: f64,
    pub margin_mode: MarginMode,
}

/// Venue trading surface used by the ledger and the embedding REST layer.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit an order; returns the venue-assigned order id.
    async fn submit_order(&self, req: &OrderRequest) -> Result<String>;

    /// Cancel a regular order by venue order id.
    async fn cancel_order(&self, symbol: &str, oid: &str) -> Result<()>;

    /// Place a conditional order; returns its client-assigned id.
    async fn place_algo(&self, req: &AlgoRequest) -> Result<String>;

    /// Cancel a conditional order by client-assigned id.
    async fn cancel_algo(&self, symbol: &str, algo_cloid: &str) -> Result<()>;

    /// Set leverage for a symbol.
    async fn set_leverage(&self, symbol: &str, leverage: f64, margin_mode: MarginMode)
        -> Result<()>;
}
