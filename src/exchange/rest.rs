// =============================================================================
// Signed REST client — venue v5 trading endpoints
// =============================================================================
//
// SECURITY: the secret and passphrase are never logged or serialized. Every
// request carries the access-key headers and a base64 HMAC-SHA256 signature
// of `timestamp + method + path + body`.
//
// All calls pass through the token bucket first; transport failures retry
// with linear backoff, venue rejections (code != "0") do not.
// =============================================================================

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::{ApiSettings, Credentials};
use crate::error::{EngineError, Result};
use crate::exchange::rate_limit::TokenBucket;
use crate::exchange::{AlgoRequest, ExchangeClient, OrderRequest};
use crate::types::MarginMode;

type HmacSha256 = Hmac<Sha256>;

/// REST client for the venue's v5 trading API.
pub struct RestClient {
    creds: Credentials,
    base_url: String,
    sandbox: bool,
    http: reqwest::Client,
    bucket: TokenBucket,
    max_retries: u32,
}

impl RestClient {
    pub fn new(creds: Credentials, api: &ApiSettings, sandbox: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(api.request_timeout())
            .build()
            .expect("failed to build reqwest client");

        Self {
            creds,
            base_url: api.rest_url.trim_end_matches('/').to_string(),
            sandbox,
            http,
            bucket: TokenBucket::new(api.rate_limit, api.rate_window(), api.min_interval()),
            max_retries: api.max_retries,
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// base64(HMAC-SHA256(secret, timestamp + method + path + body)).
    fn sign(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// ISO-8601 timestamp with millisecond precision, as the venue requires.
    fn iso_timestamp() -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let body_text = body.to_string();

        let mut attempt = 0u32;
        loop {
            self.bucket.acquire().await;

            match self.send_once(path, &body_text).await {
                Ok(data) => return Ok(data),
                Err(EngineError::Http(e)) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        path,
                        attempt,
                        error = %e,
                        "transport failure, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        500 * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, path: &str, body_text: &str) -> Result<Value> {
        let ts = Self::iso_timestamp();
        let sign = Self::sign(&self.creds.secret, &ts, "POST", path, body_text);
        let url = format!("{}{}", self.base_url, path);

        let mut req = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("OK-ACCESS-KEY", &self.creds.api_key)
            .header("OK-ACCESS-SIGN", sign)
            .header("OK-ACCESS-TIMESTAMP", ts)
            .header("OK-ACCESS-PASSPHRASE", &self.creds.passphrase)
            .body(body_text.to_string());
        if self.sandbox {
            req = req.header("x-simulated-trading", "1");
        }

        let resp = req.send().await?;
        let status = resp.status();
        let payload: Value = resp.json().await?;

        let code = payload["code"].as_str().unwrap_or("");
        if !status.is_success() || code != "0" {
            let msg = payload["msg"].as_str().unwrap_or("").to_string();
            // Per-item rejections surface under data[].sCode.
            let detail = payload["data"][0]["sMsg"].as_str().unwrap_or("");
            return Err(EngineError::Exchange {
                code: if code.is_empty() {
                    status.as_u16().to_string()
                } else {
                    code.to_string()
                },
                msg: if detail.is_empty() {
                    msg
                } else {
                    format!("{msg}: {detail}")
                },
            });
        }

        debug!(path, "request accepted");
        Ok(payload["data"].clone())
    }
}

#[async_trait]
impl ExchangeClient for RestClient {
    async fn submit_order(&self, req: &OrderRequest) -> Result<String> {
        let mut body = json!({
            "instId": req.symbol,
            "tdMode": req.margin_mode.as_str(),
            "clOrdId": req.cloid,
            "side": req.side.as_str(),
            "posSide": req.pos_side.as_str(),
            "ordType": req.ord_type.as_str(),
            "sz": req.sz.to_string(),
        });
        if let Some(px) = req.px {
            body["px"] = json!(px.to_string());
        }
        if let Some(tag) = &req.tag {
            body["tag"] = json!(tag);
        }

        let data = self.post("/api/v5/trade/order", body).await?;
        let oid = data[0]["ordId"].as_str().unwrap_or_default().to_string();
        debug!(cloid = %req.cloid, oid = %oid, symbol = %req.symbol, "order submitted");
        Ok(oid)
    }

    async fn cancel_order(&self, symbol: &str, oid: &str) -> Result<()> {
        self.post(
            "/api/v5/trade/cancel-order",
            json!({ "instId": symbol, "ordId": oid }),
        )
        .await?;
        debug!(symbol, oid, "order canceled");
        Ok(())
    }

    async fn place_algo(&self, req: &AlgoRequest) -> Result<String> {
        let body = json!({
            "instId": req.symbol,
            "tdMode": req.margin_mode.as_str(),
            "algoClOrdId": req.cloid,
            "side": req.side.as_str(),
            "posSide": req.pos_side.as_str(),
            "ordType": "trigger",
            "sz": req.sz.to_string(),
            "triggerPx": req.trigger_px.to_string(),
            "orderPx": "-1",
        });
        self.post("/api/v5/trade/order-algo", body).await?;
        debug!(cloid = %req.cloid, symbol = %req.symbol, "algo order placed");
        Ok(req.cloid.clone())
    }

    async fn cancel_algo(&self, symbol: &str, algo_cloid: &str) -> Result<()> {
        self.post(
            "/api/v5/trade/cancel-algos",
            json!([{ "instId": symbol, "algoClOrdId": algo_cloid }]),
        )
        .await?;
        debug!(symbol, algo_cloid, "algo order canceled");
        Ok(())
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        leverage: f64,
        margin_mode: MarginMode,
    ) -> Result<()> {
        self.post(
            "/api/v5/account/set-leverage",
            json!({
                "instId": symbol,
                "lever": leverage.to_string(),
                "mgnMode": margin_mode.as_str(),
            }),
        )
        .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("sandbox", &self.sandbox)
            .field("creds", &"<redacted>")
            .finish()
    }
}
