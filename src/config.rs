// =============================================================================
// Engine configuration — environment-driven with serde defaults
// =============================================================================
//
// Every field carries a serde default so that embedders loading a settings
// file never break when new fields appear. `Settings::from_env()` recognizes
// the WS_* / API_* variable names and falls back to the same defaults.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_private_url() -> String {
    "wss://ws.okx.com:8443/ws/v5/private".to_string()
}

fn default_rest_url() -> String {
    "https://www.okx.com".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_ping_timeout_secs() -> u64 {
    5
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_close_queue_size() -> usize {
    100
}

fn default_position_queue_size() -> usize {
    200
}

fn default_order_queue_size() -> usize {
    500
}

fn default_order_workers() -> usize {
    1
}

fn default_rate_limit() -> u32 {
    10
}

fn default_rate_window_secs() -> u64 {
    2
}

fn default_min_interval_ms() -> u64 {
    200
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

/// Private streaming endpoint used when `sandbox` is set. The REST side
/// keeps the same host and adds the demo-trading header instead.
const SANDBOX_PRIVATE_URL: &str = "wss://wspap.okx.com:8443/ws/v5/private";

// =============================================================================
// Credentials
// =============================================================================

/// API credential triple. The secret and passphrase are never logged or
/// serialized.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Streaming settings
// =============================================================================

/// Settings for the private streaming session and its event queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Private WebSocket endpoint.
    #[serde(default = "default_private_url")]
    pub private_url: String,

    /// Route to the venue's demo-trading environment.
    #[serde(default)]
    pub sandbox: bool,

    /// Seconds of silence before a ping is sent.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Seconds to wait for a pong before declaring the connection dead.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    /// Seconds between reconnect attempts.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    /// Connect and ack deadline in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Depth of the close-event queue.
    #[serde(default = "default_close_queue_size")]
    pub close_queue_size: usize,

    /// Depth of the raw position-data queue.
    #[serde(default = "default_position_queue_size")]
    pub position_queue_size: usize,

    /// Depth of the order-event queue.
    #[serde(default = "default_order_queue_size")]
    pub order_queue_size: usize,

    /// Number of order workers draining the order queue.
    #[serde(default = "default_order_workers")]
    pub order_workers: usize,

    /// Verify the TLS certificate of the endpoint.
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl StreamSettings {
    /// The endpoint to dial, honoring the sandbox switch unless an explicit
    /// URL override is in place.
    pub fn endpoint(&self) -> &str {
        if self.sandbox && self.private_url == default_private_url() {
            SANDBOX_PRIVATE_URL
        } else {
            &self.private_url
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// =============================================================================
// REST API settings
// =============================================================================

/// Settings for the signed REST client and its token-bucket limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// REST endpoint.
    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// Requests allowed per window.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Rate window in seconds.
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    /// Minimum spacing between requests in milliseconds.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries on transport failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ApiSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl ApiSettings {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Top-level settings
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub api: ApiSettings,
}

impl Settings {
    /// Build settings from environment variables, with the documented
    /// defaults for anything unset. Unparseable values log a warning and
    /// fall back to the default.
    pub fn from_env() -> Self {
        let mut s = Settings::default();

        if let Ok(url) = std::env::var("WS_PRIVATE_URL") {
            if !url.is_empty() {
                s.stream.private_url = url;
            }
        }
        s.stream.sandbox = env_parse("EXCHANGE_SANDBOX", s.stream.sandbox);
        s.stream.heartbeat_interval_secs =
            env_parse("WS_HEARTBEAT_INTERVAL", s.stream.heartbeat_interval_secs);
        s.stream.ping_timeout_secs = env_parse("WS_PING_TIMEOUT", s.stream.ping_timeout_secs);
        s.stream.reconnect_interval_secs =
            env_parse("WS_RECONNECT_INTERVAL", s.stream.reconnect_interval_secs);
        s.stream.connect_timeout_secs =
            env_parse("WS_CONNECT_TIMEOUT", s.stream.connect_timeout_secs);
        s.stream.close_queue_size = env_parse("WS_QUEUE_MAXSIZE", s.stream.close_queue_size);
        s.stream.position_queue_size = env_parse(
            "WS_QUEUE_MAXSIZE_POSITION_DATA",
            s.stream.position_queue_size,
        );
        s.stream.order_queue_size =
            env_parse("WS_QUEUE_MAXSIZE_ORDERS", s.stream.order_queue_size);
        s.stream.ssl_verify = env_parse("WS_SSL_VERIFY", s.stream.ssl_verify);

        s.api.rate_limit = env_parse("API_RATE_LIMIT", s.api.rate_limit);
        s.api.rate_window_secs = env_parse("API_RATE_WINDOW", s.api.rate_window_secs);
        // API_MIN_INTERVAL is documented in seconds (e.g. 0.2).
        if let Some(secs) = env_opt::<f64>("API_MIN_INTERVAL") {
            s.api.min_interval_ms = (secs * 1000.0).round().max(0.0) as u64;
        }
        s.api.request_timeout_secs =
            env_parse("API_REQUEST_TIMEOUT", s.api.request_timeout_secs);
        s.api.max_retries = env_parse("API_MAX_RETRIES", s.api.max_retries);

        s
    }

    /// Load settings from a JSON file. Missing fields fall back to defaults,
    /// so files written by older builds keep loading.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;
        info!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Persist the settings using an atomic write (tmp file, then rename) so
    /// a crash mid-write never corrupts the file.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved");
        Ok(())
    }
}

/// Read and parse an env var, returning `fallback` when unset or invalid.
fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    match env_opt(key) {
        Some(v) => v,
        None => fallback,
    }
}

fn env_opt<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    if raw.is_empty() {
        return None;
    }
    // Accept common boolean spellings before falling back to FromStr.
    let normalized = match raw.as_str() {
        "1" | "yes" | "Yes" | "YES" | "True" | "TRUE" => "true".to_string(),
        "0" | "no" | "No" | "NO" | "False" | "FALSE" => "false".to_string(),
        _ => raw.clone(),
    };
    match normalized.parse::<T>().ok().or_else(|| raw.parse::<T>().ok()) {
        Some(v) => Some(v),
        None => {
            warn!(key, value = %raw, "unparseable config value, using default");
            None
        }
    }
}
