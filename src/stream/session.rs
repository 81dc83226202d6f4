// =============================================================================
// Session transport — authenticated private WebSocket session
// =============================================================================
//
// One task owns the socket: it connects, logs in with an HMAC signature,
// subscribes the configured channels, then serves frames until the
// connection dies. All writes (login, subscribe, ping, pong, close) happen
// from this task, so no writer lock is needed.
//
// Reconnects are unconditional with a fixed delay, except after a login
// rejection: bad credentials permanently mark the session unhealthy and stop
// the loop.
//
// Heartbeat: a 1 s ticker sends the literal text frame `ping` once the
// socket has been silent past the threshold, and declares the connection
// dead when the `pong` does not arrive in time.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{Credentials, StreamSettings};
use crate::error::{EngineError, Result};
use crate::stream::frames::{login_request, parse_frame, subscribe_request, PING_FRAME, PONG_FRAME, WsFrame};

type HmacSha256 = Hmac<Sha256>;
type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Single registered consumer of parsed frames.
pub type FrameHandler = Arc<dyn Fn(WsFrame) + Send + Sync>;

/// Heartbeat evaluation cadence.
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
/// Grace period for the session task to wind down on `stop()`.
const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(3);

struct SessionShared {
    running: AtomicBool,
    ready: AtomicBool,
    healthy: AtomicBool,
    shutdown: Notify,
    handler: parking_lot::RwLock<Option<FrameHandler>>,
}

/// How one connection ended.
enum SessionExit {
    /// `stop()` was called.
    Shutdown,
    /// The peer closed or the stream ended; reconnect.
    Remote,
}

/// Authenticated streaming session against one private endpoint.
pub struct SessionTransport {
    settings: StreamSettings,
    creds: Credentials,
    channels: Vec<String>,
    shared: Arc<SessionShared>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionTransport {
    pub fn new(settings: StreamSettings, creds: Credentials, channels: Vec<String>) -> Self {
        Self {
            settings,
            creds,
            channels,
            shared: Arc::new(SessionShared {
                running: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
                shutdown: Notify::new(),
                handler: parking_lot::RwLock::new(None),
            }),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Register the single frame consumer. Must be called before `start`.
    pub fn on_frame(&self, handler: impl Fn(WsFrame) + Send + Sync + 'static) {
        *self.shared.handler.write() = Some(Arc::new(handler));
    }

    /// Begin the connect loop. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.healthy.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let settings = self.settings.clone();
        let creds = self.creds.clone();
        let channels = self.channels.clone();
        let handle = tokio::spawn(async move {
            run_loop(shared, settings, creds, channels).await;
        });
        *self.task.lock() = Some(handle);
    }

    /// Graceful teardown: no further frames are delivered after this
    /// returns. The session task gets a bounded grace period, then is
    /// aborted.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.shutdown.notify_waiters();

        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("session task exceeded stop deadline, aborting");
                handle.abort();
            }
        }
        self.shared.ready.store(false, Ordering::SeqCst);
    }

    /// Connected, logged in, and every channel subscribed.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// False once the venue has rejected the credentials.
    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("endpoint", &self.settings.endpoint())
            .field("channels", &self.channels)
            .field("ready", &self.is_ready())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// base64(HMAC-SHA256(secret, ts + "GET" + "/users/self/verify")).
pub fn login_signature(secret: &str, timestamp: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(timestamp.as_bytes());
    mac.update(b"GET/users/self/verify");
    BASE64.encode(mac.finalize().into_bytes())
}

// ---------------------------------------------------------------------------
// Connect loop
// ---------------------------------------------------------------------------

async fn run_loop(
    shared: Arc<SessionShared>,
    settings: StreamSettings,
    creds: Credentials,
    channels: Vec<String>,
) {
    info!(endpoint = %settings.endpoint(), channels = ?channels, "session loop started");

    while shared.running.load(Ordering::SeqCst) {
        let result = connect_and_serve(&shared, &settings, &creds, &channels).await;
        shared.ready.store(false, Ordering::SeqCst);

        match result {
            Ok(SessionExit::Shutdown) => break,
            Ok(SessionExit::Remote) => {
                warn!("connection closed by peer, reconnecting");
            }
            Err(e) if e.is_fatal() => {
                // Bad credentials: retrying cannot help. Surface unhealthy.
                error!(error = %e, "login rejected, session halted");
                shared.healthy.store(false, Ordering::SeqCst);
                shared.running.store(false, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                warn!(error = %e, "session error, reconnecting");
            }
        }

        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = shared.shutdown.notified() => break,
            _ = tokio::time::sleep(settings.reconnect_interval()) => {}
        }
    }

    info!("session loop exited");
}

async fn connect_and_serve(
    shared: &SessionShared,
    settings: &StreamSettings,
    creds: &Credentials,
    channels: &[String],
) -> Result<SessionExit> {
    let (mut write, mut read) = connect(settings).await?;

    login(&mut write, &mut read, creds, settings).await?;
    subscribe(shared, &mut write, &mut read, channels, settings).await?;

    shared.ready.store(true, Ordering::SeqCst);
    info!(channels = ?channels, "session ready");

    serve(shared, &mut write, &mut read, settings).await
}

async fn connect(settings: &StreamSettings) -> Result<(WsSink, WsSource)> {
    let url = settings.endpoint();
    debug!(url, "connecting");

    let connector = if settings.ssl_verify {
        None
    } else {
        warn!("TLS certificate verification disabled");
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| EngineError::Transport(format!("building TLS connector: {e}")))?;
        Some(Connector::NativeTls(tls))
    };

    let (ws, _resp) = tokio::time::timeout(
        settings.connect_timeout(),
        connect_async_tls_with_config(url, None, false, connector),
    )
    .await
    .map_err(|_| EngineError::Timeout("connect"))??;

    info!(url, "connected");
    Ok(ws.split())
}

/// Send the login frame and wait for its ack. Any code other than "0" is a
/// fatal credential error.
async fn login(
    write: &mut WsSink,
    read: &mut WsSource,
    creds: &Credentials,
    settings: &StreamSettings,
) -> Result<()> {
    let ts = Utc::now().timestamp().to_string();
    let sign = login_signature(&creds.secret, &ts);
    write
        .send(Message::Text(login_request(creds, &ts, &sign)))
        .await?;

    let deadline = tokio::time::Instant::now() + settings.connect_timeout();
    loop {
        let msg = tokio::time::timeout_at(deadline, read.next())
            .await
            .map_err(|_| EngineError::Timeout("login ack"))?;
        match msg {
            Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                Ok(Some(WsFrame::LoginAck { code, msg })) => {
                    if code == "0" {
                        debug!("login accepted");
                        return Ok(());
                    }
                    return Err(EngineError::Auth { code, msg });
                }
                Ok(Some(WsFrame::ErrorEvent { code, msg })) => {
                    return Err(EngineError::Auth { code, msg });
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "unparseable frame during login"),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err(EngineError::Transport("closed during login".into())),
        }
    }
}

/// Subscribe every channel and wait until each is acked. Push frames that
/// arrive early (the post-subscribe snapshot) are forwarded to the handler.
async fn subscribe(
    shared: &SessionShared,
    write: &mut WsSink,
    read: &mut WsSource,
    channels: &[String],
    settings: &StreamSettings,
) -> Result<()> {
    for channel in channels {
        write
            .send(Message::Text(subscribe_request(channel)))
            .await?;
    }

    let mut pending: HashSet<&str> = channels.iter().map(String::as_str).collect();
    let deadline = tokio::time::Instant::now() + settings.connect_timeout();

    while !pending.is_empty() {
        let msg = tokio::time::timeout_at(deadline, read.next())
            .await
            .map_err(|_| EngineError::Timeout("subscribe ack"))?;
        match msg {
            Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                Ok(Some(WsFrame::SubscribeAck { channel, code, msg })) => {
                    if code == "0" {
                        debug!(channel = %channel, "subscribed");
                        pending.remove(channel.as_str());
                    } else {
                        warn!(channel = %channel, code = %code, msg = %msg, "subscribe rejected");
                        return Err(EngineError::Subscribe { channel, code });
                    }
                }
                Ok(Some(WsFrame::ErrorEvent { code, msg })) => {
                    warn!(code = %code, msg = %msg, "error during subscribe");
                    return Err(EngineError::Subscribe {
                        channel: "unknown".into(),
                        code,
                    });
                }
                Ok(Some(frame)) => deliver(shared, frame),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "unparseable frame during subscribe"),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err(EngineError::Transport("closed during subscribe".into())),
        }
    }
    Ok(())
}

/// Steady-state frame service with heartbeat supervision.
async fn serve(
    shared: &SessionShared,
    write: &mut WsSink,
    read: &mut WsSource,
    settings: &StreamSettings,
) -> Result<SessionExit> {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut last_message = tokio::time::Instant::now();
    let mut pending_pong = false;
    let mut ping_sent_at = last_message;

    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionExit::Shutdown);
            }

            _ = tick.tick() => {
                if !shared.running.load(Ordering::SeqCst) {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionExit::Shutdown);
                }
                let now = tokio::time::Instant::now();
                if pending_pong && now.duration_since(ping_sent_at) >= settings.ping_timeout() {
                    return Err(EngineError::Timeout("pong"));
                }
                if !pending_pong
                    && now.duration_since(last_message) >= settings.heartbeat_interval()
                {
                    debug!("sending heartbeat ping");
                    write.send(Message::Text(PING_FRAME.to_string())).await?;
                    pending_pong = true;
                    ping_sent_at = now;
                }
            }

            msg = read.next() => match msg {
                Some(Ok(message)) => {
                    last_message = tokio::time::Instant::now();
                    match message {
                        Message::Text(text) => {
                            if text == PONG_FRAME {
                                pending_pong = false;
                                continue;
                            }
                            match parse_frame(&text) {
                                Ok(Some(WsFrame::Pong)) => pending_pong = false,
                                Ok(Some(frame)) => deliver(shared, frame),
                                Ok(None) => debug!("unrecognized frame dropped"),
                                Err(e) => warn!(error = %e, "unparseable frame dropped"),
                            }
                        }
                        Message::Ping(payload) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Message::Pong(_) => pending_pong = false,
                        Message::Close(_) => return Ok(SessionExit::Remote),
                        // Binary frames still count as liveness.
                        _ => {}
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(SessionExit::Remote),
            }
        }
    }
}

fn deliver(shared: &SessionShared, frame: WsFrame) {
    let handler = shared.handler.read();
    match handler.as_ref() {
        Some(h) => h(frame),
        None => debug!("no frame handler registered, dropping frame"),
    }
}
