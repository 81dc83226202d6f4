// =============================================================================
// Engine assembly — wires the session, streams, workers, and ledger together
// =============================================================================
//
// Construction order: store -> ledger (with recovery) -> reconciler ->
// dedup registries -> bounded channels -> workers -> session. The session's
// frame handler only routes: order frames to the order stream, position
// frames to the position stream; acks and pongs are consumed inside the
// session itself.
//
// Shutdown: stop the session (no further frames), close the stream queues
// (workers drain what is buffered, then observe the closed channel and
// exit), and join every worker with a bounded grace period.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Credentials, Settings};
use crate::dedup::DedupRegistry;
use crate::error::Result;
use crate::exchange::ExchangeClient;
use crate::ledger::TradeLedger;
use crate::reconciler::ReconciliationEngine;
use crate::store::Store;
use crate::stream::frames::WsFrame;
use crate::stream::order_stream::{self, OrderStream};
use crate::stream::position_stream::{self, PositionStream, PositionTracker};
use crate::stream::session::SessionTransport;

/// Per-worker shutdown deadline.
const WORKER_SHUTDOWN: std::time::Duration = std::time::Duration::from_secs(3);

/// The private channels this engine consumes.
const CHANNELS: [&str; 2] = ["orders", "positions"];

/// Fully assembled reconciliation engine. Library-shaped: the embedding
/// application owns the HTTP surface and the signal detector and talks to
/// the ledger directly.
pub struct Engine {
    pub store: Arc<Store>,
    pub ledger: Arc<TradeLedger>,
    session: Arc<SessionTransport>,
    order_stream: Arc<OrderStream>,
    position_stream: Arc<PositionStream>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build the full pipeline. Recovers open trades from the store; does
    /// not touch the network until `start`.
    pub fn new(
        settings: &Settings,
        creds: Credentials,
        store: Arc<Store>,
        exchange: Arc<dyn ExchangeClient>,
    ) -> Result<Self> {
        let ledger = Arc::new(TradeLedger::new(store.clone(), exchange));
        ledger.load_open()?;
        let reconciler = Arc::new(ReconciliationEngine::new(ledger.clone()));

        let order_dedup = Arc::new(DedupRegistry::for_orders());
        let position_dedup = Arc::new(DedupRegistry::for_positions());

        let (order_stream, order_rx) =
            OrderStream::new(settings.stream.order_queue_size, order_dedup.clone());
        let (position_stream, position_rx) =
            PositionStream::new(settings.stream.position_queue_size);
        let (close_tx, close_rx) = mpsc::channel(settings.stream.close_queue_size.max(1));
        let tracker = Arc::new(PositionTracker::new());

        let mut workers = order_stream::spawn_workers(
            settings.stream.order_workers,
            order_rx,
            store.clone(),
            reconciler.clone(),
            order_dedup,
        );
        workers.push(position_stream::spawn_classifier(
            position_rx,
            tracker,
            position_dedup.clone(),
            store.clone(),
            close_tx,
        ));
        workers.push(position_stream::spawn_close_worker(
            close_rx,
            reconciler,
            position_dedup,
        ));

        let session = Arc::new(SessionTransport::new(
            settings.stream.clone(),
            creds,
            CHANNELS.iter().map(|c| c.to_string()).collect(),
        ));
        {
            let orders = order_stream.clone();
            let positions = position_stream.clone();
            session.on_frame(move |frame| match frame {
                WsFrame::Orders { data, .. } => orders.handle(data),
                WsFrame::Positions { kind, data } => positions.handle(kind, data),
                // Acks and pongs are consumed by the session itself.
                _ => {}
            });
        }

        Ok(Self {
            store,
            ledger,
            session,
            order_stream,
            position_stream,
            workers: parking_lot::Mutex::new(workers),
        })
    }

    /// Begin streaming. Idempotent.
    pub fn start(&self) {
        self.session.start();
        info!("engine started");
    }

    /// Connected, logged in, and subscribed.
    pub fn is_ready(&self) -> bool {
        self.session.is_ready()
    }

    /// False once the venue has rejected the credentials; the embedder
    /// should surface this as a system-wide readiness failure.
    pub fn is_healthy(&self) -> bool {
        self.session.is_healthy()
    }

    /// Graceful teardown: stop the session, let workers drain their queues,
    /// and join each within a bounded deadline.
    pub async fn shutdown(&self) {
        self.session.stop().await;
        self.order_stream.close();
        self.position_stream.close();

        let workers = std::mem::take(&mut *self.workers.lock());
        for mut handle in workers {
            if tokio::time::timeout(WORKER_SHUTDOWN, &mut handle)
                .await
                .is_err()
            {
                warn!("worker exceeded shutdown deadline, aborting");
                handle.abort();
            }
        }
        info!("engine shut down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("ready", &self.is_ready())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}
