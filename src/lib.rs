// =============================================================================
// riptide — streaming trade-state reconciliation engine
// =============================================================================
//
// Consumes a venue's private order and position channels over an
// authenticated WebSocket session, detects externally-triggered position
// changes, deduplicates the at-least-once stream, and drives trade lifecycle
// bookkeeping (open / add / reduce / close / external-close) against an
// in-memory and SQLite-persisted model.
//
// Library-shaped: an embedding application provides the HTTP facade, the
// signal detector, and logging setup, and calls the [`ledger::TradeLedger`]
// directly for user-initiated transitions. Typical wiring:
//
//   let settings = Settings::from_env();
//   let store = Arc::new(Store::open("riptide.db")?);
//   let exchange = Arc::new(RestClient::new(creds.clone(), &settings.api, false));
//   let engine = Engine::new(&settings, creds, store, exchange)?;
//   engine.start();
//
// =============================================================================

pub mod config;
pub mod dedup;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod reconciler;
pub mod runtime;
pub mod store;
pub mod stream;
pub mod types;

pub use config::{Credentials, Settings};
pub use error::{EngineError, Result};
pub use exchange::rest::RestClient;
pub use exchange::ExchangeClient;
pub use ledger::{OpenParams, OpenTicket, TradeLedger};
pub use reconciler::ReconciliationEngine;
pub use runtime::Engine;
pub use store::Store;
