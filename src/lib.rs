// ===============================
// src/lib.rs
// ===============================
//
// Self-healing exchange session core: instrument registry, order book
// mirrors, balance/position ledger, per-order lifecycle tasks and the
// venue session that wires them to the exchange's REST and WebSocket
// surfaces.

pub mod book;
pub mod config;
pub mod domain;
pub mod errors;
pub mod instrument;
pub mod ledger;
pub mod market;
pub mod metrics;
pub mod order;
pub mod rest;
pub mod trader;
pub mod venue;
pub mod wire;
pub mod ws;

pub use book::OrderBook;
pub use config::{DepthMode, ExchangeConfig, TickerSource};
pub use domain::{Deal, DepthEvent, OrderEvent, OrderSnapshot, OrderStatus, PosSide, Side};
pub use errors::{CoreError, Result};
pub use instrument::{Instrument, InstrumentRegistry};
pub use ledger::Ledger;
pub use market::Market;
pub use order::OrderHandle;
pub use trader::{OrderIntent, Trader};
pub use venue::VenueSession;
