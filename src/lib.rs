//! Trade blotter library
//!
//! An append-only trade ledger with an in-process event channel and a
//! position view derived from it. Both persist through the [`persistence::KvStore`]
//! capability and rebuild their in-memory state from it on startup.

pub mod config;
pub mod domain;
pub mod persistence;

pub use domain::entities::{Position, PositionKey, Side, Trade, TradeStatus};
pub use domain::errors::{BlotterError, Result, ValidationError};
pub use domain::services::{
    EventBus, EventHandler, EventKind, LedgerEvent, PositionMaterializer, TradeLedger,
};
