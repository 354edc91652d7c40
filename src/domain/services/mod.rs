pub mod event_bus;
pub mod position_materializer;
pub mod reference_data;
pub mod trade_csv;
pub mod trade_ledger;

pub use event_bus::{EventBus, EventHandler, EventKind, LedgerEvent, SubscriptionToken};
pub use position_materializer::PositionMaterializer;
pub use reference_data::{EnrichedPosition, ReferenceData, SecurityInfo, StaticReferenceData};
pub use trade_ledger::TradeLedger;
