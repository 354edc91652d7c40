use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::entities::Position;
use crate::domain::errors::{BlotterError, Result};

/// Static attributes of a traded instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub currency: String,
    pub asset_class: String,
}

impl SecurityInfo {
    pub fn new(currency: impl Into<String>, asset_class: impl Into<String>) -> Self {
        SecurityInfo {
            currency: currency.into(),
            asset_class: asset_class.into(),
        }
    }
}

/// Lookup of instrument attributes; implementations may hit the network
#[async_trait]
pub trait ReferenceData: Send + Sync {
    async fn security_info(&self, ticker: &str) -> Result<SecurityInfo>;
}

/// In-memory reference data
#[derive(Debug, Clone, Default)]
pub struct StaticReferenceData {
    securities: HashMap<String, SecurityInfo>,
}

impl StaticReferenceData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_security(mut self, ticker: impl Into<String>, info: SecurityInfo) -> Self {
        self.insert(ticker, info);
        self
    }

    pub fn insert(&mut self, ticker: impl Into<String>, info: SecurityInfo) {
        self.securities.insert(ticker.into(), info);
    }
}

#[async_trait]
impl ReferenceData for StaticReferenceData {
    async fn security_info(&self, ticker: &str) -> Result<SecurityInfo> {
        self.securities
            .get(ticker)
            .cloned()
            .ok_or_else(|| BlotterError::Enrichment {
                ticker: ticker.to_string(),
                reason: "unknown ticker".to_string(),
            })
    }
}

/// A position decorated for presentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedPosition {
    pub book: String,
    pub ticker: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub realized_pnl: Decimal,
    /// quantity * avg_price
    pub cost_basis: Decimal,
    pub currency: String,
    pub asset_class: String,
}

impl EnrichedPosition {
    pub fn new(position: &Position, info: SecurityInfo) -> Self {
        EnrichedPosition {
            book: position.book.clone(),
            ticker: position.ticker.clone(),
            quantity: position.quantity,
            avg_price: position.avg_price,
            realized_pnl: position.realized_pnl,
            cost_basis: (position.quantity * position.avg_price).normalize(),
            currency: info.currency,
            asset_class: info.asset_class,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{Fill, PositionKey, Side};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_static_lookup() {
        let reference = StaticReferenceData::new()
            .with_security("AAPL", SecurityInfo::new("USD", "Equity"));

        let info = reference.security_info("AAPL").await.unwrap();
        assert_eq!(info.currency, "USD");

        let err = reference.security_info("ZZZ").await.unwrap_err();
        assert!(matches!(err, BlotterError::Enrichment { ref ticker, .. } if ticker == "ZZZ"));
    }

    #[test]
    fn test_enriched_cost_basis() {
        let mut position = Position::new(PositionKey::new("EQ", "VOD"));
        position.apply_fill(Fill {
            trade_id: "t-1".to_string(),
            sequence_number: 1,
            side: Side::Sell,
            quantity: dec!(10),
            price: dec!(72.5),
        })
        .unwrap();

        let enriched = EnrichedPosition::new(&position, SecurityInfo::new("GBP", "Equity"));
        assert_eq!(enriched.cost_basis, dec!(-725));
        assert_eq!(enriched.currency, "GBP");
    }
}
