use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::entities::position::PositionKey;
use crate::domain::errors::ValidationError;

/// Largest absolute quantity, price or notional a trade may carry
pub const MAX_AMOUNT: u64 = 1_000_000_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

impl FromStr for Side {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "b" => Ok(Side::Buy),
            "sell" | "s" => Ok(Side::Sell),
            _ => Err(ValidationError::InvalidSide(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    #[default]
    Open,
    AutoClosed,
    Closed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeStatus::Open => write!(f, "Open"),
            TradeStatus::AutoClosed => write!(f, "AutoClosed"),
            TradeStatus::Closed => write!(f, "Closed"),
        }
    }
}

impl FromStr for TradeStatus {
    type Err = ValidationError;

    /// Empty input means open
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "open" => Ok(TradeStatus::Open),
            "autoclosed" | "auto_closed" | "auto-closed" => Ok(TradeStatus::AutoClosed),
            "closed" => Ok(TradeStatus::Closed),
            _ => Err(ValidationError::InvalidStatus(s.to_string())),
        }
    }
}

/// A booked trade
///
/// `sequence_number` is assigned by the ledger on append and is never
/// reassigned afterwards; values supplied by callers are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub sequence_number: u64,
    pub trade_date: NaiveDate,
    pub book: String,
    pub ticker: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(rename = "yield", default)]
    pub trade_yield: Decimal,
    #[serde(default)]
    pub broker: String,
    #[serde(default)]
    pub account: String,
    /// Zero until the rate is known
    #[serde(default)]
    pub fx_rate: Decimal,
    #[serde(default)]
    pub status: TradeStatus,
    /// Set on system-generated closing trades
    #[serde(default)]
    pub original_trade_id: String,
}

impl Trade {
    pub fn new(
        trade_date: NaiveDate,
        book: impl Into<String>,
        ticker: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Trade {
            trade_id: String::new(),
            sequence_number: 0,
            trade_date,
            book: book.into(),
            ticker: ticker.into(),
            side,
            quantity,
            price,
            trade_yield: Decimal::ZERO,
            broker: String::new(),
            account: String::new(),
            fx_rate: Decimal::ZERO,
            status: TradeStatus::Open,
            original_trade_id: String::new(),
        }
    }

    pub fn with_id(mut self, trade_id: impl Into<String>) -> Self {
        self.trade_id = trade_id.into();
        self
    }

    pub fn with_fx_rate(mut self, fx_rate: Decimal) -> Self {
        self.fx_rate = fx_rate;
        self
    }

    pub fn position_key(&self) -> PositionKey {
        PositionKey::new(&self.book, &self.ticker)
    }

    /// Checks the fields every stored trade must carry
    ///
    /// Book and ticker are storage key segments, so they may not contain the
    /// `:` separator. Quantity, price and their product are capped at
    /// [`MAX_AMOUNT`] to keep position arithmetic inside `Decimal` range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.book.trim().is_empty() {
            return Err(ValidationError::MissingField("book"));
        }
        if self.ticker.trim().is_empty() {
            return Err(ValidationError::MissingField("ticker"));
        }
        for (field, value) in [("book", &self.book), ("ticker", &self.ticker)] {
            if value.contains(':') {
                return Err(ValidationError::ReservedCharacter {
                    field,
                    value: value.clone(),
                });
            }
        }
        if self.quantity.is_sign_negative() && !self.quantity.is_zero() {
            return Err(ValidationError::NegativeQuantity(self.quantity.to_string()));
        }

        let limit = Decimal::from(MAX_AMOUNT);
        let out_of_range = |field: &'static str, value: Decimal| ValidationError::OutOfRange {
            field,
            value: value.to_string(),
        };
        if self.quantity.abs() > limit {
            return Err(out_of_range("quantity", self.quantity));
        }
        if self.price.abs() > limit {
            return Err(out_of_range("price", self.price));
        }
        match self.quantity.checked_mul(self.price) {
            Some(notional) if notional.abs() <= limit => Ok(()),
            _ => Err(ValidationError::OutOfRange {
                field: "notional",
                value: format!("{} x {}", self.quantity, self.price),
            }),
        }
    }
}
