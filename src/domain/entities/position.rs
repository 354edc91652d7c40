use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::entities::trade::{Side, Trade};
use crate::domain::errors::{BlotterError, Result};

/// Identifies a position bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub book: String,
    pub ticker: String,
}

impl PositionKey {
    pub fn new(book: impl Into<String>, ticker: impl Into<String>) -> Self {
        PositionKey {
            book: book.into(),
            ticker: ticker.into(),
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.book, self.ticker)
    }
}

/// A trade's contribution to a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub trade_id: String,
    pub sequence_number: u64,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
}

impl From<&Trade> for Fill {
    fn from(trade: &Trade) -> Self {
        Fill {
            trade_id: trade.trade_id.clone(),
            sequence_number: trade.sequence_number,
            side: trade.side,
            quantity: trade.quantity,
            price: trade.price,
        }
    }
}

/// Holdings for one (book, ticker)
///
/// `quantity`, `avg_price` and `realized_pnl` always equal the fold of
/// `fills` in sequence order, so taking a fill out is an exact reversal.
/// The journal is not part of the serialized snapshot; it is stored one row
/// per fill next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub book: String,
    pub ticker: String,
    /// Positive long, negative short
    pub quantity: Decimal,
    /// Weighted average cost of the open quantity; zero when flat
    pub avg_price: Decimal,
    pub realized_pnl: Decimal,
    #[serde(skip)]
    fills: Vec<Fill>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    quantity: Decimal,
    avg_price: Decimal,
    realized_pnl: Decimal,
}

impl Totals {
    /// None when any intermediate leaves `Decimal` range
    fn fold(self, side: Side, quantity: Decimal, price: Decimal) -> Option<Totals> {
        let delta = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        if delta.is_zero() {
            return Some(self);
        }

        let current = self.quantity;
        let new_quantity = current.checked_add(delta)?;
        let mut avg_price = self.avg_price;
        let mut realized_pnl = self.realized_pnl;

        if current.is_zero() || current.is_sign_positive() == delta.is_sign_positive() {
            // inventory grows: re-weight the average cost
            let cost = avg_price
                .checked_mul(current.abs())?
                .checked_add(price.checked_mul(delta.abs())?)?;
            avg_price = cost.checked_div(new_quantity.abs())?;
        } else {
            // inventory shrinks: realize against the average cost
            let closed = if delta.abs() > current.abs() { -current } else { delta };
            realized_pnl = realized_pnl.checked_add(closed.checked_mul(avg_price.checked_sub(price)?)?)?;

            if new_quantity.is_zero() {
                avg_price = Decimal::ZERO;
            } else if new_quantity.is_sign_positive() != current.is_sign_positive() {
                // flipped through zero, the remainder opens at the trade price
                avg_price = price;
            }
        }

        Some(Totals {
            quantity: new_quantity.normalize(),
            avg_price: avg_price.normalize(),
            realized_pnl: realized_pnl.normalize(),
        })
    }

    fn fold_all(fills: &[Fill]) -> Option<Totals> {
        fills.iter().try_fold(Totals::default(), |totals, fill| {
            totals.fold(fill.side, fill.quantity, fill.price)
        })
    }
}

impl Position {
    pub fn new(key: PositionKey) -> Self {
        Position {
            book: key.book,
            ticker: key.ticker,
            quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            fills: Vec::new(),
        }
    }

    /// Rebuild a position from its journal, in any order
    pub fn from_fills(key: PositionKey, mut fills: Vec<Fill>) -> Result<Self> {
        fills.sort_by_key(|fill| fill.sequence_number);
        let mut position = Position::new(key);
        let totals = Totals::fold_all(&fills).ok_or_else(|| position.overflow())?;
        position.fills = fills;
        position.set_totals(totals);
        Ok(position)
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(&self.book, &self.ticker)
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// True when both carry the same aggregates, journal aside
    pub fn same_totals(&self, other: &Position) -> bool {
        self.quantity == other.quantity
            && self.avg_price == other.avg_price
            && self.realized_pnl == other.realized_pnl
    }

    /// Contributions in sequence order
    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn fill(&self, trade_id: &str) -> Option<&Fill> {
        self.fills.iter().find(|fill| fill.trade_id == trade_id)
    }

    /// Applies a fill; fills arriving after the last one fold incrementally,
    /// anything older is inserted in place and the position re-folded
    ///
    /// On overflow the position is left untouched.
    pub fn apply_fill(&mut self, fill: Fill) -> Result<()> {
        let is_latest = self
            .fills
            .last()
            .map_or(true, |last| fill.sequence_number > last.sequence_number);

        if is_latest {
            let totals = self
                .totals()
                .fold(fill.side, fill.quantity, fill.price)
                .ok_or_else(|| self.overflow())?;
            self.set_totals(totals);
            self.fills.push(fill);
        } else {
            let index = self
                .fills
                .partition_point(|existing| existing.sequence_number < fill.sequence_number);
            self.fills.insert(index, fill);
            match Totals::fold_all(&self.fills) {
                Some(totals) => self.set_totals(totals),
                None => {
                    self.fills.remove(index);
                    return Err(self.overflow());
                }
            }
        }
        Ok(())
    }

    /// Takes a trade's contribution out and re-folds the remaining fills
    ///
    /// On overflow the position is left untouched.
    pub fn remove_fill(&mut self, trade_id: &str) -> Result<Option<Fill>> {
        let Some(index) = self.fills.iter().position(|fill| fill.trade_id == trade_id) else {
            return Ok(None);
        };
        let removed = self.fills.remove(index);
        match Totals::fold_all(&self.fills) {
            Some(totals) => {
                self.set_totals(totals);
                Ok(Some(removed))
            }
            None => {
                self.fills.insert(index, removed);
                Err(self.overflow())
            }
        }
    }

    fn totals(&self) -> Totals {
        Totals {
            quantity: self.quantity,
            avg_price: self.avg_price,
            realized_pnl: self.realized_pnl,
        }
    }

    fn set_totals(&mut self, totals: Totals) {
        self.quantity = totals.quantity;
        self.avg_price = totals.avg_price;
        self.realized_pnl = totals.realized_pnl;
    }

    fn overflow(&self) -> BlotterError {
        BlotterError::Overflow(self.key().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(id: &str, sequence_number: u64, side: Side, quantity: Decimal, price: Decimal) -> Fill {
        Fill {
            trade_id: id.to_string(),
            sequence_number,
            side,
            quantity,
            price,
        }
    }

    fn position() -> Position {
        Position::new(PositionKey::new("EQ", "AAPL"))
    }

    #[test]
    fn test_weighted_average_on_increase() {
        let mut pos = position();
        pos.apply_fill(fill("a", 1, Side::Buy, dec!(100), dec!(150))).unwrap();
        pos.apply_fill(fill("b", 2, Side::Buy, dec!(50), dec!(200))).unwrap();

        assert_eq!(pos.quantity, dec!(150));
        assert!((pos.avg_price - dec!(166.67)).abs() <= dec!(0.01));
        assert_eq!(pos.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_full_close_realizes_pnl_and_resets_average() {
        let mut pos = position();
        pos.apply_fill(fill("a", 1, Side::Buy, dec!(100), dec!(150))).unwrap();
        pos.apply_fill(fill("b", 2, Side::Sell, dec!(100), dec!(200))).unwrap();

        assert!(pos.is_flat());
        assert_eq!(pos.avg_price, Decimal::ZERO);
        assert_eq!(pos.realized_pnl, dec!(5000));
    }

    #[test]
    fn test_partial_reduction_keeps_average() {
        let mut pos = position();
        pos.apply_fill(fill("a", 1, Side::Buy, dec!(100), dec!(150))).unwrap();
        pos.apply_fill(fill("b", 2, Side::Sell, dec!(40), dec!(140))).unwrap();

        assert_eq!(pos.quantity, dec!(60));
        assert_eq!(pos.avg_price, dec!(150));
        assert_eq!(pos.realized_pnl, dec!(-400));
    }

    #[test]
    fn test_short_cover_realizes_profit() {
        let mut pos = position();
        pos.apply_fill(fill("a", 1, Side::Sell, dec!(100), dec!(150))).unwrap();
        assert_eq!(pos.quantity, dec!(-100));
        assert_eq!(pos.avg_price, dec!(150));

        pos.apply_fill(fill("b", 2, Side::Buy, dec!(100), dec!(120))).unwrap();
        assert!(pos.is_flat());
        assert_eq!(pos.realized_pnl, dec!(3000));
    }

    #[test]
    fn test_flip_through_zero_opens_at_trade_price() {
        let mut pos = position();
        pos.apply_fill(fill("a", 1, Side::Buy, dec!(100), dec!(150))).unwrap();
        pos.apply_fill(fill("b", 2, Side::Sell, dec!(150), dec!(160))).unwrap();

        assert_eq!(pos.quantity, dec!(-50));
        assert_eq!(pos.avg_price, dec!(160));
        assert_eq!(pos.realized_pnl, dec!(1000));
    }

    #[test]
    fn test_removing_every_fill_leaves_clean_zero() {
        let mut pos = position();
        pos.apply_fill(fill("a", 1, Side::Buy, dec!(100), dec!(150))).unwrap();
        pos.apply_fill(fill("b", 2, Side::Sell, dec!(100), dec!(200))).unwrap();

        pos.remove_fill("b").unwrap().unwrap();
        assert_eq!(pos.quantity, dec!(100));
        assert_eq!(pos.avg_price, dec!(150));
        assert_eq!(pos.realized_pnl, Decimal::ZERO);

        pos.remove_fill("a").unwrap().unwrap();
        assert!(pos.is_flat());
        assert_eq!(pos.avg_price, Decimal::ZERO);
        assert!(!pos.quantity.is_sign_negative());
        assert!(!pos.avg_price.is_sign_negative());
        assert!(pos.fills().is_empty());
    }

    #[test]
    fn test_out_of_order_fill_matches_in_order_fold() {
        let mut in_order = position();
        in_order.apply_fill(fill("a", 1, Side::Buy, dec!(10), dec!(100))).unwrap();
        in_order.apply_fill(fill("b", 2, Side::Sell, dec!(4), dec!(110))).unwrap();
        in_order.apply_fill(fill("c", 3, Side::Buy, dec!(6), dec!(90))).unwrap();

        let mut shuffled = position();
        shuffled.apply_fill(fill("c", 3, Side::Buy, dec!(6), dec!(90))).unwrap();
        shuffled.apply_fill(fill("a", 1, Side::Buy, dec!(10), dec!(100))).unwrap();
        shuffled.apply_fill(fill("b", 2, Side::Sell, dec!(4), dec!(110))).unwrap();

        assert_eq!(in_order, shuffled);
    }

    #[test]
    fn test_zero_quantity_fill_is_recorded_without_effect() {
        let mut pos = position();
        pos.apply_fill(fill("a", 1, Side::Buy, dec!(0), dec!(100))).unwrap();
        assert!(pos.is_flat());
        assert_eq!(pos.avg_price, Decimal::ZERO);
        assert!(pos.fill("a").is_some());
    }

    #[test]
    fn test_remove_unknown_fill() {
        let mut pos = position();
        assert!(pos.remove_fill("missing").unwrap().is_none());
    }

    #[test]
    fn test_overflowing_fill_is_rejected_and_leaves_position_untouched() {
        let mut pos = position();
        pos.apply_fill(fill("a", 1, Side::Buy, dec!(10), dec!(100))).unwrap();
        let before = pos.clone();

        let err = pos
            .apply_fill(fill("b", 2, Side::Buy, Decimal::MAX, dec!(2)))
            .unwrap_err();
        assert!(matches!(err, BlotterError::Overflow(_)));
        assert_eq!(pos, before);
    }

    #[test]
    fn test_overflowing_refold_rolls_back_insert_and_removal() {
        let mut pos = position();
        pos.apply_fill(fill("big", 2, Side::Buy, Decimal::MAX, dec!(1))).unwrap();
        let before = pos.clone();

        // inserted ahead of the big fill, the re-fold overflows the quantity
        assert!(pos.apply_fill(fill("early", 1, Side::Buy, dec!(1), dec!(1))).is_err());
        assert_eq!(pos, before);

        let mut pos = position();
        pos.apply_fill(fill("long", 1, Side::Buy, Decimal::MAX, dec!(1))).unwrap();
        pos.apply_fill(fill("cut", 2, Side::Sell, dec!(1), dec!(1))).unwrap();
        pos.apply_fill(fill("add", 3, Side::Buy, dec!(1), dec!(1))).unwrap();
        let before = pos.clone();

        // without the sell the two buys no longer fit
        assert!(pos.remove_fill("cut").is_err());
        assert_eq!(pos, before);
    }

    #[test]
    fn test_from_fills_sorts_and_folds() {
        let rebuilt = Position::from_fills(
            PositionKey::new("EQ", "AAPL"),
            vec![
                fill("b", 2, Side::Sell, dec!(4), dec!(110)),
                fill("a", 1, Side::Buy, dec!(10), dec!(100)),
            ],
        )
        .unwrap();

        let mut folded = position();
        folded.apply_fill(fill("a", 1, Side::Buy, dec!(10), dec!(100))).unwrap();
        folded.apply_fill(fill("b", 2, Side::Sell, dec!(4), dec!(110))).unwrap();
        assert_eq!(rebuilt, folded);
        assert_eq!(rebuilt.realized_pnl, dec!(40));
    }

    #[test]
    fn test_snapshot_excludes_journal() {
        let mut pos = position();
        pos.apply_fill(fill("a", 1, Side::Buy, dec!(10), dec!(100))).unwrap();

        let json = serde_json::to_string(&pos).unwrap();
        assert!(!json.contains("fills"));
        let decoded: Position = serde_json::from_str(&json).unwrap();
        assert!(decoded.same_totals(&pos));
        assert!(decoded.fills().is_empty());
    }
}
