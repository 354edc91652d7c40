//! Storage key layout shared by the ledger and the materializer.

pub const TRADE_PREFIX: &str = "TRADE:";
pub const POSITION_PREFIX: &str = "POSITION:";
pub const POSITION_FILL_PREFIX: &str = "POSITION_FILL:";
pub const HEAD_SEQ_BLOTTER: &str = "HEAD_SEQ_BLOTTER";
pub const HEAD_SEQ_PORTFOLIO: &str = "HEAD_SEQ_PORTFOLIO";

/// `TRADE:<ticker>:<sequence>:<tradeId>`
///
/// The sequence is zero-padded to the width of `u64::MAX` so that a prefix
/// scan over one ticker yields its trades in append order.
pub fn trade_key(ticker: &str, sequence_number: u64, trade_id: &str) -> String {
    format!("{}{}:{:020}:{}", TRADE_PREFIX, ticker, sequence_number, trade_id)
}

/// `POSITION:<book>:<ticker>`
pub fn position_key(book: &str, ticker: &str) -> String {
    format!("{}{}:{}", POSITION_PREFIX, book, ticker)
}

/// `POSITION_FILL:<book>:<ticker>:<sequence>:<tradeId>`, one journal row per fill
pub fn position_fill_key(book: &str, ticker: &str, sequence_number: u64, trade_id: &str) -> String {
    format!(
        "{}{}:{}:{:020}:{}",
        POSITION_FILL_PREFIX, book, ticker, sequence_number, trade_id
    )
}
