//! CSV codec for trade blotters.
//!
//! Columns are validated by exact name and position. The legacy layout
//! without the trailing `Fx` column is still accepted and reads Fx as zero.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::io;
use std::str::FromStr;

use crate::domain::entities::{Side, Trade, TradeStatus};
use crate::domain::errors::ValidationError;

pub const HEADER: [&str; 11] = [
    "TradeDate", "Ticker", "Side", "Quantity", "Price", "Yield", "Book", "Broker", "Account",
    "Status", "Fx",
];

const LEGACY_COLUMNS: usize = 10;
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse every row, stopping at the first invalid one
///
/// Data rows are numbered from 1; header problems are reported at line 0.
/// Parsed trades carry no id or sequence number yet.
pub fn parse_trades<R: io::Read>(reader: R) -> Result<Vec<Trade>, ValidationError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut records = csv_reader.records();

    let header = match records.next() {
        Some(Ok(record)) => record,
        Some(Err(e)) => return Err(row_error(0, e.to_string())),
        None => {
            return Err(row_error(
                0,
                ValidationError::InvalidHeader {
                    expected: HEADER.join(","),
                    found: String::new(),
                }
                .to_string(),
            ))
        }
    };
    let columns = check_header(&header).map_err(|e| row_error(0, e.to_string()))?;

    let mut trades = Vec::new();
    for (index, record) in records.enumerate() {
        let line = index + 1;
        let record = record.map_err(|e| row_error(line, e.to_string()))?;
        let trade = parse_row(&record, columns).map_err(|e| row_error(line, e.to_string()))?;
        trades.push(trade);
    }

    Ok(trades)
}

/// Write the header and one row per trade, in the order given
pub fn write_trades<W: io::Write>(writer: W, trades: &[Trade]) -> Result<usize, csv::Error> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(HEADER)?;

    for trade in trades {
        csv_writer.write_record([
            trade.trade_date.format(DATE_FORMAT).to_string(),
            trade.ticker.clone(),
            trade.side.to_string(),
            trade.quantity.to_string(),
            trade.price.to_string(),
            trade.trade_yield.to_string(),
            trade.book.clone(),
            trade.broker.clone(),
            trade.account.clone(),
            trade.status.to_string(),
            trade.fx_rate.to_string(),
        ])?;
    }

    csv_writer.flush()?;
    Ok(trades.len())
}

fn row_error(line: usize, reason: String) -> ValidationError {
    ValidationError::Row {
        line,
        valid_rows: line.saturating_sub(1),
        reason,
    }
}

fn check_header(header: &csv::StringRecord) -> Result<usize, ValidationError> {
    let found: Vec<&str> = header.iter().collect();
    let matches = |len: usize| found.len() == len && found.iter().zip(HEADER.iter()).all(|(a, b)| a == b);

    if matches(HEADER.len()) {
        Ok(HEADER.len())
    } else if matches(LEGACY_COLUMNS) {
        Ok(LEGACY_COLUMNS)
    } else {
        Err(ValidationError::InvalidHeader {
            expected: HEADER.join(","),
            found: found.join(","),
        })
    }
}

fn parse_row(record: &csv::StringRecord, columns: usize) -> Result<Trade, ValidationError> {
    if record.len() != columns {
        return Err(ValidationError::ColumnCount {
            expected: columns,
            found: record.len(),
        });
    }

    let field = |index: usize| record.get(index).unwrap_or("");

    let trade_date = NaiveDate::parse_from_str(field(0), DATE_FORMAT).map_err(|_| {
        ValidationError::InvalidDate {
            field: "TradeDate",
            value: field(0).to_string(),
        }
    })?;
    let ticker = required(field(1), "Ticker")?;
    let side = Side::from_str(field(2))?;
    let quantity = decimal(field(3), "Quantity")?;
    let price = decimal(field(4), "Price")?;
    let trade_yield = optional_decimal(field(5), "Yield")?;
    let book = required(field(6), "Book")?;
    let status = TradeStatus::from_str(field(9))?;
    let fx_rate = if columns > LEGACY_COLUMNS {
        optional_decimal(field(10), "Fx")?
    } else {
        Decimal::ZERO
    };

    let mut trade = Trade::new(trade_date, book, ticker, side, quantity, price).with_fx_rate(fx_rate);
    trade.trade_yield = trade_yield;
    trade.broker = field(7).to_string();
    trade.account = field(8).to_string();
    trade.status = status;
    trade.validate()?;

    Ok(trade)
}

fn required(value: &str, field: &'static str) -> Result<String, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(value.to_string())
}

fn decimal(value: &str, field: &'static str) -> Result<Decimal, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Decimal::from_str(value).map_err(|_| ValidationError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn optional_decimal(value: &str, field: &'static str) -> Result<Decimal, ValidationError> {
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    decimal(value, field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const HEADER_LINE: &str = "TradeDate,Ticker,Side,Quantity,Price,Yield,Book,Broker,Account,Status,Fx";

    #[test]
    fn test_parse_full_layout() {
        let input = format!(
            "{}\n2024-01-02,AAPL,Buy,100,150.25,0,EQ,GS,ACC-1,Open,1.0850\n2024-01-03,MSFT,sell,5,410,,EQ,,,,\n",
            HEADER_LINE
        );
        let trades = parse_trades(input.as_bytes()).unwrap();

        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].ticker, "AAPL");
        assert_eq!(trades[0].price, dec!(150.25));
        assert_eq!(trades[0].fx_rate, dec!(1.0850));
        assert_eq!(trades[0].broker, "GS");
        assert!(trades[0].trade_id.is_empty());
        assert_eq!(trades[1].side, Side::Sell);
        assert_eq!(trades[1].status, TradeStatus::Open);
        assert_eq!(trades[1].trade_yield, Decimal::ZERO);
    }

    #[test]
    fn test_legacy_header_defaults_fx() {
        let input = "TradeDate,Ticker,Side,Quantity,Price,Yield,Book,Broker,Account,Status\n\
                     2024-01-02,AAPL,Buy,1,10,0,EQ,GS,ACC,Closed\n";
        let trades = parse_trades(input.as_bytes()).unwrap();

        assert_eq!(trades[0].fx_rate, Decimal::ZERO);
        assert_eq!(trades[0].status, TradeStatus::Closed);
    }

    #[test]
    fn test_bad_price_reports_data_line() {
        let input = format!(
            "{}\n\
             2024-01-02,AAPL,Buy,1,10,0,EQ,,,Open,0\n\
             2024-01-02,AAPL,Buy,1,10,0,EQ,,,Open,0\n\
             2024-01-02,AAPL,Buy,1,abc,0,EQ,,,Open,0\n\
             2024-01-02,AAPL,Buy,1,10,0,EQ,,,Open,0\n\
             2024-01-02,AAPL,Buy,1,10,0,EQ,,,Open,0\n",
            HEADER_LINE
        );
        let err = parse_trades(input.as_bytes()).unwrap_err();

        assert!(err.to_string().contains("error at line 3"));
        match err {
            ValidationError::Row { line, valid_rows, reason } => {
                assert_eq!(line, 3);
                assert_eq!(valid_rows, 2);
                assert!(reason.contains("Price"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_header_is_line_zero() {
        let input = "Date,Ticker,Side,Quantity,Price,Yield,Book,Broker,Account,Status,Fx\n";
        let err = parse_trades(input.as_bytes()).unwrap_err();
        assert!(matches!(err, ValidationError::Row { line: 0, .. }));

        let err = parse_trades("".as_bytes()).unwrap_err();
        assert!(matches!(err, ValidationError::Row { line: 0, .. }));
    }

    #[test]
    fn test_row_field_errors() {
        let cases = [
            ("2024-13-02,AAPL,Buy,1,10,0,EQ,,,Open,0", "TradeDate"),
            ("2024-01-02,AAPL,Hold,1,10,0,EQ,,,Open,0", "side"),
            ("2024-01-02,AAPL,Buy,1,10,0,,,,Open,0", "Book"),
            ("2024-01-02,AAPL,Buy,-1,10,0,EQ,,,Open,0", "non-negative"),
            ("2024-01-02,AAPL,Buy,1,10,0,EQ,,,Pending,0", "status"),
            ("2024-01-02,AAPL,Buy,1,10", "column count"),
            ("2024-01-02,BRK:B,Buy,1,10,0,EQ,,,Open,0", "must not contain ':'"),
        ];

        for (row, needle) in cases {
            let input = format!("{}\n{}\n", HEADER_LINE, row);
            let err = parse_trades(input.as_bytes()).unwrap_err().to_string();
            assert!(err.contains("error at line 1"), "{}", err);
            assert!(err.contains(needle), "{} should mention {}", err, needle);
        }
    }

    #[test]
    fn test_short_row_reports_column_count() {
        let input = format!("{}\n2024-01-02,AAPL,Buy,1,10\n", HEADER_LINE);
        match parse_trades(input.as_bytes()).unwrap_err() {
            ValidationError::Row { line, reason, .. } => {
                assert_eq!(line, 1);
                assert_eq!(
                    reason,
                    ValidationError::ColumnCount {
                        expected: 11,
                        found: 5,
                    }
                    .to_string()
                );
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_write_then_parse_keeps_fields() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let mut trade = Trade::new(date, "FI", "UST10Y", Side::Sell, dec!(2000000), dec!(98.5))
            .with_id("t-1")
            .with_fx_rate(dec!(1));
        trade.trade_yield = dec!(4.25);
        trade.account = "ACC, Ltd".to_string();
        trade.status = TradeStatus::AutoClosed;

        let mut out = Vec::new();
        assert_eq!(write_trades(&mut out, &[trade.clone()]).unwrap(), 1);

        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.starts_with(HEADER_LINE));

        let parsed = parse_trades(out.as_slice()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].account, "ACC, Ltd");
        assert_eq!(parsed[0].status, TradeStatus::AutoClosed);
        assert_eq!(parsed[0].trade_yield, dec!(4.25));
        assert_eq!(parsed[0].quantity, dec!(2000000));
    }
}
