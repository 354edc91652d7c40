//! TradeLedger - append-only, sequence-numbered trade log
//!
//! The ledger owns every trade in a single `trade_id -> Trade` map; the
//! ticker and sequence indices hold ids only. A mutation persists first and
//! touches memory only once the store accepted it, then enqueues its event
//! while still holding the write guard so events leave in mutation order.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::entities::{Trade, TradeStatus};
use crate::domain::errors::{BlotterError, Result, ValidationError};
use crate::domain::services::event_bus::{EventBus, LedgerEvent};
use crate::domain::services::trade_csv;
use crate::persistence::{get_json, keys, put_json, DatabaseError, KvStore};

type TickerEntry = (NaiveDate, u64, String);

#[derive(Default)]
struct LedgerState {
    trades: HashMap<String, Trade>,
    /// ticker -> (trade_date, sequence, trade_id)
    by_ticker: HashMap<String, BTreeSet<TickerEntry>>,
    by_sequence: BTreeMap<u64, String>,
    /// Every ticker ever indexed; not pruned on removal
    tickers: BTreeSet<String>,
    head: u64,
}

impl LedgerState {
    fn index(&mut self, trade: Trade) {
        self.by_ticker
            .entry(trade.ticker.clone())
            .or_default()
            .insert(ticker_entry(&trade));
        self.by_sequence
            .insert(trade.sequence_number, trade.trade_id.clone());
        self.tickers.insert(trade.ticker.clone());
        self.trades.insert(trade.trade_id.clone(), trade);
    }

    fn deindex(&mut self, trade_id: &str) -> Option<Trade> {
        let trade = self.trades.remove(trade_id)?;
        if let Some(entries) = self.by_ticker.get_mut(&trade.ticker) {
            entries.remove(&ticker_entry(&trade));
            if entries.is_empty() {
                self.by_ticker.remove(&trade.ticker);
            }
        }
        self.by_sequence.remove(&trade.sequence_number);
        Some(trade)
    }

    fn resolve<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Vec<Trade> {
        ids.filter_map(|id| self.trades.get(id)).cloned().collect()
    }
}

fn ticker_entry(trade: &Trade) -> TickerEntry {
    (
        trade.trade_date,
        trade.sequence_number,
        trade.trade_id.clone(),
    )
}

fn storage_key(trade: &Trade) -> String {
    keys::trade_key(&trade.ticker, trade.sequence_number, &trade.trade_id)
}

pub struct TradeLedger {
    store: Arc<dyn KvStore>,
    bus: Arc<EventBus>,
    state: RwLock<LedgerState>,
}

impl TradeLedger {
    /// Rebuild the ledger from every persisted trade
    ///
    /// The head is the larger of the persisted counter and the highest
    /// persisted sequence, so a crash between the two writes of an append
    /// never hands out a number twice.
    pub async fn load(store: Arc<dyn KvStore>, bus: Arc<EventBus>) -> Result<Self> {
        let entries = store.scan_prefix(keys::TRADE_PREFIX).await?;

        let mut state = LedgerState::default();
        for (key, raw) in entries {
            let trade: Trade = serde_json::from_str(&raw).map_err(|e| {
                error!("Corrupt trade record {}: {}", key, e);
                DatabaseError::SerializationError(e)
            })?;
            state.head = state.head.max(trade.sequence_number);
            state.index(trade);
        }

        let persisted_head: u64 = get_json(store.as_ref(), keys::HEAD_SEQ_BLOTTER)
            .await?
            .unwrap_or(0);
        state.head = state.head.max(persisted_head);

        info!(
            trades = state.trades.len(),
            head = state.head,
            "Trade ledger loaded"
        );

        Ok(Self {
            store,
            bus,
            state: RwLock::new(state),
        })
    }

    /// Append a trade and return the stored copy
    ///
    /// An empty `trade_id` is replaced by a fresh UUID; any caller supplied
    /// sequence number is overwritten.
    pub async fn append(&self, trade: Trade) -> Result<Trade> {
        let mut state = self.state.write().await;
        self.append_locked(&mut state, trade).await
    }

    /// Replace an existing trade, keeping its sequence number
    pub async fn update(&self, trade: Trade) -> Result<Trade> {
        let mut state = self.state.write().await;
        self.update_locked(&mut state, trade).await
    }

    pub async fn remove(&self, trade_id: &str) -> Result<Trade> {
        let mut state = self.state.write().await;
        self.remove_locked(&mut state, trade_id).await
    }

    /// Remove every listed trade, carrying on past failures
    ///
    /// Returns the number removed, or `PartialBatchFailure` naming the ids
    /// that could not be removed.
    pub async fn remove_many(&self, trade_ids: &[String]) -> Result<usize> {
        let mut state = self.state.write().await;

        let mut removed = 0;
        let mut failed = Vec::new();
        for trade_id in trade_ids {
            match self.remove_locked(&mut state, trade_id).await {
                Ok(_) => removed += 1,
                Err(e) => {
                    warn!(trade_id = %trade_id, "Batch removal failed: {}", e);
                    failed.push(trade_id.clone());
                }
            }
        }

        if failed.is_empty() {
            Ok(removed)
        } else {
            Err(BlotterError::PartialBatchFailure {
                count: failed.len(),
                failed,
            })
        }
    }

    /// Book an offsetting trade against `trade_id` and mark it closed
    ///
    /// The closing trade takes the opposite side for the same quantity, is
    /// flagged `AutoClosed` and points back at the original.
    pub async fn close_out(&self, trade_id: &str, date: NaiveDate, price: Decimal) -> Result<Trade> {
        let mut state = self.state.write().await;

        let original = state
            .trades
            .get(trade_id)
            .cloned()
            .ok_or_else(|| BlotterError::trade_not_found(trade_id))?;
        if original.status != TradeStatus::Open {
            return Err(ValidationError::AlreadyClosed(trade_id.to_string()).into());
        }

        let mut closing = Trade::new(
            date,
            original.book.clone(),
            original.ticker.clone(),
            original.side.opposite(),
            original.quantity,
            price,
        );
        closing.broker = original.broker.clone();
        closing.account = original.account.clone();
        closing.status = TradeStatus::AutoClosed;
        closing.original_trade_id = original.trade_id.clone();

        let closing = self.append_locked(&mut state, closing).await?;

        let mut closed = original;
        closed.status = TradeStatus::Closed;
        if let Err(e) = self.update_locked(&mut state, closed).await {
            error!(
                trade_id = %trade_id,
                closing_id = %closing.trade_id,
                "Closing trade booked but original not marked closed: {}",
                e
            );
            return Err(e);
        }

        info!(
            trade_id = %trade_id,
            closing_id = %closing.trade_id,
            sequence = closing.sequence_number,
            "Trade closed out"
        );
        Ok(closing)
    }

    pub async fn get_by_id(&self, trade_id: &str) -> Result<Trade> {
        let state = self.state.read().await;
        state
            .trades
            .get(trade_id)
            .cloned()
            .ok_or_else(|| BlotterError::trade_not_found(trade_id))
    }

    /// Trades of one ticker ordered by trade date, then sequence
    pub async fn get_by_ticker(&self, ticker: &str) -> Vec<Trade> {
        let state = self.state.read().await;
        match state.by_ticker.get(ticker) {
            Some(entries) => state.resolve(entries.iter().map(|(_, _, id)| id)),
            None => Vec::new(),
        }
    }

    /// Trades of one ticker with `from <= trade_date <= to`
    pub async fn get_by_ticker_between(&self, ticker: &str, from: NaiveDate, to: NaiveDate) -> Vec<Trade> {
        let state = self.state.read().await;
        let Some(entries) = state.by_ticker.get(ticker) else {
            return Vec::new();
        };
        state.resolve(
            entries
                .range((from, 0, String::new())..)
                .take_while(|(date, _, _)| *date <= to)
                .map(|(_, _, id)| id),
        )
    }

    /// Every trade in sequence order
    pub async fn get_all(&self) -> Vec<Trade> {
        let state = self.state.read().await;
        state.resolve(state.by_sequence.values())
    }

    /// Trades with `lo <= sequence_number <= hi`, ascending
    pub async fn get_by_sequence_range(&self, lo: u64, hi: u64) -> Vec<Trade> {
        if lo > hi {
            return Vec::new();
        }
        let state = self.state.read().await;
        state.resolve(state.by_sequence.range(lo..=hi).map(|(_, id)| id))
    }

    pub async fn get_all_tickers(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.tickers.iter().cloned().collect()
    }

    pub async fn head_sequence(&self) -> u64 {
        self.state.read().await.head
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.trades.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Import a blotter CSV
    ///
    /// Every row is validated before anything is appended; the first bad row
    /// aborts the import. Rows that then fail to append are reported together
    /// as `PartialBatchFailure` without stopping the others.
    pub async fn import_csv<R: io::Read>(&self, reader: R) -> Result<usize> {
        let trades = trade_csv::parse_trades(reader)?;
        info!(rows = trades.len(), "Importing trades from CSV");

        let mut imported = 0;
        let mut failed = Vec::new();
        for (index, trade) in trades.into_iter().enumerate() {
            match self.append(trade).await {
                Ok(_) => imported += 1,
                Err(e) => {
                    warn!(line = index + 1, "Import row failed: {}", e);
                    failed.push(format!("line {}: {}", index + 1, e));
                }
            }
        }

        if !failed.is_empty() {
            return Err(BlotterError::PartialBatchFailure {
                count: failed.len(),
                failed,
            });
        }

        info!(imported, "CSV import complete");
        Ok(imported)
    }

    /// Write every current trade, in sequence order
    pub async fn export_csv<W: io::Write>(&self, writer: W) -> Result<usize> {
        let trades = self.get_all().await;
        let written = trade_csv::write_trades(writer, &trades)?;
        debug!(written, "Exported trades to CSV");
        Ok(written)
    }

    async fn append_locked(&self, state: &mut LedgerState, mut trade: Trade) -> Result<Trade> {
        if trade.trade_id.is_empty() {
            trade.trade_id = Uuid::new_v4().to_string();
        }
        if state.trades.contains_key(&trade.trade_id) {
            return Err(BlotterError::AlreadyExists {
                trade_id: trade.trade_id,
            });
        }
        trade.validate()?;

        let sequence = state.head + 1;
        trade.sequence_number = sequence;
        let key = storage_key(&trade);

        put_json(self.store.as_ref(), &key, &trade).await?;

        if let Err(e) = put_json(self.store.as_ref(), keys::HEAD_SEQ_BLOTTER, &sequence).await {
            error!(trade_id = %trade.trade_id, sequence, "Failed to persist head sequence: {}", e);
            if let Err(undo) = self.store.delete(&key).await {
                // the record will come back on reload, so its number must stay taken
                error!(key = %key, "Failed to undo trade write: {}", undo);
                state.head = sequence;
            }
            return Err(e.into());
        }

        state.head = sequence;
        state.index(trade.clone());
        self.bus.publish(LedgerEvent::TradeAdded(trade.clone()));

        debug!(
            trade_id = %trade.trade_id,
            sequence,
            ticker = %trade.ticker,
            book = %trade.book,
            "Trade appended"
        );
        Ok(trade)
    }

    async fn update_locked(&self, state: &mut LedgerState, mut trade: Trade) -> Result<Trade> {
        let old = state
            .trades
            .get(&trade.trade_id)
            .cloned()
            .ok_or_else(|| BlotterError::trade_not_found(&trade.trade_id))?;
        trade.validate()?;
        trade.sequence_number = old.sequence_number;

        let old_key = storage_key(&old);
        let new_key = storage_key(&trade);

        put_json(self.store.as_ref(), &new_key, &trade).await?;
        if old_key != new_key {
            if let Err(e) = self.store.delete(&old_key).await {
                error!(trade_id = %trade.trade_id, "Failed to delete superseded record: {}", e);
                if let Err(undo) = self.store.delete(&new_key).await {
                    error!(key = %new_key, "Failed to undo trade write: {}", undo);
                }
                return Err(e.into());
            }
        }

        state.deindex(&old.trade_id);
        state.index(trade.clone());
        self.bus.publish(LedgerEvent::TradeUpdated {
            old,
            new: trade.clone(),
        });

        debug!(
            trade_id = %trade.trade_id,
            sequence = trade.sequence_number,
            "Trade updated"
        );
        Ok(trade)
    }

    async fn remove_locked(&self, state: &mut LedgerState, trade_id: &str) -> Result<Trade> {
        let key = state
            .trades
            .get(trade_id)
            .map(storage_key)
            .ok_or_else(|| BlotterError::trade_not_found(trade_id))?;

        self.store.delete(&key).await?;

        let trade = state
            .deindex(trade_id)
            .ok_or_else(|| BlotterError::trade_not_found(trade_id))?;
        self.bus.publish(LedgerEvent::TradeRemoved(trade.clone()));

        debug!(trade_id = %trade_id, sequence = trade.sequence_number, "Trade removed");
        Ok(trade)
    }
}
