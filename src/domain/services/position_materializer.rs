//! PositionMaterializer - per (book, ticker) holdings derived from the ledger
//!
//! # Catch-up
//! `attach` subscribes first and then, still holding the materializer lock,
//! replays every ledger entry after the persisted cursor. Live events queue
//! behind that lock and are applied afterwards. Each position keeps the
//! journal of trades folded into it, so an event for a trade that the replay
//! already covered changes nothing.
//!
//! # Persistence
//! Each position is stored as a fixed-size snapshot under `POSITION:` plus
//! one journal row per fill under `POSITION_FILL:`, so a write costs the same
//! however many trades the bucket holds. Rows are written before memory
//! changes, and the cursor only advances after they succeeded. A failed write
//! or an arithmetic overflow marks the view stale: the store may lag memory
//! until [`PositionMaterializer::rebuild`] runs.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::entities::{Fill, Position, PositionKey, Trade};
use crate::domain::errors::{BlotterError, Result};
use crate::domain::services::event_bus::{
    EventBus, EventHandler, EventKind, LedgerEvent, SubscriptionToken,
};
use crate::domain::services::reference_data::{EnrichedPosition, ReferenceData};
use crate::domain::services::trade_ledger::TradeLedger;
use crate::persistence::{get_json, keys, put_json, DatabaseError, KvStore};

#[derive(Default)]
struct MaterializerState {
    positions: BTreeMap<PositionKey, Position>,
    /// trade_id -> bucket currently holding its fill
    locations: HashMap<String, PositionKey>,
    /// Highest ledger sequence applied
    cursor: u64,
    stale: bool,
}

impl MaterializerState {
    fn bucket(&self, key: &PositionKey) -> Position {
        self.positions
            .get(key)
            .cloned()
            .unwrap_or_else(|| Position::new(key.clone()))
    }

    fn install(&mut self, position: Position) {
        for fill in position.fills() {
            self.locations.insert(fill.trade_id.clone(), position.key());
        }
        self.positions.insert(position.key(), position);
    }
}

/// Stored form of one journal row
#[derive(Serialize, Deserialize)]
struct JournalEntry {
    book: String,
    ticker: String,
    fill: Fill,
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        error!("Corrupt record {}: {}", key, e);
        DatabaseError::SerializationError(e).into()
    })
}

struct Subscription {
    bus: Arc<EventBus>,
    tokens: Vec<(EventKind, SubscriptionToken)>,
}

pub struct PositionMaterializer {
    store: Arc<dyn KvStore>,
    state: Mutex<MaterializerState>,
    subscription: std::sync::Mutex<Option<Subscription>>,
}

impl PositionMaterializer {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            state: Mutex::new(MaterializerState::default()),
            subscription: std::sync::Mutex::new(None),
        }
    }

    /// Rehydrate positions and the replay cursor from the store
    ///
    /// Aggregates are re-folded from the journal; a snapshot that disagrees
    /// with it is replaced in memory and the view is marked stale.
    pub async fn load_positions(&self) -> Result<usize> {
        let snapshots = self.store.scan_prefix(keys::POSITION_PREFIX).await?;
        let journal = self.store.scan_prefix(keys::POSITION_FILL_PREFIX).await?;
        let cursor: u64 = get_json(self.store.as_ref(), keys::HEAD_SEQ_PORTFOLIO)
            .await?
            .unwrap_or(0);

        let mut fills: BTreeMap<PositionKey, Vec<Fill>> = BTreeMap::new();
        for (key, raw) in &journal {
            let entry: JournalEntry = decode(key, raw)?;
            fills
                .entry(PositionKey::new(entry.book, entry.ticker))
                .or_default()
                .push(entry.fill);
        }

        let mut loaded = MaterializerState::default();
        for (key, raw) in &snapshots {
            let snapshot: Position = decode(key, raw)?;
            let journaled = fills.remove(&snapshot.key()).unwrap_or_default();
            let position = Position::from_fills(snapshot.key(), journaled)?;
            if !position.same_totals(&snapshot) {
                warn!(
                    book = %position.book,
                    ticker = %position.ticker,
                    "Position snapshot disagrees with its fill journal"
                );
                loaded.stale = true;
            }
            loaded.install(position);
        }
        for (key, journaled) in fills {
            warn!(book = %key.book, ticker = %key.ticker, "Fill journal without a position snapshot");
            loaded.install(Position::from_fills(key, journaled)?);
            loaded.stale = true;
        }
        loaded.cursor = cursor;

        let mut state = self.state.lock().await;
        *state = loaded;
        info!(
            positions = state.positions.len(),
            fills = journal.len(),
            cursor,
            stale = state.stale,
            "Positions loaded"
        );
        Ok(state.positions.len())
    }

    /// Subscribe to live ledger events and catch up on what was missed
    ///
    /// Returns the number of trades applied during catch-up.
    pub async fn attach(self: &Arc<Self>, ledger: &TradeLedger, bus: &Arc<EventBus>) -> Result<usize> {
        let mut state = self.state.lock().await;

        self.detach();
        let tokens = EventKind::ALL
            .iter()
            .map(|kind| {
                let handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
                (*kind, bus.subscribe(*kind, handler))
            })
            .collect();
        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Subscription {
            bus: Arc::clone(bus),
            tokens,
        });

        let head = ledger.head_sequence().await;
        let mut applied = 0;
        if state.cursor < head {
            for trade in ledger.get_by_sequence_range(state.cursor + 1, head).await {
                if self.apply_new_locked(&mut state, &trade).await? {
                    applied += 1;
                }
            }
        }

        applied += self.reconcile_locked(&mut state, ledger).await?;

        info!(applied, cursor = state.cursor, head, "Materializer attached");
        Ok(applied)
    }

    /// Drop live subscriptions; returns false if none were active
    pub fn detach(&self) -> bool {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match subscription {
            Some(subscription) => {
                for (kind, token) in subscription.tokens {
                    subscription.bus.unsubscribe(kind, token);
                }
                debug!("Materializer detached");
                true
            }
            None => false,
        }
    }

    pub async fn apply_new_trade(&self, trade: &Trade) -> Result<()> {
        let mut state = self.state.lock().await;
        self.apply_new_locked(&mut state, trade).await.map(|_| ())
    }

    pub async fn apply_updated_trade(&self, old: &Trade, new: &Trade) -> Result<()> {
        let mut state = self.state.lock().await;
        self.apply_updated_locked(&mut state, old, new).await
    }

    pub async fn apply_removed_trade(&self, trade: &Trade) -> Result<()> {
        let mut state = self.state.lock().await;
        self.apply_removed_locked(&mut state, &trade.trade_id).await
    }

    pub async fn get_position(&self, book: &str, ticker: &str) -> Result<Position> {
        let state = self.state.lock().await;
        state
            .positions
            .get(&PositionKey::new(book, ticker))
            .cloned()
            .ok_or_else(|| BlotterError::position_not_found(book, ticker))
    }

    /// Positions of one book, by ticker
    pub async fn get_positions(&self, book: &str) -> Vec<Position> {
        let state = self.state.lock().await;
        state
            .positions
            .range(PositionKey::new(book, "")..)
            .take_while(|(key, _)| key.book == book)
            .map(|(_, position)| position.clone())
            .collect()
    }

    pub async fn get_all_positions(&self) -> Vec<Position> {
        let state = self.state.lock().await;
        state.positions.values().cloned().collect()
    }

    /// Decorate every position with reference data; lookups run unlocked
    pub async fn get_enriched_positions(&self, reference: &dyn ReferenceData) -> Result<Vec<EnrichedPosition>> {
        let positions = self.get_all_positions().await;

        let mut enriched = Vec::with_capacity(positions.len());
        for position in &positions {
            let info = reference.security_info(&position.ticker).await?;
            enriched.push(EnrichedPosition::new(position, info));
        }
        Ok(enriched)
    }

    pub async fn cursor(&self) -> u64 {
        self.state.lock().await.cursor
    }

    /// True after a persistence failure left the store behind memory
    pub async fn is_stale(&self) -> bool {
        self.state.lock().await.stale
    }

    /// Discard derived state and replay the whole ledger
    ///
    /// Buckets that no longer hold any trade are kept and written back flat.
    pub async fn rebuild(&self, ledger: &TradeLedger) -> Result<usize> {
        let mut state = self.state.lock().await;
        let trades = ledger.get_all().await;

        let mut rebuilt = MaterializerState::default();
        for key in state.positions.keys() {
            rebuilt.positions.insert(key.clone(), Position::new(key.clone()));
        }
        for trade in &trades {
            let key = trade.position_key();
            let position = rebuilt
                .positions
                .entry(key.clone())
                .or_insert_with(|| Position::new(key.clone()));
            if let Err(e) = position.apply_fill(Fill::from(trade)) {
                error!(trade_id = %trade.trade_id, "Rebuild failed: {}", e);
                state.stale = true;
                return Err(e);
            }
            rebuilt.locations.insert(trade.trade_id.clone(), key);
            rebuilt.cursor = rebuilt.cursor.max(trade.sequence_number);
        }

        if let Err(e) = self.write_rebuilt(&rebuilt).await {
            state.stale = true;
            return Err(e.into());
        }

        *state = rebuilt;
        info!(
            trades = trades.len(),
            positions = state.positions.len(),
            cursor = state.cursor,
            "Positions rebuilt from ledger"
        );
        Ok(trades.len())
    }

    /// Returns false when the trade was already folded in
    async fn apply_new_locked(&self, state: &mut MaterializerState, trade: &Trade) -> Result<bool> {
        if state.locations.contains_key(&trade.trade_id) {
            debug!(trade_id = %trade.trade_id, "Trade already applied, skipping");
            return Ok(false);
        }

        let key = trade.position_key();
        let fill = Fill::from(trade);
        let mut position = state.bucket(&key);
        position
            .apply_fill(fill.clone())
            .map_err(|e| Self::mark_stale(state, e))?;

        Self::stale_on_error(state, self.put_fill(&key, &fill).await)?;
        Self::stale_on_error(state, self.put_snapshot(&position).await)?;
        state.positions.insert(key.clone(), position);
        state.locations.insert(trade.trade_id.clone(), key);

        self.advance_cursor(state, trade.sequence_number).await?;

        debug!(
            trade_id = %trade.trade_id,
            sequence = trade.sequence_number,
            book = %trade.book,
            ticker = %trade.ticker,
            "Trade applied to position"
        );
        Ok(true)
    }

    async fn apply_updated_locked(&self, state: &mut MaterializerState, old: &Trade, new: &Trade) -> Result<()> {
        let Some(from) = state.locations.get(&old.trade_id).cloned() else {
            debug!(trade_id = %new.trade_id, "Updated trade was never applied, applying as new");
            return self.apply_new_locked(state, new).await.map(|_| ());
        };
        let to = new.position_key();
        let fill = Fill::from(new);

        let mut source = state.bucket(&from);
        let removed = source
            .remove_fill(&old.trade_id)
            .map_err(|e| Self::mark_stale(state, e))?;
        let target = if from == to {
            source
                .apply_fill(fill.clone())
                .map_err(|e| Self::mark_stale(state, e))?;
            None
        } else {
            let mut target = state.bucket(&to);
            target
                .apply_fill(fill.clone())
                .map_err(|e| Self::mark_stale(state, e))?;
            Some(target)
        };

        // within one bucket the journal row keeps its key and is overwritten
        if from != to {
            if let Some(removed) = &removed {
                Self::stale_on_error(state, self.delete_fill(&from, removed).await)?;
            }
        }
        Self::stale_on_error(state, self.put_fill(&to, &fill).await)?;
        Self::stale_on_error(state, self.put_snapshot(&source).await)?;
        state.positions.insert(from, source);
        if let Some(target) = target {
            Self::stale_on_error(state, self.put_snapshot(&target).await)?;
            state.positions.insert(to.clone(), target);
        }
        state.locations.insert(new.trade_id.clone(), to);

        self.advance_cursor(state, new.sequence_number).await?;

        debug!(trade_id = %new.trade_id, "Trade update applied to positions");
        Ok(())
    }

    async fn apply_removed_locked(&self, state: &mut MaterializerState, trade_id: &str) -> Result<()> {
        let Some(key) = state.locations.get(trade_id).cloned() else {
            debug!(trade_id = %trade_id, "Removed trade was never applied, nothing to reverse");
            return Ok(());
        };

        let mut position = state.bucket(&key);
        let removed = position
            .remove_fill(trade_id)
            .map_err(|e| Self::mark_stale(state, e))?;

        if let Some(removed) = &removed {
            Self::stale_on_error(state, self.delete_fill(&key, removed).await)?;
        }
        Self::stale_on_error(state, self.put_snapshot(&position).await)?;
        state.positions.insert(key, position);
        state.locations.remove(trade_id);

        debug!(trade_id = %trade_id, "Trade removal reversed");
        Ok(())
    }

    /// Bring journaled trades in line with the ledger: trades gone from the
    /// ledger are reversed, trades that changed are re-applied
    async fn reconcile_locked(&self, state: &mut MaterializerState, ledger: &TradeLedger) -> Result<usize> {
        let current: HashMap<String, Trade> = ledger
            .get_all()
            .await
            .into_iter()
            .map(|trade| (trade.trade_id.clone(), trade))
            .collect();

        let mut changed = 0;

        let journaled: Vec<(String, PositionKey)> = state
            .locations
            .iter()
            .map(|(id, key)| (id.clone(), key.clone()))
            .collect();
        for (trade_id, key) in journaled {
            match current.get(&trade_id) {
                None => {
                    self.apply_removed_locked(state, &trade_id).await?;
                    changed += 1;
                }
                Some(trade) => {
                    let fill = state.positions.get(&key).and_then(|p| p.fill(&trade_id)).cloned();
                    if key != trade.position_key() || fill.as_ref() != Some(&Fill::from(trade)) {
                        let old = trade.clone();
                        self.apply_updated_locked(state, &old, trade).await?;
                        changed += 1;
                    }
                }
            }
        }

        let mut missing: Vec<&Trade> = current
            .values()
            .filter(|trade| !state.locations.contains_key(&trade.trade_id))
            .collect();
        missing.sort_by_key(|trade| trade.sequence_number);
        for trade in missing {
            if self.apply_new_locked(state, trade).await? {
                changed += 1;
            }
        }

        if changed > 0 {
            warn!(changed, "Reconciled positions against the ledger");
        }
        Ok(changed)
    }

    async fn advance_cursor(&self, state: &mut MaterializerState, sequence: u64) -> Result<()> {
        if sequence <= state.cursor {
            return Ok(());
        }
        if let Err(e) = put_json(self.store.as_ref(), keys::HEAD_SEQ_PORTFOLIO, &sequence).await {
            error!(sequence, "Failed to persist replay cursor: {}", e);
            state.stale = true;
            return Err(e.into());
        }
        state.cursor = sequence;
        Ok(())
    }

    fn mark_stale(state: &mut MaterializerState, e: BlotterError) -> BlotterError {
        warn!("Position view marked stale: {}", e);
        state.stale = true;
        e
    }

    fn stale_on_error(
        state: &mut MaterializerState,
        result: std::result::Result<(), DatabaseError>,
    ) -> Result<()> {
        result.map_err(|e| Self::mark_stale(state, e.into()))
    }

    async fn put_fill(&self, key: &PositionKey, fill: &Fill) -> std::result::Result<(), DatabaseError> {
        let row = keys::position_fill_key(&key.book, &key.ticker, fill.sequence_number, &fill.trade_id);
        let entry = JournalEntry {
            book: key.book.clone(),
            ticker: key.ticker.clone(),
            fill: fill.clone(),
        };
        put_json(self.store.as_ref(), &row, &entry).await.map_err(|e| {
            error!(trade_id = %fill.trade_id, position = %key, "Failed to persist fill: {}", e);
            e
        })
    }

    async fn delete_fill(&self, key: &PositionKey, fill: &Fill) -> std::result::Result<(), DatabaseError> {
        let row = keys::position_fill_key(&key.book, &key.ticker, fill.sequence_number, &fill.trade_id);
        self.store.delete(&row).await.map_err(|e| {
            error!(trade_id = %fill.trade_id, position = %key, "Failed to delete fill: {}", e);
            e
        })
    }

    async fn put_snapshot(&self, position: &Position) -> std::result::Result<(), DatabaseError> {
        let key = keys::position_key(&position.book, &position.ticker);
        put_json(self.store.as_ref(), &key, position).await.map_err(|e| {
            error!(book = %position.book, ticker = %position.ticker, "Failed to persist position: {}", e);
            e
        })
    }

    /// Replace every stored fill, snapshot and the cursor with `rebuilt`
    async fn write_rebuilt(&self, rebuilt: &MaterializerState) -> std::result::Result<(), DatabaseError> {
        for (row, _) in self.store.scan_prefix(keys::POSITION_FILL_PREFIX).await? {
            self.store.delete(&row).await?;
        }
        for position in rebuilt.positions.values() {
            let key = position.key();
            for fill in position.fills() {
                self.put_fill(&key, fill).await?;
            }
            self.put_snapshot(position).await?;
        }
        put_json(self.store.as_ref(), keys::HEAD_SEQ_PORTFOLIO, &rebuilt.cursor)
            .await
            .map_err(|e| {
                error!("Failed to persist replay cursor: {}", e);
                e
            })
    }
}

#[async_trait]
impl EventHandler for PositionMaterializer {
    async fn handle(&self, event: &LedgerEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        match event {
            LedgerEvent::TradeAdded(trade) => self.apply_new_locked(&mut state, trade).await.map(|_| ()),
            LedgerEvent::TradeUpdated { old, new } => self.apply_updated_locked(&mut state, old, new).await,
            LedgerEvent::TradeRemoved(trade) => self.apply_removed_locked(&mut state, &trade.trade_id).await,
        }
    }
}
