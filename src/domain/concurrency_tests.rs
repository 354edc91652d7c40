//! Concurrency tests for the ledger, the event channel and the materializer
//! Writers, readers and event handlers share the components without deadlock

use async_trait::async_trait;
use chrono::NaiveDate;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::entities::{PositionKey, Side, Trade};
use crate::domain::errors::Result;
use crate::domain::services::{
    EventBus, EventHandler, EventKind, LedgerEvent, PositionMaterializer, TradeLedger,
};
use crate::persistence::MemoryStore;

fn trade(book: &str, ticker: &str, side: Side, quantity: Decimal, price: Decimal) -> Trade {
    Trade::new(
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
        book,
        ticker,
        side,
        quantity,
        price,
    )
}

async fn shared_ledger() -> (Arc<TradeLedger>, Arc<EventBus>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::new();
    let ledger = TradeLedger::load(store.clone(), Arc::clone(&bus)).await.unwrap();
    (Arc::new(ledger), bus, store)
}

// ============================================================================
// SEQUENCE ASSIGNMENT
// ============================================================================

/// Concurrent appends never share a sequence number and leave no gaps
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_get_unique_sequences() {
    let (ledger, _bus, _store) = shared_ledger().await;

    let writers = (0..8).map(|writer| {
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            let mut sequences = Vec::new();
            for i in 0..25 {
                let ticker = if i % 2 == 0 { "AAPL" } else { "MSFT" };
                let stored = ledger
                    .append(trade(&format!("BOOK-{}", writer), ticker, Side::Buy, dec!(1), dec!(10)))
                    .await
                    .unwrap();
                sequences.push(stored.sequence_number);
            }
            sequences
        })
    });

    let mut all = Vec::new();
    for result in join_all(writers).await {
        all.extend(result.unwrap());
    }

    let unique: HashSet<u64> = all.iter().copied().collect();
    assert_eq!(unique.len(), 200);
    assert_eq!(unique.iter().copied().min(), Some(1));
    assert_eq!(unique.iter().copied().max(), Some(200));
    assert_eq!(ledger.head_sequence().await, 200);
}

/// Sequences keep increasing while removals and updates interleave
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequences_increase_with_interleaved_mutations() {
    let (ledger, _bus, _store) = shared_ledger().await;

    let tasks = (0..4).map(|task| {
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            let mut last = 0;
            for i in 0..20 {
                let stored = ledger
                    .append(trade("EQ", "AAPL", Side::Buy, dec!(1), dec!(10)))
                    .await
                    .unwrap();
                assert!(stored.sequence_number > last);
                last = stored.sequence_number;

                if (i + task) % 3 == 0 {
                    ledger.remove(&stored.trade_id).await.unwrap();
                } else if (i + task) % 3 == 1 {
                    let mut changed = stored.clone();
                    changed.price = dec!(11);
                    let updated = ledger.update(changed).await.unwrap();
                    assert_eq!(updated.sequence_number, stored.sequence_number);
                }
            }
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    let sequences: Vec<u64> = ledger.get_all().await.iter().map(|t| t.sequence_number).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ledger.head_sequence().await, 80);
}

// ============================================================================
// READERS AND HANDLERS
// ============================================================================

/// Readers always see a consistent, ordered snapshot while writers run
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_see_ordered_snapshots_during_writes() {
    let (ledger, _bus, _store) = shared_ledger().await;

    let writer = {
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            for _ in 0..100 {
                ledger
                    .append(trade("EQ", "AAPL", Side::Sell, dec!(2), dec!(50)))
                    .await
                    .unwrap();
            }
        })
    };

    let readers = (0..4).map(|_| {
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            for _ in 0..50 {
                let snapshot = ledger.get_all().await;
                for (index, trade) in snapshot.iter().enumerate() {
                    assert_eq!(trade.sequence_number, index as u64 + 1);
                }
                tokio::task::yield_now().await;
            }
        })
    });

    writer.await.unwrap();
    for result in join_all(readers).await {
        result.unwrap();
    }
    assert_eq!(ledger.len().await, 100);
}

/// A handler reading the ledger back never deadlocks against writers
struct ReadBack {
    ledger: Arc<TradeLedger>,
    seen: AtomicUsize,
}

#[async_trait]
impl EventHandler for ReadBack {
    async fn handle(&self, event: &LedgerEvent) -> Result<()> {
        let stored = self.ledger.get_by_id(&event.trade().trade_id).await?;
        assert_eq!(stored.trade_id, event.trade().trade_id);
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_can_read_ledger_while_writers_run() {
    let (ledger, bus, _store) = shared_ledger().await;
    let handler = Arc::new(ReadBack {
        ledger: Arc::clone(&ledger),
        seen: AtomicUsize::new(0),
    });
    bus.subscribe(EventKind::TradeAdded, handler.clone());

    let writers = (0..4).map(|_| {
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            for _ in 0..25 {
                ledger
                    .append(trade("EQ", "AAPL", Side::Buy, dec!(1), dec!(1)))
                    .await
                    .unwrap();
            }
        })
    });
    for result in join_all(writers).await {
        result.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), bus.settle())
        .await
        .expect("dispatcher stalled");
    assert_eq!(handler.seen.load(Ordering::SeqCst), 100);
}

// ============================================================================
// MATERIALIZER UNDER LOAD
// ============================================================================

/// Positions built live under concurrent writers match a fold of the ledger
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_materializer_converges_under_concurrent_writers() {
    let (ledger, bus, store) = shared_ledger().await;
    let materializer = Arc::new(PositionMaterializer::new(store.clone()));
    materializer.load_positions().await.unwrap();
    materializer.attach(&ledger, &bus).await.unwrap();

    let writers = (0..4).map(|writer| {
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            for i in 0..30_i64 {
                let side = if i % 3 == 0 { Side::Sell } else { Side::Buy };
                let book = if writer % 2 == 0 { "A" } else { "B" };
                ledger
                    .append(trade(book, "AAPL", side, Decimal::from(i + 1), Decimal::from(100 + i)))
                    .await
                    .unwrap();
            }
        })
    });
    for result in join_all(writers).await {
        result.unwrap();
    }
    bus.settle().await;

    let mut expected: BTreeMap<PositionKey, Decimal> = BTreeMap::new();
    for trade in ledger.get_all().await {
        *expected.entry(trade.position_key()).or_default() += trade.side.sign() * trade.quantity;
    }

    for (key, quantity) in expected {
        let position = materializer.get_position(&key.book, &key.ticker).await.unwrap();
        assert_eq!(position.quantity, quantity, "{}", key);
        assert_eq!(position.fills().len(), 60);
    }
    assert_eq!(materializer.cursor().await, 120);
    assert!(!materializer.is_stale().await);
}
