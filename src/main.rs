use std::fs::File;
use std::sync::Arc;

use blotter::config::BlotterConfig;
use blotter::persistence::{init_database, KvStore, SqliteStore};
use blotter::{BlotterError, EventBus, PositionMaterializer, TradeLedger};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blotter=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BlotterConfig::from_env();
    info!("Trade blotter starting ({})", config.database_url);

    let pool = init_database(&config.database_url, config.database_max_connections).await?;
    let store: Arc<dyn KvStore> = Arc::new(SqliteStore::new(pool));
    let bus = EventBus::with_slow_handler_threshold(config.slow_handler_threshold());

    let ledger = TradeLedger::load(Arc::clone(&store), Arc::clone(&bus)).await?;

    let materializer = Arc::new(PositionMaterializer::new(Arc::clone(&store)));
    materializer.load_positions().await?;
    let replayed = materializer.attach(&ledger, &bus).await?;
    info!("✓ Positions attached, {} trade(s) replayed", replayed);

    if let Some(path) = &config.import_csv {
        info!("Importing {}", path.display());
        match ledger.import_csv(File::open(path)?).await {
            Ok(count) => info!("✓ Imported {} trade(s)", count),
            Err(BlotterError::PartialBatchFailure { failed, count }) => {
                for failure in &failed {
                    warn!("Import failure: {}", failure);
                }
                warn!("✗ {} row(s) could not be imported", count);
            }
            Err(e) if e.is_caller_error() => warn!("✗ Import rejected, nothing appended: {}", e),
            Err(e) => error!("✗ Import aborted: {}", e),
        }
    }

    bus.settle().await;

    if materializer.is_stale().await {
        warn!("Position view is stale, rebuilding from the ledger");
        match materializer.rebuild(&ledger).await {
            Ok(count) => info!("✓ Positions rebuilt from {} trade(s)", count),
            Err(e) => error!("✗ Rebuild failed, positions remain stale: {}", e),
        }
    }

    for position in materializer.get_all_positions().await {
        info!(
            book = %position.book,
            ticker = %position.ticker,
            quantity = %position.quantity,
            avg_price = %position.avg_price,
            realized_pnl = %position.realized_pnl,
            "Position"
        );
    }

    if let Some(path) = &config.export_csv {
        let written = ledger.export_csv(File::create(path)?).await?;
        info!("✓ Exported {} trade(s) to {}", written, path.display());
    }

    materializer.detach();
    info!(
        "Trade blotter stopped: {} trade(s), head sequence {}",
        ledger.len().await,
        ledger.head_sequence().await
    );
    Ok(())
}
