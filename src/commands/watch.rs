use super::{open_database, CommandError, CommandResult};
use crate::config::EngineConfig;
use crate::feed::{ChangeFeed, ChangeLogFeed};
use crate::reports::TallyReport;
use crate::tally::{spawn_engine, ReconciliationListener};
use colored::*;
use std::path::Path;
use std::sync::Arc;

/// Follow the database live and reprint the tally whenever it changes.
/// Picks up writes from any other process through the change log.
pub async fn watch(database_path: &Path, config: EngineConfig, json: bool) -> CommandResult {
    let db = open_database(database_path).await?;
    let feed: Arc<dyn ChangeFeed> = Arc::new(ChangeLogFeed::new(db.clone(), config.poll_interval()));
    let listeners = vec![
        ReconciliationListener::scores(feed.clone(), config.score_feed.clone()),
        ReconciliationListener::statistics(feed, config.stats_feed.clone()),
    ];

    let (handle, engine) = spawn_engine(Arc::new(db), config, listeners).await?;
    let mut snapshots = handle.subscribe();
    println!(
        "👀 Watching {} (ctrl-c to stop)",
        database_path.display().to_string().bright_cyan()
    );

    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        let report = TallyReport::from_snapshot(&snapshot);
        if json {
            println!("{}", report.to_json()?);
        } else {
            report.print();
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await;
    let engine = engine
        .await
        .map_err(|e| CommandError::Input(format!("engine task failed: {}", e)))?;
    engine.metrics().print_summary();
    Ok(())
}
