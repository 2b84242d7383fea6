use super::{open_database, CommandResult};
use crate::config::EngineConfig;
use crate::reports::TallyReport;
use crate::tally::TallyEngine;
use std::path::Path;
use std::sync::Arc;

/// One-shot report: a single resync, no live updates.
pub async fn report(
    database_path: &Path,
    config: EngineConfig,
    json: bool,
    show_metrics: bool,
) -> CommandResult {
    let db = open_database(database_path).await?;
    let engine = TallyEngine::start(Arc::new(db), config).await?;
    let report = TallyReport::from_snapshot(&engine.snapshot());

    if json {
        println!("{}", report.to_json()?);
    } else {
        report.print();
    }
    if show_metrics {
        engine.metrics().print_summary();
    }
    Ok(())
}
