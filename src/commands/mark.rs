use super::{open_database, CommandError, CommandResult};
use crate::config::EngineConfig;
use crate::model::CandidateId;
use crate::reports::TallyReport;
use crate::tally::{spawn_engine, BatchError, BatchPhase, EngineError, EngineHandle, MarkOutcome};
use colored::*;
use std::path::Path;
use std::sync::Arc;

/// Record `count` check-marks for each candidate, then post whatever is
/// still pending.
pub async fn mark(
    database_path: &Path,
    config: EngineConfig,
    candidates: &[i64],
    count: u32,
) -> CommandResult {
    if candidates.is_empty() {
        return Err(CommandError::Input("no candidates given".to_string()));
    }

    let db = open_database(database_path).await?;
    let (handle, engine) = spawn_engine(Arc::new(db), config, Vec::new()).await?;

    for &id in candidates {
        let candidate = CandidateId(id);
        for _ in 0..count {
            if let MarkOutcome::FlushDue(ticket) = mark_once(&handle, candidate).await? {
                println!(
                    "  📤 Posting batch of {} for candidate {}",
                    ticket.count.to_string().bright_yellow(),
                    candidate
                );
            }
        }
    }

    let report = handle.flush_all().await?;
    for receipt in &report.committed {
        println!(
            "  ✅ Candidate {}: {} → {}",
            receipt.candidate,
            receipt.previous_score,
            receipt.new_score.to_string().bright_green()
        );
    }
    for (candidate, error) in &report.failed {
        eprintln!("  ❌ Candidate {}: {}", candidate, error);
    }

    handle.shutdown().await;
    let engine = engine
        .await
        .map_err(|e| CommandError::Input(format!("engine task failed: {}", e)))?;
    TallyReport::from_snapshot(&engine.snapshot()).print();

    if report.is_clean() {
        Ok(())
    } else {
        Err(CommandError::Input(format!(
            "{} batches were not posted",
            report.failed.len()
        )))
    }
}

/// Mark once, waiting out a batch that is still being posted.
async fn mark_once(handle: &EngineHandle, candidate: CandidateId) -> CommandResult<MarkOutcome> {
    loop {
        match handle.mark(candidate).await {
            Err(EngineError::Batch(BatchError::FlushInFlight(_))) => {
                handle
                    .wait_for(|s| {
                        s.candidate(candidate)
                            .map_or(true, |c| !matches!(c.phase, BatchPhase::Flushing(_)))
                    })
                    .await?;
            }
            result => return Ok(result?),
        }
    }
}
