use super::{CommandError, CommandResult};
use crate::config::EngineConfig;
use crate::database::{TallyDatabase, TallyStore};
use crate::feed::{BroadcastFeed, ChangeFeed};
use crate::model::{BallotGroupId, CandidateId, Vote, VoterCategory};
use crate::reports::TallyReport;
use crate::tally::{spawn_engine, BatchPhase, EngineHandle, ReconciliationListener};
use chrono::Utc;
use colored::*;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const DEMO_ROSTER: [(&str, &[&str]); 3] = [
    ("Red", &["Alice", "Bob", "Carol"]),
    ("Blue", &["Dan", "Erin"]),
    ("Green", &["Frank"]),
];

/// Several operator sessions marking against one shared in-memory store.
///
/// Each session only learns about the others' posts through change
/// notifications and resync; at the end every session must show the scores
/// the store holds.
pub async fn simulate(
    config: EngineConfig,
    sessions: usize,
    marks_per_session: u32,
    ballots: u32,
) -> CommandResult {
    if sessions == 0 {
        return Err(CommandError::Input("need at least one session".to_string()));
    }

    let feed = BroadcastFeed::new();
    let db = TallyDatabase::create_in_memory()
        .await?
        .with_notifier(feed.clone());
    let candidates = seed_demo(&db).await?;
    println!(
        "🧪 Simulating {} sessions over {} candidates",
        sessions.to_string().bright_cyan(),
        candidates.len().to_string().bright_cyan()
    );

    let mut handles = Vec::with_capacity(sessions);
    let mut engines = Vec::with_capacity(sessions);
    for _ in 0..sessions {
        let shared: Arc<dyn ChangeFeed> = Arc::new(feed.clone());
        let listeners = vec![
            ReconciliationListener::scores(shared.clone(), config.score_feed.clone()),
            ReconciliationListener::statistics(shared, config.stats_feed.clone()),
        ];
        let (handle, engine) = spawn_engine(Arc::new(db.clone()), config.clone(), listeners).await?;
        handles.push(handle);
        engines.push(engine);
    }

    let sessions_done = handles
        .iter()
        .enumerate()
        .map(|(session, handle)| run_session(handle, session, &candidates, marks_per_session));
    try_join_all(sessions_done).await?;

    for group in 0..ballots {
        let votes: Vec<_> = candidates
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let vote = match (group as usize + i) % 7 {
                    0 => Vote::For,
                    1 => Vote::Against,
                    _ => Vote::Blank,
                };
                (*id, vote)
            })
            .collect();
        let category = if group % 3 == 0 {
            VoterCategory::B
        } else {
            VoterCategory::A
        };
        db.insert_ballot_group(BallotGroupId(i64::from(group) + 1), category, &votes, Utc::now())
            .await?;
    }

    let mut expected = HashMap::new();
    for candidate in db.fetch_candidates().await? {
        expected.insert(candidate.id, candidate.score);
    }
    let expected_ballots = ballots as usize;

    for (session, handle) in handles.iter().enumerate() {
        let converged = tokio::time::timeout(
            Duration::from_secs(10),
            handle.wait_for(|s| {
                s.ballot_counts.total() == expected_ballots
                    && s.candidates
                        .iter()
                        .all(|c| expected.get(&c.candidate.id) == Some(&c.candidate.score))
            }),
        )
        .await;
        match converged {
            Ok(result) => {
                result?;
                println!("  ✅ Session {} converged", session + 1);
            }
            Err(_) => {
                return Err(CommandError::Input(format!(
                    "session {} did not converge",
                    session + 1
                )))
            }
        }
    }

    if let Some(first) = handles.first() {
        TallyReport::from_snapshot(&first.current_snapshot()).print();
    }

    for handle in &handles {
        handle.shutdown().await;
    }
    for engine in engines {
        if let Ok(engine) = engine.await {
            engine.metrics().print_summary();
        }
    }
    Ok(())
}

async fn seed_demo(db: &TallyDatabase) -> CommandResult<Vec<CandidateId>> {
    let mut candidates = Vec::new();
    for (list_order, (list, names)) in DEMO_ROSTER.iter().enumerate() {
        let list_id = db.insert_list(list, list_order as i64 + 1).await?;
        for (order, name) in names.iter().enumerate() {
            candidates.push(db.insert_candidate(list_id, name, order as i64).await?);
        }
    }
    Ok(candidates)
}

/// Spread marks over the roster, offset per session, then post the rest.
async fn run_session(
    handle: &EngineHandle,
    session: usize,
    candidates: &[CandidateId],
    marks: u32,
) -> CommandResult {
    for i in 0..marks as usize {
        let candidate = candidates[(session + i * (session + 1)) % candidates.len()];
        if let Err(err) = handle.mark(candidate).await {
            tracing::debug!(session, candidate = %candidate, error = %err, "mark rejected");
        }
    }

    let report = handle.flush_all().await?;
    // Threshold flushes started by marks may still be running.
    handle
        .wait_for(|s| {
            s.candidates
                .iter()
                .all(|c| !matches!(c.phase, BatchPhase::Flushing(_)))
        })
        .await?;
    println!(
        "  📤 Session {} posted {} marks",
        session + 1,
        report.marks_posted().to_string().bright_yellow()
    );
    if !report.is_clean() {
        return Err(CommandError::Input(format!(
            "session {} could not post {} batches",
            session + 1,
            report.failed.len()
        )));
    }
    Ok(())
}
