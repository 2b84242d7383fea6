use super::aggregator::{self, ClassifiedCounts};
use super::batch::{BatchLedger, BatchPhase, FlushTicket, MarkOutcome};
use super::flush::{self, FlushError, FlushOutcome, FlushReceipt};
use super::listener::FeedStatus;
use super::metrics::{EngineStage, MetricsCollector};
use super::EngineError;
use crate::config::EngineConfig;
use crate::database::{DatabaseError, TallyStore};
use crate::model::{BallotLine, Candidate, CandidateId, CandidateList};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A candidate as presented: persisted score plus local pending marks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateTally {
    #[serde(flatten)]
    pub candidate: Candidate,
    pub pending: u32,
    pub phase: BatchPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineWarning {
    /// The last resync failed; figures are from the last good read.
    StaleSnapshot { error: String },
    FlushFailed { candidate: CandidateId, error: String },
    FeedDegraded { listener: String, failures: u32 },
    FeedDisconnected { listener: String, reason: String },
    InconsistentBallots { groups: usize },
}

impl fmt::Display for EngineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineWarning::StaleSnapshot { error } => {
                write!(f, "figures may be stale, last refresh failed: {}", error)
            }
            EngineWarning::FlushFailed { candidate, error } => {
                write!(f, "marks for candidate {} were not posted: {}", candidate, error)
            }
            EngineWarning::FeedDegraded { listener, failures } => write!(
                f,
                "live updates ({}) interrupted, {} reconnect attempts so far",
                listener, failures
            ),
            EngineWarning::FeedDisconnected { listener, reason } => {
                write!(f, "live updates ({}) stopped: {}", listener, reason)
            }
            EngineWarning::InconsistentBallots { groups } => write!(
                f,
                "{} ballots have lines that disagree on classification or category",
                groups
            ),
        }
    }
}

/// The read model handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TallySnapshot {
    pub lists: Vec<CandidateList>,
    pub candidates: Vec<CandidateTally>,
    #[serde(rename = "ballotCounts")]
    pub ballot_counts: ClassifiedCounts,
    #[serde(rename = "syncedAt")]
    pub synced_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub feeds: BTreeMap<String, FeedStatus>,
    pub warnings: Vec<EngineWarning>,
    /// Bumped on every state change.
    pub revision: u64,
}

impl TallySnapshot {
    pub fn candidate(&self, id: CandidateId) -> Option<&CandidateTally> {
        self.candidates.iter().find(|c| c.candidate.id == id)
    }

    pub fn score(&self, id: CandidateId) -> Option<u64> {
        self.candidate(id).map(|c| c.candidate.score)
    }

    pub fn pending(&self, id: CandidateId) -> u32 {
        self.candidate(id).map_or(0, |c| c.pending)
    }
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub committed: Vec<FlushReceipt>,
    pub failed: Vec<(CandidateId, FlushError)>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn marks_posted(&self) -> u64 {
        self.committed.iter().map(|r| u64::from(r.flushed)).sum()
    }
}

/// Owns the in-memory view of scores and ballot counts.
///
/// The store stays the source of truth: every resync replaces the candidate
/// and count views wholesale, and only pending marks survive it.
pub struct TallyEngine {
    store: Arc<dyn TallyStore>,
    config: EngineConfig,
    batches: BatchLedger,
    lists: Vec<CandidateList>,
    candidates: Vec<Candidate>,
    ballot_counts: ClassifiedCounts,
    synced_at: Option<DateTime<Utc>>,
    last_sync_error: Option<String>,
    flush_failures: BTreeMap<CandidateId, String>,
    feeds: BTreeMap<String, FeedStatus>,
    metrics: MetricsCollector,
    revision: u64,
}

impl TallyEngine {
    pub fn new(store: Arc<dyn TallyStore>, config: EngineConfig) -> Self {
        Self {
            store,
            batches: BatchLedger::new(config.batch_size),
            metrics: MetricsCollector::new(config.metrics_history),
            config,
            lists: Vec::new(),
            candidates: Vec::new(),
            ballot_counts: ClassifiedCounts::default(),
            synced_at: None,
            last_sync_error: None,
            flush_failures: BTreeMap::new(),
            feeds: BTreeMap::new(),
            revision: 0,
        }
    }

    /// Build an engine and run the initial resync it needs to be ready.
    pub async fn start(
        store: Arc<dyn TallyStore>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let mut engine = Self::new(store, config);
        engine.resync().await.map_err(EngineError::NotReady)?;
        Ok(engine)
    }

    pub fn is_ready(&self) -> bool {
        self.synced_at.is_some()
    }

    pub fn store(&self) -> Arc<dyn TallyStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut MetricsCollector {
        &mut self.metrics
    }

    /// Re-read lists, candidates and the full ballot store, then replace the
    /// in-memory view. On failure the last good view is kept and flagged
    /// stale.
    pub async fn resync(&mut self) -> Result<(), DatabaseError> {
        self.metrics.start_stage("resync");
        let read = self.read_all().await;
        self.revision += 1;

        let (lists, candidates, lines) = match read {
            Ok(read) => read,
            Err(err) => {
                if err.is_permission_denied() {
                    tracing::error!(error = %err, "resync refused by store");
                } else {
                    tracing::warn!(error = %err, "resync failed, keeping last snapshot");
                }
                self.last_sync_error = Some(err.to_string());
                self.metrics
                    .end_stage("resync", EngineStage::Resync, None, false);
                return Err(err);
            }
        };

        self.metrics.start_stage("aggregate");
        let counts = aggregator::recompute(&lines, self.config.classification);
        self.metrics.end_stage(
            "aggregate",
            EngineStage::Aggregate,
            Some(lines.len() as u64),
            true,
        );

        let known: HashSet<CandidateId> = candidates.iter().map(|c| c.id).collect();
        self.batches.retain(|id| known.contains(&id));
        self.flush_failures.retain(|id, _| known.contains(id));

        self.lists = lists;
        self.candidates = candidates;
        self.ballot_counts = counts;
        self.synced_at = Some(Utc::now());
        self.last_sync_error = None;

        let rows = (self.candidates.len() + lines.len()) as u64;
        let timing = self
            .metrics
            .end_stage("resync", EngineStage::Resync, Some(rows), true);
        tracing::info!(
            candidates = self.candidates.len(),
            ballots = self.ballot_counts.total(),
            duration_ms = timing.duration_ms,
            "resync complete"
        );
        Ok(())
    }

    async fn read_all(
        &self,
    ) -> Result<(Vec<CandidateList>, Vec<Candidate>, Vec<BallotLine>), DatabaseError> {
        let lists = self.store.fetch_lists().await?;
        let candidates = self.store.fetch_candidates().await?;
        let lines = self.store.fetch_ballot_lines().await?;
        Ok((lists, candidates, lines))
    }

    pub fn snapshot(&self) -> TallySnapshot {
        let candidates = self
            .candidates
            .iter()
            .map(|candidate| CandidateTally {
                candidate: candidate.clone(),
                pending: self.batches.pending(candidate.id),
                phase: self.batches.phase(candidate.id),
            })
            .collect();

        TallySnapshot {
            lists: self.lists.clone(),
            candidates,
            ballot_counts: self.ballot_counts.clone(),
            synced_at: self.synced_at,
            stale: self.last_sync_error.is_some(),
            feeds: self.feeds.clone(),
            warnings: self.warnings(),
            revision: self.revision,
        }
    }

    fn warnings(&self) -> Vec<EngineWarning> {
        let mut warnings = Vec::new();
        if let Some(error) = &self.last_sync_error {
            warnings.push(EngineWarning::StaleSnapshot {
                error: error.clone(),
            });
        }
        for (candidate, error) in &self.flush_failures {
            warnings.push(EngineWarning::FlushFailed {
                candidate: *candidate,
                error: error.clone(),
            });
        }
        for (listener, status) in &self.feeds {
            match status {
                FeedStatus::Degraded { failures } => warnings.push(EngineWarning::FeedDegraded {
                    listener: listener.clone(),
                    failures: *failures,
                }),
                FeedStatus::Disconnected { reason } => {
                    warnings.push(EngineWarning::FeedDisconnected {
                        listener: listener.clone(),
                        reason: reason.clone(),
                    })
                }
                _ => {}
            }
        }
        if !self.ballot_counts.inconsistent_groups.is_empty() {
            warnings.push(EngineWarning::InconsistentBallots {
                groups: self.ballot_counts.inconsistent_groups.len(),
            });
        }
        warnings
    }

    fn ensure_known(&self, candidate: CandidateId) -> Result<(), EngineError> {
        if self.candidates.iter().any(|c| c.id == candidate) {
            Ok(())
        } else {
            Err(EngineError::UnknownCandidate(candidate))
        }
    }

    /// Record one check-mark. Returns the flush to run when the batch filled.
    pub fn mark(&mut self, candidate: CandidateId) -> Result<MarkOutcome, EngineError> {
        self.ensure_known(candidate)?;
        let outcome = self.batches.mark(candidate)?;
        self.revision += 1;
        Ok(outcome)
    }

    /// Remove one pending check-mark.
    pub fn unmark(&mut self, candidate: CandidateId) -> Result<u32, EngineError> {
        self.ensure_known(candidate)?;
        let pending = self.batches.unmark(candidate)?;
        self.revision += 1;
        Ok(pending)
    }

    /// Claim every pending batch for a "post all".
    pub fn claim_all(&mut self) -> Vec<FlushTicket> {
        let tickets = self.batches.claim_all();
        if !tickets.is_empty() {
            self.revision += 1;
        }
        tickets
    }

    /// Apply the result of a flush to local state.
    pub fn settle(&mut self, outcome: &FlushOutcome) {
        self.batches.settle(outcome.ticket, outcome.committed());
        self.revision += 1;
        let candidate = outcome.ticket.candidate;

        match &outcome.result {
            Ok(receipt) => {
                self.flush_failures.remove(&candidate);
                // The conditional update is itself an authoritative read.
                if let Some(c) = self.candidates.iter_mut().find(|c| c.id == candidate) {
                    c.score = c.score.max(receipt.new_score);
                }
                self.metrics.end_stage(
                    &flush_key(candidate),
                    EngineStage::Flush,
                    Some(u64::from(receipt.flushed)),
                    true,
                );
                tracing::info!(
                    candidate = %candidate,
                    marks = receipt.flushed,
                    score = receipt.new_score,
                    "batch posted"
                );
            }
            Err(err) => {
                self.flush_failures.insert(candidate, err.to_string());
                self.metrics
                    .end_stage(&flush_key(candidate), EngineStage::Flush, None, false);
                if err.is_permission_denied() {
                    tracing::error!(candidate = %candidate, error = %err, "flush refused by store");
                } else {
                    tracing::warn!(candidate = %candidate, error = %err, "flush failed, marks kept");
                }
            }
        }
    }

    /// Note that a flush is about to run, for timing.
    pub fn begin_flush(&mut self, ticket: &FlushTicket) {
        self.metrics.start_stage(&flush_key(ticket.candidate));
    }

    /// Run one claimed flush and settle it.
    pub async fn flush(&mut self, ticket: FlushTicket) -> FlushOutcome {
        self.begin_flush(&ticket);
        let result =
            flush::execute(self.store.as_ref(), ticket, self.config.flush_conflict_retries).await;
        let outcome = FlushOutcome { ticket, result };
        self.settle(&outcome);
        outcome
    }

    /// Post every candidate with pending marks, each as its own increment,
    /// concurrently.
    pub async fn flush_all(&mut self) -> FlushReport {
        let tickets = self.claim_all();
        for ticket in &tickets {
            self.begin_flush(ticket);
        }
        let outcomes = flush::execute_all(
            self.store.as_ref(),
            tickets,
            self.config.flush_conflict_retries,
        )
        .await;
        self.settle_all(outcomes)
    }

    pub fn settle_all(&mut self, outcomes: Vec<FlushOutcome>) -> FlushReport {
        let mut report = FlushReport::default();
        for outcome in outcomes {
            self.settle(&outcome);
            match outcome.result {
                Ok(receipt) => report.committed.push(receipt),
                Err(err) => report.failed.push((outcome.ticket.candidate, err)),
            }
        }
        report
    }

    /// Drop all pending marks. Persisted scores are untouched.
    pub fn reset_all(&mut self) {
        self.batches.reset_all();
        self.flush_failures.clear();
        self.revision += 1;
    }

    pub fn set_feed_status(&mut self, listener: &str, status: FeedStatus) {
        self.feeds.insert(listener.to_string(), status);
        self.revision += 1;
    }
}

fn flush_key(candidate: CandidateId) -> String {
    format!("flush_{}", candidate)
}
