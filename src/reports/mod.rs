use crate::database::DatabaseError;
use crate::model::{CandidateId, Classification, ListId, VoterCategory};
use crate::tally::aggregator::CategoryCounts;
use crate::tally::{EngineError, FeedStatus, TallySnapshot};
use chrono::{DateTime, Utc};
use colored::*;
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ReportResult<T> = std::result::Result<T, ReportError>;

/// Standings and ballot statistics for the presentation layer
#[derive(Debug, Serialize)]
pub struct TallyReport {
    #[serde(rename = "generatedAt")]
    pub generated_at: DateTime<Utc>,
    #[serde(rename = "syncedAt")]
    pub synced_at: Option<DateTime<Utc>>,
    pub stale: bool,
    #[serde(rename = "totalScore")]
    pub total_score: u64,
    pub lists: Vec<ListStanding>,
    pub ballots: BallotSummary,
    pub feeds: BTreeMap<String, FeedStatus>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ListStanding {
    pub id: ListId,
    pub name: String,
    pub score: u64,
    pub share: f64,
    pub candidates: Vec<CandidateStanding>,
}

#[derive(Debug, Serialize)]
pub struct CandidateStanding {
    pub id: CandidateId,
    pub name: String,
    pub score: u64,
    /// Marks recorded locally and not yet posted.
    pub pending: u32,
    pub share: f64,
}

#[derive(Debug, Serialize)]
pub struct BallotSummary {
    pub valid: CategoryCounts,
    pub blank: CategoryCounts,
    pub invalid: CategoryCounts,
    pub total: usize,
    #[serde(rename = "byCategory")]
    pub by_category: CategoryCounts,
}

fn share(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

impl TallyReport {
    pub fn from_snapshot(snapshot: &TallySnapshot) -> Self {
        let total_score: u64 = snapshot.candidates.iter().map(|c| c.candidate.score).sum();
        let list_names: BTreeMap<ListId, &str> = snapshot
            .lists
            .iter()
            .map(|list| (list.id, list.name.as_str()))
            .collect();

        let grouped = snapshot
            .candidates
            .iter()
            .sorted_by_key(|c| c.candidate.display_key())
            .group_by(|c| c.candidate.list_id);

        let mut lists = Vec::new();
        for (list_id, members) in &grouped {
            let candidates: Vec<CandidateStanding> = members
                .map(|c| CandidateStanding {
                    id: c.candidate.id,
                    name: c.candidate.name.clone(),
                    score: c.candidate.score,
                    pending: c.pending,
                    share: share(c.candidate.score, total_score),
                })
                .collect();
            let score = candidates.iter().map(|c| c.score).sum();

            lists.push(ListStanding {
                id: list_id,
                name: list_names
                    .get(&list_id)
                    .map_or_else(|| format!("List {}", list_id), |name| name.to_string()),
                score,
                share: share(score, total_score),
                candidates,
            });
        }

        let counts = &snapshot.ballot_counts;
        let ballots = BallotSummary {
            valid: *counts.bucket(Classification::Valid),
            blank: *counts.bucket(Classification::Blank),
            invalid: *counts.bucket(Classification::Invalid),
            total: counts.total(),
            by_category: CategoryCounts {
                a: counts.by_category(VoterCategory::A),
                b: counts.by_category(VoterCategory::B),
            },
        };

        Self {
            generated_at: Utc::now(),
            synced_at: snapshot.synced_at,
            stale: snapshot.stale,
            total_score,
            lists,
            ballots,
            feeds: snapshot.feeds.clone(),
            warnings: snapshot.warnings.iter().map(|w| w.to_string()).collect(),
        }
    }

    pub fn to_json(&self) -> ReportResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Render as colored text for the terminal.
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "{}", "🗳️  Live Tally".bright_cyan().bold());
        let _ = writeln!(out, "{}", "=".repeat(50).bright_cyan());
        match self.synced_at {
            Some(at) => {
                let _ = writeln!(out, "Synced at {}", at.format("%H:%M:%S").to_string().bright_white());
            }
            None => {
                let _ = writeln!(out, "{}", "Never synced".bright_red());
            }
        }

        for list in &self.lists {
            let _ = writeln!(
                out,
                "\n{} {} ({:.1}%)",
                list.name.bright_yellow().bold(),
                list.score.to_string().bright_white(),
                list.share
            );
            for candidate in &list.candidates {
                let pending = if candidate.pending > 0 {
                    format!(" +{} pending", candidate.pending).yellow().to_string()
                } else {
                    String::new()
                };
                let _ = writeln!(
                    out,
                    "  {:<24} {:>6} {:>6.1}%{}",
                    candidate.name,
                    candidate.score.to_string().bright_green(),
                    candidate.share,
                    pending
                );
            }
        }

        let _ = writeln!(out, "\n{}", "Ballots".bright_white().bold());
        for (label, bucket) in [
            ("valid", &self.ballots.valid),
            ("blank", &self.ballots.blank),
            ("invalid", &self.ballots.invalid),
        ] {
            let _ = writeln!(
                out,
                "  {:<8} {:>6}  (a: {}, b: {})",
                label,
                bucket.total().to_string().bright_green(),
                bucket.a,
                bucket.b
            );
        }
        let _ = writeln!(
            out,
            "  {:<8} {:>6}",
            "total",
            self.ballots.total.to_string().bright_yellow()
        );

        if !self.feeds.is_empty() {
            let _ = writeln!(out, "\n{}", "Live updates".bright_white().bold());
            for (listener, status) in &self.feeds {
                let state = match status {
                    FeedStatus::Connected => "connected".green(),
                    FeedStatus::Connecting => "connecting".normal(),
                    FeedStatus::Reconnecting { failures } => {
                        format!("reconnecting ({})", failures).yellow()
                    }
                    FeedStatus::Degraded { failures } => format!("degraded ({})", failures).yellow(),
                    FeedStatus::Disconnected { reason } => format!("stopped: {}", reason).red(),
                };
                let _ = writeln!(out, "  {:<12} {}", listener, state);
            }
        }

        for warning in &self.warnings {
            let _ = writeln!(out, "{} {}", "⚠️ ".bright_yellow(), warning);
        }
        out
    }

    pub fn print(&self) {
        println!("{}", self.render_text());
    }
}
