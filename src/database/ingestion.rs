/// Roster and ballot ingestion from JSON files
use crate::database::{DatabaseError, TallyDatabase, TallyStore};
use crate::model::{BallotGroupId, CandidateId, Classification, Vote, VoterCategory};
use chrono::{DateTime, Utc};
use colored::*;
use instant::Instant;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed input file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Ballot {group} names unknown candidate {list}/{name}")]
    UnknownCandidate {
        group: BallotGroupId,
        list: String,
        name: String,
    },
    #[error("Ballot {0} has no lines")]
    EmptyBallot(BallotGroupId),
}

impl From<sqlx::Error> for IngestionError {
    fn from(err: sqlx::Error) -> Self {
        IngestionError::Database(DatabaseError::from(err))
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;

#[derive(Debug, Deserialize)]
pub struct RosterFile {
    pub lists: Vec<RosterList>,
}

#[derive(Debug, Deserialize)]
pub struct RosterList {
    pub name: String,
    #[serde(default)]
    pub order: i64,
    pub candidates: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BallotFile {
    pub ballots: Vec<BallotRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotRecord {
    pub group: BallotGroupId,
    pub category: VoterCategory,
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
    pub votes: Vec<BallotVote>,
}

#[derive(Debug, Deserialize)]
pub struct BallotVote {
    pub list: String,
    pub candidate: String,
    pub vote: Vote,
}

#[derive(Debug)]
pub struct IngestionSummary {
    pub source: String,
    pub lists: usize,
    pub candidates: usize,
    pub ballots: usize,
    pub lines: usize,
    pub by_class: BTreeMap<Classification, usize>,
    pub duration_ms: u64,
}

impl IngestionSummary {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            lists: 0,
            candidates: 0,
            ballots: 0,
            lines: 0,
            by_class: BTreeMap::new(),
            duration_ms: 0,
        }
    }
}

pub struct BallotIngester {
    db: TallyDatabase,
}

impl BallotIngester {
    pub fn new(db: TallyDatabase) -> Self {
        Self { db }
    }

    /// Load lists and candidates from a roster file.
    pub async fn ingest_roster(&self, path: &Path) -> Result<IngestionSummary> {
        let roster: RosterFile = serde_json::from_str(&read(path)?)?;
        println!("🚀 Loading roster from {}", path.display().to_string().bright_cyan());
        self.load_roster(&roster, &path.display().to_string()).await
    }

    pub async fn load_roster(&self, roster: &RosterFile, source: &str) -> Result<IngestionSummary> {
        let started = Instant::now();
        let mut summary = IngestionSummary::new(source);
        let mut tx = self.db.pool().begin().await?;

        for list in &roster.lists {
            let list_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO lists (name, list_order)
                VALUES (?, ?)
                RETURNING id
                "#,
            )
            .bind(&list.name)
            .bind(list.order)
            .fetch_one(&mut *tx)
            .await?;

            for (order, name) in list.candidates.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO candidates (list_id, name, candidate_order)
                    VALUES (?, ?, ?)
                    "#,
                )
                .bind(list_id)
                .bind(name)
                .bind(order as i64)
                .execute(&mut *tx)
                .await?;
            }

            summary.lists += 1;
            summary.candidates += list.candidates.len();
            println!(
                "  📋 {} with {} candidates",
                list.name.bright_yellow(),
                list.candidates.len()
            );
        }

        tx.commit().await?;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(lists = summary.lists, candidates = summary.candidates, "roster loaded");
        Ok(summary)
    }

    /// Append ballot groups from a ballot file. All groups go in one
    /// transaction; a duplicate or unknown candidate rejects the whole file.
    pub async fn ingest_ballots(&self, path: &Path) -> Result<IngestionSummary> {
        let file: BallotFile = serde_json::from_str(&read(path)?)?;
        println!("🚀 Loading ballots from {}", path.display().to_string().bright_cyan());
        self.load_ballots(&file, &path.display().to_string()).await
    }

    pub async fn load_ballots(&self, file: &BallotFile, source: &str) -> Result<IngestionSummary> {
        let started = Instant::now();
        let candidates = self.candidate_index().await?;
        let mut summary = IngestionSummary::new(source);
        let mut tx = self.db.pool().begin().await?;

        for ballot in &file.ballots {
            if ballot.votes.is_empty() {
                return Err(IngestionError::EmptyBallot(ballot.group));
            }

            let classification = Classification::from_votes(ballot.votes.iter().map(|v| v.vote));
            let recorded_at = ballot.recorded_at.unwrap_or_else(Utc::now);

            for line in &ballot.votes {
                let candidate = candidates
                    .get(&(line.list.clone(), line.candidate.clone()))
                    .copied()
                    .ok_or_else(|| IngestionError::UnknownCandidate {
                        group: ballot.group,
                        list: line.list.clone(),
                        name: line.candidate.clone(),
                    })?;

                sqlx::query(
                    r#"
                    INSERT INTO ballot_lines
                        (ballot_group_id, candidate_id, vote, classification, source, recorded_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(ballot.group.0)
                .bind(candidate.0)
                .bind(line.vote.value())
                .bind(classification.as_str())
                .bind(ballot.category.as_str())
                .bind(recorded_at)
                .execute(&mut *tx)
                .await?;
            }

            summary.ballots += 1;
            summary.lines += ballot.votes.len();
            *summary.by_class.entry(classification).or_default() += 1;
        }

        tx.commit().await?;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(ballots = summary.ballots, lines = summary.lines, "ballots loaded");
        Ok(summary)
    }

    /// Candidates keyed by (list name, candidate name).
    async fn candidate_index(&self) -> Result<HashMap<(String, String), CandidateId>> {
        let lists: HashMap<_, _> = self
            .db
            .fetch_lists()
            .await?
            .into_iter()
            .map(|list| (list.id, list.name))
            .collect();

        let mut index = HashMap::new();
        for candidate in self.db.fetch_candidates().await? {
            if let Some(list) = lists.get(&candidate.list_id) {
                index.insert((list.clone(), candidate.name), candidate.id);
            }
        }
        Ok(index)
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| IngestionError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Print ingestion summary
pub fn print_ingestion_summary(summary: &IngestionSummary) {
    println!("\n{}", "🎉 Ingestion Complete!".bright_green().bold());
    println!("{}", "=".repeat(50).bright_green());
    println!(
        "{}: {}",
        "Source".bright_white().bold(),
        summary.source.bright_cyan()
    );
    if summary.lists > 0 {
        println!(
            "{}: {} lists, {} candidates",
            "Roster".bright_white().bold(),
            summary.lists.to_string().bright_yellow(),
            summary.candidates.to_string().bright_yellow()
        );
    }
    if summary.ballots > 0 {
        println!(
            "{}: {} ({} lines)",
            "Ballots".bright_white().bold(),
            summary.ballots.to_string().bright_yellow(),
            summary.lines
        );
        for (class, count) in &summary.by_class {
            println!("  {}: {}", class, count.to_string().bright_green());
        }
    }
    println!(
        "{}: {} ms",
        "Total Duration".bright_white().bold(),
        summary.duration_ms.to_string().bright_yellow()
    );
    println!();
}
