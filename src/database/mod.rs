pub mod ingestion;
pub mod schema;
pub mod store;

pub use store::TallyStore;

use crate::feed::{BroadcastFeed, ChangeEvent, ChangeKind};
use crate::model::{
    BallotGroupId, BallotLine, BallotLineId, Candidate, CandidateId, CandidateList, Classification,
    ListId, Table, Vote, VoterCategory,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

// SQLite primary result codes, low byte of the extended code.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
const SQLITE_READONLY: i64 = 8;
const SQLITE_AUTH: i64 = 23;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Data integrity error: {0}")]
    Integrity(String),
    #[error("No such candidate: {0}")]
    NotFound(CandidateId),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl DatabaseError {
    /// Authorization failures are surfaced immediately and never retried.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            DatabaseError::PermissionDenied(_) => true,
            DatabaseError::Sqlx(sqlx::Error::Database(db)) => {
                matches!(primary_code(db.code().as_deref()), Some(SQLITE_READONLY | SQLITE_AUTH))
            }
            _ => false,
        }
    }

    /// Failures that may succeed when the operation is triggered again.
    pub fn is_transient(&self) -> bool {
        match self {
            DatabaseError::Unavailable(_) => true,
            DatabaseError::Sqlx(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    matches!(primary_code(db.code().as_deref()), Some(SQLITE_BUSY | SQLITE_LOCKED))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

fn primary_code(code: Option<&str>) -> Option<i64> {
    code.and_then(|c| c.parse::<i64>().ok()).map(|c| c & 0xff)
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// SQLite-backed candidate, list and ballot store.
#[derive(Clone)]
pub struct TallyDatabase {
    pool: SqlitePool,
    notifier: Option<BroadcastFeed>,
}

impl TallyDatabase {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        schema::create_schema(&pool).await?;

        Ok(Self {
            pool,
            notifier: None,
        })
    }

    /// A private in-memory database. Single connection, so every query sees
    /// the same data.
    pub async fn create_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        schema::create_schema(&pool).await?;

        Ok(Self {
            pool,
            notifier: None,
        })
    }

    /// Publish an event to `feed` after every committed write made through
    /// this handle.
    pub fn with_notifier(mut self, feed: BroadcastFeed) -> Self {
        self.notifier = Some(feed);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn notify(&self, event: ChangeEvent) {
        if let Some(feed) = &self.notifier {
            feed.publish(event);
        }
    }

    /// Insert a candidate list
    pub async fn insert_list(&self, name: &str, list_order: i64) -> Result<ListId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO lists (name, list_order)
            VALUES (?, ?)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(list_order)
        .fetch_one(&self.pool)
        .await?;

        self.notify(ChangeEvent::new(Table::Lists, ChangeKind::Insert, Some(id)));
        Ok(ListId(id))
    }

    /// Insert a candidate with a zero score
    pub async fn insert_candidate(
        &self,
        list_id: ListId,
        name: &str,
        candidate_order: i64,
    ) -> Result<CandidateId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO candidates (list_id, name, candidate_order)
            VALUES (?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(list_id.0)
        .bind(name)
        .bind(candidate_order)
        .fetch_one(&self.pool)
        .await?;

        self.notify(ChangeEvent::new(Table::Candidates, ChangeKind::Insert, Some(id)));
        Ok(CandidateId(id))
    }

    /// Record every line of one physical ballot in a single transaction.
    ///
    /// The group's classification is derived from its votes and stored on
    /// each line.
    pub async fn insert_ballot_group(
        &self,
        group: BallotGroupId,
        source: VoterCategory,
        votes: &[(CandidateId, Vote)],
        recorded_at: DateTime<Utc>,
    ) -> Result<Classification> {
        if votes.is_empty() {
            return Err(DatabaseError::Integrity(format!(
                "Ballot group {} has no lines",
                group
            )));
        }

        let classification = Classification::from_votes(votes.iter().map(|(_, vote)| *vote));
        let mut tx = self.pool.begin().await?;
        let mut line_ids = Vec::with_capacity(votes.len());

        for (candidate, vote) in votes {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO ballot_lines
                    (ballot_group_id, candidate_id, vote, classification, source, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(group.0)
            .bind(candidate.0)
            .bind(vote.value())
            .bind(classification.as_str())
            .bind(source.as_str())
            .bind(recorded_at)
            .fetch_one(&mut *tx)
            .await?;
            line_ids.push(id);
        }

        tx.commit().await?;

        for id in line_ids {
            self.notify(ChangeEvent::new(Table::BallotLines, ChangeKind::Insert, Some(id)));
        }
        Ok(classification)
    }

    /// Highest change-log id, or 0 when nothing has been recorded.
    pub async fn latest_change_id(&self) -> Result<i64> {
        let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM change_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(id.unwrap_or(0))
    }

    /// Change-log entries newer than `cursor`, oldest first.
    pub async fn changes_since(&self, cursor: i64) -> Result<Vec<(i64, ChangeEvent)>> {
        let rows = sqlx::query_as::<_, ChangeLogRow>(
            r#"
            SELECT id, table_name, op, row_id
            FROM change_log
            WHERE id > ?
            ORDER BY id
            "#,
        )
        .bind(cursor)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let table = Table::from_name(&row.table_name).ok_or_else(|| {
                    DatabaseError::Integrity(format!("Unknown table in change log: {}", row.table_name))
                })?;
                let kind = ChangeKind::parse(&row.op).ok_or_else(|| {
                    DatabaseError::Integrity(format!("Unknown change op: {}", row.op))
                })?;
                Ok((row.id, ChangeEvent::new(table, kind, row.row_id)))
            })
            .collect()
    }
}

#[async_trait]
impl TallyStore for TallyDatabase {
    async fn fetch_lists(&self) -> Result<Vec<CandidateList>> {
        let rows = sqlx::query_as::<_, ListRow>(
            r#"
            SELECT id, name, list_order
            FROM lists
            ORDER BY list_order, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| CandidateList {
                id: ListId(row.id),
                name: row.name,
                list_order: row.list_order,
            })
            .collect())
    }

    async fn fetch_candidates(&self) -> Result<Vec<Candidate>> {
        let rows = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT
                c.id,
                c.list_id,
                c.name,
                c.score,
                l.list_order,
                c.candidate_order
            FROM candidates c
            JOIN lists l ON c.list_id = l.id
            ORDER BY l.list_order, c.candidate_order, c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Candidate::try_from).collect()
    }

    async fn fetch_ballot_lines(&self) -> Result<Vec<BallotLine>> {
        let rows = sqlx::query_as::<_, BallotLineRow>(
            r#"
            SELECT id, ballot_group_id, candidate_id, vote, classification, source, recorded_at
            FROM ballot_lines
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BallotLine::try_from).collect()
    }

    async fn fetch_score(&self, candidate: CandidateId) -> Result<u64> {
        let score: Option<i64> = sqlx::query_scalar("SELECT score FROM candidates WHERE id = ?")
            .bind(candidate.0)
            .fetch_optional(&self.pool)
            .await?;

        let score = score.ok_or(DatabaseError::NotFound(candidate))?;
        to_score(candidate, score)
    }

    async fn compare_and_set_score(
        &self,
        candidate: CandidateId,
        expected: u64,
        new: u64,
    ) -> Result<bool> {
        if new < expected {
            return Err(DatabaseError::Integrity(format!(
                "Score of candidate {} may not decrease ({} -> {})",
                candidate, expected, new
            )));
        }
        let expected_db = from_score(expected)?;
        let new_db = from_score(new)?;

        let result = sqlx::query(
            r#"
            UPDATE candidates
            SET score = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND score = ?
            "#,
        )
        .bind(new_db)
        .bind(candidate.0)
        .bind(expected_db)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            self.notify(
                ChangeEvent::new(Table::Candidates, ChangeKind::Update, Some(candidate.0))
                    .with_old(json!({ "score": expected }))
                    .with_new(json!({ "score": new })),
            );
            return Ok(true);
        }

        // Distinguish a lost race from a missing row.
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM candidates WHERE id = ?")
            .bind(candidate.0)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(DatabaseError::NotFound(candidate)),
        }
    }
}

fn to_score(candidate: CandidateId, score: i64) -> Result<u64> {
    u64::try_from(score).map_err(|_| {
        DatabaseError::Integrity(format!("Candidate {} has negative score {}", candidate, score))
    })
}

fn from_score(score: u64) -> Result<i64> {
    i64::try_from(score)
        .map_err(|_| DatabaseError::Integrity(format!("Score {} out of range", score)))
}

#[derive(Debug, sqlx::FromRow)]
struct ListRow {
    id: i64,
    name: String,
    list_order: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CandidateRow {
    id: i64,
    list_id: i64,
    name: String,
    score: i64,
    list_order: i64,
    candidate_order: i64,
}

impl TryFrom<CandidateRow> for Candidate {
    type Error = DatabaseError;

    fn try_from(row: CandidateRow) -> Result<Self> {
        let id = CandidateId(row.id);
        Ok(Candidate {
            id,
            list_id: ListId(row.list_id),
            name: row.name,
            score: to_score(id, row.score)?,
            list_order: row.list_order,
            candidate_order: row.candidate_order,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BallotLineRow {
    id: i64,
    ballot_group_id: i64,
    candidate_id: i64,
    vote: i64,
    classification: String,
    source: String,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<BallotLineRow> for BallotLine {
    type Error = DatabaseError;

    fn try_from(row: BallotLineRow) -> Result<Self> {
        let vote = Vote::try_from(row.vote)
            .map_err(|e| DatabaseError::Integrity(format!("Ballot line {}: {}", row.id, e)))?;
        let classification = Classification::parse(&row.classification).ok_or_else(|| {
            DatabaseError::Integrity(format!(
                "Ballot line {}: unknown classification {}",
                row.id, row.classification
            ))
        })?;
        let source = VoterCategory::parse(&row.source).ok_or_else(|| {
            DatabaseError::Integrity(format!("Ballot line {}: unknown source {}", row.id, row.source))
        })?;

        Ok(BallotLine {
            id: BallotLineId(row.id),
            ballot_group_id: BallotGroupId(row.ballot_group_id),
            candidate_id: CandidateId(row.candidate_id),
            vote,
            classification,
            source,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChangeLogRow {
    id: i64,
    table_name: String,
    op: String,
    row_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seed_roster;

    #[tokio::test]
    async fn candidates_come_back_in_display_order() {
        let db = TallyDatabase::create_in_memory().await.unwrap();
        let second = db.insert_list("Second", 2).await.unwrap();
        let first = db.insert_list("First", 1).await.unwrap();
        db.insert_candidate(second, "Zed", 1).await.unwrap();
        db.insert_candidate(first, "Bea", 2).await.unwrap();
        db.insert_candidate(first, "Al", 1).await.unwrap();

        let names: Vec<_> = db
            .fetch_candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Al", "Bea", "Zed"]);

        let lists = db.fetch_lists().await.unwrap();
        assert_eq!(lists[0].name, "First");
    }

    #[tokio::test]
    async fn conditional_update_applies_once() {
        let db = TallyDatabase::create_in_memory().await.unwrap();
        let roster = seed_roster(&db).await;
        let alice = roster.candidates[0];

        assert!(db.compare_and_set_score(alice, 0, 20).await.unwrap());
        // Same expectation again: the row moved on, so nothing happens.
        assert!(!db.compare_and_set_score(alice, 0, 20).await.unwrap());
        assert_eq!(db.fetch_score(alice).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn conditional_update_never_decreases() {
        let db = TallyDatabase::create_in_memory().await.unwrap();
        let roster = seed_roster(&db).await;
        let err = db
            .compare_and_set_score(roster.candidates[0], 10, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Integrity(_)));
    }

    #[tokio::test]
    async fn missing_candidate_is_not_found() {
        let db = TallyDatabase::create_in_memory().await.unwrap();
        assert!(matches!(
            db.fetch_score(CandidateId(99)).await,
            Err(DatabaseError::NotFound(CandidateId(99)))
        ));
        assert!(matches!(
            db.compare_and_set_score(CandidateId(99), 0, 1).await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ballot_group_is_stored_with_derived_classification() {
        let db = TallyDatabase::create_in_memory().await.unwrap();
        let roster = seed_roster(&db).await;
        let [a, b, c] = [roster.candidates[0], roster.candidates[1], roster.candidates[2]];

        let class = db
            .insert_ballot_group(
                BallotGroupId(7),
                VoterCategory::A,
                &[(a, Vote::For), (b, Vote::Blank), (c, Vote::Blank)],
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(class, Classification::Valid);

        let lines = db.fetch_ballot_lines().await.unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines
            .iter()
            .all(|l| l.classification == Classification::Valid && l.source == VoterCategory::A));
    }

    #[tokio::test]
    async fn ballot_lines_are_append_only() {
        let db = TallyDatabase::create_in_memory().await.unwrap();
        let roster = seed_roster(&db).await;
        db.insert_ballot_group(
            BallotGroupId(1),
            VoterCategory::B,
            &[(roster.candidates[0], Vote::Blank)],
            Utc::now(),
        )
        .await
        .unwrap();

        let result = sqlx::query("UPDATE ballot_lines SET vote = 1")
            .execute(db.pool())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn writes_are_recorded_in_change_log() {
        let db = TallyDatabase::create_in_memory().await.unwrap();
        let cursor = db.latest_change_id().await.unwrap();
        let roster = seed_roster(&db).await;
        db.compare_and_set_score(roster.candidates[0], 0, 3)
            .await
            .unwrap();

        let changes = db.changes_since(cursor).await.unwrap();
        let last = &changes.last().unwrap().1;
        assert_eq!(last.table, Table::Candidates);
        assert_eq!(last.kind, ChangeKind::Update);
        assert_eq!(last.row_id, Some(roster.candidates[0].0));
        assert!(changes.iter().any(|(_, e)| e.table == Table::Lists));
    }

    #[tokio::test]
    async fn notifier_receives_committed_writes() {
        let feed = BroadcastFeed::new();
        let db = TallyDatabase::create_in_memory()
            .await
            .unwrap()
            .with_notifier(feed.clone());
        let roster = seed_roster(&db).await;

        let mut sub = crate::feed::ChangeFeed::subscribe(&feed, &[Table::Candidates])
            .await
            .unwrap();
        db.compare_and_set_score(roster.candidates[1], 0, 20)
            .await
            .unwrap();

        let event = sub.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.new, Some(json!({ "score": 20 })));
    }
}
