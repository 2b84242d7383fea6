/// Cross-process change feed
use super::{watched_tables, ChangeFeed, FeedError, Subscription};
use crate::database::{DatabaseError, TallyDatabase};
use crate::model::Table;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Triggers append every write on the watched tables to `change_log`; a
/// subscription remembers the newest id it has seen and polls for rows past
/// it. Any process with the database file open sees the others' writes.
pub struct ChangeLogFeed {
    db: TallyDatabase,
    poll_interval: Duration,
}

impl ChangeLogFeed {
    pub fn new(db: TallyDatabase, poll_interval: Duration) -> Self {
        Self {
            db,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }
}

impl From<DatabaseError> for FeedError {
    fn from(err: DatabaseError) -> Self {
        if err.is_permission_denied() {
            FeedError::PermissionDenied(err.to_string())
        } else {
            FeedError::Transient(err.to_string())
        }
    }
}

#[async_trait]
impl ChangeFeed for ChangeLogFeed {
    async fn subscribe(&self, tables: &[Table]) -> Result<Subscription, FeedError> {
        let tables = watched_tables(tables);
        let mut cursor = self.db.latest_change_id().await?;
        let (sender, subscription) = Subscription::channel(tables.clone());
        let db = self.db.clone();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender.closed() => break,
                    _ = ticker.tick() => {}
                }

                let changes = match db.changes_since(cursor).await {
                    Ok(changes) => changes,
                    Err(err) => {
                        tracing::debug!(error = %err, "change log poll failed");
                        let _ = sender.send(Err(err.into())).await;
                        break;
                    }
                };

                for (id, event) in changes {
                    cursor = id;
                    if tables.contains(&event.table) && sender.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::TallyStore;
    use crate::feed::ChangeKind;
    use crate::model::{BallotGroupId, Vote, VoterCategory};
    use crate::test_support::seeded_database;
    use chrono::Utc;

    fn feed(db: &TallyDatabase) -> ChangeLogFeed {
        ChangeLogFeed::new(db.clone(), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn only_changes_after_subscribing_are_delivered() {
        let (db, roster) = seeded_database().await;
        let mut subscription = feed(&db).subscribe(&[Table::Candidates]).await.unwrap();

        db.compare_and_set_score(roster.candidates[1], 0, 20)
            .await
            .unwrap();

        let event = subscription.next().await.unwrap().unwrap();
        assert_eq!(event.table, Table::Candidates);
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.row_id, Some(roster.candidates[1].0));
    }

    #[tokio::test]
    async fn unwatched_tables_are_filtered_out() {
        let (db, roster) = seeded_database().await;
        let mut subscription = feed(&db).subscribe(&[Table::BallotLines]).await.unwrap();

        db.compare_and_set_score(roster.candidates[0], 0, 1)
            .await
            .unwrap();
        db.insert_ballot_group(
            BallotGroupId(3),
            VoterCategory::A,
            &[(roster.candidates[0], Vote::Against)],
            Utc::now(),
        )
        .await
        .unwrap();

        let event = subscription.next().await.unwrap().unwrap();
        assert_eq!(event.table, Table::BallotLines);
        assert_eq!(event.kind, ChangeKind::Insert);
    }

    #[tokio::test]
    async fn closed_pool_surfaces_as_a_fault() {
        let (db, _) = seeded_database().await;
        let mut subscription = feed(&db).subscribe(&[]).await.unwrap();

        db.pool().close().await;

        let fault = subscription.next().await.unwrap().unwrap_err();
        assert!(matches!(fault, FeedError::Transient(_)));
        assert!(subscription.next().await.is_none());
    }
}
