/// The engine's single operation queue
use super::batch::{FlushTicket, MarkOutcome};
use super::engine::{FlushReport, TallyEngine, TallySnapshot};
use super::flush::{self, FlushOutcome};
use super::listener::{ListenerSignal, ReconciliationListener};
use super::EngineError;
use crate::config::EngineConfig;
use crate::database::TallyStore;
use crate::model::CandidateId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

enum Command {
    Mark {
        candidate: CandidateId,
        reply: oneshot::Sender<Result<MarkOutcome, EngineError>>,
    },
    Unmark {
        candidate: CandidateId,
        reply: oneshot::Sender<Result<u32, EngineError>>,
    },
    FlushAll {
        reply: oneshot::Sender<FlushReport>,
    },
    ResetAll {
        reply: oneshot::Sender<()>,
    },
    Refresh {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Shutdown,
}

struct FlushesDone {
    outcomes: Vec<FlushOutcome>,
    reply: Option<oneshot::Sender<FlushReport>>,
}

/// Cloneable handle exposing the presentation surface.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<TallySnapshot>>,
}

impl EngineHandle {
    /// Most recently published snapshot. Never waits on the queue.
    pub fn current_snapshot(&self) -> Arc<TallySnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TallySnapshot>> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `ready`.
    pub async fn wait_for(
        &self,
        ready: impl FnMut(&Arc<TallySnapshot>) -> bool,
    ) -> Result<Arc<TallySnapshot>, EngineError> {
        let mut snapshots = self.subscribe();
        let snapshot = snapshots
            .wait_for(ready)
            .await
            .map_err(|_| EngineError::Stopped)?;
        Ok(Arc::clone(&snapshot))
    }

    pub async fn mark(&self, candidate: CandidateId) -> Result<MarkOutcome, EngineError> {
        self.request(|reply| Command::Mark { candidate, reply })
            .await?
    }

    pub async fn unmark(&self, candidate: CandidateId) -> Result<u32, EngineError> {
        self.request(|reply| Command::Unmark { candidate, reply })
            .await?
    }

    /// Post every pending batch and wait for all of them to settle.
    pub async fn flush_all(&self) -> Result<FlushReport, EngineError> {
        self.request(|reply| Command::FlushAll { reply }).await
    }

    pub async fn reset_all(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::ResetAll { reply }).await
    }

    /// Manual resync.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Refresh { reply }).await?
    }

    /// Stop the engine once in-flight flushes have settled.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        response.await.map_err(|_| EngineError::Stopped)
    }
}

/// Start an engine: one resync, then the operation queue and the listeners.
///
/// The join handle yields the engine back after shutdown.
pub async fn spawn_engine(
    store: Arc<dyn TallyStore>,
    config: EngineConfig,
    listeners: Vec<ReconciliationListener>,
) -> Result<(EngineHandle, JoinHandle<TallyEngine>), EngineError> {
    config.validate()?;
    let queue_depth = config.command_queue_depth;
    let engine = TallyEngine::start(store, config).await?;

    let (commands_tx, commands) = mpsc::channel(queue_depth);
    let (signals_tx, signals) = mpsc::channel(queue_depth);
    let (completions_tx, completions) = mpsc::unbounded_channel();
    let (snapshots_tx, snapshots) = watch::channel(Arc::new(engine.snapshot()));

    let listener_tasks = listeners
        .into_iter()
        .map(|listener| tokio::spawn(listener.run(signals_tx.clone())))
        .collect();
    drop(signals_tx);

    let actor = EngineActor {
        published: engine.snapshot().revision,
        engine,
        commands,
        signals,
        completions_tx,
        completions,
        snapshots: snapshots_tx,
        listener_tasks,
        in_flight: 0,
    };

    let handle = EngineHandle {
        commands: commands_tx,
        snapshots,
    };
    Ok((handle, tokio::spawn(actor.run())))
}

/// One task owns the `TallyEngine`. Presentation calls, listener signals and
/// flush completions all arrive as messages and are applied one at a time;
/// store writes run in spawned tasks so that several candidates can flush
/// at once without blocking marks on other candidates.
struct EngineActor {
    engine: TallyEngine,
    commands: mpsc::Receiver<Command>,
    signals: mpsc::Receiver<ListenerSignal>,
    completions_tx: mpsc::UnboundedSender<FlushesDone>,
    completions: mpsc::UnboundedReceiver<FlushesDone>,
    snapshots: watch::Sender<Arc<TallySnapshot>>,
    listener_tasks: Vec<JoinHandle<()>>,
    in_flight: usize,
    published: u64,
}

impl EngineActor {
    async fn run(mut self) -> TallyEngine {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(done) = self.completions.recv() => self.settle(done),
                Some(signal) = self.signals.recv() => self.handle_signal(signal).await,
            }
            self.publish();
        }

        for task in &self.listener_tasks {
            task.abort();
        }
        while self.in_flight > 0 {
            match self.completions.recv().await {
                Some(done) => self.settle(done),
                None => break,
            }
        }
        self.publish();
        tracing::debug!("tally engine stopped");
        self.engine
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Mark { candidate, reply } => {
                let result = self.engine.mark(candidate);
                if let Ok(MarkOutcome::FlushDue(ticket)) = &result {
                    self.spawn_flushes(vec![*ticket], None);
                }
                let _ = reply.send(result);
            }
            Command::Unmark { candidate, reply } => {
                let _ = reply.send(self.engine.unmark(candidate));
            }
            Command::FlushAll { reply } => {
                let tickets = self.engine.claim_all();
                if tickets.is_empty() {
                    let _ = reply.send(FlushReport::default());
                } else {
                    self.spawn_flushes(tickets, Some(reply));
                }
            }
            Command::ResetAll { reply } => {
                self.engine.reset_all();
                let _ = reply.send(());
            }
            Command::Refresh { reply } => {
                let result = self.engine.resync().await.map_err(EngineError::from);
                let _ = reply.send(result);
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_signal(&mut self, signal: ListenerSignal) {
        let mut resync = false;
        let mut next = Some(signal);

        // Coalesce a burst of notifications into one resync.
        while let Some(signal) = next {
            match signal {
                ListenerSignal::ResyncRequested { .. } => resync = true,
                ListenerSignal::Status { listener, status } => {
                    self.engine.set_feed_status(&listener, status)
                }
            }
            next = self.signals.try_recv().ok();
        }

        if resync {
            // Failures are recorded on the snapshot; the next signal retries.
            let _ = self.engine.resync().await;
        }
    }

    fn spawn_flushes(
        &mut self,
        tickets: Vec<FlushTicket>,
        reply: Option<oneshot::Sender<FlushReport>>,
    ) {
        for ticket in &tickets {
            self.engine.begin_flush(ticket);
        }
        let store = self.engine.store();
        let retries = self.engine.config().flush_conflict_retries;
        let completions = self.completions_tx.clone();
        self.in_flight += 1;

        tokio::spawn(async move {
            let outcomes = flush::execute_all(store.as_ref(), tickets, retries).await;
            let _ = completions.send(FlushesDone { outcomes, reply });
        });
    }

    fn settle(&mut self, done: FlushesDone) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let report = self.engine.settle_all(done.outcomes);
        if let Some(reply) = done.reply {
            let _ = reply.send(report);
        }
    }

    fn publish(&mut self) {
        let snapshot = self.engine.snapshot();
        if snapshot.revision != self.published {
            self.published = snapshot.revision;
            self.snapshots.send_replace(Arc::new(snapshot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::database::TallyDatabase;
    use crate::feed::{BroadcastFeed, ChangeFeed, ChangeLogFeed, FeedError};
    use crate::model::{BallotGroupId, Classification, Vote, VoterCategory};
    use crate::tally::{BatchError, EngineWarning, FeedStatus};
    use crate::test_support::{seed_roster, seeded_database, FaultyStore, Roster};
    use chrono::Utc;
    use std::time::Duration;

    fn config(batch_size: u32) -> EngineConfig {
        EngineConfig {
            batch_size,
            score_feed: RetryPolicy::bounded(10, 3),
            stats_feed: RetryPolicy::unbounded(10),
            ..EngineConfig::default()
        }
    }

    /// A store that notifies an in-process feed, plus listeners on that feed.
    async fn notifying_store() -> (TallyDatabase, BroadcastFeed, Roster) {
        let feed = BroadcastFeed::new();
        let db = TallyDatabase::create_in_memory()
            .await
            .unwrap()
            .with_notifier(feed.clone());
        let roster = seed_roster(&db).await;
        (db, feed, roster)
    }

    fn listeners(feed: &BroadcastFeed, config: &EngineConfig) -> Vec<ReconciliationListener> {
        let feed: Arc<dyn ChangeFeed> = Arc::new(feed.clone());
        vec![
            ReconciliationListener::scores(feed.clone(), config.score_feed.clone()),
            ReconciliationListener::statistics(feed, config.stats_feed.clone()),
        ]
    }

    async fn session(
        db: &TallyDatabase,
        feed: &BroadcastFeed,
        config: EngineConfig,
    ) -> (EngineHandle, JoinHandle<TallyEngine>) {
        let listeners = listeners(feed, &config);
        let (handle, task) = spawn_engine(Arc::new(db.clone()), config, listeners)
            .await
            .unwrap();
        handle
            .wait_for(|s| {
                s.feeds.len() == 2 && s.feeds.values().all(|f| *f == FeedStatus::Connected)
            })
            .await
            .unwrap();
        (handle, task)
    }

    #[tokio::test]
    async fn twentieth_mark_posts_the_batch() {
        let (db, feed, roster) = notifying_store().await;
        let x = roster.candidates[0];
        db.compare_and_set_score(x, 0, 40).await.unwrap();
        let (handle, _task) = session(&db, &feed, config(20)).await;

        for _ in 0..19 {
            assert!(matches!(handle.mark(x).await.unwrap(), MarkOutcome::Pending(_)));
        }
        assert!(matches!(
            handle.mark(x).await.unwrap(),
            MarkOutcome::FlushDue(_)
        ));

        let snapshot = handle
            .wait_for(|s| s.score(x) == Some(60) && s.pending(x) == 0)
            .await
            .unwrap();
        assert!(snapshot.warnings.is_empty());
        assert_eq!(db.fetch_score(x).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn notification_resyncs_without_touching_pending_marks() {
        let (db, feed, roster) = notifying_store().await;
        let x = roster.candidates[0];
        let (handle, _task) = session(&db, &feed, config(20)).await;

        for _ in 0..5 {
            handle.mark(x).await.unwrap();
        }
        // Another workstation posts a batch of its own.
        db.compare_and_set_score(x, 0, 20).await.unwrap();

        let snapshot = handle.wait_for(|s| s.score(x) == Some(20)).await.unwrap();
        assert_eq!(snapshot.pending(x), 5);
    }

    #[tokio::test]
    async fn new_ballots_show_up_deduplicated() {
        let (db, feed, roster) = notifying_store().await;
        let (handle, _task) = session(&db, &feed, config(20)).await;

        db.insert_ballot_group(
            BallotGroupId(7),
            VoterCategory::B,
            &[
                (roster.candidates[0], Vote::For),
                (roster.candidates[1], Vote::Blank),
                (roster.candidates[2], Vote::Blank),
            ],
            Utc::now(),
        )
        .await
        .unwrap();

        let snapshot = handle
            .wait_for(|s| s.ballot_counts.total() == 1)
            .await
            .unwrap();
        assert_eq!(
            snapshot
                .ballot_counts
                .get(Classification::Valid, VoterCategory::B),
            1
        );
    }

    #[tokio::test]
    async fn two_sessions_converge_on_the_store() {
        let (db, feed, roster) = notifying_store().await;
        let [x, y] = [roster.candidates[0], roster.candidates[3]];
        let (first, _t1) = session(&db, &feed, config(20)).await;
        let (second, _t2) = session(&db, &feed, config(20)).await;

        for _ in 0..3 {
            first.mark(x).await.unwrap();
            second.mark(x).await.unwrap();
            second.mark(y).await.unwrap();
        }
        let (a, b) = tokio::join!(first.flush_all(), second.flush_all());
        assert!(a.unwrap().is_clean());
        assert!(b.unwrap().is_clean());

        for handle in [&first, &second] {
            let snapshot = handle
                .wait_for(|s| s.score(x) == Some(6) && s.score(y) == Some(3))
                .await
                .unwrap();
            assert_eq!(snapshot.pending(x), 0);
        }
    }

    #[tokio::test]
    async fn marks_are_rejected_while_the_batch_is_in_flight() {
        let (db, roster) = seeded_database().await;
        let x = roster.candidates[0];
        let store = Arc::new(FaultyStore::new(db.clone()));
        store.hold_writes();
        let (handle, _task) = spawn_engine(store.clone(), config(2), Vec::new())
            .await
            .unwrap();

        handle.mark(x).await.unwrap();
        assert!(matches!(
            handle.mark(x).await.unwrap(),
            MarkOutcome::FlushDue(_)
        ));
        assert!(matches!(
            handle.mark(x).await,
            Err(EngineError::Batch(BatchError::FlushInFlight(_)))
        ));
        // Other candidates keep accumulating meanwhile.
        assert_eq!(
            handle.mark(roster.candidates[1]).await.unwrap(),
            MarkOutcome::Pending(1)
        );

        store.release_writes();
        handle.wait_for(|s| s.score(x) == Some(2)).await.unwrap();
        assert_eq!(handle.mark(x).await.unwrap(), MarkOutcome::Pending(1));
    }

    #[tokio::test]
    async fn reset_all_clears_marks_only() {
        let (db, roster) = seeded_database().await;
        let x = roster.candidates[2];
        db.compare_and_set_score(x, 0, 7).await.unwrap();
        let (handle, _task) = spawn_engine(Arc::new(db.clone()), config(20), Vec::new())
            .await
            .unwrap();

        handle.mark(x).await.unwrap();
        handle.reset_all().await.unwrap();

        let snapshot = handle.current_snapshot();
        assert_eq!(snapshot.pending(x), 0);
        assert_eq!(snapshot.score(x), Some(7));
        assert!(handle.flush_all().await.unwrap().committed.is_empty());
    }

    #[tokio::test]
    async fn manual_refresh_heals_a_missed_notification() {
        let (db, roster) = seeded_database().await;
        let x = roster.candidates[1];
        let (handle, _task) = spawn_engine(Arc::new(db.clone()), config(20), Vec::new())
            .await
            .unwrap();

        db.compare_and_set_score(x, 0, 12).await.unwrap();
        assert_eq!(handle.current_snapshot().score(x), Some(0));

        handle.refresh().await.unwrap();
        assert_eq!(handle.current_snapshot().score(x), Some(12));
    }

    #[tokio::test]
    async fn feed_loss_is_shown_to_the_operator() {
        let (db, feed, _roster) = notifying_store().await;
        let (handle, _task) = session(&db, &feed, config(20)).await;

        feed.refuse_subscriptions(100, FeedError::Transient("gone".to_string()));
        feed.publish_fault(FeedError::Timeout);

        let snapshot = handle
            .wait_for(|s| {
                s.warnings
                    .iter()
                    .any(|w| matches!(w, EngineWarning::FeedDisconnected { .. }))
            })
            .await
            .unwrap();
        assert_eq!(
            snapshot.feeds.get("scores").map(|s| matches!(s, FeedStatus::Disconnected { .. })),
            Some(true)
        );
        // The statistics path keeps retrying.
        assert!(matches!(
            snapshot.feeds.get("statistics"),
            Some(FeedStatus::Reconnecting { .. } | FeedStatus::Degraded { .. } | FeedStatus::Connecting)
        ));
    }

    #[tokio::test]
    async fn shutdown_returns_the_engine() {
        let (db, roster) = seeded_database().await;
        let (handle, task) = spawn_engine(Arc::new(db), config(20), Vec::new())
            .await
            .unwrap();
        handle.mark(roster.candidates[0]).await.unwrap();
        handle.shutdown().await;

        let engine = task.await.unwrap();
        assert_eq!(engine.snapshot().pending(roster.candidates[0]), 1);
        assert!(matches!(
            handle.mark(roster.candidates[0]).await,
            Err(EngineError::Stopped)
        ));
    }

    #[tokio::test]
    async fn write_right_after_start_is_not_missed() {
        let (db, roster) = seeded_database().await;
        let x = roster.candidates[0];
        let feed = Arc::new(ChangeLogFeed::new(db.clone(), Duration::from_millis(5)));
        let listeners = vec![ReconciliationListener::scores(
            feed,
            RetryPolicy::bounded(10, 3),
        )];
        let (handle, _task) = spawn_engine(Arc::new(db.clone()), config(20), listeners)
            .await
            .unwrap();

        // Lands before the listener has subscribed.
        db.compare_and_set_score(x, 0, 20).await.unwrap();

        let snapshot = tokio::time::timeout(
            Duration::from_secs(2),
            handle.wait_for(|s| s.score(x) == Some(20)),
        )
        .await
        .expect("score converges")
        .unwrap();
        assert_eq!(snapshot.pending(x), 0);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_start() {
        let (db, _roster) = seeded_database().await;
        let config = EngineConfig {
            command_queue_depth: 0,
            ..config(20)
        };

        let result = spawn_engine(Arc::new(db), config, Vec::new()).await;
        assert!(matches!(result.err(), Some(EngineError::Config(_))));
    }
}
