/// Resync-on-notification
use crate::config::RetryPolicy;
use crate::feed::{ChangeFeed, FeedError};
use crate::model::Table;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedStatus {
    Connecting,
    Connected,
    Reconnecting { failures: u32 },
    /// Still retrying, but long enough that the operator should know.
    Degraded { failures: u32 },
    /// Gave up; figures only refresh manually from here on.
    Disconnected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerSignal {
    ResyncRequested { listener: String },
    Status { listener: String, status: FeedStatus },
}

/// Every notification, whatever table or row it names, becomes one opaque
/// "resync requested" signal. Payloads are never applied and ordering is
/// irrelevant: a resync always reads the current state, so any later
/// notification (or a manual refresh) heals a missed one.
pub struct ReconciliationListener {
    name: String,
    feed: Arc<dyn ChangeFeed>,
    tables: Vec<Table>,
    policy: RetryPolicy,
}

impl ReconciliationListener {
    pub fn new(
        name: impl Into<String>,
        feed: Arc<dyn ChangeFeed>,
        tables: &[Table],
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            feed,
            tables: tables.to_vec(),
            policy,
        }
    }

    /// Score-tally path: candidate changes, bounded retries.
    pub fn scores(feed: Arc<dyn ChangeFeed>, policy: RetryPolicy) -> Self {
        Self::new("scores", feed, &[Table::Candidates, Table::Lists], policy)
    }

    /// Statistics path: ballot changes, retried with backoff indefinitely.
    pub fn statistics(feed: Arc<dyn ChangeFeed>, policy: RetryPolicy) -> Self {
        Self::new("statistics", feed, &[Table::BallotLines], policy)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until the engine goes away, the subscription is refused for good,
    /// or the retry budget is spent.
    pub async fn run(self, signals: mpsc::Sender<ListenerSignal>) {
        let mut failures: u32 = 0;

        loop {
            if !self.status(&signals, FeedStatus::Connecting).await {
                return;
            }

            let error = match self.feed.subscribe(&self.tables).await {
                Ok(mut subscription) => {
                    if !self.status(&signals, FeedStatus::Connected).await {
                        return;
                    }
                    // Writes committed before the subscription started are
                    // never delivered, including on the first subscribe.
                    if !self.request_resync(&signals).await {
                        return;
                    }
                    failures = 0;

                    loop {
                        match subscription.next().await {
                            Some(Ok(event)) => {
                                tracing::debug!(
                                    listener = %self.name,
                                    table = %event.table,
                                    kind = ?event.kind,
                                    "change notification"
                                );
                                if !self.request_resync(&signals).await {
                                    return;
                                }
                            }
                            Some(Err(error)) => break error,
                            None => break FeedError::Closed,
                        }
                    }
                }
                Err(error) => error,
            };

            if error.is_permanent() {
                tracing::error!(listener = %self.name, error = %error, "subscription refused");
                self.status(
                    &signals,
                    FeedStatus::Disconnected {
                        reason: error.to_string(),
                    },
                )
                .await;
                return;
            }

            failures += 1;
            if let Some(max) = self.policy.max_attempts {
                if failures > max {
                    tracing::error!(
                        listener = %self.name,
                        failures,
                        "giving up on change notifications"
                    );
                    self.status(
                        &signals,
                        FeedStatus::Disconnected {
                            reason: format!("{} after {} reconnect attempts", error, max),
                        },
                    )
                    .await;
                    return;
                }
            }

            let status = if failures >= self.policy.warn_after {
                tracing::warn!(listener = %self.name, failures, error = %error, "change feed degraded");
                FeedStatus::Degraded { failures }
            } else {
                tracing::info!(listener = %self.name, failures, error = %error, "change feed interrupted");
                FeedStatus::Reconnecting { failures }
            };
            if !self.status(&signals, status).await {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.policy.backoff()) => {}
                _ = signals.closed() => return,
            }
        }
    }

    async fn request_resync(&self, signals: &mpsc::Sender<ListenerSignal>) -> bool {
        signals
            .send(ListenerSignal::ResyncRequested {
                listener: self.name.clone(),
            })
            .await
            .is_ok()
    }

    async fn status(&self, signals: &mpsc::Sender<ListenerSignal>, status: FeedStatus) -> bool {
        signals
            .send(ListenerSignal::Status {
                listener: self.name.clone(),
                status,
            })
            .await
            .is_ok()
    }
}
