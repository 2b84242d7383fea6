/// In-process change feed shared by sessions that use the same store handle
use super::{watched_tables, ChangeEvent, ChangeFeed, FeedError, FeedItem, Subscription};
use crate::model::Table;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
struct Refusal {
    remaining: u32,
    error: FeedError,
}

#[derive(Clone)]
pub struct BroadcastFeed {
    sender: broadcast::Sender<FeedItem>,
    refusal: Arc<Mutex<Option<Refusal>>>,
}

impl Default for BroadcastFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            refusal: Arc::new(Mutex::new(None)),
        }
    }

    /// Deliver an event to every live subscription. Returns how many
    /// subscriptions were listening.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.sender.send(Ok(event)).unwrap_or(0)
    }

    /// Fail every live subscription with `error`.
    pub fn publish_fault(&self, error: FeedError) -> usize {
        self.sender.send(Err(error)).unwrap_or(0)
    }

    /// Refuse the next `count` subscribe calls with `error`.
    pub fn refuse_subscriptions(&self, count: u32, error: FeedError) {
        let mut refusal = self.refusal.lock().unwrap_or_else(|p| p.into_inner());
        *refusal = (count > 0).then(|| Refusal {
            remaining: count,
            error,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn take_refusal(&self) -> Option<FeedError> {
        let mut guard = self.refusal.lock().unwrap_or_else(|p| p.into_inner());
        let refusal = guard.as_mut()?;
        let error = refusal.error.clone();
        refusal.remaining -= 1;
        if refusal.remaining == 0 {
            *guard = None;
        }
        Some(error)
    }
}

#[async_trait]
impl ChangeFeed for BroadcastFeed {
    async fn subscribe(&self, tables: &[Table]) -> Result<Subscription, FeedError> {
        if let Some(error) = self.take_refusal() {
            return Err(error);
        }

        let tables = watched_tables(tables);
        let mut events = self.sender.subscribe();
        let (sender, subscription) = Subscription::channel(tables.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender.closed() => break,
                    received = events.recv() => match received {
                        Ok(Ok(event)) => {
                            if tables.contains(&event.table) && sender.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Ok(Err(fault)) => {
                            let _ = sender.send(Err(fault)).await;
                            break;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "broadcast subscriber lagged");
                            if sender.send(Ok(ChangeEvent::missed(tables[0]))).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChangeKind;

    #[tokio::test]
    async fn delivers_only_watched_tables() {
        let feed = BroadcastFeed::new();
        let mut sub = feed.subscribe(&[Table::Candidates]).await.unwrap();

        feed.publish(ChangeEvent::new(Table::BallotLines, ChangeKind::Insert, Some(1)));
        feed.publish(ChangeEvent::new(Table::Candidates, ChangeKind::Update, Some(2)));

        let event = sub.next().await.unwrap().unwrap();
        assert_eq!(event.table, Table::Candidates);
        assert_eq!(event.row_id, Some(2));
    }

    #[tokio::test]
    async fn fault_is_delivered_then_subscription_ends() {
        let feed = BroadcastFeed::new();
        let mut sub = feed.subscribe(&[]).await.unwrap();

        feed.publish_fault(FeedError::Timeout);

        assert_eq!(sub.next().await, Some(Err(FeedError::Timeout)));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn refusals_are_consumed_in_order() {
        let feed = BroadcastFeed::new();
        feed.refuse_subscriptions(2, FeedError::Transient("down".to_string()));

        assert!(feed.subscribe(&[]).await.is_err());
        assert!(feed.subscribe(&[]).await.is_err());
        assert!(feed.subscribe(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_a_missed_marker() {
        let feed = BroadcastFeed::with_capacity(1);
        let mut sub = feed.subscribe(&[Table::Lists]).await.unwrap();

        for id in 0..8 {
            feed.publish(ChangeEvent::new(Table::Lists, ChangeKind::Insert, Some(id)));
        }

        let mut saw_missed = false;
        while let Ok(Some(item)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await
        {
            if item.unwrap().kind == ChangeKind::Missed {
                saw_missed = true;
            }
        }
        assert!(saw_missed);
    }
}
