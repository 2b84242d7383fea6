pub mod broadcast;
pub mod change_log;

pub use broadcast::BroadcastFeed;
pub use change_log::ChangeLogFeed;

use crate::model::Table;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// The subscriber fell behind and events were dropped.
    Missed,
}

impl ChangeKind {
    pub fn parse(op: &str) -> Option<ChangeKind> {
        match op {
            "insert" | "INSERT" => Some(ChangeKind::Insert),
            "update" | "UPDATE" => Some(ChangeKind::Update),
            "delete" | "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub row_id: Option<i64>,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl ChangeEvent {
    pub fn new(table: Table, kind: ChangeKind, row_id: Option<i64>) -> Self {
        Self {
            table,
            kind,
            row_id,
            old: None,
            new: None,
        }
    }

    pub fn missed(table: Table) -> Self {
        Self::new(table, ChangeKind::Missed, None)
    }

    pub fn with_new(mut self, payload: Value) -> Self {
        self.new = Some(payload);
        self
    }

    pub fn with_old(mut self, payload: Value) -> Self {
        self.old = Some(payload);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("subscription timed out")]
    Timeout,
    #[error("notification channel failed: {0}")]
    Transient(String),
    #[error("not allowed to subscribe: {0}")]
    PermissionDenied(String),
    #[error("notification channel closed")]
    Closed,
}

impl FeedError {
    /// Retrying a permission failure cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, FeedError::PermissionDenied(_))
    }
}

pub type FeedItem = Result<ChangeEvent, FeedError>;

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    tables: Vec<Table>,
    receiver: mpsc::Receiver<FeedItem>,
}

impl Subscription {
    /// Create a subscription and the sender a feed forwards events into.
    pub fn channel(tables: Vec<Table>) -> (mpsc::Sender<FeedItem>, Subscription) {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (sender, Subscription { tables, receiver })
    }

    /// Next event or fault; `None` once the feed has closed the subscription.
    pub async fn next(&mut self) -> Option<FeedItem> {
        self.receiver.recv().await
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn unsubscribe(mut self) {
        self.receiver.close();
    }
}

/// Source of change notifications for the watched tables.
///
/// Subscribers only use an event as a "something changed" trigger; the
/// payloads are carried for diagnostics and never applied to state.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to insert/update/delete events on `tables` (all tables when
    /// empty).
    async fn subscribe(&self, tables: &[Table]) -> Result<Subscription, FeedError>;
}

pub(crate) fn watched_tables(tables: &[Table]) -> Vec<Table> {
    if tables.is_empty() {
        Table::ALL.to_vec()
    } else {
        tables.to_vec()
    }
}
