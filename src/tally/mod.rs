pub mod aggregator;
pub mod batch;
pub mod engine;
pub mod flush;
pub mod handle;
pub mod listener;
pub mod metrics;

pub use aggregator::{ClassificationMode, ClassifiedCounts};
pub use batch::{BatchError, BatchPhase, FlushTicket, MarkOutcome};
pub use engine::{CandidateTally, EngineWarning, FlushReport, TallyEngine, TallySnapshot};
pub use handle::{spawn_engine, EngineHandle};
pub use listener::{FeedStatus, ReconciliationListener};

use crate::config::ConfigError;
use crate::database::DatabaseError;
use crate::model::CandidateId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown candidate: {0}")]
    UnknownCandidate(CandidateId),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("Engine not ready, initial resync failed: {0}")]
    NotReady(#[source] DatabaseError),
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
    #[error("Invalid engine config: {0}")]
    Config(#[from] ConfigError),
    #[error("Engine has stopped")]
    Stopped,
}
