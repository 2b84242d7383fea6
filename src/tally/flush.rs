/// Score increments: a read of the persisted score, then a conditional update
use super::batch::FlushTicket;
use crate::database::{DatabaseError, TallyStore};
use crate::model::CandidateId;
use futures::future::join_all;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReceipt {
    pub candidate: CandidateId,
    pub flushed: u32,
    pub previous_score: u64,
    pub new_score: u64,
    /// Conditional updates issued, including lost races.
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
    #[error("Score of candidate {candidate} kept changing; gave up after {attempts} attempts")]
    Conflict { candidate: CandidateId, attempts: u32 },
}

impl FlushError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, FlushError::Store(err) if err.is_permission_denied())
    }
}

#[derive(Debug)]
pub struct FlushOutcome {
    pub ticket: FlushTicket,
    pub result: Result<FlushReceipt, FlushError>,
}

impl FlushOutcome {
    pub fn committed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Apply one batch as a single increment of the candidate's score.
///
/// When another writer changed the score between our read and our write the
/// conditional update fails; we re-read and try again, at most
/// `conflict_retries` more times. Permission failures are never retried.
pub async fn execute(
    store: &dyn TallyStore,
    ticket: FlushTicket,
    conflict_retries: u32,
) -> Result<FlushReceipt, FlushError> {
    let mut attempts = 0;
    loop {
        let current = store.fetch_score(ticket.candidate).await?;
        let new_score = current + u64::from(ticket.count);
        attempts += 1;

        if store
            .compare_and_set_score(ticket.candidate, current, new_score)
            .await?
        {
            return Ok(FlushReceipt {
                candidate: ticket.candidate,
                flushed: ticket.count,
                previous_score: current,
                new_score,
                attempts,
            });
        }

        tracing::debug!(
            candidate = %ticket.candidate,
            attempts,
            "score changed under flush, re-reading"
        );
        if attempts > conflict_retries {
            return Err(FlushError::Conflict {
                candidate: ticket.candidate,
                attempts,
            });
        }
    }
}

/// Run independent flushes concurrently; one candidate's failure does not
/// affect the others.
pub async fn execute_all(
    store: &dyn TallyStore,
    tickets: Vec<FlushTicket>,
    conflict_retries: u32,
) -> Vec<FlushOutcome> {
    join_all(tickets.into_iter().map(|ticket| async move {
        FlushOutcome {
            ticket,
            result: execute(store, ticket, conflict_retries).await,
        }
    }))
    .await
}
