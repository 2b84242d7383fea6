/// Store interface consumed by the tally engine
use crate::database::Result;
use crate::model::{BallotLine, Candidate, CandidateId, CandidateList};
use async_trait::async_trait;

/// Row-level read and conditional update over the candidate, list and ballot
/// tables. The engine never writes anything except score increments.
#[async_trait]
pub trait TallyStore: Send + Sync {
    /// All lists, in display order.
    async fn fetch_lists(&self) -> Result<Vec<CandidateList>>;

    /// All candidates with their persisted scores, in display order.
    async fn fetch_candidates(&self) -> Result<Vec<Candidate>>;

    /// Full snapshot of the ballot store.
    async fn fetch_ballot_lines(&self) -> Result<Vec<BallotLine>>;

    /// Current persisted score of one candidate.
    async fn fetch_score(&self, candidate: CandidateId) -> Result<u64>;

    /// Set `score = new` only if it still equals `expected`.
    ///
    /// Returns `false` when the row changed since it was read. Implementations
    /// must reject `new < expected`.
    async fn compare_and_set_score(
        &self,
        candidate: CandidateId,
        expected: u64,
        new: u64,
    ) -> Result<bool>;
}
