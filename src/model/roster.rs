use super::{CandidateId, ListId};
use serde::{Deserialize, Serialize};

/// A candidate list as shown on the dashboard. Read-only for the tally engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateList {
    pub id: ListId,
    pub name: String,
    #[serde(rename = "listOrder")]
    pub list_order: i64,
}

/// A candidate and its persisted score.
///
/// `list_order` and `candidate_order` only drive display ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    #[serde(rename = "listId")]
    pub list_id: ListId,
    pub name: String,
    pub score: u64,
    #[serde(rename = "listOrder")]
    pub list_order: i64,
    #[serde(rename = "candidateOrder")]
    pub candidate_order: i64,
}

impl Candidate {
    /// Key used to order candidates for display.
    pub fn display_key(&self) -> (i64, i64, CandidateId) {
        (self.list_order, self.candidate_order, self.id)
    }
}
