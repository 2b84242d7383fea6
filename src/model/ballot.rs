use super::{BallotGroupId, BallotLineId, CandidateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mark recorded on one line of a ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum Vote {
    /// Struck out, or left unmarked on an otherwise filled ballot.
    Against,
    Blank,
    /// Marked for the candidate.
    For,
}

impl Vote {
    pub fn value(&self) -> i64 {
        match self {
            Vote::Against => -1,
            Vote::Blank => 0,
            Vote::For => 1,
        }
    }
}

impl From<Vote> for i64 {
    fn from(vote: Vote) -> i64 {
        vote.value()
    }
}

impl TryFrom<i64> for Vote {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Vote::Against),
            0 => Ok(Vote::Blank),
            1 => Ok(Vote::For),
            other => Err(format!("vote must be -1, 0 or 1, got {}", other)),
        }
    }
}

/// Classification of a whole ballot group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Valid,
    Blank,
    Invalid,
}

impl Classification {
    pub const ALL: [Classification; 3] = [
        Classification::Valid,
        Classification::Blank,
        Classification::Invalid,
    ];

    /// Classifies a ballot group from the votes on its lines.
    ///
    /// Blank iff every vote is blank; otherwise valid iff at least one line is
    /// marked for a candidate, else invalid. An empty group counts as blank.
    pub fn from_votes<I>(votes: I) -> Classification
    where
        I: IntoIterator<Item = Vote>,
    {
        let mut all_blank = true;
        let mut any_for = false;
        for vote in votes {
            match vote {
                Vote::Blank => {}
                Vote::For => {
                    all_blank = false;
                    any_for = true;
                }
                Vote::Against => all_blank = false,
            }
        }

        if all_blank {
            Classification::Blank
        } else if any_for {
            Classification::Valid
        } else {
            Classification::Invalid
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Valid => "valid",
            Classification::Blank => "blank",
            Classification::Invalid => "invalid",
        }
    }

    pub fn parse(value: &str) -> Option<Classification> {
        match value {
            "valid" => Some(Classification::Valid),
            "blank" => Some(Classification::Blank),
            "invalid" => Some(Classification::Invalid),
            _ => None,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Voter category a ballot was cast under, used to split reported counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoterCategory {
    A,
    B,
}

impl VoterCategory {
    pub const ALL: [VoterCategory; 2] = [VoterCategory::A, VoterCategory::B];

    pub fn as_str(&self) -> &'static str {
        match self {
            VoterCategory::A => "a",
            VoterCategory::B => "b",
        }
    }

    pub fn parse(value: &str) -> Option<VoterCategory> {
        match value {
            "a" | "A" => Some(VoterCategory::A),
            "b" | "B" => Some(VoterCategory::B),
            _ => None,
        }
    }
}

impl fmt::Display for VoterCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate line of a physical ballot. Append-only in the ballot store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotLine {
    pub id: BallotLineId,
    #[serde(rename = "ballotGroupId")]
    pub ballot_group_id: BallotGroupId,
    #[serde(rename = "candidateId")]
    pub candidate_id: CandidateId,
    pub vote: Vote,
    /// Stored per line at ingestion, though it describes the whole group.
    pub classification: Classification,
    pub source: VoterCategory,
    #[serde(rename = "recordedAt")]
    pub recorded_at: DateTime<Utc>,
}
