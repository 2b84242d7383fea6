pub mod ballot;
pub mod roster;

pub use ballot::{BallotLine, Classification, Vote, VoterCategory};
pub use roster::{Candidate, CandidateList};

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

row_id!(
    /// Row id of a candidate in the candidate store.
    CandidateId
);
row_id!(
    /// Row id of a candidate list.
    ListId
);
row_id!(
    /// Groups every line recorded for one physical ballot.
    BallotGroupId
);
row_id!(BallotLineId);

/// Store tables the tally engine reads and watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Lists,
    Candidates,
    BallotLines,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Lists, Table::Candidates, Table::BallotLines];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Lists => "lists",
            Table::Candidates => "candidates",
            Table::BallotLines => "ballot_lines",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        match name {
            "lists" => Some(Table::Lists),
            "candidates" => Some(Table::Candidates),
            "ballot_lines" => Some(Table::BallotLines),
            _ => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
