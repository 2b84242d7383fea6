/// Pending check-marks per candidate
use crate::model::CandidateId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "pending", rename_all = "snake_case")]
pub enum BatchPhase {
    Idle,
    Accumulating(u32),
    /// An increment of this many marks is in flight.
    Flushing(u32),
}

/// A claim on a candidate's pending marks, handed to the flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTicket {
    pub candidate: CandidateId,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Pending(u32),
    /// The mark filled the batch; the caller must run this flush.
    FlushDue(FlushTicket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("candidate {0} has a flush in flight")]
    FlushInFlight(CandidateId),
    #[error("candidate {0} has a full batch waiting to be posted")]
    BatchFull(CandidateId),
}

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    pending: u32,
    in_flight: bool,
}

/// Local, ephemeral state: it is never a source of truth for scores. Each
/// candidate's entry is touched only by its own mark/flush pair.
#[derive(Debug)]
pub struct BatchLedger {
    batch_size: u32,
    entries: HashMap<CandidateId, Entry>,
}

impl BatchLedger {
    pub fn new(batch_size: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Add one pending mark. Reaching the batch size claims the batch for a
    /// flush of that candidate only.
    pub fn mark(&mut self, candidate: CandidateId) -> Result<MarkOutcome, BatchError> {
        let batch_size = self.batch_size;
        let entry = self.entries.entry(candidate).or_default();
        if entry.in_flight {
            return Err(BatchError::FlushInFlight(candidate));
        }
        if entry.pending >= batch_size {
            return Err(BatchError::BatchFull(candidate));
        }

        entry.pending += 1;
        if entry.pending == batch_size {
            entry.in_flight = true;
            return Ok(MarkOutcome::FlushDue(FlushTicket {
                candidate,
                count: entry.pending,
            }));
        }
        Ok(MarkOutcome::Pending(entry.pending))
    }

    /// Toggle one pending mark off.
    pub fn unmark(&mut self, candidate: CandidateId) -> Result<u32, BatchError> {
        let Some(entry) = self.entries.get_mut(&candidate) else {
            return Ok(0);
        };
        if entry.in_flight {
            return Err(BatchError::FlushInFlight(candidate));
        }
        entry.pending = entry.pending.saturating_sub(1);
        Ok(entry.pending)
    }

    /// Claim every candidate with pending marks and no flush in flight.
    pub fn claim_all(&mut self) -> Vec<FlushTicket> {
        let mut tickets: Vec<FlushTicket> = self
            .entries
            .iter_mut()
            .filter(|(_, entry)| entry.pending > 0 && !entry.in_flight)
            .map(|(candidate, entry)| {
                entry.in_flight = true;
                FlushTicket {
                    candidate: *candidate,
                    count: entry.pending,
                }
            })
            .collect();
        tickets.sort_by_key(|ticket| ticket.candidate);
        tickets
    }

    /// Settle a claimed batch. On success the flushed marks are discarded; on
    /// failure they stay pending for the operator to post again.
    pub fn settle(&mut self, ticket: FlushTicket, committed: bool) {
        if let Some(entry) = self.entries.get_mut(&ticket.candidate) {
            entry.in_flight = false;
            if committed {
                entry.pending = entry.pending.saturating_sub(ticket.count);
            }
        }
    }

    /// Drop every pending mark. Batches in flight still settle normally.
    pub fn reset_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.pending = 0;
        }
    }

    pub fn pending(&self, candidate: CandidateId) -> u32 {
        self.entries.get(&candidate).map_or(0, |entry| entry.pending)
    }

    pub fn phase(&self, candidate: CandidateId) -> BatchPhase {
        match self.entries.get(&candidate) {
            Some(entry) if entry.in_flight => BatchPhase::Flushing(entry.pending),
            Some(entry) if entry.pending > 0 => BatchPhase::Accumulating(entry.pending),
            _ => BatchPhase::Idle,
        }
    }

    /// Non-idle candidates with their phase.
    pub fn phases(&self) -> BTreeMap<CandidateId, BatchPhase> {
        self.entries
            .keys()
            .map(|candidate| (*candidate, self.phase(*candidate)))
            .filter(|(_, phase)| *phase != BatchPhase::Idle)
            .collect()
    }

    /// Forget candidates that no longer exist in the store.
    pub fn retain(&mut self, known: impl Fn(CandidateId) -> bool) {
        self.entries
            .retain(|candidate, entry| entry.in_flight || known(*candidate));
    }
}
