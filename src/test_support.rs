/// Fixtures and a fault-injecting store for tests
use crate::database::{DatabaseError, Result, TallyDatabase, TallyStore};
use crate::model::{BallotLine, Candidate, CandidateId, CandidateList, ListId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub struct Roster {
    pub lists: Vec<ListId>,
    /// Alice, Bob, Carol on the first list; Dan on the second.
    pub candidates: Vec<CandidateId>,
}

pub async fn seed_roster(db: &TallyDatabase) -> Roster {
    let red = db.insert_list("Red", 1).await.unwrap();
    let blue = db.insert_list("Blue", 2).await.unwrap();
    let mut candidates = Vec::new();
    for (order, name) in ["Alice", "Bob", "Carol"].iter().enumerate() {
        candidates.push(db.insert_candidate(red, name, order as i64).await.unwrap());
    }
    candidates.push(db.insert_candidate(blue, "Dan", 0).await.unwrap());
    Roster {
        lists: vec![red, blue],
        candidates,
    }
}

pub async fn seeded_database() -> (TallyDatabase, Roster) {
    let db = TallyDatabase::create_in_memory().await.unwrap();
    let roster = seed_roster(&db).await;
    (db, roster)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    PermissionDenied,
}

impl Fault {
    fn error(self) -> DatabaseError {
        match self {
            Fault::Unavailable => DatabaseError::Unavailable("injected outage".to_string()),
            Fault::PermissionDenied => {
                DatabaseError::PermissionDenied("injected denial".to_string())
            }
        }
    }
}

/// Wraps a real database and injects failures, races and stalls.
pub struct FaultyStore {
    inner: TallyDatabase,
    read_fault: Mutex<Option<Fault>>,
    write_fault: Mutex<Option<Fault>>,
    races: AtomicU32,
    gate: Mutex<Option<Arc<Semaphore>>>,
    pub writes: AtomicU32,
}

impl FaultyStore {
    pub fn new(inner: TallyDatabase) -> Self {
        Self {
            inner,
            read_fault: Mutex::new(None),
            write_fault: Mutex::new(None),
            races: AtomicU32::new(0),
            gate: Mutex::new(None),
            writes: AtomicU32::new(0),
        }
    }

    pub fn fail_reads(&self, fault: Option<Fault>) {
        *self.read_fault.lock().unwrap() = fault;
    }

    pub fn fail_writes(&self, fault: Option<Fault>) {
        *self.write_fault.lock().unwrap() = fault;
    }

    /// Before each of the next `count` conditional updates, another writer
    /// bumps the score by one between our read and our write.
    pub fn race_next_writes(&self, count: u32) {
        self.races.store(count, Ordering::SeqCst);
    }

    /// Park conditional updates until `release_writes`.
    pub fn hold_writes(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_writes(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(1024);
        }
    }

    fn check(&self, slot: &Mutex<Option<Fault>>) -> Result<()> {
        match *slot.lock().unwrap() {
            Some(fault) => Err(fault.error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TallyStore for FaultyStore {
    async fn fetch_lists(&self) -> Result<Vec<CandidateList>> {
        self.check(&self.read_fault)?;
        self.inner.fetch_lists().await
    }

    async fn fetch_candidates(&self) -> Result<Vec<Candidate>> {
        self.check(&self.read_fault)?;
        self.inner.fetch_candidates().await
    }

    async fn fetch_ballot_lines(&self) -> Result<Vec<BallotLine>> {
        self.check(&self.read_fault)?;
        self.inner.fetch_ballot_lines().await
    }

    async fn fetch_score(&self, candidate: CandidateId) -> Result<u64> {
        self.check(&self.read_fault)?;
        self.inner.fetch_score(candidate).await
    }

    async fn compare_and_set_score(
        &self,
        candidate: CandidateId,
        expected: u64,
        new: u64,
    ) -> Result<bool> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        self.check(&self.write_fault)?;

        let raced = self
            .races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if raced {
            let current = self.inner.fetch_score(candidate).await?;
            self.inner
                .compare_and_set_score(candidate, current, current + 1)
                .await?;
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.compare_and_set_score(candidate, expected, new).await
    }
}
