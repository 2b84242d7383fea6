/// Deduplicated ballot counts
use crate::model::{BallotGroupId, BallotLine, Classification, Vote, VoterCategory};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Where a ballot group's classification comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMode {
    /// Use the classification stored on each line at ingestion.
    Stored,
    /// Classify each group from the votes on its lines.
    Derived,
}

impl Default for ClassificationMode {
    fn default() -> Self {
        ClassificationMode::Stored
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub a: usize,
    pub b: usize,
}

impl CategoryCounts {
    pub fn get(&self, category: VoterCategory) -> usize {
        match category {
            VoterCategory::A => self.a,
            VoterCategory::B => self.b,
        }
    }

    pub fn total(&self) -> usize {
        self.a + self.b
    }

    fn set(&mut self, category: VoterCategory, count: usize) {
        match category {
            VoterCategory::A => self.a = count,
            VoterCategory::B => self.b = count,
        }
    }
}

/// Distinct ballot groups per classification and voter category.
///
/// Counts are cardinalities of sets of ballot group ids, never line counts,
/// so a ballot with N candidate lines is counted once and reprocessing the
/// same snapshot cannot inflate anything. Always fed a full snapshot: a
/// partial read would under-count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedCounts {
    pub valid: CategoryCounts,
    pub blank: CategoryCounts,
    pub invalid: CategoryCounts,
    /// Groups whose lines disagree on classification or category.
    #[serde(rename = "inconsistentGroups")]
    pub inconsistent_groups: Vec<BallotGroupId>,
}

impl ClassifiedCounts {
    pub fn get(&self, classification: Classification, category: VoterCategory) -> usize {
        self.bucket(classification).get(category)
    }

    pub fn bucket(&self, classification: Classification) -> &CategoryCounts {
        match classification {
            Classification::Valid => &self.valid,
            Classification::Blank => &self.blank,
            Classification::Invalid => &self.invalid,
        }
    }

    fn bucket_mut(&mut self, classification: Classification) -> &mut CategoryCounts {
        match classification {
            Classification::Valid => &mut self.valid,
            Classification::Blank => &mut self.blank,
            Classification::Invalid => &mut self.invalid,
        }
    }

    pub fn by_category(&self, category: VoterCategory) -> usize {
        Classification::ALL
            .iter()
            .map(|class| self.get(*class, category))
            .sum()
    }

    /// Sum over every bucket.
    pub fn total(&self) -> usize {
        Classification::ALL
            .iter()
            .map(|class| self.bucket(*class).total())
            .sum()
    }
}

type BucketKey = (Classification, VoterCategory);

/// Recompute classified counts from a full ballot-store snapshot.
pub fn recompute(lines: &[BallotLine], mode: ClassificationMode) -> ClassifiedCounts {
    let (buckets, inconsistent) = match mode {
        ClassificationMode::Stored => stored_buckets(lines),
        ClassificationMode::Derived => derived_buckets(lines),
    };

    let mut counts = ClassifiedCounts::default();
    for ((class, category), groups) in &buckets {
        counts.bucket_mut(*class).set(*category, groups.len());
    }
    counts.inconsistent_groups = inconsistent.into_iter().collect();

    if !counts.inconsistent_groups.is_empty() {
        tracing::warn!(
            groups = ?counts.inconsistent_groups,
            "ballot groups with conflicting classification or category"
        );
    }
    counts
}

/// Each line puts its group id into the set keyed by the line's own stored
/// classification and source.
fn stored_buckets(
    lines: &[BallotLine],
) -> (
    HashMap<BucketKey, HashSet<BallotGroupId>>,
    BTreeSet<BallotGroupId>,
) {
    let mut buckets: HashMap<BucketKey, HashSet<BallotGroupId>> = HashMap::new();
    let mut first_key: HashMap<BallotGroupId, BucketKey> = HashMap::new();
    let mut inconsistent = BTreeSet::new();

    for line in lines {
        let key = (line.classification, line.source);
        buckets.entry(key).or_default().insert(line.ballot_group_id);

        let seen = *first_key.entry(line.ballot_group_id).or_insert(key);
        if seen != key {
            inconsistent.insert(line.ballot_group_id);
        }
    }

    (buckets, inconsistent)
}

/// Groups lines by ballot, then classifies each ballot from its votes. The
/// category is taken from the group's first line.
fn derived_buckets(
    lines: &[BallotLine],
) -> (
    HashMap<BucketKey, HashSet<BallotGroupId>>,
    BTreeSet<BallotGroupId>,
) {
    let mut groups: HashMap<BallotGroupId, (VoterCategory, Vec<Vote>)> = HashMap::new();
    let mut inconsistent = BTreeSet::new();

    for line in lines {
        let (category, votes) = groups
            .entry(line.ballot_group_id)
            .or_insert_with(|| (line.source, Vec::new()));
        if *category != line.source {
            inconsistent.insert(line.ballot_group_id);
        }
        votes.push(line.vote);
    }

    let mut buckets: HashMap<BucketKey, HashSet<BallotGroupId>> = HashMap::new();
    for (group, (category, votes)) in groups {
        let class = Classification::from_votes(votes);
        buckets.entry((class, category)).or_default().insert(group);
    }

    (buckets, inconsistent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BallotLineId, CandidateId};
    use chrono::Utc;

    fn line(
        id: i64,
        group: i64,
        candidate: i64,
        vote: Vote,
        class: Classification,
        source: VoterCategory,
    ) -> BallotLine {
        BallotLine {
            id: BallotLineId(id),
            ballot_group_id: BallotGroupId(group),
            candidate_id: CandidateId(candidate),
            vote,
            classification: class,
            source,
            recorded_at: Utc::now(),
        }
    }

    /// One ballot per (votes, source), classification stored as derived.
    fn ballots(rows: &[(i64, &[Vote], VoterCategory)]) -> Vec<BallotLine> {
        let mut lines = Vec::new();
        let mut next_id = 1;
        for (group, votes, source) in rows {
            let class = Classification::from_votes(votes.iter().copied());
            for (candidate, vote) in votes.iter().enumerate() {
                lines.push(line(next_id, *group, candidate as i64, *vote, class, *source));
                next_id += 1;
            }
        }
        lines
    }

    #[test]
    fn three_lines_of_one_ballot_count_once() {
        let lines = ballots(&[(7, &[Vote::For, Vote::Blank, Vote::Blank], VoterCategory::A)]);

        for mode in [ClassificationMode::Stored, ClassificationMode::Derived] {
            let counts = recompute(&lines, mode);
            assert_eq!(counts.get(Classification::Valid, VoterCategory::A), 1);
            assert_eq!(counts.total(), 1);
        }
    }

    #[test]
    fn all_blank_ballot_is_counted_blank() {
        let lines = ballots(&[(3, &[Vote::Blank, Vote::Blank], VoterCategory::B)]);
        let counts = recompute(&lines, ClassificationMode::Derived);
        assert_eq!(counts.get(Classification::Blank, VoterCategory::B), 1);
        assert_eq!(counts.valid.total(), 0);
    }

    #[test]
    fn every_group_lands_in_exactly_one_bucket() {
        let lines = ballots(&[
            (1, &[Vote::For, Vote::Blank], VoterCategory::A),
            (2, &[Vote::Blank, Vote::Blank], VoterCategory::A),
            (3, &[Vote::Against, Vote::Blank], VoterCategory::B),
            (4, &[Vote::For, Vote::For], VoterCategory::B),
            (5, &[Vote::Against, Vote::Against], VoterCategory::A),
        ]);

        for mode in [ClassificationMode::Stored, ClassificationMode::Derived] {
            let counts = recompute(&lines, mode);
            assert_eq!(counts.total(), 5);
            assert_eq!(counts.valid, CategoryCounts { a: 1, b: 1 });
            assert_eq!(counts.blank, CategoryCounts { a: 1, b: 0 });
            assert_eq!(counts.invalid, CategoryCounts { a: 1, b: 1 });
            assert_eq!(counts.by_category(VoterCategory::A), 3);
            assert!(counts.inconsistent_groups.is_empty());
        }
    }

    #[test]
    fn recompute_is_idempotent_and_duplicate_safe() {
        let lines = ballots(&[
            (1, &[Vote::For, Vote::Blank], VoterCategory::A),
            (2, &[Vote::Blank], VoterCategory::B),
        ]);
        let first = recompute(&lines, ClassificationMode::Stored);
        let second = recompute(&lines, ClassificationMode::Stored);
        assert_eq!(first, second);

        // The same lines delivered twice must not inflate anything.
        let mut doubled = lines.clone();
        doubled.extend(lines);
        assert_eq!(recompute(&doubled, ClassificationMode::Stored), first);
    }

    #[test]
    fn stored_mode_flags_groups_with_disagreeing_lines() {
        let lines = vec![
            line(1, 9, 1, Vote::For, Classification::Valid, VoterCategory::A),
            line(2, 9, 2, Vote::Blank, Classification::Blank, VoterCategory::A),
        ];

        let stored = recompute(&lines, ClassificationMode::Stored);
        assert_eq!(stored.inconsistent_groups, vec![BallotGroupId(9)]);
        // Stored buckets trust each line, so the group lands in both.
        assert_eq!(stored.total(), 2);
        assert_eq!(stored.get(Classification::Valid, VoterCategory::A), 1);
        assert_eq!(stored.get(Classification::Blank, VoterCategory::A), 1);

        // Deriving from the votes settles the group in one bucket.
        let derived = recompute(&lines, ClassificationMode::Derived);
        assert!(derived.inconsistent_groups.is_empty());
        assert_eq!(derived.total(), 1);
        assert_eq!(derived.get(Classification::Valid, VoterCategory::A), 1);
    }

    #[test]
    fn derived_mode_flags_mixed_categories() {
        let lines = vec![
            line(1, 4, 1, Vote::Blank, Classification::Blank, VoterCategory::A),
            line(2, 4, 2, Vote::Blank, Classification::Blank, VoterCategory::B),
        ];
        let counts = recompute(&lines, ClassificationMode::Derived);
        assert_eq!(counts.inconsistent_groups, vec![BallotGroupId(4)]);
        assert_eq!(counts.get(Classification::Blank, VoterCategory::A), 1);
    }

    #[test]
    fn empty_snapshot_counts_nothing() {
        let counts = recompute(&[], ClassificationMode::Stored);
        assert_eq!(counts, ClassifiedCounts::default());
    }
}
