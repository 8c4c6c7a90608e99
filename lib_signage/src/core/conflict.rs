//! # Conflict Detector
//!
//! Two assignments conflict when they share a target, occur on at least one
//! common day and their windows strictly overlap. Touching windows
//! (`[09:00,10:00)` and `[10:00,11:00)`) do not conflict.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::debug;

use super::recurrence;
use crate::models::{Assignment, AssignmentId};
use crate::store::{AssignmentStore, StoreError};

pub struct ConflictDetector {
    store: Arc<dyn AssignmentStore>,
    horizon_days: u64,
}

impl ConflictDetector {
    pub fn new(store: Arc<dyn AssignmentStore>, horizon_days: u64) -> Self {
        Self {
            store,
            horizon_days,
        }
    }

    /// Days `candidate` occurs on when written on `today`.
    pub fn occurrence_dates(&self, candidate: &Assignment, today: NaiveDate) -> Vec<NaiveDate> {
        recurrence::occurrence_dates(candidate, today, self.horizon_days)
    }

    /// Persisted assignments conflicting with `candidate` on any of `days`,
    /// ignoring the ids in `exclude`. De-duplicated by id.
    pub async fn find_conflicts(
        &self,
        candidate: &Assignment,
        days: &[NaiveDate],
        exclude: &[AssignmentId],
    ) -> Result<Vec<Assignment>, StoreError> {
        if days.is_empty() {
            return Ok(Vec::new());
        }
        let found = self
            .store
            .find_conflicts(&candidate.target, days, &candidate.window, exclude)
            .await?;
        let conflicts = dedupe_by_id(found);
        debug!(
            recipient = ?candidate.target,
            days = days.len(),
            conflicts = conflicts.len(),
            "Conflict check finished"
        );
        Ok(conflicts)
    }
}

/// True when both assignments target the same recipient, overlap in time and
/// share at least one occurrence day.
pub fn conflicts_between(a: &Assignment, a_days: &[NaiveDate], b: &Assignment, b_days: &[NaiveDate]) -> bool {
    a.id != b.id
        && a.target == b.target
        && a.window.overlaps(&b.window)
        && a_days.iter().any(|day| b_days.contains(day))
}

/// Members of a batch that conflict with another member of the same batch.
pub fn batch_conflicts(batch: &[(Assignment, Vec<NaiveDate>)]) -> Vec<Assignment> {
    let mut hits = Vec::new();
    for (i, (a, a_days)) in batch.iter().enumerate() {
        for (b, b_days) in batch.iter().skip(i + 1) {
            if conflicts_between(a, a_days, b, b_days) {
                hits.push(a.clone());
                hits.push(b.clone());
            }
        }
    }
    dedupe_by_id(hits)
}

pub fn dedupe_by_id(assignments: Vec<Assignment>) -> Vec<Assignment> {
    let mut seen = HashSet::new();
    assignments
        .into_iter()
        .filter(|a| seen.insert(a.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DispatchMode, Recurrence, Target, TimeWindow};
    use crate::store::InMemoryStore;
    use chrono::NaiveTime;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    fn assignment(id: AssignmentId, target: Target, start: u32, end: u32) -> Assignment {
        Assignment {
            id,
            content_id: 7,
            content: None,
            target,
            window: TimeWindow::new(
                NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
            )
            .unwrap(),
            start_date: d(3),
            end_date: Some(d(9)),
            recurrence: Recurrence::Daily,
            dates: Vec::new(),
            exceptions: Vec::new(),
            priority: 0,
            mode: DispatchMode::Rotation,
        }
    }

    #[test]
    fn conflict_is_symmetric() {
        let days = [d(3), d(4)];
        let pairs = [
            (assignment(1, Target::Device(5), 9, 11), assignment(2, Target::Device(5), 10, 12), true),
            (assignment(1, Target::Device(5), 9, 10), assignment(2, Target::Device(5), 10, 11), false),
            (assignment(1, Target::Device(5), 9, 12), assignment(2, Target::Device(5), 10, 11), true),
            (assignment(1, Target::Device(5), 9, 12), assignment(2, Target::Group(5), 10, 11), false),
        ];
        for (a, b, expected) in pairs {
            assert_eq!(conflicts_between(&a, &days, &b, &days), expected);
            assert_eq!(conflicts_between(&b, &days, &a, &days), expected);
        }
    }

    #[test]
    fn disjoint_days_do_not_conflict() {
        let a = assignment(1, Target::Device(5), 9, 11);
        let b = assignment(2, Target::Device(5), 9, 11);
        assert!(!conflicts_between(&a, &[d(3)], &b, &[d(4)]));
    }

    #[test]
    fn batch_pairs_are_reported_once() {
        let a = assignment(1, Target::Device(5), 9, 11);
        let b = assignment(2, Target::Device(5), 10, 12);
        let c = assignment(3, Target::Device(5), 10, 11);
        let batch = vec![(a, vec![d(3)]), (b, vec![d(3)]), (c, vec![d(3)])];
        let ids: Vec<_> = batch_conflicts(&batch).iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn detector_checks_every_occurrence_day() {
        let store = Arc::new(InMemoryStore::new());
        let existing = assignment(0, Target::Device(5), 9, 10);
        store.create(&existing, &[d(8)]).await.unwrap();

        let detector = ConflictDetector::new(store.clone(), 366);
        let candidate = assignment(0, Target::Device(5), 9, 10);
        let days = detector.occurrence_dates(&candidate, d(3));
        assert_eq!(days.len(), 7);

        let conflicts = detector.find_conflicts(&candidate, &days, &[]).await.unwrap();
        assert_eq!(conflicts.len(), 1);

        let edge = assignment(0, Target::Device(5), 10, 11);
        let conflicts = detector.find_conflicts(&edge, &days, &[]).await.unwrap();
        assert!(conflicts.is_empty());
    }

    #[tokio::test]
    async fn open_ended_rule_conflicts_past_its_stored_days() {
        let store = Arc::new(InMemoryStore::new());
        let mut existing = assignment(0, Target::Device(5), 9, 10);
        existing.end_date = None;
        // Only the first week was materialized when it was written.
        let first_week: Vec<_> = (3..=9).map(d).collect();
        store.create(&existing, &first_week).await.unwrap();

        let detector = ConflictDetector::new(store.clone(), 30);
        let mut later = assignment(0, Target::Device(5), 9, 10);
        later.start_date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        later.end_date = Some(later.start_date);
        let days = detector.occurrence_dates(&later, d(3));
        assert_eq!(days, vec![later.start_date]);

        let conflicts = detector.find_conflicts(&later, &days, &[]).await.unwrap();
        assert_eq!(conflicts.len(), 1);
    }
}
