//! # Schedule Cache
//!
//! Process-wide snapshot of the assignments that occur today.
//!
//! ## Core Responsibilities:
//! - **Atomic rebuild:** `set` swaps the whole snapshot under one write lock.
//! - **Point mutations:** `add`, `update_by_id` and `delete_by_id` follow each
//!   successful persisted write. Updates try `update_by_id` first and fall
//!   back to `add` for assignments that start occurring today.
//! - **Reads:** `get`, `get_by_target` and `get_for_device` return owned copies
//!   so no lock outlives the call.
//!
//! Storage is a plain vector and every operation is O(n). That is adequate for
//! a few thousand assignments per day; beyond that an index by target is needed.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{Assignment, AssignmentId, Device, Target};

#[derive(Debug, Clone, Default)]
pub struct ScheduleCache {
    inner: Arc<RwLock<Vec<Assignment>>>,
}

impl ScheduleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole snapshot.
    pub fn set(&self, assignments: Vec<Assignment>) {
        *self.write() = assignments;
    }

    /// Inserts an assignment, replacing any entry with the same id.
    pub fn add(&self, assignment: Assignment) {
        let mut entries = self.write();
        match entries.iter_mut().find(|a| a.id == assignment.id) {
            Some(slot) => *slot = assignment,
            None => entries.push(assignment),
        }
    }

    /// Replaces the entry with the same id. Returns false if it was absent.
    pub fn update_by_id(&self, assignment: Assignment) -> bool {
        let mut entries = self.write();
        match entries.iter_mut().find(|a| a.id == assignment.id) {
            Some(slot) => {
                *slot = assignment;
                true
            }
            None => false,
        }
    }

    pub fn delete_by_id(&self, id: AssignmentId) -> Option<Assignment> {
        let mut entries = self.write();
        let pos = entries.iter().position(|a| a.id == id)?;
        Some(entries.remove(pos))
    }

    pub fn get(&self) -> Vec<Assignment> {
        self.read().clone()
    }

    pub fn get_by_id(&self, id: AssignmentId) -> Option<Assignment> {
        self.read().iter().find(|a| a.id == id).cloned()
    }

    pub fn get_by_target(&self, target: &Target) -> Vec<Assignment> {
        self.read()
            .iter()
            .filter(|a| a.target == *target)
            .cloned()
            .collect()
    }

    /// Assignments addressed to the device directly, to its group or to its location.
    pub fn get_for_device(&self, device: &Device) -> Vec<Assignment> {
        self.read()
            .iter()
            .filter(|a| a.target.covers(device))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Assignment>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Assignment>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DispatchMode, Recurrence, TimeWindow};
    use chrono::{NaiveDate, NaiveTime};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use std::thread;

    fn assignment(id: AssignmentId, target: Target, content_id: i64) -> Assignment {
        Assignment {
            id,
            content_id,
            content: None,
            target,
            window: TimeWindow::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            )
            .unwrap(),
            start_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            end_date: None,
            recurrence: Recurrence::Daily,
            dates: Vec::new(),
            exceptions: Vec::new(),
            priority: 0,
            mode: DispatchMode::Rotation,
        }
    }

    #[test]
    fn point_mutations() {
        let cache = ScheduleCache::new();
        cache.add(assignment(1, Target::Device(5), 7));
        cache.add(assignment(2, Target::Group(3), 8));
        cache.add(assignment(1, Target::Device(5), 9));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_by_id(1).map(|a| a.content_id), Some(9));

        assert!(cache.update_by_id(assignment(2, Target::Group(3), 10)));
        assert!(!cache.update_by_id(assignment(42, Target::Group(3), 10)));

        assert_eq!(cache.delete_by_id(1).map(|a| a.id), Some(1));
        assert!(cache.delete_by_id(1).is_none());
        assert_eq!(cache.get_by_target(&Target::Group(3)).len(), 1);
    }

    #[test]
    fn set_replaces_snapshot() {
        let cache = ScheduleCache::new();
        cache.add(assignment(1, Target::Device(5), 7));
        cache.set(vec![assignment(3, Target::Location(1), 7)]);
        let ids: Vec<_> = cache.get().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn device_subset_covers_group_and_location() {
        let cache = ScheduleCache::new();
        cache.set(vec![
            assignment(1, Target::Device(5), 7),
            assignment(2, Target::Group(3), 7),
            assignment(3, Target::Location(4), 7),
            assignment(4, Target::Device(6), 7),
            assignment(5, Target::Group(9), 7),
        ]);
        let device = Device::new(5, "lobby").in_group(3).at_location(4);
        let mut ids: Vec<_> = cache.get_for_device(&device).iter().map(|a| a.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_mutators_match_sequential_model() {
        let cache = ScheduleCache::new();
        let threads: Vec<_> = (0..8i64)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    let mut model = BTreeMap::new();
                    // Each thread owns a disjoint id range so its model is exact.
                    for _ in 0..2_000 {
                        let id = t * 1_000 + rng.random_range(0..50);
                        match rng.random_range(0..3) {
                            0 => {
                                let content = rng.random_range(0..100);
                                cache.add(assignment(id, Target::Device(t), content));
                                model.insert(id, content);
                            }
                            1 => {
                                let content = rng.random_range(0..100);
                                let hit = cache.update_by_id(assignment(id, Target::Device(t), content));
                                assert_eq!(hit, model.contains_key(&id));
                                if hit {
                                    model.insert(id, content);
                                }
                            }
                            _ => {
                                let removed = cache.delete_by_id(id).is_some();
                                assert_eq!(removed, model.remove(&id).is_some());
                            }
                        }
                        let _ = cache.get();
                    }
                    model
                })
            })
            .collect();

        let mut expected = BTreeMap::new();
        for handle in threads {
            expected.extend(handle.join().unwrap());
        }

        let actual: BTreeMap<_, _> = cache.get().into_iter().map(|a| (a.id, a.content_id)).collect();
        assert_eq!(actual, expected);
        assert_eq!(cache.len(), expected.len());
    }
}
