//! # In-Memory Store
//!
//! A complete [`AssignmentStore`] and [`DeviceDirectory`] kept in process
//! memory. Used by the test suites and by the server when no database URL is
//! configured.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use super::{AssignmentStore, DeviceDirectory, StoreError};
use crate::core::recurrence;
use crate::models::{
    Assignment, AssignmentId, ContentDescriptor, ContentId, Device, Recurrence, Target,
    TimeWindow,
};

#[derive(Default)]
struct Inner {
    next_id: AssignmentId,
    rows: BTreeMap<AssignmentId, (Assignment, BTreeSet<NaiveDate>)>,
    devices: HashMap<String, Device>,
    contents: HashMap<ContentId, ContentDescriptor>,
}

impl Inner {
    fn attach_content(&self, mut assignment: Assignment) -> Assignment {
        if let Some(content) = self.contents.get(&assignment.content_id) {
            assignment.content = Some(content.clone());
        }
        assignment
    }
}

/// True when `assignment` occurs on `day`. Days past the last materialized
/// one are evaluated against the rule itself.
fn occurs_on(assignment: &Assignment, materialized: &BTreeSet<NaiveDate>, day: NaiveDate) -> bool {
    if materialized.contains(&day) {
        return true;
    }
    let beyond = materialized.last().is_none_or(|last| *last < day);
    beyond && recurrence::is_active(assignment, day)
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device under an identity token.
    pub fn with_device(self, token: impl Into<String>, device: Device) -> Self {
        self.lock().devices.insert(token.into(), device);
        self
    }

    pub fn with_content(self, content: ContentDescriptor) -> Self {
        self.lock().contents.insert(content.id, content);
        self
    }

    /// When offline every call fails with [`StoreError::Backend`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("in-memory store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for InMemoryStore {
    async fn create(
        &self,
        assignment: &Assignment,
        days: &[NaiveDate],
    ) -> Result<Assignment, StoreError> {
        self.check_online()?;
        let mut inner = self.lock();
        let mut stored = assignment.clone();
        if stored.id == 0 {
            inner.next_id += 1;
            stored.id = inner.next_id;
        } else {
            inner.next_id = inner.next_id.max(stored.id);
        }
        let stored = inner.attach_content(stored);
        inner
            .rows
            .insert(stored.id, (stored.clone(), days.iter().copied().collect()));
        Ok(stored)
    }

    async fn find_conflicts(
        &self,
        target: &Target,
        days: &[NaiveDate],
        window: &TimeWindow,
        exclude: &[AssignmentId],
    ) -> Result<Vec<Assignment>, StoreError> {
        self.check_online()?;
        let inner = self.lock();
        Ok(inner
            .rows
            .values()
            .filter(|(a, _)| a.target == *target && !exclude.contains(&a.id))
            .filter(|(a, _)| a.window.overlaps(window))
            .filter(|(a, occurs)| days.iter().any(|d| occurs_on(a, occurs, *d)))
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn assignments_active_on(&self, date: NaiveDate) -> Result<Vec<Assignment>, StoreError> {
        self.check_online()?;
        let inner = self.lock();
        Ok(inner
            .rows
            .values()
            .filter(|(a, occurs)| occurs_on(a, occurs, date))
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn extend_days(&self, from: NaiveDate, through: NaiveDate) -> Result<usize, StoreError> {
        self.check_online()?;
        let mut inner = self.lock();
        let mut added = 0;
        for (assignment, occurs) in inner.rows.values_mut() {
            if matches!(assignment.recurrence, Recurrence::Once) {
                continue;
            }
            for day in recurrence::occurrence_dates_between(assignment, from, through) {
                if occurs.insert(day) {
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    async fn assignments_active_now(
        &self,
        now: NaiveDateTime,
    ) -> Result<Vec<Assignment>, StoreError> {
        let today = self.assignments_active_on(now.date()).await?;
        Ok(today
            .into_iter()
            .filter(|a| a.window.contains(now.time()))
            .collect())
    }

    async fn update_batch(
        &self,
        batch: &[(Assignment, Vec<NaiveDate>)],
    ) -> Result<Vec<Assignment>, StoreError> {
        self.check_online()?;
        let mut inner = self.lock();
        if let Some((missing, _)) = batch.iter().find(|(a, _)| !inner.rows.contains_key(&a.id)) {
            return Err(StoreError::NotFound(missing.id));
        }
        let mut updated = Vec::with_capacity(batch.len());
        for (assignment, days) in batch {
            let stored = inner.attach_content(assignment.clone());
            inner
                .rows
                .insert(stored.id, (stored.clone(), days.iter().copied().collect()));
            updated.push(stored);
        }
        Ok(updated)
    }

    async fn delete(&self, id: AssignmentId) -> Result<Assignment, StoreError> {
        self.check_online()?;
        self.lock()
            .rows
            .remove(&id)
            .map(|(a, _)| a)
            .ok_or(StoreError::NotFound(id))
    }

    async fn get(&self, id: AssignmentId) -> Result<Option<Assignment>, StoreError> {
        self.check_online()?;
        Ok(self.lock().rows.get(&id).map(|(a, _)| a.clone()))
    }
}

#[async_trait]
impl DeviceDirectory for InMemoryStore {
    async fn resolve_token(&self, token: &str) -> Result<Option<Device>, StoreError> {
        self.check_online()?;
        Ok(self.lock().devices.get(token).cloned())
    }
}
