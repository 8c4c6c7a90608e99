//! # Schedule Engine
//!
//! The write path. Every write runs the same sequence:
//!
//! 1. validate the request,
//! 2. reject it with the full conflict set if it overlaps an existing
//!    assignment on the same target,
//! 3. persist it,
//! 4. mutate the cache if it occurs today,
//! 5. push it to the affected monitors (best effort).
//!
//! Steps 2 to 4 run under one async write gate so two concurrent writes can
//! never both pass the conflict check for the same slot.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::clock::Clock;
use super::conflict::{self, ConflictDetector};
use super::error::{EngineError, ValidationError};
use super::recurrence;
use super::registry::ConnectionRegistry;
use super::schedule_cache::ScheduleCache;
use crate::models::{Assignment, AssignmentId, AssignmentRequest, Target};
use crate::protocol::OutboundMessage;
use crate::store::AssignmentStore;

pub struct ScheduleEngine {
    store: Arc<dyn AssignmentStore>,
    cache: ScheduleCache,
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    detector: ConflictDetector,
    write_gate: Mutex<()>,
}

impl ScheduleEngine {
    pub fn new(
        store: Arc<dyn AssignmentStore>,
        cache: ScheduleCache,
        registry: Arc<ConnectionRegistry>,
        clock: Arc<dyn Clock>,
        horizon_days: u64,
    ) -> Self {
        Self {
            detector: ConflictDetector::new(Arc::clone(&store), horizon_days),
            store,
            cache,
            registry,
            clock,
            write_gate: Mutex::new(()),
        }
    }

    /// Validates and creates one assignment.
    pub async fn try_create(&self, request: &AssignmentRequest) -> Result<Assignment, EngineError> {
        let candidate = request.validate()?;
        self.create(candidate).await
    }

    /// Creates an already validated assignment.
    pub async fn create(&self, candidate: Assignment) -> Result<Assignment, EngineError> {
        let today = self.clock.local_now().date();
        let days = self.detector.occurrence_dates(&candidate, today);

        let stored = {
            let _gate = self.write_gate.lock().await;
            let conflicts = self.detector.find_conflicts(&candidate, &days, &[]).await?;
            if !conflicts.is_empty() {
                info!(
                    recipient = ?candidate.target,
                    conflicts = conflicts.len(),
                    "Schedule rejected, conflicts with existing schedules"
                );
                return Err(EngineError::Conflict { conflicts });
            }

            let stored = self.store.create(&candidate, &days).await?;
            if recurrence::is_active(&stored, today) {
                self.cache.add(stored.clone());
            }
            stored
        };

        info!(id = stored.id, recipient = ?stored.target, days = days.len(), "Schedule created");
        if recurrence::is_active(&stored, today) {
            self.registry
                .notify_target(&stored.target, &OutboundMessage::ScheduleUpdate(stored.clone()));
        }
        Ok(stored)
    }

    /// Validates and replaces a batch of assignments, all or nothing.
    ///
    /// ## Logic:
    /// 1. Every member must carry an id, and ids must be unique.
    /// 2. Store conflicts are searched excluding every id of the batch, since
    ///    those rows are about to be replaced.
    /// 3. Members are additionally checked against each other.
    /// 4. The cache keeps members occurring today and drops the others.
    /// 5. Monitors of a member's old target are resynced when the member moved
    ///    away from them or stopped occurring today.
    pub async fn try_update_batch(
        &self,
        requests: &[AssignmentRequest],
    ) -> Result<Vec<Assignment>, EngineError> {
        let today = self.clock.local_now().date();
        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(requests.len());
        for request in requests {
            let candidate = request.validate_update()?;
            if !seen.insert(candidate.id) {
                return Err(ValidationError::DuplicateId(candidate.id).into());
            }
            let days = self.detector.occurrence_dates(&candidate, today);
            batch.push((candidate, days));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<AssignmentId> = batch.iter().map(|(a, _)| a.id).collect();

        let (updated, previous) = {
            let _gate = self.write_gate.lock().await;

            let mut conflicts = conflict::batch_conflicts(&batch);
            for (candidate, days) in &batch {
                conflicts.extend(self.detector.find_conflicts(candidate, days, &ids).await?);
            }
            let conflicts = conflict::dedupe_by_id(conflicts);
            if !conflicts.is_empty() {
                info!(batch = batch.len(), conflicts = conflicts.len(), "Batch update rejected");
                return Err(EngineError::Conflict { conflicts });
            }

            let previous: Vec<Option<Assignment>> = ids.iter().map(|id| self.cache.get_by_id(*id)).collect();
            let updated = self.store.update_batch(&batch).await?;
            for assignment in &updated {
                if recurrence::is_active(assignment, today) {
                    if !self.cache.update_by_id(assignment.clone()) {
                        self.cache.add(assignment.clone());
                    }
                } else {
                    self.cache.delete_by_id(assignment.id);
                }
            }
            (updated, previous)
        };

        info!(count = updated.len(), "Schedules updated");
        for (assignment, before) in updated.iter().zip(previous) {
            let active = recurrence::is_active(assignment, today);
            if active {
                self.registry
                    .notify_target(&assignment.target, &OutboundMessage::ScheduleUpdate(assignment.clone()));
            }
            if let Some(before) = before {
                if !active || before.target != assignment.target {
                    self.registry.resync_target(&before.target);
                }
            }
        }
        Ok(updated)
    }

    /// Deletes an assignment and resyncs the monitors that had it today.
    pub async fn delete(&self, id: AssignmentId) -> Result<Assignment, EngineError> {
        let (removed, cached) = {
            let _gate = self.write_gate.lock().await;
            let removed = self.store.delete(id).await?;
            let cached = self.cache.delete_by_id(id).is_some();
            (removed, cached)
        };

        info!(id, recipient = ?removed.target, "Schedule deleted");
        if cached {
            let resynced = self.registry.resync_target(&removed.target);
            if resynced == 0 {
                warn!(id, "Deleted schedule was live but no monitor was reachable");
            }
        }
        Ok(removed)
    }

    pub fn cache_snapshot(&self) -> Vec<Assignment> {
        self.cache.get()
    }

    pub fn cache_for_target(&self, target: &Target) -> Vec<Assignment> {
        self.cache.get_by_target(target)
    }

    /// Occurrence dates the engine would materialize for `assignment` today.
    pub fn occurrence_dates(&self, assignment: &Assignment) -> Vec<NaiveDate> {
        self.detector
            .occurrence_dates(assignment, self.clock.local_now().date())
    }
}
