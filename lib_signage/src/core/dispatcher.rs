//! # Reconciliation Dispatcher
//!
//! On every tick decides what each connected monitor should be showing and
//! pushes a `show` only when that differs from what was last pushed.
//!
//! ## Core Responsibilities:
//! - **Selection:** assignments whose window contains now and which occur
//!   today, narrowed per device by [`select_for_device`].
//! - **Edge-triggered push:** a per-device [`DispatchState`] remembers the last
//!   push; an unchanged selection is skipped, an expired state is cleared.
//! - **Self-correction:** nothing is retried. A failed push leaves the state
//!   unrecorded and the next tick derives it again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{NaiveDateTime, Timelike};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::recurrence;
use super::registry::{ConnectionRegistry, SessionId};
use super::schedule_cache::ScheduleCache;
use crate::models::{Assignment, AssignmentId, ContentId, Device, DeviceId, DispatchMode};
use crate::protocol::{OutboundMessage, ShowContent};
use crate::store::{AssignmentStore, StoreError};

/// Where the dispatcher reads the currently active assignments from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActiveSource {
    #[default]
    Cache,
    Store,
}

impl std::str::FromStr for ActiveSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cache" => Ok(ActiveSource::Cache),
            "store" | "db" | "database" => Ok(ActiveSource::Store),
            other => Err(format!("unknown dispatch source '{other}'")),
        }
    }
}

/// Last content pushed to a device, valid until `ends_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchState {
    pub session_id: SessionId,
    pub assignment_id: AssignmentId,
    pub content_id: ContentId,
    pub ends_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pushed: usize,
    pub unchanged: usize,
    pub expired: usize,
    pub failed: usize,
}

pub struct ReconciliationDispatcher {
    cache: ScheduleCache,
    registry: Arc<ConnectionRegistry>,
    store: Option<Arc<dyn AssignmentStore>>,
    source: ActiveSource,
    rotation_period: Duration,
    states: Mutex<HashMap<DeviceId, DispatchState>>,
}

impl ReconciliationDispatcher {
    pub fn new(cache: ScheduleCache, registry: Arc<ConnectionRegistry>, rotation_period: Duration) -> Self {
        Self {
            cache,
            registry,
            store: None,
            source: ActiveSource::Cache,
            rotation_period,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Reads active assignments from the store on every tick instead of the cache.
    pub fn with_store_source(mut self, store: Arc<dyn AssignmentStore>) -> Self {
        self.store = Some(store);
        self.source = ActiveSource::Store;
        self
    }

    pub fn source(&self) -> ActiveSource {
        self.source
    }

    /// Snapshot of the dispatch state of one device.
    pub fn state_of(&self, device_id: DeviceId) -> Option<DispatchState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device_id)
            .cloned()
    }

    async fn active_now(&self, now: NaiveDateTime) -> Result<Vec<Assignment>, StoreError> {
        match (&self.source, &self.store) {
            (ActiveSource::Store, Some(store)) => store.assignments_active_now(now).await,
            _ => Ok(self
                .cache
                .get()
                .into_iter()
                .filter(|a| recurrence::is_active(a, now.date()) && a.window.contains(now.time()))
                .collect()),
        }
    }

    /// One reconciliation pass at local time `now`.
    pub async fn tick(&self, now: NaiveDateTime) -> Result<TickReport, StoreError> {
        let active = self.active_now(now).await?;
        let connected = self.registry.connected_devices();
        let mut report = TickReport::default();

        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.retain(|device_id, state| {
            connected
                .iter()
                .any(|c| c.device.id == *device_id && c.session_id == state.session_id)
        });

        for conn in &connected {
            let device_id = conn.device.id;
            if states.get(&device_id).is_some_and(|s| now >= s.ends_at) {
                states.remove(&device_id);
                report.expired += 1;
            }

            let Some(selected) = select_for_device(&active, &conn.device, now, self.rotation_period) else {
                // Content withdrawn mid-window; forget it so a reappearance is pushed.
                states.remove(&device_id);
                continue;
            };

            let unchanged = states.get(&device_id).is_some_and(|s| {
                s.assignment_id == selected.id && s.content_id == selected.content_id
            });
            if unchanged {
                report.unchanged += 1;
                continue;
            }

            let show = show_for(selected, now);
            let ends_at = show.ends_at;
            if self
                .registry
                .notify_session(device_id, conn.session_id, OutboundMessage::Show(show))
            {
                debug!(device_id, assignment_id = selected.id, content_id = selected.content_id, "Pushed show");
                states.insert(
                    device_id,
                    DispatchState {
                        session_id: conn.session_id,
                        assignment_id: selected.id,
                        content_id: selected.content_id,
                        ends_at,
                    },
                );
                report.pushed += 1;
            } else {
                states.remove(&device_id);
                report.failed += 1;
            }
        }

        Ok(report)
    }

    /// Ticks every `interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, clock: Arc<dyn Clock>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), source = ?self.source, "Dispatch loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Dispatch loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick(clock.local_now()).await {
                        Ok(report) if report.pushed > 0 || report.failed > 0 => {
                            info!(pushed = report.pushed, failed = report.failed, expired = report.expired, "Dispatch tick");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Dispatch tick skipped, active schedules unavailable"),
                    }
                }
            }
        }
    }
}

fn show_for(assignment: &Assignment, now: NaiveDateTime) -> ShowContent {
    let date = now.date();
    ShowContent {
        assignment_id: assignment.id,
        content_id: assignment.content_id,
        content: assignment.content.clone(),
        starts_at: date.and_time(assignment.window.start),
        ends_at: date.and_time(assignment.window.end),
        priority: assignment.priority,
        mode: assignment.mode,
    }
}

/// Picks the assignment a device should show at `now` among `active`.
///
/// ## Logic:
/// 1. Only assignments whose target covers the device are considered.
/// 2. `override` candidates, if any, beat every `rotation` candidate.
/// 3. The highest priority of the remaining class wins.
/// 4. Overrides then break ties by target specificity (device, group,
///    location) and lowest id.
/// 5. Tied rotations take turns: slot `seconds since midnight / period`
///    indexes the tie set ordered the same way.
pub fn select_for_device<'a>(
    active: &'a [Assignment],
    device: &Device,
    now: NaiveDateTime,
    rotation_period: Duration,
) -> Option<&'a Assignment> {
    let covering: Vec<&Assignment> = active.iter().filter(|a| a.target.covers(device)).collect();
    let has_override = covering.iter().any(|a| a.mode == DispatchMode::Override);
    let class: Vec<&Assignment> = covering
        .into_iter()
        .filter(|a| !has_override || a.mode == DispatchMode::Override)
        .collect();

    let top = class.iter().map(|a| a.priority).max()?;
    let mut tied: Vec<&Assignment> = class.into_iter().filter(|a| a.priority == top).collect();
    tied.sort_by(|a, b| {
        b.target
            .specificity()
            .cmp(&a.target.specificity())
            .then(a.id.cmp(&b.id))
    });

    if has_override || tied.len() == 1 {
        return tied.first().copied();
    }

    let period = rotation_period.as_secs().max(1);
    let slot = u64::from(now.time().num_seconds_from_midnight()) / period;
    let index = (slot % tied.len() as u64) as usize;
    tied.get(index).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Recurrence, Target, TimeWindow};
    use crate::store::InMemoryStore;
    use chrono::{NaiveDate, NaiveTime};
    use tokio::sync::mpsc;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 3)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn assignment(id: AssignmentId, target: Target, start: u32, end: u32) -> Assignment {
        Assignment {
            id,
            content_id: id * 10,
            content: None,
            target,
            window: TimeWindow::new(
                NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
            )
            .unwrap(),
            start_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            end_date: None,
            recurrence: Recurrence::Daily,
            dates: Vec::new(),
            exceptions: Vec::new(),
            priority: 0,
            mode: DispatchMode::Rotation,
        }
    }

    fn device() -> Device {
        Device::new(5, "lobby").in_group(3).at_location(4)
    }

    #[test]
    fn override_beats_higher_priority_rotation() {
        let mut rotation = assignment(1, Target::Device(5), 9, 10);
        rotation.priority = 10;
        let mut overriding = assignment(2, Target::Location(4), 9, 10);
        overriding.mode = DispatchMode::Override;
        let active = vec![rotation, overriding];
        let picked = select_for_device(&active, &device(), at(9, 0), Duration::from_secs(60)).unwrap();
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn priority_then_specificity() {
        let mut group = assignment(1, Target::Group(3), 9, 10);
        group.priority = 5;
        let device_level = assignment(2, Target::Device(5), 9, 10);
        let active = vec![group.clone(), device_level];
        let picked = select_for_device(&active, &device(), at(9, 0), Duration::from_secs(60)).unwrap();
        assert_eq!(picked.id, 1);

        let mut o1 = assignment(3, Target::Group(3), 9, 10);
        let mut o2 = assignment(4, Target::Device(5), 9, 10);
        o1.mode = DispatchMode::Override;
        o2.mode = DispatchMode::Override;
        let active = vec![o1, o2];
        let picked = select_for_device(&active, &device(), at(9, 0), Duration::from_secs(60)).unwrap();
        assert_eq!(picked.id, 4);
    }

    #[test]
    fn tied_rotations_take_turns() {
        let active = vec![
            assignment(1, Target::Device(5), 9, 10),
            assignment(2, Target::Device(5), 9, 10),
        ];
        let period = Duration::from_secs(60);
        let first = select_for_device(&active, &device(), at(9, 0), period).unwrap().id;
        let second = select_for_device(&active, &device(), at(9, 1), period).unwrap().id;
        let third = select_for_device(&active, &device(), at(9, 2), period).unwrap().id;
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn uncovered_device_gets_nothing() {
        let active = vec![assignment(1, Target::Device(6), 9, 10)];
        assert!(select_for_device(&active, &device(), at(9, 0), Duration::from_secs(60)).is_none());
    }

    async fn connected() -> (
        Arc<ConnectionRegistry>,
        ScheduleCache,
        mpsc::UnboundedReceiver<OutboundMessage>,
        crate::core::registry::SessionGuard,
    ) {
        let store = InMemoryStore::new().with_device("tok", device());
        let cache = ScheduleCache::new();
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(store), cache.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = registry.register(tx, Some("tok")).await.unwrap();
        assert!(matches!(rx.recv().await, Some(OutboundMessage::InitSchedules(_))));
        (registry, cache, rx, guard)
    }

    #[tokio::test]
    async fn one_show_per_activation() {
        let (registry, cache, mut rx, _guard) = connected().await;
        cache.set(vec![assignment(1, Target::Device(5), 9, 10)]);
        let dispatcher = ReconciliationDispatcher::new(cache, registry, Duration::from_secs(60));

        let mut shows = 0;
        for (h, m) in [(8, 59), (9, 0), (9, 0), (9, 30), (9, 59), (10, 0), (10, 30)] {
            dispatcher.tick(at(h, m)).await.unwrap();
            while let Ok(msg) = rx.try_recv() {
                if let OutboundMessage::Show(show) = msg {
                    assert_eq!(show.assignment_id, 1);
                    assert_eq!(show.ends_at, at(10, 0));
                    shows += 1;
                }
            }
        }
        assert_eq!(shows, 1);
        assert!(dispatcher.state_of(5).is_none());
    }

    #[tokio::test]
    async fn content_change_is_pushed_again() {
        let (registry, cache, mut rx, _guard) = connected().await;
        cache.set(vec![assignment(1, Target::Device(5), 9, 11)]);
        let dispatcher = ReconciliationDispatcher::new(cache.clone(), registry, Duration::from_secs(60));

        let report = dispatcher.tick(at(9, 0)).await.unwrap();
        assert_eq!(report.pushed, 1);

        let mut changed = assignment(1, Target::Device(5), 9, 11);
        changed.content_id = 99;
        cache.add(changed);
        let report = dispatcher.tick(at(9, 30)).await.unwrap();
        assert_eq!(report.pushed, 1);

        let mut contents = Vec::new();
        while let Ok(OutboundMessage::Show(show)) = rx.try_recv() {
            contents.push(show.content_id);
        }
        assert_eq!(contents, vec![10, 99]);
    }

    #[tokio::test]
    async fn reconnect_gets_a_fresh_show() {
        let (registry, cache, _rx, guard) = connected().await;
        cache.set(vec![assignment(1, Target::Device(5), 9, 10)]);
        let dispatcher = ReconciliationDispatcher::new(cache, registry.clone(), Duration::from_secs(60));
        assert_eq!(dispatcher.tick(at(9, 0)).await.unwrap().pushed, 1);

        drop(guard);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = registry.register(tx, Some("tok")).await.unwrap();
        let _ = rx.recv().await;

        assert_eq!(dispatcher.tick(at(9, 5)).await.unwrap().pushed, 1);
        assert!(matches!(rx.recv().await, Some(OutboundMessage::Show(_))));
    }

    #[tokio::test]
    async fn store_source_reads_materialized_days() {
        let (registry, cache, _rx, _guard) = connected().await;
        let store = Arc::new(InMemoryStore::new());
        let a = assignment(0, Target::Device(5), 9, 10);
        store
            .create(&a, &[NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()])
            .await
            .unwrap();

        let dispatcher = ReconciliationDispatcher::new(cache, registry, Duration::from_secs(60))
            .with_store_source(store.clone());
        assert_eq!(dispatcher.source(), ActiveSource::Store);
        assert_eq!(dispatcher.tick(at(9, 15)).await.unwrap().pushed, 1);

        store.set_offline(true);
        assert!(dispatcher.tick(at(9, 20)).await.is_err());
    }
}
