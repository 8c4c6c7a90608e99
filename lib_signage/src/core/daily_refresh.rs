//! # Daily Refresh
//!
//! Rebuilds the schedule cache once per local day.
//!
//! ## Core Responsibilities:
//! - **Startup load:** the cache is filled for today before the first wait.
//! - **Boundary wake-up:** sleeps until the next local midnight plus a small
//!   epsilon, computed in the configured IANA zone so DST days are handled.
//! - **Rolling horizon:** before each rebuild the store materializes the
//!   occurrence dates of recurring assignments up to `horizon_days` ahead.
//! - **Resync:** after a successful rebuild every connected monitor gets a
//!   fresh `init_schedules`.
//! - **Failure policy:** a failed query is logged and the stale cache is kept
//!   until the next boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::clock::Clock;
use super::recurrence;
use super::registry::ConnectionRegistry;
use super::schedule_cache::ScheduleCache;
use crate::store::{AssignmentStore, StoreError};

pub const DEFAULT_EPSILON: Duration = Duration::from_secs(5);

pub struct DailyRefresh {
    store: Arc<dyn AssignmentStore>,
    cache: ScheduleCache,
    registry: Arc<ConnectionRegistry>,
    clock: Arc<dyn Clock>,
    epsilon: Duration,
    horizon_days: u64,
}

impl DailyRefresh {
    pub fn new(
        store: Arc<dyn AssignmentStore>,
        cache: ScheduleCache,
        registry: Arc<ConnectionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            clock,
            epsilon: DEFAULT_EPSILON,
            horizon_days: recurrence::DEFAULT_HORIZON_DAYS,
        }
    }

    pub fn with_horizon(mut self, horizon_days: u64) -> Self {
        self.horizon_days = horizon_days;
        self
    }

    pub fn with_epsilon(mut self, epsilon: Duration) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Replaces the cache with the assignments occurring on `date` and
    /// resyncs connected monitors. Returns the new cache size.
    pub async fn refresh_for(&self, date: NaiveDate) -> Result<usize, StoreError> {
        let through = date
            .checked_add_days(Days::new(self.horizon_days))
            .unwrap_or(NaiveDate::MAX);
        match self.store.extend_days(date, through).await {
            Ok(added) => info!(%through, added, "Occurrence horizon extended"),
            Err(e) => warn!(%date, error = %e, "Could not extend occurrence horizon"),
        }

        let rows = self.store.assignments_active_on(date).await?;
        let today: Vec<_> = rows
            .into_iter()
            .filter(|a| recurrence::is_active(a, date))
            .collect();
        let count = today.len();
        self.cache.set(today);
        let resynced = self.registry.resync_all();
        info!(%date, schedules = count, resynced, "Schedule cache rebuilt");
        Ok(count)
    }

    async fn refresh_logged(&self, date: NaiveDate) {
        if let Err(e) = self.refresh_for(date).await {
            error!(%date, error = %e, "Schedule cache rebuild failed, keeping previous snapshot");
        }
    }

    /// Loads today, then rebuilds at every local-day boundary until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.refresh_logged(self.clock.now().date_naive()).await;

        loop {
            let now = self.clock.now();
            let wake = next_refresh_at(now, self.epsilon);
            let wait = (wake - now).to_std().unwrap_or(Duration::ZERO);
            info!(next_refresh = %wake, "Daily refresh scheduled");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Daily refresh stopped");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    self.refresh_logged(self.clock.now().date_naive()).await;
                }
            }
        }
    }
}

/// The first instant of the next local day in `now`'s zone, plus `epsilon`.
pub fn next_refresh_at(now: DateTime<Tz>, epsilon: Duration) -> DateTime<Tz> {
    let epsilon = TimeDelta::from_std(epsilon).unwrap_or(TimeDelta::zero());
    match now.date_naive().succ_opt() {
        Some(tomorrow) => start_of_day(&now.timezone(), tomorrow) + epsilon,
        None => now + epsilon,
    }
}

/// First valid instant of `date` in `tz`.
///
/// An ambiguous midnight resolves to the earlier instant. A midnight skipped
/// by a DST jump resolves to the first local minute that exists after it.
fn start_of_day(tz: &Tz, date: NaiveDate) -> DateTime<Tz> {
    let midnight = date.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => (1..=24 * 60)
            .find_map(|m| tz.from_local_datetime(&(midnight + TimeDelta::minutes(m))).earliest())
            .unwrap_or_else(|| tz.from_utc_datetime(&midnight)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::models::{Assignment, Device, DispatchMode, Recurrence, Target, TimeWindow};
    use crate::protocol::OutboundMessage;
    use crate::store::InMemoryStore;
    use tokio::sync::mpsc;

    fn tz(name: &str) -> Tz {
        name.parse().unwrap()
    }

    #[test]
    fn next_boundary_is_local_midnight_plus_epsilon() {
        let athens = tz("Europe/Athens");
        let now = athens.with_ymd_and_hms(2025, 3, 3, 14, 30, 0).unwrap();
        let next = next_refresh_at(now, Duration::from_secs(5));
        assert_eq!(next.naive_local().to_string(), "2025-03-04 00:00:05");
    }

    #[test]
    fn skipped_midnight_resolves_to_first_valid_instant() {
        // Brazil moved clocks from 00:00 to 01:00 on 2018-11-04.
        let sao_paulo = tz("America/Sao_Paulo");
        let now = sao_paulo.with_ymd_and_hms(2018, 11, 3, 12, 0, 0).unwrap();
        let next = next_refresh_at(now, Duration::from_secs(5));
        assert_eq!(next.naive_local().to_string(), "2018-11-04 01:00:05");
    }

    #[test]
    fn dst_day_is_not_24_hours() {
        // Europe switches to summer time on 2025-03-30.
        let athens = tz("Europe/Athens");
        let now = athens.with_ymd_and_hms(2025, 3, 30, 0, 0, 5).unwrap();
        let next = next_refresh_at(now, Duration::from_secs(5));
        assert_eq!((next - now).num_hours(), 23);
    }

    fn daily(id: i64, target: Target) -> Assignment {
        Assignment {
            id,
            content_id: 7,
            content: None,
            target,
            window: TimeWindow::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
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

    #[tokio::test]
    async fn refresh_rebuilds_cache_and_resyncs() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        let store = Arc::new(InMemoryStore::new().with_device("tok", Device::new(5, "lobby")));
        store.create(&daily(0, Target::Device(5)), &[day]).await.unwrap();

        let cache = ScheduleCache::new();
        let registry = Arc::new(ConnectionRegistry::new(store.clone(), cache.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = registry.register(tx, Some("tok")).await.unwrap();
        let _ = rx.recv().await;

        let clock = Arc::new(ManualClock::new(
            tz("UTC").with_ymd_and_hms(2025, 3, 3, 0, 0, 5).unwrap(),
        ));
        let refresh = DailyRefresh::new(store.clone(), cache.clone(), registry, clock);

        assert_eq!(refresh.refresh_for(day).await.unwrap(), 1);
        assert_eq!(cache.len(), 1);
        assert!(matches!(rx.recv().await, Some(OutboundMessage::InitSchedules(v)) if v.len() == 1));

        store.set_offline(true);
        assert!(refresh.refresh_for(day.succ_opt().unwrap()).await.is_err());
        assert_eq!(cache.len(), 1, "stale cache retained on failure");
    }

    #[tokio::test]
    async fn open_ended_rule_survives_past_its_first_horizon() {
        let start = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let store = Arc::new(InMemoryStore::new());
        let first_month: Vec<_> = start.iter_days().take(30).collect();
        let stored = store.create(&daily(0, Target::Device(5)), &first_month).await.unwrap();

        let cache = ScheduleCache::new();
        let registry = Arc::new(ConnectionRegistry::new(store.clone(), cache.clone()));
        let clock = Arc::new(ManualClock::new(
            tz("UTC").with_ymd_and_hms(2026, 4, 5, 0, 0, 5).unwrap(),
        ));
        let refresh = DailyRefresh::new(store.clone(), cache.clone(), registry, clock).with_horizon(7);

        let day = NaiveDate::from_ymd_opt(2026, 4, 5).unwrap();
        assert_eq!(refresh.refresh_for(day).await.unwrap(), 1);
        assert_eq!(cache.get_by_id(stored.id).map(|a| a.id), Some(stored.id));
        let week_out = day.checked_add_days(Days::new(7)).unwrap();
        assert_eq!(store.extend_days(day, week_out).await.unwrap(), 0, "already materialized");
    }

    #[tokio::test(start_paused = true)]
    async fn run_loads_at_startup_and_stops_on_cancel() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        let store = Arc::new(InMemoryStore::new());
        store.create(&daily(0, Target::Group(1)), &[day]).await.unwrap();

        let cache = ScheduleCache::new();
        let registry = Arc::new(ConnectionRegistry::new(store.clone(), cache.clone()));
        let clock = Arc::new(ManualClock::new(
            tz("UTC").with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap(),
        ));
        let refresh = Arc::new(DailyRefresh::new(store, cache.clone(), registry, clock));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(refresh.run(cancel.clone()));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
