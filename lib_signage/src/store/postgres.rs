//! # PostgreSQL Store
//!
//! [`AssignmentStore`] and [`DeviceDirectory`] over a `deadpool-postgres`
//! pool. Occurrence dates live in `schedule_days`, one row per day, and are
//! the join key of every date-based query.
//!
//! ## Core Responsibilities:
//! - **Schema bootstrap:** idempotent `CREATE ... IF NOT EXISTS` on connect.
//! - **Transactional writes:** a schedule and its days are written together.
//! - **Rolling horizon:** recurring rows are materialized a bounded number of
//!   days ahead and extended by the daily refresh. Queries fall back to the
//!   recurrence rule for dates past a row's last materialized day.
//! - **Row decoding:** unknown recurrence kinds decode as `Unrecognized`
//!   rather than failing the whole query.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use deadpool_postgres::Transaction;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, info};

use super::{AssignmentStore, DeviceDirectory, StoreError};
use crate::connections::{Database, DbError};
use crate::core::recurrence;
use crate::models::{
    Assignment, AssignmentId, ContentDescriptor, Device, DispatchMode, Recurrence, Target,
    TimeWindow,
};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contents (
    id            BIGSERIAL PRIMARY KEY,
    title         TEXT NOT NULL,
    kind          TEXT NOT NULL,
    url           TEXT NOT NULL,
    duration_secs INTEGER
);

CREATE TABLE IF NOT EXISTS monitors (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT NOT NULL,
    token       TEXT NOT NULL UNIQUE,
    group_id    BIGINT,
    location_id BIGINT
);

CREATE TABLE IF NOT EXISTS schedules (
    id             BIGSERIAL PRIMARY KEY,
    content_id     BIGINT NOT NULL,
    monitor_id     BIGINT,
    group_id       BIGINT,
    location_id    BIGINT,
    start_time     TIME NOT NULL,
    end_time       TIME NOT NULL,
    start_date     DATE NOT NULL,
    end_date       DATE,
    recurrence     TEXT NOT NULL DEFAULT 'none',
    weekdays       SMALLINT[] NOT NULL DEFAULT '{}',
    explicit_dates DATE[] NOT NULL DEFAULT '{}',
    exceptions     DATE[] NOT NULL DEFAULT '{}',
    priority       INTEGER NOT NULL DEFAULT 0,
    mode           TEXT NOT NULL DEFAULT 'rotation',
    CONSTRAINT schedules_one_target CHECK (num_nonnulls(monitor_id, group_id, location_id) = 1),
    CONSTRAINT schedules_time_order CHECK (start_time < end_time)
);

CREATE TABLE IF NOT EXISTS schedule_days (
    schedule_id BIGINT NOT NULL REFERENCES schedules(id) ON DELETE CASCADE,
    day         DATE NOT NULL,
    PRIMARY KEY (schedule_id, day)
);

CREATE INDEX IF NOT EXISTS schedule_days_day_idx ON schedule_days (day);
"#;

const SELECT_SCHEDULES: &str = "SELECT s.id, s.content_id, s.monitor_id, s.group_id, s.location_id, \
     s.start_time, s.end_time, s.start_date, s.end_date, s.recurrence, s.weekdays, \
     s.explicit_dates, s.exceptions, s.priority, s.mode, \
     c.title, c.kind, c.url, c.duration_secs \
     FROM schedules s LEFT JOIN contents c ON c.id = s.content_id";

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::PoolError(e) => StoreError::Pool(e),
            DbError::QueryError(e) => StoreError::Postgres(e),
            DbError::ConnectionError(msg) => StoreError::Backend(msg),
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates the pool, checks connectivity and bootstraps the schema.
    pub async fn connect(database_url: &str, max_connections: usize) -> Result<Self, StoreError> {
        let db = Database::new(database_url, max_connections)?;
        db.ping().await?;
        db.bootstrap(SCHEMA).await?;
        info!("PostgreSQL schedule store ready");
        Ok(Self::new(db))
    }

    async fn query_schedules(
        &self,
        filter: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Assignment>, StoreError> {
        let client = self.db.pool.get().await?;
        let sql = format!("{SELECT_SCHEDULES} {filter} ORDER BY s.id");
        let rows = client.query(sql.as_str(), params).await?;
        rows.iter().map(row_to_assignment).collect()
    }
}

fn target_columns(target: &Target) -> (Option<i64>, Option<i64>, Option<i64>) {
    match *target {
        Target::Device(id) => (Some(id), None, None),
        Target::Group(id) => (None, Some(id), None),
        Target::Location(id) => (None, None, Some(id)),
    }
}

fn target_column(target: &Target) -> &'static str {
    match target {
        Target::Device(_) => "monitor_id",
        Target::Group(_) => "group_id",
        Target::Location(_) => "location_id",
    }
}

fn weekday_numbers(recurrence: &Recurrence) -> Vec<i16> {
    match recurrence {
        Recurrence::Weekly { weekdays } => weekdays
            .iter()
            .map(|d| d.number_from_monday() as i16)
            .collect(),
        _ => Vec::new(),
    }
}

fn weekday_from_number(n: i16) -> Option<Weekday> {
    match n {
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        7 => Some(Weekday::Sun),
        _ => None,
    }
}

fn row_to_assignment(row: &Row) -> Result<Assignment, StoreError> {
    let id: i64 = row.try_get("id")?;

    let target = match (
        row.try_get::<_, Option<i64>>("monitor_id")?,
        row.try_get::<_, Option<i64>>("group_id")?,
        row.try_get::<_, Option<i64>>("location_id")?,
    ) {
        (Some(m), None, None) => Target::Device(m),
        (None, Some(g), None) => Target::Group(g),
        (None, None, Some(l)) => Target::Location(l),
        _ => return Err(StoreError::Decode(format!("schedule {id} has no single target"))),
    };

    let start: NaiveTime = row.try_get("start_time")?;
    let end: NaiveTime = row.try_get("end_time")?;
    let window = TimeWindow::new(start, end)
        .map_err(|e| StoreError::Decode(format!("schedule {id}: {e}")))?;

    let kind: String = row.try_get("recurrence")?;
    let recurrence = match kind.parse::<Recurrence>() {
        Ok(Recurrence::Weekly { .. }) => {
            let numbers: Vec<i16> = row.try_get("weekdays")?;
            Recurrence::Weekly {
                weekdays: numbers.into_iter().filter_map(weekday_from_number).collect(),
            }
        }
        Ok(other) => other,
        Err(_) => {
            debug!(id, kind = %kind, "Stored schedule has an unrecognized recurrence");
            Recurrence::Unrecognized
        }
    };

    let mode: String = row.try_get("mode")?;
    let mode = mode
        .parse::<DispatchMode>()
        .map_err(|e| StoreError::Decode(format!("schedule {id}: {e}")))?;

    let content_id: i64 = row.try_get("content_id")?;
    let content = match row.try_get::<_, Option<String>>("title")? {
        Some(title) => Some(ContentDescriptor {
            id: content_id,
            title,
            kind: row.try_get::<_, Option<String>>("kind")?.unwrap_or_default(),
            url: row.try_get::<_, Option<String>>("url")?.unwrap_or_default(),
            duration_secs: row.try_get("duration_secs")?,
        }),
        None => None,
    };

    Ok(Assignment {
        id,
        content_id,
        content,
        target,
        window,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        recurrence,
        dates: row.try_get("explicit_dates")?,
        exceptions: row.try_get("exceptions")?,
        priority: row.try_get("priority")?,
        mode,
    })
}

/// Matches rows with a materialized day in `days_param` or whose
/// materialization stops before `last_param`. Rows selected by the second arm
/// are narrowed with [`recurrence::is_active`] afterwards.
fn occurs_on_any(days_param: &str, last_param: &str) -> String {
    format!(
        "(EXISTS (SELECT 1 FROM schedule_days d WHERE d.schedule_id = s.id AND d.day = ANY({days_param})) \
         OR (s.recurrence <> 'none' AND s.start_date <= {last_param} \
             AND NOT EXISTS (SELECT 1 FROM schedule_days d WHERE d.schedule_id = s.id AND d.day >= {last_param})))"
    )
}

async fn replace_days(
    client: &Transaction<'_>,
    id: AssignmentId,
    days: &[NaiveDate],
) -> Result<(), StoreError> {
    client
        .execute("DELETE FROM schedule_days WHERE schedule_id = $1", &[&id])
        .await?;
    client
        .execute(
            "INSERT INTO schedule_days (schedule_id, day) SELECT $1, unnest($2::date[])",
            &[&id, &days],
        )
        .await?;
    Ok(())
}

#[async_trait]
impl AssignmentStore for PgStore {
    async fn create(
        &self,
        assignment: &Assignment,
        days: &[NaiveDate],
    ) -> Result<Assignment, StoreError> {
        let id = {
            let mut client = self.db.pool.get().await?;
            let tx = client.transaction().await?;
            let (monitor_id, group_id, location_id) = target_columns(&assignment.target);
            let weekdays = weekday_numbers(&assignment.recurrence);
            let row = tx
                .query_one(
                    "INSERT INTO schedules (content_id, monitor_id, group_id, location_id, \
                     start_time, end_time, start_date, end_date, recurrence, weekdays, \
                     explicit_dates, exceptions, priority, mode) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
                     RETURNING id",
                    &[
                        &assignment.content_id,
                        &monitor_id,
                        &group_id,
                        &location_id,
                        &assignment.window.start,
                        &assignment.window.end,
                        &assignment.start_date,
                        &assignment.end_date,
                        &assignment.recurrence.kind(),
                        &weekdays,
                        &assignment.dates,
                        &assignment.exceptions,
                        &assignment.priority,
                        &mode_name(assignment.mode),
                    ],
                )
                .await?;
            let id: i64 = row.try_get(0)?;
            replace_days(&tx, id, days).await?;
            tx.commit().await?;
            id
        };
        debug!(id, days = days.len(), "Schedule persisted");
        self.get(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn find_conflicts(
        &self,
        target: &Target,
        days: &[NaiveDate],
        window: &TimeWindow,
        exclude: &[AssignmentId],
    ) -> Result<Vec<Assignment>, StoreError> {
        let Some(last) = days.iter().max().copied() else {
            return Ok(Vec::new());
        };
        let filter = format!(
            "WHERE s.{} = $1 AND s.start_time < $2 AND s.end_time > $3 \
             AND NOT (s.id = ANY($5)) AND {}",
            target_column(target),
            occurs_on_any("$4", "$6")
        );
        let target_id = target.id();
        let rows = self
            .query_schedules(&filter, &[&target_id, &window.end, &window.start, &days, &exclude, &last])
            .await?;
        Ok(rows
            .into_iter()
            .filter(|a| days.iter().any(|d| recurrence::is_active(a, *d)))
            .collect())
    }

    async fn assignments_active_on(&self, date: NaiveDate) -> Result<Vec<Assignment>, StoreError> {
        let days = vec![date];
        let filter = format!("WHERE {}", occurs_on_any("$1", "$2"));
        let rows = self.query_schedules(&filter, &[&days, &date]).await?;
        Ok(rows
            .into_iter()
            .filter(|a| recurrence::is_active(a, date))
            .collect())
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

    async fn extend_days(&self, from: NaiveDate, through: NaiveDate) -> Result<usize, StoreError> {
        let recurring = self
            .query_schedules(
                "WHERE s.recurrence <> 'none' AND s.start_date <= $2 \
                 AND (s.end_date IS NULL OR s.end_date >= $1)",
                &[&from, &through],
            )
            .await?;

        let mut client = self.db.pool.get().await?;
        let tx = client.transaction().await?;
        let mut added = 0;
        for assignment in &recurring {
            let days = recurrence::occurrence_dates_between(assignment, from, through);
            if days.is_empty() {
                continue;
            }
            added += tx
                .execute(
                    "INSERT INTO schedule_days (schedule_id, day) SELECT $1, unnest($2::date[]) \
                     ON CONFLICT DO NOTHING",
                    &[&assignment.id, &days],
                )
                .await?;
        }
        tx.commit().await?;
        debug!(rows = recurring.len(), added, %through, "Occurrence horizon extended");
        Ok(added as usize)
    }

    async fn update_batch(
        &self,
        batch: &[(Assignment, Vec<NaiveDate>)],
    ) -> Result<Vec<Assignment>, StoreError> {
        {
            let mut client = self.db.pool.get().await?;
            let tx = client.transaction().await?;
            for (assignment, days) in batch {
                let (monitor_id, group_id, location_id) = target_columns(&assignment.target);
                let weekdays = weekday_numbers(&assignment.recurrence);
                let changed = tx
                    .execute(
                        "UPDATE schedules SET content_id = $2, monitor_id = $3, group_id = $4, \
                         location_id = $5, start_time = $6, end_time = $7, start_date = $8, \
                         end_date = $9, recurrence = $10, weekdays = $11, explicit_dates = $12, \
                         exceptions = $13, priority = $14, mode = $15 WHERE id = $1",
                        &[
                            &assignment.id,
                            &assignment.content_id,
                            &monitor_id,
                            &group_id,
                            &location_id,
                            &assignment.window.start,
                            &assignment.window.end,
                            &assignment.start_date,
                            &assignment.end_date,
                            &assignment.recurrence.kind(),
                            &weekdays,
                            &assignment.dates,
                            &assignment.exceptions,
                            &assignment.priority,
                            &mode_name(assignment.mode),
                        ],
                    )
                    .await?;
                if changed == 0 {
                    // Dropping the transaction rolls it back.
                    return Err(StoreError::NotFound(assignment.id));
                }
                replace_days(&tx, assignment.id, days).await?;
            }
            tx.commit().await?;
        }

        let mut updated = Vec::with_capacity(batch.len());
        for (assignment, _) in batch {
            let fresh = self
                .get(assignment.id)
                .await?
                .ok_or(StoreError::NotFound(assignment.id))?;
            updated.push(fresh);
        }
        Ok(updated)
    }

    async fn delete(&self, id: AssignmentId) -> Result<Assignment, StoreError> {
        let existing = self.get(id).await?.ok_or(StoreError::NotFound(id))?;
        let client = self.db.pool.get().await?;
        let removed = client
            .execute("DELETE FROM schedules WHERE id = $1", &[&id])
            .await?;
        if removed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(existing)
    }

    async fn get(&self, id: AssignmentId) -> Result<Option<Assignment>, StoreError> {
        let mut rows = self.query_schedules("WHERE s.id = $1", &[&id]).await?;
        Ok(rows.pop())
    }
}

#[async_trait]
impl DeviceDirectory for PgStore {
    async fn resolve_token(&self, token: &str) -> Result<Option<Device>, StoreError> {
        let client = self.db.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, name, group_id, location_id FROM monitors WHERE token = $1",
                &[&token],
            )
            .await?;
        row.map(|row| -> Result<Device, StoreError> {
            Ok(Device {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                group_id: row.try_get("group_id")?,
                location_id: row.try_get("location_id")?,
            })
        })
        .transpose()
    }
}

fn mode_name(mode: DispatchMode) -> &'static str {
    match mode {
        DispatchMode::Rotation => "rotation",
        DispatchMode::Override => "override",
    }
}
