//! # Recurrence Evaluator
//!
//! Pure functions deciding on which calendar days an assignment occurs.
//!
//! ## Logic:
//! 1. Outside `[start_date, end_date]` never occurs.
//! 2. Exception dates never occur.
//! 3. `none` occurs on the start date, or on each explicit date when dates are given.
//!    `daily` always, `weekly` on listed weekdays, `monthly` on the start date's day of month.
//! 4. Unrecognized rules never occur.

use chrono::{Datelike, Days, NaiveDate};

use crate::models::{Assignment, Recurrence};

/// Default bound for materializing open-ended recurrences.
pub const DEFAULT_HORIZON_DAYS: u64 = 366;

pub fn is_active(assignment: &Assignment, date: NaiveDate) -> bool {
    if date < assignment.start_date {
        return false;
    }
    if matches!(assignment.end_date, Some(end) if date > end) {
        return false;
    }
    if assignment.exceptions.contains(&date) {
        return false;
    }

    match &assignment.recurrence {
        Recurrence::Once if assignment.dates.is_empty() => date == assignment.start_date,
        Recurrence::Once => assignment.dates.contains(&date),
        Recurrence::Daily => true,
        Recurrence::Weekly { weekdays } => weekdays.contains(&date.weekday()),
        Recurrence::Monthly => date.day() == assignment.start_date.day(),
        Recurrence::Unrecognized => false,
    }
}

/// Occurrence dates the store materializes for `assignment` when it is
/// written on `today`.
///
/// Recurring rules are materialized from the later of the start date and
/// `today`, for at most `horizon_days`. The daily refresh rolls the horizon
/// forward with [`occurrence_dates_between`]. One-off dates are listed in full.
pub fn occurrence_dates(assignment: &Assignment, today: NaiveDate, horizon_days: u64) -> Vec<NaiveDate> {
    if let Recurrence::Once = assignment.recurrence {
        let listed = if assignment.dates.is_empty() {
            vec![assignment.start_date]
        } else {
            assignment.dates.clone()
        };
        let mut days: Vec<NaiveDate> = listed
            .into_iter()
            .filter(|day| *day >= today && is_active(assignment, *day))
            .collect();
        days.sort_unstable();
        days.dedup();
        return days;
    }

    let first = assignment.start_date.max(today);
    let cap = first
        .checked_add_days(Days::new(horizon_days))
        .unwrap_or(NaiveDate::MAX);
    occurrence_dates_between(assignment, first, cap)
}

/// Dates in `[from, through]` on which `assignment` occurs.
pub fn occurrence_dates_between(assignment: &Assignment, from: NaiveDate, through: NaiveDate) -> Vec<NaiveDate> {
    let first = assignment.start_date.max(from);
    let last = match assignment.end_date {
        Some(end) if end < through => end,
        _ => through,
    };

    first
        .iter_days()
        .take_while(|day| *day <= last)
        .filter(|day| is_active(assignment, *day))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DispatchMode, Target, TimeWindow};
    use chrono::{NaiveTime, Weekday};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn assignment(recurrence: Recurrence) -> Assignment {
        Assignment {
            id: 1,
            content_id: 7,
            content: None,
            target: Target::Device(5),
            window: TimeWindow::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            )
            .unwrap(),
            start_date: d(2025, 3, 3),
            end_date: None,
            recurrence,
            dates: Vec::new(),
            exceptions: Vec::new(),
            priority: 0,
            mode: DispatchMode::Rotation,
        }
    }

    #[test]
    fn weekly_monday_wednesday() {
        let a = assignment(Recurrence::Weekly {
            weekdays: vec![Weekday::Mon, Weekday::Wed],
        });
        // 2025-03-03 is a Monday.
        assert!(is_active(&a, d(2025, 3, 3)));
        assert!(!is_active(&a, d(2025, 3, 4)));
        assert!(is_active(&a, d(2025, 3, 5)));
        assert!(is_active(&a, d(2025, 3, 10)));
        assert!(!is_active(&a, d(2025, 3, 2)));
    }

    #[test]
    fn once_without_dates_is_the_start_date_only() {
        let a = assignment(Recurrence::Once);
        assert!(is_active(&a, d(2025, 3, 3)));
        assert!(!is_active(&a, d(2025, 3, 4)));
    }

    #[test]
    fn once_with_explicit_dates() {
        let mut a = assignment(Recurrence::Once);
        a.dates = vec![d(2025, 3, 3), d(2025, 3, 9)];
        a.end_date = Some(d(2025, 3, 9));
        assert_eq!(occurrence_dates(&a, d(2025, 3, 1), 366), a.dates);
        assert_eq!(occurrence_dates(&a, d(2025, 3, 5), 366), vec![d(2025, 3, 9)]);
    }

    #[test]
    fn monthly_follows_start_day() {
        let mut a = assignment(Recurrence::Monthly);
        a.start_date = d(2025, 1, 31);
        let days = occurrence_dates(&a, d(2025, 1, 1), 100);
        assert_eq!(days, vec![d(2025, 1, 31), d(2025, 3, 31)]);
    }

    #[test]
    fn unrecognized_never_occurs() {
        let a = assignment(Recurrence::Unrecognized);
        assert!(occurrence_dates(&a, d(2025, 3, 3), 30).is_empty());
    }

    #[test]
    fn end_date_bounds_materialization() {
        let mut a = assignment(Recurrence::Daily);
        a.end_date = Some(d(2025, 3, 7));
        assert_eq!(occurrence_dates(&a, d(2025, 3, 3), 366).len(), 5);
        a.end_date = None;
        assert_eq!(occurrence_dates(&a, d(2025, 3, 3), 10).len(), 11);
    }

    #[test]
    fn horizon_is_measured_from_today_for_old_rules() {
        let a = assignment(Recurrence::Daily);
        let today = d(2027, 6, 1);
        let days = occurrence_dates(&a, today, 10);
        assert_eq!(days.first(), Some(&today));
        assert_eq!(days.len(), 11);
    }

    #[test]
    fn between_clamps_to_start_and_end() {
        let mut a = assignment(Recurrence::Weekly {
            weekdays: vec![Weekday::Mon],
        });
        a.end_date = Some(d(2025, 3, 24));
        let days = occurrence_dates_between(&a, d(2025, 2, 1), d(2025, 12, 31));
        assert_eq!(days, vec![d(2025, 3, 3), d(2025, 3, 10), d(2025, 3, 17), d(2025, 3, 24)]);
    }

    #[test]
    fn randomized_dates_are_deterministic_and_exceptions_suppress() {
        let mut rng = StdRng::seed_from_u64(0x5157);
        let kinds = [
            Recurrence::Once,
            Recurrence::Daily,
            Recurrence::Weekly {
                weekdays: vec![Weekday::Tue, Weekday::Sat],
            },
            Recurrence::Monthly,
        ];

        for _ in 0..500 {
            let kind = kinds[rng.random_range(0..kinds.len())].clone();
            let mut a = assignment(kind);
            let offset = rng.random_range(0..400u64);
            let date = a.start_date.checked_add_days(Days::new(offset)).unwrap();

            let first = is_active(&a, date);
            assert_eq!(first, is_active(&a, date));

            a.exceptions.push(date);
            assert!(!is_active(&a, date));
        }
    }
}
