use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{ApplicationRecord, ViewEvent};

pub const DEFAULT_WINDOW_DAYS: i64 = 30;
/// Longest trend window accepted, roughly a century.
pub const MAX_WINDOW_DAYS: i64 = 36_500;

/// Anything that can be placed on a timeline.
pub trait Timestamped {
    fn timestamp(&self) -> Option<DateTime<Utc>>;
}

impl Timestamped for ViewEvent {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.viewed_at
    }
}

impl Timestamped for ApplicationRecord {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.applied_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub date: String,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrendWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TrendWindow {
    /// `days` is clamped to `0..=MAX_WINDOW_DAYS`.
    pub fn ending_at(now: DateTime<Utc>, days: i64) -> Self {
        let span = Duration::days(days.clamp(0, MAX_WINDOW_DAYS));
        Self {
            start: now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC),
            end: now,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Counts events per UTC calendar day inside `[window_start, window_end]`.
///
/// The result is sparse and sorted by day: days without events are not
/// emitted. Events without a usable timestamp are skipped.
pub fn bucket_by_day<'a, T, I>(
    events: I,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Vec<DayCount>
where
    T: Timestamped + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let window = TrendWindow {
        start: window_start,
        end: window_end,
    };

    let mut days: BTreeMap<NaiveDate, u64> = BTreeMap::new();
    for ts in events.into_iter().filter_map(|event| event.timestamp()) {
        if window.contains(ts) {
            *days.entry(ts.date_naive()).or_insert(0) += 1;
        }
    }

    days.into_iter()
        .map(|(day, count)| DayCount {
            date: day.format("%Y-%m-%d").to_string(),
            count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn view_at(ts: Option<DateTime<Utc>>) -> ViewEvent {
        ViewEvent {
            job_id: 1,
            viewed_at: ts,
            source: None,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_bucket_by_day_groups_by_utc_date() {
        let events = vec![
            view_at(Some(at(2024, 5, 1, 9))),
            view_at(Some(at(2024, 5, 1, 23))),
            view_at(Some(at(2024, 5, 3, 0))),
        ];
        let window = TrendWindow::ending_at(at(2024, 5, 10, 12), 30);

        let buckets = bucket_by_day(&events, window.start, window.end);
        assert_eq!(
            buckets,
            vec![
                DayCount { date: "2024-05-01".into(), count: 2 },
                DayCount { date: "2024-05-03".into(), count: 1 },
            ]
        );
    }

    #[test]
    fn test_bucket_by_day_window_is_inclusive_and_bounded() {
        let now = at(2024, 5, 31, 12);
        let window = TrendWindow::ending_at(now, 30);
        let events = vec![
            view_at(Some(window.start)),
            view_at(Some(window.end)),
            view_at(Some(window.start - Duration::seconds(1))),
            view_at(Some(now + Duration::hours(1))),
        ];

        let buckets = bucket_by_day(&events, window.start, window.end);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].date, "2024-05-01");
        assert_eq!(buckets[1].date, "2024-05-31");
        assert!(buckets.iter().all(|b| b.count > 0));
    }

    #[test]
    fn test_bucket_by_day_skips_missing_timestamps() {
        let now = at(2024, 5, 31, 12);
        let window = TrendWindow::ending_at(now, 30);
        let events = vec![view_at(None), view_at(Some(at(2024, 5, 20, 8)))];

        let buckets = bucket_by_day(&events, window.start, window.end);
        assert_eq!(buckets, vec![DayCount { date: "2024-05-20".into(), count: 1 }]);
    }

    #[test]
    fn test_window_clamps_out_of_range_days() {
        let now = at(2024, 6, 15, 12);
        let wide = TrendWindow::ending_at(now, i64::MAX);
        assert_eq!(wide.start, now - Duration::days(MAX_WINDOW_DAYS));
        assert_eq!(wide.end, now);

        let negative = TrendWindow::ending_at(now, -5);
        assert_eq!(negative.start, now);
    }

    #[test]
    fn test_bucket_by_day_empty_input() {
        let now = at(2024, 5, 31, 12);
        let events: Vec<ViewEvent> = Vec::new();
        assert!(bucket_by_day(&events, now - Duration::days(30), now).is_empty());
    }
}
