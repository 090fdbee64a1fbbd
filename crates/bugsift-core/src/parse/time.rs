//! Timestamp normalisation for threadtime lines.
//!
//! Logcat timestamps carry no year and no zone. The year is anchored to the
//! report capture date and advanced by a rollover counter when the month-day
//! pair goes backwards mid-stream; the zone comes from the preamble's
//! `persist.sys.timezone`, falling back to UTC (best effort).

use chrono::{Datelike, LocalResult, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Zone and reference date derived from the bugreport preamble.
#[derive(Debug, Clone, Default)]
pub struct TimeAnchor {
    /// `None` when the preamble carried no usable timezone; conversions then
    /// assume UTC and results are best-effort.
    pub tz: Option<Tz>,
    /// Report capture date, used to pick the starting year.
    pub report_date: Option<NaiveDate>,
}

impl TimeAnchor {
    pub fn effective_tz(&self) -> Tz {
        self.tz.unwrap_or(chrono_tz::UTC)
    }

    pub fn is_best_effort(&self) -> bool {
        self.tz.is_none()
    }
}

/// Pick the candidate year (reference−1, reference, reference+1) whose date
/// lies closest to the reference date.
pub fn infer_year(mon: u32, day: u32, reference: NaiveDate) -> i32 {
    let ref_year = reference.year();
    [ref_year - 1, ref_year, ref_year + 1]
        .into_iter()
        .filter_map(|y| NaiveDate::from_ymd_opt(y, mon, day))
        .min_by_key(|d| d.signed_duration_since(reference).num_days().abs())
        .map(|d| d.year())
        .unwrap_or(ref_year)
}

/// Stateful converter for one logcat stream.
///
/// The first row fixes the year from the anchor; after that, a month-day
/// pair that sorts below its predecessor means the capture crossed a year
/// boundary and the counter advances.
pub struct TimestampNormalizer {
    tz: Tz,
    reference: NaiveDate,
    year: Option<i32>,
    prev_md: Option<(u32, u32)>,
}

impl TimestampNormalizer {
    pub fn new(anchor: &TimeAnchor) -> Self {
        Self {
            tz: anchor.effective_tz(),
            reference: anchor
                .report_date
                .unwrap_or_else(|| Local::now().date_naive()),
            year: None,
            prev_md: None,
        }
    }

    /// Convert parsed threadtime fields to UTC epoch milliseconds.
    ///
    /// Returns `None` for unrepresentable dates or times; callers record
    /// the row with an absent timestamp rather than failing.
    pub fn normalize(
        &mut self,
        mon: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
        milli: u32,
    ) -> Option<i64> {
        let year = match self.year {
            Some(mut y) => {
                if self.prev_md.is_some_and(|prev| (mon, day) < prev) {
                    y += 1;
                    self.year = Some(y);
                }
                y
            }
            None => {
                let y = infer_year(mon, day, self.reference);
                self.year = Some(y);
                y
            }
        };
        self.prev_md = Some((mon, day));

        let date = NaiveDate::from_ymd_opt(year, mon, day)?;
        let time = NaiveTime::from_hms_milli_opt(hour, min, sec, milli)?;
        local_to_epoch_ms(NaiveDateTime::new(date, time), self.tz)
    }
}

/// Resolve a naive local datetime against a zone, tolerating DST edges:
/// ambiguous times take the earlier instant, nonexistent times shift
/// forward one hour.
fn local_to_epoch_ms(naive: NaiveDateTime, tz: Tz) -> Option<i64> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc).timestamp_millis()),
        LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc).timestamp_millis()),
        LocalResult::None => {
            let adjusted = naive + chrono::Duration::hours(1);
            match tz.from_local_datetime(&adjusted) {
                LocalResult::Single(dt) => Some(dt.with_timezone(&Utc).timestamp_millis()),
                _ => None,
            }
        }
    }
}

/// Parse a filter timestamp (`YYYY-MM-DD HH:MM:SS` and close variants) in
/// the report's local zone.
pub fn parse_filter_timestamp(s: &str, tz: Tz) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    const SHAPES: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.3f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S%.3f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];
    for shape in SHAPES {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, shape) {
            return local_to_epoch_ms(naive, tz);
        }
    }
    None
}
