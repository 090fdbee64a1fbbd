//! Threadtime line recognition and row assembly.
//!
//! A matching line opens a new row; non-matching lines are continuations of
//! the previous row (stack traces, wrapped output) and are appended to its
//! message. Lines that merely look like threadtime but carry an unknown
//! priority or an out-of-range pid/tid are dropped and counted, never raised.

pub mod device;
pub mod time;

use crate::types::{Level, LogRow};
use once_cell::sync::Lazy;
use regex::Regex;
use time::{TimeAnchor, TimestampNormalizer};

/// Soft cap on a single row's message, continuations included.
pub const MAX_MSG_BYTES: usize = 64 * 1024;

// Threadtime, with the optional UID column emitted by `logcat -v uid`
// (numeric or symbolic). The tag split is at the first `": "`; tags may
// themselves contain colons.
static THREADTIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<mon>\d{2})-(?P<day>\d{2})\s+(?P<h>\d{2}):(?P<min>\d{2}):(?P<s>\d{2})\.(?P<ms>\d{3})\s+(?:\S+\s+)?(?P<pid>\d+)\s+(?P<tid>\d+)\s+(?P<level>[VDIWEF])\s+(?P<tag>.+?)\s*:\s(?P<msg>.*)$",
    )
    .unwrap()
});

// Same shape with any priority letter, used to tell a malformed row apart
// from an ordinary continuation line.
static THREADTIME_SHAPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}\.\d{3}\s+(?:\S+\s+)?\d+\s+\d+\s+[A-Za-z]\s+.+?\s*:\s",
    )
    .unwrap()
});

/// Per-stream counters reported alongside the build summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Threadtime-shaped lines dropped for an unknown level or pid/tid overflow.
    pub malformed: u64,
    /// Continuation lines that arrived before any matched row.
    pub orphans: u64,
}

/// Streaming row assembler. Feed lines in file order; every call may
/// complete (and return) the previous row.
pub struct LineParser {
    normalizer: TimestampNormalizer,
    pending: Option<LogRow>,
    stats: ParserStats,
}

impl LineParser {
    pub fn new(anchor: &TimeAnchor) -> Self {
        Self {
            normalizer: TimestampNormalizer::new(anchor),
            pending: None,
            stats: ParserStats::default(),
        }
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Consume one line at the given logical byte offset. Returns the
    /// previous row when this line closes it.
    pub fn push_line(&mut self, offset: u64, line: &str) -> Option<LogRow> {
        if let Some(caps) = THREADTIME_RE.captures(line) {
            let pid: i64 = caps["pid"].parse().unwrap_or(i64::MAX);
            let tid: i64 = caps["tid"].parse().unwrap_or(i64::MAX);
            if pid > i32::MAX as i64 || tid > i32::MAX as i64 {
                self.stats.malformed += 1;
                return self.pending.take();
            }
            let (mon, day) = (num(&caps, "mon"), num(&caps, "day"));
            let (h, min, s, ms) = (
                num(&caps, "h"),
                num(&caps, "min"),
                num(&caps, "s"),
                num(&caps, "ms"),
            );
            let ts_epoch_ms = self.normalizer.normalize(mon, day, h, min, s, ms);
            let level = Level::from_byte(caps["level"].as_bytes()[0])
                .expect("level class is restricted by the pattern");
            let row = LogRow {
                byte_offset: offset,
                ts_raw: format!(
                    "{}-{} {}:{}:{}.{}",
                    &caps["mon"], &caps["day"], &caps["h"], &caps["min"], &caps["s"], &caps["ms"]
                ),
                ts_epoch_ms,
                level,
                tag: caps["tag"].trim().to_string(),
                pid: pid as i32,
                tid: tid as i32,
                msg: caps["msg"].to_string(),
            };
            return self.pending.replace(row);
        }

        if line.trim().is_empty() {
            // Blank lines neither attach nor break continuation.
            return None;
        }

        if THREADTIME_SHAPE_RE.is_match(line) {
            // Threadtime shape with a non-canonical level: drop the row and
            // close the previous one so later continuations cannot
            // misattach.
            self.stats.malformed += 1;
            return self.pending.take();
        }

        match self.pending.as_mut() {
            Some(row) => {
                if row.msg.len() < MAX_MSG_BYTES {
                    let remaining = MAX_MSG_BYTES - row.msg.len();
                    row.msg.push('\n');
                    if line.len() < remaining {
                        row.msg.push_str(line);
                    } else {
                        let cut = floor_char_boundary(line, remaining.saturating_sub(1));
                        row.msg.push_str(&line[..cut]);
                    }
                }
            }
            None => self.stats.orphans += 1,
        }
        None
    }

    /// Flush the final pending row at end of stream.
    pub fn finish(&mut self) -> Option<LogRow> {
        self.pending.take()
    }
}

fn num(caps: &regex::Captures<'_>, name: &str) -> u32 {
    caps[name].parse().unwrap_or(0)
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> LineParser {
        LineParser::new(&TimeAnchor {
            tz: Some(chrono_tz::UTC),
            report_date: chrono::NaiveDate::from_ymd_opt(2024, 8, 24),
        })
    }

    fn drain(input: &str) -> (Vec<LogRow>, ParserStats) {
        let mut p = parser();
        let mut rows = Vec::new();
        let mut offset = 0u64;
        for line in input.lines() {
            if let Some(row) = p.push_line(offset, line) {
                rows.push(row);
            }
            offset += line.len() as u64 + 1;
        }
        if let Some(row) = p.finish() {
            rows.push(row);
        }
        (rows, p.stats())
    }

    #[test]
    fn parses_basic_rows_and_attaches_continuations() {
        let (rows, stats) = drain(
            "01-15 10:00:00.000  1 2 I MyTag: hello\n\
             01-15 10:00:00.001  1 2 E MyTag: boom\n\
             \u{20}\u{20}\u{20}\u{20}at Foo.bar(Foo.java:1)\n",
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].msg, "hello");
        assert_eq!(rows[1].msg, "boom\n    at Foo.bar(Foo.java:1)");
        assert_eq!(rows[1].level, Level::E);
        assert_eq!(stats, ParserStats::default());
    }

    #[test]
    fn byte_offsets_strictly_increase() {
        let (rows, _) = drain(
            "01-15 10:00:00.000  1 2 I A: one\n\
             01-15 10:00:00.001  1 2 I B: two\n\
             01-15 10:00:00.002  1 2 I C: three\n",
        );
        assert!(rows.windows(2).all(|w| w[0].byte_offset < w[1].byte_offset));
    }

    #[test]
    fn accepts_uid_column_numeric_and_symbolic() {
        let (rows, _) = drain(
            "12-07 02:19:18.876  1000  1675  1694 W ProcessStats: Tracking association\n\
             12-07 02:22:40.233  wifi  1404  1475 I vendor.google.wifi_ext: Setting SAR\n",
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pid, 1675);
        assert_eq!(rows[0].tid, 1694);
        assert_eq!(rows[1].pid, 1404);
        assert_eq!(rows[1].tag, "vendor.google.wifi_ext");
    }

    #[test]
    fn tag_with_colon_splits_at_first_colon_space() {
        let (rows, _) = drain("01-15 10:00:00.000  1 2 I Net:Stack: up\n");
        assert_eq!(rows[0].tag, "Net:Stack");
        assert_eq!(rows[0].msg, "up");
    }

    #[test]
    fn padded_tag_is_trimmed() {
        let (rows, _) = drain("12-08 00:40:03.963 19264 19264 I apexd   : Populating APEX database\n");
        assert_eq!(rows[0].tag, "apexd");
        assert_eq!(rows[0].msg, "Populating APEX database");
    }

    #[test]
    fn unknown_level_is_dropped_and_counted() {
        let (rows, stats) = drain(
            "01-15 10:00:00.000  1 2 I A: ok\n\
             01-15 10:00:00.001  1 2 X B: bad level\n\
             \u{20}\u{20}stray continuation\n",
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].msg, "ok");
        assert_eq!(stats.malformed, 1);
        // The continuation after the dropped row must not attach anywhere.
        assert_eq!(stats.orphans, 1);
    }

    #[test]
    fn pid_overflow_is_dropped_and_counted() {
        let (rows, stats) = drain("01-15 10:00:00.000  4294967296 2 I A: big pid\n");
        assert!(rows.is_empty());
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn blank_lines_do_not_break_continuation() {
        let (rows, _) = drain(
            "01-15 10:00:00.000  1 2 E A: first\n\
             \n\
             \u{20}\u{20}more detail\n",
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].msg, "first\n  more detail");
    }

    #[test]
    fn orphan_continuations_are_dropped() {
        let (rows, stats) = drain(
            "\u{20}\u{20}at Foo.bar(Foo.java:1)\n\
             01-15 10:00:00.000  1 2 I A: ok\n",
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(stats.orphans, 1);
    }

    #[test]
    fn message_growth_is_capped() {
        let mut p = parser();
        assert!(p
            .push_line(0, "01-15 10:00:00.000  1 2 I A: start")
            .is_none());
        let filler = "x".repeat(8 * 1024);
        for i in 0..20 {
            assert!(p.push_line(40 + i, &filler).is_none());
        }
        let row = p.finish().unwrap();
        assert!(row.msg.len() <= MAX_MSG_BYTES);
        assert!(row.msg.len() > MAX_MSG_BYTES / 2);
    }

    #[test]
    fn timestamps_are_normalized_to_utc() {
        let (rows, _) = drain("08-24 14:22:33.123  1234 5678 I Tag: msg\n");
        assert_eq!(rows[0].ts_raw, "08-24 14:22:33.123");
        let ms = rows[0].ts_epoch_ms.unwrap();
        let utc = chrono::DateTime::from_timestamp_millis(ms).unwrap();
        assert_eq!(utc.format("%m-%d %H:%M:%S%.3f").to_string(), "08-24 14:22:33.123");
    }
}
