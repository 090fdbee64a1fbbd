//! Wire-visible data model shared by the pipeline and the host surface.
//!
//! Everything here serializes with camelCase field names; these shapes are
//! the contract the viewer consumes.

use serde::{Deserialize, Serialize};

/// Android log priority, single-letter wire form (`"V"` … `"F"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    V,
    D,
    I,
    W,
    E,
    F,
}

impl Level {
    /// Map a priority byte to a level; anything outside the canonical set
    /// is malformed.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'V' => Some(Level::V),
            b'D' => Some(Level::D),
            b'I' => Some(Level::I),
            b'W' => Some(Level::W),
            b'E' => Some(Level::E),
            b'F' => Some(Level::F),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Level::V => b'V',
            Level::D => b'D',
            Level::I => b'I',
            Level::W => b'W',
            Level::E => b'E',
            Level::F => b'F',
        }
    }

    pub fn is_error_or_fatal(self) -> bool {
        matches!(self, Level::E | Level::F)
    }
}

/// One parsed threadtime row. `byte_offset` is the row's primary key: the
/// offset of its first byte in the logical (decompressed) report stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRow {
    pub byte_offset: u64,
    /// Original `MM-DD HH:MM:SS.mmm` text, for display.
    pub ts_raw: String,
    /// Normalised UTC epoch milliseconds; absent when normalisation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts_epoch_ms: Option<i64>,
    pub level: Level,
    pub tag: String,
    pub pid: i32,
    pub tid: i32,
    /// Message text; continuation lines are appended with `\n`.
    pub msg: String,
}

/// Device identity extracted from the bugreport preamble.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub brand: String,
    pub model: String,
    pub android_version: String,
    pub api_level: i32,
    pub build_id: String,
    pub fingerprint: String,
    pub uptime_ms: i64,
    /// Report capture time, ISO 8601.
    pub report_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<BatteryInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryInfo {
    pub level: i32,
    pub temp_c: f32,
    pub status: String,
}

/// Filter set for stats/query/jump requests. Absent fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogFilters {
    /// `YYYY-MM-DD HH:MM:SS`, interpreted in the report's local timezone.
    pub ts_from: Option<String>,
    pub ts_to: Option<String>,
    pub levels: Option<Vec<Level>>,
    /// Exact tag match; `a|b|c` is an OR over alternatives.
    pub tag: Option<String>,
    pub pid: Option<i32>,
    pub tid: Option<i32>,
    pub text: Option<String>,
    /// Literal exclusion, always plain and case-insensitive.
    pub not_text: Option<String>,
    pub text_mode: Option<TextMode>,
    pub case_sensitive: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextMode {
    #[default]
    Plain,
    Regex,
}

/// Result of the parse command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseSummary {
    pub device: DeviceInfo,
    /// Total parsed rows.
    pub events: usize,
    /// Rows on tag `ActivityManager` whose message begins `ANR in `.
    pub anrs: usize,
    /// Fatal-level rows plus `AndroidRuntime` rows beginning `FATAL EXCEPTION`.
    pub crashes: usize,
    /// Rows at level E or F.
    pub ef_total: usize,
    /// `ef_total` restricted to the last five minutes of the time range.
    pub ef_recent: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_ts_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ts_ms: Option<i64>,
}

/// Build phases, in order of occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsePhase {
    Starting,
    Scanning,
    Indexing,
    Finalizing,
}

/// Progress event emitted during the build, at most every 250 ms or every
/// 1% of logical bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseProgress {
    pub phase: ParsePhase,
    pub bytes_read: u64,
    pub total_bytes: u64,
    pub rows_processed: usize,
    pub percent: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_round_trips_through_bytes() {
        for b in [b'V', b'D', b'I', b'W', b'E', b'F'] {
            assert_eq!(Level::from_byte(b).unwrap().as_byte(), b);
        }
        assert!(Level::from_byte(b'X').is_none());
        assert!(Level::from_byte(b'v').is_none());
    }

    #[test]
    fn filters_serialize_camel_case() {
        let f = LogFilters {
            ts_from: Some("2024-08-24 10:00:00".into()),
            levels: Some(vec![Level::E, Level::F]),
            not_text: Some("noise".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"tsFrom\""));
        assert!(json.contains("\"notText\""));
        assert!(json.contains("[\"E\",\"F\"]"));
    }

    #[test]
    fn filters_accept_sparse_json() {
        let f: LogFilters = serde_json::from_str(r#"{"tag":"ActivityManager"}"#).unwrap();
        assert_eq!(f.tag.as_deref(), Some("ActivityManager"));
        assert!(f.levels.is_none());
    }
}
