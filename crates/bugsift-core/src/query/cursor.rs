//! Cursor and response shapes for paginated queries.

use crate::cache::LevelCounts;
use crate::types::LogRow;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorDirection {
    #[default]
    Forward,
    Backward,
}

/// Opaque pagination token. `position` is the ordinal of the boundary row
/// already delivered: forward resumes after it, backward before it. The
/// fingerprint pins the cursor to the filter set that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCursor {
    pub position: u64,
    pub direction: CursorDirection,
    pub filter_hash: u64,
}

impl QueryCursor {
    pub fn new(position: u64, direction: CursorDirection, filter_hash: u64) -> Self {
        Self {
            position,
            direction,
            filter_hash,
        }
    }
}

/// One page of results. Rows are always in ascending byte-offset order,
/// whatever the paging direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub rows: Vec<LogRow>,
    pub next_cursor: Option<QueryCursor>,
    pub prev_cursor: Option<QueryCursor>,
    pub has_more_next: bool,
    pub has_more_prev: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_total: Option<u64>,
    /// Position of the page's end within the full store, 0.0–1.0.
    pub position_ratio: f32,
}

/// Aggregate statistics, either for the whole store or for a filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogcatStats {
    pub total_rows: u64,
    /// Present when the request carried filters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered_rows: Option<u64>,
    pub min_timestamp_ms: Option<i64>,
    pub max_timestamp_ms: Option<i64>,
    pub min_ts_display: Option<String>,
    pub max_ts_display: Option<String>,
    pub level_counts: LevelCounts,
}
