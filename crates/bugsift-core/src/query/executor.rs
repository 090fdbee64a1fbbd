//! The query executor: stats, cursor pagination, and time jumps, served
//! entirely from a committed cache.
//!
//! All responses are ordered by ascending byte offset regardless of paging
//! direction. Cursors are stateless: each request re-validates the
//! fingerprint and the position against the row store before trusting them.

use crate::cache::{
    self, CacheConfig, CacheSummary, LevelCounts, ReportIdentity, INV_PID_FILE, INV_TAG_FILE,
    ROWS_FILE, TIME_INDEX_FILE,
};
use crate::error::{CacheError, QueryError};
use crate::index::postings::{Postings, TimeIndex};
use crate::index::rows::RowReader;
use crate::parse::time::parse_filter_timestamp;
use crate::query::cursor::{CursorDirection, LogcatStats, QueryCursor, QueryResponse};
use crate::query::plan::{build_plan, Plan};
use crate::query::{NormalizedFilters, Predicate};
use crate::types::{LogFilters, LogRow};
use chrono_tz::Tz;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct QueryExecutor {
    dir: PathBuf,
    summary: CacheSummary,
    rows: RowReader,
    time_index: TimeIndex,
    inv_tag: Postings<String>,
    inv_pid: Postings<i32>,
}

impl QueryExecutor {
    /// Open the committed cache for a report path.
    ///
    /// Never re-reads the report itself. Missing or mismatched caches are
    /// `CacheStale`; corrupt artifacts are deleted and also reported stale,
    /// inviting a re-parse.
    pub fn open(cfg: &CacheConfig, report_path: &Path) -> Result<Self, QueryError> {
        let identity = ReportIdentity::of(report_path)?;
        let dir = cfg.dir_for(&identity);
        let summary = cache::open_summary(&dir, &identity)?;
        let (rows, time_index, inv_tag, inv_pid) = match Self::open_artifacts(&dir) {
            Ok(parts) => parts,
            Err(CacheError::Corrupt(msg)) => {
                cache::discard(&dir)?;
                return Err(CacheError::Stale(format!("cache discarded: {msg}")).into());
            }
            Err(e) => return Err(e.into()),
        };
        debug!(dir = %dir.display(), rows = rows.len(), "query executor ready");
        Ok(Self {
            dir,
            summary,
            rows,
            time_index,
            inv_tag,
            inv_pid,
        })
    }

    fn open_artifacts(
        dir: &Path,
    ) -> Result<(RowReader, TimeIndex, Postings<String>, Postings<i32>), CacheError> {
        let rows = RowReader::open(&dir.join(ROWS_FILE))?;
        let time_index = TimeIndex::load(&dir.join(TIME_INDEX_FILE))?;
        let inv_tag = Postings::load(&dir.join(INV_TAG_FILE))?;
        let inv_pid = Postings::load(&dir.join(INV_PID_FILE))?;
        Ok((rows, time_index, inv_tag, inv_pid))
    }

    pub fn summary(&self) -> &CacheSummary {
        &self.summary
    }

    fn tz(&self) -> Tz {
        self.summary
            .time_zone
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(chrono_tz::UTC)
    }

    fn normalize(&self, filters: &LogFilters) -> Result<NormalizedFilters, QueryError> {
        NormalizedFilters::from_request(filters, self.tz())
    }

    /// A read error mid-query means the cache can no longer be trusted:
    /// drop it and report stale.
    fn corrupt_to_stale(&self, e: CacheError) -> QueryError {
        match e {
            CacheError::Corrupt(msg) => {
                let _ = cache::discard(&self.dir);
                CacheError::Stale(format!("cache discarded: {msg}")).into()
            }
            other => other.into(),
        }
    }

    // -- stats --------------------------------------------------------------

    pub fn stats(&mut self, filters: &LogFilters) -> Result<LogcatStats, QueryError> {
        let nf = self.normalize(filters)?;
        if nf.is_unfiltered() {
            return Ok(LogcatStats {
                total_rows: self.summary.total_rows,
                filtered_rows: None,
                min_timestamp_ms: self.summary.min_ts_ms,
                max_timestamp_ms: self.summary.max_ts_ms,
                min_ts_display: self.summary.min_ts_display.clone(),
                max_ts_display: self.summary.max_ts_display.clone(),
                level_counts: self.summary.level_counts,
            });
        }

        let plan = self.plan_for(&nf);
        let pred = Predicate::compile(nf);
        let mut counts = LevelCounts::default();
        let mut matched: u64 = 0;
        let mut min_ts: Option<(i64, String)> = None;
        let mut max_ts: Option<(i64, String)> = None;

        if !plan.empty {
            let mut walk = Walk::forward(&plan, plan.lower);
            while let Some(ordinal) = walk.next() {
                let meta = self
                    .rows
                    .get_meta(ordinal)
                    .map_err(|e| self.corrupt_to_stale(e))?;
                if !pred.matches_meta(&meta) {
                    continue;
                }
                if pred.needs_msg() {
                    let row = self
                        .rows
                        .get(ordinal)
                        .map_err(|e| self.corrupt_to_stale(e))?;
                    if !pred.matches_msg(&row.msg) {
                        continue;
                    }
                }
                matched += 1;
                counts.bump(meta.level);
                if let Some(ts) = meta.ts_epoch_ms {
                    if min_ts.as_ref().is_none_or(|(m, _)| ts < *m) {
                        min_ts = Some((ts, meta.ts_raw.clone()));
                    }
                    if max_ts.as_ref().is_none_or(|(m, _)| ts > *m) {
                        max_ts = Some((ts, meta.ts_raw.clone()));
                    }
                }
            }
        }

        Ok(LogcatStats {
            total_rows: self.summary.total_rows,
            filtered_rows: Some(matched),
            min_timestamp_ms: min_ts.as_ref().map(|(ts, _)| *ts),
            max_timestamp_ms: max_ts.as_ref().map(|(ts, _)| *ts),
            min_ts_display: min_ts.map(|(_, raw)| raw),
            max_ts_display: max_ts.map(|(_, raw)| raw),
            level_counts: counts,
        })
    }

    // -- query --------------------------------------------------------------

    pub fn query(
        &mut self,
        filters: &LogFilters,
        cursor: Option<&QueryCursor>,
        limit: u32,
        direction: CursorDirection,
    ) -> Result<QueryResponse, QueryError> {
        let nf = self.normalize(filters)?;
        let fp = nf.fingerprint();
        self.validate_cursor(cursor, fp)?;
        let plan = self.plan_for(&nf);
        let pred = Predicate::compile(nf);
        self.page(&plan, &pred, fp, cursor, limit, direction)
    }

    /// Anchor at the first record with `ts ≥ target`, then page forward
    /// from there. Both cursors are returned so the caller can continue in
    /// either direction.
    pub fn jump_to_time(
        &mut self,
        filters: &LogFilters,
        target_time: &str,
        limit: u32,
    ) -> Result<QueryResponse, QueryError> {
        let target_ms = parse_filter_timestamp(target_time, self.tz()).ok_or_else(|| {
            QueryError::FilterInvalid(format!("unparseable targetTime: {target_time:?}"))
        })?;
        let nf = self.normalize(filters)?;
        let fp = nf.fingerprint();
        let plan = self.plan_for(&nf);
        let pred = Predicate::compile(nf);

        let Some(anchor) = self.find_time_anchor(target_ms)? else {
            return Ok(QueryResponse {
                estimated_total: estimated_total(&plan, &pred, self.rows.len()),
                ..QueryResponse::default()
            });
        };
        self.page_forward_from(&plan, &pred, fp, anchor.max(plan.lower), limit)
    }

    /// First ordinal whose timestamp reaches the target, via the time index
    /// plus a bounded row scan.
    fn find_time_anchor(&mut self, target_ms: i64) -> Result<Option<u64>, QueryError> {
        let Some(start) = self.time_index.lower_bound(target_ms) else {
            return Ok(None);
        };
        let total = self.rows.len();
        for ordinal in start..total {
            let meta = self
                .rows
                .get_meta(ordinal)
                .map_err(|e| self.corrupt_to_stale(e))?;
            if meta.ts_epoch_ms.is_some_and(|ts| ts >= target_ms) {
                return Ok(Some(ordinal));
            }
        }
        Ok(None)
    }

    // -- paging internals ---------------------------------------------------

    fn validate_cursor(&self, cursor: Option<&QueryCursor>, fp: u64) -> Result<(), QueryError> {
        let Some(c) = cursor else { return Ok(()) };
        if c.filter_hash != fp {
            return Err(QueryError::CursorInvalid("Filter changed".into()));
        }
        if c.position >= self.rows.len() {
            return Err(QueryError::CursorInvalid(format!(
                "position {} outside row store ({} records)",
                c.position,
                self.rows.len()
            )));
        }
        Ok(())
    }

    fn plan_for(&self, nf: &NormalizedFilters) -> Plan {
        build_plan(nf, &self.time_index, &self.inv_tag, &self.inv_pid, self.rows.len())
    }

    fn page(
        &mut self,
        plan: &Plan,
        pred: &Predicate,
        fp: u64,
        cursor: Option<&QueryCursor>,
        limit: u32,
        direction: CursorDirection,
    ) -> Result<QueryResponse, QueryError> {
        let total = self.rows.len();
        if plan.empty || total == 0 {
            return Ok(QueryResponse {
                estimated_total: estimated_total(plan, pred, total),
                ..QueryResponse::default()
            });
        }

        match direction {
            CursorDirection::Forward => {
                let start = cursor
                    .map(|c| c.position + 1)
                    .unwrap_or(plan.lower)
                    .max(plan.lower);
                self.page_forward_from(plan, pred, fp, start, limit)
            }
            CursorDirection::Backward => {
                let end = match cursor {
                    Some(c) if c.position == 0 => {
                        // Nothing precedes the first record.
                        return Ok(QueryResponse {
                            estimated_total: estimated_total(plan, pred, total),
                            ..QueryResponse::default()
                        });
                    }
                    Some(c) => (c.position - 1).min(total - 1),
                    None => total - 1,
                };
                self.page_backward_from(plan, pred, fp, end, limit)
            }
        }
    }

    fn page_forward_from(
        &mut self,
        plan: &Plan,
        pred: &Predicate,
        fp: u64,
        start: u64,
        limit: u32,
    ) -> Result<QueryResponse, QueryError> {
        let limit = (limit as usize).max(1);
        let total = self.rows.len();
        let (collected, has_more_next) = self.collect(pred, Walk::forward(plan, start), limit)?;

        let has_more_prev = match collected.first() {
            Some(&(first, _)) => first > plan.lower && self.any_match_below(plan, pred, first)?,
            None => start > plan.lower && self.any_match_below(plan, pred, start.min(total))?,
        };

        Ok(self.assemble(collected, fp, has_more_next, has_more_prev, plan, pred))
    }

    fn page_backward_from(
        &mut self,
        plan: &Plan,
        pred: &Predicate,
        fp: u64,
        end: u64,
        limit: u32,
    ) -> Result<QueryResponse, QueryError> {
        let limit = (limit as usize).max(1);
        let (mut collected, has_more_prev) =
            self.collect(pred, Walk::backward(plan, end), limit)?;
        collected.reverse();

        let has_more_next = match collected.last() {
            Some(&(last, _)) => self.any_match_above(plan, pred, last)?,
            None => self.any_match_above(plan, pred, end)?,
        };

        Ok(self.assemble(collected, fp, has_more_next, has_more_prev, plan, pred))
    }

    /// Gather up to `limit` matches along the walk, then keep walking just
    /// far enough to learn whether more exist in that direction.
    fn collect(
        &mut self,
        pred: &Predicate,
        mut walk: Walk<'_>,
        limit: usize,
    ) -> Result<(Vec<(u64, LogRow)>, bool), QueryError> {
        let mut out: Vec<(u64, LogRow)> = Vec::with_capacity(limit.min(1024));
        let mut more = false;
        while let Some(ordinal) = walk.next() {
            if let Some(row) = self.match_row(ordinal, pred)? {
                if out.len() < limit {
                    out.push((ordinal, row));
                } else {
                    more = true;
                    break;
                }
            }
        }
        Ok((out, more))
    }

    fn match_row(&mut self, ordinal: u64, pred: &Predicate) -> Result<Option<LogRow>, QueryError> {
        let meta = self
            .rows
            .get_meta(ordinal)
            .map_err(|e| self.corrupt_to_stale(e))?;
        if !pred.matches_meta(&meta) {
            return Ok(None);
        }
        let row = self
            .rows
            .get(ordinal)
            .map_err(|e| self.corrupt_to_stale(e))?;
        if pred.needs_msg() && !pred.matches_msg(&row.msg) {
            return Ok(None);
        }
        Ok(Some(row))
    }

    /// Any match at an ordinal strictly below `before`?
    fn any_match_below(
        &mut self,
        plan: &Plan,
        pred: &Predicate,
        before: u64,
    ) -> Result<bool, QueryError> {
        if before == 0 || before <= plan.lower {
            return Ok(false);
        }
        let mut walk = Walk::backward(plan, before - 1);
        while let Some(ordinal) = walk.next() {
            if self.match_row(ordinal, pred)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Any match at an ordinal strictly above `after`?
    fn any_match_above(
        &mut self,
        plan: &Plan,
        pred: &Predicate,
        after: u64,
    ) -> Result<bool, QueryError> {
        let mut walk = Walk::forward(plan, after + 1);
        while let Some(ordinal) = walk.next() {
            if self.match_row(ordinal, pred)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn assemble(
        &self,
        collected: Vec<(u64, LogRow)>,
        fp: u64,
        has_more_next: bool,
        has_more_prev: bool,
        plan: &Plan,
        pred: &Predicate,
    ) -> QueryResponse {
        let total = self.rows.len();
        let first = collected.first().map(|&(o, _)| o);
        let last = collected.last().map(|&(o, _)| o);

        let next_cursor = match (has_more_next, last) {
            (true, Some(last)) => Some(QueryCursor::new(last, CursorDirection::Forward, fp)),
            _ => None,
        };
        let prev_cursor = match (has_more_prev, first) {
            (true, Some(first)) => Some(QueryCursor::new(first, CursorDirection::Backward, fp)),
            _ => None,
        };

        let position_ratio = match (last, total) {
            (Some(last), total) if total > 0 => (last + 1) as f32 / total as f32,
            _ => 0.0,
        };

        QueryResponse {
            rows: collected.into_iter().map(|(_, row)| row).collect(),
            next_cursor,
            prev_cursor,
            has_more_next,
            has_more_prev,
            estimated_total: estimated_total(plan, pred, total),
            position_ratio,
        }
    }
}

fn estimated_total(plan: &Plan, pred: &Predicate, total: u64) -> Option<u64> {
    if pred.filters().is_unfiltered() {
        return Some(total);
    }
    if plan.empty {
        return Some(0);
    }
    // Candidate sets exist only when the contributing indexes are exact;
    // the count is an upper-bound estimate pending row verification.
    plan.candidates.as_ref().map(|c| c.len() as u64)
}

/// Ordinal iterator over a plan window, range- or candidate-backed.
enum Walk<'a> {
    RangeForward {
        next: u64,
        upper: u64,
    },
    RangeBackward {
        next: Option<u64>,
        lower: u64,
    },
    CandidatesForward {
        list: &'a [u64],
        idx: usize,
        upper: u64,
    },
    CandidatesBackward {
        list: &'a [u64],
        idx: usize,
        lower: u64,
    },
}

impl<'a> Walk<'a> {
    fn forward(plan: &'a Plan, start: u64) -> Self {
        let start = start.max(plan.lower);
        match &plan.candidates {
            Some(list) => {
                let idx = list.partition_point(|&o| o < start);
                Walk::CandidatesForward {
                    list,
                    idx,
                    upper: plan.upper,
                }
            }
            None => Walk::RangeForward {
                next: start,
                upper: plan.upper,
            },
        }
    }

    fn backward(plan: &'a Plan, end: u64) -> Self {
        let end = if plan.upper == 0 {
            return Walk::RangeBackward {
                next: None,
                lower: plan.lower,
            };
        } else {
            end.min(plan.upper - 1)
        };
        match &plan.candidates {
            Some(list) => {
                let idx = list.partition_point(|&o| o <= end);
                Walk::CandidatesBackward {
                    list,
                    idx,
                    lower: plan.lower,
                }
            }
            None => Walk::RangeBackward {
                next: Some(end),
                lower: plan.lower,
            },
        }
    }

    fn next(&mut self) -> Option<u64> {
        match self {
            Walk::RangeForward { next, upper } => {
                if *next >= *upper {
                    return None;
                }
                let out = *next;
                *next += 1;
                Some(out)
            }
            Walk::RangeBackward { next, lower } => {
                let cur = (*next)?;
                if cur < *lower {
                    return None;
                }
                *next = cur.checked_sub(1);
                Some(cur)
            }
            Walk::CandidatesForward { list, idx, upper } => {
                let out = *list.get(*idx)?;
                if out >= *upper {
                    return None;
                }
                *idx += 1;
                Some(out)
            }
            Walk::CandidatesBackward { list, idx, lower } => {
                if *idx == 0 {
                    return None;
                }
                let out = list[*idx - 1];
                if out < *lower {
                    return None;
                }
                *idx -= 1;
                Some(out)
            }
        }
    }
}
