//! Candidate planning over the auxiliary indexes.
//!
//! The planner narrows the scan window before any row is touched: the time
//! index supplies an ordinal lower bound, and exact postings supply a
//! candidate list. Sampled postings never become candidates — they only
//! tighten the lower bound — and every surviving ordinal is re-verified
//! against the row store by the executor.

use crate::index::postings::{intersect, union, Postings, TimeIndex};
use crate::query::NormalizedFilters;

/// Scan instructions for one request.
#[derive(Debug, Default)]
pub struct Plan {
    /// Inclusive ordinal lower bound.
    pub lower: u64,
    /// Exclusive ordinal upper bound (the row count).
    pub upper: u64,
    /// Exact candidate ordinals, ascending. `None` means scan the range.
    pub candidates: Option<Vec<u64>>,
    /// Proven empty: the executor returns without touching rows.
    pub empty: bool,
}

impl Plan {
    fn empty_plan() -> Self {
        Self {
            empty: true,
            ..Self::default()
        }
    }
}

pub fn build_plan(
    filters: &NormalizedFilters,
    time_index: &TimeIndex,
    inv_tag: &Postings<String>,
    inv_pid: &Postings<i32>,
    row_count: u64,
) -> Plan {
    let mut lower: u64 = 0;

    if let Some(from) = filters.ts_from_ms {
        match time_index.lower_bound(from) {
            Some(ordinal) => lower = lower.max(ordinal),
            // Every indexed bucket ends before the requested start; no row
            // can match a time-bounded filter.
            None => return Plan::empty_plan(),
        }
    }

    // Exact lists intersect into candidates; sampled lists only bound the
    // scan start. Postings always record a key's first occurrence, so a key
    // with no list at all is conclusively absent either way.
    let mut exact_sets: Vec<Vec<u64>> = Vec::new();

    if let Some(alts) = &filters.tag_alts {
        let lists: Vec<&[u64]> = alts.iter().filter_map(|alt| inv_tag.get(alt)).collect();
        let merged = union(&lists);
        if merged.is_empty() {
            return Plan::empty_plan();
        }
        if inv_tag.is_exact() {
            exact_sets.push(merged);
        } else if let Some(&first) = merged.first() {
            lower = lower.max(first);
        }
    }

    if let Some(pid) = filters.pid {
        match inv_pid.get(&pid) {
            None => return Plan::empty_plan(),
            Some(list) => {
                if inv_pid.is_exact() {
                    exact_sets.push(list.to_vec());
                } else if let Some(&first) = list.first() {
                    lower = lower.max(first);
                }
            }
        }
    }

    let candidates = match exact_sets.len() {
        0 => None,
        1 => exact_sets.pop(),
        _ => {
            let mut it = exact_sets.into_iter();
            let mut acc = it.next().expect("length checked");
            for set in it {
                acc = intersect(&acc, &set);
            }
            Some(acc)
        }
    };
    if let Some(c) = &candidates {
        if c.is_empty() {
            return Plan::empty_plan();
        }
    }

    Plan {
        lower,
        upper: row_count,
        candidates,
        empty: false,
    }
}
