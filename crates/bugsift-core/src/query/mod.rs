//! Filter normalisation, fingerprinting, and row predicates.
//!
//! Filters are canonicalised once per request: strings trimmed, empties
//! dropped, tag alternations split and sorted, timestamps resolved against
//! the report zone. The fingerprint is a stable 64-bit digest of that
//! canonical form; cursors carry it and become invalid the moment the
//! filter set changes.

pub mod cursor;
pub mod executor;
pub mod plan;

use crate::error::QueryError;
use crate::index::rows::RowMeta;
use crate::parse::time::parse_filter_timestamp;
use crate::types::{Level, LogFilters, TextMode};
use chrono_tz::Tz;
use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::debug;

const REGEX_MAX_PATTERN_LEN: usize = 1024;
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Canonical form of a request's filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedFilters {
    pub ts_from_ms: Option<i64>,
    pub ts_to_ms: Option<i64>,
    pub levels: Option<BTreeSet<Level>>,
    /// Sorted, deduplicated tag alternatives (exact match, OR semantics).
    pub tag_alts: Option<Vec<String>>,
    pub pid: Option<i32>,
    pub tid: Option<i32>,
    pub text: Option<String>,
    pub not_text: Option<String>,
    pub text_mode: TextMode,
    pub case_sensitive: bool,
}

impl NormalizedFilters {
    /// Canonicalise a request. Timestamps are interpreted in the report's
    /// local zone. Infeasible ranges are rejected before any disk access.
    pub fn from_request(filters: &LogFilters, tz: Tz) -> Result<Self, QueryError> {
        let ts_from_ms = parse_ts_field(filters.ts_from.as_deref(), tz, "tsFrom")?;
        let ts_to_ms = parse_ts_field(filters.ts_to.as_deref(), tz, "tsTo")?;
        if let (Some(from), Some(to)) = (ts_from_ms, ts_to_ms) {
            if from > to {
                return Err(QueryError::FilterInvalid("tsFrom is after tsTo".into()));
            }
        }

        let levels = filters
            .levels
            .as_ref()
            .map(|v| v.iter().copied().collect::<BTreeSet<_>>())
            .filter(|s| !s.is_empty());

        let tag_alts = filters.tag.as_deref().and_then(|raw| {
            let mut alts: Vec<String> = raw
                .split('|')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            alts.sort();
            alts.dedup();
            (!alts.is_empty()).then_some(alts)
        });

        let text = non_empty(filters.text.as_deref());
        let not_text = non_empty(filters.not_text.as_deref());
        // Text knobs are meaningless without text; canonicalise them away so
        // they cannot perturb the fingerprint.
        let (text_mode, case_sensitive) = if text.is_some() {
            (
                filters.text_mode.unwrap_or_default(),
                filters.case_sensitive.unwrap_or(false),
            )
        } else {
            (TextMode::Plain, false)
        };

        Ok(Self {
            ts_from_ms,
            ts_to_ms,
            levels,
            tag_alts,
            pid: filters.pid,
            tid: filters.tid,
            text,
            not_text,
            text_mode,
            case_sensitive,
        })
    }

    pub fn is_unfiltered(&self) -> bool {
        self == &Self::default()
    }

    /// Stable 64-bit digest of the canonical filter set.
    pub fn fingerprint(&self) -> u64 {
        let mut h = Sha256::new();
        let mut part = |key: &str, value: String| {
            h.update(key.as_bytes());
            h.update(b"=");
            h.update(value.as_bytes());
            h.update(b"\n");
        };
        part("tsFrom", fmt_opt(self.ts_from_ms));
        part("tsTo", fmt_opt(self.ts_to_ms));
        part(
            "levels",
            self.levels
                .as_ref()
                .map(|s| {
                    s.iter()
                        .map(|l| char::from(l.as_byte()).to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default(),
        );
        part(
            "tag",
            self.tag_alts
                .as_ref()
                .map(|alts| alts.join("|"))
                .unwrap_or_default(),
        );
        part("pid", fmt_opt(self.pid));
        part("tid", fmt_opt(self.tid));
        part("text", self.text.clone().unwrap_or_default());
        part("notText", self.not_text.clone().unwrap_or_default());
        part(
            "textMode",
            match self.text_mode {
                TextMode::Plain => "plain".into(),
                TextMode::Regex => "regex".into(),
            },
        );
        part("caseSensitive", self.case_sensitive.to_string());
        let digest = h.finalize();
        u64::from_le_bytes(digest[..8].try_into().expect("8-byte slice"))
    }
}

fn parse_ts_field(value: Option<&str>, tz: Tz, field: &str) -> Result<Option<i64>, QueryError> {
    match value.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => parse_filter_timestamp(s, tz)
            .map(Some)
            .ok_or_else(|| QueryError::FilterInvalid(format!("unparseable {field}: {s:?}"))),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn fmt_opt<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// predicate
// ---------------------------------------------------------------------------

enum TextMatcher {
    None,
    /// Literal alternatives, OR semantics. Lowercased when insensitive.
    Plain { alts: Vec<String>, cs: bool },
    Regex(Box<Regex>),
}

/// Compiled row predicate for one request.
pub struct Predicate {
    filters: NormalizedFilters,
    matcher: TextMatcher,
    /// Lowercased exclusion literal; always plain.
    not_text_lower: Option<String>,
}

impl Predicate {
    pub fn compile(filters: NormalizedFilters) -> Self {
        let matcher = match &filters.text {
            None => TextMatcher::None,
            Some(text) => match filters.text_mode {
                TextMode::Regex => match compile_user_regex(text, !filters.case_sensitive) {
                    Ok(re) => TextMatcher::Regex(Box::new(re)),
                    Err(reason) => {
                        // Degraded, not an error: an unusable pattern falls
                        // back to a literal search.
                        debug!(pattern = %text, %reason, "regex filter degraded to plain");
                        plain_matcher(text, filters.case_sensitive)
                    }
                },
                TextMode::Plain => plain_matcher(text, filters.case_sensitive),
            },
        };
        let not_text_lower = filters.not_text.as_ref().map(|s| s.to_lowercase());
        Self {
            filters,
            matcher,
            not_text_lower,
        }
    }

    /// Everything that can be decided without the message bytes.
    pub fn matches_meta(&self, meta: &RowMeta) -> bool {
        if let Some(levels) = &self.filters.levels {
            if !levels.contains(&meta.level) {
                return false;
            }
        }
        if let Some(pid) = self.filters.pid {
            if meta.pid != pid {
                return false;
            }
        }
        if let Some(tid) = self.filters.tid {
            if meta.tid != tid {
                return false;
            }
        }
        if let Some(alts) = &self.filters.tag_alts {
            if !alts.iter().any(|t| t == &meta.tag) {
                return false;
            }
        }
        if self.filters.ts_from_ms.is_some() || self.filters.ts_to_ms.is_some() {
            // Rows whose timestamp could not be normalised never match a
            // time-bounded filter.
            let Some(ts) = meta.ts_epoch_ms else {
                return false;
            };
            if self.filters.ts_from_ms.is_some_and(|from| ts < from) {
                return false;
            }
            if self.filters.ts_to_ms.is_some_and(|to| ts > to) {
                return false;
            }
        }
        true
    }

    pub fn needs_msg(&self) -> bool {
        !matches!(self.matcher, TextMatcher::None) || self.not_text_lower.is_some()
    }

    pub fn matches_msg(&self, msg: &str) -> bool {
        let included = match &self.matcher {
            TextMatcher::None => true,
            TextMatcher::Plain { alts, cs } => {
                if *cs {
                    alts.iter().any(|a| msg.contains(a.as_str()))
                } else {
                    let lower = msg.to_lowercase();
                    alts.iter().any(|a| lower.contains(a.as_str()))
                }
            }
            TextMatcher::Regex(re) => re.is_match(msg),
        };
        if !included {
            return false;
        }
        match &self.not_text_lower {
            None => true,
            Some(excl) => !msg.to_lowercase().contains(excl.as_str()),
        }
    }

    pub fn filters(&self) -> &NormalizedFilters {
        &self.filters
    }
}

fn plain_matcher(text: &str, case_sensitive: bool) -> TextMatcher {
    // A literal `|` in plain mode expresses OR over literal alternatives;
    // this is how multi-chip filters arrive.
    let alts: Vec<String> = text
        .split('|')
        .filter(|s| !s.is_empty())
        .map(|s| {
            if case_sensitive {
                s.to_string()
            } else {
                s.to_lowercase()
            }
        })
        .collect();
    if alts.is_empty() {
        return TextMatcher::None;
    }
    TextMatcher::Plain {
        alts,
        cs: case_sensitive,
    }
}

/// Compile a user-supplied pattern with guardrails: bounded length, bounded
/// compiled size, and a blocklist of catastrophic-backtracking shapes.
fn compile_user_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, String> {
    if pattern.len() > REGEX_MAX_PATTERN_LEN {
        return Err(format!(
            "pattern longer than {REGEX_MAX_PATTERN_LEN} bytes"
        ));
    }
    if has_nested_quantifier(pattern) {
        return Err("nested quantifier".into());
    }
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| e.to_string())
}

/// Reject shapes like `(a+)+` and `(.*)*`.
fn has_nested_quantifier(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b')' && i + 1 < bytes.len() && matches!(bytes[i + 1], b'+' | b'*') {
            // Group closed by a quantifier: does the group body end with one?
            if i >= 1 && matches!(bytes[i - 1], b'+' | b'*') {
                return true;
            }
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Level;

    fn meta(level: Level, pid: i32, tid: i32, tag: &str, ts: Option<i64>) -> RowMeta {
        RowMeta {
            byte_offset: 0,
            ts_epoch_ms: ts,
            level,
            pid,
            tid,
            ts_raw: "08-24 14:22:33.123".into(),
            tag: tag.into(),
        }
    }

    fn normalized(filters: LogFilters) -> NormalizedFilters {
        NormalizedFilters::from_request(&filters, chrono_tz::UTC).unwrap()
    }

    #[test]
    fn fingerprint_is_stable_and_order_insensitive() {
        let a = normalized(LogFilters {
            tag: Some("B|A".into()),
            levels: Some(vec![Level::E, Level::W]),
            ..Default::default()
        });
        let b = normalized(LogFilters {
            tag: Some("A|B".into()),
            levels: Some(vec![Level::W, Level::E]),
            ..Default::default()
        });
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = normalized(LogFilters {
            tag: Some("A|C".into()),
            ..Default::default()
        });
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn empty_and_absent_filters_normalize_alike() {
        let a = normalized(LogFilters::default());
        let b = normalized(LogFilters {
            tag: Some("  ".into()),
            text: Some("".into()),
            levels: Some(vec![]),
            ..Default::default()
        });
        assert_eq!(a, b);
        assert!(b.is_unfiltered());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn infeasible_range_is_rejected() {
        let err = NormalizedFilters::from_request(
            &LogFilters {
                ts_from: Some("2024-08-24 11:00:00".into()),
                ts_to: Some("2024-08-24 10:00:00".into()),
                ..Default::default()
            },
            chrono_tz::UTC,
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::FilterInvalid(_)));
    }

    #[test]
    fn unparseable_timestamp_is_rejected() {
        let err = NormalizedFilters::from_request(
            &LogFilters {
                ts_from: Some("yesterday-ish".into()),
                ..Default::default()
            },
            chrono_tz::UTC,
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::FilterInvalid(_)));
    }

    #[test]
    fn meta_predicate_covers_level_pid_tid_tag() {
        let pred = Predicate::compile(normalized(LogFilters {
            levels: Some(vec![Level::E]),
            tag: Some("A|C".into()),
            pid: Some(10),
            ..Default::default()
        }));
        assert!(pred.matches_meta(&meta(Level::E, 10, 1, "A", None)));
        assert!(pred.matches_meta(&meta(Level::E, 10, 9, "C", None)));
        assert!(!pred.matches_meta(&meta(Level::W, 10, 1, "A", None)));
        assert!(!pred.matches_meta(&meta(Level::E, 11, 1, "A", None)));
        assert!(!pred.matches_meta(&meta(Level::E, 10, 1, "B", None)));
        assert!(!pred.needs_msg());
    }

    #[test]
    fn tag_match_is_exact_not_substring() {
        let pred = Predicate::compile(normalized(LogFilters {
            tag: Some("Net".into()),
            ..Default::default()
        }));
        assert!(pred.matches_meta(&meta(Level::I, 1, 1, "Net", None)));
        assert!(!pred.matches_meta(&meta(Level::I, 1, 1, "Network", None)));
    }

    #[test]
    fn rows_without_timestamps_fail_time_filters() {
        let pred = Predicate::compile(normalized(LogFilters {
            ts_from: Some("2024-08-24 00:00:00".into()),
            ..Default::default()
        }));
        assert!(!pred.matches_meta(&meta(Level::I, 1, 1, "A", None)));
        let in_range = parse_filter_timestamp("2024-08-24 10:00:00", chrono_tz::UTC).unwrap();
        assert!(pred.matches_meta(&meta(Level::I, 1, 1, "A", Some(in_range))));
    }

    #[test]
    fn plain_text_or_and_exclusion() {
        let pred = Predicate::compile(normalized(LogFilters {
            text: Some("apple|Cherry".into()),
            not_text: Some("banana".into()),
            ..Default::default()
        }));
        assert!(pred.needs_msg());
        assert!(pred.matches_msg("an APPLE a day"));
        assert!(pred.matches_msg("cherry pie"));
        assert!(!pred.matches_msg("apple BANANA smoothie"));
        assert!(!pred.matches_msg("plain porridge"));
    }

    #[test]
    fn case_sensitive_plain_match() {
        let pred = Predicate::compile(normalized(LogFilters {
            text: Some("HELLO".into()),
            case_sensitive: Some(true),
            ..Default::default()
        }));
        assert!(pred.matches_msg("HELLO CHERRY"));
        assert!(!pred.matches_msg("hello apple"));
    }

    #[test]
    fn regex_mode_compiles_and_matches() {
        let pred = Predicate::compile(normalized(LogFilters {
            text: Some(r"AN\w in".into()),
            text_mode: Some(TextMode::Regex),
            ..Default::default()
        }));
        assert!(pred.matches_msg("ANR in com.foo"));
        assert!(!pred.matches_msg("nothing to see"));
    }

    #[test]
    fn broken_regex_degrades_to_plain() {
        let pred = Predicate::compile(normalized(LogFilters {
            text: Some("boom(".into()),
            text_mode: Some(TextMode::Regex),
            ..Default::default()
        }));
        assert!(pred.matches_msg("went boom( today"));
        assert!(!pred.matches_msg("quiet day"));
    }

    #[test]
    fn redos_shapes_are_refused_by_the_compiler() {
        assert!(compile_user_regex("(a+)+", true).is_err());
        assert!(compile_user_regex("(.*)*", true).is_err());
        assert!(compile_user_regex("hello.*world", true).is_ok());
        let long = "a".repeat(REGEX_MAX_PATTERN_LEN + 1);
        assert!(compile_user_regex(&long, true).is_err());
    }
}
