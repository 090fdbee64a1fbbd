//! Single-pass ingest: source → parser → row store + indexes → cache.
//!
//! The builder samples the head of the report for the time anchor, then
//! streams the whole file once, writing every artifact into a temp
//! directory that becomes visible atomically on commit. Progress events are
//! throttled; cancellation is observed between line batches.

pub mod postings;
pub mod rows;

use crate::cache::{
    self, CacheConfig, CacheSummary, LevelCounts, ReportIdentity, INV_PID_FILE, INV_TAG_FILE,
    ROWS_FILE, TIME_INDEX_FILE,
};
use crate::error::IngestError;
use crate::parse::device::DeviceScanner;
use crate::parse::LineParser;
use crate::progress::{CancelToken, ProgressSender};
use crate::source::sections::{Route, SectionTracker};
use crate::source::BugreportSource;
use crate::types::{Level, LogRow, ParsePhase, ParseProgress, ParseSummary};
use postings::{bucket_of, PostingsBuilder, TimeIndexBuilder};
use rows::RowWriter;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Head bytes sampled for the time anchor before the real pass.
const ANCHOR_SAMPLE_BYTES: u64 = 256 * 1024;
/// Lines between cancellation checks.
const CANCEL_CHECK_LINES: u64 = 4096;
/// Progress cadence: whichever of these comes first.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
const PROGRESS_PERCENT_STEP: f64 = 0.01;
/// "Recent" window for the error/fatal counter.
const EF_RECENT_WINDOW_MS: i64 = 5 * 60 * 1000;

pub struct IndexBuilder {
    cfg: CacheConfig,
    progress: Option<ProgressSender>,
    cancel: CancelToken,
}

impl IndexBuilder {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            progress: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Parse the report and publish its cache. A fresh cache for the same
    /// report identity short-circuits without re-reading the input.
    pub fn build(self, path: &Path) -> Result<ParseSummary, IngestError> {
        if !path.exists() {
            return Err(IngestError::BugreportNotFound(path.to_path_buf()));
        }
        let identity = ReportIdentity::of(path)?;
        let final_dir = self.cfg.dir_for(&identity);

        if let Ok(summary) = cache::open_summary(&final_dir, &identity) {
            debug!(report = %path.display(), "reusing committed cache");
            return Ok(summary.to_parse_summary());
        }

        std::fs::create_dir_all(&self.cfg.root).map_err(crate::error::CacheError::Io)?;
        let temp_dir = self.cfg.temp_dir_for(&identity);
        if temp_dir.exists() {
            std::fs::remove_dir_all(&temp_dir).map_err(crate::error::CacheError::Io)?;
        }
        std::fs::create_dir_all(&temp_dir).map_err(crate::error::CacheError::Io)?;

        match self.run(path, &identity, &temp_dir, &final_dir) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&temp_dir);
                Err(e)
            }
        }
    }

    fn run(
        &self,
        path: &Path,
        identity: &ReportIdentity,
        temp_dir: &Path,
        final_dir: &Path,
    ) -> Result<ParseSummary, IngestError> {
        let mut source = BugreportSource::open(path)?;
        let total_bytes = source.total_bytes();
        let mut throttle = ProgressThrottle::new(self.progress.clone(), total_bytes);
        throttle.emit_now(ParsePhase::Starting, 0, 0);

        // Anchor pre-sample: the normalizer needs the zone and report date
        // before the first logcat line arrives.
        let mut device = DeviceScanner::new();
        while let Some((offset, line)) = source.next_line()? {
            device.observe(&line);
            throttle.maybe_emit(ParsePhase::Scanning, offset, 0);
            if offset >= ANCHOR_SAMPLE_BYTES {
                break;
            }
        }
        source.rewind()?;
        let anchor = device.anchor();

        let mut parser = LineParser::new(&anchor);
        let mut tracker = SectionTracker::new();
        let mut writer = RowWriter::create(&temp_dir.join(ROWS_FILE))?;
        let mut time_index = TimeIndexBuilder::new();
        let mut tags = PostingsBuilder::<String>::new("tag");
        let mut pids = PostingsBuilder::<i32>::new("pid");
        let mut counters = Counters::default();

        let mut lines: u64 = 0;
        let mut bytes_read: u64 = 0;
        while let Some((offset, line)) = source.next_line()? {
            lines += 1;
            bytes_read = offset + line.len() as u64;
            if lines % CANCEL_CHECK_LINES == 0 {
                if self.cancel.is_cancelled() {
                    return Err(IngestError::Cancelled);
                }
                throttle.maybe_emit(ParsePhase::Indexing, bytes_read, counters.total as usize);
            }

            match tracker.route(&line) {
                Route::Banner => {}
                Route::Preamble => device.observe(&line),
                Route::Logcat => {
                    if let Some(row) = parser.push_line(offset, &line) {
                        index_row(&row, &mut writer, &mut time_index, &mut tags, &mut pids, &mut counters)?;
                    }
                }
                Route::Unsectioned => {
                    device.observe(&line);
                    if let Some(row) = parser.push_line(offset, &line) {
                        index_row(&row, &mut writer, &mut time_index, &mut tags, &mut pids, &mut counters)?;
                    }
                }
            }
        }
        if let Some(row) = parser.finish() {
            index_row(&row, &mut writer, &mut time_index, &mut tags, &mut pids, &mut counters)?;
        }

        if tracker.saw_explicit_sections() && tracker.logcat_sections_seen() == 0 {
            return Err(IngestError::UnsupportedFormat(
                "bugreport contains no logcat section".into(),
            ));
        }
        if self.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        throttle.emit_now(ParsePhase::Finalizing, total_bytes, counters.total as usize);

        let total_rows = writer.finish()?;
        time_index.write(&temp_dir.join(TIME_INDEX_FILE))?;
        tags.write(&temp_dir.join(INV_TAG_FILE))?;
        pids.write(&temp_dir.join(INV_PID_FILE))?;

        let time_zone = device.timezone_name().map(str::to_string);
        let summary = counters.into_summary(
            identity.clone(),
            device.finish(),
            time_zone,
            total_rows,
            parser.stats().malformed,
            total_bytes,
        );
        cache::write_summary(temp_dir, &summary)?;
        cache::commit(temp_dir, final_dir)?;
        debug!(dir = %final_dir.display(), rows = total_rows, "cache committed");

        match cache::evict_lru(&self.cfg, Some(identity.short())) {
            Ok(report) if !report.evicted.is_empty() => {
                debug!(evicted = report.evicted.len(), bytes = report.bytes_freed, "cache eviction");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cache eviction failed"),
        }

        throttle.emit_now(ParsePhase::Finalizing, total_bytes, total_rows as usize);
        Ok(summary.to_parse_summary())
    }
}

fn index_row(
    row: &LogRow,
    writer: &mut RowWriter,
    time_index: &mut TimeIndexBuilder,
    tags: &mut PostingsBuilder<String>,
    pids: &mut PostingsBuilder<i32>,
    counters: &mut Counters,
) -> Result<(), IngestError> {
    let ordinal = writer.append(row)?;

    if let Some(ts) = row.ts_epoch_ms {
        let bucket = bucket_of(ts);
        if time_index.last_bucket().is_none_or(|last| bucket > last) {
            time_index.push(bucket, ordinal);
        }
    }
    tags.push(row.tag.clone(), ordinal);
    pids.push(row.pid, ordinal);
    counters.observe(row);
    Ok(())
}

#[derive(Default)]
struct Counters {
    total: u64,
    level_counts: LevelCounts,
    anrs: u64,
    crashes: u64,
    ef_total: u64,
    /// Error/fatal rows per second bucket; resolved into the five-minute
    /// window once the max timestamp is known.
    ef_by_sec: BTreeMap<i64, u64>,
    min_ts: Option<(i64, String)>,
    max_ts: Option<(i64, String)>,
}

impl Counters {
    fn observe(&mut self, row: &LogRow) {
        self.total += 1;
        self.level_counts.bump(row.level);

        if row.tag == "ActivityManager" && row.msg.starts_with("ANR in ") {
            self.anrs += 1;
        }
        if row.level == Level::F
            || (row.tag == "AndroidRuntime" && row.msg.starts_with("FATAL EXCEPTION"))
        {
            self.crashes += 1;
        }
        if row.level.is_error_or_fatal() {
            self.ef_total += 1;
            if let Some(ts) = row.ts_epoch_ms {
                *self.ef_by_sec.entry(ts.div_euclid(1000)).or_insert(0) += 1;
            }
        }
        if let Some(ts) = row.ts_epoch_ms {
            if self.min_ts.as_ref().is_none_or(|(m, _)| ts < *m) {
                self.min_ts = Some((ts, row.ts_raw.clone()));
            }
            if self.max_ts.as_ref().is_none_or(|(m, _)| ts > *m) {
                self.max_ts = Some((ts, row.ts_raw.clone()));
            }
        }
    }

    fn ef_recent(&self) -> u64 {
        let Some((max_ts, _)) = self.max_ts else {
            return 0;
        };
        let threshold_sec = (max_ts - EF_RECENT_WINDOW_MS).div_euclid(1000);
        self.ef_by_sec.range(threshold_sec..).map(|(_, n)| n).sum()
    }

    fn into_summary(
        self,
        identity: ReportIdentity,
        device: crate::types::DeviceInfo,
        time_zone: Option<String>,
        total_rows: u64,
        malformed: u64,
        log_bytes: u64,
    ) -> CacheSummary {
        let ef_recent = self.ef_recent();
        CacheSummary {
            schema_version: cache::SCHEMA_VERSION,
            identity,
            device,
            time_zone,
            total_rows,
            malformed,
            level_counts: self.level_counts,
            min_ts_ms: self.min_ts.as_ref().map(|(ts, _)| *ts),
            max_ts_ms: self.max_ts.as_ref().map(|(ts, _)| *ts),
            min_ts_display: self.min_ts.map(|(_, raw)| raw),
            max_ts_display: self.max_ts.map(|(_, raw)| raw),
            log_bytes,
            anrs: self.anrs,
            crashes: self.crashes,
            ef_total: self.ef_total,
            ef_recent,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

struct ProgressThrottle {
    sender: Option<ProgressSender>,
    total_bytes: u64,
    last_emit: Instant,
    last_bytes: u64,
    byte_step: u64,
}

impl ProgressThrottle {
    fn new(sender: Option<ProgressSender>, total_bytes: u64) -> Self {
        let byte_step = ((total_bytes as f64 * PROGRESS_PERCENT_STEP) as u64).max(1);
        Self {
            sender,
            total_bytes,
            last_emit: Instant::now(),
            last_bytes: 0,
            byte_step,
        }
    }

    fn maybe_emit(&mut self, phase: ParsePhase, bytes_read: u64, rows: usize) {
        if self.sender.is_none() {
            return;
        }
        let due = self.last_emit.elapsed() >= PROGRESS_INTERVAL
            || bytes_read.saturating_sub(self.last_bytes) >= self.byte_step;
        if due {
            self.emit_now(phase, bytes_read, rows);
        }
    }

    fn emit_now(&mut self, phase: ParsePhase, bytes_read: u64, rows: usize) {
        let Some(sender) = &self.sender else { return };
        let percent = if self.total_bytes == 0 {
            100.0
        } else {
            (bytes_read as f64 / self.total_bytes as f64 * 100.0).min(100.0) as f32
        };
        sender.send(ParseProgress {
            phase,
            bytes_read,
            total_bytes: self.total_bytes,
            rows_processed: rows,
            percent,
        });
        self.last_emit = Instant::now();
        self.last_bytes = bytes_read;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress;

    fn cfg(dir: &Path) -> CacheConfig {
        CacheConfig::new(dir.join("cache"))
    }

    fn write_report(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("bugreport-test.txt");
        std::fs::write(&path, body).unwrap();
        path
    }

    const SAMPLE: &str = "\
== dumpstate: 2024-08-24 14:30:00\n\
persist.sys.timezone=Asia/Taipei\n\
ro.product.brand=google\n\
ro.product.model=Pixel 4a\n\
------ SYSTEM LOG (logcat -v threadtime) ------\n\
08-24 14:22:33.123  1234  5678 E ActivityManager: ANR in com.foo\n\
08-24 14:22:34.999  1234  5678 I MyTag: hello world\n\
\u{20}\u{20}\u{20}\u{20}continued detail\n\
08-24 14:22:35.001  2222  5679 W Network: unstable\n\
08-24 14:22:36.000  3333  5680 F Crash: fatal error\n\
------ DUMPSYS (dumpsys) ------\n\
08-24 99:99:99.999  1 1 I NotLog: inside dumpsys, ignored\n\
";

    #[test]
    fn builds_cache_and_summary_from_sectioned_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = write_report(dir.path(), SAMPLE);
        let cfg = cfg(dir.path());

        let summary = IndexBuilder::new(cfg.clone()).build(&report).unwrap();
        assert_eq!(summary.events, 4);
        assert_eq!(summary.anrs, 1);
        assert_eq!(summary.crashes, 1);
        assert_eq!(summary.ef_total, 2);
        assert_eq!(summary.ef_recent, 2);
        assert_eq!(summary.device.brand, "google");

        let identity = ReportIdentity::of(&report).unwrap();
        let cache_dir = cfg.dir_for(&identity);
        for file in [ROWS_FILE, cache::SUMMARY_FILE, TIME_INDEX_FILE, INV_TAG_FILE, INV_PID_FILE] {
            assert!(cache_dir.join(file).exists(), "missing {file}");
        }

        let stored = cache::open_summary(&cache_dir, &identity).unwrap();
        assert_eq!(stored.total_rows, 4);
        assert_eq!(stored.level_counts.error, 1);
        assert_eq!(stored.level_counts.fatal, 1);
        assert_eq!(stored.time_zone.as_deref(), Some("Asia/Taipei"));
        assert!(stored.min_ts_ms.unwrap() < stored.max_ts_ms.unwrap());
        assert_eq!(stored.min_ts_display.as_deref(), Some("08-24 14:22:33.123"));
    }

    #[test]
    fn rebuild_is_skipped_when_cache_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let report = write_report(dir.path(), SAMPLE);
        let cfg = cfg(dir.path());

        let first = IndexBuilder::new(cfg.clone()).build(&report).unwrap();
        let second = IndexBuilder::new(cfg.clone()).build(&report).unwrap();
        assert_eq!(first.events, second.events);
    }

    #[test]
    fn headless_logcat_is_ingested_whole() {
        let dir = tempfile::tempdir().unwrap();
        let report = write_report(
            dir.path(),
            "01-15 10:00:00.000  1 2 I MyTag: hello\n\
             01-15 10:00:00.001  1 2 E MyTag: boom\n\
             \u{20}\u{20}\u{20}\u{20}at Foo.bar(Foo.java:1)\n",
        );
        let summary = IndexBuilder::new(cfg(dir.path())).build(&report).unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(summary.ef_total, 1);
    }

    #[test]
    fn sectioned_report_without_logcat_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let report = write_report(
            dir.path(),
            "------ DUMPSYS (dumpsys) ------\nnothing here\n",
        );
        let err = IndexBuilder::new(cfg(dir.path())).build(&report).unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat(_)));
    }

    #[test]
    fn missing_input_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = IndexBuilder::new(cfg(dir.path()))
            .build(Path::new("/does/not/exist.txt"))
            .unwrap_err();
        assert!(matches!(err, IngestError::BugreportNotFound(_)));
    }

    #[test]
    fn cancellation_removes_temp_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = String::from("------ SYSTEM LOG (logcat) ------\n");
        for i in 0..10_000 {
            body.push_str(&format!("08-24 14:22:33.{:03}  1 2 I T: line {i}\n", i % 1000));
        }
        let report = write_report(dir.path(), &body);
        let cfg = cfg(dir.path());

        let token = CancelToken::new();
        token.cancel();
        let err = IndexBuilder::new(cfg.clone())
            .with_cancel(token)
            .build(&report)
            .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));

        let leftovers: Vec<_> = std::fs::read_dir(&cfg.root)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
                    .collect()
            })
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn progress_events_precede_completion_and_reach_full() {
        let dir = tempfile::tempdir().unwrap();
        let report = write_report(dir.path(), SAMPLE);
        let (tx, rx) = progress::channel(64);

        let summary = IndexBuilder::new(cfg(dir.path()))
            .with_progress(tx)
            .build(&report)
            .unwrap();
        assert_eq!(summary.events, 4);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert!(!events.is_empty());
        assert_eq!(events[0].phase, ParsePhase::Starting);
        let last = events.last().unwrap();
        assert_eq!(last.phase, ParsePhase::Finalizing);
        assert!((last.percent - 100.0).abs() < 0.01);
    }
}
