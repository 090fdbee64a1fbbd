//! bugsift-core: streaming Android bugreport ingest, an on-disk logcat
//! index, and a cursor-paginated query engine.
//!
//! The pipeline is ingest → index → query. A single pass over the report
//! extracts device identity, normalises threadtime rows, and writes a
//! per-report cache (row store, summary, time-bucket index, inverted
//! postings). Queries are answered from the cache alone; the report is
//! never re-read.
//!
//! ```no_run
//! use bugsift_core::{cache::CacheConfig, IndexBuilder, QueryExecutor};
//! use bugsift_core::query::cursor::CursorDirection;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = CacheConfig::default_user()?;
//! let report = Path::new("bugreport-sunfish.zip");
//!
//! let summary = IndexBuilder::new(cfg.clone()).build(report)?;
//! println!("{} rows, {} crashes", summary.events, summary.crashes);
//!
//! let mut exec = QueryExecutor::open(&cfg, report)?;
//! let page = exec.query(&Default::default(), None, 200, CursorDirection::Forward)?;
//! println!("first page: {} rows", page.rows.len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod index;
pub mod parse;
pub mod progress;
pub mod query;
pub mod source;
pub mod types;

pub use cache::{CacheConfig, CacheSummary, ReportIdentity};
pub use error::{CacheError, IngestError, QueryError};
pub use index::IndexBuilder;
pub use progress::{CancelToken, ProgressReceiver, ProgressSender};
pub use query::cursor::{CursorDirection, LogcatStats, QueryCursor, QueryResponse};
pub use query::executor::QueryExecutor;
pub use types::{
    DeviceInfo, Level, LogFilters, LogRow, ParsePhase, ParseProgress, ParseSummary, TextMode,
};

use std::path::Path;

/// Parse a bugreport and publish its cache, emitting progress events.
///
/// Convenience wrapper over [`IndexBuilder`]; `parse_bugreport` is the
/// no-progress variant.
pub fn parse_bugreport_streaming(
    cfg: CacheConfig,
    path: &Path,
    progress: ProgressSender,
    cancel: CancelToken,
) -> Result<ParseSummary, IngestError> {
    IndexBuilder::new(cfg)
        .with_progress(progress)
        .with_cancel(cancel)
        .build(path)
}

/// Parse a bugreport and publish its cache.
pub fn parse_bugreport(cfg: CacheConfig, path: &Path) -> Result<ParseSummary, IngestError> {
    IndexBuilder::new(cfg).build(path)
}
