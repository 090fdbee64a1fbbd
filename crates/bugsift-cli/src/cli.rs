//! Argument surface for the `bugsift` binary.

use bugsift_core::types::{Level, LogFilters, TextMode};
use bugsift_core::CursorDirection;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "bugsift",
    version,
    about = "Ingest Android bugreports into a queryable on-disk logcat index"
)]
pub struct Cli {
    /// Override the cache root (default: the per-user cache directory).
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_root: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Parse a bugreport (flat text or zip) and build its cache
    Parse(ParseArgs),
    /// Aggregate statistics from the cache, optionally filtered
    Stats(StatsArgs),
    /// Page matching rows with a bidirectional cursor
    Query(QueryArgs),
    /// Anchor at a point in time, then page forward
    Jump(JumpArgs),
    /// Evict least-recently-used caches past the size ceiling
    Gc(GcArgs),
}

#[derive(Args)]
pub struct ParseArgs {
    /// Bugreport path (.txt dump or .zip archive)
    pub path: PathBuf,

    /// Emit progress events as JSON lines on stderr
    #[arg(long)]
    pub progress: bool,
}

#[derive(Args)]
pub struct StatsArgs {
    pub path: PathBuf,

    #[command(flatten)]
    pub filters: FilterArgs,
}

#[derive(Args)]
pub struct QueryArgs {
    pub path: PathBuf,

    #[command(flatten)]
    pub filters: FilterArgs,

    /// Cursor JSON echoed from a previous response
    #[arg(long, value_name = "JSON")]
    pub cursor: Option<String>,

    #[arg(long, default_value_t = 200)]
    pub limit: u32,

    #[arg(long, value_enum, default_value_t = DirectionArg::Forward)]
    pub direction: DirectionArg,
}

#[derive(Args)]
pub struct JumpArgs {
    pub path: PathBuf,

    /// Target time, `YYYY-MM-DD HH:MM:SS` in the report's local timezone
    #[arg(long, value_name = "TIME")]
    pub at: String,

    #[command(flatten)]
    pub filters: FilterArgs,

    #[arg(long, default_value_t = 200)]
    pub limit: u32,
}

#[derive(Args)]
pub struct GcArgs {
    /// Cache size ceiling in bytes
    #[arg(long, value_name = "BYTES")]
    pub max_bytes: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DirectionArg {
    Forward,
    Backward,
}

impl From<DirectionArg> for CursorDirection {
    fn from(d: DirectionArg) -> Self {
        match d {
            DirectionArg::Forward => CursorDirection::Forward,
            DirectionArg::Backward => CursorDirection::Backward,
        }
    }
}

/// Filter flags shared by `stats`, `query`, and `jump`.
#[derive(Args, Default)]
pub struct FilterArgs {
    /// Lower time bound, `YYYY-MM-DD HH:MM:SS` in report-local time
    #[arg(long, value_name = "TIME")]
    pub from: Option<String>,

    /// Upper time bound
    #[arg(long, value_name = "TIME")]
    pub to: Option<String>,

    /// Level letter (V, D, I, W, E, F); repeatable
    #[arg(long = "level", value_parser = parse_level)]
    pub levels: Vec<Level>,

    /// Exact tag; `a|b|c` matches any of the alternatives
    #[arg(long)]
    pub tag: Option<String>,

    #[arg(long)]
    pub pid: Option<i32>,

    #[arg(long)]
    pub tid: Option<i32>,

    /// Message text to include (plain `|` = OR of literals)
    #[arg(long)]
    pub text: Option<String>,

    /// Literal to exclude (always plain, case-insensitive)
    #[arg(long)]
    pub not_text: Option<String>,

    #[arg(long, value_enum, default_value_t = TextModeArg::Plain)]
    pub text_mode: TextModeArg,

    #[arg(long)]
    pub case_sensitive: bool,
}

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum TextModeArg {
    #[default]
    Plain,
    Regex,
}

impl FilterArgs {
    pub fn to_filters(&self) -> LogFilters {
        LogFilters {
            ts_from: self.from.clone(),
            ts_to: self.to.clone(),
            levels: (!self.levels.is_empty()).then(|| self.levels.clone()),
            tag: self.tag.clone(),
            pid: self.pid,
            tid: self.tid,
            text: self.text.clone(),
            not_text: self.not_text.clone(),
            text_mode: Some(match self.text_mode {
                TextModeArg::Plain => TextMode::Plain,
                TextModeArg::Regex => TextMode::Regex,
            }),
            case_sensitive: Some(self.case_sensitive),
        }
    }
}

fn parse_level(s: &str) -> Result<Level, String> {
    let upper = s.trim().to_ascii_uppercase();
    match upper.as_bytes() {
        [b] => Level::from_byte(*b).ok_or_else(|| format!("unknown level {s:?} (use V/D/I/W/E/F)")),
        _ => Err(format!("unknown level {s:?} (use V/D/I/W/E/F)")),
    }
}
