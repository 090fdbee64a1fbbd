//! Command execution: each subcommand prints one JSON payload on stdout.

use crate::cli::{GcArgs, JumpArgs, ParseArgs, QueryArgs, StatsArgs};
use crate::exit_codes;
use anyhow::{Context, Result};
use bugsift_core::cache::{self, CacheConfig};
use bugsift_core::{
    progress, CancelToken, IndexBuilder, IngestError, QueryCursor, QueryError, QueryExecutor,
};
use serde::Serialize;
use std::path::PathBuf;

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

pub fn resolve_cache(root: Option<PathBuf>) -> Result<CacheConfig> {
    match root {
        Some(root) => Ok(CacheConfig::new(root)),
        None => CacheConfig::default_user().context("resolving the per-user cache directory"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn parse(cfg: CacheConfig, args: ParseArgs) -> Result<i32> {
    let summary = if args.progress {
        let (tx, rx) = progress::channel(PROGRESS_CHANNEL_CAPACITY);
        let path = args.path.clone();
        let worker = std::thread::spawn(move || {
            bugsift_core::parse_bugreport_streaming(cfg, &path, tx, CancelToken::new())
        });
        for event in rx {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{line}");
            }
        }
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("ingest thread panicked"))?
    } else {
        IndexBuilder::new(cfg).build(&args.path)
    };

    match summary {
        Ok(summary) => {
            print_json(&summary)?;
            Ok(exit_codes::SUCCESS)
        }
        Err(e) => {
            eprintln!("error: {e}");
            Ok(ingest_exit_code(&e))
        }
    }
}

pub fn stats(cfg: CacheConfig, args: StatsArgs) -> Result<i32> {
    let mut exec = match QueryExecutor::open(&cfg, &args.path) {
        Ok(exec) => exec,
        Err(e) => return query_failure(e),
    };
    match exec.stats(&args.filters.to_filters()) {
        Ok(stats) => {
            print_json(&stats)?;
            Ok(exit_codes::SUCCESS)
        }
        Err(e) => query_failure(e),
    }
}

pub fn query(cfg: CacheConfig, args: QueryArgs) -> Result<i32> {
    let cursor: Option<QueryCursor> = match &args.cursor {
        None => None,
        Some(raw) => match serde_json::from_str(raw) {
            Ok(c) => Some(c),
            Err(e) => {
                eprintln!("error: cursor is not valid JSON: {e}");
                return Ok(exit_codes::QUERY_ERROR);
            }
        },
    };

    let mut exec = match QueryExecutor::open(&cfg, &args.path) {
        Ok(exec) => exec,
        Err(e) => return query_failure(e),
    };
    match exec.query(
        &args.filters.to_filters(),
        cursor.as_ref(),
        args.limit,
        args.direction.into(),
    ) {
        Ok(resp) => {
            print_json(&resp)?;
            Ok(exit_codes::SUCCESS)
        }
        Err(e) => query_failure(e),
    }
}

pub fn jump(cfg: CacheConfig, args: JumpArgs) -> Result<i32> {
    let mut exec = match QueryExecutor::open(&cfg, &args.path) {
        Ok(exec) => exec,
        Err(e) => return query_failure(e),
    };
    match exec.jump_to_time(&args.filters.to_filters(), &args.at, args.limit) {
        Ok(resp) => {
            print_json(&resp)?;
            Ok(exit_codes::SUCCESS)
        }
        Err(e) => query_failure(e),
    }
}

pub fn gc(cfg: CacheConfig, args: GcArgs) -> Result<i32> {
    let cfg = match args.max_bytes {
        Some(max) => cfg.with_max_bytes(max),
        None => cfg,
    };
    let report = cache::evict_lru(&cfg, None)?;
    print_json(&report)?;
    Ok(exit_codes::SUCCESS)
}

fn query_failure(e: QueryError) -> Result<i32> {
    eprintln!("error: {e}");
    let code = match &e {
        QueryError::CursorInvalid(_) | QueryError::FilterInvalid(_) => exit_codes::QUERY_ERROR,
        QueryError::Cache(_) | QueryError::Io(_) => exit_codes::INPUT_ERROR,
    };
    Ok(code)
}

fn ingest_exit_code(e: &IngestError) -> i32 {
    match e {
        IngestError::Cancelled => exit_codes::CANCELLED,
        _ => exit_codes::INPUT_ERROR,
    }
}
