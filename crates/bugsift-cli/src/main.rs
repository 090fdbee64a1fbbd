use clap::Parser;

mod cli;
mod commands;
mod exit_codes;

use cli::{Cli, Command};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match commands::resolve_cache(cli.cache_root) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            std::process::exit(exit_codes::INPUT_ERROR);
        }
    };

    let result = match cli.cmd {
        Command::Parse(args) => commands::parse(cfg, args),
        Command::Stats(args) => commands::stats(cfg, args),
        Command::Query(args) => commands::query(cfg, args),
        Command::Jump(args) => commands::jump(cfg, args),
        Command::Gc(args) => commands::gc(cfg, args),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            exit_codes::INPUT_ERROR
        }
    };
    std::process::exit(code);
}
