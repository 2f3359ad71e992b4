//! CLI entrypoint for the build engine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use buildhash_engine::{Config, Engine};
use buildhash_value::Registry;

/// Command-line tooling for the build engine.
#[derive(Debug, Parser)]
#[command(name = "buildhash")]
#[command(about = "Content-addressed, memoizing build engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Initialize the engine against a config file, print the resolved
    /// root directories, then cleanly shut it down.
    Init {
        /// Path to a TOML config file (fields: db_root, src_root, gen_root,
        /// cas_root, out_root). Missing fields fall back to defaults.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print CAS/memo table sizes without mutating anything.
    Stat {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Emit the report as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, serde::Serialize)]
struct StatReport {
    cas_entries: u64,
    memo_entries: u64,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            Config::from_toml_str(&text).with_context(|| format!("parsing config file {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Init { config } => {
            let config = load_config(config.as_ref())?;
            let engine = Engine::init(config, Registry::new())?;
            let roots = engine.roots();
            println!("src_root = {}", roots.src_root.display());
            println!("gen_root = {}", roots.gen_root.display());
            println!("out_root = {}", roots.out_root.display());
            println!("cas_root = {}", roots.cas_root.display());
            engine.uninit();
        }
        Command::Stat { config, json } => {
            let config = load_config(config.as_ref())?;
            let engine = Engine::init(config, Registry::new())?;
            let cas = engine.cas();
            let cas_entries = cas.len()?;
            let memo_entries = engine.with_memoizer(|memo| memo.len()).unwrap_or(0);
            if json {
                let report = StatReport { cas_entries, memo_entries };
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("cas entries   = {cas_entries}");
                println!("memo entries  = {memo_entries}");
            }
            engine.uninit();
        }
    }

    Ok(())
}

// `buildhash gc` is deliberately not implemented: spec.md leaves GC-by-
// reference-tracing as an open area ("assume it's an error if parts are
// missing"), not a committed feature, so there is no subcommand for it
// here (see DESIGN.md).
