//! # WaveHook
//!
//! Command-line front end for the recommendation engine: catalog import,
//! offline vector and neighbour-list builds, inspection, and an interactive
//! listening session.
//!
//! ```bash
//! wavehook import catalog.json
//! wavehook import-features features.json
//! wavehook build-vectors
//! wavehook build-recommendations
//! wavehook listen --lang punjabi
//! ```
//!
//! Logging is controlled through `RUST_LOG`, e.g.
//! `RUST_LOG=wavehook::policy=debug wavehook listen`.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{debug, info};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use wavehook::cli::{self, Command};
use wavehook::completion;
use wavehook::config::{EngineConfig, RuntimeConfig};
use wavehook::db::SqliteStore;
use wavehook::pipeline;
use wavehook::track::Track;
use wavehook::{Action, Engine};

fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();

    // Commands that do not need the engine.
    match &args.command {
        Command::Completion { shell } => {
            let mut cmd = cli::Args::command();
            completion::write_completions(*shell, &mut cmd, &mut io::stdout().lock())?;
            return Ok(());
        }
        Command::CompleteTracks => {
            let runtime = RuntimeConfig::resolve(args.db.as_deref(), None)?;
            return completion::print_track_completions(&runtime.db_path);
        }
        _ => {}
    }

    let runtime = RuntimeConfig::resolve(args.db.as_deref(), args.config.as_deref())?;
    let mut config = EngineConfig::load(runtime.config_path.as_deref())?;
    args.tuning.apply(&mut config)?;
    config.validate()?;
    debug!("Using database {}", runtime.db_path.display());

    match args.command {
        Command::Import { file } => {
            let store = SqliteStore::open(&runtime.db_path)?;
            let tracks = read_catalog(&file)?;
            let count = store.upsert_tracks(&tracks)?;
            println!("Imported {count} tracks ({} in catalog)", store.track_count()?);
        }
        Command::ImportFeatures { file } => {
            let store = SqliteStore::open(&runtime.db_path)?;
            let text = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let features: HashMap<String, Vec<f32>> = serde_json::from_str(&text)
                .with_context(|| format!("Invalid descriptor file {}", file.display()))?;
            let count = store.store_acoustic(&features)?;
            println!("Stored {count} acoustic descriptors");
        }
        Command::BuildVectors { mode } => {
            let engine = open_engine(&runtime.db_path, config)?;
            let report = pipeline::build_vectors(&engine, mode)?;
            info!("Vector build finished: {report:?}");
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::BuildRecommendations { mode } => {
            let engine = open_engine(&runtime.db_path, config)?;
            let report = pipeline::build_recommendations(&engine, mode)?;
            info!("Recommendation build finished: {report:?}");
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Track { id } => {
            let engine = open_engine(&runtime.db_path, config)?;
            let track = engine.track_by_id(&id)?;
            println!("{}", serde_json::to_string_pretty(&track)?);
        }
        Command::Similar { id, k } => {
            let engine = open_engine(&runtime.db_path, config)?;
            for neighbor in engine.similar(&id, k)? {
                println!("{:>10.4}  {}", neighbor.score, neighbor.track_id);
            }
        }
        Command::Listen { session, lang } => {
            let engine = open_engine(&runtime.db_path, config)?;
            listen(&engine, &session, lang.as_deref())?;
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Completion { .. } | Command::CompleteTracks => {}
    }

    Ok(())
}

fn open_engine(db_path: &Path, config: EngineConfig) -> Result<Engine> {
    let store = Arc::new(SqliteStore::open(db_path)?);
    Engine::with_store(store, config)
}

/// A catalog file is either a JSON array of tracks or one track per line.
fn read_catalog(path: &Path) -> Result<Vec<Track>> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(&text).with_context(|| format!("Invalid catalog file {}", path.display()));
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid track on line {} of {}", n + 1, path.display()))
        })
        .collect()
}

fn listen(engine: &Engine, session: &str, language: Option<&str>) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut action = Action::First;
    let mut lines = stdin.lock().lines();
    loop {
        let served = engine.next_track(session, action, language)?;
        let artists = served.track.artists.unique_names().join(", ");
        writeln!(
            out,
            "▶ {} [{}] {} ({:?}, skips {})",
            served.track.id, served.track.language, artists, served.decision.source, served.decision.skip_count
        )?;
        write!(out, "like / skip / hard / quit > ")?;
        out.flush()?;

        action = loop {
            let Some(line) = lines.next().transpose()? else {
                return Ok(());
            };
            let line = line.trim();
            if matches!(line, "q" | "quit" | "exit") {
                engine.end_session(session);
                return Ok(());
            }
            match line.parse::<Action>() {
                Ok(Action::First) => writeln!(out, "Give feedback first: like, skip or hard")?,
                Ok(action) => break action,
                Err(err) => writeln!(out, "{err}")?,
            }
        };
    }
}
