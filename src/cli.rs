//! # Command-Line Interface Module
//!
//! Clap derive definitions for the `wavehook` binary.
//!
//! ## Commands
//!
//! - `import`: upsert catalog records from a JSON file
//! - `import-features`: store precomputed acoustic descriptors
//! - `build-vectors`: compute embeddings (full or incremental)
//! - `build-recommendations`: compute neighbour lists (full or incremental)
//! - `track`, `similar`: inspect the catalog and the similarity index
//! - `listen`: interactive session driven by `like` / `skip` / `hard` on stdin
//!
//! ## Examples
//!
//! ```bash
//! wavehook import catalog.json
//! wavehook build-vectors --mode full
//! wavehook build-recommendations
//! wavehook listen --lang hindi
//! ```

use crate::config::EngineConfig;
use crate::features::FeatureWeights;
use crate::index::{Metric, SearchStrategy};
use crate::vector_store::BuildMode;
use anyhow::{bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Parser, Debug)]
#[command(name = "wavehook")]
#[command(about = "WaveHook: next-track recommendations from hooks, metadata and feedback")]
#[command(version)]
pub struct Args {
    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true, env = "WAVEHOOK_DB", value_hint = clap::ValueHint::FilePath)]
    pub db: Option<PathBuf>,

    /// JSON configuration file (defaults to config.json next to the database)
    #[arg(long, global = true, env = "WAVEHOOK_CONFIG", value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub tuning: TuningArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Overrides applied on top of the configuration file.
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct TuningArgs {
    /// Neighbour-list length
    #[arg(long, global = true, env = "WAVEHOOK_TOP_N")]
    pub top_n: Option<usize>,

    /// Anti-repeat window in seconds
    #[arg(long, global = true, env = "WAVEHOOK_TTL")]
    pub ttl: Option<u64>,

    /// Probability of replacing a chained pick with a random one
    #[arg(long, global = true, env = "WAVEHOOK_EXPLORATION")]
    pub exploration: Option<f64>,

    /// Metric of online similarity searches
    #[arg(long, global = true, env = "WAVEHOOK_METRIC")]
    pub metric: Option<Metric>,

    /// Exact scan, vantage-point tree, or size-based choice
    #[arg(long, global = true, env = "WAVEHOOK_INDEX")]
    pub index: Option<SearchStrategy>,

    /// Feature weights as text,acoustic,hook,popularity
    #[arg(long, global = true, env = "WAVEHOOK_WEIGHTS", value_delimiter = ',')]
    pub weights: Option<Vec<f32>>,

    /// Seed for reproducible sessions
    #[arg(long, global = true, env = "WAVEHOOK_SEED")]
    pub seed: Option<u64>,
}

impl TuningArgs {
    /// Overlay the flags that were given onto `config`.
    pub fn apply(&self, config: &mut EngineConfig) -> Result<()> {
        if let Some(top_n) = self.top_n {
            config.top_n = top_n;
        }
        if let Some(ttl) = self.ttl {
            config.anti_repeat_ttl_secs = ttl;
        }
        if let Some(exploration) = self.exploration {
            config.exploration_probability = exploration;
        }
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        if let Some(index) = self.index {
            config.index_strategy = index;
        }
        match self.weights.as_deref() {
            None => {}
            Some(&[text, acoustic, hook, popularity]) => {
                config.weights = FeatureWeights {
                    text,
                    acoustic,
                    hook,
                    popularity,
                };
            }
            Some(other) => bail!("--weights takes 4 values, got {}", other.len()),
        }
        if let Some(seed) = self.seed {
            config.rng_seed = Some(seed);
        }
        Ok(())
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upsert catalog records from a JSON array of tracks
    ///
    /// Records are keyed by `id`; importing the same file twice is a no-op.
    Import {
        #[arg(value_hint = clap::ValueHint::FilePath)]
        file: PathBuf,
    },

    /// Store acoustic descriptors from a JSON object `{ "track_id": [f32; 15] }`
    ImportFeatures {
        #[arg(value_hint = clap::ValueHint::FilePath)]
        file: PathBuf,
    },

    /// Compute track embeddings
    ///
    /// `full` refits text statistics and popularity range to the whole
    /// catalog; `incremental` only embeds tracks without a vector.
    BuildVectors {
        #[arg(long, value_enum, default_value_t = BuildMode::Full)]
        mode: BuildMode,
    },

    /// Compute neighbour lists
    BuildRecommendations {
        #[arg(long, value_enum, default_value_t = BuildMode::Full)]
        mode: BuildMode,
    },

    /// Print one track as JSON
    Track {
        #[arg(value_hint = clap::ValueHint::Other)]
        id: String,
    },

    /// Nearest tracks to a track
    Similar {
        #[arg(value_hint = clap::ValueHint::Other)]
        id: String,

        #[arg(short, default_value_t = 10)]
        k: usize,
    },

    /// Interactive listening session
    ///
    /// Prints a track, then reads `like`, `skip`, `hard` or `quit` from
    /// stdin and prints the next one.
    Listen {
        /// Session identifier
        #[arg(long, default_value = "cli")]
        session: String,

        /// Only serve tracks in this language
        #[arg(long)]
        lang: Option<String>,
    },

    /// Print the effective configuration as JSON
    Config,

    /// Generate shell completions
    ///
    /// Usage: wavehook completion bash > ~/.local/share/bash-completion/completions/wavehook
    Completion { shell: Shell },

    /// List track ids for completion (hidden command)
    #[command(hide = true)]
    CompleteTracks,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_tuning_flags_override_config() {
        let args = Args::try_parse_from([
            "wavehook",
            "--top-n",
            "5",
            "--metric",
            "euclidean",
            "--weights",
            "1,0,0,0",
            "config",
        ])
        .expect("valid args");

        let mut config = EngineConfig::default();
        args.tuning.apply(&mut config).expect("valid tuning");
        assert_eq!(config.top_n, 5);
        assert_eq!(config.metric, Metric::Euclidean);
        assert_eq!(config.weights.text, 1.0);
        assert_eq!(config.weights.popularity, 0.0);
        assert_eq!(config.exploration_probability, 0.15);
    }

    #[test]
    fn test_wrong_weight_count_rejected() {
        let args = Args::try_parse_from(["wavehook", "--weights", "1,2", "config"]).expect("parses");
        assert!(args.tuning.apply(&mut EngineConfig::default()).is_err());
    }

    #[test]
    fn test_build_mode_parsing() {
        let args = Args::try_parse_from(["wavehook", "build-vectors", "--mode", "incremental"]).expect("valid");
        assert!(matches!(
            args.command,
            Command::BuildVectors {
                mode: BuildMode::Incremental
            }
        ));
    }
}
