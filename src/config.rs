//! # Configuration Module
//!
//! Data directory resolution and engine tuning.
//!
//! ## Data Storage
//!
//! The record store lives in the platform-standard data directory:
//! - Linux: `~/.local/share/wavehook/catalog.db`
//! - macOS: `~/Library/Application Support/wavehook/catalog.db`
//! - Windows: `%APPDATA%\wavehook\catalog.db`
//!
//! ## Tuning
//!
//! [`EngineConfig`] is layered: built-in defaults, then a JSON file
//! (`--config`, or `config.json` next to the database), then command-line
//! flags and `WAVEHOOK_*` environment variables.

use crate::features::{FeatureWeights, ACOUSTIC_LEN, DEFAULT_MAX_VOCABULARY};
use crate::index::{Metric, SearchStrategy};
use crate::policy::PolicyConfig;
use anyhow::{bail, Context, Result};
use log::debug;
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "wavehook";
const DB_FILE: &str = "catalog.db";
const CONFIG_FILE: &str = "config.json";

/// Returns the platform-appropriate data directory, creating it if needed.
///
/// # Errors
///
/// Fails when the platform has no data directory or it cannot be created.
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not determine system data directory. Pass --db to choose a database location."
        )
    })?;

    let app_dir = data_dir.join(APP_DIR);
    fs::create_dir_all(&app_dir).with_context(|| {
        format!(
            "Failed to create data directory at {}. Please check file permissions.",
            app_dir.display()
        )
    })?;
    Ok(app_dir)
}

/// Returns the default database path inside [`get_data_dir`].
///
/// # Errors
///
/// See [`get_data_dir`].
pub fn get_db_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(DB_FILE))
}

/// Where the process reads and writes its files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub db_path: PathBuf,
    pub config_path: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Resolve paths: explicit ones are made absolute against the current
    /// directory, missing ones come from the data directory.
    pub fn resolve(db_path: Option<&Path>, config_path: Option<&Path>) -> Result<Self> {
        let db_path = match db_path {
            Some(path) => absolute(path)?,
            None => get_db_path()?,
        };

        let config_path = match config_path {
            Some(path) => Some(absolute(path)?),
            None => db_path
                .parent()
                .map(|dir| dir.join(CONFIG_FILE))
                .filter(|path| path.is_file()),
        };

        Ok(Self { db_path, config_path })
    }

    pub fn with_db_path(db_path: PathBuf) -> Self {
        Self {
            db_path,
            config_path: None,
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(path
        .absolutize()
        .with_context(|| format!("Cannot resolve path {}", path.display()))?
        .into_owned())
}

/// Engine tuning. Every field has a default, so a partial JSON file works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub weights: FeatureWeights,
    /// Neighbour-list length.
    pub top_n: usize,
    /// Similarity hits fetched per online search before filtering.
    pub candidate_pool: usize,
    pub anti_repeat_ttl_secs: u64,
    pub exploration_probability: f64,
    /// Metric of online searches.
    pub metric: Metric,
    /// Metric of neighbour-list builds.
    pub recommendation_metric: Metric,
    pub index_strategy: SearchStrategy,
    /// Catalog size from which `auto` uses the tree index.
    pub approximate_threshold: usize,
    pub session_idle_secs: u64,
    pub max_vocabulary: usize,
    pub acoustic_len: usize,
    /// Seed for session randomness. Unset means entropy.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weights: FeatureWeights::default(),
            top_n: 10,
            candidate_pool: 50,
            anti_repeat_ttl_secs: 86_400,
            exploration_probability: 0.15,
            metric: Metric::Cosine,
            recommendation_metric: Metric::Euclidean,
            index_strategy: SearchStrategy::Auto,
            approximate_threshold: 2048,
            session_idle_secs: 3600,
            max_vocabulary: DEFAULT_MAX_VOCABULARY,
            acoustic_len: ACOUSTIC_LEN,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the JSON file at `path`, if any.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        debug!("Loaded configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.weights.is_valid() {
            bail!("Feature weights must be finite and non-negative: {:?}", self.weights);
        }
        if !(0.0..=1.0).contains(&self.exploration_probability) {
            bail!(
                "Exploration probability must be within [0, 1], got {}",
                self.exploration_probability
            );
        }
        if self.top_n == 0 {
            bail!("top_n must be at least 1");
        }
        if self.candidate_pool == 0 {
            bail!("candidate_pool must be at least 1");
        }
        if self.max_vocabulary == 0 {
            bail!("max_vocabulary must be at least 1");
        }
        if self.anti_repeat_ttl_secs == 0 {
            bail!("anti_repeat_ttl_secs must be at least 1");
        }
        Ok(())
    }

    pub fn anti_repeat_ttl(&self) -> Duration {
        Duration::from_secs(self.anti_repeat_ttl_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            candidate_pool: self.candidate_pool.max(self.top_n),
            exploration_probability: self.exploration_probability,
            ..PolicyConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.top_n, 10);
        assert_eq!(config.anti_repeat_ttl(), Duration::from_secs(24 * 3600));
        assert_eq!(config.weights, FeatureWeights::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"top_n": 5, "metric": "euclidean", "weights": {"text": 1.0}}"#)
            .expect("write");

        let config = EngineConfig::load(Some(&path)).expect("load");
        assert_eq!(config.top_n, 5);
        assert_eq!(config.metric, Metric::Euclidean);
        assert_eq!(config.weights.text, 1.0);
        assert_eq!(config.weights.acoustic, 0.3);
        assert_eq!(config.exploration_probability, 0.15);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = EngineConfig {
            exploration_probability: 1.5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            top_n: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(EngineConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_explicit_paths_are_absolute() {
        let runtime = RuntimeConfig::resolve(Some(Path::new("some/catalog.db")), None).expect("resolve");
        assert!(runtime.db_path.is_absolute());
        assert!(runtime.db_path.ends_with("some/catalog.db"));
        assert!(runtime.config_path.is_none());
    }

    #[test]
    fn test_config_next_to_database_is_found() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("catalog.db");
        fs::write(dir.path().join("config.json"), "{}").expect("write");

        let runtime = RuntimeConfig::resolve(Some(&db), None).expect("resolve");
        assert_eq!(runtime.config_path, Some(dir.path().join("config.json")));
    }
}
