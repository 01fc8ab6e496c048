//! Offline batch jobs: embedding generation and neighbour-list builds.
//!
//! Both run off the serving path and publish their results atomically, so a
//! running engine keeps answering from the previous generation until the
//! new one is in place.
//!
//! - [`build_vectors`]: `Full` fits a new [`FeatureModel`] to the whole
//!   catalog and replaces every embedding. `Incremental` embeds only tracks
//!   without a vector, using the stored model so dimensions stay compatible;
//!   without a usable model it falls back to a full build.
//! - [`build_recommendations`]: `Full` recomputes every list, `Incremental`
//!   only the lists that are missing.

use crate::engine::Engine;
use crate::features::{AcousticSource, FeatureModel};
use crate::index::SimilarityIndex;
use crate::recommendations::build_lists;
use crate::track::Track;
use crate::vector_store::BuildMode;
use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;

/// Summary of one batch job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub mode: Option<BuildMode>,
    /// Items produced by this run.
    pub built: usize,
    /// Items already present and left alone.
    pub skipped: usize,
    /// Embeddings that fell back to a zero acoustic vector.
    pub degraded: usize,
    pub dimension: usize,
    pub generation: u64,
}

/// Compute embeddings and publish them.
pub fn build_vectors(engine: &Engine, mode: BuildMode) -> Result<BuildReport> {
    let acoustic: HashMap<String, Vec<f32>> = match engine.store() {
        Some(store) => store.load_acoustic_features()?,
        None => HashMap::new(),
    };
    build_vectors_with(engine, mode, &acoustic)
}

/// [`build_vectors`] with an explicit descriptor source.
pub fn build_vectors_with<S>(engine: &Engine, mode: BuildMode, acoustic: &S) -> Result<BuildReport>
where
    S: AcousticSource + Sync + ?Sized,
{
    let catalog = engine.catalog();
    let tracks = catalog.tracks();
    let config = engine.config();

    if mode == BuildMode::Incremental {
        let snapshot = engine.vectors().snapshot();
        match engine.vectors().feature_model() {
            Some(model) if snapshot.is_empty() || model.dimension() == snapshot.dimension() => {
                let pending: Vec<Track> = tracks
                    .iter()
                    .filter(|track| !snapshot.contains(&track.id))
                    .cloned()
                    .collect();
                let (embeddings, degraded) = model.embed_batch(&pending, acoustic);
                let built = embeddings.len();
                let published = engine
                    .vectors()
                    .upsert_batch(embeddings)
                    .context("Failed to merge new vectors")?;

                info!("Incremental vector build: {built} new, {} existing", snapshot.len());
                return Ok(BuildReport {
                    mode: Some(mode),
                    built,
                    skipped: tracks.len() - built,
                    degraded,
                    dimension: published.dimension(),
                    generation: published.generation(),
                });
            }
            Some(_) => warn!("Stored feature model does not match current vectors, rebuilding in full"),
            None => warn!("No stored feature model, rebuilding in full"),
        }
    }

    let model = FeatureModel::fit(tracks, config.max_vocabulary, config.acoustic_len, config.weights);
    let (embeddings, degraded) = model.embed_batch(tracks, acoustic);
    let built = embeddings.len();
    let published = engine
        .vectors()
        .rebuild_generation(model, embeddings)
        .context("Failed to publish vector generation")?;

    info!(
        "Full vector build: {built} embeddings of dimension {}",
        published.dimension()
    );
    Ok(BuildReport {
        mode: Some(BuildMode::Full),
        built,
        skipped: 0,
        degraded,
        dimension: published.dimension(),
        generation: published.generation(),
    })
}

/// Compute neighbour lists under the configured neighbour-list metric.
pub fn build_recommendations(engine: &Engine, mode: BuildMode) -> Result<BuildReport> {
    let config = engine.config();
    let snapshot = engine.vectors().snapshot();
    let index = SimilarityIndex::new(
        config.recommendation_metric,
        config.index_strategy,
        config.approximate_threshold,
    );

    let report = match mode {
        BuildMode::Full => {
            let lists = build_lists(&snapshot, &index, config.top_n, None);
            let built = lists.len();
            engine
                .recommendations()
                .replace_all(lists)
                .context("Failed to replace neighbour lists")?;
            BuildReport {
                mode: Some(mode),
                built,
                ..BuildReport::default()
            }
        }
        BuildMode::Incremental => {
            let missing = engine.recommendations().missing(&snapshot);
            let lists = build_lists(&snapshot, &index, config.top_n, Some(&missing));
            let built = lists.len();
            engine
                .recommendations()
                .merge(lists)
                .context("Failed to merge neighbour lists")?;
            BuildReport {
                mode: Some(mode),
                built,
                skipped: snapshot.len() - missing.len(),
                ..BuildReport::default()
            }
        }
    };

    Ok(BuildReport {
        dimension: snapshot.dimension(),
        generation: snapshot.generation(),
        ..report
    })
}
