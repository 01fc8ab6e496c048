//! # Recommendation Engine
//!
//! The serving API: one long-lived [`Engine`] shared by every request. It
//! owns the catalog snapshot, the vector store, the similarity index, the
//! neighbour lists and the session store.
//!
//! ```no_run
//! use wavehook::{Action, Engine, EngineConfig};
//!
//! let engine = Engine::open("catalog.db".as_ref(), EngineConfig::default())?;
//! let first = engine.next_track("listener-1", Action::First, None)?;
//! let next = engine.next_track("listener-1", Action::Liked, None)?;
//! println!("{} then {}", first.track.id, next.track.id);
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::db::SqliteStore;
use crate::error::{EngineError, EngineResult};
use crate::features::Embedding;
use crate::index::{Neighbor, SimilarityIndex};
use crate::policy::{self, Action, Decision, PolicyContext};
use crate::recommendations::{RecommendationList, RecommendationPersistence, RecommendationStore};
use crate::session::{SessionStore, SessionView};
use crate::track::Track;
use crate::vector_store::{VectorPersistence, VectorStore};
use anyhow::Context;
use log::{debug, info};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// A served track and how it was chosen.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub track: Track,
    #[serde(flatten)]
    pub decision: Decision,
}

pub struct Engine {
    config: EngineConfig,
    store: Option<Arc<SqliteStore>>,
    catalog: RwLock<Arc<Catalog>>,
    vectors: VectorStore,
    index: SimilarityIndex,
    recommendations: RecommendationStore,
    sessions: SessionStore,
}

impl Engine {
    fn build(
        config: EngineConfig,
        store: Option<Arc<SqliteStore>>,
        vectors: VectorStore,
        recommendations: RecommendationStore,
    ) -> Self {
        Self {
            index: SimilarityIndex::new(config.metric, config.index_strategy, config.approximate_threshold),
            sessions: SessionStore::new(config.session_idle(), config.anti_repeat_ttl(), config.rng_seed),
            catalog: RwLock::new(Arc::new(Catalog::default())),
            config,
            store,
            vectors,
            recommendations,
        }
    }

    /// Engine backed by the database at `db_path`, with everything loaded.
    pub fn open(db_path: &Path, config: EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let store = Arc::new(SqliteStore::open(db_path)?);
        Self::with_store(store, config)
    }

    /// Engine over an already opened store.
    pub fn with_store(store: Arc<SqliteStore>, config: EngineConfig) -> anyhow::Result<Self> {
        let vectors = VectorStore::with_persistence(Arc::clone(&store) as Arc<dyn VectorPersistence>);
        let recommendations =
            RecommendationStore::with_persistence(Arc::clone(&store) as Arc<dyn RecommendationPersistence>);
        let engine = Self::build(config, Some(store), vectors, recommendations);
        engine.reload().context("Failed to load engine state")?;
        Ok(engine)
    }

    /// Engine without persistence, seeded from memory.
    pub fn in_memory(
        config: EngineConfig,
        tracks: Vec<Track>,
        embeddings: Vec<(String, Embedding)>,
        lists: Vec<RecommendationList>,
    ) -> EngineResult<Self> {
        let engine = Self::build(config, None, VectorStore::new(), RecommendationStore::new());
        engine.publish_catalog(Catalog::new(tracks));
        if !embeddings.is_empty() {
            engine.vectors.rebuild_all(embeddings)?;
        }
        engine.recommendations.replace_all(lists)?;
        Ok(engine)
    }

    /// Re-read catalog, vectors and neighbour lists from the database and
    /// publish fresh snapshots.
    pub fn reload(&self) -> EngineResult<()> {
        if let Some(store) = &self.store {
            let tracks = store.load_tracks()?;
            self.publish_catalog(Catalog::new(tracks));
        }
        let snapshot = self.vectors.load()?;
        self.recommendations.load()?;
        self.index.invalidate();
        info!(
            "Engine ready: {} tracks, {} vectors, {} neighbour lists",
            self.catalog().len(),
            snapshot.len(),
            self.recommendations.len()
        );
        Ok(())
    }

    fn publish_catalog(&self, catalog: Catalog) {
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Option<&Arc<SqliteStore>> {
        self.store.as_ref()
    }

    pub fn vectors(&self) -> &VectorStore {
        &self.vectors
    }

    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    pub fn recommendations(&self) -> &RecommendationStore {
        &self.recommendations
    }

    /// Choose the next track for a session. Unknown or expired sessions
    /// start fresh.
    ///
    /// # Errors
    ///
    /// [`EngineError::CatalogEmpty`] when there is nothing to serve.
    pub fn next_track(&self, session_id: &str, action: Action, language: Option<&str>) -> EngineResult<Recommendation> {
        self.next_track_at(session_id, action, language, Instant::now())
    }

    /// [`Engine::next_track`] with an explicit clock.
    pub fn next_track_at(
        &self,
        session_id: &str,
        action: Action,
        language: Option<&str>,
        now: Instant,
    ) -> EngineResult<Recommendation> {
        let catalog = self.catalog();
        let snapshot = self.vectors.snapshot();
        let ctx = PolicyContext {
            catalog: &catalog,
            snapshot: &snapshot,
            index: &self.index,
            recommendations: &self.recommendations,
            config: self.config.policy(),
        };

        let session = self.sessions.checkout(session_id, now);
        let decision = {
            let mut state = session.lock().unwrap_or_else(PoisonError::into_inner);
            policy::decide(&ctx, &mut state, action, language, now)?
        };
        debug!("Session `{session_id}' {action} → `{}' ({:?})", decision.track_id, decision.source);

        let track = catalog
            .get(&decision.track_id)
            .cloned()
            .ok_or_else(|| EngineError::TrackNotFound(decision.track_id.clone()))?;
        Ok(Recommendation { track, decision })
    }

    /// # Errors
    ///
    /// [`EngineError::TrackNotFound`] for an unknown id.
    pub fn track_by_id(&self, track_id: &str) -> EngineResult<Track> {
        self.catalog()
            .get(track_id)
            .cloned()
            .ok_or_else(|| EngineError::TrackNotFound(track_id.to_string()))
    }

    /// Nearest stored tracks to `track_id` under the online metric.
    pub fn similar(&self, track_id: &str, k: usize) -> EngineResult<Vec<Neighbor>> {
        let snapshot = self.vectors.snapshot();
        self.index.search_track(&snapshot, track_id, k)
    }

    /// # Errors
    ///
    /// [`EngineError::SessionNotFound`] for an unknown or expired session.
    pub fn session_view(&self, session_id: &str) -> EngineResult<SessionView> {
        let session = self
            .sessions
            .get(session_id, Instant::now())
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let state = session.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.view())
    }

    /// Discard a session. Returns whether it existed.
    pub fn end_session(&self, session_id: &str) -> bool {
        self.sessions.end(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
