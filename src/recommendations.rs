//! Precomputed neighbour lists.
//!
//! Each track keeps an ordered list of its nearest other tracks so the
//! serving path can continue a chain without a full search. Lists are
//! rebuilt offline (in full, or only for tracks that have none) and
//! published as one immutable map, like vector snapshots.

use crate::error::EngineResult;
use crate::index::SimilarityIndex;
use crate::vector_store::Snapshot;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Neighbour list of one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationList {
    pub track_id: String,
    /// Nearest first.
    pub recommended: Vec<String>,
    /// Unix seconds at which the list was computed.
    pub updated_at: u64,
}

/// Durable side of the recommendation store.
pub trait RecommendationPersistence: Send + Sync {
    fn load_recommendations(&self) -> anyhow::Result<Vec<RecommendationList>>;

    fn replace_recommendations(&self, lists: &[RecommendationList]) -> anyhow::Result<()>;

    fn upsert_recommendations(&self, lists: &[RecommendationList]) -> anyhow::Result<()>;
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

pub struct RecommendationStore {
    lists: RwLock<Arc<HashMap<String, RecommendationList>>>,
    writer: Mutex<()>,
    persistence: Option<Arc<dyn RecommendationPersistence>>,
}

impl Default for RecommendationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecommendationStore {
    pub fn new() -> Self {
        Self {
            lists: RwLock::new(Arc::new(HashMap::new())),
            writer: Mutex::new(()),
            persistence: None,
        }
    }

    pub fn with_persistence(persistence: Arc<dyn RecommendationPersistence>) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::new()
        }
    }

    fn current(&self) -> Arc<HashMap<String, RecommendationList>> {
        Arc::clone(&self.lists.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    pub fn get(&self, track_id: &str) -> Option<RecommendationList> {
        self.current().get(track_id).cloned()
    }

    /// Neighbour ids of `track_id`, nearest first. Empty when no list exists.
    pub fn neighbors(&self, track_id: &str) -> Vec<String> {
        self.current()
            .get(track_id)
            .map(|list| list.recommended.clone())
            .unwrap_or_default()
    }

    /// Tracks in `snapshot` that have no list yet.
    pub fn missing(&self, snapshot: &Snapshot) -> Vec<String> {
        let current = self.current();
        snapshot
            .ids()
            .iter()
            .filter(|id| !current.contains_key(id.as_str()))
            .cloned()
            .collect()
    }

    pub fn load(&self) -> EngineResult<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let lists = persistence.load_recommendations()?;
        debug!("Loaded {} recommendation lists", lists.len());
        self.publish(lists.into_iter().map(|l| (l.track_id.clone(), l)).collect());
        Ok(())
    }

    /// Replace every list.
    pub fn replace_all(&self, lists: Vec<RecommendationList>) -> EngineResult<()> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(persistence) = &self.persistence {
            persistence.replace_recommendations(&lists)?;
        }
        self.publish(lists.into_iter().map(|l| (l.track_id.clone(), l)).collect());
        Ok(())
    }

    /// Add or replace the given lists, leaving the others untouched.
    pub fn merge(&self, lists: Vec<RecommendationList>) -> EngineResult<()> {
        if lists.is_empty() {
            return Ok(());
        }
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(persistence) = &self.persistence {
            persistence.upsert_recommendations(&lists)?;
        }
        let mut next = (*self.current()).clone();
        for list in lists {
            next.insert(list.track_id.clone(), list);
        }
        self.publish(next);
        Ok(())
    }

    fn publish(&self, lists: HashMap<String, RecommendationList>) {
        *self.lists.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(lists);
    }
}

/// Compute neighbour lists for `only` (or every track in the snapshot).
/// Tracks whose search fails are skipped with a warning.
pub fn build_lists(
    snapshot: &Snapshot,
    index: &SimilarityIndex,
    top_n: usize,
    only: Option<&[String]>,
) -> Vec<RecommendationList> {
    let targets: Vec<&str> = match only {
        Some(ids) => ids.iter().map(String::as_str).collect(),
        None => snapshot.ids().iter().map(String::as_str).collect(),
    };
    let updated_at = unix_now();

    let lists: Vec<RecommendationList> = targets
        .par_iter()
        .filter_map(|&track_id| match index.search_track(snapshot, track_id, top_n) {
            Ok(neighbors) => Some(RecommendationList {
                track_id: track_id.to_string(),
                recommended: neighbors.into_iter().map(|n| n.track_id).collect(),
                updated_at,
            }),
            Err(err) => {
                warn!("No neighbour list for `{track_id}': {err}");
                None
            }
        })
        .collect();

    info!("Computed {} neighbour lists (top {top_n})", lists.len());
    lists
}
