//! # Vector Store
//!
//! Mapping from track id to embedding, published as immutable [`Snapshot`]s.
//!
//! Readers clone an `Arc<Snapshot>` and search it without holding any lock.
//! Writers build the next snapshot off to the side (copy-on-write for
//! upserts) and swap the pointer, so a search never sees a half-written
//! generation. Writers are serialised among themselves; an upsert racing a
//! search may or may not be visible to it.
//!
//! When a [`VectorPersistence`] backend is attached, every write reaches it
//! before the new snapshot is published.

use crate::error::{EngineError, EngineResult};
use crate::features::{l2_norm, Embedding, FeatureModel};
use clap::ValueEnum;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Offline build regime, shared by vector and neighbor-list builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Clear everything and recompute from the whole catalog.
    #[default]
    Full,
    /// Only compute what is missing and merge it in.
    Incremental,
}

/// Durable side of the vector store.
pub trait VectorPersistence: Send + Sync {
    fn load_vectors(&self) -> anyhow::Result<Vec<(String, Embedding)>>;

    /// Replace every stored vector (and the feature model, when given) in
    /// one atomic step.
    fn replace_vectors(
        &self,
        embeddings: &[(String, Embedding)],
        model: Option<&FeatureModel>,
    ) -> anyhow::Result<()>;

    fn upsert_vectors(&self, embeddings: &[(String, Embedding)]) -> anyhow::Result<()>;

    fn load_model(&self) -> anyhow::Result<Option<FeatureModel>>;
}

/// Immutable, internally consistent view of every embedding.
#[derive(Debug, Default)]
pub struct Snapshot {
    generation: u64,
    dimension: usize,
    ids: Vec<String>,
    /// Row-major, `ids.len() * dimension` values.
    matrix: Vec<f32>,
    norms: Vec<f32>,
    positions: HashMap<String, usize>,
}

impl Snapshot {
    /// Build a snapshot. A repeated id replaces the earlier row; rows must
    /// all share one dimension.
    pub fn new(generation: u64, embeddings: Vec<(String, Embedding)>) -> EngineResult<Self> {
        let mut snapshot = Self {
            generation,
            dimension: embeddings.first().map_or(0, |(_, e)| e.len()),
            ..Self::default()
        };
        for (id, embedding) in embeddings {
            snapshot.put(id, embedding)?;
        }
        Ok(snapshot)
    }

    fn put(&mut self, id: String, embedding: Embedding) -> EngineResult<()> {
        if embedding.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.len(),
            });
        }

        let norm = l2_norm(&embedding);
        match self.positions.get(&id) {
            Some(&row) => {
                let start = row * self.dimension;
                self.matrix[start..start + self.dimension].copy_from_slice(&embedding);
                self.norms[row] = norm;
            }
            None => {
                self.positions.insert(id.clone(), self.ids.len());
                self.ids.push(id);
                self.matrix.extend_from_slice(&embedding);
                self.norms.push(norm);
            }
        }
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn id(&self, row: usize) -> &str {
        &self.ids[row]
    }

    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.dimension;
        &self.matrix[start..start + self.dimension]
    }

    pub fn norm(&self, row: usize) -> f32 {
        self.norms[row]
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn embedding(&self, id: &str) -> Option<&[f32]> {
        self.position(id).map(|row| self.row(row))
    }

    /// Every `(id, embedding)` pair in row order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[f32])> + '_ {
        (0..self.len()).map(move |row| (self.id(row), self.row(row)))
    }

    /// Copy of this snapshot with `entries` merged in.
    fn with_upserts(&self, generation: u64, entries: &[(String, Embedding)]) -> EngineResult<Self> {
        let mut next = Self {
            generation,
            dimension: self.dimension,
            ids: self.ids.clone(),
            matrix: self.matrix.clone(),
            norms: self.norms.clone(),
            positions: self.positions.clone(),
        };
        if next.is_empty() {
            next.dimension = entries.first().map_or(0, |(_, e)| e.len());
        }
        for (id, embedding) in entries {
            next.put(id.clone(), embedding.clone())?;
        }
        Ok(next)
    }
}

pub struct VectorStore {
    current: RwLock<Arc<Snapshot>>,
    model: RwLock<Option<Arc<FeatureModel>>>,
    writer: Mutex<()>,
    generation: AtomicU64,
    persistence: Option<Arc<dyn VectorPersistence>>,
}

impl Default for VectorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorStore {
    /// Purely in-memory store.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            model: RwLock::new(None),
            writer: Mutex::new(()),
            generation: AtomicU64::new(0),
            persistence: None,
        }
    }

    pub fn with_persistence(persistence: Arc<dyn VectorPersistence>) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::new()
        }
    }

    /// Current snapshot. Cheap; never blocks on a rebuild in progress.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Feature model the current generation was built with, if known.
    pub fn feature_model(&self) -> Option<Arc<FeatureModel>> {
        self.model.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Re-read everything from the persistence backend and publish it.
    pub fn load(&self) -> EngineResult<Arc<Snapshot>> {
        let Some(persistence) = &self.persistence else {
            return Ok(self.snapshot());
        };

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let embeddings = persistence.load_vectors()?;
        let model = persistence.load_model()?;
        let snapshot = Snapshot::new(self.next_generation(), embeddings)?;
        debug!("Loaded {} vectors (dimension {})", snapshot.len(), snapshot.dimension());
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = model.map(Arc::new);
        Ok(self.publish(snapshot))
    }

    /// Replace the whole mapping.
    pub fn rebuild_all(&self, embeddings: Vec<(String, Embedding)>) -> EngineResult<Arc<Snapshot>> {
        self.replace(None, embeddings)
    }

    /// Replace the whole mapping together with the model that produced it.
    pub fn rebuild_generation(
        &self,
        model: FeatureModel,
        embeddings: Vec<(String, Embedding)>,
    ) -> EngineResult<Arc<Snapshot>> {
        self.replace(Some(model), embeddings)
    }

    fn replace(
        &self,
        model: Option<FeatureModel>,
        embeddings: Vec<(String, Embedding)>,
    ) -> EngineResult<Arc<Snapshot>> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = Snapshot::new(self.next_generation(), embeddings)?;
        if let Some(persistence) = &self.persistence {
            let rows: Vec<(String, Embedding)> = snapshot
                .entries()
                .map(|(id, row)| (id.to_string(), row.to_vec()))
                .collect();
            persistence.replace_vectors(&rows, model.as_ref())?;
        }

        info!(
            "Published vector generation {} ({} tracks, dimension {})",
            snapshot.generation(),
            snapshot.len(),
            snapshot.dimension()
        );
        if let Some(model) = model {
            *self.model.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(model));
        }
        Ok(self.publish(snapshot))
    }

    /// Add or replace one embedding.
    pub fn upsert(&self, id: &str, embedding: Embedding) -> EngineResult<Arc<Snapshot>> {
        self.upsert_batch(vec![(id.to_string(), embedding)])
    }

    /// Add or replace several embeddings as one new snapshot.
    pub fn upsert_batch(&self, entries: Vec<(String, Embedding)>) -> EngineResult<Arc<Snapshot>> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        if entries.is_empty() {
            return Ok(current);
        }

        let next = current.with_upserts(self.next_generation(), &entries)?;
        if let Some(persistence) = &self.persistence {
            persistence.upsert_vectors(&entries)?;
        }
        debug!("Upserted {} vectors into generation {}", entries.len(), next.generation());
        Ok(self.publish(next))
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Persistence that only counts writes.
    #[derive(Default)]
    struct CountingPersistence {
        replaced: Mutex<Vec<usize>>,
        upserted: Mutex<usize>,
    }

    impl VectorPersistence for CountingPersistence {
        fn load_vectors(&self) -> anyhow::Result<Vec<(String, Embedding)>> {
            Ok(Vec::new())
        }

        fn replace_vectors(
            &self,
            embeddings: &[(String, Embedding)],
            _model: Option<&FeatureModel>,
        ) -> anyhow::Result<()> {
            self.replaced.lock().expect("lock").push(embeddings.len());
            Ok(())
        }

        fn upsert_vectors(&self, _embeddings: &[(String, Embedding)]) -> anyhow::Result<()> {
            *self.upserted.lock().expect("lock") += 1;
            Ok(())
        }

        fn load_model(&self) -> anyhow::Result<Option<FeatureModel>> {
            Ok(None)
        }
    }

    fn entry(id: &str, values: &[f32]) -> (String, Embedding) {
        (id.to_string(), values.to_vec())
    }

    #[test]
    fn test_snapshot_rows_and_norms() {
        let snapshot = Snapshot::new(1, vec![entry("a", &[3.0, 4.0]), entry("b", &[0.0, 1.0])])
            .expect("consistent dimension");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.dimension(), 2);
        assert_eq!(snapshot.embedding("a"), Some(&[3.0, 4.0][..]));
        assert_eq!(snapshot.norm(0), 5.0);
        assert_eq!(snapshot.position("b"), Some(1));
    }

    #[test]
    fn test_duplicate_ids_supersede() {
        let snapshot = Snapshot::new(1, vec![entry("a", &[1.0]), entry("a", &[2.0])])
            .expect("consistent dimension");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.embedding("a"), Some(&[2.0][..]));
    }

    #[test]
    fn test_mixed_dimensions_rejected() {
        let err = Snapshot::new(1, vec![entry("a", &[1.0, 2.0]), entry("b", &[1.0])]).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 2, got: 1 }));
    }

    #[test]
    fn test_upsert_is_copy_on_write() {
        let store = VectorStore::new();
        store
            .rebuild_all(vec![entry("a", &[1.0, 0.0])])
            .expect("rebuild");
        let before = store.snapshot();

        store.upsert("b", vec![0.0, 1.0]).expect("upsert");
        store.upsert("a", vec![2.0, 2.0]).expect("upsert");

        assert_eq!(before.len(), 1);
        assert_eq!(before.embedding("a"), Some(&[1.0, 0.0][..]));

        let after = store.snapshot();
        assert_eq!(after.len(), 2);
        assert_eq!(after.embedding("a"), Some(&[2.0, 2.0][..]));
        assert!(after.generation() > before.generation());
    }

    #[test]
    fn test_upsert_wrong_dimension_keeps_snapshot() {
        let store = VectorStore::new();
        store.rebuild_all(vec![entry("a", &[1.0, 0.0])]).expect("rebuild");
        let generation = store.snapshot().generation();

        assert!(store.upsert("b", vec![1.0]).is_err());
        assert_eq!(store.snapshot().generation(), generation);
        assert!(!store.snapshot().contains("b"));
    }

    #[test]
    fn test_invalid_rebuild_is_not_persisted() {
        let persistence = Arc::new(CountingPersistence::default());
        let store = VectorStore::with_persistence(Arc::clone(&persistence) as Arc<dyn VectorPersistence>);
        store
            .rebuild_all(vec![entry("a", &[1.0, 0.0]), entry("a", &[0.0, 1.0]), entry("b", &[1.0, 1.0])])
            .expect("rebuild");
        let generation = store.snapshot().generation();
        assert_eq!(*persistence.replaced.lock().expect("lock"), vec![2]);

        let err = store
            .rebuild_all(vec![entry("c", &[1.0, 2.0]), entry("d", &[1.0])])
            .unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 2, got: 1 }));
        assert_eq!(*persistence.replaced.lock().expect("lock"), vec![2]);
        assert_eq!(store.snapshot().generation(), generation);
        assert!(store.snapshot().contains("a"));

        assert!(store.upsert("e", vec![1.0]).is_err());
        assert_eq!(*persistence.upserted.lock().expect("lock"), 0);
    }

    #[test]
    fn test_upsert_into_empty_store_sets_dimension() {
        let store = VectorStore::new();
        store.upsert("a", vec![1.0, 2.0, 3.0]).expect("upsert");
        assert_eq!(store.snapshot().dimension(), 3);
    }

    #[test]
    fn test_readers_never_see_partial_rows() {
        let store = Arc::new(VectorStore::new());
        store
            .rebuild_all((0..32).map(|i| (format!("t{i}"), vec![0.0; 8])).collect())
            .expect("rebuild");

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for round in 1..50 {
                    #[allow(clippy::cast_precision_loss)]
                    let value = round as f32;
                    let batch = (0..32).map(|i| (format!("t{i}"), vec![value; 8])).collect();
                    store.upsert_batch(batch).expect("upsert");
                }
            })
        };

        for _ in 0..200 {
            let snapshot = store.snapshot();
            let first = snapshot.row(0)[0];
            for (_, row) in snapshot.entries() {
                assert!(row.iter().all(|v| *v == first));
            }
        }
        writer.join().expect("writer thread");
    }
}
