//! SQLite record store.
//!
//! Holds the catalog as delivered by ingestion, the acoustic descriptors
//! from the analysis collaborator, and the engine's derived data: vectors,
//! the feature model that produced them and neighbour lists. Embeddings and
//! descriptors are stored as little-endian `f32` blobs.

use crate::features::{Embedding, FeatureModel};
use crate::recommendations::{unix_now, RecommendationList, RecommendationPersistence};
use crate::track::{ArtistCredits, Track};
use crate::vector_store::VectorPersistence;
use anyhow::{bail, Context, Result};
use log::{debug, trace};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const TRACK_COLUMNS: &str = "id, artists, language, label, year, kind, duration_secs, popularity, \
                             stream_url, hook_ratio, prime_hook";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Create every table if missing. Safe to call on an existing database.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tracks (
            id            TEXT PRIMARY KEY,
            artists       TEXT NOT NULL,
            language      TEXT NOT NULL,
            label         TEXT NOT NULL,
            year          INTEGER,
            kind          TEXT NOT NULL,
            duration_secs REAL,
            popularity    INTEGER NOT NULL DEFAULT 0,
            stream_url    TEXT NOT NULL,
            hook_ratio    REAL,
            prime_hook    TEXT,
            updated_at    INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tracks_language ON tracks(language);
        CREATE TABLE IF NOT EXISTS acoustic_features (
            track_id   TEXT PRIMARY KEY,
            descriptor BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS track_vectors (
            track_id   TEXT PRIMARY KEY,
            dim        INTEGER NOT NULL,
            vector     BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS track_recommendations (
            track_id    TEXT PRIMARY KEY,
            recommended TEXT NOT NULL,
            updated_at  INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS feature_model (
            id         INTEGER PRIMARY KEY CHECK (id = 1),
            model      TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );",
    )
    .context("Failed to create database schema")
}

pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        bail!("Vector blob of {} bytes is not a whole number of f32 values", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<(Track, String)> {
    let artists: String = row.get(1)?;
    let popularity: i64 = row.get(7)?;
    let track = Track {
        id: row.get(0)?,
        artists: ArtistCredits::default(),
        language: row.get(2)?,
        label: row.get(3)?,
        year: row.get(4)?,
        kind: row.get(5)?,
        duration_secs: row.get(6)?,
        popularity: from_sql_int(popularity),
        stream_url: row.get(8)?,
        hook_ratio: row.get(9)?,
        prime_hook: row.get(10)?,
    };
    Ok((track, artists))
}

fn with_artists((mut track, artists): (Track, String)) -> Result<Track> {
    track.artists = serde_json::from_str(&artists)
        .with_context(|| format!("Malformed artist credits for track `{}'", track.id))?;
    Ok(track)
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or update catalog records. Idempotent.
    pub fn upsert_tracks(&self, tracks: &[Track]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = to_sql_int(unix_now());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO tracks (id, artists, language, label, year, kind, duration_secs,
                                     popularity, stream_url, hook_ratio, prime_hook, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    artists = excluded.artists, language = excluded.language,
                    label = excluded.label, year = excluded.year, kind = excluded.kind,
                    duration_secs = excluded.duration_secs, popularity = excluded.popularity,
                    stream_url = excluded.stream_url, hook_ratio = excluded.hook_ratio,
                    prime_hook = excluded.prime_hook, updated_at = excluded.updated_at",
            )?;

            for track in tracks {
                let artists = serde_json::to_string(&track.artists)?;
                stmt.execute(params![
                    track.id,
                    artists,
                    track.language,
                    track.label,
                    track.year,
                    track.kind,
                    track.duration_secs,
                    to_sql_int(track.popularity),
                    track.stream_url,
                    track.hook_ratio,
                    track.prime_hook,
                    now,
                ])
                .with_context(|| format!("Failed to upsert track `{}'", track.id))?;
            }
        }
        tx.commit().context("Committing track upsert failed")?;
        debug!("Upserted {} tracks", tracks.len());
        Ok(tracks.len())
    }

    pub fn load_tracks(&self) -> Result<Vec<Track>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {TRACK_COLUMNS} FROM tracks ORDER BY id"))?;
        let rows = stmt
            .query_map([], track_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read tracks")?;
        rows.into_iter().map(with_artists).collect()
    }

    pub fn track(&self, id: &str) -> Result<Option<Track>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = ?1"),
                [id],
                track_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to read track `{id}'"))?;
        row.map(with_artists).transpose()
    }

    pub fn track_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Store acoustic descriptors, replacing any earlier descriptor of the
    /// same track.
    pub fn store_acoustic(&self, features: &HashMap<String, Vec<f32>>) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO acoustic_features (track_id, descriptor) VALUES (?1, ?2)
                 ON CONFLICT(track_id) DO UPDATE SET descriptor = excluded.descriptor",
            )?;
            for (track_id, descriptor) in features {
                stmt.execute(params![track_id, encode_vector(descriptor)])
                    .with_context(|| format!("Failed to store descriptor of `{track_id}'"))?;
            }
        }
        tx.commit().context("Committing acoustic descriptors failed")?;
        Ok(features.len())
    }

    pub fn load_acoustic_features(&self) -> Result<HashMap<String, Vec<f32>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT track_id, descriptor FROM acoustic_features")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read acoustic descriptors")?;

        rows.into_iter()
            .map(|(id, blob)| decode_vector(&blob).map(|descriptor| (id, descriptor)))
            .collect()
    }

    pub fn vector_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM track_vectors", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn insert_vectors(tx: &rusqlite::Transaction<'_>, embeddings: &[(String, Embedding)], now: i64) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO track_vectors (track_id, dim, vector, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(track_id) DO UPDATE SET
            dim = excluded.dim, vector = excluded.vector, updated_at = excluded.updated_at",
    )?;
    for (track_id, embedding) in embeddings {
        let dim = i64::try_from(embedding.len()).unwrap_or(i64::MAX);
        stmt.execute(params![track_id, dim, encode_vector(embedding), now])
            .with_context(|| format!("Failed to store vector of `{track_id}'"))?;
    }
    Ok(())
}

impl VectorPersistence for SqliteStore {
    fn load_vectors(&self) -> Result<Vec<(String, Embedding)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT track_id, dim, vector FROM track_vectors ORDER BY track_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read vectors")?;

        rows.into_iter()
            .map(|(id, dim, blob)| {
                let vector = decode_vector(&blob)?;
                if i64::try_from(vector.len()).ok() != Some(dim) {
                    bail!("Vector of `{id}' has {} values but records dimension {dim}", vector.len());
                }
                Ok((id, vector))
            })
            .collect()
    }

    fn replace_vectors(&self, embeddings: &[(String, Embedding)], model: Option<&FeatureModel>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = to_sql_int(unix_now());

        tx.execute("DELETE FROM track_vectors", [])?;
        insert_vectors(&tx, embeddings, now)?;
        if let Some(model) = model {
            let json = serde_json::to_string(model).context("Failed to serialise feature model")?;
            tx.execute(
                "INSERT INTO feature_model (id, model, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET model = excluded.model, updated_at = excluded.updated_at",
                params![json, now],
            )?;
        }

        tx.commit().context("Committing vector generation failed")?;
        debug!("Replaced stored vectors with {} rows", embeddings.len());
        Ok(())
    }

    fn upsert_vectors(&self, embeddings: &[(String, Embedding)]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        insert_vectors(&tx, embeddings, to_sql_int(unix_now()))?;
        tx.commit().context("Committing vector upsert failed")?;
        trace!("Upserted {} stored vectors", embeddings.len());
        Ok(())
    }

    fn load_model(&self) -> Result<Option<FeatureModel>> {
        let conn = self.conn();
        let json: Option<String> = conn
            .query_row("SELECT model FROM feature_model WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        json.map(|json| serde_json::from_str(&json).context("Malformed stored feature model"))
            .transpose()
    }
}

fn insert_lists(tx: &rusqlite::Transaction<'_>, lists: &[RecommendationList]) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO track_recommendations (track_id, recommended, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(track_id) DO UPDATE SET
            recommended = excluded.recommended, updated_at = excluded.updated_at",
    )?;
    for list in lists {
        let recommended = serde_json::to_string(&list.recommended)?;
        stmt.execute(params![list.track_id, recommended, to_sql_int(list.updated_at)])
            .with_context(|| format!("Failed to store neighbour list of `{}'", list.track_id))?;
    }
    Ok(())
}

impl RecommendationPersistence for SqliteStore {
    fn load_recommendations(&self) -> Result<Vec<RecommendationList>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT track_id, recommended, updated_at FROM track_recommendations ORDER BY track_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read neighbour lists")?;

        rows.into_iter()
            .map(|(track_id, recommended, updated_at)| {
                let recommended = serde_json::from_str(&recommended)
                    .with_context(|| format!("Malformed neighbour list of `{track_id}'"))?;
                Ok(RecommendationList {
                    track_id,
                    recommended,
                    updated_at: from_sql_int(updated_at),
                })
            })
            .collect()
    }

    fn replace_recommendations(&self, lists: &[RecommendationList]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM track_recommendations", [])?;
        insert_lists(&tx, lists)?;
        tx.commit().context("Committing neighbour lists failed")?;
        Ok(())
    }

    fn upsert_recommendations(&self, lists: &[RecommendationList]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        insert_lists(&tx, lists)?;
        tx.commit().context("Committing neighbour lists failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureWeights, ACOUSTIC_LEN};
    use tempfile::TempDir;

    fn track(id: &str) -> Track {
        Track {
            id: id.to_string(),
            artists: ArtistCredits::primary(["Someone"]),
            language: "hindi".to_string(),
            year: Some(2019),
            popularity: 42,
            prime_hook: Some("00:30".to_string()),
            ..Track::default()
        }
    }

    #[test]
    fn test_tracks_round_trip_and_upsert() {
        let store = SqliteStore::open_in_memory().expect("db");
        store.upsert_tracks(&[track("a"), track("b")]).expect("insert");

        let mut changed = track("a");
        changed.popularity = 7;
        store.upsert_tracks(&[changed.clone()]).expect("update");

        assert_eq!(store.track_count().expect("count"), 2);
        assert_eq!(store.track("a").expect("read"), Some(changed));
        assert_eq!(store.track("zzz").expect("read"), None);
        assert_eq!(store.load_tracks().expect("read").len(), 2);
    }

    #[test]
    fn test_vectors_replace_and_upsert() {
        let store = SqliteStore::open_in_memory().expect("db");
        store
            .replace_vectors(&[("a".to_string(), vec![1.0, 2.0])], None)
            .expect("replace");
        store.upsert_vectors(&[("b".to_string(), vec![3.0, 4.0])]).expect("upsert");
        assert_eq!(store.vector_count().expect("count"), 2);

        store
            .replace_vectors(&[("c".to_string(), vec![5.0, 6.0])], None)
            .expect("replace");
        assert_eq!(store.load_vectors().expect("load"), vec![("c".to_string(), vec![5.0, 6.0])]);
    }

    #[test]
    fn test_feature_model_persists() {
        let store = SqliteStore::open_in_memory().expect("db");
        assert_eq!(store.load_model().expect("load"), None);

        let model = FeatureModel::fit(&[track("a")], 100, ACOUSTIC_LEN, FeatureWeights::default());
        store.replace_vectors(&[], Some(&model)).expect("replace");
        assert_eq!(store.load_model().expect("load"), Some(model));
    }

    #[test]
    fn test_recommendations_round_trip() {
        let store = SqliteStore::open_in_memory().expect("db");
        let list = RecommendationList {
            track_id: "a".to_string(),
            recommended: vec!["b".to_string(), "c".to_string()],
            updated_at: 1_700_000_000,
        };
        store.replace_recommendations(&[list.clone()]).expect("replace");
        assert_eq!(store.load_recommendations().expect("load"), vec![list]);
    }

    #[test]
    fn test_acoustic_features_on_disk() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested/catalog.db");
        let mut features = HashMap::new();
        features.insert("a".to_string(), vec![0.5; ACOUSTIC_LEN]);

        {
            let store = SqliteStore::open(&path).expect("db");
            store.store_acoustic(&features).expect("store");
        }
        let reopened = SqliteStore::open(&path).expect("reopen");
        assert_eq!(reopened.load_acoustic_features().expect("load"), features);
    }

    #[test]
    fn test_decode_rejects_ragged_blob() {
        assert!(decode_vector(&[0, 0, 0]).is_err());
        assert_eq!(decode_vector(&encode_vector(&[1.5, -2.0])).expect("decode"), vec![1.5, -2.0]);
    }
}
