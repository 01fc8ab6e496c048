//! In-memory catalog snapshot.
//!
//! Loaded once from the record store and swapped wholesale on reload, so
//! serving never touches the database. Keeps a per-language index for
//! filtered sampling.

use crate::track::{language_key, Track};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;

/// Rejection-sampling attempts before falling back to a full scan.
const SAMPLE_ATTEMPTS: usize = 16;

#[derive(Debug, Default)]
pub struct Catalog {
    tracks: Vec<Track>,
    by_id: HashMap<String, usize>,
    by_language: HashMap<String, Vec<usize>>,
}

impl Catalog {
    /// Build a catalog. A later record with an id already seen replaces the
    /// earlier one.
    pub fn new(records: Vec<Track>) -> Self {
        let mut tracks: Vec<Track> = Vec::with_capacity(records.len());
        let mut by_id = HashMap::with_capacity(records.len());

        for track in records {
            match by_id.get(&track.id) {
                Some(&idx) => tracks[idx] = track,
                None => {
                    by_id.insert(track.id.clone(), tracks.len());
                    tracks.push(track);
                }
            }
        }

        let mut by_language: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, track) in tracks.iter().enumerate() {
            if let Some(key) = track.language_key() {
                by_language.entry(key).or_default().push(idx);
            }
        }

        Self {
            tracks,
            by_id,
            by_language,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Track> {
        self.by_id.get(id).map(|&idx| &self.tracks[idx])
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Whether any track carries this language.
    pub fn has_language(&self, language: &str) -> bool {
        language_key(language).is_some_and(|key| self.by_language.contains_key(&key))
    }

    /// Uniformly sample a track accepted by `accept`, optionally restricted to
    /// one language. Returns `None` when nothing qualifies.
    pub fn sample<R, F>(&self, rng: &mut R, language: Option<&str>, mut accept: F) -> Option<&Track>
    where
        R: Rng + ?Sized,
        F: FnMut(&Track) -> bool,
    {
        let pool: Vec<usize> = match language.and_then(language_key) {
            Some(key) => self.by_language.get(&key)?.clone(),
            None => (0..self.tracks.len()).collect(),
        };
        if pool.is_empty() {
            return None;
        }

        for _ in 0..SAMPLE_ATTEMPTS {
            let idx = pool[rng.gen_range(0..pool.len())];
            if accept(&self.tracks[idx]) {
                return Some(&self.tracks[idx]);
            }
        }

        // Mostly-rejected pool: scan once and pick among what is left.
        let eligible: Vec<usize> = pool
            .into_iter()
            .filter(|&idx| accept(&self.tracks[idx]))
            .collect();
        eligible.choose(rng).map(|&idx| &self.tracks[idx])
    }
}
