//! # Feature Vector Builder
//!
//! Turns catalog records into fixed-length embeddings by concatenating four
//! weighted sub-vectors:
//!
//! ```text
//! embedding = [ text_stats * w_text | acoustic * w_acoustic | hook_ratio * w_hook | popularity * w_pop ]
//! ```
//!
//! - **Text statistics**: TF-IDF over a description built from the credited
//!   artists (twice), language (twice), label, year and type. The vocabulary
//!   is the batch's most frequent terms, capped at `max_vocabulary`.
//! - **Acoustic descriptor**: tempo, spectral centroid and cepstral
//!   coefficients from the acoustic-analysis collaborator. Missing or broken
//!   descriptors become zeros so one bad file never blocks a build.
//! - **Hook ratio**: hook position over duration, in `[0, 1]`.
//! - **Popularity**: min-max normalised against the batch.
//!
//! Everything here is pure; persistence belongs to the vector store.

use crate::error::EngineError;
use crate::track::{parse_timestamp, Track};
use log::{debug, trace, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A track embedding.
pub type Embedding = Vec<f32>;

/// Tempo + spectral centroid + 13 cepstral coefficients.
pub const ACOUSTIC_LEN: usize = 15;

/// Upper bound on the text vocabulary.
pub const DEFAULT_MAX_VOCABULARY: usize = 1000;

/// Sub-vector weights. A system-wide tuning constant, never per track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureWeights {
    pub text: f32,
    pub acoustic: f32,
    pub hook: f32,
    pub popularity: f32,
}

impl Default for FeatureWeights {
    fn default() -> Self {
        Self {
            text: 0.4,
            acoustic: 0.3,
            hook: 0.1,
            popularity: 0.2,
        }
    }
}

impl FeatureWeights {
    pub fn is_valid(&self) -> bool {
        [self.text, self.acoustic, self.hook, self.popularity]
            .iter()
            .all(|w| w.is_finite() && *w >= 0.0)
    }
}

/// Description string the text statistic is computed over. Repetition of
/// artists and language is intentional: it doubles their term weight.
pub fn describe(track: &Track) -> String {
    let artists = track.artists.unique_names().join(" ");
    let year = track.year.map(|y| y.to_string()).unwrap_or_default();
    format!(
        "{artists} {artists} {lang} {lang} {label} {year} {kind}",
        lang = track.language,
        label = track.label,
        kind = track.kind,
    )
}

/// Lowercase runs of at least two alphanumeric characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// TF-IDF statistic over a vocabulary fixed by one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextStatistics {
    /// Vocabulary, sorted alphabetically. Position is the component index.
    terms: Vec<String>,
    /// Smoothed inverse document frequency, parallel to `terms`.
    idf: Vec<f32>,
}

impl TextStatistics {
    /// Fix the vocabulary and document frequencies from a batch of
    /// descriptions.
    pub fn fit<'a, I>(documents: I, max_terms: usize) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut frequency: HashMap<String, u64> = HashMap::new();
        let mut document_frequency: HashMap<String, u64> = HashMap::new();
        let mut n_documents: u64 = 0;

        for document in documents {
            n_documents += 1;
            let tokens = tokenize(document);
            let mut seen = std::collections::HashSet::new();
            for token in tokens {
                *frequency.entry(token.clone()).or_default() += 1;
                if seen.insert(token.clone()) {
                    *document_frequency.entry(token).or_default() += 1;
                }
            }
        }

        let mut ranked: Vec<(String, u64)> = frequency.into_iter().collect();
        ranked.sort_by(|(term_a, a), (term_b, b)| b.cmp(a).then_with(|| term_a.cmp(term_b)));
        ranked.truncate(max_terms);

        let mut terms: Vec<String> = ranked.into_iter().map(|(term, _)| term).collect();
        terms.sort();

        #[allow(clippy::cast_precision_loss)]
        let n = n_documents as f64;
        let idf = terms
            .iter()
            .map(|term| {
                #[allow(clippy::cast_precision_loss)]
                let df = document_frequency.get(term).copied().unwrap_or(0) as f64;
                #[allow(clippy::cast_possible_truncation)]
                let value = (((1.0 + n) / (1.0 + df)).ln() + 1.0) as f32;
                value
            })
            .collect();

        debug!("Text vocabulary fixed at {} terms over {n_documents} documents", terms.len());
        Self { terms, idf }
    }

    /// Number of components produced by [`TextStatistics::transform`].
    pub fn dimension(&self) -> usize {
        self.terms.len()
    }

    /// TF-IDF vector of one description, L2-normalised.
    pub fn transform(&self, document: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.terms.len()];
        for token in tokenize(document) {
            if let Ok(idx) = self.terms.binary_search(&token) {
                vector[idx] += 1.0;
            }
        }
        for (value, idf) in vector.iter_mut().zip(&self.idf) {
            *value *= idf;
        }
        normalize_l2(&mut vector);
        vector
    }
}

/// Popularity range of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PopularityRange {
    pub min: u64,
    pub max: u64,
}

impl PopularityRange {
    pub fn of(tracks: &[Track]) -> Self {
        let min = tracks.iter().map(|t| t.popularity).min().unwrap_or(0);
        let max = tracks.iter().map(|t| t.popularity).max().unwrap_or(0);
        Self { min, max }
    }

    /// Min-max normalise. A flat batch maps everything to zero; values
    /// outside the fitted range are clamped.
    pub fn normalize(&self, popularity: u64) -> f32 {
        if self.max <= self.min {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = (popularity.saturating_sub(self.min)) as f64 / (self.max - self.min) as f64;
        #[allow(clippy::cast_possible_truncation)]
        let ratio = ratio.clamp(0.0, 1.0) as f32;
        ratio
    }
}

/// Hook position over duration, in `[0, 1]`. An explicit ratio wins over a
/// `mm:ss` hook; zero when there is no hook or no duration.
pub fn hook_ratio(track: &Track) -> f32 {
    let ratio = match (track.hook_ratio, &track.prime_hook, track.duration_secs) {
        (Some(ratio), _, _) => ratio,
        (None, Some(stamp), Some(duration)) if duration > 0.0 => {
            parse_timestamp(stamp).map_or(0.0, |seconds| seconds / duration)
        }
        _ => 0.0,
    };

    if ratio.is_finite() {
        #[allow(clippy::cast_possible_truncation)]
        let ratio = ratio.clamp(0.0, 1.0) as f32;
        ratio
    } else {
        0.0
    }
}

/// Source of precomputed acoustic descriptors.
pub trait AcousticSource {
    /// Descriptor for `track_id`, or why there is none.
    fn descriptor(&self, track_id: &str) -> Result<Vec<f32>, EngineError>;
}

impl AcousticSource for HashMap<String, Vec<f32>> {
    fn descriptor(&self, track_id: &str) -> Result<Vec<f32>, EngineError> {
        self.get(track_id)
            .cloned()
            .ok_or_else(|| EngineError::FeatureExtraction {
                track_id: track_id.to_string(),
                reason: "no acoustic descriptor recorded".to_string(),
            })
    }
}

/// Fetch a descriptor, degrading to zeros on any failure. The flag tells
/// whether the zero vector was substituted.
pub fn acoustic_or_zero<S>(source: &S, track_id: &str, len: usize) -> (Vec<f32>, bool)
where
    S: AcousticSource + ?Sized,
{
    let checked = source.descriptor(track_id).and_then(|descriptor| {
        if descriptor.len() != len {
            return Err(EngineError::FeatureExtraction {
                track_id: track_id.to_string(),
                reason: format!("descriptor has {} values, expected {len}", descriptor.len()),
            });
        }
        if descriptor.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::FeatureExtraction {
                track_id: track_id.to_string(),
                reason: "descriptor contains non-finite values".to_string(),
            });
        }
        Ok(descriptor)
    });

    match checked {
        Ok(descriptor) => (descriptor, false),
        Err(err) => {
            trace!("{err}; using zero acoustic vector");
            (vec![0.0; len], true)
        }
    }
}

/// Concatenate the weighted sub-vectors into one embedding.
pub fn fuse(
    text_stats: &[f32],
    acoustic: &[f32],
    hook_ratio: f32,
    popularity_norm: f32,
    weights: &FeatureWeights,
) -> Embedding {
    let mut embedding = Vec::with_capacity(text_stats.len() + acoustic.len() + 2);
    embedding.extend(text_stats.iter().map(|v| v * weights.text));
    embedding.extend(acoustic.iter().map(|v| v * weights.acoustic));
    embedding.push(hook_ratio * weights.hook);
    embedding.push(popularity_norm * weights.popularity);
    embedding
}

/// Everything fixed by one full build. Incremental builds reuse it so new
/// embeddings stay comparable with the existing generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureModel {
    pub text: TextStatistics,
    pub popularity: PopularityRange,
    pub acoustic_len: usize,
    pub weights: FeatureWeights,
}

impl FeatureModel {
    /// Fit the text vocabulary and popularity range to a batch.
    pub fn fit(tracks: &[Track], max_vocabulary: usize, acoustic_len: usize, weights: FeatureWeights) -> Self {
        let descriptions: Vec<String> = tracks.iter().map(describe).collect();
        Self {
            text: TextStatistics::fit(descriptions.iter().map(String::as_str), max_vocabulary),
            popularity: PopularityRange::of(tracks),
            acoustic_len,
            weights,
        }
    }

    /// Length of every embedding this model produces.
    pub fn dimension(&self) -> usize {
        self.text.dimension() + self.acoustic_len + 2
    }

    /// Build one track's embedding from its precomputed inputs.
    pub fn build(
        &self,
        track: &Track,
        text_stats: &[f32],
        acoustic: &[f32],
        hook_ratio: f32,
        popularity_norm: f32,
    ) -> Embedding {
        trace!("Fusing embedding for `{}'", track.id);
        fuse(text_stats, acoustic, hook_ratio, popularity_norm, &self.weights)
    }

    /// Derive every input for `track` and build its embedding. The flag is
    /// set when the acoustic descriptor had to be replaced by zeros.
    pub fn embed<S>(&self, track: &Track, acoustic: &S) -> (Embedding, bool)
    where
        S: AcousticSource + ?Sized,
    {
        let text_stats = self.text.transform(&describe(track));
        let (descriptor, degraded) = acoustic_or_zero(acoustic, &track.id, self.acoustic_len);
        let embedding = self.build(
            track,
            &text_stats,
            &descriptor,
            hook_ratio(track),
            self.popularity.normalize(track.popularity),
        );
        (embedding, degraded)
    }

    /// Embed a batch in parallel. Returns the embeddings and how many fell
    /// back to a zero acoustic vector.
    pub fn embed_batch<S>(&self, tracks: &[Track], acoustic: &S) -> (Vec<(String, Embedding)>, usize)
    where
        S: AcousticSource + Sync + ?Sized,
    {
        let built: Vec<(String, Embedding, bool)> = tracks
            .par_iter()
            .map(|track| {
                let (embedding, degraded) = self.embed(track, acoustic);
                (track.id.clone(), embedding, degraded)
            })
            .collect();

        let degraded = built.iter().filter(|(_, _, degraded)| *degraded).count();
        if degraded > 0 {
            warn!("{degraded} of {} tracks had no usable acoustic descriptor", built.len());
        }

        let embeddings = built.into_iter().map(|(id, embedding, _)| (id, embedding)).collect();
        (embeddings, degraded)
    }
}

/// Scale to unit L2 norm in place. Zero or non-finite norms leave the
/// vector untouched and return `false`.
pub fn normalize_l2(values: &mut [f32]) -> bool {
    let norm = l2_norm(values);
    if !norm.is_finite() || norm <= 0.0 {
        return false;
    }
    for value in values.iter_mut() {
        *value /= norm;
    }
    true
}

pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::ArtistCredits;

    fn track(id: &str, artist: &str, language: &str, popularity: u64) -> Track {
        Track {
            id: id.to_string(),
            artists: ArtistCredits::primary([artist]),
            language: language.to_string(),
            label: "Label".to_string(),
            year: Some(2020),
            kind: "song".to_string(),
            duration_secs: Some(200.0),
            popularity,
            ..Track::default()
        }
    }

    #[test]
    fn test_describe_repeats_artists_and_language() {
        let t = track("a", "Nusrat", "urdu", 0);
        let tokens = tokenize(&describe(&t));
        assert_eq!(tokens.iter().filter(|t| *t == "nusrat").count(), 2);
        assert_eq!(tokens.iter().filter(|t| *t == "urdu").count(), 2);
        assert!(tokens.contains(&"2020".to_string()));
    }

    #[test]
    fn test_tokenize_drops_single_characters() {
        assert_eq!(tokenize("A b-CD ef!"), vec!["cd", "ef"]);
    }

    #[test]
    fn test_vocabulary_is_capped_by_frequency() {
        let docs = ["alpha alpha beta", "alpha gamma", "beta delta"];
        let stats = TextStatistics::fit(docs.iter().copied(), 2);
        assert_eq!(stats.terms, vec!["alpha", "beta"]);
        assert_eq!(stats.dimension(), 2);
    }

    #[test]
    fn test_transform_is_unit_length_and_ignores_unknown_terms() {
        let docs = ["rock guitar", "pop synth", "rock synth"];
        let stats = TextStatistics::fit(docs.iter().copied(), 10);

        let v = stats.transform("rock synth");
        assert!((l2_norm(&v) - 1.0).abs() < 1e-5);

        let unknown = stats.transform("jazz zz");
        assert!(unknown.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_rarer_terms_weigh_more() {
        let docs = ["common rare", "common", "common"];
        let stats = TextStatistics::fit(docs.iter().copied(), 10);
        let v = stats.transform("common rare");
        let common = stats.terms.binary_search(&"common".to_string()).unwrap();
        let rare = stats.terms.binary_search(&"rare".to_string()).unwrap();
        assert!(v[rare] > v[common]);
    }

    #[test]
    fn test_hook_ratio_sources() {
        let mut t = track("a", "x", "y", 0);
        assert_eq!(hook_ratio(&t), 0.0);

        t.prime_hook = Some("00:50".to_string());
        assert!((hook_ratio(&t) - 0.25).abs() < 1e-6);

        t.hook_ratio = Some(0.6);
        assert!((hook_ratio(&t) - 0.6).abs() < 1e-6);

        t.hook_ratio = Some(4.0);
        assert_eq!(hook_ratio(&t), 1.0);

        t.hook_ratio = None;
        t.duration_secs = None;
        assert_eq!(hook_ratio(&t), 0.0);

        t.duration_secs = Some(100.0);
        t.prime_hook = Some("garbage".to_string());
        assert_eq!(hook_ratio(&t), 0.0);
    }

    #[test]
    fn test_popularity_min_max() {
        let tracks = vec![track("a", "x", "y", 10), track("b", "x", "y", 30)];
        let range = PopularityRange::of(&tracks);
        assert_eq!(range.normalize(10), 0.0);
        assert_eq!(range.normalize(20), 0.5);
        assert_eq!(range.normalize(30), 1.0);
        assert_eq!(range.normalize(99), 1.0);

        let flat = PopularityRange { min: 5, max: 5 };
        assert_eq!(flat.normalize(5), 0.0);
    }

    #[test]
    fn test_missing_acoustic_degrades_to_zero() {
        let mut source: HashMap<String, Vec<f32>> = HashMap::new();
        source.insert("good".to_string(), vec![1.0; ACOUSTIC_LEN]);
        source.insert("short".to_string(), vec![1.0; 3]);
        source.insert("nan".to_string(), vec![f32::NAN; ACOUSTIC_LEN]);

        assert_eq!(acoustic_or_zero(&source, "good", ACOUSTIC_LEN), (vec![1.0; ACOUSTIC_LEN], false));
        for id in ["short", "nan", "missing"] {
            let (v, degraded) = acoustic_or_zero(&source, id, ACOUSTIC_LEN);
            assert!(degraded);
            assert_eq!(v, vec![0.0; ACOUSTIC_LEN]);
        }
    }

    #[test]
    fn test_fuse_applies_weights_in_order() {
        let weights = FeatureWeights::default();
        let embedding = fuse(&[1.0, 0.0], &[2.0], 0.5, 1.0, &weights);
        let expected = [0.4, 0.0, 0.6, 0.05, 0.2];
        assert_eq!(embedding.len(), expected.len());
        for (got, want) in embedding.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_batch_embeddings_share_dimension() {
        let tracks = vec![
            track("a", "Artist One", "hindi", 1),
            track("b", "Artist Two", "tamil", 5),
            track("c", "Artist One", "tamil", 9),
        ];
        let model = FeatureModel::fit(&tracks, DEFAULT_MAX_VOCABULARY, ACOUSTIC_LEN, FeatureWeights::default());
        let source: HashMap<String, Vec<f32>> = HashMap::new();

        let (embeddings, degraded) = model.embed_batch(&tracks, &source);
        assert_eq!(degraded, 3);
        assert_eq!(embeddings.len(), 3);
        assert!(embeddings.iter().all(|(_, e)| e.len() == model.dimension()));
        assert_eq!(embeddings[0].0, "a");
    }

    #[test]
    fn test_weights_validation() {
        assert!(FeatureWeights::default().is_valid());
        let bad = FeatureWeights { text: -0.1, ..FeatureWeights::default() };
        assert!(!bad.is_valid());
    }
}
