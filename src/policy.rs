//! # Session Policy
//!
//! Chooses the next track for one session request and advances the
//! session's state. Sources are tried in tiers, first success wins:
//!
//! | State / action     | Sources                                        | Next state                     |
//! |--------------------|------------------------------------------------|--------------------------------|
//! | no anchor, first   | random (language-filtered)                     | out of chain, skips = 0        |
//! | liked              | taste search → neighbour list → random         | in chain if chained, skips = 0 |
//! | 1st skip           | taste search → neighbour list → random         | unchanged, skips = 1           |
//! | 2nd skip           | anchor search → random                         | unchanged, skips = 2           |
//! | 3rd skip           | random in best language                        | out of chain, skips = 0        |
//!
//! Every candidate must exist in the catalog, be absent from the session's
//! anti-repeat cache and match the request's language filter. Lookup
//! failures count as "no candidate". A chained pick is replaced by a random
//! one with the configured exploration probability. Random sampling only
//! fails on an empty catalog.

use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};
use crate::index::SimilarityIndex;
use crate::recommendations::RecommendationStore;
use crate::session::{ChainState, PlayedCache, SessionState};
use crate::track::{language_key, Track};
use crate::vector_store::Snapshot;
use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Listener feedback carried by a request, about the current anchor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// First request, or no feedback.
    #[default]
    First,
    Liked,
    Skipped,
    HardSkipped,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "first" => Ok(Self::First),
            "like" | "liked" => Ok(Self::Liked),
            "skip" | "skipped" => Ok(Self::Skipped),
            "hard" | "hard_skip" | "hard-skip" | "hard_skipped" | "hard-skipped" => Ok(Self::HardSkipped),
            other => Err(format!("unknown action `{other}'")),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::First => "first",
            Self::Liked => "liked",
            Self::Skipped => "skipped",
            Self::HardSkipped => "hard_skipped",
        };
        f.write_str(name)
    }
}

/// Which tier produced a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Random,
    Taste,
    RecommendationList,
    AnchorSearch,
    /// Random pick after the third consecutive skip.
    LanguageReset,
    /// Chained pick discarded by the exploration draw.
    Exploration,
}

impl Source {
    /// Whether the source continues a similarity chain.
    pub fn is_chained(self) -> bool {
        matches!(self, Self::Taste | Self::RecommendationList | Self::AnchorSearch)
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub track_id: String,
    pub source: Source,
    pub chain: ChainState,
    pub skip_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyConfig {
    /// Similarity hits fetched per search before filtering.
    pub candidate_pool: usize,
    pub exploration_probability: f64,
    pub like_weight: f32,
    pub hard_skip_weight: f32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            candidate_pool: 50,
            exploration_probability: 0.15,
            like_weight: 1.0,
            hard_skip_weight: -0.2,
        }
    }
}

/// Shared read-only inputs of a decision.
pub struct PolicyContext<'a> {
    pub catalog: &'a Catalog,
    pub snapshot: &'a Snapshot,
    pub index: &'a SimilarityIndex,
    pub recommendations: &'a RecommendationStore,
    pub config: PolicyConfig,
}

/// Candidate filter of one request.
struct Eligibility<'a> {
    catalog: &'a Catalog,
    played: &'a PlayedCache,
    language: Option<&'a str>,
    now: Instant,
}

impl Eligibility<'_> {
    fn accepts_track(&self, track: &Track) -> bool {
        !self.played.contains(&track.id, self.now)
            && self
                .language
                .map_or(true, |lang| track.language_key().as_deref() == Some(lang))
    }

    fn accepts(&self, track_id: &str) -> bool {
        let ok = self.catalog.get(track_id).is_some_and(|t| self.accepts_track(t));
        if !ok {
            trace!("Rejected candidate `{track_id}'");
        }
        ok
    }

    fn first<I, S>(&self, candidates: I) -> Option<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        candidates
            .into_iter()
            .find(|id| self.accepts(id.as_ref()))
            .map(|id| id.as_ref().to_string())
    }
}

/// Decide the next track for `state` and apply the transition.
///
/// # Errors
///
/// Only [`EngineError::CatalogEmpty`].
pub fn decide(
    ctx: &PolicyContext<'_>,
    state: &mut SessionState,
    action: Action,
    language: Option<&str>,
    now: Instant,
) -> EngineResult<Decision> {
    if ctx.catalog.is_empty() {
        return Err(EngineError::CatalogEmpty);
    }
    state.played.evict_expired(now);
    let filter = language.and_then(language_key);

    let anchor = match state.anchor.clone() {
        Some(anchor) if state.chain != ChainState::NoAnchor && action != Action::First => anchor,
        _ => {
            let track_id = random_pick(ctx.catalog, &state.played, &mut state.rng, filter.as_deref(), now)?;
            debug!("Session `{}': fresh start with `{track_id}'", state.id);
            return Ok(commit(state, track_id, Source::Random, ChainState::OutOfChain, 0, now));
        }
    };

    apply_feedback(ctx, state, &anchor, action);

    let (picked, skip_count) = match action {
        Action::Liked => (chained(ctx, state, &anchor, filter.as_deref(), now, &[Source::Taste, Source::RecommendationList]), 0),
        _ => {
            let skips = state.skip_count + 1;
            match skips {
                1 => (chained(ctx, state, &anchor, filter.as_deref(), now, &[Source::Taste, Source::RecommendationList]), 1),
                2 => (chained(ctx, state, &anchor, filter.as_deref(), now, &[Source::AnchorSearch]), 2),
                _ => {
                    // A request filter outranks the learned preference.
                    let reset_language = filter.clone().or_else(|| {
                        state
                            .languages
                            .best()
                            .filter(|best| ctx.catalog.has_language(best))
                            .map(str::to_string)
                    });
                    let track_id = random_pick(
                        ctx.catalog,
                        &state.played,
                        &mut state.rng,
                        reset_language.as_deref(),
                        now,
                    )?;
                    debug!(
                        "Session `{}': skip limit reached, reset to `{track_id}' ({})",
                        state.id,
                        reset_language.as_deref().unwrap_or("any language")
                    );
                    return Ok(commit(state, track_id, Source::LanguageReset, ChainState::OutOfChain, 0, now));
                }
            }
        }
    };

    let Some((track_id, source)) = picked else {
        let track_id = random_pick(ctx.catalog, &state.played, &mut state.rng, filter.as_deref(), now)?;
        debug!("Session `{}': no chained candidate, random `{track_id}'", state.id);
        return Ok(commit(state, track_id, Source::Random, ChainState::OutOfChain, skip_count, now));
    };

    let p = ctx.config.exploration_probability;
    if p.is_finite() && p > 0.0 && state.rng.gen_bool(p.min(1.0)) {
        let explored = random_pick(ctx.catalog, &state.played, &mut state.rng, filter.as_deref(), now)?;
        debug!(
            "Session `{}': exploring `{explored}' instead of `{track_id}' ({source:?})",
            state.id
        );
        return Ok(commit(state, explored, Source::Exploration, ChainState::OutOfChain, 0, now));
    }

    let chain = match action {
        Action::Liked => ChainState::InChain,
        _ => state.chain,
    };
    debug!("Session `{}': `{track_id}' from {source:?}", state.id);
    Ok(commit(state, track_id, source, chain, skip_count, now))
}

/// Language score and taste updates for feedback about `anchor`.
fn apply_feedback(ctx: &PolicyContext<'_>, state: &mut SessionState, anchor: &str, action: Action) {
    if let Some(key) = ctx.catalog.get(anchor).and_then(Track::language_key) {
        match action {
            Action::Liked => state.languages.adjust(&key, 1),
            Action::Skipped | Action::HardSkipped => state.languages.adjust(&key, -1),
            Action::First => {}
        }
    }

    let weight = match action {
        Action::Liked => ctx.config.like_weight,
        Action::HardSkipped => ctx.config.hard_skip_weight,
        Action::Skipped | Action::First => return,
    };
    match ctx.snapshot.embedding(anchor) {
        Some(embedding) => state.taste.reinforce(embedding, weight),
        None => trace!("No embedding for `{anchor}', taste unchanged"),
    }
}

/// Try each chained source in order.
fn chained(
    ctx: &PolicyContext<'_>,
    state: &SessionState,
    anchor: &str,
    language: Option<&str>,
    now: Instant,
    sources: &[Source],
) -> Option<(String, Source)> {
    let eligible = Eligibility {
        catalog: ctx.catalog,
        played: &state.played,
        language,
        now,
    };
    let pool = ctx.config.candidate_pool.max(1);

    sources.iter().find_map(|&source| {
        let found = match source {
            Source::Taste => state.taste.embedding().filter(|_| state.taste.is_active()).and_then(|taste| {
                match ctx.index.search(ctx.snapshot, taste, pool, Some(anchor)) {
                    Ok(hits) => eligible.first(hits.iter().map(|n| n.track_id.as_str())),
                    Err(err) => {
                        warn!("Taste search failed: {err}");
                        None
                    }
                }
            }),
            Source::RecommendationList => eligible.first(ctx.recommendations.neighbors(anchor)),
            Source::AnchorSearch => match ctx.index.search_track(ctx.snapshot, anchor, pool) {
                Ok(hits) => eligible.first(hits.iter().map(|n| n.track_id.as_str())),
                Err(err) => {
                    warn!("Similarity search from `{anchor}' failed: {err}");
                    None
                }
            },
            Source::Random | Source::LanguageReset | Source::Exploration => None,
        };
        if found.is_none() {
            trace!("{source:?} produced no candidate");
        }
        found.map(|track_id| (track_id, source))
    })
}

/// Uniform random pick, widening until something qualifies: unplayed in
/// `language`, any unplayed, least recently served, anything.
fn random_pick(
    catalog: &Catalog,
    played: &PlayedCache,
    rng: &mut StdRng,
    language: Option<&str>,
    now: Instant,
) -> EngineResult<String> {
    let unplayed = |track: &Track| !played.contains(&track.id, now);

    if let Some(track) = catalog.sample(rng, language, unplayed) {
        return Ok(track.id.clone());
    }
    if language.is_some() {
        if let Some(track) = catalog.sample(rng, None, unplayed) {
            debug!("No unplayed track in {language:?}, widening to every language");
            return Ok(track.id.clone());
        }
    }
    if let Some(oldest) = played.oldest(now).filter(|id| catalog.get(id).is_some()) {
        debug!("Every track was served recently, repeating the oldest");
        return Ok(oldest.to_string());
    }
    catalog
        .sample(rng, None, |_| true)
        .map(|track| track.id.clone())
        .ok_or(EngineError::CatalogEmpty)
}

fn commit(
    state: &mut SessionState,
    track_id: String,
    source: Source,
    chain: ChainState,
    skip_count: u32,
    now: Instant,
) -> Decision {
    state.played.mark(&track_id, now);
    state.anchor = Some(track_id.clone());
    state.chain = chain;
    state.skip_count = skip_count;
    Decision {
        track_id,
        source,
        chain,
        skip_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Metric, SearchStrategy};
    use crate::recommendations::RecommendationList;
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(86_400);

    fn track(id: &str, language: &str) -> Track {
        Track {
            id: id.to_string(),
            language: language.to_string(),
            ..Track::default()
        }
    }

    struct Fixture {
        catalog: Catalog,
        snapshot: Snapshot,
        index: SimilarityIndex,
        recommendations: RecommendationStore,
    }

    impl Fixture {
        fn new(tracks: Vec<Track>) -> Self {
            Self {
                catalog: Catalog::new(tracks),
                snapshot: Snapshot::default(),
                index: SimilarityIndex::new(Metric::Cosine, SearchStrategy::Exact, 0),
                recommendations: RecommendationStore::new(),
            }
        }

        fn ctx(&self) -> PolicyContext<'_> {
            PolicyContext {
                catalog: &self.catalog,
                snapshot: &self.snapshot,
                index: &self.index,
                recommendations: &self.recommendations,
                config: PolicyConfig {
                    exploration_probability: 0.0,
                    ..PolicyConfig::default()
                },
            }
        }

        fn list(&self, id: &str, recs: &[&str]) {
            self.recommendations
                .merge(vec![RecommendationList {
                    track_id: id.to_string(),
                    recommended: recs.iter().map(|s| (*s).to_string()).collect(),
                    updated_at: 0,
                }])
                .expect("merge");
        }
    }

    fn anchored(anchor: &str, chain: ChainState, now: Instant) -> SessionState {
        let mut state = SessionState::new("s", DAY, Some(3));
        state.anchor = Some(anchor.to_string());
        state.chain = chain;
        state.played.mark(anchor, now);
        state
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("like".parse::<Action>(), Ok(Action::Liked));
        assert_eq!(" Skipped ".parse::<Action>(), Ok(Action::Skipped));
        assert_eq!("hard_skip".parse::<Action>(), Ok(Action::HardSkipped));
        assert_eq!("".parse::<Action>(), Ok(Action::First));
        assert!("love".parse::<Action>().is_err());
        assert_eq!(Action::HardSkipped.to_string(), "hard_skipped");
    }

    #[test]
    fn test_empty_catalog_is_an_error() {
        let fixture = Fixture::new(vec![]);
        let mut state = SessionState::new("s", DAY, Some(1));
        let err = decide(&fixture.ctx(), &mut state, Action::First, None, Instant::now()).unwrap_err();
        assert!(matches!(err, EngineError::CatalogEmpty));
    }

    #[test]
    fn test_first_request_is_random_out_of_chain() {
        let fixture = Fixture::new(vec![track("a", "hindi"), track("b", "tamil")]);
        let mut state = SessionState::new("s", DAY, Some(1));
        let now = Instant::now();

        let decision = decide(&fixture.ctx(), &mut state, Action::First, Some("Tamil"), now).expect("track");
        assert_eq!(decision.track_id, "b");
        assert_eq!(decision.source, Source::Random);
        assert_eq!(decision.chain, ChainState::OutOfChain);
        assert_eq!(state.anchor.as_deref(), Some("b"));
        assert!(state.played.contains("b", now));
    }

    #[test]
    fn test_like_follows_recommendation_list() {
        let fixture = Fixture::new(["a", "b", "c", "d"].iter().map(|id| track(id, "x")).collect());
        fixture.list("a", &["b", "c", "d"]);
        let now = Instant::now();
        let mut state = anchored("a", ChainState::OutOfChain, now);

        let decision = decide(&fixture.ctx(), &mut state, Action::Liked, None, now).expect("track");
        assert_eq!(decision.track_id, "b");
        assert_eq!(decision.source, Source::RecommendationList);
        assert_eq!(decision.chain, ChainState::InChain);
        assert_eq!(decision.skip_count, 0);
    }

    #[test]
    fn test_recommendation_list_skips_played_and_filtered() {
        let fixture = Fixture::new(vec![
            track("a", "x"),
            track("b", "x"),
            track("c", "y"),
            track("d", "x"),
        ]);
        fixture.list("a", &["b", "c", "d"]);
        let now = Instant::now();
        let mut state = anchored("a", ChainState::InChain, now);
        state.played.mark("b", now);

        let decision = decide(&fixture.ctx(), &mut state, Action::Liked, Some("x"), now).expect("track");
        assert_eq!(decision.track_id, "d");
    }

    #[test]
    fn test_like_without_neighbours_falls_back_to_random() {
        let fixture = Fixture::new(vec![track("a", "x"), track("b", "x")]);
        let now = Instant::now();
        let mut state = anchored("a", ChainState::InChain, now);

        let decision = decide(&fixture.ctx(), &mut state, Action::Liked, None, now).expect("track");
        assert_eq!(decision.track_id, "b");
        assert_eq!(decision.source, Source::Random);
        assert_eq!(decision.chain, ChainState::OutOfChain);
    }

    #[test]
    fn test_three_skips_reset_to_best_language() {
        let mut tracks: Vec<Track> = (0..10).map(|i| track(&format!("h{i}"), "hindi")).collect();
        tracks.extend((0..10).map(|i| track(&format!("t{i}"), "tamil")));
        let fixture = Fixture::new(tracks);
        let now = Instant::now();
        let mut state = anchored("h0", ChainState::InChain, now);
        state.languages.adjust("tamil", 3);

        let first = decide(&fixture.ctx(), &mut state, Action::Skipped, None, now).expect("track");
        assert_eq!(first.skip_count, 1);
        let second = decide(&fixture.ctx(), &mut state, Action::Skipped, None, now).expect("track");
        assert_eq!(second.skip_count, 2);
        let third = decide(&fixture.ctx(), &mut state, Action::Skipped, None, now).expect("track");

        assert_eq!(third.source, Source::LanguageReset);
        assert_eq!(third.skip_count, 0);
        assert_eq!(third.chain, ChainState::OutOfChain);
        assert!(third.track_id.starts_with('t'));
        assert_eq!(state.skip_count, 0);
    }

    #[test]
    fn test_reset_keeps_request_filter_over_best_language() {
        let mut tracks: Vec<Track> = (0..10).map(|i| track(&format!("h{i}"), "hindi")).collect();
        tracks.extend((0..10).map(|i| track(&format!("t{i}"), "tamil")));
        let fixture = Fixture::new(tracks);
        let now = Instant::now();
        let mut state = anchored("h0", ChainState::InChain, now);
        state.languages.adjust("hindi", 2);

        for _ in 0..2 {
            let decision = decide(&fixture.ctx(), &mut state, Action::Skipped, Some("tamil"), now).expect("track");
            assert!(decision.track_id.starts_with('t'));
        }
        let reset = decide(&fixture.ctx(), &mut state, Action::Skipped, Some("tamil"), now).expect("track");

        assert_eq!(state.languages.best(), Some("hindi"));
        assert_eq!(reset.source, Source::LanguageReset);
        assert!(reset.track_id.starts_with('t'), "served {}", reset.track_id);
    }

    #[test]
    fn test_likes_follow_taste_and_skip_played() {
        let mut fixture = Fixture::new(["a", "b", "c", "d"].iter().map(|id| track(id, "x")).collect());
        fixture.snapshot = Snapshot::new(
            1,
            vec![
                ("a".to_string(), vec![1.0, 0.0]),
                ("b".to_string(), vec![0.9, 0.1]),
                ("c".to_string(), vec![0.8, 0.2]),
                ("d".to_string(), vec![0.0, 1.0]),
            ],
        )
        .expect("snapshot");
        fixture.list("a", &["d"]);
        let now = Instant::now();
        let mut state = anchored("a", ChainState::OutOfChain, now);
        state.played.mark("b", now);

        let first = decide(&fixture.ctx(), &mut state, Action::Liked, None, now).expect("track");
        assert!(state.taste.is_active());
        assert_eq!(first.track_id, "c");
        assert_eq!(first.source, Source::Taste);
        assert_eq!(first.chain, ChainState::InChain);

        // Taste now sits between a and c; both neighbours were already served.
        let second = decide(&fixture.ctx(), &mut state, Action::Liked, None, now).expect("track");
        assert_eq!(second.track_id, "d");
        assert_eq!(second.source, Source::Taste);
        assert_eq!(state.taste.weight(), 2.0);
    }

    #[test]
    fn test_anchor_search_skips_played() {
        let mut fixture = Fixture::new(["a", "b", "c", "d"].iter().map(|id| track(id, "x")).collect());
        fixture.snapshot = Snapshot::new(
            1,
            vec![
                ("a".to_string(), vec![1.0, 0.0]),
                ("b".to_string(), vec![0.95, 0.05]),
                ("c".to_string(), vec![0.9, 0.1]),
                ("d".to_string(), vec![0.0, 1.0]),
            ],
        )
        .expect("snapshot");
        let now = Instant::now();
        let mut state = anchored("a", ChainState::InChain, now);
        state.skip_count = 1;
        state.played.mark("b", now);

        let decision = decide(&fixture.ctx(), &mut state, Action::Skipped, None, now).expect("track");
        assert_eq!(decision.track_id, "c");
        assert_eq!(decision.source, Source::AnchorSearch);
    }

    #[test]
    fn test_second_skip_uses_anchor_search() {
        let mut fixture = Fixture::new(vec![track("a", "x"), track("b", "x"), track("c", "x")]);
        fixture.snapshot = Snapshot::new(
            1,
            vec![
                ("a".to_string(), vec![1.0, 0.0]),
                ("b".to_string(), vec![0.0, 1.0]),
                ("c".to_string(), vec![0.9, 0.1]),
            ],
        )
        .expect("snapshot");
        let now = Instant::now();
        let mut state = anchored("a", ChainState::InChain, now);
        state.skip_count = 1;

        let decision = decide(&fixture.ctx(), &mut state, Action::Skipped, None, now).expect("track");
        assert_eq!(decision.track_id, "c");
        assert_eq!(decision.source, Source::AnchorSearch);
        assert_eq!(decision.chain, ChainState::InChain);
        assert_eq!(decision.skip_count, 2);
    }

    #[test]
    fn test_hard_skip_never_seeds_taste() {
        let mut fixture = Fixture::new(vec![track("a", "x"), track("b", "x")]);
        fixture.snapshot = Snapshot::new(
            1,
            vec![("a".to_string(), vec![1.0]), ("b".to_string(), vec![2.0])],
        )
        .expect("snapshot");
        let now = Instant::now();
        let mut state = anchored("a", ChainState::OutOfChain, now);

        decide(&fixture.ctx(), &mut state, Action::HardSkipped, None, now).expect("track");
        assert!(state.taste.embedding().is_none());
        assert_eq!(state.languages.score("x"), Some(4));
    }

    #[test]
    fn test_exploration_overrides_chain() {
        let fixture = Fixture::new(vec![track("a", "x"), track("b", "x"), track("c", "x")]);
        fixture.list("a", &["b"]);
        let now = Instant::now();
        let mut state = anchored("a", ChainState::InChain, now);
        let ctx = PolicyContext {
            config: PolicyConfig {
                exploration_probability: 1.0,
                ..PolicyConfig::default()
            },
            ..fixture.ctx()
        };

        let decision = decide(&ctx, &mut state, Action::Liked, None, now).expect("track");
        assert_eq!(decision.source, Source::Exploration);
        assert_eq!(decision.chain, ChainState::OutOfChain);
        assert_eq!(decision.skip_count, 0);
        assert_ne!(decision.track_id, "a");
    }

    #[test]
    fn test_exhausted_catalog_repeats_oldest() {
        let fixture = Fixture::new(vec![track("a", "x"), track("b", "x")]);
        let now = Instant::now();
        let mut state = SessionState::new("s", DAY, Some(5));
        state.played.mark("b", now);
        state.played.mark("a", now + Duration::from_secs(1));

        let later = now + Duration::from_secs(2);
        let decision = decide(&fixture.ctx(), &mut state, Action::First, None, later).expect("track");
        assert_eq!(decision.track_id, "b");
    }
}
