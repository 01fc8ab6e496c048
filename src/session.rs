//! # Listener Sessions
//!
//! Per-session state and the keyed store that owns it:
//!
//! - [`PlayedCache`]: anti-repeat record of recently served tracks. Entries
//!   older than the TTL are logically absent and evicted lazily.
//! - [`LanguageScores`]: bounded per-language preference, used to bias the
//!   hard reset after repeated skips.
//! - [`SessionState`]: anchor, chain tier, skip counter, taste and the above.
//! - [`SessionStore`]: id → state, created on first request and expired after
//!   a period of inactivity.
//!
//! Each session sits behind its own mutex, so requests of different sessions
//! never contend on session state.

use crate::taste::TasteAccumulator;
use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Checkouts between sweeps of idle sessions.
const PURGE_INTERVAL: u64 = 128;

/// Recently served tracks of one session.
#[derive(Debug, Clone)]
pub struct PlayedCache {
    ttl: Duration,
    served: HashMap<String, Instant>,
}

impl PlayedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            served: HashMap::new(),
        }
    }

    fn is_live(&self, served_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(served_at) < self.ttl
    }

    /// Drop every expired entry.
    pub fn evict_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.served
            .retain(|_, served_at| now.saturating_duration_since(*served_at) < ttl);
    }

    /// Whether `track_id` was served within the TTL.
    pub fn contains(&self, track_id: &str, now: Instant) -> bool {
        self.served
            .get(track_id)
            .is_some_and(|&served_at| self.is_live(served_at, now))
    }

    pub fn mark(&mut self, track_id: &str, now: Instant) {
        self.served.insert(track_id.to_string(), now);
    }

    /// Least recently served live track, ties by id.
    pub fn oldest(&self, now: Instant) -> Option<&str> {
        self.served
            .iter()
            .filter(|&(_, &served_at)| self.is_live(served_at, now))
            .min_by(|(id_a, a), (id_b, b)| a.cmp(b).then_with(|| id_a.cmp(id_b)))
            .map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.served.len()
    }

    pub fn is_empty(&self) -> bool {
        self.served.is_empty()
    }
}

/// Bounded preference score per language key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LanguageScores {
    scores: HashMap<String, i32>,
}

impl LanguageScores {
    pub const MIN: i32 = 1;
    pub const MAX: i32 = 10;
    pub const NEUTRAL: i32 = 5;

    /// Move `language`'s score by `delta`, starting from neutral.
    pub fn adjust(&mut self, language: &str, delta: i32) {
        let score = self.scores.entry(language.to_string()).or_insert(Self::NEUTRAL);
        *score = (*score + delta).clamp(Self::MIN, Self::MAX);
    }

    pub fn score(&self, language: &str) -> Option<i32> {
        self.scores.get(language).copied()
    }

    /// Highest-scoring language, ties by name. `None` before any signal.
    pub fn best(&self) -> Option<&str> {
        self.scores
            .iter()
            .max_by(|(lang_a, a), (lang_b, b)| a.cmp(b).then_with(|| lang_b.cmp(lang_a)))
            .map(|(lang, _)| lang.as_str())
    }

    pub fn snapshot(&self) -> BTreeMap<String, i32> {
        self.scores.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

/// Where the session is relative to a similarity chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    /// Nothing served yet.
    #[default]
    NoAnchor,
    /// Last track came from a chained source.
    InChain,
    /// Anchor set, not mid-chain.
    OutOfChain,
}

/// Mutable state of one listener session.
#[derive(Debug)]
pub struct SessionState {
    pub id: String,
    pub anchor: Option<String>,
    pub chain: ChainState,
    pub skip_count: u32,
    pub taste: TasteAccumulator,
    pub played: PlayedCache,
    pub languages: LanguageScores,
    pub rng: StdRng,
}

impl SessionState {
    /// Fresh session. With a seed, the session's random stream depends only
    /// on the seed and the session id.
    pub fn new(id: &str, ttl: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => {
                let mut hasher = DefaultHasher::new();
                id.hash(&mut hasher);
                StdRng::seed_from_u64(seed ^ hasher.finish())
            }
            None => StdRng::from_entropy(),
        };

        Self {
            id: id.to_string(),
            anchor: None,
            chain: ChainState::NoAnchor,
            skip_count: 0,
            taste: TasteAccumulator::new(),
            played: PlayedCache::new(ttl),
            languages: LanguageScores::default(),
            rng,
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            anchor: self.anchor.clone(),
            chain: self.chain,
            skip_count: self.skip_count,
            taste_weight: self.taste.weight(),
            taste_active: self.taste.is_active(),
            played: self.played.len(),
            languages: self.languages.snapshot(),
        }
    }
}

/// Read-only summary of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub id: String,
    pub anchor: Option<String>,
    pub chain: ChainState,
    pub skip_count: u32,
    pub taste_weight: f32,
    pub taste_active: bool,
    pub played: usize,
    pub languages: BTreeMap<String, i32>,
}

struct SessionEntry {
    state: Arc<Mutex<SessionState>>,
    last_seen: Instant,
}

struct Sessions {
    entries: HashMap<String, SessionEntry>,
    checkouts: u64,
}

/// Keyed session store with inactivity expiry.
pub struct SessionStore {
    inner: Mutex<Sessions>,
    idle: Duration,
    ttl: Duration,
    seed: Option<u64>,
}

impl SessionStore {
    pub fn new(idle: Duration, ttl: Duration, seed: Option<u64>) -> Self {
        Self {
            inner: Mutex::new(Sessions {
                entries: HashMap::new(),
                checkouts: 0,
            }),
            idle,
            ttl,
            seed,
        }
    }

    fn is_idle(&self, entry: &SessionEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_seen) >= self.idle
    }

    /// State of `session_id`, creating it when unknown or expired.
    pub fn checkout(&self, session_id: &str, now: Instant) -> Arc<Mutex<SessionState>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.checkouts += 1;
        if inner.checkouts % PURGE_INTERVAL == 0 {
            self.purge_locked(&mut inner, now);
        }

        let expired = inner
            .entries
            .get(session_id)
            .is_some_and(|entry| self.is_idle(entry, now));
        if expired {
            debug!("Session `{session_id}' expired, starting over");
            inner.entries.remove(session_id);
        }

        let entry = inner
            .entries
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!("New session `{session_id}'");
                SessionEntry {
                    state: Arc::new(Mutex::new(SessionState::new(session_id, self.ttl, self.seed))),
                    last_seen: now,
                }
            });
        entry.last_seen = now;
        Arc::clone(&entry.state)
    }

    /// Existing, non-expired session.
    pub fn get(&self, session_id: &str, now: Instant) -> Option<Arc<Mutex<SessionState>>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .entries
            .get(session_id)
            .filter(|entry| !self.is_idle(entry, now))
            .map(|entry| Arc::clone(&entry.state))
    }

    /// Discard a session. Returns whether it existed.
    pub fn end(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.remove(session_id).is_some()
    }

    /// Drop every idle session. Returns how many were dropped.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge_locked(&mut inner, now)
    }

    fn purge_locked(&self, inner: &mut Sessions, now: Instant) -> usize {
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !self.is_idle(entry, now));
        let purged = before - inner.entries.len();
        if purged > 0 {
            debug!("Expired {purged} idle sessions");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
