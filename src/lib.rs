//! Next-track recommendations for a streaming catalog.
//!
//! WaveHook picks what a listener hears next from three inputs: a per-track
//! embedding built from metadata, acoustic descriptors and hook position; a
//! precomputed list of nearest neighbours for every track; and the live
//! feedback of the session (`like`, `skip`, `hard skip`).
//!
//! Core modules:
//! - [`features`] - Text statistics, feature fusion and the persisted feature model
//! - [`vector_store`] - Generational embedding snapshots
//! - [`index`] - Exact and vantage-point-tree nearest neighbour search
//! - [`recommendations`] - Precomputed neighbour lists
//! - [`session`] - Anti-repeat cache, language scores and session state
//! - [`policy`] - The next-track decision
//! - [`engine`] - The serving API tying it together
//!
//! ### Supporting Modules
//!
//! - [`db`] - SQLite persistence
//! - [`pipeline`] - Offline vector and neighbour-list builds
//! - [`config`] - Data directory and engine configuration
//! - [`cli`] / [`completion`] - Command-line interface
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use wavehook::{pipeline, Action, BuildMode, Engine, EngineConfig};
//!
//! let db_path = wavehook::config::get_db_path()?;
//! let engine = Engine::open(&db_path, EngineConfig::default())?;
//! pipeline::build_vectors(&engine, BuildMode::Full)?;
//! pipeline::build_recommendations(&engine, BuildMode::Full)?;
//!
//! let first = engine.next_track("listener", Action::First, Some("hindi"))?;
//! let next = engine.next_track("listener", Action::Liked, Some("hindi"))?;
//! println!("{} → {} via {:?}", first.track.id, next.track.id, next.decision.source);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! Serving operations return [`EngineResult`]; callers can match on
//! [`EngineError`] to tell an empty catalog from an unknown track.
//! Batch jobs, configuration and the CLI use `anyhow::Result`.

pub mod catalog;
pub mod cli;
pub mod completion;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod features;
pub mod index;
pub mod pipeline;
pub mod policy;
pub mod recommendations;
pub mod session;
pub mod taste;
pub mod track;
pub mod vector_store;

pub use config::EngineConfig;
pub use engine::{Engine, Recommendation};
pub use error::{EngineError, EngineResult};
pub use index::{Metric, Neighbor, SearchStrategy};
pub use policy::{Action, Decision, Source};
pub use session::ChainState;
pub use track::Track;
pub use vector_store::BuildMode;
