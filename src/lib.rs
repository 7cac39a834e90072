//! # helpdesk_resolver (library root)
//!
//! Staged resolution of free-text support questions against a two-category
//! knowledge base:
//!
//! - Cheapest first: response cache, keyword lookup, vector search over both
//!   collections, then a generative fallback that must abstain when unsure
//!   (`pipeline`).
//! - A deterministic mismatch guard keeps answers about one kind of device from
//!   being served for another (`guard`).
//! - The knowledge base is rebuilt from a live source and swapped in whole;
//!   queries never see a half-built collection (`sync`, `index`).
//! - Per-user rate limiting and a cap on concurrent generative calls
//!   (`limiter`), with counters, a latency histogram and error-rate alerting
//!   (`metrics`).
//!
//! ```no_run
//! use std::sync::Arc;
//! use helpdesk_resolver::config::ResolverConfig;
//! use helpdesk_resolver::embedding::{EmbeddingService, SentenceEmbedder};
//! use helpdesk_resolver::index::{Category, Collection, KnowledgeIndex};
//! use helpdesk_resolver::pipeline::Resolver;
//! use helpdesk_resolver::state::SystemState;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResolverConfig::default();
//! let model = SentenceEmbedder::load(&config.embedding.general_model, "main")?;
//! let embeddings = Arc::new(EmbeddingService::new(1024).with_embedder(Arc::new(model)));
//! let index = Arc::new(KnowledgeIndex::new(
//!     Collection::empty(Category::General, &config.embedding.general_model, 384),
//!     Collection::empty(Category::Technical, &config.embedding.general_model, 384),
//! ));
//! let resolver = Resolver::new(config, index, embeddings, None);
//! let answer = resolver
//!     .resolve("42", "касса не включается", &SystemState::default())
//!     .await;
//! println!("{:?}", answer.answer());
//! # Ok(()) }
//! ```
//!
//! ## Modules
//! - [`pipeline`], [`sync`], [`index`], [`cache`], [`embedding`], [`guard`],
//!   [`paraphrase`], [`generative`], [`source`], [`limiter`], [`retry`],
//!   [`metrics`], [`state`], [`config`], [`template`], [`commands`],
//!   [`normalize`], [`error`]

use directories::ProjectDirs;
use std::error::Error;

pub mod cache;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generative;
pub mod guard;
pub mod index;
pub mod limiter;
pub mod metrics;
pub mod normalize;
pub mod paraphrase;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod state;
pub mod sync;
pub mod template;

/// Return the per-platform configuration directory.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "helpdesk", "helpdesk")`. The directory is **not** created by this
/// function.
///
/// # Examples
/// ```no_run
/// let cfg = helpdesk_resolver::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<std::path::PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "helpdesk", "helpdesk")
        .ok_or("Unable to determine config directory")?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
