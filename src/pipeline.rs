//! # Resolution pipeline
//!
//! [`Resolver::resolve`] turns a raw user message into a [`Resolution`].
//!
//! Before any retrieval work three gates run, in order: the pause flag, the
//! input filter (empty text, `/commands`, over-long messages) and per-user rate
//! admission. None of them touches the cache.
//!
//! Admitted queries then walk [`Stage::ORDER`]; the first stage that produces
//! an answer ends the walk:
//!
//! 1. [`Stage::Cache`]: verbatim answer for the same normalized query.
//! 2. [`Stage::Keyword`]: exact or substring key match, General before
//!    Technical. A match whose answer the [`MismatchGuard`] vetoes is dropped.
//! 3. [`Stage::Vector`]: nearest neighbour in both collections, searched
//!    concurrently. The query is embedded once per distinct model. The closest
//!    candidate under the distance threshold that the guard does not veto wins.
//! 4. [`Stage::Generative`]: the hosted model, asked to use only the knowledge
//!    base and to abstain otherwise. Bounded by the concurrency gate and by the
//!    smaller of its own timeout and the remaining request deadline.
//!
//! If every stage misses the result is NoAnswer ([`Source::None`]). Stage
//! failures are logged and counted but never escape `resolve`.
//!
//! Answers are cached only if the cache was not cleared while the request was
//! in flight; an answer computed from a replaced knowledge base is returned
//! once and then forgotten.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::config::ResolverConfig;
use crate::embedding::EmbeddingService;
use crate::error::{GenerativeServiceError, IndexUnavailableError};
use crate::generative::{GenerativeService, accept_completion};
use crate::guard::MismatchGuard;
use crate::index::{Category, Collection, KnowledgeIndex, VectorHit};
use crate::limiter::{ConcurrencyGate, RateLimiter};
use crate::metrics::Metrics;
use crate::normalize::normalize_query;
use crate::paraphrase::{KeptReason, ParaphraseOutcome, ParaphraseStage};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::state::SystemState;
use crate::template::PromptTemplate;

/// Retrieval stages, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Cache,
    Keyword,
    Vector,
    Generative,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [Stage::Cache, Stage::Keyword, Stage::Vector, Stage::Generative];
}

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Source {
    Cache,
    Keyword,
    VectorGeneral,
    VectorTechnical,
    Generative,
    None,
}

impl Source {
    fn vector(category: Category) -> Self {
        match category {
            Category::General => Source::VectorGeneral,
            Category::Technical => Source::VectorTechnical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionResult {
    pub answer: Option<String>,
    pub source: Source,
    /// 0 for cache and keyword hits, the cosine distance for vector hits, 1 otherwise.
    pub distance: f32,
    pub category: Option<Category>,
    /// Stages attempted, in order.
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    Paused,
    RateLimited,
    /// Empty text, a `/command`, or a message over the length limit.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Resolution {
    Resolved(ResolutionResult),
    Skipped(SkipReason),
}

impl Resolution {
    pub fn answer(&self) -> Option<&str> {
        match self {
            Resolution::Resolved(result) => result.answer.as_deref(),
            Resolution::Skipped(_) => None,
        }
    }

    pub fn result(&self) -> Option<&ResolutionResult> {
        match self {
            Resolution::Resolved(result) => Some(result),
            Resolution::Skipped(_) => None,
        }
    }
}

/// A stage's answer before it is cached.
struct Hit {
    answer: String,
    source: Source,
    distance: f32,
    category: Option<Category>,
}

#[derive(Default)]
struct RequestTrace {
    stages: Vec<Stage>,
    errors: usize,
}

pub struct Resolver {
    config: ResolverConfig,
    index: Arc<KnowledgeIndex>,
    embeddings: Arc<EmbeddingService>,
    generator: Option<Arc<dyn GenerativeService>>,
    cache: Arc<ResponseCache>,
    guard: Arc<MismatchGuard>,
    limiter: RateLimiter,
    gate: ConcurrencyGate,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    fallback_template: PromptTemplate,
    paraphrase: Option<ParaphraseStage>,
}

impl Resolver {
    pub fn new(
        config: ResolverConfig,
        index: Arc<KnowledgeIndex>,
        embeddings: Arc<EmbeddingService>,
        generator: Option<Arc<dyn GenerativeService>>,
    ) -> Self {
        let cache = Arc::new(ResponseCache::new(config.cache.ttl(), config.cache.capacity));
        let guard = Arc::new(MismatchGuard::new(&config.mismatch_rules));
        let limiter = RateLimiter::new(
            config.rate_limit.max_requests,
            config.rate_limit.window(),
            config.rate_limit.max_tracked_users,
        );
        let gate = ConcurrencyGate::new(config.generative.max_concurrent);
        let metrics = Arc::new(Metrics::new(&config.alerting));
        let retry = config.retry.policy();

        Self {
            config,
            index,
            embeddings,
            generator,
            cache,
            guard,
            limiter,
            gate,
            metrics,
            retry,
            fallback_template: PromptTemplate::fallback_default(),
            paraphrase: None,
        }
    }

    pub fn with_fallback_template(mut self, template: PromptTemplate) -> Self {
        self.fallback_template = template;
        self
    }

    /// Reword keyword and vector answers through the generative service.
    /// Without a generative service this is a no-op.
    pub fn with_paraphrase(mut self, template: PromptTemplate) -> Self {
        if let Some(generator) = &self.generator {
            self.paraphrase = Some(ParaphraseStage::new(
                Arc::clone(generator),
                Arc::clone(&self.guard),
                self.gate.clone(),
                template,
                self.config.paraphrase.clone(),
            ));
        } else {
            warn!("paraphrase requested without a generative service; ignoring");
        }
        self
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn index(&self) -> &Arc<KnowledgeIndex> {
        &self.index
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn guard(&self) -> &MismatchGuard {
        &self.guard
    }

    pub async fn resolve(&self, user_id: &str, raw_text: &str, state: &SystemState) -> Resolution {
        if state.is_paused() {
            return self.skip(user_id, SkipReason::Paused);
        }

        let text = raw_text.trim();
        if text.is_empty()
            || text.starts_with('/')
            || text.chars().count() > self.config.retrieval.max_query_chars
        {
            return self.skip(user_id, SkipReason::Ignored);
        }
        let normalized = normalize_query(text);
        if normalized.is_empty() {
            return self.skip(user_id, SkipReason::Ignored);
        }

        if !self.limiter.try_admit(user_id) {
            return self.skip(user_id, SkipReason::RateLimited);
        }

        let started = Instant::now();
        let deadline = started + self.config.generative.request_deadline();
        let generation = self.cache.generation();
        let mut trace = RequestTrace::default();

        for stage in Stage::ORDER {
            trace.stages.push(stage);
            let hit = match stage {
                Stage::Cache => self.cache_stage(&normalized),
                Stage::Keyword => self.keyword_stage(text, &normalized),
                Stage::Vector => self.vector_stage(text, &mut trace).await,
                Stage::Generative => self.generative_stage(text, deadline, &mut trace).await,
            };

            let Some(mut hit) = hit else {
                debug!("{stage:?} stage missed");
                continue;
            };

            if matches!(stage, Stage::Keyword | Stage::Vector) {
                if let Some(paraphrase) = &self.paraphrase {
                    match paraphrase.apply(text, &hit.answer).await {
                        ParaphraseOutcome::Kept(KeptReason::GuardConflict) => {
                            self.metrics.record_guard_veto();
                            continue;
                        }
                        outcome => hit.answer = outcome.into_answer(&hit.answer),
                    }
                }
            }
            if stage != Stage::Cache {
                self.cache
                    .put_if_generation(&normalized, &hit.answer, generation);
            }

            info!(
                user = user_id,
                source = ?hit.source,
                distance = hit.distance,
                "query resolved"
            );
            self.metrics
                .record_resolution(hit.source, started.elapsed(), trace.errors);
            return Resolution::Resolved(ResolutionResult {
                answer: Some(hit.answer),
                source: hit.source,
                distance: hit.distance,
                category: hit.category,
                stages: trace.stages,
            });
        }

        info!(user = user_id, "query unresolved");
        self.metrics
            .record_resolution(Source::None, started.elapsed(), trace.errors);
        Resolution::Resolved(ResolutionResult {
            answer: None,
            source: Source::None,
            distance: 1.0,
            category: None,
            stages: trace.stages,
        })
    }

    fn skip(&self, user_id: &str, reason: SkipReason) -> Resolution {
        debug!(user = user_id, ?reason, "query skipped");
        self.metrics.record_skip(reason);
        Resolution::Skipped(reason)
    }

    fn cache_stage(&self, normalized: &str) -> Option<Hit> {
        self.cache.get(normalized).map(|answer| Hit {
            answer,
            source: Source::Cache,
            distance: 0.0,
            category: None,
        })
    }

    fn keyword_stage(&self, question: &str, normalized: &str) -> Option<Hit> {
        let hit = self.index.keyword_lookup(normalized)?;
        if let Some(conflict) = self.guard.conflict(question, &hit.answer) {
            info!(
                "vetoed {} keyword match: question mentions {} but answer mentions {}",
                hit.category, conflict.question_term, conflict.answer_term
            );
            self.metrics.record_guard_veto();
            return None;
        }
        Some(Hit {
            answer: hit.answer,
            source: Source::Keyword,
            distance: 0.0,
            category: Some(hit.category),
        })
    }

    async fn vector_stage(&self, question: &str, trace: &mut RequestTrace) -> Option<Hit> {
        let general = self.index.current(Category::General);
        let technical = self.index.current(Category::Technical);

        let (general_vector, technical_vector) = if general.model_id() == technical.model_id() {
            let primary = if general.is_empty() { &technical } else { &general };
            let vector = self.embed_query(primary, question).await;
            if matches!(vector, Some(Err(()))) {
                trace.errors += 1;
            }
            (vector.clone(), vector)
        } else {
            let (g, t) = tokio::join!(
                self.embed_query(&general, question),
                self.embed_query(&technical, question)
            );
            trace.errors += [&g, &t]
                .iter()
                .filter(|v| matches!(v, Some(Err(()))))
                .count();
            (g, t)
        };

        let general_hit = self.nearest(&general, general_vector);
        let technical_hit = self.nearest(&technical, technical_vector);

        let threshold = self.config.retrieval.distance_threshold;
        let mut candidates = Vec::with_capacity(2);
        for (category, outcome) in [
            (Category::General, general_hit),
            (Category::Technical, technical_hit),
        ] {
            match outcome {
                Ok(Some(hit)) if hit.distance < threshold => candidates.push((category, hit)),
                Ok(Some(hit)) => debug!(
                    "{category} nearest at {:.3} is over threshold {threshold}",
                    hit.distance
                ),
                Ok(None) => {}
                Err(()) => trace.errors += 1,
            }
        }
        candidates.sort_by(|a, b| a.1.distance.total_cmp(&b.1.distance));

        for (category, hit) in candidates {
            if let Some(conflict) = self.guard.conflict(question, &hit.answer) {
                info!(
                    "vetoed {category} candidate {:?}: question mentions {} but answer mentions {}",
                    hit.key, conflict.question_term, conflict.answer_term
                );
                self.metrics.record_guard_veto();
                continue;
            }
            return Some(Hit {
                answer: hit.answer,
                source: Source::vector(category),
                distance: hit.distance,
                category: Some(category),
            });
        }
        None
    }

    /// Query vector for `collection`'s model. `None` for an empty collection;
    /// `Some(Err(()))` for an embedding failure that was already logged.
    async fn embed_query(
        &self,
        collection: &Collection,
        question: &str,
    ) -> Option<Result<Arc<Vec<f32>>, ()>> {
        if collection.is_empty() {
            return None;
        }
        Some(
            self.embeddings
                .embed(question, collection.model_id())
                .await
                .map_err(|e| warn!("{} vector search skipped: {e}", collection.category())),
        )
    }

    /// Closest entry of one collection. `Err(())` means a search failure that
    /// was already logged; an empty collection or a failed embedding (counted
    /// by the caller) is simply no candidate.
    fn nearest(
        &self,
        collection: &Collection,
        vector: Option<Result<Arc<Vec<f32>>, ()>>,
    ) -> Result<Option<VectorHit>, ()> {
        let Some(Ok(embedding)) = vector else {
            return Ok(None);
        };
        if collection.is_empty() {
            return Ok(None);
        }

        match collection.nearest(&embedding, 1) {
            Ok(hits) => Ok(hits.into_iter().next()),
            Err(IndexUnavailableError::Empty { .. }) => Ok(None),
            Err(e) => {
                warn!("{} vector search failed: {e}", collection.category());
                Err(())
            }
        }
    }

    async fn generative_stage(
        &self,
        question: &str,
        deadline: Instant,
        trace: &mut RequestTrace,
    ) -> Option<Hit> {
        let settings = &self.config.generative;
        let Some(generator) = self.generator.as_ref().filter(|_| settings.enabled) else {
            debug!("no generative service; skipping fallback");
            return None;
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout = settings.timeout().min(remaining);
        if timeout < Duration::from_millis(1) {
            warn!("request deadline exhausted before generative fallback");
            trace.errors += 1;
            return None;
        }
        let timeout_ms = timeout.as_millis() as u64;

        let knowledge = self
            .index
            .knowledge_digest(self.config.retrieval.knowledge_prompt_chars);
        let (system, user) = self
            .fallback_template
            .render(&[("knowledge", &knowledge), ("question", question)]);

        let call = async {
            match self.gate.acquire().await {
                Ok(_permit) => {
                    retry_with_backoff(
                        &self.retry,
                        "generative fallback",
                        GenerativeServiceError::is_transient,
                        || {
                            generator.complete(
                                &system,
                                &user,
                                settings.max_tokens,
                                settings.temperature,
                                timeout_ms,
                            )
                        },
                    )
                    .await
                }
                Err(_) => Err(GenerativeServiceError::Unavailable),
            }
        };

        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GenerativeServiceError::Timeout { timeout_ms }),
        }
        .and_then(|raw| {
            accept_completion(&raw, &settings.abstention_markers, settings.min_answer_chars)
        });

        match outcome {
            Ok(answer) => Some(Hit {
                answer,
                source: Source::Generative,
                distance: 1.0,
                category: None,
            }),
            Err(e) if e.is_failure() => {
                warn!("generative fallback failed: {e}");
                trace.errors += 1;
                None
            }
            Err(e) => {
                info!("generative fallback declined: {e}");
                None
            }
        }
    }
}
