//! # Paraphrase stage
//!
//! Optional rewording of a retrieved answer. The rewrite is only used when it
//! provably kept the facts that matter: every guard term of the original
//! answer, every number, and no new category conflict with the question.
//! Otherwise the original answer stands.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::ParaphraseConfig;
use crate::generative::GenerativeService;
use crate::guard::MismatchGuard;
use crate::limiter::ConcurrencyGate;
use crate::normalize::normalize_query;
use crate::template::PromptTemplate;

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("digit regex is valid"));

#[derive(Debug, Clone, PartialEq)]
pub enum KeptReason {
    /// The question/answer pair already conflicts; rewording is not attempted.
    GuardConflict,
    ServiceError,
    /// The rewrite failed validation.
    Rejected(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParaphraseOutcome {
    Rewritten(String),
    Kept(KeptReason),
}

impl ParaphraseOutcome {
    /// The text to return to the user.
    pub fn into_answer(self, original: &str) -> String {
        match self {
            ParaphraseOutcome::Rewritten(text) => text,
            ParaphraseOutcome::Kept(_) => original.to_string(),
        }
    }
}

pub struct ParaphraseStage {
    generator: Arc<dyn GenerativeService>,
    guard: Arc<MismatchGuard>,
    gate: ConcurrencyGate,
    template: PromptTemplate,
    config: ParaphraseConfig,
}

impl ParaphraseStage {
    pub fn new(
        generator: Arc<dyn GenerativeService>,
        guard: Arc<MismatchGuard>,
        gate: ConcurrencyGate,
        template: PromptTemplate,
        config: ParaphraseConfig,
    ) -> Self {
        Self {
            generator,
            guard,
            gate,
            template,
            config,
        }
    }

    pub async fn apply(&self, question: &str, answer: &str) -> ParaphraseOutcome {
        if self.guard.is_mismatch(question, answer) {
            debug!("paraphrase skipped: question and answer conflict");
            return ParaphraseOutcome::Kept(KeptReason::GuardConflict);
        }

        let protected = self.guard.protected_terms(answer);
        let protected_list = protected.join(", ");
        let (system, user) = self.template.render(&[
            ("question", question),
            ("answer", answer),
            ("protected", &protected_list),
        ]);

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let call = async {
            let Ok(_permit) = self.gate.acquire().await else {
                return None;
            };
            self.generator
                .complete(
                    &system,
                    &user,
                    self.config.max_tokens,
                    self.config.temperature,
                    self.config.timeout_ms,
                )
                .await
                .map_err(|e| warn!("paraphrase failed: {e}"))
                .ok()
        };

        let rewrite = match tokio::time::timeout(timeout, call).await {
            Ok(Some(text)) => text,
            Ok(None) => return ParaphraseOutcome::Kept(KeptReason::ServiceError),
            Err(_) => {
                warn!("paraphrase timed out after {timeout:?}");
                return ParaphraseOutcome::Kept(KeptReason::ServiceError);
            }
        };

        match self.validate(question, answer, &protected, rewrite.trim()) {
            Ok(()) => ParaphraseOutcome::Rewritten(rewrite.trim().to_string()),
            Err(reason) => {
                debug!("paraphrase rejected: {reason}");
                ParaphraseOutcome::Kept(KeptReason::Rejected(reason))
            }
        }
    }

    fn validate(
        &self,
        question: &str,
        original: &str,
        protected: &[String],
        rewrite: &str,
    ) -> Result<(), &'static str> {
        if rewrite.is_empty() {
            return Err("empty rewrite");
        }

        let normalized = normalize_query(rewrite);
        if protected
            .iter()
            .any(|term| !normalized.contains(term.as_str()))
        {
            return Err("dropped a protected term");
        }

        let numbers = |text: &str| -> BTreeSet<String> {
            DIGITS
                .find_iter(text)
                .map(|m| m.as_str().to_string())
                .collect()
        };
        if !numbers(original).is_subset(&numbers(rewrite)) {
            return Err("dropped a number");
        }

        if self.guard.is_mismatch(question, rewrite) {
            return Err("introduced a category conflict");
        }

        Ok(())
    }
}
