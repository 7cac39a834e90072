//! # Mismatch guard
//!
//! Vector similarity happily confuses two pieces of hardware whose descriptions
//! read alike. The guard is a deterministic veto on top of it: a table mapping a
//! category term found in the question to terms that must not appear in the
//! answer. The table is always symmetric; a rule `A → [B]` implies `B → [A]`.
//!
//! Terms are matched as substrings of normalized text, so a stem such as
//! `касс` covers `касса`, `кассы`, `кассой`. When the question mentions both
//! terms of a rule, an answer is only accepted if it also mentions both; an
//! answer about just one of the devices is still a conflict.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::normalize::normalize_query;

/// One configured rule: `term` in the question forbids any of `forbidden` in the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MismatchRule {
    pub term: String,
    pub forbidden: Vec<String>,
}

impl MismatchRule {
    pub fn new(term: &str, forbidden: &[&str]) -> Self {
        Self {
            term: term.to_string(),
            forbidden: forbidden.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Rules shipped by default: cash registers vs. payment terminals, printers vs. scanners.
pub fn default_rules() -> Vec<MismatchRule> {
    vec![
        MismatchRule::new("касс", &["терминал", "пинпад", "эквайринг"]),
        MismatchRule::new("принтер", &["сканер"]),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub question_term: String,
    pub answer_term: String,
}

/// Symmetric term table.
#[derive(Debug, Clone, Default)]
pub struct MismatchGuard {
    table: BTreeMap<String, BTreeSet<String>>,
}

impl MismatchGuard {
    pub fn new(rules: &[MismatchRule]) -> Self {
        let mut table: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for rule in rules {
            let term = normalize_query(&rule.term);
            if term.is_empty() {
                continue;
            }
            for forbidden in &rule.forbidden {
                let forbidden = normalize_query(forbidden);
                if forbidden.is_empty() || forbidden == term {
                    continue;
                }
                table
                    .entry(term.clone())
                    .or_default()
                    .insert(forbidden.clone());
                table.entry(forbidden).or_default().insert(term.clone());
            }
        }

        Self { table }
    }

    /// The first conflict found, if any.
    pub fn conflict(&self, question: &str, candidate_answer: &str) -> Option<Conflict> {
        let question = normalize_query(question);
        let answer = normalize_query(candidate_answer);

        for (term, forbidden) in &self.table {
            if !question.contains(term.as_str()) {
                continue;
            }
            for bad in forbidden {
                if !answer.contains(bad.as_str()) {
                    continue;
                }
                let covers_both =
                    question.contains(bad.as_str()) && answer.contains(term.as_str());
                if !covers_both {
                    return Some(Conflict {
                        question_term: term.clone(),
                        answer_term: bad.clone(),
                    });
                }
            }
        }

        None
    }

    pub fn is_mismatch(&self, question: &str, candidate_answer: &str) -> bool {
        self.conflict(question, candidate_answer).is_some()
    }

    /// Guard terms that occur in `text`. A paraphrase must keep all of them.
    pub fn protected_terms(&self, text: &str) -> Vec<String> {
        let text = normalize_query(text);
        self.table
            .keys()
            .filter(|term| text.contains(term.as_str()))
            .cloned()
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        self.table.len()
    }
}
