//! # Knowledge index
//!
//! Two independent collections, [`Category::General`] and [`Category::Technical`],
//! each holding immutable [`KnowledgeEntry`] rows built by the synchronizer.
//!
//! Each category slot is an `RwLock<Arc<Collection>>`. Readers take the lock
//! only long enough to clone the `Arc` and then work on that snapshot, so a
//! query started before a swap finishes against the old collection and a query
//! started after it sees the new one. [`KnowledgeIndex::swap`] replaces the
//! pointer in one step; there is no moment where a slot holds a partial or
//! empty replacement.
//!
//! Lookups:
//! - [`KnowledgeIndex::keyword_lookup`]: exact key match through the reverse
//!   index, then substring containment in either direction.
//! - [`Collection::nearest`]: exact cosine-distance scan, ascending.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::IndexUnavailableError;
use crate::normalize::normalize_query;

/// Which collection an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    General,
    Technical,
}

impl Category {
    /// Lookup order used wherever both collections are consulted in turn.
    pub const ALL: [Category; 2] = [Category::General, Category::Technical];

    pub fn name(&self) -> &'static str {
        match self {
            Category::General => "general",
            Category::Technical => "technical",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One question/answer row with its key embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeEntry {
    pub raw_key: String,
    pub normalized_key: String,
    pub answer: String,
    pub embedding: Vec<f32>,
    pub category: Category,
}

impl KnowledgeEntry {
    pub fn new(category: Category, raw_key: &str, answer: &str, embedding: Vec<f32>) -> Self {
        Self {
            raw_key: raw_key.to_string(),
            normalized_key: normalize_query(raw_key),
            answer: answer.to_string(),
            embedding,
            category,
        }
    }
}

/// A keyword match.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub category: Category,
    pub answer: String,
    /// `true` for a reverse-index hit, `false` for substring containment.
    pub exact: bool,
}

/// A vector search neighbour.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub distance: f32,
    pub answer: String,
    pub key: String,
}

/// An immutable set of entries for one category, plus its reverse index.
#[derive(Debug)]
pub struct Collection {
    category: Category,
    model_id: String,
    dimension: usize,
    entries: Vec<KnowledgeEntry>,
    by_key: HashMap<String, usize>,
}

impl Collection {
    /// A collection with no entries, bound to a model.
    pub fn empty(category: Category, model_id: &str, dimension: usize) -> Self {
        Self {
            category,
            model_id: model_id.to_string(),
            dimension,
            entries: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    /// Build a collection, rejecting any entry whose embedding does not match
    /// `dimension` or that belongs to another category.
    ///
    /// The first row wins the reverse-index slot for a duplicated key; later
    /// duplicates still take part in vector search.
    pub fn build(
        category: Category,
        model_id: &str,
        dimension: usize,
        entries: Vec<KnowledgeEntry>,
    ) -> Result<Self, IndexUnavailableError> {
        let mut by_key = HashMap::with_capacity(entries.len());
        let mut kept = Vec::with_capacity(entries.len());

        for mut entry in entries {
            if entry.embedding.len() != dimension {
                return Err(IndexUnavailableError::DimensionMismatch {
                    category,
                    expected: dimension,
                    actual: entry.embedding.len(),
                });
            }
            if entry.normalized_key.is_empty() {
                continue;
            }
            entry.category = category;
            by_key
                .entry(entry.normalized_key.clone())
                .or_insert(kept.len());
            kept.push(entry);
        }

        Ok(Self {
            category,
            model_id: model_id.to_string(),
            dimension,
            entries: kept,
            by_key,
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[KnowledgeEntry] {
        &self.entries
    }

    /// O(1) reverse-index lookup.
    pub fn exact(&self, normalized_query: &str) -> Option<&KnowledgeEntry> {
        self.by_key.get(normalized_query).map(|&i| &self.entries[i])
    }

    /// First entry whose key contains the query or is contained by it.
    pub fn containing(&self, normalized_query: &str) -> Option<&KnowledgeEntry> {
        if normalized_query.is_empty() {
            return None;
        }
        self.entries.iter().find(|entry| {
            normalized_query.contains(entry.normalized_key.as_str())
                || entry.normalized_key.contains(normalized_query)
        })
    }

    /// Up to `k` nearest entries by cosine distance, closest first.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>, IndexUnavailableError> {
        if self.entries.is_empty() {
            return Err(IndexUnavailableError::Empty {
                category: self.category,
            });
        }
        if query.len() != self.dimension {
            return Err(IndexUnavailableError::DimensionMismatch {
                category: self.category,
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(f32, &KnowledgeEntry)> = self
            .entries
            .iter()
            .map(|entry| (cosine_distance(query, &entry.embedding), entry))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, entry)| VectorHit {
                distance,
                answer: entry.answer.clone(),
                key: entry.raw_key.clone(),
            })
            .collect())
    }
}

/// `1 - cosine similarity`. A zero vector is maximally dissimilar (distance 1).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot / (na.sqrt() * nb.sqrt())
}

/// The two swappable collections.
pub struct KnowledgeIndex {
    general: RwLock<Arc<Collection>>,
    technical: RwLock<Arc<Collection>>,
}

impl KnowledgeIndex {
    /// Start with two empty collections bound to their models.
    pub fn new(general: Collection, technical: Collection) -> Self {
        Self {
            general: RwLock::new(Arc::new(general)),
            technical: RwLock::new(Arc::new(technical)),
        }
    }

    fn slot(&self, category: Category) -> &RwLock<Arc<Collection>> {
        match category {
            Category::General => &self.general,
            Category::Technical => &self.technical,
        }
    }

    /// Snapshot of the collection currently served for `category`.
    pub fn current(&self, category: Category) -> Arc<Collection> {
        Arc::clone(&self.slot(category).read())
    }

    /// Replace the served collection for the collection's own category and
    /// return the one it replaced.
    pub fn swap(&self, collection: Collection) -> Arc<Collection> {
        let replacement = Arc::new(collection);
        let mut slot = self.slot(replacement.category()).write();
        std::mem::replace(&mut *slot, replacement)
    }

    /// Exact match in either collection, then substring containment in either.
    pub fn keyword_lookup(&self, normalized_query: &str) -> Option<KeywordHit> {
        let snapshots = Category::ALL.map(|category| self.current(category));

        for collection in &snapshots {
            if let Some(entry) = collection.exact(normalized_query) {
                return Some(KeywordHit {
                    category: collection.category(),
                    answer: entry.answer.clone(),
                    exact: true,
                });
            }
        }

        for collection in &snapshots {
            if let Some(entry) = collection.containing(normalized_query) {
                return Some(KeywordHit {
                    category: collection.category(),
                    answer: entry.answer.clone(),
                    exact: false,
                });
            }
        }

        None
    }

    /// Nearest neighbours in one collection.
    pub fn vector_search(
        &self,
        query_embedding: &[f32],
        category: Category,
        k: usize,
    ) -> Result<Vec<VectorHit>, IndexUnavailableError> {
        self.current(category).nearest(query_embedding, k)
    }

    /// Total entries across both collections.
    pub fn len(&self) -> usize {
        Category::ALL
            .iter()
            .map(|category| self.current(*category).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the knowledge base as `Проблема:/Решение:` blocks for a prompt,
    /// stopping before `max_chars` would be exceeded.
    pub fn knowledge_digest(&self, max_chars: usize) -> String {
        let mut digest = String::new();
        let mut used = 0usize;

        'outer: for category in Category::ALL {
            let collection = self.current(category);
            for entry in collection.entries() {
                let block = format!("Проблема: {}\nРешение: {}", entry.raw_key, entry.answer);
                let cost = block.chars().count() + 2;
                if used + cost > max_chars {
                    break 'outer;
                }
                if !digest.is_empty() {
                    digest.push_str("\n\n");
                }
                digest.push_str(&block);
                used += cost;
            }
        }

        if digest.is_empty() {
            "База знаний пуста.".to_string()
        } else {
            digest
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(category: Category, key: &str, answer: &str, embedding: Vec<f32>) -> KnowledgeEntry {
        KnowledgeEntry::new(category, key, answer, embedding)
    }

    fn index_with(general: Vec<KnowledgeEntry>, technical: Vec<KnowledgeEntry>) -> KnowledgeIndex {
        KnowledgeIndex::new(
            Collection::build(Category::General, "m", 2, general).unwrap(),
            Collection::build(Category::Technical, "m", 2, technical).unwrap(),
        )
    }

    #[test]
    fn test_cosine_distance() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_exact_match_before_substring() {
        let index = index_with(
            vec![entry(Category::General, "касса", "general substring", vec![1.0, 0.0])],
            vec![entry(
                Category::Technical,
                "касса не включается",
                "technical exact",
                vec![0.0, 1.0],
            )],
        );

        let hit = index.keyword_lookup("касса не включается").unwrap();
        assert_eq!(hit.answer, "technical exact");
        assert_eq!(hit.category, Category::Technical);
        assert!(hit.exact);
    }

    #[test]
    fn test_substring_matches_in_both_directions() {
        let index = index_with(
            vec![entry(
                Category::General,
                "Касса не включается",
                "Проверьте кабель питания",
                vec![1.0, 0.0],
            )],
            vec![],
        );

        // query contains key
        let hit = index
            .keyword_lookup("почему касса не включается утром")
            .unwrap();
        assert_eq!(hit.answer, "Проверьте кабель питания");
        assert!(!hit.exact);

        // key contains query
        let hit = index.keyword_lookup("не включается").unwrap();
        assert_eq!(hit.answer, "Проверьте кабель питания");

        assert_eq!(index.keyword_lookup("принтер"), None);
        assert_eq!(index.keyword_lookup(""), None);
    }

    #[test]
    fn test_vector_search_sorted_and_truncated() {
        let index = index_with(
            vec![
                entry(Category::General, "far", "far", vec![0.0, 1.0]),
                entry(Category::General, "near", "near", vec![1.0, 0.1]),
                entry(Category::General, "mid", "mid", vec![1.0, 1.0]),
            ],
            vec![],
        );

        let hits = index
            .vector_search(&[1.0, 0.0], Category::General, 2)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].answer, "near");
        assert_eq!(hits[1].answer, "mid");
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[test]
    fn test_vector_search_unavailable() {
        let index = index_with(
            vec![entry(Category::General, "a", "a", vec![1.0, 0.0])],
            vec![],
        );
        assert_eq!(
            index.vector_search(&[1.0, 0.0], Category::Technical, 1),
            Err(IndexUnavailableError::Empty {
                category: Category::Technical
            })
        );
        assert_eq!(
            index.vector_search(&[1.0, 0.0, 0.0], Category::General, 1),
            Err(IndexUnavailableError::DimensionMismatch {
                category: Category::General,
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_build_rejects_mixed_dimensions() {
        let result = Collection::build(
            Category::General,
            "m",
            2,
            vec![
                entry(Category::General, "a", "a", vec![1.0, 0.0]),
                entry(Category::General, "b", "b", vec![1.0, 0.0, 0.0]),
            ],
        );
        assert!(matches!(
            result,
            Err(IndexUnavailableError::DimensionMismatch { actual: 3, .. })
        ));
    }

    #[test]
    fn test_duplicate_keys_first_wins() {
        let collection = Collection::build(
            Category::General,
            "m",
            2,
            vec![
                entry(Category::General, "Касса!", "first", vec![1.0, 0.0]),
                entry(Category::General, "касса", "second", vec![0.0, 1.0]),
            ],
        )
        .unwrap();
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.exact("касса").unwrap().answer, "first");
    }

    #[test]
    fn test_swap_keeps_old_snapshot_alive() {
        let index = index_with(
            vec![entry(Category::General, "old", "old answer", vec![1.0, 0.0])],
            vec![],
        );
        let before = index.current(Category::General);

        let replaced = index.swap(
            Collection::build(
                Category::General,
                "m",
                2,
                vec![entry(Category::General, "new", "new answer", vec![1.0, 0.0])],
            )
            .unwrap(),
        );

        assert!(Arc::ptr_eq(&before, &replaced));
        assert_eq!(before.exact("old").unwrap().answer, "old answer");
        assert!(index.current(Category::General).exact("old").is_none());
        assert_eq!(
            index.keyword_lookup("new").unwrap().answer,
            "new answer"
        );
    }

    #[test]
    fn test_knowledge_digest_budget() {
        let index = index_with(
            vec![
                entry(Category::General, "a", "1", vec![1.0, 0.0]),
                entry(Category::General, "b", "2", vec![1.0, 0.0]),
            ],
            vec![],
        );
        let full = index.knowledge_digest(10_000);
        assert_eq!(full, "Проблема: a\nРешение: 1\n\nПроблема: b\nРешение: 2");

        let one = index.knowledge_digest(30);
        assert_eq!(one, "Проблема: a\nРешение: 1");

        let empty = index_with(vec![], vec![]);
        assert_eq!(empty.knowledge_digest(100), "База знаний пуста.");
    }
}
