//! # Knowledge sources
//!
//! Read-only providers of raw `(question, answer)` pairs, one call per
//! category. Only the synchronizer talks to a source.
//!
//! - [`SheetSource`]: Google Sheets values API, one range per category
//!   (`Support!A:B` style). Column A is the question, column B the answer,
//!   the first row is a header.
//! - [`StaticSource`]: in-memory pairs, replaceable at runtime.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::error::SourceError;

/// Answer used for a row whose answer cell is missing.
pub const MISSING_ANSWER: &str = "Нет решения";

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// All pairs of one category, in source order.
    async fn fetch_category(&self, name: &str) -> Result<Vec<(String, String)>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

fn cell_text(cell: Option<&serde_json::Value>) -> String {
    match cell {
        Some(serde_json::Value::String(s)) => s.trim().to_string(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Apply the sheet row rules: drop the header, trim cells, skip empty keys,
/// substitute [`MISSING_ANSWER`] for an empty answer.
pub fn rows_to_pairs(rows: &[Vec<serde_json::Value>]) -> Vec<(String, String)> {
    rows.iter()
        .skip(1)
        .filter_map(|row| {
            let key = cell_text(row.first());
            if key.is_empty() {
                return None;
            }
            let mut answer = cell_text(row.get(1));
            if answer.is_empty() {
                answer = MISSING_ANSWER.to_string();
            }
            Some((key, answer))
        })
        .collect()
}

/// Google Sheets `values.get` client.
pub struct SheetSource {
    http: reqwest::Client,
    api_base: String,
    sheet_id: String,
    bearer_token: Option<String>,
    api_key: Option<String>,
}

impl SheetSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.clone(),
            sheet_id: config.sheet_id.clone(),
            bearer_token: config.bearer_token.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn range_url(&self, range: &str) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| SourceError::Malformed(format!("bad api base {}: {e}", self.api_base)))?;
        url.path_segments_mut()
            .map_err(|_| SourceError::Malformed(format!("api base {} cannot be a base", self.api_base)))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.sheet_id.as_str(), "values", range]);
        if self.bearer_token.is_none() {
            if let Some(key) = &self.api_key {
                url.query_pairs_mut().append_pair("key", key);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl KnowledgeSource for SheetSource {
    async fn fetch_category(&self, name: &str) -> Result<Vec<(String, String)>, SourceError> {
        let url = self.range_url(name)?;
        debug!("Fetching sheet range {name}");

        let mut request = self.http.get(url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let range: ValueRange = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;
        let pairs = rows_to_pairs(&range.values);
        info!("Loaded {} pairs from {name}", pairs.len());
        Ok(pairs)
    }
}

/// In-memory source keyed by category name.
#[derive(Default)]
pub struct StaticSource {
    categories: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(self, name: &str, pairs: &[(&str, &str)]) -> Self {
        self.set(name, pairs);
        self
    }

    /// Replace the pairs served for `name`.
    pub fn set(&self, name: &str, pairs: &[(&str, &str)]) {
        let pairs = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.categories.lock().insert(name.to_string(), pairs);
    }
}

#[async_trait]
impl KnowledgeSource for StaticSource {
    async fn fetch_category(&self, name: &str) -> Result<Vec<(String, String)>, SourceError> {
        self.categories
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::UnknownCategory(name.to_string()))
    }
}
