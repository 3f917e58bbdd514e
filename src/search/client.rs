//! Search-engine sink over the REST API. Elasticsearch and OpenSearch
//! share the surface this client touches: NDJSON `_bulk`, scroll search,
//! and index lifecycle. The engine is chosen by configuration.

use anyhow::Result;
use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::constants::META;
use crate::errors::SearchError;
use crate::settings::SearchSettings;
use crate::tree::Tree;

const SCROLL_TTL: &str = "1m";
const SCROLL_SIZE: usize = 10_000;

/// One bulk operation against the index.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkAction {
    Index {
        id: String,
        routing: Option<String>,
        pipeline: Option<String>,
        source: Value,
    },
    Delete {
        id: String,
        routing: Option<String>,
    },
}

impl BulkAction {
    pub fn id(&self) -> &str {
        match self {
            BulkAction::Index { id, .. } => id,
            BulkAction::Delete { id, .. } => id,
        }
    }
}

pub struct SearchClient {
    http: reqwest::Client,
    settings: SearchSettings,
    doc_count: AtomicU64,
}

impl SearchClient {
    pub fn new(settings: &SearchSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            http,
            settings: settings.clone(),
            doc_count: AtomicU64::new(0),
        })
    }

    /// Documents successfully written since startup.
    pub fn doc_count(&self) -> u64 {
        self.doc_count.load(Ordering::Relaxed)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}/{path}", self.settings.url));
        if let Some(user) = &self.settings.user {
            builder = builder.basic_auth(user, self.settings.password.as_deref());
        }
        builder
    }

    /// Bulk upsert/delete. Chunks by document count and byte ceiling,
    /// backs off exponentially on 429 and logs failed items. Streaming
    /// mode sends one chunk at a time; parallel mode keeps
    /// `thread_count` requests in flight. Returns the number of
    /// successful items.
    pub async fn bulk(&self, index: &str, actions: &[BulkAction]) -> Result<usize, SearchError> {
        let chunks = chunk_actions(
            index,
            actions,
            self.settings.chunk_size,
            self.settings.max_chunk_bytes,
        );

        let mut succeeded = 0usize;
        if self.settings.streaming_bulk {
            for chunk in &chunks {
                succeeded += self.bulk_chunk(chunk).await?;
            }
        } else {
            use futures_util::StreamExt;
            let pending: Vec<_> = chunks.iter().map(|chunk| self.bulk_chunk(chunk)).collect();
            let mut in_flight =
                futures_util::stream::iter(pending).buffer_unordered(self.settings.thread_count.max(1));
            while let Some(result) = in_flight.next().await {
                succeeded += result?;
            }
        }
        Ok(succeeded)
    }

    async fn bulk_chunk(&self, body: &str) -> Result<usize, SearchError> {
        let mut attempt = 0u32;
        loop {
            let response = self
                .request(reqwest::Method::POST, "_bulk")
                .header("content-type", "application/x-ndjson")
                .body(body.to_string())
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(error) => {
                    if self.settings.raise_on_exception {
                        return Err(error.into());
                    }
                    warn!(%error, "bulk request failed");
                    return Ok(0);
                }
            };

            if response.status().as_u16() == 429 {
                if attempt >= self.settings.max_retries {
                    return Err(SearchError::Response {
                        status: 429,
                        body: "too many requests, retries exhausted".to_string(),
                    });
                }
                let backoff = self
                    .settings
                    .initial_backoff
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(self.settings.max_backoff);
                warn!(attempt, backoff_secs = backoff.as_secs(), "bulk got 429, backing off");
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(SearchError::Response { status, body });
            }

            let payload: Value = response.json().await?;
            let items = payload["items"].as_array().cloned().unwrap_or_default();
            let mut failed = 0usize;
            for item in &items {
                let result = item
                    .as_object()
                    .and_then(|op| op.values().next())
                    .cloned()
                    .unwrap_or(Value::Null);
                if let Some(error) = result.get("error") {
                    failed += 1;
                    warn!(id = %result["_id"], %error, "bulk item failed");
                }
            }
            if failed > 0 && self.settings.raise_on_error {
                return Err(SearchError::BulkItems { failed });
            }
            let succeeded = items.len() - failed;
            self.doc_count.fetch_add(succeeded as u64, Ordering::Relaxed);
            return Ok(succeeded);
        }
    }

    /// Find the `_id`s of documents whose `_meta.{table}.{column}` matches
    /// any of the given values, also probing the `.keyword` subfield.
    pub async fn search_meta(
        &self,
        index: &str,
        table: &str,
        fields: &std::collections::BTreeMap<String, Vec<Value>>,
    ) -> Result<Vec<String>, SearchError> {
        let mut filter = Vec::new();
        for (column, values) in fields {
            let field = format!("{META}.{table}.{column}");
            filter.push(json!({
                "bool": {
                    "should": [
                        {"terms": {(field.clone()): values}},
                        {"terms": {(format!("{field}.keyword")): values}},
                    ],
                    "minimum_should_match": 1,
                }
            }));
        }
        let query = json!({"bool": {"filter": filter}});
        self.scroll_ids(index, query).await
    }

    /// The `_id`s of documents carrying any `_meta.{table}` entry.
    pub async fn meta_table_ids(&self, index: &str, table: &str) -> Result<Vec<String>, SearchError> {
        let query = json!({"exists": {"field": (format!("{META}.{table}"))}});
        self.scroll_ids(index, query).await
    }

    /// Every `_id` in the index.
    pub async fn all_doc_ids(&self, index: &str) -> Result<Vec<String>, SearchError> {
        self.scroll_ids(index, json!({"match_all": {}})).await
    }

    async fn scroll_ids(&self, index: &str, query: Value) -> Result<Vec<String>, SearchError> {
        let body = json!({
            "size": SCROLL_SIZE,
            "_source": false,
            "query": query,
        });
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("{index}/_search?scroll={SCROLL_TTL}"),
            )
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            // payload keys may be larger than the engine's long; treat as no match
            if body.contains("out of range for a long") {
                warn!("ignoring out-of-range terms value in _meta search");
                return Ok(Vec::new());
            }
            return Err(SearchError::Response { status, body });
        }

        let mut payload: Value = response.json().await?;
        let mut ids = Vec::new();
        loop {
            let hits = payload["hits"]["hits"].as_array().cloned().unwrap_or_default();
            if hits.is_empty() {
                break;
            }
            ids.extend(
                hits.iter()
                    .filter_map(|hit| hit["_id"].as_str().map(str::to_string)),
            );
            let Some(scroll_id) = payload["_scroll_id"].as_str().map(str::to_string) else {
                break;
            };
            let response = self
                .request(reqwest::Method::POST, "_search/scroll")
                .json(&json!({"scroll": SCROLL_TTL, "scroll_id": scroll_id}))
                .send()
                .await?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(SearchError::Response { status, body });
            }
            payload = response.json().await?;
        }

        if let Some(scroll_id) = payload["_scroll_id"].as_str() {
            // best-effort cleanup of the scroll context
            let _ = self
                .request(reqwest::Method::DELETE, "_search/scroll")
                .json(&json!({"scroll_id": [scroll_id]}))
                .send()
                .await;
        }

        Ok(ids)
    }

    /// Create the index if absent, deriving the mapping from the tree when
    /// the document does not declare one.
    pub async fn create_index(
        &self,
        index: &str,
        setting: Option<&Value>,
        mapping: Option<&Value>,
        routing: Option<&str>,
        tree: &Tree,
    ) -> Result<()> {
        let exists = self
            .request(reqwest::Method::HEAD, index)
            .send()
            .await?
            .status()
            .is_success();
        if exists {
            debug!(index, "index already exists");
            return Ok(());
        }

        let mut body = Map::new();
        if let Some(setting) = setting {
            body.insert("settings".to_string(), json!({"index": setting}));
        }
        match mapping {
            Some(mapping) => {
                let mappings = if mapping.get("dynamic_templates").is_some() {
                    mapping.clone()
                } else {
                    json!({"properties": mapping})
                };
                body.insert("mappings".to_string(), mappings);
            }
            None => {
                if let Some(mappings) = super::mapping::build_mapping(tree, routing)? {
                    body.insert("mappings".to_string(), mappings);
                }
            }
        }

        debug!(index, "creating index");
        let response = self
            .request(reqwest::Method::PUT, index)
            .json(&Value::Object(body))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("failed to create index {index} ({status}): {body}");
        }
        Ok(())
    }

    /// Delete the index, ignoring not-found.
    pub async fn teardown(&self, index: &str) -> Result<()> {
        let response = self.request(reqwest::Method::DELETE, index).send().await?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("failed to delete index {index} ({status}): {body}");
        }
        Ok(())
    }

    /// Make recent writes visible to search; used by operators and tests.
    pub async fn refresh(&self, index: &str) -> Result<()> {
        self.request(reqwest::Method::POST, &format!("{index}/_refresh"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Split actions into NDJSON request bodies bounded by item count and bytes.
fn chunk_actions(
    index: &str,
    actions: &[BulkAction],
    chunk_size: usize,
    max_chunk_bytes: usize,
) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;

    for action in actions {
        let rendered = render_action(index, action);
        if count > 0
            && (count >= chunk_size || current.len() + rendered.len() > max_chunk_bytes)
        {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push_str(&rendered);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn render_action(index: &str, action: &BulkAction) -> String {
    match action {
        BulkAction::Index { id, routing, pipeline, source } => {
            let mut meta = Map::from_iter([
                ("_index".to_string(), json!(index)),
                ("_id".to_string(), json!(id)),
            ]);
            if let Some(routing) = routing {
                meta.insert("routing".to_string(), json!(routing));
            }
            if let Some(pipeline) = pipeline {
                meta.insert("pipeline".to_string(), json!(pipeline));
            }
            format!("{}\n{}\n", json!({"index": meta}), source)
        }
        BulkAction::Delete { id, routing } => {
            let mut meta = Map::from_iter([
                ("_index".to_string(), json!(index)),
                ("_id".to_string(), json!(id)),
            ]);
            if let Some(routing) = routing {
                meta.insert("routing".to_string(), json!(routing));
            }
            format!("{}\n", json!({"delete": meta}))
        }
    }
}
