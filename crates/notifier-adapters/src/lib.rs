//! Adapters for the two upstream services: the issue-notifier metadata API and
//! the GitHub issue event feed. Each has an HTTP implementation and a
//! fixture-first in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notifier_core::{decode_page, DecodedPage, Repository, Subscription};
use notifier_storage::{HttpTransport, TransportError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "notifier-adapters";

/// Fixed upstream page size.
pub const EVENTS_PER_PAGE: u32 = 100;

const METADATA_KEY: &str = "metadata";
const FEED_KEY: &str = "event-feed";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn list_repositories(&self) -> Result<Vec<Repository>, AdapterError>;

    async fn list_subscriptions(&self, repo_id: Uuid) -> Result<Vec<Subscription>, AdapterError>;

    /// Persists a new watermark. Returns only once the metadata service has
    /// committed it.
    async fn update_last_event_at(
        &self,
        repo_id: Uuid,
        last_event_at: DateTime<Utc>,
    ) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Fetches one 1-indexed page of a repository's issue events, newest first.
    async fn fetch_page(
        &self,
        repo_name: &str,
        page: u32,
        per_page: u32,
    ) -> Result<DecodedPage, AdapterError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct LastEventAtBody {
    #[serde(rename = "lastEventAt")]
    last_event_at: DateTime<Utc>,
}

/// Decodes each element independently; returns the rows that decoded and the
/// number that did not.
pub fn decode_rows<T: DeserializeOwned>(values: Vec<JsonValue>) -> (Vec<T>, usize) {
    let mut rows = Vec::with_capacity(values.len());
    let mut skipped = 0usize;
    for value in values {
        match serde_json::from_value(value) {
            Ok(row) => rows.push(row),
            Err(_) => skipped += 1,
        }
    }
    (rows, skipped)
}

fn trim_base(base_url: impl Into<String>) -> String {
    base_url.into().trim_end_matches('/').to_string()
}

#[derive(Debug, Clone)]
pub struct HttpMetadataClient {
    http: Arc<HttpTransport>,
    base_url: String,
}

impl HttpMetadataClient {
    pub fn new(http: Arc<HttpTransport>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: trim_base(base_url),
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataClient {
    async fn list_repositories(&self) -> Result<Vec<Repository>, AdapterError> {
        let url = format!("{}/repositories", self.base_url);
        let values: Vec<JsonValue> = self.http.get_json(METADATA_KEY, &url).await?;
        let (repositories, skipped) = decode_rows::<Repository>(values);
        if skipped > 0 {
            warn!(skipped, "dropped malformed repository rows");
        }
        Ok(repositories)
    }

    async fn list_subscriptions(&self, repo_id: Uuid) -> Result<Vec<Subscription>, AdapterError> {
        let url = format!("{}/subscription/{}/view", self.base_url, repo_id);
        let values: Vec<JsonValue> = self.http.get_json(METADATA_KEY, &url).await?;
        let (subscriptions, skipped) = decode_rows::<Subscription>(values);
        if skipped > 0 {
            warn!(%repo_id, skipped, "dropped malformed subscription rows");
        }
        Ok(subscriptions)
    }

    async fn update_last_event_at(
        &self,
        repo_id: Uuid,
        last_event_at: DateTime<Utc>,
    ) -> Result<(), AdapterError> {
        let url = format!("{}/repository/{}/update/lastEventAt", self.base_url, repo_id);
        self.http
            .put_json(METADATA_KEY, &url, &LastEventAtBody { last_event_at })
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GitHubEventFeed {
    http: Arc<HttpTransport>,
    base_url: String,
}

impl GitHubEventFeed {
    pub fn new(http: Arc<HttpTransport>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: trim_base(base_url),
        }
    }

    pub fn page_url(&self, repo_name: &str, page: u32, per_page: u32) -> String {
        format!(
            "{}/repos/{}/issues/events?page={}&per_page={}",
            self.base_url, repo_name, page, per_page
        )
    }
}

#[async_trait]
impl EventFeed for GitHubEventFeed {
    async fn fetch_page(
        &self,
        repo_name: &str,
        page: u32,
        per_page: u32,
    ) -> Result<DecodedPage, AdapterError> {
        let url = self.page_url(repo_name, page, per_page);
        let values: Vec<JsonValue> = self.http.get_json(FEED_KEY, &url).await?;
        Ok(decode_page(values))
    }
}

#[derive(Debug, Default)]
struct StaticMetadataState {
    repositories: Vec<Repository>,
    subscriptions: HashMap<Uuid, Vec<Subscription>>,
    watermark_updates: Vec<(Uuid, DateTime<Utc>)>,
    failing_subscriptions: HashSet<Uuid>,
    failing_updates: HashSet<Uuid>,
}

/// In-memory metadata service. Watermark updates are applied to the stored
/// repositories and recorded in call order.
#[derive(Debug, Default)]
pub struct StaticMetadataSource {
    state: Mutex<StaticMetadataState>,
}

impl StaticMetadataSource {
    pub fn new(repositories: Vec<Repository>) -> Self {
        Self {
            state: Mutex::new(StaticMetadataState {
                repositories,
                ..Default::default()
            }),
        }
    }

    pub async fn add_subscription(&self, repo_id: Uuid, label: &str, user_id: &str) {
        let mut state = self.state.lock().await;
        state
            .subscriptions
            .entry(repo_id)
            .or_default()
            .push(Subscription {
                label: label.to_string(),
                user_id: user_id.to_string(),
            });
    }

    pub async fn fail_subscriptions_for(&self, repo_id: Uuid) {
        self.state.lock().await.failing_subscriptions.insert(repo_id);
    }

    pub async fn fail_updates_for(&self, repo_id: Uuid) {
        self.state.lock().await.failing_updates.insert(repo_id);
    }

    pub async fn watermark_updates(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        self.state.lock().await.watermark_updates.clone()
    }

    pub async fn repository(&self, repo_id: Uuid) -> Option<Repository> {
        self.state
            .lock()
            .await
            .repositories
            .iter()
            .find(|r| r.repo_id == repo_id)
            .cloned()
    }
}

#[async_trait]
impl MetadataSource for StaticMetadataSource {
    async fn list_repositories(&self) -> Result<Vec<Repository>, AdapterError> {
        Ok(self.state.lock().await.repositories.clone())
    }

    async fn list_subscriptions(&self, repo_id: Uuid) -> Result<Vec<Subscription>, AdapterError> {
        let state = self.state.lock().await;
        if state.failing_subscriptions.contains(&repo_id) {
            return Err(AdapterError::Message(format!(
                "subscriptions unavailable for {repo_id}"
            )));
        }
        Ok(state.subscriptions.get(&repo_id).cloned().unwrap_or_default())
    }

    async fn update_last_event_at(
        &self,
        repo_id: Uuid,
        last_event_at: DateTime<Utc>,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        if state.failing_updates.contains(&repo_id) {
            return Err(AdapterError::Message(format!(
                "watermark update rejected for {repo_id}"
            )));
        }
        if let Some(repository) = state.repositories.iter_mut().find(|r| r.repo_id == repo_id) {
            repository.last_event_at = last_event_at;
        }
        state.watermark_updates.push((repo_id, last_event_at));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FixtureFeedState {
    pages: HashMap<String, Vec<Vec<JsonValue>>>,
    failing_pages: HashSet<(String, u32)>,
    requested: Vec<(String, u32)>,
}

/// Event feed backed by pre-recorded pages. Pages past the recorded ones come
/// back empty, like the real feed.
#[derive(Debug, Default)]
pub struct FixtureEventFeed {
    state: Mutex<FixtureFeedState>,
}

impl FixtureEventFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_pages(&self, repo_name: &str, pages: Vec<Vec<JsonValue>>) {
        self.state
            .lock()
            .await
            .pages
            .insert(repo_name.to_string(), pages);
    }

    /// Loads pages recorded as a JSON array of arrays.
    pub async fn insert_pages_from_file(&self, repo_name: &str, path: impl AsRef<Path>) -> Result<()> {
        let pages = load_fixture_pages(path)?;
        self.insert_pages(repo_name, pages).await;
        Ok(())
    }

    pub async fn fail_page(&self, repo_name: &str, page: u32) {
        self.state
            .lock()
            .await
            .failing_pages
            .insert((repo_name.to_string(), page));
    }

    pub async fn requested_pages(&self, repo_name: &str) -> Vec<u32> {
        self.state
            .lock()
            .await
            .requested
            .iter()
            .filter(|(name, _)| name == repo_name)
            .map(|(_, page)| *page)
            .collect()
    }
}

pub fn load_fixture_pages(path: impl AsRef<Path>) -> Result<Vec<Vec<JsonValue>>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl EventFeed for FixtureEventFeed {
    async fn fetch_page(
        &self,
        repo_name: &str,
        page: u32,
        _per_page: u32,
    ) -> Result<DecodedPage, AdapterError> {
        let mut state = self.state.lock().await;
        state.requested.push((repo_name.to_string(), page));
        if state.failing_pages.contains(&(repo_name.to_string(), page)) {
            return Err(AdapterError::Message(format!(
                "feed page {page} of {repo_name} failed"
            )));
        }
        let values = state
            .pages
            .get(repo_name)
            .and_then(|pages| pages.get(page.saturating_sub(1) as usize))
            .cloned()
            .unwrap_or_default();
        Ok(decode_page(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notifier_core::FeedEvent;
    use serde_json::json;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn decode_rows_keeps_good_rows_and_counts_bad_ones() {
        let (rows, skipped) = decode_rows::<Subscription>(vec![
            json!({"label": "bug", "userID": "5d1a7f0c-2b4e-4c1d-9a8e-3f2b1c0d9e8f"}),
            json!({"userID": "no-label"}),
            json!({"label": "docs", "userId": "not-a-uuid"}),
        ]);
        assert_eq!(rows.len(), 2);
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn golden_fixture_pages_decode() {
        let feed = FixtureEventFeed::new();
        feed.insert_pages_from_file(
            "facebook/react",
            workspace_root().join("fixtures/github/facebook-react_issue_events.json"),
        )
        .await
        .unwrap();

        let first = feed.fetch_page("facebook/react", 1, EVENTS_PER_PAGE).await.unwrap();
        assert_eq!(first.skipped, 0);
        assert!(matches!(first.events.first(), Some(FeedEvent::Labeled(_))));
        let newest = first.events.first().map(FeedEvent::created_at).unwrap();
        assert!(first.events.iter().all(|e| e.created_at() <= newest));

        let past_end = feed.fetch_page("facebook/react", 99, EVENTS_PER_PAGE).await.unwrap();
        assert!(past_end.events.is_empty());
        assert_eq!(feed.requested_pages("facebook/react").await, vec![1, 99]);
    }

    #[tokio::test]
    async fn static_metadata_applies_watermark_updates() {
        let repo_id = Uuid::new_v4();
        let source = StaticMetadataSource::new(vec![Repository {
            repo_id,
            repo_name: "golang/go".into(),
            last_event_at: notifier_core::never_fetched(),
        }]);
        let ts = DateTime::parse_from_rfc3339("2024-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        source.update_last_event_at(repo_id, ts).await.unwrap();
        assert_eq!(source.repository(repo_id).await.unwrap().last_event_at, ts);
        assert_eq!(source.watermark_updates().await, vec![(repo_id, ts)]);
    }
}
