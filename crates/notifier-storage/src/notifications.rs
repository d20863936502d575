//! Persistence of pending per-user issue notifications.
//!
//! Rows are keyed by `(repo_id, user_id, issue_number)`. Re-ingesting an issue
//! refreshes `issue_data` and never touches `sent`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notifier_core::{
    Issue, IssueNumber, NotificationRow, PerUserIssues, Repository, RepositoryDigest, User,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Postgres caps a statement at 65535 bind parameters; each row binds four.
const UPSERT_CHUNK_ROWS: usize = 1000;

/// Folds `(repo_id, repo_name, last_event_at, issue)` rows into one digest per
/// repository, in first-seen order, whatever order the rows arrive in.
fn group_by_repository(
    rows: impl IntoIterator<Item = (Uuid, String, DateTime<Utc>, Issue)>,
) -> Vec<RepositoryDigest> {
    let mut position: HashMap<Uuid, usize> = HashMap::new();
    let mut digests: Vec<RepositoryDigest> = Vec::new();
    for (repo_id, repo_name, last_event_at, issue) in rows {
        match position.get(&repo_id) {
            Some(&at) => digests[at].issues.push(issue),
            None => {
                position.insert(repo_id, digests.len());
                digests.push(RepositoryDigest {
                    repo_id,
                    repo_name,
                    last_event_at,
                    issues: vec![issue],
                });
            }
        }
    }
    digests
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("issue payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Idempotently upserts every `(user, issue)` pair of `per_user` for one repository.
    /// Either all rows are written or none are. Returns the number of rows written.
    async fn upsert_notifications(
        &self,
        repo_id: Uuid,
        per_user: &PerUserIssues,
    ) -> Result<u64, StoreError>;

    /// Distinct users holding at least one unsent row.
    async fn pending_users(&self) -> Result<Vec<User>, StoreError>;

    /// Unsent rows for one user grouped per repository, repositories ordered by
    /// name and issues by number.
    async fn pending_digest(&self, user_id: Uuid) -> Result<Vec<RepositoryDigest>, StoreError>;

    /// Marks exactly the listed issues of one `(user, repository)` group as sent.
    async fn mark_sent(
        &self,
        user_id: Uuid,
        repo_id: Uuid,
        issue_numbers: &[IssueNumber],
    ) -> Result<u64, StoreError>;

    /// Deletes every row already marked as sent.
    async fn delete_sent(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn upsert_notifications(
        &self,
        repo_id: Uuid,
        per_user: &PerUserIssues,
    ) -> Result<u64, StoreError> {
        let mut rows = Vec::new();
        for (user_id, issues) in per_user {
            for (number, issue) in issues {
                rows.push((*user_id, *number as i64, serde_json::to_value(issue)?));
            }
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let mut written = 0u64;
        let mut tx = self.pool.begin().await?;
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let batch = rows.by_ref().take(UPSERT_CHUNK_ROWS).collect::<Vec<_>>();
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO notification_data (user_id, repo_id, issue_number, issue_data) ",
            );
            query.push_values(batch, |mut row, (user_id, number, data)| {
                row.push_bind(user_id)
                    .push_bind(repo_id)
                    .push_bind(number)
                    .push_bind(data);
            });
            query.push(
                " ON CONFLICT (repo_id, user_id, issue_number) DO UPDATE SET issue_data = EXCLUDED.issue_data",
            );
            written += query.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        debug!(%repo_id, written, "upserted notification rows");
        Ok(written)
    }

    async fn pending_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, String, String)>(
            r#"
            SELECT DISTINCT gu.user_id, gu.username, gu.email
              FROM github_user gu
             INNER JOIN notification_data nd ON gu.user_id = nd.user_id
             WHERE nd.sent = FALSE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, username, email)| User {
                user_id,
                username,
                email,
            })
            .collect())
    }

    async fn pending_digest(&self, user_id: Uuid) -> Result<Vec<RepositoryDigest>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, String, DateTime<Utc>, Json<Issue>)>(
            r#"
            SELECT gr.repo_id, gr.repo_name, gr.last_event_at, nd.issue_data
              FROM notification_data nd
             INNER JOIN global_repository gr ON gr.repo_id = nd.repo_id
             WHERE nd.sent = FALSE
               AND nd.user_id = $1
             ORDER BY gr.repo_name, gr.repo_id, nd.issue_number
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(group_by_repository(rows.into_iter().map(
            |(repo_id, repo_name, last_event_at, Json(issue))| {
                (repo_id, repo_name, last_event_at, issue)
            },
        )))
    }

    async fn mark_sent(
        &self,
        user_id: Uuid,
        repo_id: Uuid,
        issue_numbers: &[IssueNumber],
    ) -> Result<u64, StoreError> {
        let numbers = issue_numbers.iter().map(|n| *n as i64).collect::<Vec<_>>();
        let result = sqlx::query(
            r#"
            UPDATE notification_data
               SET sent = TRUE
             WHERE user_id = $1
               AND repo_id = $2
               AND issue_number = ANY($3)
            "#,
        )
        .bind(user_id)
        .bind(repo_id)
        .bind(numbers)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_sent(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM notification_data WHERE sent = TRUE")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RowKey {
    repo_id: Uuid,
    user_id: Uuid,
    issue_number: IssueNumber,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<RowKey, (Issue, bool)>,
    repositories: HashMap<Uuid, Repository>,
    users: HashMap<Uuid, User>,
}

/// In-process store with the same conflict semantics as the Postgres table.
/// Repositories and users play the part of the joined metadata tables.
#[derive(Debug, Default)]
pub struct MemoryNotificationStore {
    state: Mutex<MemoryState>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_repository(&self, repository: Repository) {
        let mut state = self.state.lock().await;
        state.repositories.insert(repository.repo_id, repository);
    }

    pub async fn register_user(&self, user: User) {
        let mut state = self.state.lock().await;
        state.users.insert(user.user_id, user);
    }

    pub async fn rows(&self) -> Vec<NotificationRow> {
        let state = self.state.lock().await;
        state
            .rows
            .iter()
            .map(|(key, (issue, sent))| NotificationRow {
                user_id: key.user_id,
                repo_id: key.repo_id,
                issue_number: key.issue_number,
                issue: issue.clone(),
                sent: *sent,
            })
            .collect()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn upsert_notifications(
        &self,
        repo_id: Uuid,
        per_user: &PerUserIssues,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut written = 0u64;
        for (user_id, issues) in per_user {
            for (number, issue) in issues {
                let key = RowKey {
                    repo_id,
                    user_id: *user_id,
                    issue_number: *number,
                };
                state
                    .rows
                    .entry(key)
                    .and_modify(|(existing, _sent)| *existing = issue.clone())
                    .or_insert_with(|| (issue.clone(), false));
                written += 1;
            }
        }
        Ok(written)
    }

    async fn pending_users(&self) -> Result<Vec<User>, StoreError> {
        let state = self.state.lock().await;
        let mut users = state
            .rows
            .iter()
            .filter(|(_, (_, sent))| !sent)
            .filter_map(|(key, _)| state.users.get(&key.user_id))
            .cloned()
            .collect::<Vec<_>>();
        users.sort_by_key(|u| u.user_id);
        users.dedup_by_key(|u| u.user_id);
        Ok(users)
    }

    async fn pending_digest(&self, user_id: Uuid) -> Result<Vec<RepositoryDigest>, StoreError> {
        let state = self.state.lock().await;
        let mut grouped: BTreeMap<(String, Uuid), RepositoryDigest> = BTreeMap::new();
        for (key, (issue, sent)) in &state.rows {
            if *sent || key.user_id != user_id {
                continue;
            }
            let Some(repository) = state.repositories.get(&key.repo_id) else {
                continue;
            };
            grouped
                .entry((repository.repo_name.clone(), repository.repo_id))
                .or_insert_with(|| RepositoryDigest {
                    repo_id: repository.repo_id,
                    repo_name: repository.repo_name.clone(),
                    last_event_at: repository.last_event_at,
                    issues: Vec::new(),
                })
                .issues
                .push(issue.clone());
        }
        Ok(grouped.into_values().collect())
    }

    async fn mark_sent(
        &self,
        user_id: Uuid,
        repo_id: Uuid,
        issue_numbers: &[IssueNumber],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut updated = 0u64;
        for (key, (_, sent)) in state.rows.iter_mut() {
            if key.user_id == user_id
                && key.repo_id == repo_id
                && issue_numbers.contains(&key.issue_number)
            {
                *sent = true;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn delete_sent(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state.rows.retain(|_, (_, sent)| !*sent);
        Ok((before - state.rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use notifier_core::{IssueState, Label};

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().unwrap()
    }

    fn issue(number: IssueNumber, title: &str) -> Issue {
        Issue {
            title: title.to_string(),
            number,
            state: IssueState::Open,
            labels: vec![Label::new("bug", "d73a4a")],
            created_at: ts(1),
            updated_at: ts(2),
            assignees_count: 0,
        }
    }

    fn per_user(user_id: Uuid, issues: &[(IssueNumber, &str)]) -> PerUserIssues {
        let mut map = PerUserIssues::new();
        map.insert(
            user_id,
            issues.iter().map(|(n, t)| (*n, issue(*n, t))).collect(),
        );
        map
    }

    async fn seeded_store() -> (MemoryNotificationStore, Uuid, Uuid, Uuid) {
        let store = MemoryNotificationStore::new();
        let user_id = Uuid::new_v4();
        let react = Uuid::new_v4();
        let go = Uuid::new_v4();
        store
            .register_user(User {
                user_id,
                username: "hemakshis".into(),
                email: "hemakshis@example.com".into(),
            })
            .await;
        store
            .register_repository(Repository {
                repo_id: react,
                repo_name: "facebook/react".into(),
                last_event_at: ts(3),
            })
            .await;
        store
            .register_repository(Repository {
                repo_id: go,
                repo_name: "golang/go".into(),
                last_event_at: ts(4),
            })
            .await;
        (store, user_id, react, go)
    }

    #[tokio::test]
    async fn reingestion_overwrites_payload_but_keeps_sent_flag() {
        let (store, user_id, react, _go) = seeded_store().await;
        store
            .upsert_notifications(react, &per_user(user_id, &[(42, "old title")]))
            .await
            .unwrap();
        store.mark_sent(user_id, react, &[42]).await.unwrap();
        store
            .upsert_notifications(react, &per_user(user_id, &[(42, "new title")]))
            .await
            .unwrap();

        let rows = store.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].issue.title, "new title");
        assert!(rows[0].sent);
    }

    #[tokio::test]
    async fn digest_groups_by_repository_name() {
        let (store, user_id, react, go) = seeded_store().await;
        store
            .upsert_notifications(go, &per_user(user_id, &[(9, "go issue")]))
            .await
            .unwrap();
        store
            .upsert_notifications(react, &per_user(user_id, &[(2, "b"), (1, "a")]))
            .await
            .unwrap();

        let digest = store.pending_digest(user_id).await.unwrap();
        assert_eq!(digest.len(), 2);
        assert_eq!(digest[0].repo_name, "facebook/react");
        assert_eq!(
            digest[0].issues.iter().map(|i| i.number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(digest[0].last_event_at, ts(3));
        assert_eq!(digest[1].repo_name, "golang/go");

        let users = store.pending_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username, "hemakshis");
    }

    #[tokio::test]
    async fn mark_sent_touches_only_listed_issues_and_purge_removes_them() {
        let (store, user_id, react, _go) = seeded_store().await;
        store
            .upsert_notifications(react, &per_user(user_id, &[(1, "a"), (2, "b")]))
            .await
            .unwrap();

        assert_eq!(store.mark_sent(user_id, react, &[1]).await.unwrap(), 1);
        assert_eq!(store.delete_sent().await.unwrap(), 1);

        let rows = store.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].issue_number, 2);
        assert!(!rows[0].sent);
    }

    #[tokio::test]
    async fn users_without_pending_rows_are_not_listed() {
        let (store, user_id, react, _go) = seeded_store().await;
        store
            .upsert_notifications(react, &per_user(user_id, &[(1, "a")]))
            .await
            .unwrap();
        store.mark_sent(user_id, react, &[1]).await.unwrap();
        assert!(store.pending_users().await.unwrap().is_empty());
        assert!(store.pending_digest(user_id).await.unwrap().is_empty());
    }

    #[test]
    fn same_named_repositories_stay_in_separate_digests() {
        let (fork, upstream) = (Uuid::new_v4(), Uuid::new_v4());
        let row = |repo_id, number| (repo_id, "acme/widgets".to_string(), ts(3), issue(number, "t"));
        let digests = group_by_repository(vec![
            row(fork, 1),
            row(upstream, 2),
            row(fork, 3),
            row(upstream, 4),
        ]);
        assert_eq!(digests.len(), 2);
        assert_eq!(digests[0].repo_id, fork);
        let numbers = |d: &RepositoryDigest| d.issues.iter().map(|i| i.number).collect::<Vec<_>>();
        assert_eq!(numbers(&digests[0]), vec![1, 3]);
        assert_eq!(numbers(&digests[1]), vec![2, 4]);
    }
}
