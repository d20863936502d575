//! Per-repository ingestion, per-user dispatch and the cycle that joins them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use notifier_adapters::{AdapterError, EventFeed, MetadataSource};
use notifier_core::{Repository, User};
use notifier_mail::{render_digest, MailError, Mailer};
use notifier_storage::{NotificationStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    aggregate_per_user, fetch_events_since, materialize_issues, IngestContext, IngestOptions,
    PageStop, SubscriptionIndex,
};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("loading subscriptions for {repo}: {source}")]
    Subscriptions {
        repo: String,
        #[source]
        source: AdapterError,
    },
    #[error("fetching events for {repo}: {source}")]
    Feed {
        repo: String,
        #[source]
        source: AdapterError,
    },
    #[error("persisting notifications for {repo}: {source}")]
    Persist {
        repo: String,
        #[source]
        source: StoreError,
    },
    #[error("advancing watermark for {repo}: {source}")]
    Watermark {
        repo: String,
        #[source]
        source: AdapterError,
    },
    #[error("ingestion task aborted: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("reading digest for {user_id}: {source}")]
    Digest {
        user_id: Uuid,
        #[source]
        source: StoreError,
    },
    #[error("rendering digest for {user_id}: {source}")]
    Render {
        user_id: Uuid,
        #[source]
        source: MailError,
    },
    #[error("sending digest to {user_id}: {source}")]
    Send {
        user_id: Uuid,
        #[source]
        source: MailError,
    },
    #[error("marking rows sent for {user_id} in {repo_id}: {source}")]
    MarkSent {
        user_id: Uuid,
        repo_id: Uuid,
        #[source]
        source: StoreError,
    },
    #[error("dispatch task aborted: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub repo_id: Uuid,
    pub repo_name: String,
    pub fetch_events_till: DateTime<Utc>,
    pub pages_fetched: u32,
    pub page_stop: PageStop,
    pub events_seen: usize,
    pub skipped_events: usize,
    pub skipped_subscriptions: usize,
    pub qualifying_events: usize,
    pub issues: usize,
    pub recipients: usize,
    pub rows_written: u64,
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub user_id: Uuid,
    pub repositories: usize,
    pub issues: usize,
    pub rows_marked: u64,
    pub email_sent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub repositories: usize,
    pub repositories_failed: usize,
    pub rows_written: u64,
    pub watermarks_advanced: usize,
    pub users: usize,
    pub users_failed: usize,
    pub emails_sent: usize,
    pub rows_marked_sent: u64,
    pub rows_purged: u64,
}

/// Everything one cycle needs. Cloning is cheap; each spawned task holds its
/// own clone.
#[derive(Clone)]
pub struct NotifierPipeline {
    metadata: Arc<dyn MetadataSource>,
    feed: Arc<dyn EventFeed>,
    store: Arc<dyn NotificationStore>,
    mailer: Arc<dyn Mailer>,
    options: IngestOptions,
    settle: Duration,
}

impl NotifierPipeline {
    pub fn new(
        metadata: Arc<dyn MetadataSource>,
        feed: Arc<dyn EventFeed>,
        store: Arc<dyn NotificationStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            metadata,
            feed,
            store,
            mailer,
            options: IngestOptions::default(),
            settle: Duration::ZERO,
        }
    }

    pub fn with_options(mut self, options: IngestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>, AdapterError> {
        self.metadata.list_repositories().await
    }

    /// Runs the full pipeline for one repository. Nothing is written and the
    /// watermark stays put unless every step before it succeeded.
    pub async fn ingest_repository(
        &self,
        run_id: Uuid,
        repository: Repository,
    ) -> Result<IngestOutcome, IngestError> {
        let span = info_span!("ingest_repository", repo = %repository.repo_name, %run_id);
        self.ingest_inner(run_id, repository).instrument(span).await
    }

    async fn ingest_inner(
        &self,
        run_id: Uuid,
        repository: Repository,
    ) -> Result<IngestOutcome, IngestError> {
        let repo = repository.repo_name.clone();
        let repo_id = repository.repo_id;

        let subscriptions = self
            .metadata
            .list_subscriptions(repo_id)
            .await
            .map_err(|source| IngestError::Subscriptions {
                repo: repo.clone(),
                source,
            })?;
        let index = SubscriptionIndex::build(&subscriptions);
        if index.skipped_rows() > 0 {
            warn!(skipped = index.skipped_rows(), "dropped subscriptions with malformed user ids");
        }

        let ctx = IngestContext::new(run_id, repository, Utc::now(), &self.options);
        debug!(fetch_events_till = %ctx.fetch_events_till, labels = index.users_per_label().len(), "resolved fetch horizon");

        let fetched = fetch_events_since(
            self.feed.as_ref(),
            &repo,
            ctx.fetch_events_till,
            self.options.per_page,
            self.options.max_pages,
        )
        .await
        .map_err(|source| IngestError::Feed {
            repo: repo.clone(),
            source,
        })?;
        if fetched.skipped > 0 {
            warn!(skipped = fetched.skipped, "skipped undecodable feed events");
        }

        let materialized = materialize_issues(&fetched.events, ctx.fetch_events_till, &index);
        let mut recipients = 0usize;
        let mut rows_written = 0u64;
        if materialized.is_empty() {
            debug!("no qualifying label events");
        } else {
            let per_user = aggregate_per_user(&materialized, &index);
            recipients = per_user.len();
            rows_written = self
                .store
                .upsert_notifications(repo_id, &per_user)
                .await
                .map_err(|source| IngestError::Persist {
                    repo: repo.clone(),
                    source,
                })?;
        }

        let watermark = ctx.next_watermark(fetched.most_recent_event_time);
        if let Some(next) = watermark {
            self.metadata
                .update_last_event_at(repo_id, next)
                .await
                .map_err(|source| IngestError::Watermark {
                    repo: repo.clone(),
                    source,
                })?;
        }

        info!(
            pages = fetched.pages,
            events = fetched.events.len(),
            issues = materialized.issues.len(),
            recipients,
            rows_written,
            watermark = ?watermark,
            "repository ingested"
        );

        Ok(IngestOutcome {
            repo_id,
            repo_name: repo,
            fetch_events_till: ctx.fetch_events_till,
            pages_fetched: fetched.pages,
            page_stop: fetched.stop,
            events_seen: fetched.events.len(),
            skipped_events: fetched.skipped,
            skipped_subscriptions: index.skipped_rows(),
            qualifying_events: materialized.qualifying_events,
            issues: materialized.issues.len(),
            recipients,
            rows_written,
            watermark,
        })
    }

    /// One task per repository; returns once every task has finished.
    pub async fn ingest_all(
        &self,
        run_id: Uuid,
        repositories: Vec<Repository>,
    ) -> Vec<Result<IngestOutcome, IngestError>> {
        let mut tasks = JoinSet::new();
        for repository in repositories {
            let pipeline = self.clone();
            tasks.spawn(async move { pipeline.ingest_repository(run_id, repository).await });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(IngestError::Task(err.to_string())));
            if let Err(err) = &result {
                error!(error = %err, "repository ingestion failed");
            }
            results.push(result);
        }
        results
    }

    /// Sends one digest covering all of the user's pending rows, then marks
    /// exactly the rendered rows as sent, one repository at a time.
    pub async fn dispatch_user(&self, user: User) -> Result<DispatchOutcome, DispatchError> {
        let span = info_span!("dispatch_user", user_id = %user.user_id);
        self.dispatch_inner(user).instrument(span).await
    }

    async fn dispatch_inner(&self, user: User) -> Result<DispatchOutcome, DispatchError> {
        let user_id = user.user_id;
        let digests = self
            .store
            .pending_digest(user_id)
            .await
            .map_err(|source| DispatchError::Digest { user_id, source })?;
        let issues = digests.iter().map(|d| d.issues.len()).sum::<usize>();
        if issues == 0 {
            debug!("nothing pending");
            return Ok(DispatchOutcome {
                user_id,
                repositories: 0,
                issues: 0,
                rows_marked: 0,
                email_sent: false,
            });
        }

        let email = render_digest(&user, &digests)
            .map_err(|source| DispatchError::Render { user_id, source })?;
        self.mailer
            .send(&user, &email)
            .await
            .map_err(|source| DispatchError::Send { user_id, source })?;

        let mut rows_marked = 0u64;
        for digest in &digests {
            let numbers = digest.issues.iter().map(|i| i.number).collect::<Vec<_>>();
            rows_marked += self
                .store
                .mark_sent(user_id, digest.repo_id, &numbers)
                .await
                .map_err(|source| DispatchError::MarkSent {
                    user_id,
                    repo_id: digest.repo_id,
                    source,
                })?;
        }

        info!(repositories = digests.len(), issues, rows_marked, "digest sent");
        Ok(DispatchOutcome {
            user_id,
            repositories: digests.len(),
            issues,
            rows_marked,
            email_sent: true,
        })
    }

    /// One task per user with pending rows; returns once every task has finished.
    pub async fn dispatch_all(
        &self,
    ) -> Result<Vec<Result<DispatchOutcome, DispatchError>>, StoreError> {
        let users = self.store.pending_users().await?;
        let mut tasks = JoinSet::new();
        for user in users {
            let pipeline = self.clone();
            tasks.spawn(async move { pipeline.dispatch_user(user).await });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(DispatchError::Task(err.to_string())));
            if let Err(err) = &result {
                error!(error = %err, "digest dispatch failed");
            }
            results.push(result);
        }
        Ok(results)
    }

    pub async fn cleanup(&self) -> Result<u64, StoreError> {
        let purged = self.store.delete_sent().await?;
        info!(purged, "purged sent notifications");
        Ok(purged)
    }

    async fn settle_wait(&self) {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
    }

    /// Ingest every repository, then dispatch, then clean up. Each phase starts
    /// only after every task of the previous one has finished.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("notification_cycle", %run_id);

        async {
            let repositories = self
                .metadata
                .list_repositories()
                .await
                .context("listing tracked repositories")?;
            let repository_count = repositories.len();
            info!(repositories = repository_count, "cycle started");

            let ingested = self.ingest_all(run_id, repositories).await;
            self.settle_wait().await;

            let dispatched = self
                .dispatch_all()
                .await
                .context("listing users with pending notifications")?;
            self.settle_wait().await;

            let rows_purged = self.cleanup().await.context("purging sent notifications")?;

            let ok_ingest = ingested.iter().filter_map(|r| r.as_ref().ok());
            let ok_dispatch = dispatched.iter().filter_map(|r| r.as_ref().ok());
            let summary = CycleSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                repositories: repository_count,
                repositories_failed: ingested.iter().filter(|r| r.is_err()).count(),
                rows_written: ok_ingest.clone().map(|o| o.rows_written).sum(),
                watermarks_advanced: ok_ingest.filter(|o| o.watermark.is_some()).count(),
                users: dispatched.len(),
                users_failed: dispatched.iter().filter(|r| r.is_err()).count(),
                emails_sent: ok_dispatch.clone().filter(|o| o.email_sent).count(),
                rows_marked_sent: ok_dispatch.map(|o| o.rows_marked).sum(),
                rows_purged,
            };
            info!(
                repositories_failed = summary.repositories_failed,
                emails_sent = summary.emails_sent,
                users_failed = summary.users_failed,
                rows_purged,
                "cycle finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Scheduler that runs [`Self::run_cycle`] on `cron`. A tick that fires
    /// while the previous cycle is still running is skipped.
    pub async fn build_scheduler(&self, cron: &str) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = self.clone();
        let running = Arc::new(Mutex::new(()));
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let running = running.clone();
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("previous cycle still running; skipping tick");
                    return;
                };
                if let Err(err) = pipeline.run_cycle().await {
                    error!(error = %format!("{err:#}"), "notification cycle failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}
