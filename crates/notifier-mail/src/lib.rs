//! Digest email rendering and delivery.

use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use notifier_core::{Issue, Label, RepositoryDigest, User};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "notifier-mail";

pub const DIGEST_SUBJECT: &str = "New labeled issues in your tracked repositories";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("template render failed: {0}")]
    Render(#[from] askama::Error),
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("message build failed: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp transport failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct LabelChip {
    pub name: String,
    pub background: String,
    pub foreground: &'static str,
    pub is_of_interest: bool,
}

impl From<&Label> for LabelChip {
    fn from(label: &Label) -> Self {
        Self {
            name: label.name.clone(),
            background: label.color.clone(),
            foreground: label.text_color(),
            is_of_interest: label.is_of_interest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssueCard {
    pub number: u64,
    pub title: String,
    pub state: &'static str,
    pub assignees_count: usize,
    pub created_at: String,
    pub updated_at: String,
    pub labels: Vec<LabelChip>,
}

impl From<&Issue> for IssueCard {
    fn from(issue: &Issue) -> Self {
        Self {
            number: issue.number,
            title: issue.title.clone(),
            state: issue.state.as_str(),
            assignees_count: issue.assignees_count,
            created_at: format_timestamp(issue.created_at),
            updated_at: format_timestamp(issue.updated_at),
            labels: issue.labels.iter().map(LabelChip::from).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepositorySection {
    pub repo_name: String,
    pub events_up_to: String,
    pub issues: Vec<IssueCard>,
}

impl From<&RepositoryDigest> for RepositorySection {
    fn from(digest: &RepositoryDigest) -> Self {
        Self {
            repo_name: digest.repo_name.clone(),
            events_up_to: format_timestamp(digest.last_event_at),
            issues: digest.issues.iter().map(IssueCard::from).collect(),
        }
    }
}

#[derive(Template)]
#[template(path = "new_labeled_events.html")]
pub struct DigestTemplate {
    pub username: String,
    pub repositories: Vec<RepositorySection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Renders one digest email covering every repository in `digests`.
pub fn render_digest(user: &User, digests: &[RepositoryDigest]) -> Result<RenderedEmail, MailError> {
    let template = DigestTemplate {
        username: user.username.clone(),
        repositories: digests.iter().map(RepositorySection::from).collect(),
    };
    Ok(RenderedEmail {
        subject: DIGEST_SUBJECT.to_string(),
        html: template.render()?,
    })
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &User, email: &RenderedEmail) -> Result<(), MailError>;
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

/// STARTTLS SMTP submission through a pooled lettre transport.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Must be called inside a tokio runtime; the connection pool spawns onto it.
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let from: Mailbox = config.from.parse()?;
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?.port(config.port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &User, email: &RenderedEmail) -> Result<(), MailError> {
        let address: Address = to.email.parse()?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(Some(to.username.clone()), address))
            .subject(email.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(email.html.clone())?;
        let response = self.transport.send(message).await?;
        debug!(user_id = %to.user_id, code = %response.code(), "smtp accepted message");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Keeps every message in memory; addresses registered with `reject` fail.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
    rejected: Mutex<Vec<String>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reject(&self, email: &str) {
        self.rejected.lock().await.push(email.to_string());
    }

    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &User, email: &RenderedEmail) -> Result<(), MailError> {
        if self.rejected.lock().await.iter().any(|e| e == &to.email) {
            return Err(MailError::Rejected(format!("mailbox {} rejected message", to.email)));
        }
        self.sent.lock().await.push(SentMail {
            to: to.email.clone(),
            subject: email.subject.clone(),
            html: email.html.clone(),
        });
        Ok(())
    }
}
