//! Core domain model for the issue label notifier.
//!
//! Upstream JSON is decoded exactly once, here, into typed values. Everything
//! downstream (matching, persistence, email) works on these types only.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "notifier-core";

pub type IssueNumber = u64;

/// Personalized issue snapshots keyed by recipient, then by issue number.
pub type PerUserIssues = BTreeMap<Uuid, BTreeMap<IssueNumber, Issue>>;

/// Watermark value the metadata service reports for a repository that has never been fetched.
pub fn never_fetched() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

pub fn is_never_fetched(watermark: DateTime<Utc>) -> bool {
    watermark <= never_fetched()
}

/// Tracked repository as served by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    #[serde(rename = "repoID")]
    pub repo_id: Uuid,
    #[serde(rename = "repoName")]
    pub repo_name: String,
    #[serde(rename = "lastEventAt", default = "never_fetched")]
    pub last_event_at: DateTime<Utc>,
}

/// One `(label, user)` subscription row. The user id is kept raw so that a
/// malformed row can be dropped by the index builder instead of failing the
/// whole response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub label: String,
    #[serde(rename = "userID", alias = "userId")]
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub is_of_interest: bool,
}

impl Label {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        let color = color.into();
        let color = if color.starts_with('#') {
            color
        } else {
            format!("#{color}")
        };
        Self {
            name: name.into(),
            color,
            is_of_interest: false,
        }
    }

    /// Foreground colour that stays readable on top of the label's background.
    pub fn text_color(&self) -> &'static str {
        let Some((r, g, b)) = parse_hex_rgb(&self.color) else {
            return "black";
        };
        let luma = f64::from(r) * 0.299 + f64::from(g) * 0.587 + f64::from(b) * 0.114;
        if luma > 186.0 {
            "black"
        } else {
            "white"
        }
    }
}

fn parse_hex_rgb(color: &str) -> Option<(u8, u8, u8)> {
    let hex = color.trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some((r, g, b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
    #[serde(other)]
    Unknown,
}

impl IssueState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IssueState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IssueState::Open => "open",
            IssueState::Closed => "closed",
            IssueState::Unknown => "unknown",
        }
    }
}

/// Deduplicated, per-run view of one issue. This is also the JSON payload
/// persisted in `notification_data.issue_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub title: String,
    pub number: IssueNumber,
    pub state: IssueState,
    pub labels: Vec<Label>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assignees_count: usize,
}

/// Pending issues for one user, grouped under one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryDigest {
    pub repo_id: Uuid,
    pub repo_name: String,
    pub last_event_at: DateTime<Utc>,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRow {
    pub user_id: Uuid,
    pub repo_id: Uuid,
    pub issue_number: IssueNumber,
    pub issue: Issue,
    pub sent: bool,
}

/// Upstream issue event, decoded once at the feed boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Labeled(LabeledEvent),
    Other {
        kind: String,
        created_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledEvent {
    pub created_at: DateTime<Utc>,
    pub label: Label,
    pub issue: Issue,
}

impl FeedEvent {
    pub const LABELED: &'static str = "labeled";

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            FeedEvent::Labeled(e) => e.created_at,
            FeedEvent::Other { created_at, .. } => *created_at,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            FeedEvent::Labeled(_) => Self::LABELED,
            FeedEvent::Other { kind, .. } => kind,
        }
    }
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("malformed event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("`{kind}` event is missing `{field}`")]
    MissingField { kind: String, field: &'static str },
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    event: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    label: Option<JsonValue>,
    #[serde(default)]
    issue: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct WireLabel {
    name: String,
    #[serde(default)]
    color: String,
}

#[derive(Debug, Deserialize)]
struct WireIssue {
    number: IssueNumber,
    title: String,
    state: IssueState,
    #[serde(default)]
    labels: Vec<WireLabel>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    assignees: Vec<JsonValue>,
}

impl From<WireLabel> for Label {
    fn from(wire: WireLabel) -> Self {
        Label::new(wire.name, wire.color)
    }
}

impl From<WireIssue> for Issue {
    fn from(wire: WireIssue) -> Self {
        Issue {
            title: wire.title,
            number: wire.number,
            state: wire.state,
            labels: wire.labels.into_iter().map(Label::from).collect(),
            created_at: wire.created_at,
            updated_at: wire.updated_at,
            assignees_count: wire.assignees.len(),
        }
    }
}

pub fn decode_event(value: JsonValue) -> Result<FeedEvent, EventDecodeError> {
    let wire: WireEvent = serde_json::from_value(value)?;
    if wire.event != FeedEvent::LABELED {
        return Ok(FeedEvent::Other {
            kind: wire.event,
            created_at: wire.created_at,
        });
    }

    let label = wire.label.filter(|v| !v.is_null()).ok_or_else(|| EventDecodeError::MissingField {
        kind: wire.event.clone(),
        field: "label",
    })?;
    let issue = wire.issue.filter(|v| !v.is_null()).ok_or_else(|| EventDecodeError::MissingField {
        kind: wire.event.clone(),
        field: "issue",
    })?;
    let label: WireLabel = serde_json::from_value(label)?;
    let issue: WireIssue = serde_json::from_value(issue)?;
    Ok(FeedEvent::Labeled(LabeledEvent {
        created_at: wire.created_at,
        label: label.into(),
        issue: issue.into(),
    }))
}

/// One upstream page after decoding. Records that could not be decoded are
/// counted in `skipped` and otherwise ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedPage {
    pub events: Vec<FeedEvent>,
    pub raw_len: usize,
    pub skipped: usize,
}

pub fn decode_page(values: Vec<JsonValue>) -> DecodedPage {
    let raw_len = values.len();
    let mut events = Vec::with_capacity(raw_len);
    let mut skipped = 0usize;
    for value in values {
        match decode_event(value) {
            Ok(event) => events.push(event),
            Err(_) => skipped += 1,
        }
    }
    DecodedPage {
        events,
        raw_len,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labeled_json(created_at: &str, label: &str, number: u64, state: &str) -> JsonValue {
        json!({
            "event": "labeled",
            "created_at": created_at,
            "label": { "name": label, "color": "d73a4a" },
            "issue": {
                "number": number,
                "title": "Crash on startup",
                "state": state,
                "labels": [{ "name": label, "color": "d73a4a" }, { "name": "help wanted", "color": "008672" }],
                "created_at": "2023-12-30T10:00:00Z",
                "updated_at": "2024-01-02T00:00:00Z",
                "assignees": [{ "login": "octocat" }]
            }
        })
    }

    #[test]
    fn repository_accepts_offset_watermark_and_sentinel() {
        let repo: Repository = serde_json::from_value(json!({
            "repoID": "6f1c8a0e-34f7-4c6e-9a55-0a4f8c2e8b10",
            "repoName": "facebook/react",
            "lastEventAt": "1970-01-01T05:30:00+05:30"
        }))
        .unwrap();
        assert!(is_never_fetched(repo.last_event_at));

        let repo: Repository = serde_json::from_value(json!({
            "repoID": "6f1c8a0e-34f7-4c6e-9a55-0a4f8c2e8b10",
            "repoName": "golang/go",
            "lastEventAt": "2024-01-01T05:30:00+05:30"
        }))
        .unwrap();
        assert_eq!(repo.last_event_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert!(!is_never_fetched(repo.last_event_at));
    }

    #[test]
    fn subscription_accepts_both_user_id_spellings() {
        let a: Subscription = serde_json::from_value(json!({"label": "bug", "userID": "x"})).unwrap();
        let b: Subscription = serde_json::from_value(json!({"label": "bug", "userId": "x"})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn labeled_event_decodes_into_typed_snapshot() {
        let event = decode_event(labeled_json("2024-01-02T00:00:00Z", "bug", 42, "open")).unwrap();
        let FeedEvent::Labeled(labeled) = event else {
            panic!("expected labeled event");
        };
        assert_eq!(labeled.label.name, "bug");
        assert_eq!(labeled.label.color, "#d73a4a");
        assert_eq!(labeled.issue.number, 42);
        assert_eq!(labeled.issue.state, IssueState::Open);
        assert_eq!(labeled.issue.assignees_count, 1);
        assert_eq!(labeled.issue.labels.len(), 2);
        assert!(labeled.issue.labels.iter().all(|l| !l.is_of_interest));
    }

    #[test]
    fn other_event_kinds_keep_only_their_timestamp() {
        let event = decode_event(json!({
            "event": "closed",
            "created_at": "2024-01-03T00:00:00Z",
            "issue": { "number": 7 }
        }))
        .unwrap();
        assert_eq!(event.kind(), "closed");
        assert_eq!(event.created_at().to_rfc3339(), "2024-01-03T00:00:00+00:00");
    }

    #[test]
    fn labeled_event_without_issue_is_rejected() {
        let err = decode_event(json!({
            "event": "labeled",
            "created_at": "2024-01-03T00:00:00Z",
            "label": { "name": "bug", "color": "fff" }
        }))
        .unwrap_err();
        assert!(matches!(err, EventDecodeError::MissingField { field: "issue", .. }));
    }

    #[test]
    fn decode_page_skips_and_counts_malformed_records() {
        let page = decode_page(vec![
            labeled_json("2024-01-02T00:00:00Z", "bug", 1, "open"),
            json!({ "event": "labeled" }),
            json!("not an object"),
            json!({ "event": "assigned", "created_at": "2024-01-01T12:00:00Z" }),
        ]);
        assert_eq!(page.raw_len, 4);
        assert_eq!(page.skipped, 2);
        assert_eq!(page.events.len(), 2);
    }

    #[test]
    fn unknown_issue_state_is_not_terminal() {
        let state: IssueState = serde_json::from_value(json!("locked")).unwrap();
        assert_eq!(state, IssueState::Unknown);
        assert!(!state.is_terminal());
        assert!(IssueState::Closed.is_terminal());
    }

    #[test]
    fn text_color_follows_background_luma() {
        assert_eq!(Label::new("docs", "fffb00").text_color(), "black");
        assert_eq!(Label::new("bug", "#08751a").text_color(), "white");
        assert_eq!(Label::new("weird", "zz").text_color(), "black");
    }

    #[test]
    fn issue_payload_uses_camel_case_keys() {
        let event = decode_event(labeled_json("2024-01-02T00:00:00Z", "bug", 42, "open")).unwrap();
        let FeedEvent::Labeled(labeled) = event else {
            panic!("expected labeled event");
        };
        let value = serde_json::to_value(&labeled.issue).unwrap();
        assert_eq!(value["assigneesCount"], json!(1));
        assert_eq!(value["labels"][0]["isOfInterest"], json!(false));
        assert_eq!(value["state"], json!("open"));
    }
}
