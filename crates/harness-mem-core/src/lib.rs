use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

mod config;
mod shadow;

pub use config::{
    mask_endpoint, BackendMode, StorageConfig, ENV_BACKEND_MODE, ENV_DB_PATH, ENV_MANAGED_API_KEY,
    ENV_MANAGED_ENDPOINT, ENV_WORKSPACE_UID,
};
pub use shadow::{PromotionReadiness, ShadowConfig, ShadowMetrics, ShadowPhase, ShadowSyncManager};

/// Overlap ratio at which a shadow read counts as a match. The promotion gate
/// uses the same value for the aggregate match rate.
pub const SHADOW_MATCH_THRESHOLD: f64 = 0.95;

/// Minimum number of shadow reads before promotion is considered.
pub const MIN_SHADOW_READS: u64 = 100;

/// Highest replication failure rate that still passes the promotion gate.
pub const MAX_REPLICATION_FAILURE_RATE: f64 = 0.01;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Portable parameter/column value shared by both storage backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One result row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row(BTreeMap<String, SqlValue>);

impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        self.0.insert(column.into(), value.into());
    }

    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value);
        self
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.0.get(column)
    }

    /// Text column, `None` when absent or NULL.
    #[must_use]
    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(SqlValue::as_str)
    }

    /// Text column that must be present and non-null.
    ///
    /// # Errors
    /// Returns a validation error naming the missing column.
    pub fn required_text(&self, column: &str) -> Result<String, CoreError> {
        self.text(column)
            .map(str::to_string)
            .ok_or_else(|| CoreError::Validation(format!("row is missing text column {column}")))
    }

    #[must_use]
    pub fn integer(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    #[must_use]
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, SqlValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, SqlValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Immutable unit of the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_id: String,
    pub platform: String,
    pub project: String,
    pub workspace_uid: String,
    pub session_id: String,
    pub event_type: String,
    pub ts: String,
    pub payload_json: String,
    pub tags_json: String,
    pub privacy_tags_json: String,
    pub dedupe_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub created_at: String,
}

impl StoredEvent {
    /// Check the fields the log relies on for identity and ordering.
    ///
    /// # Errors
    /// Returns a validation error for the first empty identity field.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, value) in [
            ("event_id", &self.event_id),
            ("session_id", &self.session_id),
            ("dedupe_hash", &self.dedupe_hash),
            ("ts", &self.ts),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::Validation(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    /// Rebuild an event from a row of `mem_events`.
    ///
    /// # Errors
    /// Returns a validation error when a required column is missing.
    pub fn from_row(row: &Row) -> Result<Self, CoreError> {
        Ok(Self {
            event_id: row.required_text("event_id")?,
            platform: row.required_text("platform")?,
            project: row.required_text("project")?,
            workspace_uid: row.text("workspace_uid").unwrap_or_default().to_string(),
            session_id: row.required_text("session_id")?,
            event_type: row.required_text("event_type")?,
            ts: row.required_text("ts")?,
            payload_json: row.text("payload_json").unwrap_or("{}").to_string(),
            tags_json: row.text("tags_json").unwrap_or("[]").to_string(),
            privacy_tags_json: row.text("privacy_tags_json").unwrap_or("[]").to_string(),
            dedupe_hash: row.required_text("dedupe_hash")?,
            observation_id: row.text("observation_id").map(str::to_string),
            correlation_id: row.text("correlation_id").map(str::to_string),
            created_at: row.required_text("created_at")?,
        })
    }
}

/// Observation fields derived from an event payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservationDraft {
    pub title: Option<String>,
    pub content: String,
    pub content_redacted: String,
    pub observation_type: String,
}

impl ObservationDraft {
    /// `content` falls back to the whole payload and `content_redacted` to
    /// `content`. Checkpoints keep their type; everything else is `context`.
    ///
    /// # Errors
    /// Returns a validation error when `payload_json` is not valid JSON.
    pub fn from_event(event: &StoredEvent) -> Result<Self, CoreError> {
        let raw =
            if event.payload_json.trim().is_empty() { "{}" } else { event.payload_json.as_str() };
        let payload: serde_json::Value = serde_json::from_str(raw).map_err(|err| {
            CoreError::Validation(format!("payload_json is not valid JSON: {err}"))
        })?;

        let text =
            |key: &str| payload.get(key).and_then(serde_json::Value::as_str).map(str::to_string);
        let content = text("content").unwrap_or_else(|| payload.to_string());
        let content_redacted = text("content_redacted").unwrap_or_else(|| content.clone());
        let observation_type =
            if event.event_type == "checkpoint" { "checkpoint" } else { "context" };

        Ok(Self {
            title: text("title"),
            content,
            content_redacted,
            observation_type: observation_type.to_string(),
        })
    }
}

/// Counts reported by one `append` call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendResult {
    pub inserted: usize,
    pub deduplicated: usize,
    /// Events that failed validation and were not written.
    #[serde(default)]
    pub skipped: usize,
}

impl AppendResult {
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.inserted + self.deduplicated
    }
}

/// Output of one projection pass. Not persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectionResult {
    pub events_projected: usize,
    pub projections_updated: BTreeSet<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventFilter {
    pub project: Option<String>,
    pub workspace_uid: Option<String>,
    pub platform: Option<String>,
    pub session_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId(pub Ulid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn observation_id(&self) -> String {
        format!("obs_{}", self.0)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize)]
struct DedupeBasis<'a> {
    platform: String,
    project: &'a str,
    session_id: &'a str,
    event_type: String,
    ts: &'a str,
    payload: &'a serde_json::Value,
    tags: Vec<String>,
    privacy_tags: Vec<String>,
}

/// Deterministic idempotency key for an event that arrived without one.
///
/// # Errors
/// Returns a validation error when the basis cannot be serialized.
#[allow(clippy::too_many_arguments)]
pub fn build_dedupe_hash(
    platform: &str,
    project: &str,
    session_id: &str,
    event_type: &str,
    ts: &str,
    payload: &serde_json::Value,
    tags: &[String],
    privacy_tags: &[String],
) -> Result<String, CoreError> {
    let basis = DedupeBasis {
        platform: or_unknown(platform).to_lowercase(),
        project: or_unknown(project),
        session_id: or_unknown(session_id),
        event_type: or_unknown(event_type).to_lowercase(),
        ts: ts.trim(),
        payload,
        tags: normalize_tags(tags),
        privacy_tags: normalize_tags(privacy_tags),
    };
    let canonical = serde_json::to_vec(&basis)
        .map_err(|err| CoreError::Validation(format!("failed to encode dedupe basis: {err}")))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn or_unknown(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        "unknown"
    } else {
        trimmed
    }
}

/// Trim, lower-case and de-duplicate tags, keeping first-seen order.
#[must_use]
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for tag in tags {
        let normalized = tag.trim().to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    out
}

/// Current UTC time as RFC 3339.
///
/// # Errors
/// Returns a validation error if the timestamp cannot be formatted.
pub fn now_rfc3339() -> Result<String, CoreError> {
    rfc3339(OffsetDateTime::now_utc())
}

/// # Errors
/// Returns a validation error if the timestamp cannot be formatted.
pub fn rfc3339(value: OffsetDateTime) -> Result<String, CoreError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_row() -> Row {
        Row::new()
            .with("event_id", "evt-1")
            .with("platform", "claude")
            .with("project", "/repo")
            .with("workspace_uid", "")
            .with("session_id", "sess-1")
            .with("event_type", "user_prompt")
            .with("ts", "2026-01-01T00:00:00Z")
            .with("payload_json", "{\"content\":\"hi\"}")
            .with("tags_json", "[]")
            .with("privacy_tags_json", "[]")
            .with("dedupe_hash", "abc")
            .with("observation_id", SqlValue::Null)
            .with("created_at", "2026-01-01T00:00:01Z")
    }

    #[test]
    fn stored_event_from_row_maps_nulls_to_none() -> Result<(), CoreError> {
        let event = StoredEvent::from_row(&fixture_row())?;
        assert_eq!(event.event_id, "evt-1");
        assert_eq!(event.observation_id, None);
        assert_eq!(event.correlation_id, None);
        Ok(())
    }

    #[test]
    fn stored_event_from_row_rejects_missing_dedupe_hash() {
        let mut row = fixture_row();
        row.insert("dedupe_hash", SqlValue::Null);
        let err = StoredEvent::from_row(&row);
        assert!(matches!(
            err,
            Err(CoreError::Validation(message)) if message.contains("dedupe_hash")
        ));
    }

    #[test]
    fn validate_rejects_blank_identity_fields() -> Result<(), CoreError> {
        let mut event = StoredEvent::from_row(&fixture_row())?;
        event.session_id = "  ".to_string();
        assert!(event.validate().is_err());
        Ok(())
    }

    #[test]
    fn dedupe_hash_ignores_tag_case_order_duplicates_and_whitespace() -> Result<(), CoreError> {
        let payload = serde_json::json!({"content": "same"});
        let a = build_dedupe_hash(
            "Claude",
            "/repo",
            "s1",
            "User_Prompt",
            "2026-01-01T00:00:00Z",
            &payload,
            &["A".to_string(), "b".to_string(), "a".to_string()],
            &[],
        )?;
        let b = build_dedupe_hash(
            " claude ",
            "/repo",
            "s1",
            "user_prompt",
            " 2026-01-01T00:00:00Z",
            &payload,
            &[" a".to_string(), "B".to_string()],
            &[],
        )?;
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        Ok(())
    }

    #[test]
    fn dedupe_hash_changes_with_payload() -> Result<(), CoreError> {
        let first = build_dedupe_hash(
            "claude",
            "/repo",
            "s1",
            "user_prompt",
            "t",
            &serde_json::json!({"content": "one"}),
            &[],
            &[],
        )?;
        let second = build_dedupe_hash(
            "claude",
            "/repo",
            "s1",
            "user_prompt",
            "t",
            &serde_json::json!({"content": "two"}),
            &[],
            &[],
        )?;
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn observation_id_is_derived_from_event_id() {
        let id = EventId::new();
        assert_eq!(id.observation_id(), format!("obs_{id}"));
    }

    #[test]
    fn observation_draft_prefers_explicit_fields() -> Result<(), CoreError> {
        let mut event = StoredEvent::from_row(&fixture_row())?;
        event.event_type = "checkpoint".to_string();
        event.payload_json =
            r#"{"title":"T","content":"raw","content_redacted":"[x]"}"#.to_string();
        let draft = ObservationDraft::from_event(&event)?;
        assert_eq!(draft.title.as_deref(), Some("T"));
        assert_eq!(draft.content, "raw");
        assert_eq!(draft.content_redacted, "[x]");
        assert_eq!(draft.observation_type, "checkpoint");
        Ok(())
    }

    #[test]
    fn observation_draft_falls_back_to_payload_text() -> Result<(), CoreError> {
        let mut event = StoredEvent::from_row(&fixture_row())?;
        event.payload_json = r#"{"tool":"bash"}"#.to_string();
        let draft = ObservationDraft::from_event(&event)?;
        assert_eq!(draft.title, None);
        assert_eq!(draft.content, r#"{"tool":"bash"}"#);
        assert_eq!(draft.content_redacted, draft.content);
        assert_eq!(draft.observation_type, "context");

        event.payload_json = "{broken".to_string();
        assert!(ObservationDraft::from_event(&event).is_err());
        Ok(())
    }

    #[test]
    fn append_result_accepted_excludes_skipped_events() {
        let result = AppendResult { inserted: 3, deduplicated: 2, skipped: 1 };
        assert_eq!(result.accepted(), 5);
    }
}
