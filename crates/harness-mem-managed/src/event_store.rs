use std::sync::Arc;

use harness_mem_core::{AppendResult, EventFilter, SqlValue, StoredEvent};
use harness_mem_storage::{AsyncStorageAdapter, PostgresStorageAdapter, StorageError};

// started_at is first-writer-wins: later events never move it.
const SESSION_INSERT_SQL: &str = r"
INSERT INTO mem_sessions (
  session_id, platform, project, workspace_uid, started_at, created_at, updated_at
) VALUES (?, ?, ?, ?, ?::timestamptz, NOW(), NOW())
ON CONFLICT (session_id) DO NOTHING
";

const EVENT_INSERT_SQL: &str = r"
INSERT INTO mem_events (
  event_id, platform, project, workspace_uid, session_id,
  event_type, ts, payload_json, tags_json, privacy_tags_json,
  dedupe_hash, observation_id, correlation_id, created_at
) VALUES (?, ?, ?, ?, ?, ?, ?::timestamptz, ?::jsonb, ?::jsonb, ?::jsonb, ?, ?, ?, ?::timestamptz)
ON CONFLICT (dedupe_hash) DO NOTHING
";

const LATEST_TS_SQL: &str =
    "SELECT ts FROM mem_events WHERE project = ? AND platform = ? ORDER BY ts DESC LIMIT 1";

/// Append-only event log on the remote backend.
pub struct EventStore {
    adapter: Arc<PostgresStorageAdapter>,
}

impl EventStore {
    #[must_use]
    pub fn new(adapter: Arc<PostgresStorageAdapter>) -> Self {
        Self { adapter }
    }

    /// Insert `events`, collapsing duplicates on `dedupe_hash`. Each event is
    /// written with its session row in one transaction. Events that fail
    /// validation are logged and counted as `skipped`.
    ///
    /// # Errors
    /// Returns the first remote error; events before it stay committed.
    pub async fn append(&self, events: &[StoredEvent]) -> Result<AppendResult, StorageError> {
        let mut result = AppendResult::default();

        for event in events {
            if let Err(err) = event.validate() {
                tracing::warn!(event_id = %event.event_id, error = %err, "skipping invalid event");
                result.skipped += 1;
                continue;
            }
            let inserted = self
                .adapter
                .transaction_async(|| async move {
                    self.adapter.run_async(SESSION_INSERT_SQL, &session_params(event)).await?;
                    self.adapter.run_async(EVENT_INSERT_SQL, &event_params(event)).await
                })
                .await?;

            if inserted > 0 {
                result.inserted += 1;
            } else {
                result.deduplicated += 1;
            }
        }

        Ok(result)
    }

    /// Events matching `filter`, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub async fn read(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, StorageError> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        let filters = [
            ("project = ?", &filter.project),
            ("workspace_uid = ?", &filter.workspace_uid),
            ("platform = ?", &filter.platform),
            ("session_id = ?", &filter.session_id),
            ("ts >= ?::timestamptz", &filter.since),
            ("ts <= ?::timestamptz", &filter.until),
        ];
        for (condition, value) in filters {
            if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
                conditions.push(condition);
                params.push(value.into());
            }
        }

        let mut sql = String::from("SELECT * FROM mem_events");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY ts DESC");
        if let Some(limit) = filter.limit.filter(|limit| *limit > 0) {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }
        if let Some(offset) = filter.offset.filter(|offset| *offset > 0) {
            sql.push_str(" OFFSET ?");
            params.push(SqlValue::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
        }

        let rows = self.adapter.query_all_async(&sql, &params).await?;
        rows.iter().map(|row| StoredEvent::from_row(row).map_err(StorageError::from)).collect()
    }

    /// Most recent event time for a project/platform pair; the resume
    /// watermark for ingestion collaborators.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub async fn get_latest_timestamp(
        &self,
        project: &str,
        platform: &str,
    ) -> Result<Option<String>, StorageError> {
        let params = [project.into(), platform.into()];
        let row = self.adapter.query_one_async(LATEST_TS_SQL, &params).await?;
        Ok(row.and_then(|row| row.text("ts").map(str::to_string)))
    }
}

fn session_params(event: &StoredEvent) -> Vec<SqlValue> {
    vec![
        event.session_id.as_str().into(),
        event.platform.as_str().into(),
        event.project.as_str().into(),
        event.workspace_uid.as_str().into(),
        event.ts.as_str().into(),
    ]
}

fn event_params(event: &StoredEvent) -> Vec<SqlValue> {
    vec![
        event.event_id.as_str().into(),
        event.platform.as_str().into(),
        event.project.as_str().into(),
        event.workspace_uid.as_str().into(),
        event.session_id.as_str().into(),
        event.event_type.as_str().into(),
        event.ts.as_str().into(),
        json_or(&event.payload_json, "{}").into(),
        json_or(&event.tags_json, "[]").into(),
        json_or(&event.privacy_tags_json, "[]").into(),
        event.dedupe_hash.as_str().into(),
        event.observation_id.as_deref().filter(|id| !id.is_empty()).into(),
        event.correlation_id.as_deref().filter(|id| !id.is_empty()).into(),
        event.created_at.as_str().into(),
    ]
}

fn json_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use anyhow::Result;
    use harness_mem_storage::testing::MemoryPgClient;

    use super::*;

    pub(crate) fn event(id: &str, session_id: &str, ts: &str) -> StoredEvent {
        StoredEvent {
            event_id: id.to_string(),
            platform: "claude".to_string(),
            project: "/repo".to_string(),
            workspace_uid: String::new(),
            session_id: session_id.to_string(),
            event_type: "user_prompt".to_string(),
            ts: ts.to_string(),
            payload_json: format!("{{\"content\":\"note {id}\"}}"),
            tags_json: "[\"rust\"]".to_string(),
            privacy_tags_json: "[]".to_string(),
            dedupe_hash: format!("hash-{id}"),
            observation_id: Some(format!("obs_{id}")),
            correlation_id: None,
            created_at: ts.to_string(),
        }
    }

    fn store() -> (Arc<MemoryPgClient>, EventStore) {
        let client = Arc::new(MemoryPgClient::new());
        let adapter = Arc::new(PostgresStorageAdapter::new(client.clone()));
        (client, EventStore::new(adapter))
    }

    #[tokio::test]
    async fn same_dedupe_hash_is_stored_once() -> Result<()> {
        let (client, store) = store();
        let first = event("evt-1", "sess-1", "2026-01-01T00:00:00Z");

        let result = store.append(std::slice::from_ref(&first)).await?;
        assert_eq!(result, AppendResult { inserted: 1, deduplicated: 0, skipped: 0 });

        let mut replay = first.clone();
        replay.event_id = "evt-1-retry".to_string();
        let result = store.append(&[replay]).await?;
        assert_eq!(result, AppendResult { inserted: 0, deduplicated: 1, skipped: 0 });

        let stored = client
            .rows("mem_events")
            .into_iter()
            .filter(|row| row.text("dedupe_hash") == Some("hash-evt-1"))
            .count();
        assert_eq!(stored, 1);
        Ok(())
    }

    #[tokio::test]
    async fn reused_event_id_with_a_new_hash_is_not_a_duplicate() -> Result<()> {
        let (client, store) = store();
        store.append(&[event("evt-1", "sess-1", "2026-01-01T00:00:00Z")]).await?;

        let mut clash = event("evt-1", "sess-1", "2026-01-02T00:00:00Z");
        clash.dedupe_hash = "hash-other".to_string();
        let result = store.append(&[clash]).await;
        assert!(matches!(
            result,
            Err(StorageError::Remote(message)) if message.contains("duplicate key")
        ));

        let hashes: Vec<String> = client
            .rows("mem_events")
            .iter()
            .filter_map(|row| row.text("dedupe_hash").map(str::to_string))
            .collect();
        assert_eq!(hashes, vec!["hash-evt-1"]);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_events_are_skipped_without_failing_the_batch() -> Result<()> {
        let (client, store) = store();
        let mut blank = event("evt-2", "sess-1", "2026-01-01T00:01:00Z");
        blank.dedupe_hash = " ".to_string();
        let batch = [
            event("evt-1", "sess-1", "2026-01-01T00:00:00Z"),
            blank,
            event("evt-3", "sess-1", "2026-01-01T00:02:00Z"),
        ];

        let result = store.append(&batch).await?;
        assert_eq!(result, AppendResult { inserted: 2, deduplicated: 0, skipped: 1 });

        let stored: Vec<String> = client
            .rows("mem_events")
            .iter()
            .filter_map(|row| row.text("event_id").map(str::to_string))
            .collect();
        assert_eq!(stored, vec!["evt-1", "evt-3"]);
        Ok(())
    }

    #[tokio::test]
    async fn session_row_is_written_before_the_event_in_one_transaction() -> Result<()> {
        let (client, store) = store();
        store.append(&[event("evt-1", "sess-1", "2026-01-01T00:00:00Z")]).await?;

        let sql: Vec<String> = client.statements().into_iter().map(|stmt| stmt.sql).collect();
        assert_eq!(sql[0], "BEGIN");
        assert!(sql[1].contains("INSERT INTO mem_sessions"));
        assert!(sql[2].contains("INSERT INTO mem_events"));
        assert!(sql[2].trim_end().ends_with("ON CONFLICT (dedupe_hash) DO NOTHING"));
        assert_eq!(sql[3], "COMMIT");
        Ok(())
    }

    #[tokio::test]
    async fn session_started_at_keeps_the_first_writer() -> Result<()> {
        let (client, store) = store();
        store
            .append(&[
                event("evt-1", "sess-1", "2026-01-01T00:00:00Z"),
                event("evt-2", "sess-1", "2026-01-05T00:00:00Z"),
            ])
            .await?;
        let sessions = client.rows("mem_sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].text("started_at"), Some("2026-01-01T00:00:00Z"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_event_rolls_back_its_session_row() -> Result<()> {
        let (client, store) = store();
        client.fail_statements_with_param("hash-evt-1");
        let result = store.append(&[event("evt-1", "sess-1", "2026-01-01T00:00:00Z")]).await;
        assert!(result.is_err());
        assert!(client.rows("mem_sessions").is_empty());
        assert!(client.rows("mem_events").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn read_filters_and_orders_newest_first() -> Result<()> {
        let (_client, store) = store();
        let mut other_project = event("evt-4", "sess-2", "2026-01-04T00:00:00Z");
        other_project.project = "/other".to_string();
        store
            .append(&[
                event("evt-1", "sess-1", "2026-01-01T00:00:00Z"),
                event("evt-3", "sess-1", "2026-01-03T00:00:00Z"),
                event("evt-2", "sess-1", "2026-01-02T00:00:00Z"),
                other_project,
            ])
            .await?;

        let filter = EventFilter { project: Some("/repo".to_string()), ..EventFilter::default() };
        let ids: Vec<String> = store.read(&filter).await?.into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["evt-3", "evt-2", "evt-1"]);

        let filter = EventFilter {
            project: Some("/repo".to_string()),
            since: Some("2026-01-02T00:00:00Z".to_string()),
            limit: Some(1),
            offset: Some(1),
            ..EventFilter::default()
        };
        let ids: Vec<String> = store.read(&filter).await?.into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["evt-2"]);
        Ok(())
    }

    #[tokio::test]
    async fn read_builds_sequential_placeholders() -> Result<()> {
        let (client, store) = store();
        let filter = EventFilter {
            platform: Some("claude".to_string()),
            until: Some("2026-02-01T00:00:00Z".to_string()),
            limit: Some(10),
            ..EventFilter::default()
        };
        store.read(&filter).await?;
        let last = client.statements().pop().map(|stmt| stmt.sql).unwrap_or_default();
        assert_eq!(
            last,
            "SELECT * FROM mem_events WHERE platform = $1 AND ts <= $2::timestamptz \
             ORDER BY ts DESC LIMIT $3"
        );
        Ok(())
    }

    #[tokio::test]
    async fn latest_timestamp_is_the_watermark() -> Result<()> {
        let (_client, store) = store();
        assert_eq!(store.get_latest_timestamp("/repo", "claude").await?, None);
        store
            .append(&[
                event("evt-1", "sess-1", "2026-01-01T00:00:00Z"),
                event("evt-2", "sess-1", "2026-01-09T00:00:00Z"),
            ])
            .await?;
        assert_eq!(
            store.get_latest_timestamp("/repo", "claude").await?.as_deref(),
            Some("2026-01-09T00:00:00Z")
        );
        assert_eq!(store.get_latest_timestamp("/repo", "codex").await?, None);
        Ok(())
    }
}
