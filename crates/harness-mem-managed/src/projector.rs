use std::collections::BTreeSet;
use std::sync::Arc;

use harness_mem_core::{ObservationDraft, ProjectionResult, SqlValue, StoredEvent};
use harness_mem_storage::{AsyncStorageAdapter, PostgresStorageAdapter, StorageError};

const SESSION_UPSERT_SQL: &str = r"
INSERT INTO mem_sessions (
  session_id, platform, project, workspace_uid, started_at, created_at, updated_at
) VALUES (?, ?, ?, ?, ?::timestamptz, NOW(), NOW())
ON CONFLICT (session_id) DO UPDATE SET updated_at = NOW()
";

const OBSERVATION_UPSERT_SQL: &str = r"
INSERT INTO mem_observations (
  id, event_id, platform, project, workspace_uid, session_id,
  title, content, content_redacted, observation_type,
  tags_json, privacy_tags_json, created_at, updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?::jsonb, ?::jsonb, NOW(), NOW())
ON CONFLICT (id) DO UPDATE SET
  content = EXCLUDED.content,
  content_redacted = EXCLUDED.content_redacted,
  updated_at = NOW()
";

const TAG_INSERT_SQL: &str = r"
INSERT OR IGNORE INTO mem_tags (observation_id, tag, tag_type, created_at)
VALUES (?, ?, 'user', NOW())
";

const TRUNCATE_DERIVED_SQL: &str = "TRUNCATE mem_observations, mem_tags, mem_vectors CASCADE";

const ALL_EVENTS_SQL: &str = "SELECT * FROM mem_events ORDER BY ts ASC";

/// Materializes sessions, observations and tags from the event log.
pub struct ObservationProjector {
    adapter: Arc<PostgresStorageAdapter>,
}

impl ObservationProjector {
    pub const NAME: &'static str = "observation-projector";

    #[must_use]
    pub fn new(adapter: Arc<PostgresStorageAdapter>) -> Self {
        Self { adapter }
    }

    /// Project `events`. A failing event is reported in `errors` and does not
    /// stop the rest of the batch.
    pub async fn project(&self, events: &[StoredEvent]) -> ProjectionResult {
        let mut result = ProjectionResult::default();

        for event in events {
            match self.project_event(event).await {
                Ok(touched) => {
                    result.events_projected += 1;
                    result.projections_updated.extend(touched.into_iter().map(String::from));
                }
                Err(err) => {
                    tracing::debug!(
                        event_id = %event.event_id,
                        error = %err,
                        "projection failed for event"
                    );
                    result.errors.push(format!("Event {}: {err}", event.event_id));
                }
            }
        }

        result
    }

    /// Truncate every derived table and replay the whole log, oldest first.
    /// Recovery only: cost is proportional to the full log.
    ///
    /// # Errors
    /// Returns an error when the truncate or the log scan fails. Per-event
    /// failures are reported in the result instead.
    pub async fn rebuild(&self) -> Result<ProjectionResult, StorageError> {
        self.adapter.exec_async(TRUNCATE_DERIVED_SQL).await?;
        let rows = self.adapter.query_all_async(ALL_EVENTS_SQL, &[]).await?;
        let events = rows
            .iter()
            .map(|row| StoredEvent::from_row(row).map_err(StorageError::from))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(events = events.len(), "rebuilding projections from event log");
        Ok(self.project(&events).await)
    }

    async fn project_event(
        &self,
        event: &StoredEvent,
    ) -> Result<BTreeSet<&'static str>, StorageError> {
        let derived = match event.observation_id.as_deref().filter(|id| !id.is_empty()) {
            Some(_) => Some((ObservationDraft::from_event(event)?, parse_tags(event)?)),
            None => None,
        };

        self.adapter
            .transaction_async(|| async move {
                let mut touched = BTreeSet::new();
                self.adapter
                    .run_async(
                        SESSION_UPSERT_SQL,
                        &[
                            event.session_id.as_str().into(),
                            event.platform.as_str().into(),
                            event.project.as_str().into(),
                            event.workspace_uid.as_str().into(),
                            event.ts.as_str().into(),
                        ],
                    )
                    .await?;
                touched.insert("mem_sessions");

                let (Some(observation_id), Some((observation, tags))) =
                    (event.observation_id.as_deref(), derived.as_ref())
                else {
                    return Ok(touched);
                };

                self.adapter
                    .run_async(
                        OBSERVATION_UPSERT_SQL,
                        &[
                            observation_id.into(),
                            event.event_id.as_str().into(),
                            event.platform.as_str().into(),
                            event.project.as_str().into(),
                            event.workspace_uid.as_str().into(),
                            event.session_id.as_str().into(),
                            observation.title.as_deref().into(),
                            observation.content.as_str().into(),
                            observation.content_redacted.as_str().into(),
                            observation.observation_type.as_str().into(),
                            json_or(&event.tags_json, "[]").into(),
                            json_or(&event.privacy_tags_json, "[]").into(),
                        ],
                    )
                    .await?;
                touched.insert("mem_observations");

                for tag in tags {
                    self.adapter
                        .run_async(TAG_INSERT_SQL, &[observation_id.into(), SqlValue::from(tag)])
                        .await?;
                }
                if !tags.is_empty() {
                    touched.insert("mem_tags");
                }

                Ok(touched)
            })
            .await
    }
}

fn parse_tags(event: &StoredEvent) -> Result<Vec<String>, StorageError> {
    serde_json::from_str(json_or(&event.tags_json, "[]")).map_err(|err| StorageError::Decode {
        column: "tags_json".to_string(),
        message: err.to_string(),
    })
}

fn json_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}
