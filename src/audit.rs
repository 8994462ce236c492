/// Audit trail for privileged iptables operations
///
/// Every reconciliation pass and every single-rule de-apply is recorded as
/// one JSON object per line in `<state dir>/audit.log`. Writing the trail is
/// best effort: failures are logged with `warn!` and never fail the operation.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApplyRules,
    DeapplyRule,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Counters of a finished reconciliation pass, as recorded in the trail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub rule_count: usize,
    pub active_count: usize,
    pub inserted: usize,
    pub removed: usize,
    pub swept: usize,
    pub failures: usize,
}

/// Audit log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Opens the trail at `<state dir>/audit.log`
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Opens a trail at an explicit location
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write audit log {:?}: {}", self.log_path, e);
        }
    }

    /// Records a reconciliation pass.
    pub async fn log_apply(&self, summary: ApplySummary, error: Option<String>) {
        let event = AuditEvent::new(
            EventType::ApplyRules,
            summary.failures == 0,
            serde_json::json!({
                "rule_count": summary.rule_count,
                "active_count": summary.active_count,
                "inserted": summary.inserted,
                "removed": summary.removed,
                "swept": summary.swept,
                "failures": summary.failures,
            }),
            error,
        );
        self.record(event).await;
    }

    /// Records the de-apply of a rule being removed.
    pub async fn log_deapply(&self, rule_id: Uuid, error: Option<String>) {
        let event = AuditEvent::new(
            EventType::DeapplyRule,
            error.is_none(),
            serde_json::json!({ "rule_id": rule_id }),
            error,
        );
        self.record(event).await;
    }

    /// Reads the most recent events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            EventType::DeapplyRule,
            false,
            serde_json::json!({"rule_id": Uuid::nil()}),
            Some("iptables error (exit 1): boom".to_string()),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("deapply_rule"));
        assert!(json.contains("boom"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","event_type":"apply_rules","success":true,"details":{},"error":null}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();

        assert!(event.success);
        assert_eq!(event.event_type, EventType::ApplyRules);
    }

    #[tokio::test]
    async fn test_log_and_read_recent() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("audit.log"));

        audit
            .log_apply(
                ApplySummary {
                    rule_count: 3,
                    active_count: 2,
                    inserted: 2,
                    ..ApplySummary::default()
                },
                None,
            )
            .await;
        audit
            .log_deapply(Uuid::nil(), Some("denied".to_string()))
            .await;

        let events = audit.read_recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::DeapplyRule);
        assert!(!events[0].success);
        assert_eq!(events[1].details["inserted"], 2);
        assert!(events[1].success);
    }

    #[tokio::test]
    async fn test_unwritable_log_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::at(dir.path().join("missing").join("audit.log"));
        audit.log_deapply(Uuid::nil(), None).await;
        assert!(audit.read_recent(1).await.is_err());
    }
}
