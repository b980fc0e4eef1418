#![allow(dead_code)]

use audit_ledger::audit::{AuditEvent, EventRecorder, RecordEventRequest, RecorderConfig};
use audit_ledger::database::Database;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_JWT_SECRET: &str = "integration-test-secret-0123456789";

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

/// On-disk database that several connections (or restarts) can share
pub async fn setup_file_db() -> (TempDir, String, Database) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let database = open_db(&url).await;
    (dir, url, database)
}

pub async fn open_db(url: &str) -> Database {
    let database = Database::new(url).await.expect("Failed to open test database");
    database.run_migrations().await.expect("Failed to run migrations");
    database
}

pub fn test_recorder(database: &Database) -> EventRecorder {
    EventRecorder::new(
        Arc::new(database.clone()),
        RecorderConfig {
            max_write_attempts: 50,
            retry_backoff: Duration::from_millis(2),
        },
    )
}

/// Request the way a job-tracking collaborator would send it
pub fn job_event(org: &str, key: &str, step: i64) -> RecordEventRequest {
    RecordEventRequest::new(org, "job.updated", "job", key)
        .actor("user-1")
        .target(format!("job-{}", step))
        .metadata(json!({"step": step, "status": "open"}))
}

/// Record `count` events and return them in chain order
pub async fn record_events(recorder: &EventRecorder, org: &str, count: i64) -> Vec<AuditEvent> {
    let mut events = Vec::new();
    for step in 0..count {
        let key = format!("{}-{}", org, uuid::Uuid::new_v4());
        events.push(
            recorder
                .record_event(job_event(org, &key, step))
                .await
                .expect("Failed to record event"),
        );
    }
    events
}

/// Rewrite a stored event column, bypassing the append-only triggers
pub async fn tamper_column(database: &Database, org: &str, seq: i64, column: &str, value: &str) {
    sqlx::query("DROP TRIGGER IF EXISTS audit_events_no_update")
        .execute(database.pool())
        .await
        .expect("Failed to drop trigger");

    sqlx::query(&format!(
        "UPDATE audit_events SET {} = ? WHERE organization_id = ? AND chain_sequence = ?",
        column
    ))
    .bind(value)
    .bind(org)
    .bind(seq)
    .execute(database.pool())
    .await
    .expect("Failed to tamper with event");
}
