//! End-to-end ledger tests over SQLite: record, anchor, verify, prove.

use audit_ledger::anchor::{AnchoringWorker, LocalLease, WorkerConfig};
use audit_ledger::audit::verify::ChainFailure;
use audit_ledger::audit::{verify_proof, ProofBundle, VerificationService};
use audit_ledger::database::{Database, LedgerStore};
use audit_ledger::LedgerError;
use std::sync::Arc;

mod common;
use common::*;

fn worker(database: &Database) -> AnchoringWorker {
    AnchoringWorker::new(Arc::new(database.clone()), Arc::new(LocalLease), WorkerConfig::default())
}

fn verifier(database: &Database) -> VerificationService {
    VerificationService::new(Arc::new(database.clone()))
}

#[tokio::test]
async fn test_tampered_metadata_is_detected_at_its_sequence() {
    let database = setup_test_db().await;
    let recorder = test_recorder(&database);
    let events = record_events(&recorder, "org-a", 3).await;
    assert_eq!(
        events.iter().map(|e| e.chain_sequence).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let report = worker(&database).run_cycle().await.unwrap();
    assert_eq!(report.anchors_created, 1);
    let anchor = database.latest_anchor("org-a").await.unwrap().unwrap();
    assert_eq!((anchor.range_start_seq, anchor.range_end_seq), (1, 3));

    let verification = verifier(&database).verify_chain("org-a", 1, 3).await.unwrap();
    assert!(verification.valid, "{}", verification.summary());

    tamper_column(&database, "org-a", 2, "metadata", r#"{"status":"closed","step":1}"#).await;

    let verification = verifier(&database).verify_chain("org-a", 1, 3).await.unwrap();
    assert!(!verification.valid);
    assert_eq!(verification.broken_at_seq, Some(2));
    assert!(matches!(
        verification.failure,
        Some(ChainFailure::RecordHashMismatch { .. })
    ));
}

#[tokio::test]
async fn test_tampered_severity_is_detected() {
    let database = setup_test_db().await;
    let recorder = test_recorder(&database);
    record_events(&recorder, "org-a", 4).await;

    tamper_column(&database, "org-a", 4, "severity", "low").await;

    let verification = verifier(&database).verify_chain("org-a", 1, 4).await.unwrap();
    assert_eq!(verification.broken_at_seq, Some(4));
}

#[tokio::test]
async fn test_unparseable_timestamp_is_detected_at_its_sequence() {
    let database = setup_test_db().await;
    let recorder = test_recorder(&database);
    record_events(&recorder, "org-a", 3).await;

    tamper_column(&database, "org-a", 2, "created_at", "yesterday").await;

    let verification = verifier(&database).verify_chain("org-a", 1, 3).await.unwrap();
    assert!(!verification.valid);
    assert_eq!(verification.broken_at_seq, Some(2));
    assert!(matches!(
        verification.failure,
        Some(ChainFailure::RecordHashMismatch { .. })
    ));
}

#[tokio::test]
async fn test_rewritten_event_identity_is_detected() {
    let database = setup_test_db().await;
    let recorder = test_recorder(&database);
    record_events(&recorder, "org-a", 3).await;

    tamper_column(&database, "org-a", 1, "id", "not-a-uuid").await;
    tamper_column(&database, "org-a", 3, "idempotency_key", "replayed-key").await;

    let verification = verifier(&database).verify_chain("org-a", 1, 3).await.unwrap();
    assert_eq!(verification.broken_at_seq, Some(1));

    let verification = verifier(&database).verify_chain("org-a", 3, 3).await.unwrap();
    assert_eq!(verification.broken_at_seq, Some(3));
}

#[tokio::test]
async fn test_unparseable_anchor_timestamp_does_not_abort_verification() {
    let database = setup_test_db().await;
    let recorder = test_recorder(&database);
    record_events(&recorder, "org-a", 3).await;
    worker(&database).run_cycle().await.unwrap();

    sqlx::query("DROP TRIGGER IF EXISTS root_anchors_no_update")
        .execute(database.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE root_anchors SET anchored_at = 'soon' WHERE organization_id = 'org-a'")
        .execute(database.pool())
        .await
        .unwrap();

    let verification = verifier(&database).verify_chain("org-a", 1, 3).await.unwrap();
    assert!(verification.valid, "{}", verification.summary());
    assert_eq!(verification.anchors_checked, 1);
}

#[tokio::test]
async fn test_proof_export_and_offline_verification() {
    let database = setup_test_db().await;
    let recorder = test_recorder(&database);
    let events = record_events(&recorder, "org-a", 3).await;
    worker(&database).run_cycle().await.unwrap();

    let bundle = verifier(&database).build_proof(events[1].id).await.unwrap();
    let exported = bundle.to_json_pretty().unwrap();

    // The auditor only has the exported JSON.
    let imported = ProofBundle::from_json(&exported).unwrap();
    let verification = verify_proof(&imported).unwrap();
    assert!(verification.valid, "{}", verification.summary());
    assert_eq!(verification.chain_sequence, 2);

    let mut flipped = imported.clone();
    let hash = &mut flipped.inclusion_path[0].hash;
    let last = hash.pop().unwrap();
    hash.push(if last == '0' { '1' } else { '0' });
    assert!(!verify_proof(&flipped).unwrap().valid);
}

#[tokio::test]
async fn test_unanchored_event_has_no_proof() {
    let database = setup_test_db().await;
    let recorder = test_recorder(&database);
    let events = record_events(&recorder, "org-a", 1).await;

    assert!(matches!(
        verifier(&database).build_proof(events[0].id).await,
        Err(LedgerError::EventNotAnchored(_))
    ));
}

#[tokio::test]
async fn test_idempotent_retry_stores_one_event() {
    let database = setup_test_db().await;
    let recorder = test_recorder(&database);

    let first = recorder.record_event(job_event("org-a", "signoff-77", 1)).await.unwrap();
    let retry = recorder.record_event(job_event("org-a", "signoff-77", 1)).await.unwrap();
    assert_eq!(first.id, retry.id);
    assert_eq!(first.record_hash, retry.record_hash);

    let head = database.chain_head("org-a").await.unwrap().unwrap();
    assert_eq!(head.chain_sequence, 1);

    // The same key in another organization is a different event.
    let other = recorder.record_event(job_event("org-b", "signoff-77", 1)).await.unwrap();
    assert_ne!(other.id, first.id);
    assert_eq!(other.chain_sequence, 1);
}

#[tokio::test]
async fn test_concurrent_writers_on_shared_database() {
    let (_dir, _url, database) = setup_file_db().await;
    let recorder = test_recorder(&database);

    let mut handles = Vec::new();
    for org in ["org-a", "org-b"] {
        for i in 0..8 {
            let recorder = recorder.clone();
            handles.push(tokio::spawn(async move {
                recorder
                    .record_event(job_event(org, &format!("{}-{}", org, i), i))
                    .await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for org in ["org-a", "org-b"] {
        let events = database.events_in_range(org, 1, 100).await.unwrap();
        let sequences: Vec<i64> = events.iter().map(|e| e.chain_sequence).collect();
        assert_eq!(sequences, (1..=8).collect::<Vec<_>>());

        let verification = verifier(&database).verify_chain(org, 1, 8).await.unwrap();
        assert!(verification.valid, "{}", verification.summary());
    }
}

#[tokio::test]
async fn test_read_back_event_matches_written_event() {
    let database = setup_test_db().await;
    let recorder = test_recorder(&database);
    let written = record_events(&recorder, "org-a", 2).await;

    let read = database.events_in_range("org-a", 1, 2).await.unwrap();
    assert_eq!(read, written);
    assert!(read.iter().all(|e| e.verify_hash()));
}
