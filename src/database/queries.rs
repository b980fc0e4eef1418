use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::anchor::root::{PendingRange, RootAnchor};
use crate::audit::event::{format_timestamp, AuditEvent, ChainHead};
use crate::database::models::{AnchorRow, EventRow};
use crate::database::store::{AppendOutcome, LedgerStore};
use crate::database::{is_busy, is_unique_violation, Database};
use crate::error::{LedgerError, LedgerResult};

const EVENT_COLUMNS: &str = "id, organization_id, chain_sequence, actor_id, event_name, target_type, \
     target_id, category, severity, outcome, metadata, idempotency_key, created_at, previous_hash, record_hash";

const ANCHOR_SELECT: &str = "SELECT a.id, a.organization_id, a.range_start_seq, a.range_end_seq, \
     a.root_hash, a.anchored_at, r.external_reference \
     FROM root_anchors a LEFT JOIN anchor_receipts r ON r.anchor_id = a.id";

fn into_events(rows: Vec<EventRow>) -> Vec<AuditEvent> {
    rows.into_iter().map(AuditEvent::from).collect()
}

fn into_anchors(rows: Vec<AnchorRow>) -> Vec<RootAnchor> {
    rows.into_iter().map(RootAnchor::from).collect()
}

#[async_trait]
impl LedgerStore for Database {
    async fn chain_head(&self, organization_id: &str) -> LedgerResult<Option<ChainHead>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT chain_sequence, record_hash
            FROM audit_events
            WHERE organization_id = ?
            ORDER BY chain_sequence DESC
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|(chain_sequence, record_hash)| ChainHead {
            organization_id: organization_id.to_string(),
            chain_sequence,
            record_hash,
        }))
    }

    async fn find_by_idempotency_key(
        &self,
        organization_id: &str,
        idempotency_key: &str,
    ) -> LedgerResult<Option<AuditEvent>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM audit_events WHERE organization_id = ? AND idempotency_key = ?",
            EVENT_COLUMNS
        ))
        .bind(organization_id)
        .bind(idempotency_key)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(AuditEvent::from))
    }

    async fn append_if_head_matches(&self, event: &AuditEvent) -> LedgerResult<AppendOutcome> {
        let row = EventRow::from(event);
        let expected_head_seq = event.chain_sequence - 1;

        // A single INSERT ... SELECT takes SQLite's write lock before evaluating
        // the head check, so the check and the append cannot interleave.
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO audit_events ({})
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE COALESCE(
                    (SELECT MAX(chain_sequence) FROM audit_events WHERE organization_id = ?), 0) = ?
              AND COALESCE(
                    (SELECT record_hash FROM audit_events
                     WHERE organization_id = ? ORDER BY chain_sequence DESC LIMIT 1), '') = ?
            "#,
            EVENT_COLUMNS
        ))
        .bind(&row.id)
        .bind(&row.organization_id)
        .bind(row.chain_sequence)
        .bind(&row.actor_id)
        .bind(&row.event_name)
        .bind(&row.target_type)
        .bind(&row.target_id)
        .bind(&row.category)
        .bind(&row.severity)
        .bind(&row.outcome)
        .bind(&row.metadata)
        .bind(&row.idempotency_key)
        .bind(&row.created_at)
        .bind(&row.previous_hash)
        .bind(&row.record_hash)
        .bind(&row.organization_id)
        .bind(expected_head_seq)
        .bind(&row.organization_id)
        .bind(&row.previous_hash)
        .execute(self.pool())
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(AppendOutcome::Appended),
            Ok(_) => Ok(AppendOutcome::HeadMoved),
            Err(e) if is_unique_violation(&e) => {
                match self
                    .find_by_idempotency_key(&event.organization_id, &event.idempotency_key)
                    .await?
                {
                    Some(existing) => Ok(AppendOutcome::DuplicateIdempotencyKey(existing)),
                    None => Ok(AppendOutcome::HeadMoved),
                }
            }
            Err(e) if is_busy(&e) => {
                debug!("Append for {} hit a busy database: {}", event.organization_id, e);
                Ok(AppendOutcome::HeadMoved)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_event(&self, event_id: Uuid) -> LedgerResult<Option<AuditEvent>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM audit_events WHERE id = ?",
            EVENT_COLUMNS
        ))
        .bind(event_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(AuditEvent::from))
    }

    async fn events_in_range(
        &self,
        organization_id: &str,
        from_seq: i64,
        to_seq: i64,
    ) -> LedgerResult<Vec<AuditEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM audit_events
            WHERE organization_id = ? AND chain_sequence BETWEEN ? AND ?
            ORDER BY chain_sequence ASC
            "#,
            EVENT_COLUMNS
        ))
        .bind(organization_id)
        .bind(from_seq)
        .bind(to_seq)
        .fetch_all(self.pool())
        .await?;

        Ok(into_events(rows))
    }

    async fn latest_anchor(&self, organization_id: &str) -> LedgerResult<Option<RootAnchor>> {
        let row: Option<AnchorRow> = sqlx::query_as(&format!(
            "{} WHERE a.organization_id = ? ORDER BY a.range_end_seq DESC LIMIT 1",
            ANCHOR_SELECT
        ))
        .bind(organization_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(RootAnchor::from))
    }

    async fn anchors_overlapping(
        &self,
        organization_id: &str,
        from_seq: i64,
        to_seq: i64,
    ) -> LedgerResult<Vec<RootAnchor>> {
        let rows: Vec<AnchorRow> = sqlx::query_as(&format!(
            r#"
            {} WHERE a.organization_id = ? AND a.range_end_seq >= ? AND a.range_start_seq <= ?
            ORDER BY a.range_start_seq ASC
            "#,
            ANCHOR_SELECT
        ))
        .bind(organization_id)
        .bind(from_seq)
        .bind(to_seq)
        .fetch_all(self.pool())
        .await?;

        Ok(into_anchors(rows))
    }

    async fn anchor_covering(
        &self,
        organization_id: &str,
        chain_sequence: i64,
    ) -> LedgerResult<Option<RootAnchor>> {
        Ok(self
            .anchors_overlapping(organization_id, chain_sequence, chain_sequence)
            .await?
            .into_iter()
            .next())
    }

    async fn list_anchors(&self, organization_id: &str) -> LedgerResult<Vec<RootAnchor>> {
        let rows: Vec<AnchorRow> = sqlx::query_as(&format!(
            "{} WHERE a.organization_id = ? ORDER BY a.range_start_seq ASC",
            ANCHOR_SELECT
        ))
        .bind(organization_id)
        .fetch_all(self.pool())
        .await?;

        Ok(into_anchors(rows))
    }

    async fn pending_anchor_ranges(&self) -> LedgerResult<Vec<PendingRange>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT heads.organization_id,
                   COALESCE(anchored.last_end, 0) AS last_end,
                   heads.head_seq
            FROM (
                SELECT organization_id, MAX(chain_sequence) AS head_seq
                FROM audit_events GROUP BY organization_id
            ) AS heads
            LEFT JOIN (
                SELECT organization_id, MAX(range_end_seq) AS last_end
                FROM root_anchors GROUP BY organization_id
            ) AS anchored ON anchored.organization_id = heads.organization_id
            WHERE heads.head_seq > COALESCE(anchored.last_end, 0)
            ORDER BY heads.organization_id
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(organization_id, last_end, head_seq)| PendingRange {
                organization_id,
                range_start_seq: last_end + 1,
                range_end_seq: head_seq,
            })
            .collect())
    }

    async fn insert_anchor(&self, anchor: &RootAnchor) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO root_anchors
                (id, organization_id, range_start_seq, range_end_seq, root_hash, anchored_at)
            SELECT ?, ?, ?, ?, ?, ?
            WHERE COALESCE(
                    (SELECT MAX(range_end_seq) FROM root_anchors WHERE organization_id = ?), 0) + 1 = ?
            "#,
        )
        .bind(anchor.id.to_string())
        .bind(&anchor.organization_id)
        .bind(anchor.range_start_seq)
        .bind(anchor.range_end_seq)
        .bind(&anchor.root_hash)
        .bind(format_timestamp(&anchor.anchored_at))
        .bind(&anchor.organization_id)
        .bind(anchor.range_start_seq)
        .execute(self.pool())
        .await;

        let conflict = || {
            LedgerError::AnchorConflict(format!(
                "range [{}, {}] for {} does not extend the last anchor",
                anchor.range_start_seq, anchor.range_end_seq, anchor.organization_id
            ))
        };

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(()),
            Ok(_) => Err(conflict()),
            Err(e) if is_unique_violation(&e) => Err(conflict()),
            Err(e) => Err(e.into()),
        }
    }

    async fn anchors_without_receipt(&self, limit: i64) -> LedgerResult<Vec<RootAnchor>> {
        let rows: Vec<AnchorRow> = sqlx::query_as(&format!(
            "{} WHERE r.anchor_id IS NULL ORDER BY a.anchored_at ASC, a.range_start_seq ASC LIMIT ?",
            ANCHOR_SELECT
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(into_anchors(rows))
    }

    async fn record_anchor_receipt(&self, anchor_id: Uuid, external_reference: &str) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO anchor_receipts (anchor_id, external_reference, recorded_at)
            VALUES (?, ?, ?)
            ON CONFLICT (anchor_id) DO NOTHING
            "#,
        )
        .bind(anchor_id.to_string())
        .bind(external_reference)
        .bind(format_timestamp(&Utc::now()))
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
