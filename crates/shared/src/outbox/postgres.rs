//! PostgreSQL 版 Outbox 存储

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{NewOutboxEvent, OutboxEvent, OutboxStatus, OutboxStore, truncate_error};
use crate::error::{Result, ShopError};

const OUTBOX_COLUMNS: &str = r#"
    id, aggregate_id, event_type, topic, payload, status, attempt_count, last_error,
    created_at, last_attempt_at, next_attempt_at, claimed_until, published_at
"#;

pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 在调用方的事务中追加事件，与业务变更一起提交
    pub async fn insert_in_tx(tx: &mut PgConnection, event: &NewOutboxEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, aggregate_id, event_type, topic, payload, status, attempt_count,
                 created_at, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, NOW(), NOW())
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.topic)
        .bind(&event.payload)
        .execute(tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_batch(&self, limit: i64, lease: chrono::Duration) -> Result<Vec<OutboxEvent>> {
        // 认领即写租约；SKIP LOCKED 保证并发投递器不会拿到同一行
        let sql = format!(
            r#"
            UPDATE outbox_events o
            SET claimed_until = NOW() + make_interval(secs => $2)
            WHERE o.id IN (
                SELECT c.id
                FROM outbox_events c
                WHERE c.status = 'PENDING'
                  AND c.next_attempt_at <= NOW()
                  AND (c.claimed_until IS NULL OR c.claimed_until < NOW())
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox_events p
                      WHERE p.aggregate_id = c.aggregate_id
                        AND p.status = 'PENDING'
                        AND (p.created_at, p.id) < (c.created_at, c.id)
                  )
                ORDER BY c.created_at ASC, c.id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        );

        let mut events = sqlx::query_as::<_, OutboxEvent>(&sql)
            .bind(limit)
            .bind(lease.num_milliseconds() as f64 / 1000.0)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING 不保证顺序
        events.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(events)
    }

    async fn mark_published(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PUBLISHED', published_at = NOW(), last_attempt_at = NOW(),
                claimed_until = NULL
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<OutboxStatus> {
        let status = sqlx::query_scalar::<_, OutboxStatus>(
            r#"
            UPDATE outbox_events
            SET attempt_count = attempt_count + 1,
                last_error = $2,
                last_attempt_at = NOW(),
                claimed_until = NULL,
                next_attempt_at = CASE WHEN attempt_count + 1 >= $4 THEN next_attempt_at ELSE $3 END,
                status = CASE WHEN attempt_count + 1 >= $4 THEN 'FAILED' ELSE status END
            WHERE id = $1 AND status = 'PENDING'
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(truncate_error(error))
        .bind(next_attempt_at)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        match status {
            Some(status) => Ok(status),
            None => sqlx::query_scalar::<_, OutboxStatus>(
                "SELECT status FROM outbox_events WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ShopError::NotFound {
                entity: "OutboxEvent".to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn count_pending(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM outbox_events WHERE status = 'PENDING'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
