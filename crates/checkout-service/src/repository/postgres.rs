//! PostgreSQL 版结算存储

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use shop_shared::outbox::PgOutboxStore;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use super::CheckoutStore;
use crate::error::{CheckoutError, Result};
use crate::models::{
    CommitResult, IdempotencyRecord, PendingCheckout, check_daily_sequence, format_order_number,
};

pub struct PgCheckoutStore {
    pool: PgPool,
}

impl PgCheckoutStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 行级 upsert 分配当日序列，同一天的并发结算在该行上排队
    async fn next_order_sequence(tx: &mut PgConnection, date: NaiveDate) -> Result<i32> {
        let sequence = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO order_number_sequences (order_date, last_value)
            VALUES ($1, 1)
            ON CONFLICT (order_date)
            DO UPDATE SET last_value = order_number_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(date)
        .fetch_one(tx)
        .await?;

        Ok(sequence)
    }

    async fn reserve_stock(tx: &mut PgConnection, product_id: Uuid, quantity: i32) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE products
            SET stock_quantity = stock_quantity - $2, updated_at = NOW()
            WHERE id = $1 AND stock_quantity >= $2
            "#,
        )
        .bind(product_id)
        .bind(quantity)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let available = sqlx::query_scalar::<_, i32>(
                "SELECT stock_quantity FROM products WHERE id = $1",
            )
            .bind(product_id)
            .fetch_optional(&mut *tx)
            .await?
            .unwrap_or(0);

            return Err(CheckoutError::InsufficientStock {
                product_id,
                requested: quantity,
                available,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl CheckoutStore for PgCheckoutStore {
    async fn find_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT idempotency_key, request_fingerprint, response_status, response_body,
                   created_at, expires_at
            FROM checkout_idempotency
            WHERE idempotency_key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn commit_checkout(&self, checkout: &PendingCheckout) -> Result<CommitResult> {
        let now = Utc::now();
        let today = now.date_naive();
        let mut tx = self.pool.begin().await?;

        // 过期记录不再占用 key
        sqlx::query(
            "DELETE FROM checkout_idempotency WHERE idempotency_key = $1 AND expires_at <= NOW()",
        )
        .bind(&checkout.idempotency_key)
        .execute(&mut *tx)
        .await?;

        // 先占用幂等键：并发的同键请求在唯一索引上等待，本事务提交后落空
        let claimed = sqlx::query(
            r#"
            INSERT INTO checkout_idempotency
                (idempotency_key, request_fingerprint, response_status, response_body,
                 created_at, expires_at)
            VALUES ($1, $2, 0, '', $3, $4)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(&checkout.idempotency_key)
        .bind(&checkout.fingerprint)
        .bind(now)
        .bind(now + checkout.idempotency_ttl)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(
                idempotency_key = %checkout.idempotency_key,
                "幂等键已被并发请求占用，事务已回滚"
            );
            return Ok(CommitResult::KeyTaken);
        }

        let sequence = Self::next_order_sequence(&mut tx, today).await?;
        check_daily_sequence(today, sequence)?;
        let order_number = format_order_number(today, sequence);

        for (product_id, quantity) in checkout.reservations() {
            Self::reserve_stock(&mut tx, product_id, quantity).await?;
        }

        let finalized = checkout.finalize(&order_number, now)?;
        PgOutboxStore::insert_in_tx(&mut tx, &finalized.outbox).await?;

        sqlx::query(
            r#"
            UPDATE checkout_idempotency
            SET response_status = $2, response_body = $3
            WHERE idempotency_key = $1
            "#,
        )
        .bind(&finalized.record.idempotency_key)
        .bind(finalized.record.response_status)
        .bind(&finalized.record.response_body)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            order_id = %checkout.order_id,
            order_number = %order_number,
            event_id = %finalized.outbox.id,
            "结算事务已提交"
        );

        Ok(CommitResult::Committed(finalized.outcome))
    }

    async fn delete_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM checkout_idempotency WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(deleted.rows_affected())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
