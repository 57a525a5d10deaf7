//! PostgreSQL 版订单仓储

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shop_shared::events::EventType;
use shop_shared::outbox::{NewOutboxEvent, PgOutboxStore};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use super::OrderRepository;
use crate::error::{OrderError, Result};
use crate::models::{
    CreateOrderResult, FinalizeResult, Order, OrderItem, PaymentOutcome, PaymentStatus,
    PaymentTransaction, ProcessedEvent,
};
use crate::state_machine::{self, OrderStatus};

const ORDER_COLUMNS: &str = "id, order_number, status, customer_name, customer_email, \
     customer_phone, shipping_street, shipping_city, shipping_state, shipping_postal_code, \
     shipping_country, subtotal, cart_id, correlation_id, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, order_id, amount, currency, status, payment_method, \
     external_transaction_id, failure_reason, attempt_count, created_at, updated_at, completed_at";

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 写入去重记录，已存在时返回 false
    ///
    /// 并发的重复投递会阻塞在唯一索引上，直到先到者提交。
    async fn claim_event(tx: &mut PgConnection, processed: &ProcessedEvent) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, event_type, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(processed.event_id)
        .bind(&processed.event_type)
        .bind(processed.processed_at)
        .execute(tx)
        .await?;

        Ok(inserted.rows_affected() > 0)
    }

    async fn load_items(&self, order: &mut Order) -> Result<()> {
        order.items = sqlx::query_as::<_, OrderItem>(
            r#"
            SELECT id, order_id, product_id, sku, name, quantity, price_snapshot, subtotal
            FROM order_items
            WHERE order_id = $1
            ORDER BY sku
            "#,
        )
        .bind(order.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn is_processed(&self, event_id: Uuid) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn create_order_from_event(
        &self,
        order: &Order,
        payment: &PaymentTransaction,
        processed: &ProcessedEvent,
    ) -> Result<CreateOrderResult> {
        let mut tx = self.pool.begin().await?;

        if !Self::claim_event(&mut tx, processed).await? {
            tx.rollback().await?;
            debug!(event_id = %processed.event_id, "事件已处理，跳过建单");
            return Ok(CreateOrderResult::Duplicate);
        }

        sqlx::query(
            r#"
            INSERT INTO orders
                (id, order_number, status, customer_name, customer_email, customer_phone,
                 shipping_street, shipping_city, shipping_state, shipping_postal_code,
                 shipping_country, subtotal, cart_id, correlation_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(order.id)
        .bind(&order.order_number)
        .bind(order.status)
        .bind(&order.customer_name)
        .bind(&order.customer_email)
        .bind(&order.customer_phone)
        .bind(&order.shipping_street)
        .bind(&order.shipping_city)
        .bind(&order.shipping_state)
        .bind(&order.shipping_postal_code)
        .bind(&order.shipping_country)
        .bind(order.subtotal)
        .bind(order.cart_id)
        .bind(&order.correlation_id)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await?;

        for item in &order.items {
            sqlx::query(
                r#"
                INSERT INTO order_items
                    (id, order_id, product_id, sku, name, quantity, price_snapshot, subtotal)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(item.id)
            .bind(item.order_id)
            .bind(item.product_id)
            .bind(&item.sku)
            .bind(&item.name)
            .bind(item.quantity)
            .bind(item.price_snapshot)
            .bind(item.subtotal)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO payment_transactions
                (id, order_id, amount, currency, status, payment_method, attempt_count,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(payment.id)
        .bind(payment.order_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(&payment.payment_method)
        .bind(payment.attempt_count)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            event_id = %processed.event_id,
            payment_transaction_id = %payment.id,
            "订单与支付交易已创建"
        );

        Ok(CreateOrderResult::Created)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        match order {
            Some(mut order) => {
                self.load_items(&mut order).await?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    async fn find_order_by_number(&self, order_number: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_number = $1"
        ))
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await?;

        match order {
            Some(mut order) => {
                self.load_items(&mut order).await?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    async fn find_payment(&self, order_id: Uuid) -> Result<Option<PaymentTransaction>> {
        let payment = sqlx::query_as::<_, PaymentTransaction>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE orders SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(order_id)
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    async fn finalize_payment(&self, outcome: &PaymentOutcome) -> Result<FinalizeResult> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let processed = ProcessedEvent::new(outcome.event_id, EventType::PaymentCompleted, now);
        if !Self::claim_event(&mut tx, &processed).await? {
            tx.rollback().await?;
            return Ok(FinalizeResult::Duplicate);
        }

        let payment = sqlx::query_as::<_, PaymentTransaction>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_transactions WHERE order_id = $1 FOR UPDATE"
        ))
        .bind(outcome.order_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(OrderError::PaymentNotFound(outcome.order_id))?;

        if payment.status != PaymentStatus::Pending {
            tx.commit().await?;
            return Ok(FinalizeResult::AlreadySettled {
                status: payment.status,
            });
        }

        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(outcome.order_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| OrderError::OrderNotFound(outcome.order_id.to_string()))?;

        let next =
            state_machine::order_status_after_payment(order.id, order.status, outcome.is_success());

        let mut settled = payment;
        settled.settle(outcome, now);
        sqlx::query(
            r#"
            UPDATE payment_transactions
            SET status = $2, external_transaction_id = $3, failure_reason = $4,
                attempt_count = $5, updated_at = $6, completed_at = $6
            WHERE id = $1
            "#,
        )
        .bind(settled.id)
        .bind(settled.status)
        .bind(&settled.external_transaction_id)
        .bind(&settled.failure_reason)
        .bind(settled.attempt_count)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if next != order.status {
            sqlx::query("UPDATE orders SET status = $2, updated_at = $3 WHERE id = $1")
                .bind(order.id)
                .bind(next)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        if outcome.publish {
            let mut updated = order;
            updated.status = next;
            let event = outcome.completion_event(&updated, &settled, now);
            PgOutboxStore::insert_in_tx(&mut tx, &NewOutboxEvent::from_event(&event)?).await?;
        }

        tx.commit().await?;

        info!(
            order_id = %outcome.order_id,
            event_id = %outcome.event_id,
            status = %next,
            payment_status = settled.status.as_str(),
            "支付结果已落库"
        );

        Ok(FinalizeResult::Applied {
            status: next,
            transaction: settled,
        })
    }

    async fn find_stalled_payments(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT o.id
            FROM orders o
            JOIN payment_transactions p ON p.order_id = o.id
            WHERE o.status = 'PENDING'
              AND p.status = 'PENDING'
              AND p.created_at <= $1
            ORDER BY p.created_at
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn find_unsettled_payments(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT o.id
            FROM orders o
            JOIN payment_transactions p ON p.order_id = o.id
            WHERE o.status = 'PROCESSING'
              AND p.status = 'PENDING'
              AND o.updated_at <= $1
            ORDER BY o.updated_at
            LIMIT $2
            "#,
        )
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
