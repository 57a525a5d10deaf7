//! 结算领域模型
//!
//! 包含结算请求/响应、订单草稿行、幂等记录，以及提交前的 `PendingCheckout`。

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shop_shared::events::{CustomerInfo, OrderCreatedEvent, OrderItemSnapshot, line_total};
use shop_shared::outbox::NewOutboxEvent;
use uuid::Uuid;
use validator::Validate;

use crate::error::{CheckoutError, Result};

/// 单日订单号序列上限（NNN 三位）
pub const MAX_DAILY_ORDERS: i32 = 999;

/// 幂等键最大长度，与表字段一致
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

// ==================== 请求 / 响应 ====================

/// 结算请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub cart_id: Uuid,
    #[validate(nested)]
    pub customer: CustomerInfo,
}

impl CheckoutRequest {
    /// 请求指纹：规范化 JSON 的 SHA-256 十六进制
    ///
    /// 结构体字段顺序固定，序列化结果对同一请求稳定。
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// 结算响应，同时作为幂等缓存的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub order_number: String,
    pub order_id: Uuid,
    pub status: String,
    pub message: String,
}

/// 一次结算调用的结果
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutOutcome {
    pub status_code: u16,
    pub response: CheckoutResponse,
    /// 是否为幂等重放（命中缓存，未产生副作用）
    pub replayed: bool,
}

// ==================== 订单草稿 ====================

/// 库存/目录协作方返回的已定价商品行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DraftItem {
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl DraftItem {
    /// 溢出时返回 `Decimal::MAX`，由事件校验拒绝
    pub fn subtotal(&self) -> Decimal {
        line_total(self.unit_price, self.quantity).unwrap_or(Decimal::MAX)
    }

    pub fn to_snapshot(&self) -> OrderItemSnapshot {
        OrderItemSnapshot {
            product_id: self.product_id,
            sku: self.sku.clone(),
            name: self.name.clone(),
            quantity: self.quantity,
            price_snapshot: self.unit_price,
            subtotal: self.subtotal(),
        }
    }
}

// ==================== 幂等记录 ====================

/// 幂等记录：key → 指纹 → 缓存的响应
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub request_fingerprint: String,
    pub response_status: i32,
    pub response_body: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// 还原缓存的结算结果
    pub fn replay(&self) -> Result<CheckoutOutcome> {
        let response: CheckoutResponse = serde_json::from_str(&self.response_body)?;
        Ok(CheckoutOutcome {
            status_code: u16::try_from(self.response_status).unwrap_or(201),
            response,
            replayed: true,
        })
    }
}

// ==================== 订单号 ====================

/// `ORD-YYYYMMDD-NNN`
pub fn format_order_number(date: NaiveDate, sequence: i32) -> String {
    format!("ORD-{}-{:03}", date.format("%Y%m%d"), sequence)
}

/// 校验当日序列是否超限
pub fn check_daily_sequence(date: NaiveDate, sequence: i32) -> Result<()> {
    if sequence > MAX_DAILY_ORDERS {
        return Err(CheckoutError::OrderNumberExhausted {
            date: date.format("%Y-%m-%d").to_string(),
        });
    }
    Ok(())
}

// ==================== 待提交的结算 ====================

/// 已通过校验、尚未落库的结算
///
/// 订单号在存储层事务内分配，分配后调用 `finalize` 生成 Outbox 事件、
/// 响应和幂等记录，两种存储实现共用这段逻辑。
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCheckout {
    pub idempotency_key: String,
    pub fingerprint: String,
    pub order_id: Uuid,
    pub correlation_id: String,
    pub cart_id: Uuid,
    pub customer: CustomerInfo,
    pub items: Vec<DraftItem>,
    pub idempotency_ttl: chrono::Duration,
}

/// `PendingCheckout` 分配订单号后的落库内容
#[derive(Debug, Clone)]
pub struct FinalizedCheckout {
    pub event: OrderCreatedEvent,
    pub outbox: NewOutboxEvent,
    pub outcome: CheckoutOutcome,
    pub record: IdempotencyRecord,
}

impl PendingCheckout {
    /// 按商品汇总的预占数量
    pub fn reservations(&self) -> Vec<(Uuid, i32)> {
        let mut totals: Vec<(Uuid, i32)> = Vec::new();
        for item in &self.items {
            match totals.iter_mut().find(|(id, _)| *id == item.product_id) {
                Some((_, qty)) => *qty += item.quantity,
                None => totals.push((item.product_id, item.quantity)),
            }
        }
        // 固定加锁顺序，避免并发结算互相死锁
        totals.sort_by_key(|(id, _)| *id);
        totals
    }

    pub fn finalize(&self, order_number: &str, now: DateTime<Utc>) -> Result<FinalizedCheckout> {
        let event = OrderCreatedEvent::new(
            self.correlation_id.clone(),
            self.order_id,
            order_number,
            self.customer.clone(),
            self.items.iter().map(DraftItem::to_snapshot).collect(),
            self.cart_id,
        );
        event.validate_payload()?;
        let outbox = NewOutboxEvent::from_event(&event)?;

        let response = CheckoutResponse {
            order_number: order_number.to_string(),
            order_id: self.order_id,
            status: "PENDING".to_string(),
            message: format!(
                "订单已提交，确认邮件将发送至 {}",
                self.customer.email
            ),
        };
        let outcome = CheckoutOutcome {
            status_code: 201,
            response,
            replayed: false,
        };

        let record = IdempotencyRecord {
            idempotency_key: self.idempotency_key.clone(),
            request_fingerprint: self.fingerprint.clone(),
            response_status: i32::from(outcome.status_code),
            response_body: serde_json::to_string(&outcome.response)?,
            created_at: now,
            expires_at: now + self.idempotency_ttl,
        };

        Ok(FinalizedCheckout {
            event,
            outbox,
            outcome,
            record,
        })
    }
}

/// 存储层提交结果
#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    Committed(CheckoutOutcome),
    /// 幂等键已被并发请求抢先写入，本次事务已回滚
    KeyTaken,
}
