//! 事件模型
//!
//! 定义订单流水线中跨服务传递的两类事件：`OrderCreated`（结算服务发出，
//! 订单服务消费）和 `PaymentCompleted`（订单服务发出并自消费）。
//! 两类事件共享同一套信封字段：eventId / eventType / eventVersion /
//! timestamp / correlationId，JSON 字段统一使用 camelCase，金额以字符串表示。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::{Result, ShopError};
use crate::kafka::topics;

/// 当前事件 schema 版本
pub const EVENT_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// EventType — 事件类型枚举
// ---------------------------------------------------------------------------

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    OrderCreated,
    PaymentCompleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderCreated => "ORDER_CREATED",
            Self::PaymentCompleted => "PAYMENT_COMPLETED",
        }
    }

    /// 事件发布到的 topic
    pub fn topic(&self) -> &'static str {
        match self {
            Self::OrderCreated => topics::ORDERS_CREATED,
            Self::PaymentCompleted => topics::PAYMENTS_COMPLETED,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = ShopError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ORDER_CREATED" => Ok(Self::OrderCreated),
            "PAYMENT_COMPLETED" => Ok(Self::PaymentCompleted),
            other => Err(ShopError::Validation(format!("未知的事件类型: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// DomainEvent — 可写入 Outbox 的事件
// ---------------------------------------------------------------------------

/// 可以写入 Outbox 的领域事件
pub trait DomainEvent: Serialize {
    fn event_id(&self) -> Uuid;
    fn event_type(&self) -> EventType;
    /// 聚合 ID，同时作为消息 key 保证同一聚合的事件有序
    fn aggregate_id(&self) -> String;
}

// ---------------------------------------------------------------------------
// OrderCreated
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 255, message = "街道地址不能为空"))]
    pub street: String,
    #[validate(length(min = 1, max = 100, message = "城市不能为空"))]
    pub city: String,
    #[validate(length(min = 1, max = 100, message = "州/省不能为空"))]
    pub state: String,
    #[validate(length(min = 1, max = 20, message = "邮编不能为空"))]
    pub postal_code: String,
    #[validate(length(min = 1, max = 100, message = "国家不能为空"))]
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    #[validate(length(min = 1, max = 200, message = "客户姓名不能为空"))]
    pub name: String,
    #[validate(email(message = "邮箱格式不正确"))]
    pub email: String,
    #[validate(length(max = 50, message = "电话号码过长"))]
    pub phone: String,
    #[validate(nested)]
    pub shipping_address: ShippingAddress,
}

/// 下单时的商品快照，价格在结算时锁定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemSnapshot {
    pub product_id: Uuid,
    #[serde(alias = "productSku")]
    #[validate(length(min = 1, message = "SKU 不能为空"))]
    pub sku: String,
    #[serde(alias = "productName")]
    #[validate(length(min = 1, message = "商品名称不能为空"))]
    pub name: String,
    #[validate(range(min = 1, message = "数量至少为 1"))]
    pub quantity: i32,
    pub price_snapshot: Decimal,
    pub subtotal: Decimal,
}

/// 订单创建事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub event_version: String,
    pub timestamp: DateTime<Utc>,
    #[validate(length(min = 1, message = "correlationId 不能为空"))]
    pub correlation_id: String,
    pub order_id: Uuid,
    #[validate(length(min = 1, message = "订单号不能为空"))]
    pub order_number: String,
    #[validate(nested)]
    pub customer: CustomerInfo,
    #[validate(length(min = 1, message = "订单至少包含一个商品"), nested)]
    pub items: Vec<OrderItemSnapshot>,
    pub subtotal: Decimal,
    pub cart_id: Uuid,
}

/// 单价 × 数量，溢出时返回 `None`
pub fn line_total(price: Decimal, quantity: i32) -> Option<Decimal> {
    price.checked_mul(Decimal::from(quantity))
}

/// 金额求和，溢出时返回 `None`
pub fn checked_sum(amounts: impl IntoIterator<Item = Decimal>) -> Option<Decimal> {
    amounts
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, amount| acc.checked_add(amount))
}

impl OrderCreatedEvent {
    /// 构建新事件，event_id 使用时间有序的 UUID v7
    pub fn new(
        correlation_id: impl Into<String>,
        order_id: Uuid,
        order_number: impl Into<String>,
        customer: CustomerInfo,
        items: Vec<OrderItemSnapshot>,
        cart_id: Uuid,
    ) -> Self {
        // 溢出时留给 validate_payload 拒绝
        let subtotal = checked_sum(items.iter().map(|i| i.subtotal)).unwrap_or(Decimal::MAX);
        Self {
            event_id: Uuid::now_v7(),
            event_type: EventType::OrderCreated,
            event_version: EVENT_VERSION.to_string(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
            order_id,
            order_number: order_number.into(),
            customer,
            items,
            subtotal,
            cart_id,
        }
    }

    /// 完整校验：字段约束 + 事件类型 + 金额一致性
    pub fn validate_payload(&self) -> Result<()> {
        self.validate()?;

        if self.event_type != EventType::OrderCreated {
            return Err(ShopError::Validation(format!(
                "事件类型不匹配: 期望 ORDER_CREATED，实际 {}",
                self.event_type
            )));
        }

        for item in &self.items {
            if item.price_snapshot <= Decimal::ZERO {
                return Err(ShopError::Validation(format!(
                    "商品 {} 的价格必须大于 0",
                    item.sku
                )));
            }
            let line = line_total(item.price_snapshot, item.quantity).ok_or_else(|| {
                ShopError::Validation(format!("商品 {} 的金额溢出", item.sku))
            })?;
            if line != item.subtotal {
                return Err(ShopError::Validation(format!(
                    "商品 {} 小计与单价×数量不一致",
                    item.sku
                )));
            }
        }

        let expected = checked_sum(self.items.iter().map(|i| i.subtotal))
            .ok_or_else(|| ShopError::Validation("订单小计溢出".to_string()))?;
        if expected != self.subtotal {
            return Err(ShopError::Validation(format!(
                "订单小计不一致: 期望 {expected}，实际 {}",
                self.subtotal
            )));
        }

        Ok(())
    }
}

impl DomainEvent for OrderCreatedEvent {
    fn event_id(&self) -> Uuid {
        self.event_id
    }

    fn event_type(&self) -> EventType {
        EventType::OrderCreated
    }

    fn aggregate_id(&self) -> String {
        self.order_id.to_string()
    }
}

// ---------------------------------------------------------------------------
// PaymentCompleted
// ---------------------------------------------------------------------------

/// 支付结果状态（事件中只会出现终态）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentResultStatus {
    Success,
    Failed,
}

/// 支付完成事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompletedEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub event_version: String,
    pub timestamp: DateTime<Utc>,
    #[validate(length(min = 1, message = "correlationId 不能为空"))]
    pub correlation_id: String,
    pub order_id: Uuid,
    #[validate(length(min = 1, message = "订单号不能为空"))]
    pub order_number: String,
    pub payment_transaction_id: Uuid,
    pub status: PaymentResultStatus,
    pub amount: Decimal,
    #[validate(length(min = 1, message = "支付方式不能为空"))]
    pub payment_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl PaymentCompletedEvent {
    /// 完整校验：字段约束 + 事件类型 + 终态字段完整性
    pub fn validate_payload(&self) -> Result<()> {
        self.validate()?;

        if self.event_type != EventType::PaymentCompleted {
            return Err(ShopError::Validation(format!(
                "事件类型不匹配: 期望 PAYMENT_COMPLETED，实际 {}",
                self.event_type
            )));
        }

        match self.status {
            PaymentResultStatus::Success if self.external_transaction_id.is_none() => Err(
                ShopError::Validation("支付成功事件缺少 externalTransactionId".to_string()),
            ),
            PaymentResultStatus::Failed if self.failure_reason.is_none() => Err(
                ShopError::Validation("支付失败事件缺少 failureReason".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl DomainEvent for PaymentCompletedEvent {
    fn event_id(&self) -> Uuid {
        self.event_id
    }

    fn event_type(&self) -> EventType {
        EventType::PaymentCompleted
    }

    fn aggregate_id(&self) -> String {
        self.order_id.to_string()
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
