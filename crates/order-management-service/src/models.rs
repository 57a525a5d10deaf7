//! 订单聚合、支付交易与已处理事件

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shop_shared::events::{
    EVENT_VERSION, EventType, OrderCreatedEvent, PaymentCompletedEvent, PaymentResultStatus,
};
use uuid::Uuid;

use crate::state_machine::OrderStatus;

/// 模拟网关对应的支付方式
pub const PAYMENT_METHOD_MOCK: &str = "MOCK";
pub const DEFAULT_CURRENCY: &str = "USD";

/// 支付交易状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

/// 订单聚合根，`items` 单独存表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub shipping_street: String,
    pub shipping_city: String,
    pub shipping_state: String,
    pub shipping_postal_code: String,
    pub shipping_country: String,
    pub subtotal: Decimal,
    pub cart_id: Uuid,
    /// 从 OrderCreated 事件继承，随 PaymentCompleted 事件继续传递
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    pub price_snapshot: Decimal,
    pub subtotal: Decimal,
}

impl Order {
    /// 由已校验的 OrderCreated 事件构建，订单 ID 沿用结算服务分配的 orderId
    pub fn from_event(event: &OrderCreatedEvent, now: DateTime<Utc>) -> Self {
        let address = &event.customer.shipping_address;
        let items = event
            .items
            .iter()
            .map(|item| OrderItem {
                id: Uuid::now_v7(),
                order_id: event.order_id,
                product_id: item.product_id,
                sku: item.sku.clone(),
                name: item.name.clone(),
                quantity: item.quantity,
                price_snapshot: item.price_snapshot,
                subtotal: item.subtotal,
            })
            .collect();

        Self {
            id: event.order_id,
            order_number: event.order_number.clone(),
            status: OrderStatus::Pending,
            customer_name: event.customer.name.clone(),
            customer_email: event.customer.email.clone(),
            customer_phone: event.customer.phone.clone(),
            shipping_street: address.street.clone(),
            shipping_city: address.city.clone(),
            shipping_state: address.state.clone(),
            shipping_postal_code: address.postal_code.clone(),
            shipping_country: address.country.clone(),
            subtotal: event.subtotal,
            cart_id: event.cart_id,
            correlation_id: event.correlation_id.clone(),
            created_at: now,
            updated_at: now,
            items,
        }
    }
}

/// 支付交易，每个订单一条，按 order_id 独立寻址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: String,
    pub external_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    /// 实际调用网关的次数，熔断快速失败不计入
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentTransaction {
    pub fn pending_for(order: &Order, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            order_id: order.id,
            amount: order.subtotal,
            currency: DEFAULT_CURRENCY.to_string(),
            status: PaymentStatus::Pending,
            payment_method: PAYMENT_METHOD_MOCK.to_string(),
            external_transaction_id: None,
            failure_reason: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// 写入终态，只应对 PENDING 交易调用
    pub fn settle(&mut self, outcome: &PaymentOutcome, now: DateTime<Utc>) {
        self.status = match outcome.status {
            PaymentResultStatus::Success => PaymentStatus::Success,
            PaymentResultStatus::Failed => PaymentStatus::Failed,
        };
        self.external_transaction_id = outcome.external_transaction_id.clone();
        self.failure_reason = outcome.failure_reason.clone();
        self.attempt_count += outcome.attempts;
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}

/// 已处理事件记录，存在即说明该事件的业务效果已提交
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProcessedEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedEvent {
    pub fn new(event_id: Uuid, event_type: EventType, now: DateTime<Utc>) -> Self {
        Self {
            event_id,
            event_type: event_type.as_str().to_string(),
            processed_at: now,
        }
    }
}

/// 一次支付编排的结果
///
/// `event_id` 在落库前生成，既是 PaymentCompleted 事件的 eventId，
/// 也是完成处理的去重键。
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentOutcome {
    pub event_id: Uuid,
    pub order_id: Uuid,
    pub status: PaymentResultStatus,
    pub external_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    /// 本次编排中实际调用网关的次数
    pub attempts: i32,
    /// 是否写入 payments.completed Outbox 事件；从该 topic 回放的结果为 false
    pub publish: bool,
}

impl PaymentOutcome {
    pub fn succeeded(order_id: Uuid, external_transaction_id: String, attempts: i32) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            order_id,
            status: PaymentResultStatus::Success,
            external_transaction_id: Some(external_transaction_id),
            failure_reason: None,
            attempts,
            publish: true,
        }
    }

    pub fn failed(order_id: Uuid, reason: impl Into<String>, attempts: i32) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            order_id,
            status: PaymentResultStatus::Failed,
            external_transaction_id: None,
            failure_reason: Some(reason.into()),
            attempts,
            publish: true,
        }
    }

    /// 从消费到的 PaymentCompleted 事件还原结果
    pub fn from_event(event: &PaymentCompletedEvent) -> Self {
        Self {
            event_id: event.event_id,
            order_id: event.order_id,
            status: event.status,
            external_transaction_id: event.external_transaction_id.clone(),
            failure_reason: event.failure_reason.clone(),
            attempts: 0,
            publish: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PaymentResultStatus::Success
    }

    /// 构建对外发布的 PaymentCompleted 事件
    pub fn completion_event(
        &self,
        order: &Order,
        transaction: &PaymentTransaction,
        now: DateTime<Utc>,
    ) -> PaymentCompletedEvent {
        PaymentCompletedEvent {
            event_id: self.event_id,
            event_type: EventType::PaymentCompleted,
            event_version: EVENT_VERSION.to_string(),
            timestamp: now,
            correlation_id: order.correlation_id.clone(),
            order_id: order.id,
            order_number: order.order_number.clone(),
            payment_transaction_id: transaction.id,
            status: self.status,
            amount: transaction.amount,
            payment_method: transaction.payment_method.clone(),
            external_transaction_id: self.external_transaction_id.clone(),
            failure_reason: self.failure_reason.clone(),
        }
    }
}

/// 消费 OrderCreated 的落库结果
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOrderResult {
    Created,
    /// 事件已处理过，未产生任何写入
    Duplicate,
}

/// 支付完成处理的落库结果
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeResult {
    Applied {
        status: OrderStatus,
        transaction: PaymentTransaction,
    },
    /// 完成事件已处理过
    Duplicate,
    /// 交易已是终态，只记录了去重标记
    AlreadySettled { status: PaymentStatus },
}
