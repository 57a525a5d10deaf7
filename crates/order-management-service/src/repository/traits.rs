//! 仓储 Trait 定义

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    CreateOrderResult, FinalizeResult, Order, PaymentOutcome, PaymentTransaction, ProcessedEvent,
};
use crate::state_machine::OrderStatus;

/// 订单存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn is_processed(&self, event_id: Uuid) -> Result<bool>;

    /// 原子写入：已处理事件 + 订单及明细 + PENDING 支付交易
    ///
    /// 事件已处理过时不做任何写入，返回 `Duplicate`。
    async fn create_order_from_event(
        &self,
        order: &Order,
        payment: &PaymentTransaction,
        processed: &ProcessedEvent,
    ) -> Result<CreateOrderResult>;

    /// 含明细
    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>>;

    async fn find_order_by_number(&self, order_number: &str) -> Result<Option<Order>>;

    async fn find_payment(&self, order_id: Uuid) -> Result<Option<PaymentTransaction>>;

    /// 比较并设置订单状态，当前状态不是 `expected` 时返回 false
    ///
    /// 迁移是否合法由调用方先经状态机校验。
    async fn update_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool>;

    /// 原子写入支付结果：去重记录、交易终态、订单状态、payments.completed Outbox 事件
    ///
    /// 交易已为终态时只写入去重记录。订单已不能随支付结果迁移时（如已取消）
    /// 仍结算交易并发出事件，订单保持原状态。
    async fn finalize_payment(&self, outcome: &PaymentOutcome) -> Result<FinalizeResult>;

    /// 订单与支付交易都还是 PENDING，且交易创建早于 `created_before` 的订单 ID
    async fn find_stalled_payments(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>>;

    /// 订单停在 PROCESSING、交易仍为 PENDING，且订单最后更新早于 `updated_before` 的订单 ID
    async fn find_unsettled_payments(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>>;

    async fn health_check(&self) -> Result<()>;
}
