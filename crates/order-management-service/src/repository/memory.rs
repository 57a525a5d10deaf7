//! 内存版订单仓储，用于测试和本地运行
//!
//! 与结算服务的内存存储一样，先在锁内完成全部校验再统一写入。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shop_shared::error::ShopError;
use shop_shared::events::EventType;
use shop_shared::outbox::{MemoryOutboxStore, NewOutboxEvent};
use uuid::Uuid;

use super::OrderRepository;
use crate::error::{OrderError, Result};
use crate::models::{
    CreateOrderResult, FinalizeResult, Order, PaymentOutcome, PaymentStatus, PaymentTransaction,
    ProcessedEvent,
};
use crate::state_machine::{self, OrderStatus};

#[derive(Debug, Default)]
struct OrderState {
    orders: HashMap<Uuid, Order>,
    order_numbers: HashMap<String, Uuid>,
    /// 以 order_id 为键
    payments: HashMap<Uuid, PaymentTransaction>,
    processed: HashMap<Uuid, ProcessedEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryOrderRepository {
    state: Arc<Mutex<OrderState>>,
    outbox: MemoryOutboxStore,
}

impl MemoryOrderRepository {
    /// `outbox` 与订单侧投递器共享同一个实例
    pub fn new(outbox: MemoryOutboxStore) -> Self {
        Self {
            state: Arc::default(),
            outbox,
        }
    }

    pub fn outbox(&self) -> &MemoryOutboxStore {
        &self.outbox
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().orders.len()
    }

    pub fn payment_count(&self) -> usize {
        self.state.lock().payments.len()
    }

    pub fn processed_count(&self) -> usize {
        self.state.lock().processed.len()
    }

    /// 测试辅助：把订单最后更新时间往前拨，模拟停在 PROCESSING 的订单
    pub fn backdate_order(&self, order_id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(order) = self.state.lock().orders.get_mut(&order_id) {
            order.updated_at = updated_at;
        }
    }

    /// 测试辅助：把支付交易的创建时间往前拨，模拟卡住的支付
    pub fn backdate_payment(&self, order_id: Uuid, created_at: DateTime<Utc>) {
        if let Some(payment) = self.state.lock().payments.get_mut(&order_id) {
            payment.created_at = created_at;
        }
    }
}

#[async_trait]
impl OrderRepository for MemoryOrderRepository {
    async fn is_processed(&self, event_id: Uuid) -> Result<bool> {
        Ok(self.state.lock().processed.contains_key(&event_id))
    }

    async fn create_order_from_event(
        &self,
        order: &Order,
        payment: &PaymentTransaction,
        processed: &ProcessedEvent,
    ) -> Result<CreateOrderResult> {
        let mut state = self.state.lock();

        if state.processed.contains_key(&processed.event_id) {
            return Ok(CreateOrderResult::Duplicate);
        }
        if state.orders.contains_key(&order.id)
            || state.order_numbers.contains_key(&order.order_number)
        {
            return Err(ShopError::Internal(format!(
                "订单已存在但事件未登记: order_number={}",
                order.order_number
            ))
            .into());
        }

        state
            .processed
            .insert(processed.event_id, processed.clone());
        state
            .order_numbers
            .insert(order.order_number.clone(), order.id);
        state.orders.insert(order.id, order.clone());
        state.payments.insert(order.id, payment.clone());

        Ok(CreateOrderResult::Created)
    }

    async fn find_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        Ok(self.state.lock().orders.get(&order_id).cloned())
    }

    async fn find_order_by_number(&self, order_number: &str) -> Result<Option<Order>> {
        let state = self.state.lock();
        Ok(state
            .order_numbers
            .get(order_number)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn find_payment(&self, order_id: Uuid) -> Result<Option<PaymentTransaction>> {
        Ok(self.state.lock().payments.get(&order_id).cloned())
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match state.orders.get_mut(&order_id) {
            Some(order) if order.status == expected => {
                order.status = next;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_payment(&self, outcome: &PaymentOutcome) -> Result<FinalizeResult> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut outbox = self.outbox.lock();

        if state.processed.contains_key(&outcome.event_id) {
            return Ok(FinalizeResult::Duplicate);
        }

        let payment = state
            .payments
            .get(&outcome.order_id)
            .cloned()
            .ok_or(OrderError::PaymentNotFound(outcome.order_id))?;
        let processed = ProcessedEvent::new(outcome.event_id, EventType::PaymentCompleted, now);

        if payment.status != PaymentStatus::Pending {
            state.processed.insert(outcome.event_id, processed);
            return Ok(FinalizeResult::AlreadySettled {
                status: payment.status,
            });
        }

        let order = state
            .orders
            .get(&outcome.order_id)
            .cloned()
            .ok_or_else(|| OrderError::OrderNotFound(outcome.order_id.to_string()))?;
        let next =
            state_machine::order_status_after_payment(order.id, order.status, outcome.is_success());

        let mut settled = payment;
        settled.settle(outcome, now);
        let mut updated = order;
        if next != updated.status {
            updated.status = next;
            updated.updated_at = now;
        }

        let new_event = if outcome.publish {
            let event = outcome.completion_event(&updated, &settled, now);
            Some(NewOutboxEvent::from_event(&event)?)
        } else {
            None
        };

        // 校验全部通过，开始写入
        state.processed.insert(outcome.event_id, processed);
        state.payments.insert(outcome.order_id, settled.clone());
        state.orders.insert(outcome.order_id, updated);
        if let Some(new_event) = new_event {
            outbox.insert(new_event, now);
        }

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
        let state = self.state.lock();
        let mut stalled: Vec<&PaymentTransaction> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Pending && p.created_at <= created_before)
            .filter(|p| {
                state
                    .orders
                    .get(&p.order_id)
                    .is_some_and(|o| o.status == OrderStatus::Pending)
            })
            .collect();
        stalled.sort_by_key(|p| p.created_at);

        Ok(stalled
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|p| p.order_id)
            .collect())
    }

    async fn find_unsettled_payments(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let state = self.state.lock();
        let mut unsettled: Vec<&Order> = state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Processing && o.updated_at <= updated_before)
            .filter(|o| {
                state
                    .payments
                    .get(&o.id)
                    .is_some_and(|p| p.status == PaymentStatus::Pending)
            })
            .collect();
        unsettled.sort_by_key(|o| o.updated_at);

        Ok(unsettled
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|o| o.id)
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shop_shared::events::PaymentResultStatus;
    use shop_shared::outbox::OutboxStatus;
    use shop_shared::test_utils::TestDataGenerator;

    async fn seeded(repo: &MemoryOrderRepository, sequence: u32) -> Order {
        let mut event = TestDataGenerator::order_created_event();
        event.order_number = format!("ORD-20250101-{sequence:03}");
        let now = Utc::now();
        let order = Order::from_event(&event, now);
        let payment = PaymentTransaction::pending_for(&order, now);
        let processed = ProcessedEvent::new(event.event_id, EventType::OrderCreated, now);

        let result = repo
            .create_order_from_event(&order, &payment, &processed)
            .await
            .unwrap();
        assert_eq!(result, CreateOrderResult::Created);
        order
    }

    #[tokio::test]
    async fn test_duplicate_event_writes_nothing() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let event = TestDataGenerator::order_created_event();
        let now = Utc::now();
        let order = Order::from_event(&event, now);
        let payment = PaymentTransaction::pending_for(&order, now);
        let processed = ProcessedEvent::new(event.event_id, EventType::OrderCreated, now);

        repo.create_order_from_event(&order, &payment, &processed)
            .await
            .unwrap();
        let again = repo
            .create_order_from_event(&order, &payment, &processed)
            .await
            .unwrap();

        assert_eq!(again, CreateOrderResult::Duplicate);
        assert_eq!(repo.order_count(), 1);
        assert_eq!(repo.payment_count(), 1);
        assert!(repo.is_processed(event.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_finalize_settles_payment_and_emits_event() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let order = seeded(&repo, 1).await;
        repo.update_order_status(order.id, OrderStatus::Pending, OrderStatus::Processing)
            .await
            .unwrap();

        let outcome = PaymentOutcome::succeeded(order.id, "mock_tx_1".to_string(), 2);
        let result = repo.finalize_payment(&outcome).await.unwrap();

        let FinalizeResult::Applied { status, transaction } = result else {
            panic!("expected applied");
        };
        assert_eq!(status, OrderStatus::Paid);
        assert_eq!(transaction.status, PaymentStatus::Success);
        assert_eq!(transaction.attempt_count, 2);

        let rows = repo.outbox().snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, outcome.event_id);
        assert_eq!(rows[0].topic, "payments.completed");
        assert_eq!(rows[0].status, OutboxStatus::Pending);

        // 同一个完成事件再次到达
        assert_eq!(
            repo.finalize_payment(&outcome).await.unwrap(),
            FinalizeResult::Duplicate
        );
    }

    #[tokio::test]
    async fn test_second_outcome_for_settled_payment_is_ignored() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let order = seeded(&repo, 1).await;
        repo.update_order_status(order.id, OrderStatus::Pending, OrderStatus::Processing)
            .await
            .unwrap();

        repo.finalize_payment(&PaymentOutcome::failed(order.id, "declined", 1))
            .await
            .unwrap();
        let late = PaymentOutcome::succeeded(order.id, "mock_tx_2".to_string(), 1);
        let result = repo.finalize_payment(&late).await.unwrap();

        assert_eq!(
            result,
            FinalizeResult::AlreadySettled {
                status: PaymentStatus::Failed
            }
        );
        let order = repo.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(repo.outbox().snapshot().len(), 1);
        assert!(repo.is_processed(late.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_finalize_on_cancelled_order_settles_transaction_only() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let order = seeded(&repo, 1).await;
        repo.update_order_status(order.id, OrderStatus::Pending, OrderStatus::Cancelled)
            .await
            .unwrap();

        let outcome = PaymentOutcome::succeeded(order.id, "mock_tx_1".to_string(), 1);
        let result = repo.finalize_payment(&outcome).await.unwrap();

        let FinalizeResult::Applied { status, transaction } = result else {
            panic!("expected applied");
        };
        assert_eq!(status, OrderStatus::Cancelled);
        assert_eq!(transaction.status, PaymentStatus::Success);
        assert_eq!(
            repo.find_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Cancelled
        );
        assert!(repo.is_processed(outcome.event_id).await.unwrap());
        assert_eq!(repo.outbox().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_outcome_does_not_republish() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let order = seeded(&repo, 1).await;

        let mut event = TestDataGenerator::payment_completed_event(PaymentResultStatus::Success);
        event.order_id = order.id;
        let result = repo
            .finalize_payment(&PaymentOutcome::from_event(&event))
            .await
            .unwrap();

        assert!(matches!(
            result,
            FinalizeResult::Applied {
                status: OrderStatus::Paid,
                ..
            }
        ));
        assert!(repo.outbox().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_find_unsettled_payments_selects_old_processing_orders() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let stranded = seeded(&repo, 1).await;
        let recent = seeded(&repo, 2).await;
        let pending = seeded(&repo, 3).await;
        for order in [&stranded, &recent] {
            repo.update_order_status(order.id, OrderStatus::Pending, OrderStatus::Processing)
                .await
                .unwrap();
        }
        let old = Utc::now() - chrono::Duration::minutes(10);
        repo.backdate_order(stranded.id, old);
        repo.backdate_order(pending.id, old);

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let found = repo.find_unsettled_payments(cutoff, 10).await.unwrap();
        assert_eq!(found, vec![stranded.id]);

        repo.finalize_payment(&PaymentOutcome::failed(stranded.id, "timeout", 0))
            .await
            .unwrap();
        assert!(repo.find_unsettled_payments(cutoff, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_stalled_payments_respects_age_and_status() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let stale = seeded(&repo, 1).await;
        let fresh = seeded(&repo, 2).await;
        let processing = seeded(&repo, 3).await;

        let old = Utc::now() - chrono::Duration::minutes(10);
        repo.backdate_payment(stale.id, old);
        repo.backdate_payment(processing.id, old);
        repo.update_order_status(processing.id, OrderStatus::Pending, OrderStatus::Processing)
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(2);
        let stalled = repo.find_stalled_payments(cutoff, 10).await.unwrap();
        assert_eq!(stalled, vec![stale.id]);
        assert!(!stalled.contains(&fresh.id));
    }
}
