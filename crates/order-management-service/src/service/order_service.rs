//! 订单查询与显式状态变更（取消、履约）

use std::sync::Arc;

use shop_shared::error::ShopError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{OrderError, Result};
use crate::models::{Order, PaymentTransaction};
use crate::repository::OrderRepository;
use crate::state_machine::{self, OrderStatus};

pub struct OrderService {
    repository: Arc<dyn OrderRepository>,
}

impl OrderService {
    pub fn new(repository: Arc<dyn OrderRepository>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<dyn OrderRepository> {
        &self.repository
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Order> {
        self.repository
            .find_order(order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))
    }

    pub async fn get_order_by_number(&self, order_number: &str) -> Result<Order> {
        self.repository
            .find_order_by_number(order_number)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_number.to_string()))
    }

    pub async fn get_payment(&self, order_id: Uuid) -> Result<PaymentTransaction> {
        self.repository
            .find_payment(order_id)
            .await?
            .ok_or(OrderError::PaymentNotFound(order_id))
    }

    /// PENDING | PROCESSING → CANCELLED
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order> {
        self.change_status(order_id, OrderStatus::Cancelled).await
    }

    /// PAID → FULFILLED
    pub async fn fulfill_order(&self, order_id: Uuid) -> Result<Order> {
        self.change_status(order_id, OrderStatus::Fulfilled).await
    }

    /// 先经状态机校验，再以读到的状态做 CAS；CAS 落空说明状态已被并发修改
    async fn change_status(&self, order_id: Uuid, target: OrderStatus) -> Result<Order> {
        let order = self.get_order(order_id).await?;
        let next = state_machine::transition(order.status, target)?;

        if !self
            .repository
            .update_order_status(order_id, order.status, next)
            .await?
        {
            let current = self.get_order(order_id).await?;
            warn!(
                order_id = %order_id,
                expected = %order.status,
                current = %current.status,
                target = %target,
                "订单状态已被并发修改"
            );
            return Err(ShopError::InvalidStateTransition {
                from: current.status.to_string(),
                to: target.to_string(),
            }
            .into());
        }

        info!(
            order_id = %order_id,
            order_number = %order.order_number,
            from = %order.status,
            to = %next,
            "订单状态已变更"
        );
        self.get_order(order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessedEvent;
    use crate::repository::{MemoryOrderRepository, MockOrderRepository};
    use chrono::Utc;
    use shop_shared::events::EventType;
    use shop_shared::outbox::MemoryOutboxStore;
    use shop_shared::test_utils::TestDataGenerator;

    async fn service_with_order(status: OrderStatus) -> (OrderService, Order) {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let event = TestDataGenerator::order_created_event();
        let now = Utc::now();
        let order = Order::from_event(&event, now);
        repo.create_order_from_event(
            &order,
            &PaymentTransaction::pending_for(&order, now),
            &ProcessedEvent::new(event.event_id, EventType::OrderCreated, now),
        )
        .await
        .unwrap();

        let mut current = OrderStatus::Pending;
        for step in [OrderStatus::Processing, OrderStatus::Paid] {
            if current == status {
                break;
            }
            repo.update_order_status(order.id, current, step).await.unwrap();
            current = step;
        }
        assert_eq!(current, status);

        (OrderService::new(Arc::new(repo)), order)
    }

    #[tokio::test]
    async fn test_queries_by_id_and_number() {
        let (service, order) = service_with_order(OrderStatus::Pending).await;

        let by_id = service.get_order(order.id).await.unwrap();
        let by_number = service.get_order_by_number(&order.order_number).await.unwrap();
        assert_eq!(by_id, by_number);
        assert_eq!(by_id.items.len(), 1);

        let payment = service.get_payment(order.id).await.unwrap();
        assert_eq!(payment.amount, order.subtotal);

        let missing = service.get_order_by_number("ORD-19990101-001").await;
        assert!(matches!(missing, Err(OrderError::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_pending_and_processing_orders() {
        for status in [OrderStatus::Pending, OrderStatus::Processing] {
            let (service, order) = service_with_order(status).await;
            let cancelled = service.cancel_order(order.id).await.unwrap();
            assert_eq!(cancelled.status, OrderStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_paid_order_cannot_be_cancelled_but_can_be_fulfilled() {
        let (service, order) = service_with_order(OrderStatus::Paid).await;

        let err = service.cancel_order(order.id).await.unwrap_err();
        assert!(matches!(
            err,
            OrderError::Shared(ShopError::InvalidStateTransition { .. })
        ));

        let fulfilled = service.fulfill_order(order.id).await.unwrap();
        assert_eq!(fulfilled.status, OrderStatus::Fulfilled);

        // 终态
        assert!(service.fulfill_order(order.id).await.is_err());
    }

    #[tokio::test]
    async fn test_lost_race_surfaces_as_invalid_transition() {
        let event = TestDataGenerator::order_created_event();
        let pending = Order::from_event(&event, Utc::now());
        let mut paid = pending.clone();
        paid.status = OrderStatus::Paid;
        let order_id = pending.id;

        let mut repo = MockOrderRepository::new();
        let mut reads = 0;
        repo.expect_find_order().returning(move |_| {
            reads += 1;
            // 第一次读到 PENDING，CAS 失败后再读到已支付
            Ok(Some(if reads == 1 { pending.clone() } else { paid.clone() }))
        });
        repo.expect_update_order_status()
            .times(1)
            .returning(|_, _, _| Ok(false));

        let service = OrderService::new(Arc::new(repo));
        let err = service.cancel_order(order_id).await.unwrap_err();
        match err {
            OrderError::Shared(ShopError::InvalidStateTransition { from, to }) => {
                assert_eq!(from, "PAID");
                assert_eq!(to, "CANCELLED");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
