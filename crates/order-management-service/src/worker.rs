//! 卡住的支付恢复 Worker
//!
//! 消费端提交后、异步支付开始前进程退出时，订单会停在 PENDING。
//! 定期扫描超过 `stalled_after` 仍未开始的支付并重新编排；
//! 编排内部的 PENDING → PROCESSING CAS 保证同一订单只有一个调度者继续。
//!
//! 扣款后落库失败的订单会停在 PROCESSING。停留超过一次编排的调用预算后
//! 以失败结算交易，不再调用网关。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shop_shared::config::PaymentRecoveryConfig;
use shop_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::payment::PaymentOrchestrator;
use crate::repository::OrderRepository;

pub struct PaymentRecoveryWorker {
    repository: Arc<dyn OrderRepository>,
    orchestrator: Arc<PaymentOrchestrator>,
    interval: Duration,
    stalled_after: chrono::Duration,
    unsettled_after: chrono::Duration,
    batch_size: i64,
}

impl PaymentRecoveryWorker {
    pub fn new(
        repository: Arc<dyn OrderRepository>,
        orchestrator: Arc<PaymentOrchestrator>,
        config: &PaymentRecoveryConfig,
    ) -> Self {
        let stalled_after = chrono::Duration::seconds(config.stalled_after_seconds);
        let call_budget = chrono::Duration::from_std(orchestrator.policy().call_budget())
            .unwrap_or(stalled_after);
        Self {
            repository,
            orchestrator,
            interval: Duration::from_secs(config.interval_seconds.max(1)),
            stalled_after,
            unsettled_after: stalled_after.max(call_budget),
            batch_size: config.batch_size.max(1),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            stalled_after_seconds = self.stalled_after.num_seconds(),
            unsettled_after_seconds = self.unsettled_after.num_seconds(),
            "支付恢复 Worker 已启动"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.recover_once().await {
                        error!(error = %e, "扫描卡住的支付出错");
                    }
                    metrics::set_worker_last_run("payment_recovery");
                }
            }
        }

        info!("支付恢复 Worker 已退出");
    }

    /// 扫描一轮，返回本轮重新编排与超时结算的订单总数
    pub async fn recover_once(&self) -> Result<usize> {
        let now = Utc::now();
        let mut recovered = 0;

        let stalled = self
            .repository
            .find_stalled_payments(now - self.stalled_after, self.batch_size)
            .await?;
        if !stalled.is_empty() {
            info!(count = stalled.len(), "发现卡住的支付，重新编排");
        }
        for order_id in stalled {
            match self.orchestrator.attempt_payment(order_id).await {
                Ok(Some(_)) => recovered += 1,
                Ok(None) => {}
                Err(e) => warn!(order_id = %order_id, error = %e, "恢复支付失败"),
            }
        }

        let unsettled = self
            .repository
            .find_unsettled_payments(now - self.unsettled_after, self.batch_size)
            .await?;
        if !unsettled.is_empty() {
            warn!(count = unsettled.len(), "发现未落库的支付结果，按失败结算");
        }
        for order_id in unsettled {
            match self.orchestrator.expire_unsettled(order_id).await {
                Ok(Some(_)) => recovered += 1,
                Ok(None) => {}
                Err(e) => warn!(order_id = %order_id, error = %e, "结算未落库的支付失败"),
            }
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, PaymentStatus, PaymentTransaction, ProcessedEvent};
    use crate::payment::gateway::{MockPaymentGateway, PaymentReceipt};
    use crate::payment::PaymentPolicy;
    use crate::repository::{MemoryOrderRepository, MockOrderRepository};
    use crate::service::PaymentCompletionHandler;
    use crate::state_machine::OrderStatus;
    use shop_shared::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use shop_shared::events::EventType;
    use shop_shared::outbox::MemoryOutboxStore;
    use shop_shared::test_utils::TestDataGenerator;
    use uuid::Uuid;

    async fn seed_order(repo: &MemoryOrderRepository, sequence: u32) -> Uuid {
        let mut event = TestDataGenerator::order_created_event();
        event.order_number = format!("ORD-20250101-{sequence:03}");
        let now = Utc::now();
        let order = Order::from_event(&event, now);
        repo.create_order_from_event(
            &order,
            &PaymentTransaction::pending_for(&order, now),
            &ProcessedEvent::new(event.event_id, EventType::OrderCreated, now),
        )
        .await
        .unwrap();
        order.id
    }

    fn worker(repository: Arc<dyn OrderRepository>, gateway: MockPaymentGateway) -> PaymentRecoveryWorker {
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            repository.clone(),
            Arc::new(gateway),
            CircuitBreaker::new(CircuitBreakerConfig::new("payment_gateway")),
            PaymentPolicy::default(),
            Arc::new(PaymentCompletionHandler::new(repository.clone())),
        ));
        PaymentRecoveryWorker::new(repository, orchestrator, &PaymentRecoveryConfig::default())
    }

    #[tokio::test]
    async fn test_recovers_only_stalled_payments() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let stalled = seed_order(&repo, 1).await;
        let fresh = seed_order(&repo, 2).await;
        repo.backdate_payment(stalled, Utc::now() - chrono::Duration::minutes(10));

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_charge()
            .withf(move |req| req.order_id == stalled)
            .times(1)
            .returning(|_| {
                Ok(PaymentReceipt {
                    external_transaction_id: "mock_tx_1".to_string(),
                })
            });

        let worker = worker(Arc::new(repo.clone()), gateway);
        assert_eq!(worker.recover_once().await.unwrap(), 1);

        assert_eq!(
            repo.find_order(stalled).await.unwrap().unwrap().status,
            OrderStatus::Paid
        );
        assert_eq!(
            repo.find_order(fresh).await.unwrap().unwrap().status,
            OrderStatus::Pending
        );

        // 已结算，下一轮不再出现
        assert_eq!(worker.recover_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_processing_order_past_budget_is_failed_without_charging() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let stranded = seed_order(&repo, 1).await;
        let in_flight = seed_order(&repo, 2).await;
        for order_id in [stranded, in_flight] {
            repo.update_order_status(order_id, OrderStatus::Pending, OrderStatus::Processing)
                .await
                .unwrap();
        }
        repo.backdate_order(stranded, Utc::now() - chrono::Duration::minutes(10));

        let mut gateway = MockPaymentGateway::new();
        gateway.expect_charge().never();

        let worker = worker(Arc::new(repo.clone()), gateway);
        assert_eq!(worker.recover_once().await.unwrap(), 1);

        assert_eq!(
            repo.find_order(stranded).await.unwrap().unwrap().status,
            OrderStatus::Failed
        );
        assert_eq!(
            repo.find_payment(stranded).await.unwrap().unwrap().status,
            PaymentStatus::Failed
        );
        // 仍在调用预算内
        assert_eq!(
            repo.find_order(in_flight).await.unwrap().unwrap().status,
            OrderStatus::Processing
        );
        assert_eq!(repo.outbox().snapshot().len(), 1);

        assert_eq!(worker.recover_once().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_on_interval_until_shutdown() {
        let mut repo = MockOrderRepository::new();
        repo.expect_find_stalled_payments()
            .withf(|_, limit| *limit == 50)
            .times(2)
            .returning(|_, _| Ok(Vec::new()));
        repo.expect_find_unsettled_payments()
            .withf(|_, limit| *limit == 50)
            .times(2)
            .returning(|_, _| Ok(Vec::new()));

        let worker = worker(Arc::new(repo), MockPaymentGateway::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        // 每 60 秒一轮
        tokio::time::sleep(Duration::from_secs(130)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
