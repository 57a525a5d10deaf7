//! 订单事件消费者
//!
//! 订阅 `orders.created` 与 `payments.completed`：
//! - OrderCreated：按 eventId 去重，同一事务内创建订单、明细、PENDING 支付交易并登记事件，
//!   提交后交给支付编排器异步处理
//! - PaymentCompleted：本服务发出的事件自消费，经完成处理器对账
//!
//! 格式错误或校验失败的消息直接进入死信；瞬时故障在进程内按退避重试，
//! 超过 `max_delivery_attempts` 后进入死信。只有死信发送失败时 handler 返回错误，
//! 此时不提交 offset，由 broker 重新投递。

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use shop_shared::config::{AppConfig, ConsumerConfig};
use shop_shared::dlq::{DeadLetterMessage, DlqProducer};
use shop_shared::error::Result as SharedResult;
use shop_shared::events::{EventType, OrderCreatedEvent, PaymentCompletedEvent};
use shop_shared::kafka::{ConsumerMessage, KafkaConsumer, topics};
use shop_shared::observability::metrics;
use shop_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{OrderError, Result};
use crate::models::{
    CreateOrderResult, FinalizeResult, Order, PaymentTransaction, ProcessedEvent,
};
use crate::payment::PaymentOrchestrator;
use crate::repository::OrderRepository;
use crate::service::PaymentCompletionHandler;

/// 解码后的入站事件
#[derive(Debug, Clone)]
pub enum IncomingEvent {
    OrderCreated(OrderCreatedEvent),
    PaymentCompleted(PaymentCompletedEvent),
}

impl IncomingEvent {
    /// 按 topic 解码并校验，失败即为毒消息
    pub fn decode(msg: &ConsumerMessage) -> Result<Self> {
        let event = match msg.topic.as_str() {
            topics::ORDERS_CREATED => {
                let event: OrderCreatedEvent = msg.deserialize_payload()?;
                event.validate_payload()?;
                Self::OrderCreated(event)
            }
            topics::PAYMENTS_COMPLETED => {
                let event: PaymentCompletedEvent = msg.deserialize_payload()?;
                event.validate_payload()?;
                Self::PaymentCompleted(event)
            }
            other => {
                return Err(OrderError::PoisonMessage(format!("不支持的 topic: {other}")));
            }
        };
        Ok(event)
    }

    pub fn event_id(&self) -> Uuid {
        match self {
            Self::OrderCreated(e) => e.event_id,
            Self::PaymentCompleted(e) => e.event_id,
        }
    }
}

/// 单条消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Processed,
    Duplicate,
    DeadLettered,
}

impl HandleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Duplicate => "duplicate",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// 消息处理器，与 Kafka 拉取循环解耦，测试中直接喂入 `ConsumerMessage`
pub struct OrderEventHandler {
    repository: Arc<dyn OrderRepository>,
    orchestrator: Arc<PaymentOrchestrator>,
    completion: Arc<PaymentCompletionHandler>,
    dlq: DlqProducer,
    max_delivery_attempts: u32,
    retry: RetryPolicy,
}

impl OrderEventHandler {
    pub fn new(
        repository: Arc<dyn OrderRepository>,
        orchestrator: Arc<PaymentOrchestrator>,
        completion: Arc<PaymentCompletionHandler>,
        dlq: DlqProducer,
        config: &ConsumerConfig,
    ) -> Self {
        let max_delivery_attempts = config.max_delivery_attempts.max(1);
        Self {
            repository,
            orchestrator,
            completion,
            dlq,
            max_delivery_attempts,
            retry: RetryPolicy::with_max_attempts(max_delivery_attempts)
                .with_delays(
                    Duration::from_millis(config.retry_initial_delay_ms),
                    Duration::from_millis(config.retry_max_delay_ms),
                )
                .with_jitter(0.2),
        }
    }

    /// 处理一条消息；返回 Err 表示不应提交 offset
    pub async fn handle(&self, msg: &ConsumerMessage) -> SharedResult<HandleOutcome> {
        let outcome = match IncomingEvent::decode(msg) {
            Ok(event) => self.process_with_retry(msg, &event).await?,
            Err(e) => {
                warn!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    "消息无法解码或校验失败，转入死信队列"
                );
                let first_failed_at = Utc::now();
                self.dead_letter(msg, &message_id_of(msg), &e, 1, first_failed_at)
                    .await?;
                HandleOutcome::DeadLettered
            }
        };

        metrics::record_consumed_event(&msg.topic, outcome.as_str());
        Ok(outcome)
    }

    async fn process_with_retry(
        &self,
        msg: &ConsumerMessage,
        event: &IncomingEvent,
    ) -> SharedResult<HandleOutcome> {
        let attempts = AtomicU32::new(0);
        let first_failed_at: OnceLock<DateTime<Utc>> = OnceLock::new();

        let result = retry_with_policy(&self.retry, "consume_event", OrderError::is_retryable, || {
            let attempts = &attempts;
            let first_failed_at = &first_failed_at;
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                let result = self.process(event).await;
                if result.is_err() {
                    first_failed_at.get_or_init(Utc::now);
                }
                result
            }
        })
        .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let attempts = attempts.load(Ordering::SeqCst);
                error!(
                    event_id = %event.event_id(),
                    topic = %msg.topic,
                    attempts,
                    max_delivery_attempts = self.max_delivery_attempts,
                    error = %e,
                    "事件处理失败，转入死信队列"
                );
                let first_failed_at = first_failed_at.get().copied().unwrap_or_else(Utc::now);
                self.dead_letter(
                    msg,
                    &event.event_id().to_string(),
                    &e,
                    attempts,
                    first_failed_at,
                )
                .await?;
                Ok(HandleOutcome::DeadLettered)
            }
        }
    }

    async fn process(&self, event: &IncomingEvent) -> Result<HandleOutcome> {
        match event {
            IncomingEvent::OrderCreated(event) => self.on_order_created(event).await,
            IncomingEvent::PaymentCompleted(event) => self.on_payment_completed(event).await,
        }
    }

    async fn on_order_created(&self, event: &OrderCreatedEvent) -> Result<HandleOutcome> {
        if self.repository.is_processed(event.event_id).await? {
            debug!(event_id = %event.event_id, "重复的 OrderCreated 事件，跳过");
            return Ok(HandleOutcome::Duplicate);
        }

        let now = Utc::now();
        let order = Order::from_event(event, now);
        let payment = PaymentTransaction::pending_for(&order, now);
        let processed = ProcessedEvent::new(event.event_id, EventType::OrderCreated, now);

        match self
            .repository
            .create_order_from_event(&order, &payment, &processed)
            .await?
        {
            CreateOrderResult::Created => {
                info!(
                    event_id = %event.event_id,
                    order_id = %order.id,
                    order_number = %order.order_number,
                    correlation_id = %event.correlation_id,
                    "订单已创建，开始异步支付"
                );
                self.orchestrator.dispatch(order.id);
                Ok(HandleOutcome::Processed)
            }
            CreateOrderResult::Duplicate => Ok(HandleOutcome::Duplicate),
        }
    }

    async fn on_payment_completed(&self, event: &PaymentCompletedEvent) -> Result<HandleOutcome> {
        match self.completion.reconcile(event).await? {
            FinalizeResult::Duplicate => Ok(HandleOutcome::Duplicate),
            FinalizeResult::Applied { .. } | FinalizeResult::AlreadySettled { .. } => {
                Ok(HandleOutcome::Processed)
            }
        }
    }

    async fn dead_letter(
        &self,
        msg: &ConsumerMessage,
        message_id: &str,
        error: &OrderError,
        retry_count: u32,
        first_failed_at: DateTime<Utc>,
    ) -> SharedResult<()> {
        let dlq_msg = DeadLetterMessage::from_consumed(
            msg,
            message_id,
            error.to_string(),
            error.error_code(),
            retry_count,
            first_failed_at,
            self.dlq.source_service(),
        );

        self.dlq.send(&dlq_msg).await.map_err(|e| {
            error!(
                message_id,
                topic = %msg.topic,
                offset = msg.offset,
                error = %e,
                "死信发送失败，offset 不提交，等待重新投递"
            );
            e
        })
    }
}

/// 能解析出 eventId 时用 eventId，否则用 topic-partition-offset
fn message_id_of(msg: &ConsumerMessage) -> String {
    serde_json::from_slice::<serde_json::Value>(&msg.payload)
        .ok()
        .and_then(|v| v.get("eventId").and_then(|id| id.as_str()).map(String::from))
        .unwrap_or_else(|| format!("{}-{}-{}", msg.topic, msg.partition, msg.offset))
}

/// Kafka 消费循环
pub struct OrderEventConsumer {
    consumer: KafkaConsumer,
    handler: OrderEventHandler,
}

impl OrderEventConsumer {
    pub fn new(config: &AppConfig, handler: OrderEventHandler) -> SharedResult<Self> {
        let consumer = KafkaConsumer::new(&config.kafka, None)?;
        Ok(Self { consumer, handler })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> SharedResult<()> {
        let subscribed = [topics::ORDERS_CREATED, topics::PAYMENTS_COMPLETED];
        self.consumer.subscribe(&subscribed)?;
        info!(topics = ?subscribed, "订单事件消费者已启动");

        let handler = self.handler;
        self.consumer
            .start(shutdown, |msg| {
                let handler = &handler;
                async move { handler.handle(&msg).await.map(|_| ()) }
            })
            .await;

        info!("订单事件消费者已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::gateway::{MockPaymentGateway, PaymentReceipt};
    use crate::payment::{PaymentGateway, PaymentPolicy};
    use crate::repository::{MemoryOrderRepository, MockOrderRepository};
    use crate::state_machine::OrderStatus;
    use shop_shared::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use shop_shared::events::PaymentResultStatus;
    use shop_shared::outbox::MemoryOutboxStore;
    use shop_shared::test_utils::{RecordingPublisher, TestDataGenerator};

    fn approving_gateway() -> Arc<dyn PaymentGateway> {
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_charge().returning(|_| {
            Ok(PaymentReceipt {
                external_transaction_id: "mock_tx_1".to_string(),
            })
        });
        Arc::new(gateway)
    }

    fn handler_with(
        repository: Arc<dyn OrderRepository>,
        broker: Arc<RecordingPublisher>,
    ) -> OrderEventHandler {
        let completion = Arc::new(PaymentCompletionHandler::new(repository.clone()));
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            repository.clone(),
            approving_gateway(),
            CircuitBreaker::new(CircuitBreakerConfig::new("payment_gateway")),
            PaymentPolicy::default(),
            completion.clone(),
        ));
        OrderEventHandler::new(
            repository,
            orchestrator,
            completion,
            DlqProducer::new(broker, "order-management-service"),
            &ConsumerConfig::default(),
        )
    }

    fn message_for(event: &OrderCreatedEvent) -> ConsumerMessage {
        ConsumerMessage::new(
            topics::ORDERS_CREATED,
            Some(event.order_id.to_string()),
            serde_json::to_vec(event).unwrap(),
        )
    }

    async fn wait_for_status(repo: &MemoryOrderRepository, order_id: Uuid, status: OrderStatus) {
        for _ in 0..100 {
            if let Some(order) = repo.find_order(order_id).await.unwrap()
                && order.status == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("order {order_id} never reached {status}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_event_creates_one_order() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let broker = Arc::new(RecordingPublisher::new());
        let handler = handler_with(Arc::new(repo.clone()), broker.clone());
        let event = TestDataGenerator::order_created_event();
        let msg = message_for(&event);

        assert_eq!(handler.handle(&msg).await.unwrap(), HandleOutcome::Processed);
        assert_eq!(handler.handle(&msg).await.unwrap(), HandleOutcome::Duplicate);
        assert_eq!(handler.handle(&msg).await.unwrap(), HandleOutcome::Duplicate);

        assert_eq!(repo.order_count(), 1);
        assert_eq!(repo.payment_count(), 1);
        wait_for_status(&repo, event.order_id, OrderStatus::Paid).await;
        assert!(broker.messages().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_goes_to_dead_letter() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let broker = Arc::new(RecordingPublisher::new());
        let handler = handler_with(Arc::new(repo.clone()), broker.clone());
        let mut msg = ConsumerMessage::new(
            topics::ORDERS_CREATED,
            Some("order-1".to_string()),
            b"{not json".to_vec(),
        );
        msg.partition = 1;
        msg.offset = 7;

        assert_eq!(
            handler.handle(&msg).await.unwrap(),
            HandleOutcome::DeadLettered
        );

        let dead = broker.messages_for("orders.created.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].key, "order-1");
        let body: DeadLetterMessage = serde_json::from_slice(&dead[0].payload).unwrap();
        assert_eq!(body.message_id, "orders.created-1-7");
        assert_eq!(body.error_kind, "VALIDATION_ERROR");
        assert_eq!(body.retry_count, 1);
        assert_eq!(repo.order_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_event_is_dead_lettered_with_event_id() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let broker = Arc::new(RecordingPublisher::new());
        let handler = handler_with(Arc::new(repo.clone()), broker.clone());

        let mut event = TestDataGenerator::order_created_event();
        event.subtotal += rust_decimal::Decimal::ONE;

        assert_eq!(
            handler.handle(&message_for(&event)).await.unwrap(),
            HandleOutcome::DeadLettered
        );
        let dead = broker.messages_for("orders.created.dlq");
        let body: DeadLetterMessage = serde_json::from_slice(&dead[0].payload).unwrap();
        assert_eq!(body.message_id, event.event_id.to_string());
    }

    #[tokio::test]
    async fn test_overflowing_amounts_are_dead_lettered() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let broker = Arc::new(RecordingPublisher::new());
        let handler = handler_with(Arc::new(repo.clone()), broker.clone());

        let event = TestDataGenerator::order_created_event();
        let mut payload = serde_json::to_value(&event).unwrap();
        payload["items"][0]["priceSnapshot"] = serde_json::json!("79228162514264337593543950335");
        payload["items"][0]["quantity"] = serde_json::json!(2);
        let msg = ConsumerMessage::new(
            topics::ORDERS_CREATED,
            Some(event.order_id.to_string()),
            serde_json::to_vec(&payload).unwrap(),
        );

        assert_eq!(
            handler.handle(&msg).await.unwrap(),
            HandleOutcome::DeadLettered
        );
        let dead = broker.messages_for("orders.created.dlq");
        let body: DeadLetterMessage = serde_json::from_slice(&dead[0].payload).unwrap();
        assert_eq!(body.error_kind, "VALIDATION_ERROR");
        assert_eq!(repo.order_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_failure_keeps_offset_uncommitted() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let broker = Arc::new(RecordingPublisher::new());
        broker.set_available(false);
        let handler = handler_with(Arc::new(repo), broker);

        let msg = ConsumerMessage::new(topics::ORDERS_CREATED, None, b"garbage".to_vec());
        assert!(handler.handle(&msg).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_delivery_attempts() {
        let mut repo = MockOrderRepository::new();
        repo.expect_is_processed()
            .times(3)
            .returning(|_| Err(OrderError::from(sqlx::Error::PoolTimedOut)));
        let broker = Arc::new(RecordingPublisher::new());
        let handler = handler_with(Arc::new(repo), broker.clone());

        let event = TestDataGenerator::order_created_event();
        assert_eq!(
            handler.handle(&message_for(&event)).await.unwrap(),
            HandleOutcome::DeadLettered
        );

        let dead = broker.messages_for("orders.created.dlq");
        let body: DeadLetterMessage = serde_json::from_slice(&dead[0].payload).unwrap();
        assert_eq!(body.retry_count, 3);
        assert_eq!(body.error_kind, "DATABASE_ERROR");
        assert!(body.first_failed_at <= body.last_failed_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_within_attempts() {
        let mut repo = MockOrderRepository::new();
        let mut calls = 0;
        repo.expect_is_processed().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(OrderError::from(sqlx::Error::PoolTimedOut))
            } else {
                Ok(false)
            }
        });
        repo.expect_create_order_from_event()
            .times(1)
            .returning(|_, _, _| Ok(CreateOrderResult::Created));
        // 支付编排在后台读取订单，这里不关心结果
        repo.expect_find_order().returning(|_| Ok(None));

        let broker = Arc::new(RecordingPublisher::new());
        let handler = handler_with(Arc::new(repo), broker.clone());
        let event = TestDataGenerator::order_created_event();

        assert_eq!(
            handler.handle(&message_for(&event)).await.unwrap(),
            HandleOutcome::Processed
        );
        assert!(broker.messages().is_empty());
    }

    #[tokio::test]
    async fn test_self_consumed_completion_is_duplicate() {
        let repo = MemoryOrderRepository::new(MemoryOutboxStore::new());
        let broker = Arc::new(RecordingPublisher::new());
        let handler = handler_with(Arc::new(repo.clone()), broker.clone());

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
        repo.update_order_status(order.id, OrderStatus::Pending, OrderStatus::Processing)
            .await
            .unwrap();
        let outcome = crate::models::PaymentOutcome::succeeded(order.id, "mock_tx_1".to_string(), 1);
        repo.finalize_payment(&outcome).await.unwrap();

        // 订单侧投递器发出的事件被自己消费
        let row = repo.outbox().snapshot().remove(0);
        let msg = ConsumerMessage::new(
            topics::PAYMENTS_COMPLETED,
            Some(row.aggregate_id.clone()),
            serde_json::to_vec(&row.payload).unwrap(),
        );
        assert_eq!(handler.handle(&msg).await.unwrap(), HandleOutcome::Duplicate);

        // 外部来源的同一订单结果：交易已是终态，只做登记
        let mut foreign = TestDataGenerator::payment_completed_event(PaymentResultStatus::Failed);
        foreign.order_id = order.id;
        let msg = ConsumerMessage::new(
            topics::PAYMENTS_COMPLETED,
            Some(order.id.to_string()),
            serde_json::to_vec(&foreign).unwrap(),
        );
        assert_eq!(handler.handle(&msg).await.unwrap(), HandleOutcome::Processed);
        assert_eq!(
            repo.find_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Paid
        );
    }
}
