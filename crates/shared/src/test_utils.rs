//! 测试工具模块
//!
//! 提供内存消息发布器和事件测试数据，供各服务的单元测试与集成测试复用。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{Result, ShopError};
use crate::events::{
    CustomerInfo, EVENT_VERSION, EventType, OrderCreatedEvent, OrderItemSnapshot,
    PaymentCompletedEvent, PaymentResultStatus, ShippingAddress,
};
use crate::kafka::{ConsumerMessage, MessagePublisher};

// ==================== 内存消息发布器 ====================

/// 已发布的消息
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// 转为消费端看到的消息
    pub fn to_consumer_message(&self) -> ConsumerMessage {
        ConsumerMessage::new(self.topic.clone(), Some(self.key.clone()), self.payload.clone())
    }
}

/// 记录所有发布消息的内存 broker
///
/// `set_available(false)` 模拟 broker 宕机；`fail_next(n)` 让接下来 n 次发布失败。
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
    unavailable: AtomicBool,
    scripted_failures: Mutex<VecDeque<String>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn fail_next(&self, times: usize) {
        let mut failures = self.scripted_failures.lock();
        for _ in 0..times {
            failures.push_back("模拟发送失败".to_string());
        }
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().clone()
    }

    pub fn messages_for(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// 取走并清空已记录的消息
    pub fn drain(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.messages.lock())
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ShopError::Kafka("broker 不可用".to_string()));
        }
        if let Some(reason) = self.scripted_failures.lock().pop_front() {
            return Err(ShopError::Kafka(reason));
        }
        self.messages.lock().push(PublishedMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

// ==================== 测试数据生成器 ====================

pub struct TestDataGenerator;

impl TestDataGenerator {
    pub fn customer() -> CustomerInfo {
        CustomerInfo {
            name: "Ada Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            phone: "+1-415-555-0100".to_string(),
            shipping_address: ShippingAddress {
                street: "1 Market St".to_string(),
                city: "San Francisco".to_string(),
                state: "CA".to_string(),
                postal_code: "94105".to_string(),
                country: "US".to_string(),
            },
        }
    }

    /// 单价 29.99 × 2 的商品
    pub fn order_item() -> OrderItemSnapshot {
        let price = Decimal::new(2999, 2);
        OrderItemSnapshot {
            product_id: Uuid::new_v4(),
            sku: "SKU-001".to_string(),
            name: "Mechanical Keyboard".to_string(),
            quantity: 2,
            price_snapshot: price,
            subtotal: price * Decimal::from(2),
        }
    }

    /// 小计 59.98 的订单创建事件
    pub fn order_created_event() -> OrderCreatedEvent {
        OrderCreatedEvent::new(
            format!("checkout-{}", Uuid::new_v4()),
            Uuid::new_v4(),
            "ORD-20250101-001",
            Self::customer(),
            vec![Self::order_item()],
            Uuid::new_v4(),
        )
    }

    pub fn payment_completed_event(status: PaymentResultStatus) -> PaymentCompletedEvent {
        let (external_transaction_id, failure_reason) = match status {
            PaymentResultStatus::Success => (Some("mock_tx_1700000000000".to_string()), None),
            PaymentResultStatus::Failed => (None, Some("card declined".to_string())),
        };
        PaymentCompletedEvent {
            event_id: Uuid::now_v7(),
            event_type: EventType::PaymentCompleted,
            event_version: EVENT_VERSION.to_string(),
            timestamp: chrono::Utc::now(),
            correlation_id: format!("checkout-{}", Uuid::new_v4()),
            order_id: Uuid::new_v4(),
            order_number: "ORD-20250101-001".to_string(),
            payment_transaction_id: Uuid::new_v4(),
            status,
            amount: Decimal::new(5998, 2),
            payment_method: "MOCK".to_string(),
            external_transaction_id,
            failure_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_publisher_scripted_failures() {
        let publisher = RecordingPublisher::new();
        publisher.fail_next(1);

        assert!(publisher.publish("t", "k", b"1").await.is_err());
        assert!(publisher.publish("t", "k", b"2").await.is_ok());

        publisher.set_available(false);
        assert!(publisher.publish("t", "k", b"3").await.is_err());

        let sent = publisher.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, b"2");
    }

    #[test]
    fn test_generated_event_is_consistent() {
        let event = TestDataGenerator::order_created_event();
        assert_eq!(event.subtotal, Decimal::new(5998, 2));
        assert!(event.validate_payload().is_ok());
    }
}
