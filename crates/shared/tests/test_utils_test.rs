//! test_utils 模块的集成测试
//!
//! 验证测试工具模块的功能正确性

use shop_shared::events::{OrderCreatedEvent, PaymentCompletedEvent, PaymentResultStatus};
use shop_shared::kafka::{MessagePublisher, topics};
use shop_shared::test_utils::*;

// ==================== 测试数据生成器测试 ====================

#[test]
fn test_order_created_event_generation() {
    let event = TestDataGenerator::order_created_event();

    assert_eq!(event.order_number, "ORD-20250101-001");
    assert_eq!(event.items.len(), 1);
    assert!(event.correlation_id.starts_with("checkout-"));
    assert!(event.validate_payload().is_ok());
}

#[test]
fn test_payment_completed_event_generation() {
    let success = TestDataGenerator::payment_completed_event(PaymentResultStatus::Success);
    assert!(success.external_transaction_id.is_some());
    assert!(success.failure_reason.is_none());
    assert!(success.validate_payload().is_ok());

    let failed = TestDataGenerator::payment_completed_event(PaymentResultStatus::Failed);
    assert!(failed.external_transaction_id.is_none());
    assert!(failed.failure_reason.is_some());
    assert!(failed.validate_payload().is_ok());
}

#[test]
fn test_generated_events_survive_json() {
    let event = TestDataGenerator::order_created_event();
    let json = serde_json::to_value(&event).unwrap();

    assert_eq!(json["eventType"], "ORDER_CREATED");
    assert_eq!(json["customer"]["shippingAddress"]["postalCode"], "94105");
    // 金额以字符串形式传输，避免浮点误差
    assert_eq!(json["subtotal"], "59.98");

    let back: OrderCreatedEvent = serde_json::from_value(json).unwrap();
    assert_eq!(back, event);

    let payment = TestDataGenerator::payment_completed_event(PaymentResultStatus::Failed);
    let json = serde_json::to_value(&payment).unwrap();
    assert!(json.get("externalTransactionId").is_none());
    let back: PaymentCompletedEvent = serde_json::from_value(json).unwrap();
    assert_eq!(back.failure_reason.as_deref(), Some("card declined"));
}

// ==================== 内存发布器测试 ====================

#[tokio::test]
async fn test_recording_publisher_filters_by_topic() {
    let publisher = RecordingPublisher::new();
    publisher
        .publish(topics::ORDERS_CREATED, "order-1", b"a")
        .await
        .unwrap();
    publisher
        .publish(topics::PAYMENTS_COMPLETED, "order-1", b"b")
        .await
        .unwrap();

    assert_eq!(publisher.messages().len(), 2);
    assert_eq!(publisher.messages_for(topics::ORDERS_CREATED).len(), 1);

    let consumed = publisher.messages_for(topics::PAYMENTS_COMPLETED)[0].to_consumer_message();
    assert_eq!(consumed.topic, topics::PAYMENTS_COMPLETED);
    assert_eq!(consumed.key.as_deref(), Some("order-1"));
    assert_eq!(consumed.payload, b"b");
}

#[tokio::test]
async fn test_recording_publisher_drain_empties_buffer() {
    let publisher = RecordingPublisher::new();
    publisher.publish("t", "k", b"1").await.unwrap();

    assert_eq!(publisher.drain().len(), 1);
    assert!(publisher.messages().is_empty());
}

#[tokio::test]
async fn test_recording_publisher_outage_keeps_nothing() {
    let publisher = RecordingPublisher::new();
    publisher.set_available(false);

    let err = publisher.publish("t", "k", b"1").await.unwrap_err();
    assert!(err.is_retryable());
    assert!(publisher.messages().is_empty());
}
