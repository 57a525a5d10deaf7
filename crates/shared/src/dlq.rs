//! 死信队列处理
//!
//! 消息无法处理（格式错误、校验失败或重试耗尽）时，原始内容连同诊断信息
//! 被发送到 `<源 topic>.dlq`，消费者随后提交 offset 继续处理后续消息。
//! 死信消息等待人工介入，不会被自动重放。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::kafka::{ConsumerMessage, MessagePublisher, topics};

// ---------------------------------------------------------------------------
// DeadLetterMessage — 死信消息信封
// ---------------------------------------------------------------------------

/// 死信消息信封
///
/// 包装原始消息，附加失败原因、处理次数和原始位置，便于排查和人工重放。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 ID（能解析出 eventId 时为 eventId，否则为 topic-partition-offset）
    pub message_id: String,
    pub source_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// 原始消息内容，非 UTF-8 字节会被有损转换
    pub payload: String,
    pub error: String,
    /// 错误分类，如 VALIDATION_ERROR、DATABASE_ERROR
    pub error_kind: String,
    /// 进入死信前的处理次数
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub source_service: String,
}

impl DeadLetterMessage {
    /// 根据消费到的原始消息构造死信
    pub fn from_consumed(
        msg: &ConsumerMessage,
        message_id: impl Into<String>,
        error: impl Into<String>,
        error_kind: impl Into<String>,
        retry_count: u32,
        first_failed_at: DateTime<Utc>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            source_topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            key: msg.key.clone(),
            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            error: error.into(),
            error_kind: error_kind.into(),
            retry_count,
            first_failed_at,
            last_failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }

    /// 死信 topic
    pub fn target_topic(&self) -> String {
        topics::dead_letter_topic(&self.source_topic)
    }
}

// ---------------------------------------------------------------------------
// DlqProducer — 将失败消息发送到死信队列
// ---------------------------------------------------------------------------

/// DLQ 生产者
///
/// 发送失败时返回错误，调用方此时不应提交 offset，由 broker 重新投递原消息。
#[derive(Clone)]
pub struct DlqProducer {
    publisher: Arc<dyn MessagePublisher>,
    source_service: String,
}

impl DlqProducer {
    pub fn new(publisher: Arc<dyn MessagePublisher>, source_service: &str) -> Self {
        Self {
            publisher,
            source_service: source_service.to_string(),
        }
    }

    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    /// 发送死信，使用原消息的 key（无 key 时用 message_id）保持分区一致
    pub async fn send(&self, dlq_msg: &DeadLetterMessage) -> Result<()> {
        let payload = serde_json::to_vec(dlq_msg)?;
        let key = dlq_msg.key.as_deref().unwrap_or(&dlq_msg.message_id);
        let topic = dlq_msg.target_topic();

        self.publisher.publish(&topic, key, &payload).await?;

        warn!(
            message_id = %dlq_msg.message_id,
            source_topic = %dlq_msg.source_topic,
            dlq_topic = %topic,
            error_kind = %dlq_msg.error_kind,
            retry_count = dlq_msg.retry_count,
            error = %dlq_msg.error,
            "消息已发送到死信队列"
        );
        crate::observability::metrics::record_dlq_message(&dlq_msg.source_topic, &dlq_msg.error_kind);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
