//! Outbox 模式
//!
//! 领域事件与产生它的业务变更写在同一个事务里（`outbox_events` 表），
//! 由后台投递器异步发送到 Kafka。broker 不可用只会推迟投递，不会丢失事件。
//!
//! 状态只会单向推进：PENDING → PUBLISHED，或重试耗尽后 PENDING → FAILED。

mod memory;
mod postgres;
mod publisher;

pub use memory::{MemoryOutboxStore, OutboxTable};
pub use postgres::PgOutboxStore;
pub use publisher::{BatchReport, OutboxPublisher, OutboxPublisherConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::events::DomainEvent;

/// 失败原因最多保留的字符数
pub const MAX_ERROR_LEN: usize = 500;

/// Outbox 事件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Published,
    /// 重试耗尽，等待人工处理
    Failed,
}

/// Outbox 表中的一行
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// 退避期内不会被认领
    pub next_attempt_at: DateTime<Utc>,
    /// 认领租约，过期后其他投递器可重新认领
    pub claimed_until: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

/// 待写入 Outbox 的事件
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    /// 与事件的 eventId 相同
    pub id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self> {
        let event_type = event.event_type();
        Ok(Self {
            id: event.event_id(),
            aggregate_id: event.aggregate_id(),
            event_type: event_type.as_str().to_string(),
            topic: event_type.topic().to_string(),
            payload: serde_json::to_value(event)?,
        })
    }

    /// 转为刚插入时的行
    pub fn into_row(self, now: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id: self.id,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            topic: self.topic,
            payload: self.payload,
            status: OutboxStatus::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            last_attempt_at: None,
            next_attempt_at: now,
            claimed_until: None,
            published_at: None,
        }
    }
}

/// 投递器使用的 Outbox 存储能力
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 认领一批可投递的事件，按创建时间排序
    ///
    /// 可投递：PENDING、已过退避时间、未被其他投递器持有租约，
    /// 且同一聚合没有更早的 PENDING 事件。
    async fn claim_batch(&self, limit: i64, lease: chrono::Duration) -> Result<Vec<OutboxEvent>>;

    async fn mark_published(&self, id: Uuid) -> Result<()>;

    /// 记录一次投递失败，返回更新后的状态
    ///
    /// 失败次数达到 `max_attempts` 时置为 FAILED，否则保持 PENDING 并推迟到 `next_attempt_at`。
    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<OutboxStatus>;

    async fn count_pending(&self) -> Result<i64>;
}

/// 截断错误信息，按字符边界截取
pub fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_LEN).collect()
}
