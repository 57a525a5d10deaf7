//! 内存版 Outbox，用于测试和本地运行

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{NewOutboxEvent, OutboxEvent, OutboxStatus, OutboxStore, truncate_error};
use crate::error::{Result, ShopError};

/// Outbox 表的内存实现，行按插入（创建）顺序保存
#[derive(Debug, Default)]
pub struct OutboxTable {
    rows: Vec<OutboxEvent>,
}

impl OutboxTable {
    pub fn insert(&mut self, event: NewOutboxEvent, now: DateTime<Utc>) {
        self.rows.push(event.into_row(now));
    }

    pub fn rows(&self) -> &[OutboxEvent] {
        &self.rows
    }

    pub fn claim(
        &mut self,
        limit: usize,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Vec<OutboxEvent> {
        // 已出现过 PENDING 行的聚合，后续行需等待它先完成
        let mut blocked: HashSet<String> = HashSet::new();
        let mut claimed = Vec::new();

        for row in self.rows.iter_mut() {
            if row.status != OutboxStatus::Pending {
                continue;
            }
            let first_for_aggregate = blocked.insert(row.aggregate_id.clone());
            if claimed.len() >= limit || !first_for_aggregate {
                continue;
            }
            let due = row.next_attempt_at <= now;
            let free = row.claimed_until.is_none_or(|until| until < now);
            if due && free {
                row.claimed_until = Some(now + lease);
                claimed.push(row.clone());
            }
        }

        claimed
    }

    pub fn mark_published(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let row = self.find_mut(id)?;
        if row.status == OutboxStatus::Pending {
            row.status = OutboxStatus::Published;
            row.published_at = Some(now);
            row.last_attempt_at = Some(now);
            row.claimed_until = None;
        }
        Ok(())
    }

    pub fn record_failure(
        &mut self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<OutboxStatus> {
        let row = self.find_mut(id)?;
        if row.status != OutboxStatus::Pending {
            return Ok(row.status);
        }
        row.attempt_count += 1;
        row.last_error = Some(truncate_error(error));
        row.last_attempt_at = Some(now);
        row.claimed_until = None;
        if row.attempt_count >= max_attempts {
            row.status = OutboxStatus::Failed;
        } else {
            row.next_attempt_at = next_attempt_at;
        }
        Ok(row.status)
    }

    pub fn count_pending(&self) -> i64 {
        self.rows
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending)
            .count() as i64
    }

    fn find_mut(&mut self, id: Uuid) -> Result<&mut OutboxEvent> {
        self.rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ShopError::NotFound {
                entity: "OutboxEvent".to_string(),
                id: id.to_string(),
            })
    }
}

/// 可共享的内存 Outbox 存储
///
/// 服务的内存仓储持有同一个实例，在业务写入的临界区内调用 `lock()` 追加事件。
#[derive(Debug, Clone, Default)]
pub struct MemoryOutboxStore {
    table: Arc<Mutex<OutboxTable>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, OutboxTable> {
        self.table.lock()
    }

    /// 当前所有行的快照
    pub fn snapshot(&self) -> Vec<OutboxEvent> {
        self.table.lock().rows().to_vec()
    }

    /// 测试辅助：让退避中的行立即到期
    pub fn make_all_due(&self) {
        let now = Utc::now();
        for row in self.table.lock().rows.iter_mut() {
            row.next_attempt_at = now;
            row.claimed_until = None;
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn claim_batch(&self, limit: i64, lease: chrono::Duration) -> Result<Vec<OutboxEvent>> {
        Ok(self
            .table
            .lock()
            .claim(limit.max(0) as usize, Utc::now(), lease))
    }

    async fn mark_published(&self, id: Uuid) -> Result<()> {
        self.table.lock().mark_published(id, Utc::now())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<OutboxStatus> {
        self.table
            .lock()
            .record_failure(id, error, Utc::now(), next_attempt_at, max_attempts)
    }

    async fn count_pending(&self) -> Result<i64> {
        Ok(self.table.lock().count_pending())
    }
}
