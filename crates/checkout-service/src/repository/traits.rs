//! 仓储 Trait 定义

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{CommitResult, IdempotencyRecord, PendingCheckout};

/// 结算存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckoutStore: Send + Sync {
    /// 查询未过期的幂等记录，已过期视为不存在
    async fn find_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// 原子提交：分配订单号、预占库存、写 Outbox、写幂等记录
    ///
    /// 幂等键的写入是并发请求的串行化点，输掉竞争时整笔回滚并返回 `KeyTaken`。
    async fn commit_checkout(&self, checkout: &PendingCheckout) -> Result<CommitResult>;

    /// 删除已过期的幂等记录，返回删除条数
    async fn delete_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn health_check(&self) -> Result<()>;
}
