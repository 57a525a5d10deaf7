//! 结算编排服务
//!
//! 处理结算请求的核心流程：
//! - 幂等检查（同 key 同请求体返回缓存响应，不同请求体返回冲突）
//! - 构建订单草稿
//! - 单事务写入订单号、库存预占、OrderCreated Outbox 事件和幂等记录
//!
//! ## 结算流程
//!
//! 1. 参数校验 -> 2. 幂等检查 -> 3. 构建草稿 -> 4. 事务提交 -> 5. 唤醒投递器
//!
//! 并发的首次请求在幂等键写入处串行化，失败方按缓存命中重新读取。

use std::sync::Arc;

use shop_shared::error::ShopError;
use shop_shared::observability::metrics;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::draft::OrderDraftBuilder;
use crate::error::{CheckoutError, Result};
use crate::models::{
    CheckoutOutcome, CheckoutRequest, CommitResult, IdempotencyRecord, MAX_IDEMPOTENCY_KEY_LEN,
    PendingCheckout,
};
use crate::repository::CheckoutStore;

pub struct CheckoutService {
    store: Arc<dyn CheckoutStore>,
    drafts: Arc<dyn OrderDraftBuilder>,
    idempotency_ttl: chrono::Duration,
    outbox_notify: Option<Arc<Notify>>,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        drafts: Arc<dyn OrderDraftBuilder>,
        idempotency_ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            drafts,
            idempotency_ttl,
            outbox_notify: None,
        }
    }

    /// 提交后立即唤醒 Outbox 投递器
    pub fn with_outbox_notify(mut self, notify: Arc<Notify>) -> Self {
        self.outbox_notify = Some(notify);
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckoutStore> {
        &self.store
    }

    /// 结算
    #[instrument(skip(self, request), fields(idempotency_key = %key, cart_id = %request.cart_id))]
    pub async fn checkout(&self, key: &str, request: CheckoutRequest) -> Result<CheckoutOutcome> {
        let result = self.checkout_inner(key, request).await;

        let outcome = match &result {
            Ok(o) if o.replayed => "replayed",
            Ok(_) => "created",
            Err(CheckoutError::Shared(ShopError::IdempotencyConflict { .. })) => "conflict",
            Err(e) if e.is_retryable() => "error",
            Err(_) => "rejected",
        };
        metrics::record_checkout(outcome);

        result
    }

    async fn checkout_inner(&self, key: &str, request: CheckoutRequest) -> Result<CheckoutOutcome> {
        // 1. 参数校验
        let key = validate_key(key)?;
        request.validate()?;
        let fingerprint = request.fingerprint()?;

        // 2. 幂等检查
        if let Some(record) = self.store.find_idempotency(key).await? {
            return replay_or_conflict(key, &fingerprint, &record);
        }

        // 3. 构建草稿
        let items = self.drafts.build_draft(request.cart_id).await?;
        if items.is_empty() {
            return Err(CheckoutError::EmptyCart(request.cart_id));
        }

        let pending = PendingCheckout {
            idempotency_key: key.to_string(),
            fingerprint: fingerprint.clone(),
            order_id: Uuid::now_v7(),
            correlation_id: format!("checkout-{}", Uuid::new_v4()),
            cart_id: request.cart_id,
            customer: request.customer,
            items,
            idempotency_ttl: self.idempotency_ttl,
        };

        // 4. 事务提交
        match self.store.commit_checkout(&pending).await? {
            CommitResult::Committed(outcome) => {
                info!(
                    order_id = %outcome.response.order_id,
                    order_number = %outcome.response.order_number,
                    correlation_id = %pending.correlation_id,
                    "结算成功，OrderCreated 事件已写入 Outbox"
                );
                // 5. 唤醒投递器
                if let Some(notify) = &self.outbox_notify {
                    notify.notify_one();
                }
                Ok(outcome)
            }
            CommitResult::KeyTaken => {
                // 并发请求抢先提交，按缓存命中处理
                let record = self.store.find_idempotency(key).await?.ok_or_else(|| {
                    ShopError::Internal(format!("幂等键 {key} 写入冲突后未找到记录"))
                })?;
                replay_or_conflict(key, &fingerprint, &record)
            }
        }
    }
}

/// 返回去掉首尾空白后的键，存储与查询都使用它
fn validate_key(key: &str) -> Result<&str> {
    let key = key.trim();
    if key.is_empty() {
        return Err(CheckoutError::MissingIdempotencyKey);
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(CheckoutError::validation(format!(
            "Idempotency-Key 长度不能超过 {MAX_IDEMPOTENCY_KEY_LEN}"
        )));
    }
    Ok(key)
}

fn replay_or_conflict(
    key: &str,
    fingerprint: &str,
    record: &IdempotencyRecord,
) -> Result<CheckoutOutcome> {
    if record.request_fingerprint != fingerprint {
        warn!(
            idempotency_key = %key,
            "幂等键已被用于不同的请求体"
        );
        return Err(ShopError::IdempotencyConflict {
            key: key.to_string(),
        }
        .into());
    }

    info!(idempotency_key = %key, "幂等重放，返回缓存响应");
    record.replay()
}
