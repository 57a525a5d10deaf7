//! 支付完成处理
//!
//! 编排器的结果和消费到的 PaymentCompleted 事件都经这里落库，
//! 以完成事件的 eventId 去重，保证每笔交易只写入一次终态。

use std::sync::Arc;

use shop_shared::events::PaymentCompletedEvent;
use shop_shared::observability::metrics;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{FinalizeResult, PaymentOutcome};
use crate::repository::OrderRepository;

pub struct PaymentCompletionHandler {
    repository: Arc<dyn OrderRepository>,
    outbox_notify: Option<Arc<Notify>>,
}

impl PaymentCompletionHandler {
    pub fn new(repository: Arc<dyn OrderRepository>) -> Self {
        Self {
            repository,
            outbox_notify: None,
        }
    }

    /// 落库后唤醒订单侧 Outbox 投递器
    pub fn with_outbox_notify(mut self, notify: Arc<Notify>) -> Self {
        self.outbox_notify = Some(notify);
        self
    }

    pub async fn apply(&self, outcome: &PaymentOutcome) -> Result<FinalizeResult> {
        let result = self.repository.finalize_payment(outcome).await?;

        match &result {
            FinalizeResult::Applied {
                status,
                transaction,
            } => {
                info!(
                    order_id = %outcome.order_id,
                    event_id = %outcome.event_id,
                    order_status = %status,
                    payment_status = transaction.status.as_str(),
                    attempt_count = transaction.attempt_count,
                    "支付结果已应用"
                );
                metrics::record_payment_outcome(transaction.status.as_str());
                if outcome.publish
                    && let Some(notify) = &self.outbox_notify
                {
                    notify.notify_one();
                }
            }
            FinalizeResult::Duplicate => {
                debug!(event_id = %outcome.event_id, "支付完成事件已处理，跳过");
            }
            FinalizeResult::AlreadySettled { status } => {
                warn!(
                    order_id = %outcome.order_id,
                    event_id = %outcome.event_id,
                    payment_status = status.as_str(),
                    "支付交易已是终态，忽略新的结果"
                );
            }
        }

        Ok(result)
    }

    /// 处理消费到的 PaymentCompleted 事件
    ///
    /// 本服务发出的事件在落库时已登记过 eventId，这里会直接判为重复；
    /// 只有交易仍为 PENDING 时才按事件内容补写终态，且不再重复发布。
    pub async fn reconcile(&self, event: &PaymentCompletedEvent) -> Result<FinalizeResult> {
        self.apply(&PaymentOutcome::from_event(event)).await
    }
}
