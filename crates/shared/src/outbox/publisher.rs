//! Outbox 投递 Worker
//!
//! 固定间隔轮询 Outbox，也可在本地事务提交后通过 `notifier()` 立即唤醒。
//! 每轮认领一批事件，按聚合 ID 作为消息 key 发送：
//! - 成功：标记 PUBLISHED
//! - 失败：尝试次数 +1，按指数退避推迟下次投递；达到上限标记 FAILED
//!
//! 认领时同一聚合只会取到最早的 PENDING 事件，聚合内严格按创建顺序投递。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use super::{OutboxStatus, OutboxStore};
use crate::config::OutboxConfig;
use crate::error::Result;
use crate::kafka::MessagePublisher;
use crate::observability::metrics;
use crate::retry::RetryPolicy;

/// 投递器配置
#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub backoff: RetryPolicy,
    pub claim_lease: chrono::Duration,
}

impl From<&OutboxConfig> for OutboxPublisherConfig {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_attempts.max(1),
            backoff: RetryPolicy::default().with_delays(
                Duration::from_millis(config.initial_backoff_ms),
                Duration::from_millis(config.max_backoff_ms),
            ),
            claim_lease: chrono::Duration::seconds(config.claim_lease_seconds.max(1)),
        }
    }
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self::from(&OutboxConfig::default())
    }
}

/// 单轮投递统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Outbox 投递器
pub struct OutboxPublisher {
    name: String,
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    config: OutboxPublisherConfig,
    notify: Arc<Notify>,
}

impl OutboxPublisher {
    /// `name` 用于日志和指标，如 "checkout_outbox"
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn MessagePublisher>,
        config: OutboxPublisherConfig,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            publisher,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    /// 用于在本地事务提交后唤醒投递器
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// 主循环：直到收到关闭信号
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker = %self.name,
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Outbox 投递器已启动"
        );

        loop {
            let full_batch = match self.publish_batch().await {
                Ok(report) => {
                    if report.claimed > 0 {
                        info!(worker = %self.name, ?report, "Outbox 批次处理完成");
                    }
                    report.claimed as i64 >= self.config.batch_size
                }
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Outbox 批次处理出错");
                    false
                }
            };

            if let Ok(pending) = self.store.count_pending().await {
                metrics::set_outbox_pending(&self.name, pending);
            }
            metrics::set_worker_last_run(&self.name);

            // 满批说明可能还有积压，立即进入下一轮
            if full_batch {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.notify.notified() => {
                    debug!(worker = %self.name, "Outbox 投递器被唤醒");
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker = %self.name, "Outbox 投递器已退出");
    }

    /// 处理一批事件
    pub async fn publish_batch(&self) -> Result<BatchReport> {
        let events = self
            .store
            .claim_batch(self.config.batch_size, self.config.claim_lease)
            .await?;

        let mut report = BatchReport {
            claimed: events.len(),
            ..Default::default()
        };

        for event in events {
            let payload = serde_json::to_vec(&event.payload)?;
            match self
                .publisher
                .publish(&event.topic, &event.aggregate_id, &payload)
                .await
            {
                Ok(()) => {
                    self.store.mark_published(event.id).await?;
                    metrics::record_outbox_event(&event.event_type, "published");
                    debug!(
                        worker = %self.name,
                        event_id = %event.id,
                        event_type = %event.event_type,
                        aggregate_id = %event.aggregate_id,
                        "Outbox 事件已投递"
                    );
                    report.published += 1;
                }
                Err(e) => {
                    let attempt = event.attempt_count.max(0) as u32;
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

                    let status = self
                        .store
                        .record_failure(
                            event.id,
                            &e.to_string(),
                            next_attempt_at,
                            self.config.max_attempts,
                        )
                        .await?;

                    if status == OutboxStatus::Failed {
                        error!(
                            worker = %self.name,
                            event_id = %event.id,
                            event_type = %event.event_type,
                            aggregate_id = %event.aggregate_id,
                            attempts = event.attempt_count + 1,
                            error = %e,
                            "Outbox 事件重试耗尽，已标记为 FAILED，需要人工处理"
                        );
                        metrics::record_outbox_event(&event.event_type, "failed");
                        report.failed += 1;
                    } else {
                        warn!(
                            worker = %self.name,
                            event_id = %event.id,
                            attempts = event.attempt_count + 1,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "Outbox 事件投递失败，稍后重试"
                        );
                        metrics::record_outbox_event(&event.event_type, "retry");
                        report.retried += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}
