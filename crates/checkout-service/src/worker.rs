//! 幂等记录清理 Worker
//!
//! 定期删除已过期（`expires_at <= now`）的幂等记录。
//! 过期记录在查询时已视为不存在，清理只是回收空间。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shop_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::Result;
use crate::repository::CheckoutStore;

pub struct IdempotencyCleanupWorker {
    store: Arc<dyn CheckoutStore>,
    interval: Duration,
}

impl IdempotencyCleanupWorker {
    pub fn new(store: Arc<dyn CheckoutStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// 主循环：直到收到关闭信号
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "幂等记录清理 Worker 已启动");

        loop {
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "清理过期幂等记录出错");
            }
            metrics::set_worker_last_run("idempotency_cleanup");

            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("幂等记录清理 Worker 已退出");
    }

    pub async fn sweep_once(&self) -> Result<u64> {
        let deleted = self.store.delete_expired_idempotency(Utc::now()).await?;
        if deleted > 0 {
            info!(deleted, "已清理过期幂等记录");
        }
        Ok(deleted)
    }
}
