//! 内存版结算存储，用于测试和本地运行
//!
//! 先在锁内完成全部校验，再统一写入，保证与 Postgres 事务相同的全有或全无语义。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use shop_shared::outbox::MemoryOutboxStore;
use uuid::Uuid;

use super::CheckoutStore;
use crate::error::{CheckoutError, Result};
use crate::models::{
    CommitResult, IdempotencyRecord, PendingCheckout, check_daily_sequence, format_order_number,
};

#[derive(Debug, Default)]
struct CheckoutState {
    idempotency: HashMap<String, IdempotencyRecord>,
    stock: HashMap<Uuid, i32>,
    sequences: HashMap<NaiveDate, i32>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCheckoutStore {
    state: Arc<Mutex<CheckoutState>>,
    outbox: MemoryOutboxStore,
}

impl MemoryCheckoutStore {
    /// `outbox` 与投递器共享同一个实例
    pub fn new(outbox: MemoryOutboxStore) -> Self {
        Self {
            state: Arc::default(),
            outbox,
        }
    }

    pub fn outbox(&self) -> &MemoryOutboxStore {
        &self.outbox
    }

    pub fn set_stock(&self, product_id: Uuid, quantity: i32) {
        self.state.lock().stock.insert(product_id, quantity);
    }

    pub fn stock(&self, product_id: Uuid) -> i32 {
        self.state.lock().stock.get(&product_id).copied().unwrap_or(0)
    }

    /// 预置当日序列，用于测试订单号上限
    pub fn set_sequence(&self, date: NaiveDate, last_value: i32) {
        self.state.lock().sequences.insert(date, last_value);
    }

    pub fn idempotency_count(&self) -> usize {
        self.state.lock().idempotency.len()
    }

    /// 测试辅助：直接写入一条幂等记录
    pub fn insert_record(&self, record: IdempotencyRecord) {
        self.state
            .lock()
            .idempotency
            .insert(record.idempotency_key.clone(), record);
    }
}

#[async_trait]
impl CheckoutStore for MemoryCheckoutStore {
    async fn find_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let now = Utc::now();
        Ok(self
            .state
            .lock()
            .idempotency
            .get(key)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn commit_checkout(&self, checkout: &PendingCheckout) -> Result<CommitResult> {
        let now = Utc::now();
        let today = now.date_naive();

        let mut state = self.state.lock();
        let mut outbox = self.outbox.lock();

        if let Some(existing) = state.idempotency.get(&checkout.idempotency_key)
            && !existing.is_expired(now)
        {
            return Ok(CommitResult::KeyTaken);
        }

        let sequence = state.sequences.get(&today).copied().unwrap_or(0) + 1;
        check_daily_sequence(today, sequence)?;

        let reservations = checkout.reservations();
        for (product_id, quantity) in &reservations {
            let available = state.stock.get(product_id).copied().unwrap_or(0);
            if available < *quantity {
                return Err(CheckoutError::InsufficientStock {
                    product_id: *product_id,
                    requested: *quantity,
                    available,
                });
            }
        }

        let order_number = format_order_number(today, sequence);
        let finalized = checkout.finalize(&order_number, now)?;

        // 校验全部通过，开始写入
        state.sequences.insert(today, sequence);
        for (product_id, quantity) in reservations {
            if let Some(stock) = state.stock.get_mut(&product_id) {
                *stock -= quantity;
            }
        }
        outbox.insert(finalized.outbox, now);
        state
            .idempotency
            .insert(finalized.record.idempotency_key.clone(), finalized.record);

        Ok(CommitResult::Committed(finalized.outcome))
    }

    async fn delete_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.idempotency.len();
        state.idempotency.retain(|_, r| !r.is_expired(now));
        Ok((before - state.idempotency.len()) as u64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
