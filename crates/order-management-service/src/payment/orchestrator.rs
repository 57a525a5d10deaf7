//! 支付编排
//!
//! 一次编排：CAS 把订单从 PENDING 改为 PROCESSING（抢到才继续），
//! 然后经 重试 → 熔断器 → 单次超时 三层策略调用网关，最后把唯一的终态
//! 交给完成处理器落库。
//!
//! 熔断器在重试之内：每次重试都要重新申请许可，跳闸后剩余的重试立即以
//! `CircuitOpen` 结束，不会再触达网关。`attempts` 只统计真正发出的调用。
//!
//! 扣款后的落库失败按存储错误重试；仍失败时订单停在 PROCESSING，
//! 由恢复任务在超出调用预算后以失败结算，不会再次扣款。

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use shop_shared::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use shop_shared::config::PaymentConfig;
use shop_shared::observability::metrics;
use shop_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::gateway::{PaymentGateway, PaymentReceipt, PaymentRequest};
use crate::error::{OrderError, PaymentError, Result};
use crate::models::{PaymentOutcome, PaymentStatus};
use crate::repository::OrderRepository;
use crate::service::PaymentCompletionHandler;
use crate::state_machine::{self, OrderStatus};

/// 单次调用超时与重试策略
#[derive(Debug, Clone)]
pub struct PaymentPolicy {
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl From<&PaymentConfig> for PaymentPolicy {
    fn from(config: &PaymentConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            retry: RetryPolicy::with_max_attempts(config.max_attempts)
                .with_delays(
                    Duration::from_millis(config.initial_backoff_ms),
                    Duration::from_millis(config.max_backoff_ms),
                )
                .with_multiplier(config.backoff_multiplier)
                .with_jitter(config.jitter_factor),
        }
    }
}

impl PaymentPolicy {
    /// 一次编排中网关调用最长可能耗时：每次调用的超时加上各次退避上限
    pub fn call_budget(&self) -> Duration {
        let calls = self.retry.max_retries + 1;
        let backoff: Duration = (0..self.retry.max_retries)
            .map(|attempt| {
                self.retry
                    .delay_for_attempt(attempt)
                    .mul_f64(1.0 + self.retry.jitter.max(0.0))
                    .min(self.retry.max_delay)
            })
            .sum();
        self.call_timeout * calls + backoff
    }
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self::from(&PaymentConfig::default())
    }
}

pub struct PaymentOrchestrator {
    repository: Arc<dyn OrderRepository>,
    gateway: Arc<dyn PaymentGateway>,
    breaker: CircuitBreaker,
    policy: PaymentPolicy,
    completion: Arc<PaymentCompletionHandler>,
}

impl PaymentOrchestrator {
    pub fn new(
        repository: Arc<dyn OrderRepository>,
        gateway: Arc<dyn PaymentGateway>,
        breaker: CircuitBreaker,
        policy: PaymentPolicy,
        completion: Arc<PaymentCompletionHandler>,
    ) -> Self {
        Self {
            repository,
            gateway,
            breaker,
            policy,
            completion,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn policy(&self) -> &PaymentPolicy {
        &self.policy
    }

    /// 在后台任务中发起支付，调用方不等待结果
    pub fn dispatch(self: &Arc<Self>, order_id: Uuid) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.attempt_payment(order_id).await {
                error!(order_id = %order_id, error = %e, "支付编排失败，等待恢复任务重新调度");
            }
        });
    }

    /// 为订单执行一次完整的支付编排
    ///
    /// 订单不在 PENDING 或 CAS 失败（其他调度者已抢到）时返回 `None`。
    pub async fn attempt_payment(&self, order_id: Uuid) -> Result<Option<PaymentOutcome>> {
        let order = self
            .repository
            .find_order(order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))?;
        let payment = self
            .repository
            .find_payment(order_id)
            .await?
            .ok_or(OrderError::PaymentNotFound(order_id))?;

        if order.status != OrderStatus::Pending || payment.status != PaymentStatus::Pending {
            debug!(
                order_id = %order_id,
                order_status = %order.status,
                payment_status = payment.status.as_str(),
                "订单不在待支付状态，跳过"
            );
            return Ok(None);
        }

        let next = state_machine::transition(order.status, OrderStatus::Processing)?;
        if !self
            .repository
            .update_order_status(order_id, order.status, next)
            .await?
        {
            debug!(order_id = %order_id, "其他调度者已开始支付，跳过");
            return Ok(None);
        }

        info!(
            order_id = %order_id,
            order_number = %order.order_number,
            amount = %payment.amount,
            "开始支付"
        );

        let request = PaymentRequest {
            order_id,
            order_number: order.order_number.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
        };
        let attempts = AtomicI32::new(0);
        let result = self.charge(&request, &attempts).await;
        let attempts = attempts.load(Ordering::SeqCst);

        let outcome = match result {
            Ok(receipt) => {
                PaymentOutcome::succeeded(order_id, receipt.external_transaction_id, attempts)
            }
            Err(e) => {
                warn!(
                    order_id = %order_id,
                    attempts,
                    error_kind = e.kind(),
                    error = %e,
                    "支付失败"
                );
                PaymentOutcome::failed(order_id, e.to_string(), attempts)
            }
        };

        self.finalize(&outcome).await?;
        Ok(Some(outcome))
    }

    /// 以失败结算停在 PROCESSING 的订单，不调用网关
    ///
    /// 扣款结果已无法确认，交易记为失败并留待人工对账。
    /// 订单已不是 PROCESSING 或交易已结算时返回 `None`。
    pub async fn expire_unsettled(&self, order_id: Uuid) -> Result<Option<PaymentOutcome>> {
        let order = self
            .repository
            .find_order(order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))?;
        let payment = self
            .repository
            .find_payment(order_id)
            .await?
            .ok_or(OrderError::PaymentNotFound(order_id))?;

        if order.status != OrderStatus::Processing || payment.status != PaymentStatus::Pending {
            return Ok(None);
        }

        error!(
            order_id = %order_id,
            order_number = %order.order_number,
            payment_id = %payment.id,
            amount = %payment.amount,
            "支付结果未落库，按失败结算，需人工核对网关扣款"
        );
        let outcome = PaymentOutcome::failed(order_id, "支付结果未确认：处理超时", 0);
        self.finalize(&outcome).await?;
        Ok(Some(outcome))
    }

    /// 落库按存储错误重试；以 eventId 去重，重复提交是安全的
    async fn finalize(&self, outcome: &PaymentOutcome) -> Result<()> {
        retry_with_policy(
            &self.policy.retry,
            "payment_finalize",
            OrderError::is_retryable,
            || self.completion.apply(outcome),
        )
        .await?;
        Ok(())
    }

    async fn charge(
        &self,
        request: &PaymentRequest,
        attempts: &AtomicI32,
    ) -> std::result::Result<PaymentReceipt, PaymentError> {
        retry_with_policy(
            &self.policy.retry,
            "payment_charge",
            PaymentError::is_retryable,
            || async move {
                self.breaker
                    .call_classified(
                        || self.charge_once(request, attempts),
                        PaymentError::counts_against_breaker,
                    )
                    .await
                    .map_err(|e| match e {
                        CircuitBreakerError::Open { name } => PaymentError::CircuitOpen(name),
                        CircuitBreakerError::ServiceError(e) => e,
                    })
            },
        )
        .await
    }

    /// 单次网关调用，超时视为可重试错误
    async fn charge_once(
        &self,
        request: &PaymentRequest,
        attempts: &AtomicI32,
    ) -> std::result::Result<PaymentReceipt, PaymentError> {
        attempts.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let call = self.gateway.charge(request);
        let result = match tokio::time::timeout(self.policy.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PaymentError::Timeout(self.policy.call_timeout)),
        };

        let label = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::record_payment_attempt(label, started.elapsed().as_secs_f64());

        result
    }
}
