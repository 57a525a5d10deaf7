//! 重试策略与执行器
//!
//! 提供带抖动的指数退避重试机制，用于瞬时故障（网络抖动、下游超时等）的自动恢复。
//! 业务逻辑错误（如参数无效、支付被拒）不应被重试，由调用方通过 `is_retryable` 闭包控制。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// RetryPolicy — 重试策略配置
// ---------------------------------------------------------------------------

/// 重试策略配置
///
/// 使用指数退避避免重试风暴：首次失败等 1 秒，第 2 次等 2 秒，
/// 第 3 次等 4 秒...直到达到最大间隔或最大重试次数。
/// `jitter` 大于 0 时在基础延迟上随机浮动，避免大量调用方同时重试。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 首次重试前的等待时间
    pub initial_delay: Duration,
    /// 退避时间上限
    pub max_delay: Duration,
    /// 每次重试的退避倍数
    pub multiplier: f64,
    /// 抖动比例，取值 [0, 1]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// 默认策略：最多重试 3 次，初始等待 1 秒，最大等待 30 秒，倍数 2.0，无抖动
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// 按“总尝试次数”构造策略，`max_attempts` 包含首次执行
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_retries: max_attempts.saturating_sub(1),
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// 计算第 N 次重试的基础等待时间（attempt 从 0 开始，不含抖动）
    ///
    /// 公式: initial_delay * multiplier^attempt，结果不超过 max_delay。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// 计算带抖动的等待时间，落在 `base * (1 ± jitter)` 区间内，且不超过 max_delay
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor).min(self.max_delay)
    }

    /// 是否应继续重试
    ///
    /// attempt 表示已经重试的次数，当 attempt < max_retries 时返回 true。
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

// ---------------------------------------------------------------------------
// retry_with_policy — 带重试的异步执行器
// ---------------------------------------------------------------------------

/// 带重试的异步执行器
///
/// 对任意异步操作应用重试策略。仅在 `is_retryable` 返回 true 时重试，
/// 其余错误直接向上传播。
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    warn!(
                        operation = operation_name,
                        error = %err,
                        "操作失败且不可重试，直接返回错误"
                    );
                    return Err(err);
                }

                if !policy.should_retry(attempt) {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_retries = policy.max_retries,
                        error = %err,
                        "已达最大重试次数，放弃重试"
                    );
                    return Err(err);
                }

                let delay = policy.jittered_delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，将在退避后重试"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShopError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_with_max_attempts() {
        assert_eq!(RetryPolicy::with_max_attempts(3).max_retries, 2);
        assert_eq!(RetryPolicy::with_max_attempts(1).max_retries, 0);
        assert_eq!(RetryPolicy::with_max_attempts(0).max_retries, 0);
    }

    #[test]
    fn test_delay_for_attempt_exponential_backoff() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::with_max_attempts(11)
            .with_delays(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        // 8s 受限于 max_delay
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jittered_delay_stays_in_bounds() {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_millis(1000), Duration::from_secs(60))
            .with_jitter(0.2);

        for _ in 0..200 {
            let delay = policy.jittered_delay(1);
            assert!(delay >= Duration::from_millis(1600), "{:?}", delay);
            assert!(delay <= Duration::from_millis(2400), "{:?}", delay);
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_secs(1), Duration::from_secs(2))
            .with_jitter(0.5);

        for _ in 0..100 {
            assert!(policy.jittered_delay(5) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn test_retry_with_policy_succeeds_first_try() {
        let policy = RetryPolicy::default();
        let call_count = Arc::new(AtomicU32::new(0));
        let counter = call_count.clone();

        let result = retry_with_policy(
            &policy,
            "test_op",
            |_: &ShopError| true,
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ShopError>(42)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_policy_succeeds_after_retries() {
        let policy = RetryPolicy::with_max_attempts(4).with_jitter(0.2);
        let call_count = Arc::new(AtomicU32::new(0));
        let counter = call_count.clone();

        let result = retry_with_policy(
            &policy,
            "test_op",
            ShopError::is_retryable,
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ShopError::Kafka("模拟瞬时故障".to_string()))
                    } else {
                        Ok(99)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 99);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_policy_exhausts_retries() {
        let policy = RetryPolicy::with_max_attempts(3);
        let call_count = Arc::new(AtomicU32::new(0));
        let counter = call_count.clone();

        let result: Result<i32, ShopError> = retry_with_policy(
            &policy,
            "test_op",
            ShopError::is_retryable,
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ShopError::Kafka("持续故障".to_string()))
                }
            },
        )
        .await;

        assert!(result.is_err());
        // 首次执行 + 2 次重试 = 3 次调用
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let policy = RetryPolicy::default();
        let call_count = Arc::new(AtomicU32::new(0));
        let counter = call_count.clone();

        let result: Result<(), ShopError> = retry_with_policy(
            &policy,
            "test_op",
            ShopError::is_retryable,
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ShopError::Validation("字段缺失".to_string()))
                }
            },
        )
        .await;

        assert!(matches!(result, Err(ShopError::Validation(_))));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }
}
