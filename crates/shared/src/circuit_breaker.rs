//! 熔断器 (Circuit Breaker) 模块
//!
//! 基于滑动窗口失败率的三态熔断器，用于保护对外部支付服务的调用。
//! 窗口内调用数达到最小样本且失败率超过阈值时跳闸（Open），
//! 冷却期结束后允许有限的探测请求（Half-Open），探测全部成功则恢复（Closed），
//! 任一探测失败则重新跳闸。
//!
//! 计时使用 `tokio::time::Instant`，测试中可通过 `tokio::time::pause()` +
//! `advance()` 快进冷却期。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerSettings;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// 正常放行所有请求
    Closed,
    /// 断路器跳闸，拒绝所有请求
    Open,
    /// 允许少量探测请求，成功则恢复
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// 熔断器配置
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 滑动窗口大小（按调用次数计）
    pub window_size: usize,
    /// 计算失败率前窗口内至少需要的调用数
    pub minimum_calls: usize,
    /// 失败率阈值，0.5 表示 50%
    pub failure_rate_threshold: f64,
    /// 跳闸后的冷却时长
    pub open_duration: Duration,
    /// 半开状态允许通过的探测请求数
    pub half_open_permits: u32,
    /// 熔断器名称，用于日志和指标区分不同的下游
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            minimum_calls: 5,
            failure_rate_threshold: 0.5,
            open_duration: Duration::from_secs(30),
            half_open_permits: 3,
            name: "default".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// 从配置文件中的熔断器段构建
    pub fn from_settings(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        Self {
            window_size: settings.window_size.max(1),
            minimum_calls: settings.minimum_calls.max(1),
            failure_rate_threshold: settings.failure_rate_threshold,
            open_duration: Duration::from_millis(settings.open_duration_ms),
            half_open_permits: settings.half_open_permits.max(1),
            name: name.into(),
        }
    }

    pub fn with_window(mut self, window_size: usize, minimum_calls: usize) -> Self {
        self.window_size = window_size.max(1);
        self.minimum_calls = minimum_calls.max(1);
        self
    }

    pub fn with_failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    pub fn with_half_open_permits(mut self, permits: u32) -> Self {
        self.half_open_permits = permits.max(1);
        self
    }
}

/// 熔断器内部状态，受 Mutex 保护
struct InnerState {
    state: CircuitState,
    /// Closed 状态下最近的调用结果，true 为失败
    window: VecDeque<bool>,
    /// Open 状态的起点
    opened_at: Option<Instant>,
    half_open_attempts: u32,
    half_open_successes: u32,
}

impl InnerState {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 / self.window.len() as f64
    }
}

/// 熔断器
///
/// 线程安全，可在多个任务间通过 Clone 共享同一份状态。
/// 典型用法：
/// ```ignore
/// let cb = CircuitBreaker::new(config);
/// match cb.call(|| gateway.charge(request)).await {
///     Ok(receipt) => ...,
///     Err(CircuitBreakerError::Open { .. }) => // 快速失败，未调用下游
///     Err(CircuitBreakerError::ServiceError(e)) => ...,
/// }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<InnerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            name = %config.name,
            window_size = config.window_size,
            minimum_calls = config.minimum_calls,
            failure_rate_threshold = config.failure_rate_threshold,
            open_duration_ms = config.open_duration.as_millis() as u64,
            half_open_permits = config.half_open_permits,
            "熔断器已创建"
        );

        Self {
            inner: Arc::new(Mutex::new(InnerState {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                half_open_attempts: 0,
                half_open_successes: 0,
            })),
            config: Arc::new(config),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// 获取当前状态（用于监控和日志）
    ///
    /// Open 状态在冷却期结束后报告为 HalfOpen，实际转换发生在下一次 `allow_request`。
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open && self.cool_down_elapsed(&inner) {
            return CircuitState::HalfOpen;
        }
        inner.state
    }

    /// 判断是否允许发起请求
    ///
    /// Closed：始终允许
    /// Open：冷却期结束则转为 HalfOpen 并占用一个探测名额，否则拒绝
    /// HalfOpen：在探测配额内允许
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.cool_down_elapsed(&inner) {
                    self.transition_to(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_attempts = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_permits {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// 记录调用成功
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => self.push_outcome(&mut inner, false),
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_permits {
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            // 跳闸期间发出的请求在跳闸前已获得许可，结果不再影响状态
            CircuitState::Open => {}
        }
    }

    /// 记录调用失败
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                self.push_outcome(&mut inner, true);
                if inner.window.len() >= self.config.minimum_calls
                    && inner.failure_rate() >= self.config.failure_rate_threshold
                {
                    let rate = inner.failure_rate();
                    self.transition_to(&mut inner, CircuitState::Open);
                    warn!(
                        name = %self.config.name,
                        failure_rate = rate,
                        "熔断器跳闸：窗口内失败率超过阈值，冷却期内请求将被直接拒绝"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // 半开状态下失败，立即重新跳闸
                self.transition_to(&mut inner, CircuitState::Open);
                warn!(name = %self.config.name, "熔断器探测失败，重新跳闸");
            }
            CircuitState::Open => {}
        }
    }

    /// 释放一次许可但不计入统计
    ///
    /// 用于不代表下游健康状况的失败（如业务拒绝），半开状态下归还探测名额。
    pub fn record_ignored(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.half_open_attempts > 0 {
            inner.half_open_attempts -= 1;
        }
    }

    /// 执行受熔断器保护的异步调用，所有错误都计为失败
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// 执行受熔断器保护的异步调用
    ///
    /// `counts_as_failure` 返回 false 的错误不计入失败率。
    /// 熔断器跳闸时直接返回 `Open`，不会调用 `f`。
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        f: F,
        counts_as_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        if !self.allow_request() {
            record_circuit_breaker_rejection(&self.config.name);
            return Err(CircuitBreakerError::Open {
                name: self.config.name.clone(),
            });
        }

        match f().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                if counts_as_failure(&e) {
                    self.record_failure();
                } else {
                    self.record_ignored();
                }
                Err(CircuitBreakerError::ServiceError(e))
            }
        }
    }

    fn cool_down_elapsed(&self, inner: &InnerState) -> bool {
        inner
            .opened_at
            .is_some_and(|opened_at| opened_at.elapsed() >= self.config.open_duration)
    }

    fn push_outcome(&self, inner: &mut InnerState, failed: bool) {
        if inner.window.len() >= self.config.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);
    }

    /// 状态转换（在锁内调用）
    fn transition_to(&self, inner: &mut InnerState, new_state: CircuitState) {
        let old_state = inner.state;
        inner.state = new_state;

        match new_state {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.window.clear();
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                inner.half_open_attempts = 0;
                info!(
                    name = %self.config.name,
                    permits = self.config.half_open_permits,
                    "熔断器进入半开状态：允许探测请求"
                );
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.window.clear();
                info!(name = %self.config.name, "熔断器恢复：下游服务已恢复正常");
            }
        }

        record_circuit_breaker_transition(&self.config.name, old_state, new_state);
    }
}

/// 熔断器错误
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// 熔断器跳闸，请求被拒绝
    Open { name: String },
    /// 底层服务调用失败
    ServiceError(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { name } => write!(f, "熔断器 '{}' 处于跳闸状态，请求被拒绝", name),
            Self::ServiceError(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::fmt::Display + std::fmt::Debug> std::error::Error for CircuitBreakerError<E> {}

// ─── Prometheus 指标 ─────────────────────────────────────────────────

fn record_circuit_breaker_transition(name: &str, from: CircuitState, to: CircuitState) {
    metrics::counter!(
        "circuit_breaker_transitions_total",
        "name" => name.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);

    let state_value = match to {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    metrics::gauge!("circuit_breaker_state", "name" => name.to_string()).set(state_value);
}

fn record_circuit_breaker_rejection(name: &str) {
    metrics::counter!("circuit_breaker_rejections_total", "name" => name.to_string())
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new("test")
            .with_window(4, 4)
            .with_failure_rate_threshold(0.5)
            .with_open_duration(Duration::from_secs(30))
            .with_half_open_permits(2)
    }

    fn trip(cb: &CircuitBreaker) {
        for _ in 0..4 {
            cb.record_failure();
        }
    }

    #[tokio::test]
    async fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::new(test_config());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[tokio::test]
    async fn test_does_not_trip_below_minimum_calls() {
        let cb = CircuitBreaker::new(test_config());

        // 3 次失败，样本数不足 4，不计算失败率
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_trips_when_failure_rate_reaches_threshold() {
        let cb = CircuitBreaker::new(test_config());

        cb.record_success();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        // 2/4 = 50%，达到阈值
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[tokio::test]
    async fn test_window_slides_out_old_failures() {
        let cb = CircuitBreaker::new(test_config().with_failure_rate_threshold(0.75));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_success();
        // 窗口 [F, F, S, S] 失败率 50%，未达到 75%
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_success();
        cb.record_failure();
        // 窗口 [S, S, S, F]，最早的两次失败已滑出
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_to_half_open_after_cool_down() {
        let cb = CircuitBreaker::new(test_config());
        trip(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!cb.allow_request());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_successes_close_circuit() {
        let cb = CircuitBreaker::new(test_config());
        trip(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(cb.allow_request());
        cb.record_success();
        assert!(cb.allow_request());
        cb.record_success();

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let cb = CircuitBreaker::new(test_config());
        trip(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(cb.allow_request());
        assert!(cb.allow_request());
        // 探测名额用尽
        assert!(!cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_trips_again() {
        let cb = CircuitBreaker::new(test_config());
        trip(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(cb.allow_request());
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());

        // 重新计时
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_wrapper_short_circuits_when_open() {
        let cb = CircuitBreaker::new(test_config());

        let result: Result<i32, CircuitBreakerError<String>> = cb.call(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);

        for _ in 0..4 {
            let _: Result<i32, CircuitBreakerError<String>> = cb
                .call(|| async { Err("service down".to_string()) })
                .await;
        }

        let invoked = std::sync::atomic::AtomicBool::new(false);
        let result: Result<i32, CircuitBreakerError<String>> = cb
            .call(|| async {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(42)
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_ignored_errors_do_not_trip() {
        let cb = CircuitBreaker::new(test_config());

        for _ in 0..6 {
            let _: Result<(), CircuitBreakerError<&str>> = cb
                .call_classified(|| async { Err("declined") }, |_| false)
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_from_settings() {
        let settings = CircuitBreakerSettings::default();
        let config = CircuitBreakerConfig::from_settings("payment-gateway", &settings);

        assert_eq!(config.name, "payment-gateway");
        assert_eq!(config.window_size, 10);
        assert_eq!(config.minimum_calls, 5);
        assert_eq!(config.open_duration, Duration::from_secs(30));
        assert_eq!(config.half_open_permits, 3);
    }

    #[test]
    fn test_display_circuit_breaker_error() {
        let err: CircuitBreakerError<String> = CircuitBreakerError::Open {
            name: "test".to_string(),
        };
        assert!(err.to_string().contains("跳闸"));

        let err: CircuitBreakerError<String> =
            CircuitBreakerError::ServiceError("connection refused".to_string());
        assert_eq!(err.to_string(), "connection refused");
    }
}
