//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    pub(crate) fn abort(self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册指标描述，出现在 /metrics 端点的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );

    metrics::describe_counter!("checkout_requests_total", "Checkout requests by outcome");
    metrics::describe_counter!(
        "outbox_events_total",
        "Outbox publish attempts by event type and outcome"
    );
    metrics::describe_gauge!("outbox_pending_events", "Outbox rows still pending publication");
    metrics::describe_counter!("consumer_events_total", "Consumed events by outcome");
    metrics::describe_counter!("dlq_messages_total", "Messages routed to dead-letter topics");
    metrics::describe_counter!("payment_attempts_total", "Payment gateway calls by outcome");
    metrics::describe_counter!("payment_outcomes_total", "Terminal payment outcomes");
    metrics::describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    metrics::describe_gauge!(
        "circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half_open, 2=open)"
    );
    metrics::describe_gauge!("worker_last_run_timestamp", "Last run of background workers");

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("指标服务监听于 {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("指标服务异常退出: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录 HTTP 请求
#[inline]
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str.clone()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str
    )
    .record(duration_secs);
}

/// 记录结算请求结果（created / replayed / conflict / rejected / error）
#[inline]
pub fn record_checkout(outcome: &str) {
    metrics::counter!("checkout_requests_total", "outcome" => outcome.to_string()).increment(1);
}

/// 记录 Outbox 投递结果（published / retry / failed）
#[inline]
pub fn record_outbox_event(event_type: &str, outcome: &str) {
    metrics::counter!(
        "outbox_events_total",
        "event_type" => event_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[inline]
pub fn set_outbox_pending(source: &str, pending: i64) {
    metrics::gauge!("outbox_pending_events", "source" => source.to_string()).set(pending as f64);
}

/// 记录消费结果（processed / duplicate / dead_lettered / retry）
#[inline]
pub fn record_consumed_event(topic: &str, outcome: &str) {
    metrics::counter!(
        "consumer_events_total",
        "topic" => topic.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_dlq_message(source_topic: &str, error_kind: &str) {
    metrics::counter!(
        "dlq_messages_total",
        "source_topic" => source_topic.to_string(),
        "error_kind" => error_kind.to_string()
    )
    .increment(1);
}

/// 记录单次支付网关调用（success / transient / permanent / timeout）
#[inline]
pub fn record_payment_attempt(outcome: &str, duration_secs: f64) {
    metrics::counter!("payment_attempts_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!("payment_attempt_duration_seconds", "outcome" => outcome.to_string())
        .record(duration_secs);
}

/// 记录支付终态（SUCCESS / FAILED）
#[inline]
pub fn record_payment_outcome(status: &str) {
    metrics::counter!("payment_outcomes_total", "status" => status.to_string()).increment(1);
}

/// 记录后台 Worker 最近一次运行时间
#[inline]
pub fn set_worker_last_run(worker: &str) {
    metrics::gauge!("worker_last_run_timestamp", "worker" => worker.to_string())
        .set(chrono::Utc::now().timestamp() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_http_request("POST", "/api/v1/checkout", 201, 0.1);
        record_checkout("created");
        record_outbox_event("ORDER_CREATED", "published");
        set_outbox_pending("checkout", 3);
        record_consumed_event("orders.created", "duplicate");
        record_dlq_message("orders.created", "VALIDATION_ERROR");
        record_payment_attempt("timeout", 5.0);
        record_payment_outcome("FAILED");
        set_worker_last_run("outbox_publisher");
    }
}
