//! 可观测性模块集成测试
//!
//! 测试 metrics 记录函数、middleware 和配置默认值。

// ============================================================================
// 指标记录测试
// ============================================================================

mod metrics_tests {
    use shop_shared::observability::metrics::{
        record_checkout, record_consumed_event, record_dlq_message, record_http_request,
        record_outbox_event, record_payment_attempt, record_payment_outcome, set_outbox_pending,
        set_worker_last_run,
    };

    #[test]
    fn test_record_http_request() {
        // 未安装 recorder 时记录指标是空操作，不应 panic
        record_http_request("POST", "/api/v1/checkout", 200, 0.05);
        record_http_request("POST", "/api/v1/checkout", 409, 0.01);
        record_http_request("GET", "/health", 503, 0.25);
    }

    #[test]
    fn test_record_pipeline_metrics() {
        record_checkout("created");
        record_checkout("replayed");
        record_checkout("conflict");
        record_outbox_event("ORDER_CREATED", "published");
        record_outbox_event("PAYMENT_COMPLETED", "retry");
        set_outbox_pending("checkout_outbox", 12);
        record_consumed_event("orders.created", "processed");
        record_consumed_event("orders.created", "duplicate");
        record_dlq_message("orders.created", "VALIDATION_ERROR");
    }

    #[test]
    fn test_record_payment_metrics() {
        record_payment_attempt("success", 0.12);
        record_payment_attempt("timeout", 5.0);
        record_payment_outcome("SUCCESS");
        record_payment_outcome("FAILED");
        set_worker_last_run("payment_recovery");
    }
}

// ============================================================================
// 中间件测试
// ============================================================================

mod middleware_tests {
    use axum::{Router, body::Body, http::Request, middleware, routing::get};
    use shop_shared::observability::middleware::{
        REQUEST_ID_HEADER, RequestId, http_tracing, request_id,
    };
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(middleware::from_fn(http_tracing))
            .layer(middleware::from_fn(request_id))
    }

    #[test]
    fn test_request_id_creation() {
        let id = RequestId("test-id-123".to_string());
        assert_eq!(id.as_str(), "test-id-123");
        assert_eq!(id.clone().as_str(), "test-id-123");
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header(REQUEST_ID_HEADER, "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");
    }

    #[tokio::test]
    async fn test_request_id_is_generated_when_missing() {
        let response = app()
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let generated = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(generated).is_ok());
    }
}

// ============================================================================
// 配置测试
// ============================================================================

mod config_tests {
    use shop_shared::config::{AppConfig, ObservabilityConfig};

    #[test]
    fn test_default_observability_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, "pretty");
        assert!(config.metrics_enabled);
    }

    #[test]
    fn test_default_app_config_is_runnable() {
        let config = AppConfig::default();
        assert_eq!(config.outbox.max_attempts, 5);
        assert_eq!(config.idempotency.ttl_hours, 24);
        assert_eq!(config.payment.max_attempts, 3);
        assert_eq!(config.payment.circuit_breaker.window_size, 10);
    }
}

// ============================================================================
// Guard 测试
// ============================================================================

mod guard_tests {
    use shop_shared::observability::ObservabilityGuard;

    #[test]
    fn test_empty_guard() {
        // 创建和销毁空 guard 不应 panic
        for _ in 0..3 {
            let guard = ObservabilityGuard::empty();
            drop(guard);
        }
    }
}
