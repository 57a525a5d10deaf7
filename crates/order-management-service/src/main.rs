//! 订单管理服务入口
//!
//! 后台运行 Kafka 消费者、支付恢复任务与 Outbox 投递器，HTTP 提供订单查询与状态变更。

use std::sync::Arc;
use std::time::Duration;

use order_management::{
    MIGRATOR, OrderEventConsumer, OrderEventHandler, OrderRepository, OrderService,
    PaymentCompletionHandler, PaymentOrchestrator, PaymentPolicy, PgOrderRepository,
    SimulatedPaymentGateway,
    http::{AppState, router},
    worker::PaymentRecoveryWorker,
};
use shop_shared::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    config::AppConfig,
    database::Database,
    dlq::DlqProducer,
    kafka::KafkaProducer,
    observability,
    outbox::{OutboxPublisher, OutboxPublisherConfig, PgOutboxStore},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("order-management-service")?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!(
        service = %config.service_name,
        environment = %config.environment,
        addr = %config.server_addr(),
        "Starting order-management-service"
    );

    // 初始化基础设施
    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations(&MIGRATOR).await?;
    }
    let producer = Arc::new(KafkaProducer::new(&config.kafka)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // PaymentCompleted 事件的 Outbox 投递器
    let publisher = OutboxPublisher::new(
        "order_outbox",
        Arc::new(PgOutboxStore::new(db.pool().clone())),
        producer.clone(),
        OutboxPublisherConfig::from(&config.outbox),
    );
    let outbox_notify = publisher.notifier();
    let publisher_handle = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { publisher.run(rx).await })
    };

    // 支付编排
    let repository: Arc<dyn OrderRepository> =
        Arc::new(PgOrderRepository::new(db.pool().clone()));
    let completion = Arc::new(
        PaymentCompletionHandler::new(repository.clone()).with_outbox_notify(outbox_notify),
    );
    let gateway = Arc::new(SimulatedPaymentGateway::new(
        Duration::from_millis(config.payment.simulated_latency_ms),
        config.payment.simulated_failure_rate,
    ));
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::from_settings(
        "payment_gateway",
        &config.payment.circuit_breaker,
    ));
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        repository.clone(),
        gateway,
        breaker,
        PaymentPolicy::from(&config.payment),
        completion.clone(),
    ));

    // 事件消费
    let handler = OrderEventHandler::new(
        repository.clone(),
        orchestrator.clone(),
        completion,
        DlqProducer::new(producer, &config.service_name),
        &config.consumer,
    );
    let consumer = OrderEventConsumer::new(&config, handler)?;
    let consumer_handle = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = consumer.run(rx).await {
                error!(error = %e, "订单事件消费者异常退出");
            }
        })
    };

    // 卡住的支付恢复
    let recovery_handle = {
        let worker =
            PaymentRecoveryWorker::new(repository.clone(), orchestrator, &config.payment.recovery);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(rx).await })
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = router(AppState {
        orders: Arc::new(OrderService::new(repository)),
        service_name: config.service_name.clone(),
    })
    .layer(cors);

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 未提交 offset 的消息会在下次启动时重新投递
    let _ = shutdown_tx.send(true);
    for (name, handle) in [
        ("consumer", consumer_handle),
        ("recovery", recovery_handle),
        ("outbox", publisher_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "后台任务异常退出");
        }
    }
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// 监听关闭信号（Ctrl+C 或 SIGTERM）
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
