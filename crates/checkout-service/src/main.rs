//! 结算服务入口
//!
//! 提供 `POST /api/v1/checkout`，后台运行 Outbox 投递器与幂等记录清理。

use std::sync::Arc;
use std::time::Duration;

use checkout_service::{
    CheckoutService, CheckoutStore, MIGRATOR, PgCartDraftBuilder, PgCheckoutStore,
    http::{AppState, router},
    worker::IdempotencyCleanupWorker,
};
use shop_shared::{
    config::AppConfig,
    database::Database,
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
    let config = AppConfig::load("checkout-service")?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!(
        service = %config.service_name,
        environment = %config.environment,
        addr = %config.server_addr(),
        "Starting checkout-service"
    );

    // 初始化基础设施
    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.run_migrations(&MIGRATOR).await?;
    }
    let producer = Arc::new(KafkaProducer::new(&config.kafka)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Outbox 投递器
    let publisher = OutboxPublisher::new(
        "checkout_outbox",
        Arc::new(PgOutboxStore::new(db.pool().clone())),
        producer,
        OutboxPublisherConfig::from(&config.outbox),
    );
    let outbox_notify = publisher.notifier();
    let publisher_handle = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { publisher.run(rx).await })
    };

    // 结算服务
    let store: Arc<dyn CheckoutStore> = Arc::new(PgCheckoutStore::new(db.pool().clone()));
    let service = CheckoutService::new(
        store.clone(),
        Arc::new(PgCartDraftBuilder::new(db.pool().clone())),
        chrono::Duration::hours(config.idempotency.ttl_hours),
    )
    .with_outbox_notify(outbox_notify);

    // 幂等记录清理
    let cleanup_handle = {
        let worker = IdempotencyCleanupWorker::new(
            store,
            Duration::from_secs(config.idempotency.cleanup_interval_seconds.max(1)),
        );
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(rx).await })
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = router(AppState {
        checkout: Arc::new(service),
        service_name: config.service_name.clone(),
    })
    .layer(cors);

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP 停止后再通知后台任务退出，已提交的事件由投递器在下次启动时继续发送
    let _ = shutdown_tx.send(true);
    for (name, handle) in [("outbox", publisher_handle), ("cleanup", cleanup_handle)] {
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
