//! 订单管理服务
//!
//! 消费 OrderCreated 事件创建订单，异步完成支付编排（重试 + 熔断 + 超时），
//! 并通过 Outbox 发布 PaymentCompleted 事件。

pub mod consumer;
pub mod error;
pub mod http;
pub mod models;
pub mod payment;
pub mod repository;
pub mod service;
pub mod state_machine;
pub mod worker;

pub use consumer::{HandleOutcome, OrderEventConsumer, OrderEventHandler};
pub use error::{OrderError, PaymentError, Result};
pub use payment::{PaymentGateway, PaymentOrchestrator, PaymentPolicy, SimulatedPaymentGateway};
pub use repository::{MemoryOrderRepository, OrderRepository, PgOrderRepository};
pub use service::{OrderService, PaymentCompletionHandler};
pub use state_machine::OrderStatus;

/// 订单服务自带的数据库迁移
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
