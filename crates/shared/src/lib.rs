//! 共享库
//!
//! 包含结算服务与订单服务共用的配置、错误处理、数据库连接、Kafka、
//! Outbox、重试与熔断等基础设施代码。

pub mod circuit_breaker;
pub mod config;
pub mod database;
pub mod dlq;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod outbox;
pub mod retry;
pub mod test_utils;
