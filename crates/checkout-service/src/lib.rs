//! 结算服务
//!
//! 幂等结算编排：校验请求、预占库存，并在同一事务内写入 OrderCreated
//! Outbox 事件与幂等记录。事件由后台 Outbox 投递器发送到 Kafka。

pub mod draft;
pub mod error;
pub mod http;
pub mod models;
pub mod repository;
pub mod service;
pub mod worker;

pub use draft::{MemoryCartCatalog, OrderDraftBuilder, PgCartDraftBuilder};
pub use error::{CheckoutError, Result};
pub use repository::{CheckoutStore, MemoryCheckoutStore, PgCheckoutStore};
pub use service::CheckoutService;

/// 结算服务自带的数据库迁移
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
