//! 结算仓储层
//!
//! 幂等记录、订单号序列、库存预占和 Outbox 写入都在这里完成。
//! `commit_checkout` 是唯一的写入口，这几项写入在同一个事务内提交。

mod memory;
mod postgres;
mod traits;

pub use memory::MemoryCheckoutStore;
pub use postgres::PgCheckoutStore;
pub use traits::*;
