//! 订单仓储层
//!
//! 订单、订单明细、支付交易、已处理事件与 payments.completed Outbox 事件
//! 都归订单服务所有。两个写入口 `create_order_from_event` 与
//! `finalize_payment` 各自在一个事务内完成全部写入，去重记录是并发重复投递的串行化点。

mod memory;
mod postgres;
mod traits;

pub use memory::MemoryOrderRepository;
pub use postgres::PgOrderRepository;
pub use traits::*;
