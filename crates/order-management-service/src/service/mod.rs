//! 业务服务层

mod completion_handler;
mod order_service;

pub use completion_handler::PaymentCompletionHandler;
pub use order_service::OrderService;
