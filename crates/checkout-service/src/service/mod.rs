//! 服务层

mod checkout_service;

pub use checkout_service::CheckoutService;
