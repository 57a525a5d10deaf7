//! 支付：网关接口与编排策略

pub mod gateway;
pub mod orchestrator;

pub use gateway::{PaymentGateway, PaymentReceipt, PaymentRequest, SimulatedPaymentGateway};
pub use orchestrator::{PaymentOrchestrator, PaymentPolicy};
