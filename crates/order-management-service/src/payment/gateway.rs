//! 支付网关接口与模拟实现

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PaymentError;

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub order_id: Uuid,
    pub order_number: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentReceipt {
    pub external_transaction_id: String,
}

/// 外部支付网关
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &PaymentRequest) -> Result<PaymentReceipt, PaymentError>;
}

/// 本地运行用的模拟网关
///
/// 固定延迟后返回 `mock_tx_<毫秒时间戳>`；`failure_rate` 大于 0 时按概率返回瞬时错误。
#[derive(Debug, Clone)]
pub struct SimulatedPaymentGateway {
    latency: Duration,
    failure_rate: f64,
}

impl SimulatedPaymentGateway {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

impl Default for SimulatedPaymentGateway {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 0.0)
    }
}

#[async_trait]
impl PaymentGateway for SimulatedPaymentGateway {
    async fn charge(&self, request: &PaymentRequest) -> Result<PaymentReceipt, PaymentError> {
        tokio::time::sleep(self.latency).await;

        if self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate) {
            warn!(order_number = %request.order_number, "模拟网关返回瞬时错误");
            return Err(PaymentError::Transient("模拟网关故障".to_string()));
        }

        let external_transaction_id =
            format!("mock_tx_{}", chrono::Utc::now().timestamp_millis());
        info!(
            order_number = %request.order_number,
            amount = %request.amount,
            transaction_id = %external_transaction_id,
            "模拟支付成功"
        );

        Ok(PaymentReceipt {
            external_transaction_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> PaymentRequest {
        PaymentRequest {
            order_id: Uuid::new_v4(),
            order_number: "ORD-20250101-001".to_string(),
            amount: dec!(59.98),
            currency: "USD".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_gateway_succeeds_after_latency() {
        let gateway = SimulatedPaymentGateway::new(Duration::from_millis(100), 0.0);
        let started = tokio::time::Instant::now();

        let receipt = gateway.charge(&request()).await.unwrap();

        assert!(receipt.external_transaction_id.starts_with("mock_tx_"));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_gateway_always_fails_at_full_rate() {
        let gateway = SimulatedPaymentGateway::new(Duration::ZERO, 1.0);
        let err = gateway.charge(&request()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
