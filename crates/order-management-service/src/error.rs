//! 订单服务错误类型
//!
//! `OrderError` 覆盖订单查询、状态变更和事件消费；`PaymentError` 是支付网关调用的
//! 错误分类，决定一次调用是否值得重试、是否计入熔断器失败率。

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use shop_shared::error::ShopError;
use thiserror::Error;
use uuid::Uuid;

/// 订单服务错误类型
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("订单不存在: {0}")]
    OrderNotFound(String),

    #[error("支付交易不存在: order_id={0}")]
    PaymentNotFound(Uuid),

    /// 无法处理的消息，直接进入死信队列
    #[error("无法处理的消息: {0}")]
    PoisonMessage(String),

    #[error(transparent)]
    Shared(#[from] ShopError),
}

pub type Result<T> = std::result::Result<T, OrderError>;

impl OrderError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::OrderNotFound(_) | Self::PaymentNotFound(_) => StatusCode::NOT_FOUND,
            Self::PoisonMessage(_) => StatusCode::BAD_REQUEST,
            Self::Shared(err) => match err {
                ShopError::Validation(_) => StatusCode::BAD_REQUEST,
                ShopError::NotFound { .. } => StatusCode::NOT_FOUND,
                ShopError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
                ShopError::Database(_) | ShopError::Kafka(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            Self::PoisonMessage(_) => "POISON_MESSAGE",
            Self::Shared(err) => err.code(),
        }
    }

    /// 瞬时基础设施故障，消费端会在进程内重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Shared(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for OrderError {
    fn from(err: sqlx::Error) -> Self {
        Self::Shared(ShopError::Database(err))
    }
}

impl From<serde_json::Error> for OrderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Shared(ShopError::Serialization(err))
    }
}

impl From<validator::ValidationErrors> for OrderError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Shared(ShopError::from(errors))
    }
}

impl IntoResponse for OrderError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            Self::Shared(ShopError::Database(e)) => {
                tracing::error!(error = %e, "数据库操作失败");
                "服务暂时不可用，请稍后重试".to_string()
            }
            Self::Shared(err @ (ShopError::Internal(_) | ShopError::Serialization(_))) => {
                tracing::error!(error = %err, "内部错误");
                "服务内部错误，请稍后重试".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "code": self.error_code(),
            "message": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// 支付网关调用错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    /// 网络抖动、网关 5xx 等，可重试
    #[error("支付网关暂时不可用: {0}")]
    Transient(String),

    /// 卡被拒、金额非法等，重试也不会成功
    #[error("支付被拒绝: {0}")]
    Permanent(String),

    #[error("支付调用超时: 超过 {0:?}")]
    Timeout(Duration),

    /// 熔断器打开，未调用网关
    #[error("支付熔断器已打开，快速失败: {0}")]
    CircuitOpen(String),
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// 是否反映网关健康状况；业务拒绝不计入熔断器失败率
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// 指标标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Timeout(_) => "timeout",
            Self::CircuitOpen(_) => "circuit_open",
        }
    }
}
