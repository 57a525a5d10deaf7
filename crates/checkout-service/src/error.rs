//! 结算服务错误类型
//!
//! 业务错误在本模块定义，基础设施错误统一包装 `ShopError`。
//! 实现 `IntoResponse`，HTTP 层直接返回 `{code, message}`。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use shop_shared::error::ShopError;
use thiserror::Error;
use uuid::Uuid;

/// 结算服务错误类型
#[derive(Debug, Error)]
pub enum CheckoutError {
    // === 请求错误 ===
    #[error("缺少 Idempotency-Key 请求头")]
    MissingIdempotencyKey,

    #[error("购物车为空: cart_id={0}")]
    EmptyCart(Uuid),

    // === 库存/订单号 ===
    #[error("库存不足: product_id={product_id}, 需要 {requested}, 可用 {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("当日订单号已用尽: {date}")]
    OrderNumberExhausted { date: String },

    // === 共享错误 ===
    #[error(transparent)]
    Shared(#[from] ShopError),
}

pub type Result<T> = std::result::Result<T, CheckoutError>;

impl CheckoutError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingIdempotencyKey | Self::EmptyCart(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientStock { .. } => StatusCode::CONFLICT,
            Self::OrderNumberExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Shared(err) => match err {
                ShopError::Validation(_) => StatusCode::BAD_REQUEST,
                ShopError::IdempotencyConflict { .. } => StatusCode::CONFLICT,
                ShopError::NotFound { .. } => StatusCode::NOT_FOUND,
                ShopError::Database(_) | ShopError::Kafka(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            Self::EmptyCart(_) => "EMPTY_CART",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::OrderNumberExhausted { .. } => "ORDER_NUMBER_EXHAUSTED",
            Self::Shared(err) => err.code(),
        }
    }

    /// 调用方是否可以原样重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Shared(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Shared(ShopError::Validation(message.into()))
    }
}

impl From<sqlx::Error> for CheckoutError {
    fn from(err: sqlx::Error) -> Self {
        Self::Shared(ShopError::Database(err))
    }
}

impl From<serde_json::Error> for CheckoutError {
    fn from(err: serde_json::Error) -> Self {
        Self::Shared(ShopError::Serialization(err))
    }
}

impl From<validator::ValidationErrors> for CheckoutError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Shared(ShopError::from(errors))
    }
}

impl IntoResponse for CheckoutError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 基础设施错误只返回通用提示，详细信息记录日志
        let message = match &self {
            Self::Shared(ShopError::Database(e)) => {
                tracing::error!(error = %e, "数据库操作失败");
                "服务暂时不可用，请使用相同的 Idempotency-Key 重试".to_string()
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
