//! 统一错误处理模块
//!
//! 定义两个服务共用的错误类型，使用 thiserror 提供良好的错误信息。
//! 服务内部错误通过 `#[from]` 包装本类型。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum ShopError {
    // ==================== 基础设施错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    // ==================== 数据错误 ====================
    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    #[error("参数验证失败: {0}")]
    Validation(String),

    // ==================== 业务逻辑错误 ====================
    #[error("幂等键冲突: key={key} 已被用于不同的请求体")]
    IdempotencyConflict { key: String },

    #[error("非法的订单状态迁移: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, ShopError>;

impl ShopError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误（瞬时的基础设施故障）
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Kafka(_))
    }

    /// 是否为唯一约束冲突
    ///
    /// 幂等记录、已处理事件等表依赖唯一约束作为并发写入的串行化点。
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for ShopError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for ShopError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::Kafka(err.to_string())
    }
}
