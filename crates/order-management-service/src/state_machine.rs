//! 订单状态机
//!
//! 合法迁移：
//!
//! ```text
//! PENDING ──▶ PROCESSING ──▶ PAID ──▶ FULFILLED
//!    │            │  └──────▶ FAILED
//!    └────────────┴─────────▶ CANCELLED
//! ```
//!
//! FULFILLED / CANCELLED / FAILED 为终态。所有修改订单状态的路径都通过
//! [`transition`] 校验，不在调用方重复判断。

use serde::{Deserialize, Serialize};
use shop_shared::error::{Result, ShopError};
use tracing::error;
use uuid::Uuid;

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    Paid,
    Fulfilled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Paid => "PAID",
            Self::Fulfilled => "FULFILLED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fulfilled | Self::Cancelled | Self::Failed)
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Paid)
                | (Processing, Failed)
                | (Paid, Fulfilled)
                | (Pending, Cancelled)
                | (Processing, Cancelled)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = ShopError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "PAID" => Ok(Self::Paid),
            "FULFILLED" => Ok(Self::Fulfilled),
            "CANCELLED" => Ok(Self::Cancelled),
            "FAILED" => Ok(Self::Failed),
            other => Err(ShopError::Validation(format!("未知的订单状态: {other}"))),
        }
    }
}

/// 校验一次状态迁移，返回目标状态
///
/// 非法迁移意味着调用方逻辑有缺陷或发生了竞争，按 error 级别记录。
pub fn transition(from: OrderStatus, to: OrderStatus) -> Result<OrderStatus> {
    if from.can_transition_to(to) {
        return Ok(to);
    }

    error!(from = %from, to = %to, "非法的订单状态迁移");
    Err(ShopError::InvalidStateTransition {
        from: from.to_string(),
        to: to.to_string(),
    })
}

/// 根据支付结果计算订单的下一个状态
///
/// 订单仍为 PENDING 时（支付结果先于本地编排到达）先经过 PROCESSING，
/// 两步都走状态机校验。
pub fn settle_payment(current: OrderStatus, succeeded: bool) -> Result<OrderStatus> {
    let from = if current == OrderStatus::Pending {
        transition(current, OrderStatus::Processing)?
    } else {
        current
    };

    let target = if succeeded {
        OrderStatus::Paid
    } else {
        OrderStatus::Failed
    };
    transition(from, target)
}

/// 结算交易时订单应处的状态
///
/// 交易总要写入终态。订单已不在 PENDING / PROCESSING（例如支付途中被取消）时
/// 订单保持原状态，只结算交易。
pub fn order_status_after_payment(
    order_id: Uuid,
    current: OrderStatus,
    succeeded: bool,
) -> OrderStatus {
    match settle_payment(current, succeeded) {
        Ok(next) => next,
        Err(e) => {
            error!(
                order_id = %order_id,
                order_status = %current,
                payment_succeeded = succeeded,
                error = %e,
                "订单状态不随支付结果变更，仅结算交易"
            );
            current
        }
    }
}
