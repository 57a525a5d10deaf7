//! HTTP 路由
//!
//! 订单查询与显式状态变更；`GET /health` 检查数据库连通性。

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use shop_shared::observability::middleware as obs_middleware;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Order, PaymentTransaction};
use crate::service::OrderService;

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderService>,
    pub service_name: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/orders/{id}", get(get_order))
        .route("/api/v1/orders/number/{order_number}", get(get_order_by_number))
        .route("/api/v1/orders/{id}/payment", get(get_payment))
        .route("/api/v1/orders/{id}/cancel", post(cancel_order))
        .route("/api/v1/orders/{id}/fulfill", post(fulfill_order))
        .route("/health", get(health))
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(state)
}

async fn get_order(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Order>> {
    Ok(Json(state.orders.get_order(id).await?))
}

async fn get_order_by_number(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Json<Order>> {
    Ok(Json(state.orders.get_order_by_number(&order_number).await?))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentTransaction>> {
    Ok(Json(state.orders.get_payment(id).await?))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>> {
    Ok(Json(state.orders.cancel_order(id).await?))
}

async fn fulfill_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>> {
    Ok(Json(state.orders.fulfill_order(id).await?))
}

async fn health(State(state): State<AppState>) -> Response {
    match state.orders.repository().health_check().await {
        Ok(()) => Json(json!({
            "status": "ok",
            "service": state.service_name,
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "健康检查失败");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "service": state.service_name,
                })),
            )
                .into_response()
        }
    }
}
