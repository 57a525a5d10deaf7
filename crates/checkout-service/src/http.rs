//! HTTP 路由
//!
//! - `POST /api/v1/checkout`：必须携带 `Idempotency-Key` 请求头
//! - `GET /health`：检查数据库连通性

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use shop_shared::observability::middleware as obs_middleware;
use tracing::warn;

use crate::error::CheckoutError;
use crate::models::CheckoutRequest;
use crate::service::CheckoutService;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENT_REPLAY_HEADER: &str = "idempotent-replayed";

/// Axum 应用共享状态
#[derive(Clone)]
pub struct AppState {
    pub checkout: Arc<CheckoutService>,
    pub service_name: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/checkout", post(checkout))
        .route("/health", get(health))
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(state)
}

async fn checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Response, CheckoutError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(CheckoutError::MissingIdempotencyKey)?
        .to_string();

    let Json(request) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "结算请求体无法解析");
        CheckoutError::validation(rejection.body_text())
    })?;

    let outcome = state.checkout.checkout(&key, request).await?;

    let status = StatusCode::from_u16(outcome.status_code).unwrap_or(StatusCode::CREATED);
    let mut response = (status, Json(outcome.response)).into_response();
    if outcome.replayed {
        response
            .headers_mut()
            .insert(IDEMPOTENT_REPLAY_HEADER, HeaderValue::from_static("true"));
    }
    Ok(response)
}

async fn health(State(state): State<AppState>) -> Response {
    match state.checkout.store().health_check().await {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::MemoryCartCatalog;
    use crate::models::DraftItem;
    use crate::repository::{MemoryCheckoutStore, MockCheckoutStore};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use rust_decimal_macros::dec;
    use shop_shared::error::ShopError;
    use shop_shared::outbox::MemoryOutboxStore;
    use shop_shared::test_utils::TestDataGenerator;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app_with_cart() -> (Router, Uuid) {
        let store = MemoryCheckoutStore::new(MemoryOutboxStore::new());
        let catalog = Arc::new(MemoryCartCatalog::new());
        let product = Uuid::new_v4();
        let cart = Uuid::new_v4();
        store.set_stock(product, 10);
        catalog.put_cart(
            cart,
            vec![DraftItem {
                product_id: product,
                sku: "SKU-001".to_string(),
                name: "Mechanical Keyboard".to_string(),
                quantity: 2,
                unit_price: dec!(29.99),
            }],
        );
        let service = CheckoutService::new(
            Arc::new(store),
            catalog,
            chrono::Duration::hours(24),
        );
        let state = AppState {
            checkout: Arc::new(service),
            service_name: "checkout-service".to_string(),
        };
        (router(state), cart)
    }

    fn checkout_request(key: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/checkout")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn body_for(cart: Uuid) -> serde_json::Value {
        json!({
            "cartId": cart,
            "customer": TestDataGenerator::customer(),
        })
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_checkout_then_replay() {
        let (app, cart) = app_with_cart();

        let first = app
            .clone()
            .oneshot(checkout_request(Some("K1"), body_for(cart)))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        assert!(first.headers().get(IDEMPOTENT_REPLAY_HEADER).is_none());
        let first_body = json_body(first).await;
        assert_eq!(first_body["status"], "PENDING");

        let second = app
            .oneshot(checkout_request(Some("K1"), body_for(cart)))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CREATED);
        assert_eq!(second.headers()[IDEMPOTENT_REPLAY_HEADER], "true");
        assert_eq!(json_body(second).await, first_body);
    }

    #[tokio::test]
    async fn test_conflict_returns_409() {
        let (app, cart) = app_with_cart();
        app.clone()
            .oneshot(checkout_request(Some("K1"), body_for(cart)))
            .await
            .unwrap();

        let mut different = body_for(cart);
        different["customer"]["name"] = json!("Someone Else");
        let response = app
            .oneshot(checkout_request(Some("K1"), different))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["code"], "IDEMPOTENCY_CONFLICT");
    }

    #[tokio::test]
    async fn test_missing_key_returns_400() {
        let (app, cart) = app_with_cart();
        let response = app
            .oneshot(checkout_request(None, body_for(cart)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "MISSING_IDEMPOTENCY_KEY");
    }

    #[tokio::test]
    async fn test_malformed_body_returns_400() {
        let (app, _) = app_with_cart();
        let response = app
            .oneshot(checkout_request(Some("K1"), json!({ "cartId": "nope" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_health_reports_database_outage() {
        let mut store = MockCheckoutStore::new();
        store
            .expect_health_check()
            .returning(|| Err(ShopError::Database(sqlx::Error::PoolTimedOut).into()));
        let service = CheckoutService::new(
            Arc::new(store),
            Arc::new(MemoryCartCatalog::new()),
            chrono::Duration::hours(24),
        );
        let app = router(AppState {
            checkout: Arc::new(service),
            service_name: "checkout-service".to_string(),
        });

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
