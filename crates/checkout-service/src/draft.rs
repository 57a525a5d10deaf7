//! 订单草稿构建
//!
//! 库存/目录服务是外部协作方，结算只关心它交出的已定价商品行。
//! Postgres 实现直接读取购物车与商品表，内存实现供测试和本地运行。

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::DraftItem;

/// 将购物车转换为已定价的商品行
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderDraftBuilder: Send + Sync {
    /// 购物车不存在时返回空列表
    async fn build_draft(&self, cart_id: Uuid) -> Result<Vec<DraftItem>>;
}

pub struct PgCartDraftBuilder {
    pool: PgPool,
}

impl PgCartDraftBuilder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderDraftBuilder for PgCartDraftBuilder {
    async fn build_draft(&self, cart_id: Uuid) -> Result<Vec<DraftItem>> {
        let items = sqlx::query_as::<_, DraftItem>(
            r#"
            SELECT ci.product_id, p.sku, p.name, ci.quantity, p.price AS unit_price
            FROM cart_items ci
            JOIN products p ON p.id = ci.product_id
            WHERE ci.cart_id = $1
            ORDER BY ci.created_at ASC, ci.product_id ASC
            "#,
        )
        .bind(cart_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }
}

/// 内存购物车目录
#[derive(Debug, Default)]
pub struct MemoryCartCatalog {
    carts: Mutex<HashMap<Uuid, Vec<DraftItem>>>,
}

impl MemoryCartCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_cart(&self, cart_id: Uuid, items: Vec<DraftItem>) {
        self.carts.lock().insert(cart_id, items);
    }
}

#[async_trait]
impl OrderDraftBuilder for MemoryCartCatalog {
    async fn build_draft(&self, cart_id: Uuid) -> Result<Vec<DraftItem>> {
        Ok(self.carts.lock().get(&cart_id).cloned().unwrap_or_default())
    }
}
