//! # Order Repository
//!
//! Orders, their lines and their sync status.
//!
//! Lines are written together with the order header and never change after
//! that; the create_order handler sends both in one request.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use cashline_core::{Order, OrderItem};

const ORDER_COLUMNS: &str = "id, batch_id, receipt_number, subtotal_cents, tax_cents, \
     discount_cents, total_cents, payment_method, sync_status, remote_id, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, order_id, product_id, sku_snapshot, name_snapshot, \
     unit_price_cents, quantity, line_total_cents, tax_cents, created_at";

/// Repository for orders and order lines.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    /// Creates a new OrderRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OrderRepository { pool }
    }

    /// Inserts an order and its lines without queueing a command.
    pub async fn insert(&self, order: &Order, items: &[OrderItem]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_order_on(&mut tx, order, items).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Gets an order by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1");
        let order = sqlx::query_as::<_, Order>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(order)
    }

    /// Gets the lines of an order in insertion order.
    pub async fn get_items(&self, order_id: &str) -> DbResult<Vec<OrderItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = ?1 ORDER BY created_at, rowid"
        );
        let items = sqlx::query_as::<_, OrderItem>(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(items)
    }

    /// Lists the orders of a batch, oldest first.
    pub async fn list_by_batch(&self, batch_id: &str) -> DbResult<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE batch_id = ?1 ORDER BY created_at, rowid"
        );
        let orders = sqlx::query_as::<_, Order>(&sql)
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(orders)
    }

    /// Counts orders in a batch that have not reached the backend yet.
    pub async fn count_unsynced_in_batch(&self, batch_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM orders WHERE batch_id = ?1 AND sync_status = 'local_only'",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Records that the backend created the order.
    pub async fn mark_synced(&self, id: &str, remote_id: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                sync_status = 'synced',
                remote_id = ?2,
                updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(remote_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Order", id));
        }

        debug!(order_id = %id, remote_id = %remote_id, "Order synced");
        Ok(())
    }
}

pub(crate) async fn insert_order_on(
    conn: &mut SqliteConnection,
    order: &Order,
    items: &[OrderItem],
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO orders (
            id, batch_id, receipt_number, subtotal_cents, tax_cents,
            discount_cents, total_cents, payment_method, sync_status,
            remote_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(&order.id)
    .bind(&order.batch_id)
    .bind(&order.receipt_number)
    .bind(order.subtotal_cents)
    .bind(order.tax_cents)
    .bind(order.discount_cents)
    .bind(order.total_cents)
    .bind(order.payment_method)
    .bind(order.sync_status)
    .bind(&order.remote_id)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(&mut *conn)
    .await?;

    // Orders only go into a batch that is not closed locally. Checked after
    // the insert so the write lock is already held.
    let closed: Option<Option<i64>> =
        sqlx::query_scalar("SELECT closing_cash_cents FROM batches WHERE id = ?1")
            .bind(&order.batch_id)
            .fetch_optional(&mut *conn)
            .await?;
    if let Some(Some(_)) = closed {
        return Err(DbError::Conflict(format!(
            "batch {} is closed, order {} not accepted",
            order.batch_id, order.id
        )));
    }

    for item in items {
        sqlx::query(
            r#"
            INSERT INTO order_items (
                id, order_id, product_id, sku_snapshot, name_snapshot,
                unit_price_cents, quantity, line_total_cents, tax_cents, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&item.id)
        .bind(&order.id)
        .bind(&item.product_id)
        .bind(&item.sku_snapshot)
        .bind(&item.name_snapshot)
        .bind(item.unit_price_cents)
        .bind(item.quantity)
        .bind(item.line_total_cents)
        .bind(item.tax_cents)
        .bind(item.created_at)
        .execute(&mut *conn)
        .await?;
    }

    debug!(
        order_id = %order.id,
        batch_id = %order.batch_id,
        items = items.len(),
        "Order inserted"
    );
    Ok(())
}
