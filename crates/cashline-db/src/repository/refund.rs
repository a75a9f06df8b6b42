//! # Refund Repository
//!
//! Refunds against earlier orders and their sync status.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use cashline_core::validation::validate_positive_amount;
use cashline_core::Refund;

const REFUND_COLUMNS: &str =
    "id, order_id, amount_cents, reason, sync_status, remote_id, created_at, updated_at";

/// Repository for refunds.
#[derive(Debug, Clone)]
pub struct RefundRepository {
    pool: SqlitePool,
}

impl RefundRepository {
    /// Creates a new RefundRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RefundRepository { pool }
    }

    /// Inserts a refund without queueing a command.
    pub async fn insert(&self, refund: &Refund) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_refund_on(&mut conn, refund).await
    }

    /// Gets a refund by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Refund>> {
        let sql = format!("SELECT {REFUND_COLUMNS} FROM refunds WHERE id = ?1");
        let refund = sqlx::query_as::<_, Refund>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(refund)
    }

    /// Records that the backend created the refund.
    pub async fn mark_synced(&self, id: &str, remote_id: &str) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE refunds SET sync_status = 'synced', remote_id = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(remote_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Refund", id));
        }

        debug!(refund_id = %id, remote_id = %remote_id, "Refund synced");
        Ok(())
    }
}

pub(crate) async fn insert_refund_on(conn: &mut SqliteConnection, refund: &Refund) -> DbResult<()> {
    validate_positive_amount("amount_cents", refund.amount_cents)?;

    sqlx::query(
        r#"
        INSERT INTO refunds (
            id, order_id, amount_cents, reason, sync_status, remote_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&refund.id)
    .bind(&refund.order_id)
    .bind(refund.amount_cents)
    .bind(&refund.reason)
    .bind(refund.sync_status)
    .bind(&refund.remote_id)
    .bind(refund.created_at)
    .bind(refund.updated_at)
    .execute(&mut *conn)
    .await?;

    debug!(refund_id = %refund.id, order_id = %refund.order_id, "Refund inserted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use cashline_core::{Batch, Order, PaymentMethod, RefundSyncStatus};

    async fn setup() -> (Database, Order) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let batch = Batch::open("store-1", "cashier-7", "front", "register-2", 10_000);
        db.batches().insert(&batch).await.unwrap();
        let order = Order::new(&batch.id, "R-0001", PaymentMethod::ExternalCard);
        db.orders().insert(&order, &[]).await.unwrap();
        (db, order)
    }

    #[tokio::test]
    async fn test_insert_get_and_sync() {
        let (db, order) = setup().await;
        let refund = Refund::new(&order.id, 250, Some("damaged".into()));
        db.refunds().insert(&refund).await.unwrap();

        let loaded = db.refunds().get_by_id(&refund.id).await.unwrap().unwrap();
        assert_eq!(loaded.amount_cents, 250);
        assert_eq!(loaded.sync_status, RefundSyncStatus::Pending);
        assert_eq!(loaded.reason.as_deref(), Some("damaged"));

        db.refunds().mark_synced(&refund.id, "srv-r-1").await.unwrap();
        let loaded = db.refunds().get_by_id(&refund.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_status, RefundSyncStatus::Synced);
        assert_eq!(loaded.remote_id.as_deref(), Some("srv-r-1"));
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let (db, order) = setup().await;
        let refund = Refund::new(&order.id, 0, None);

        let err = db.refunds().insert(&refund).await.unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_order_rejected() {
        let (db, _) = setup().await;
        let refund = Refund::new("no-such-order", 100, None);

        let err = db.refunds().insert(&refund).await.unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation { .. }));
    }
}
