//! Database operations for the operation receipts table.

use sqlx::{PgExecutor, Row};
use tally_engine::{Receipt, Resource};

/// A stored receipt row from the database.
#[derive(Debug)]
pub struct StoredReceipt {
    pub operation_id: String,
    pub resource: String,
    pub record_id: String,
    pub sync_version: i64,
    pub applied_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredReceipt {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredReceipt {
            operation_id: row.try_get("operation_id")?,
            resource: row.try_get("resource")?,
            record_id: row.try_get("record_id")?,
            sync_version: row.try_get("sync_version")?,
            applied_at: row.try_get("applied_at")?,
        })
    }
}

impl StoredReceipt {
    /// Convert database row to an engine Receipt.
    pub fn to_receipt(&self) -> Result<Receipt, String> {
        let resource = Resource::parse(&self.resource)
            .ok_or_else(|| format!("unknown resource '{}' in receipt", self.resource))?;
        Ok(Receipt {
            operation_id: self.operation_id.clone(),
            resource,
            record_id: self.record_id.clone(),
            sync_version: self.sync_version as u64,
            applied_at: self.applied_at,
        })
    }
}

/// Insert a receipt. Fails with a unique violation if the operation was
/// already applied.
pub async fn insert_receipt<'e>(
    executor: impl PgExecutor<'e>,
    receipt: &Receipt,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO operation_receipts (
            operation_id, resource, record_id, sync_version, applied_at
        )
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&receipt.operation_id)
    .bind(receipt.resource.as_str())
    .bind(&receipt.record_id)
    .bind(receipt.sync_version as i64)
    .bind(receipt.applied_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Get the receipt of an applied operation.
pub async fn get_receipt<'e>(
    executor: impl PgExecutor<'e>,
    operation_id: &str,
) -> Result<Option<StoredReceipt>, sqlx::Error> {
    sqlx::query_as::<_, StoredReceipt>(
        r#"
        SELECT operation_id, resource, record_id, sync_version, applied_at
        FROM operation_receipts
        WHERE operation_id = $1
        "#,
    )
    .bind(operation_id)
    .fetch_optional(executor)
    .await
}

/// Check if a SQL error is a unique constraint violation.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        // PostgreSQL unique violation code is "23505"
        db_err.code().map(|c| c == "23505").unwrap_or(false)
    } else {
        false
    }
}
