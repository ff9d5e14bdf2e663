//! PostgreSQL Record Store.
//!
//! Every conditional write runs in one transaction: the row is locked, the
//! version checked, the row updated with `WHERE sync_version = $expected`
//! and the operation receipt inserted. A unique violation on the receipt
//! means a concurrent duplicate of the same operation won the race.

use super::{get_receipt, insert_receipt, is_unique_violation};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tally_engine::{
    Change, CreateOutcome, MutationContext, Receipt, Record, RecordBody, RecordStore, Resource,
    StoreError, StoreResult, SwapOutcome, Timestamp, Version,
};

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub resource: String,
    pub record_id: String,
    pub fields: serde_json::Value,
    pub sync_version: i64,
    pub is_deleted: bool,
    pub last_modified_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            resource: row.try_get("resource")?,
            record_id: row.try_get("record_id")?,
            fields: row.try_get("fields")?,
            sync_version: row.try_get("sync_version")?,
            is_deleted: row.try_get("is_deleted")?,
            last_modified_by: row.try_get("last_modified_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredRecord {
    /// Convert database row to an engine Record.
    pub fn to_record(&self) -> StoreResult<Record> {
        let resource = Resource::parse(&self.resource).ok_or_else(|| {
            StoreError::backend(format!("unknown resource '{}' in records", self.resource))
        })?;
        // A row that no longer parses is a storage fault, not a bad operation
        let body = RecordBody::from_fields(resource, self.fields.clone()).map_err(|e| {
            StoreError::backend(format!("corrupt {} {}: {e}", resource, self.record_id))
        })?;

        Ok(Record {
            id: self.record_id.clone(),
            body,
            sync_version: self.sync_version as u64,
            is_deleted: self.is_deleted,
            last_modified_by: self.last_modified_by.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::backend(e)
}

/// Record Store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn existing_receipt(&self, operation_id: &str) -> StoreResult<Option<Receipt>> {
        get_receipt(&self.pool, operation_id)
            .await
            .map_err(backend)?
            .map(|stored| stored.to_receipt().map_err(StoreError::backend))
            .transpose()
    }

    /// Receipt written by a concurrent duplicate that won the insert race.
    async fn raced_receipt(&self, operation_id: &str) -> StoreResult<Receipt> {
        tracing::debug!(operation_id, "duplicate operation lost the receipt race");
        self.existing_receipt(operation_id).await?.ok_or_else(|| {
            StoreError::backend(format!("receipt for {operation_id} vanished"))
        })
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get(&self, resource: Resource, id: &str) -> StoreResult<Option<Record>> {
        sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT resource, record_id, fields, sync_version, is_deleted,
                   last_modified_by, created_at, updated_at
            FROM records
            WHERE resource = $1 AND record_id = $2
            "#,
        )
        .bind(resource.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .map(|stored| stored.to_record())
        .transpose()
    }

    async fn create_if_absent(
        &self,
        mut record: Record,
        ctx: &MutationContext,
    ) -> StoreResult<CreateOutcome> {
        record.sync_version = 1;
        record.is_deleted = false;
        record.last_modified_by = ctx.device_id.clone();
        record.created_at = ctx.timestamp;
        record.updated_at = ctx.timestamp;

        let mut tx = self.pool.begin().await.map_err(backend)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO records (
                resource, record_id, fields, sync_version, is_deleted,
                last_modified_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (resource, record_id) DO NOTHING
            "#,
        )
        .bind(record.resource().as_str())
        .bind(&record.id)
        .bind(record.body.to_fields())
        .bind(record.sync_version as i64)
        .bind(record.is_deleted)
        .bind(&record.last_modified_by)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(backend)?;
            if let Some(receipt) = self.existing_receipt(&ctx.operation_id).await? {
                return Ok(CreateOutcome::AlreadyApplied(receipt));
            }
            let existing = self.get(record.resource(), &record.id).await?.ok_or_else(|| {
                StoreError::backend(format!("{} {} vanished", record.resource(), record.id))
            })?;
            return Ok(CreateOutcome::Exists(existing));
        }

        match insert_receipt(&mut *tx, &Receipt::for_record(&record, ctx)).await {
            Ok(()) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.map_err(backend)?;
                return self
                    .raced_receipt(&ctx.operation_id)
                    .await
                    .map(CreateOutcome::AlreadyApplied);
            }
            Err(e) => return Err(backend(e)),
        }

        tx.commit().await.map_err(backend)?;
        tracing::debug!(resource = %record.resource(), record_id = %record.id, "record created");
        Ok(CreateOutcome::Created(record))
    }

    async fn compare_and_swap(
        &self,
        resource: Resource,
        id: &str,
        expected: Version,
        change: Change,
        ctx: &MutationContext,
    ) -> StoreResult<SwapOutcome> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let current = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT resource, record_id, fields, sync_version, is_deleted,
                   last_modified_by, created_at, updated_at
            FROM records
            WHERE resource = $1 AND record_id = $2
            FOR UPDATE
            "#,
        )
        .bind(resource.as_str())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let Some(current) = current else {
            return Ok(SwapOutcome::NotFound);
        };
        if let Some(stored) = get_receipt(&mut *tx, &ctx.operation_id)
            .await
            .map_err(backend)?
        {
            let receipt = stored.to_receipt().map_err(StoreError::backend)?;
            return Ok(SwapOutcome::AlreadyApplied(receipt));
        }

        let current = current.to_record()?;
        if current.sync_version != expected {
            return Ok(SwapOutcome::VersionConflict(current));
        }

        let mut next = current;
        match &change {
            Change::Patch(patch) => next.body.apply(patch)?,
            Change::SoftDelete => next.is_deleted = true,
        }
        next.advance(&ctx.device_id, ctx.timestamp);

        let updated = sqlx::query(
            r#"
            UPDATE records
            SET fields = $3, sync_version = $4, is_deleted = $5,
                last_modified_by = $6, updated_at = $7
            WHERE resource = $1 AND record_id = $2 AND sync_version = $8
            "#,
        )
        .bind(resource.as_str())
        .bind(id)
        .bind(next.body.to_fields())
        .bind(next.sync_version as i64)
        .bind(next.is_deleted)
        .bind(&next.last_modified_by)
        .bind(next.updated_at)
        .bind(expected as i64)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if updated.rows_affected() != 1 {
            return Err(StoreError::backend(format!(
                "conditional update of {resource} {id} matched no row"
            )));
        }

        match insert_receipt(&mut *tx, &Receipt::for_record(&next, ctx)).await {
            Ok(()) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.map_err(backend)?;
                return self
                    .raced_receipt(&ctx.operation_id)
                    .await
                    .map(SwapOutcome::AlreadyApplied);
            }
            Err(e) => return Err(backend(e)),
        }

        tx.commit().await.map_err(backend)?;
        Ok(SwapOutcome::Swapped(next))
    }

    async fn receipt(&self, operation_id: &str) -> StoreResult<Option<Receipt>> {
        self.existing_receipt(operation_id).await
    }

    async fn changed_since(&self, since: Timestamp) -> StoreResult<Vec<Record>> {
        sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT resource, record_id, fields, sync_version, is_deleted,
                   last_modified_by, created_at, updated_at
            FROM records
            WHERE updated_at >= $1
            ORDER BY updated_at ASC, resource ASC, record_id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .iter()
        .map(StoredRecord::to_record)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(resource: &str, fields: serde_json::Value) -> StoredRecord {
        StoredRecord {
            resource: resource.into(),
            record_id: "acc-1".into(),
            fields,
            sync_version: 3,
            is_deleted: false,
            last_modified_by: "device-1".into(),
            created_at: 10,
            updated_at: 20,
        }
    }

    #[test]
    fn stored_row_converts_to_record() {
        let row = stored(
            "account",
            json!({
                "name": "Checking",
                "kind": "checking",
                "currency": "USD",
                "balance": 1250,
                "archived": false
            }),
        );

        let record = row.to_record().unwrap();
        assert_eq!(record.resource(), Resource::Account);
        assert_eq!(record.sync_version, 3);
        assert_eq!(record.updated_at, 20);
        assert_eq!(record.body.to_fields(), row.fields);
    }

    #[test]
    fn corrupt_row_is_a_backend_error() {
        let row = stored("account", json!({ "name": 5 }));
        assert!(matches!(row.to_record(), Err(StoreError::Backend(_))));

        let row = stored("budget", json!({}));
        assert!(matches!(row.to_record(), Err(StoreError::Backend(_))));
    }
}
