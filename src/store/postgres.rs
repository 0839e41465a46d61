//! # PostgreSQL Entity Store
//!
//! Runtime `sqlx` queries over the schema in `migrations/`. Enumerations are
//! stored as their `Display` strings and durations as milliseconds.
//!
//! Claims are single `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP
//! LOCKED)` statements, so concurrent agents never see the same row. Every
//! Operation change is a check-and-set on the current Operation; multi-row
//! decisions run inside one transaction. Transient failures (serialization
//! conflicts, deadlocks, pool timeouts) are retried by the
//! [`TransientRetryPolicy`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgExecutor, Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::errors::{StoreError, StoreResult};
use super::transient::TransientRetryPolicy;
use super::{EntityStore, ReceptionUpdate, RetryUpdate};
use crate::config::DatabaseConfig;
use crate::constants::{MessageType, RetryStatus, RetryType};
use crate::models::{
    EntityId, ExceptionDirection, ExceptionEntity, InException, InMessage, Inbound,
    MessageEntity, MessageStatus, OutException, OutMessage, Outbound, ReceptionAwareness,
    RetryReliability, RetryTarget,
};
use crate::piggyback::PiggybackCriteria;
use crate::state_machine::{
    determine_target_operation, InStatus, Operation, OperationEvent, OutStatus,
};

const RETRY_TABLE: &str = "retry_reliability";
const RECEPTION_TABLE: &str = "reception_awareness";

const MESSAGE_COLUMNS: &str = "id, ebms_message_id, ebms_ref_to_message_id, message_location, \
    from_party, to_party, conversation_id, pmode_id, pmode_data, mep, ebms_message_type, \
    operation, status, mpc, url, is_signed, is_encrypted, is_duplicate, is_test, \
    insertion_time, modification_time";

const EXCEPTION_COLUMNS: &str = "id, ebms_ref_to_message_id, exception, pmode_id, pmode_data, \
    message_body, operation, notify_method, insertion_time, modification_time";

const RETRY_COLUMNS: &str = "id, ref_to_in_message_id, ref_to_out_message_id, \
    ref_to_in_exception_id, ref_to_out_exception_id, current_retry_count, max_retry_count, \
    retry_interval_ms, retry_type, status, last_retry_time, insertion_time, modification_time";

const RECEPTION_COLUMNS: &str = "id, ref_to_out_message_id, ref_to_ebms_message_id, \
    current_retry_count, total_retry_count, retry_interval_ms, last_send_time, status, \
    insertion_time, modification_time";

/// Entity store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
    retry: TransientRetryPolicy,
}

impl PgEntityStore {
    pub fn new(pool: PgPool, retry: TransientRetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Open a pool for `config`; the url is required for this backend
    pub async fn connect(config: &DatabaseConfig, retry: TransientRetryPolicy) -> StoreResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| StoreError::Database("database.url is not configured".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(url)
            .await
            .map_err(|e| StoreError::from_sqlx("pool", e))?;

        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL entity store"
        );
        Ok(Self::new(pool, retry))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;
        info!("Entity store schema is up to date");
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx("transaction", e))
    }

    async fn try_insert_message<S: MessageStatus>(
        &self,
        message: &MessageEntity<S>,
    ) -> StoreResult<MessageEntity<S>> {
        let sql = format!(
            "INSERT INTO {table} (ebms_message_id, ebms_ref_to_message_id, message_location, \
             from_party, to_party, conversation_id, pmode_id, pmode_data, mep, ebms_message_type, \
             operation, status, mpc, url, is_signed, is_encrypted, is_duplicate, is_test, \
             insertion_time, modification_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, NOW()) \
             RETURNING {MESSAGE_COLUMNS}",
            table = S::TABLE
        );
        let row = sqlx::query(&sql)
            .bind(message.ebms_message_id())
            .bind(&message.ebms_ref_to_message_id)
            .bind(&message.message_location)
            .bind(&message.from_party)
            .bind(&message.to_party)
            .bind(&message.conversation_id)
            .bind(&message.pmode_id)
            .bind(&message.pmode_data)
            .bind(message.mep.to_string())
            .bind(message.ebms_message_type.to_string())
            .bind(message.operation.to_string())
            .bind(message.status.to_string())
            .bind(&message.mpc)
            .bind(&message.url)
            .bind(message.is_signed)
            .bind(message.is_encrypted)
            .bind(message.is_duplicate)
            .bind(message.is_test)
            .bind(message.insertion_time)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(S::TABLE, e))?;
        message_from_row(&row)
    }

    async fn try_get_message<S: MessageStatus>(
        &self,
        id: EntityId,
    ) -> StoreResult<MessageEntity<S>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM {} WHERE id = $1", S::TABLE);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(S::TABLE, e))?
            .ok_or(StoreError::NotFound {
                table: S::TABLE,
                id,
            })?;
        message_from_row(&row)
    }

    async fn try_find_message<S: MessageStatus>(
        &self,
        ebms_message_id: &str,
        skip_duplicates: bool,
    ) -> StoreResult<Option<MessageEntity<S>>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM {} \
             WHERE ebms_message_id = $1 AND (NOT $2 OR NOT is_duplicate) \
             ORDER BY id LIMIT 1",
            S::TABLE
        );
        sqlx::query(&sql)
            .bind(ebms_message_id)
            .bind(skip_duplicates)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(S::TABLE, e))?
            .map(|row| message_from_row(&row))
            .transpose()
    }

    async fn try_claim_messages<S: MessageStatus>(
        &self,
        from: Operation,
        limit: u32,
    ) -> StoreResult<Vec<MessageEntity<S>>> {
        let to = determine_target_operation(from, OperationEvent::Claim)?;
        let sql = format!(
            "UPDATE {table} SET operation = $1, modification_time = NOW() \
             WHERE id IN (\
                 SELECT id FROM {table} WHERE operation = $2 \
                 ORDER BY id LIMIT $3 FOR UPDATE SKIP LOCKED) \
             RETURNING {MESSAGE_COLUMNS}",
            table = S::TABLE
        );
        let rows = sqlx::query(&sql)
            .bind(to.to_string())
            .bind(from.to_string())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(S::TABLE, e))?;
        let mut claimed: Vec<MessageEntity<S>> =
            rows.iter().map(message_from_row).collect::<StoreResult<_>>()?;
        claimed.sort_by_key(|m| m.id);
        debug!(table = S::TABLE, %from, count = claimed.len(), "Claimed messages");
        Ok(claimed)
    }

    async fn try_set_status<S: MessageStatus>(
        &self,
        id: EntityId,
        status: S,
        message_type: Option<MessageType>,
    ) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET status = $1, \
             ebms_message_type = COALESCE($2, ebms_message_type), modification_time = NOW() \
             WHERE id = $3",
            S::TABLE
        );
        let result = sqlx::query(&sql)
            .bind(status.to_string())
            .bind(message_type.map(|t| t.to_string()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(S::TABLE, e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: S::TABLE,
                id,
            });
        }
        Ok(())
    }

    async fn try_insert_exception<D: ExceptionDirection>(
        &self,
        exception: &ExceptionEntity<D>,
    ) -> StoreResult<ExceptionEntity<D>> {
        let row = insert_exception(&self.pool, exception).await?;
        exception_from_row(&row)
    }

    async fn try_get_exception<D: ExceptionDirection>(
        &self,
        id: EntityId,
    ) -> StoreResult<ExceptionEntity<D>> {
        let sql = format!("SELECT {EXCEPTION_COLUMNS} FROM {} WHERE id = $1", D::TABLE);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(D::TABLE, e))?
            .ok_or(StoreError::NotFound {
                table: D::TABLE,
                id,
            })?;
        exception_from_row(&row)
    }

    async fn try_claim_exceptions<D: ExceptionDirection>(
        &self,
        from: Operation,
        limit: u32,
    ) -> StoreResult<Vec<ExceptionEntity<D>>> {
        let to = determine_target_operation(from, OperationEvent::Claim)?;
        let sql = format!(
            "UPDATE {table} SET operation = $1, modification_time = NOW() \
             WHERE id IN (\
                 SELECT id FROM {table} WHERE operation = $2 \
                 ORDER BY id LIMIT $3 FOR UPDATE SKIP LOCKED) \
             RETURNING {EXCEPTION_COLUMNS}",
            table = D::TABLE
        );
        let rows = sqlx::query(&sql)
            .bind(to.to_string())
            .bind(from.to_string())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(D::TABLE, e))?;
        let mut claimed: Vec<ExceptionEntity<D>> =
            rows.iter().map(exception_from_row).collect::<StoreResult<_>>()?;
        claimed.sort_by_key(|e| e.id);
        Ok(claimed)
    }

    async fn try_find_exceptions<D: ExceptionDirection>(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Vec<ExceptionEntity<D>>> {
        let sql = format!(
            "SELECT {EXCEPTION_COLUMNS} FROM {} WHERE ebms_ref_to_message_id = $1 ORDER BY id",
            D::TABLE
        );
        let rows = sqlx::query(&sql)
            .bind(ebms_message_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(D::TABLE, e))?;
        rows.iter().map(exception_from_row).collect()
    }

    async fn try_rearm_retry(&self, record_id: EntityId) -> StoreResult<bool> {
        let mut tx = self.begin().await?;
        let Some(record) = lock_retry_record(&mut tx, record_id).await? else {
            return Err(StoreError::NotFound {
                table: RETRY_TABLE,
                id: record_id,
            });
        };
        if record.status != RetryStatus::Busy {
            return Ok(false);
        }

        let rearmed = compare_and_set_operation(
            &mut *tx,
            record.target,
            Operation::ToBeRetried,
            OperationEvent::Rearm(record.retry_type),
        )
        .await?;

        sqlx::query(
            "UPDATE retry_reliability SET status = $1, modification_time = NOW() WHERE id = $2",
        )
        .bind(RetryStatus::Pending.to_string())
        .bind(record_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx(RETRY_TABLE, e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx(RETRY_TABLE, e))?;
        Ok(rearmed)
    }

    async fn try_apply_retry_update(&self, update: &RetryUpdate) -> StoreResult<bool> {
        let mut tx = self.begin().await?;

        if let Some(record_update) = &update.record {
            let record = lock_retry_record(&mut tx, record_update.id)
                .await?
                .ok_or(StoreError::NotFound {
                    table: RETRY_TABLE,
                    id: record_update.id,
                })?;
            if record.status.is_completed() {
                return Ok(false);
            }
        }

        let moved =
            compare_and_set_operation(&mut *tx, update.target, update.expected, update.event)
                .await?;
        if !moved {
            return Ok(false);
        }

        if let Some(record_update) = &update.record {
            sqlx::query(
                "UPDATE retry_reliability \
                 SET current_retry_count = $1, status = $2, last_retry_time = $3, \
                     modification_time = NOW() \
                 WHERE id = $4",
            )
            .bind(count_to_db(record_update.current_retry_count))
            .bind(record_update.status.to_string())
            .bind(record_update.last_retry_time)
            .bind(record_update.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx(RETRY_TABLE, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx(RETRY_TABLE, e))?;
        Ok(true)
    }

    async fn try_apply_reception_update(&self, update: &ReceptionUpdate) -> StoreResult<bool> {
        let mut tx = self.begin().await?;

        let sql = format!(
            "SELECT {RECEPTION_COLUMNS} FROM reception_awareness WHERE id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(update.record_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx(RECEPTION_TABLE, e))?
            .ok_or(StoreError::NotFound {
                table: RECEPTION_TABLE,
                id: update.record_id,
            })?;
        if reception_from_row(&row)?.status != RetryStatus::Busy {
            return Ok(false);
        }

        if let Some((message_id, event)) = update.message {
            let moved = compare_and_set_operation(
                &mut *tx,
                RetryTarget::OutMessage(message_id),
                Operation::Sent,
                event,
            )
            .await?;
            if !moved {
                sqlx::query(
                    "UPDATE reception_awareness SET status = $1, modification_time = NOW() \
                     WHERE id = $2",
                )
                .bind(RetryStatus::Pending.to_string())
                .bind(update.record_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::from_sqlx(RECEPTION_TABLE, e))?;
                tx.commit()
                    .await
                    .map_err(|e| StoreError::from_sqlx(RECEPTION_TABLE, e))?;
                return Ok(false);
            }
            if matches!(event, OperationEvent::Resend) {
                // A resent message gets its send budget back, keeping the count spent
                sqlx::query(
                    "UPDATE retry_reliability SET status = $1, modification_time = NOW() \
                     WHERE ref_to_out_message_id = $2 AND retry_type = $3",
                )
                .bind(RetryStatus::Pending.to_string())
                .bind(message_id)
                .bind(RetryType::Send.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::from_sqlx(RETRY_TABLE, e))?;
            }
        }

        if let Some(exception) = &update.exception {
            insert_exception(&mut *tx, exception).await?;
        }

        sqlx::query(
            "UPDATE reception_awareness \
             SET current_retry_count = $1, status = $2, last_send_time = $3, \
                 modification_time = NOW() \
             WHERE id = $4",
        )
        .bind(count_to_db(update.current_retry_count))
        .bind(update.status.to_string())
        .bind(update.last_send_time)
        .bind(update.record_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx(RECEPTION_TABLE, e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx(RECEPTION_TABLE, e))?;
        Ok(true)
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn insert_in_message(&self, message: InMessage) -> StoreResult<InMessage> {
        let message = &message;
        self.retry
            .run("insert_in_message", move || async move {
                self.try_insert_message(message).await
            })
            .await
    }

    async fn insert_out_message(&self, message: OutMessage) -> StoreResult<OutMessage> {
        let message = &message;
        self.retry
            .run("insert_out_message", move || async move {
                self.try_insert_message(message).await
            })
            .await
    }

    async fn get_in_message(&self, id: EntityId) -> StoreResult<InMessage> {
        self.retry
            .run("get_in_message", move || async move { self.try_get_message(id).await })
            .await
    }

    async fn get_out_message(&self, id: EntityId) -> StoreResult<OutMessage> {
        self.retry
            .run("get_out_message", move || async move { self.try_get_message(id).await })
            .await
    }

    async fn find_in_message_by_ebms_id(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Option<InMessage>> {
        self.retry
            .run("find_in_message", move || async move {
                self.try_find_message(ebms_message_id, true).await
            })
            .await
    }

    async fn find_out_message_by_ebms_id(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Option<OutMessage>> {
        self.retry
            .run("find_out_message", move || async move {
                self.try_find_message(ebms_message_id, false).await
            })
            .await
    }

    #[instrument(skip(self))]
    async fn claim_in_messages(&self, from: Operation, limit: u32) -> StoreResult<Vec<InMessage>> {
        self.retry
            .run("claim_in_messages", move || async move {
                self.try_claim_messages(from, limit).await
            })
            .await
    }

    #[instrument(skip(self))]
    async fn claim_out_messages(&self, from: Operation, limit: u32) -> StoreResult<Vec<OutMessage>> {
        self.retry
            .run("claim_out_messages", move || async move {
                self.try_claim_messages(from, limit).await
            })
            .await
    }

    async fn set_in_message_status(&self, id: EntityId, status: InStatus) -> StoreResult<()> {
        self.retry
            .run("set_in_message_status", move || async move {
                self.try_set_status(id, status, None).await
            })
            .await
    }

    async fn set_out_message_status(
        &self,
        id: EntityId,
        status: OutStatus,
        message_type: Option<MessageType>,
    ) -> StoreResult<()> {
        self.retry
            .run("set_out_message_status", move || async move {
                self.try_set_status(id, status, message_type).await
            })
            .await
    }

    async fn update_out_message_body(
        &self,
        id: EntityId,
        message_location: &str,
        is_signed: bool,
        is_encrypted: bool,
    ) -> StoreResult<()> {
        self.retry
            .run("update_out_message_body", move || async move {
                let result = sqlx::query(
                    "UPDATE out_messages \
                     SET message_location = $1, is_signed = $2, is_encrypted = $3, \
                         modification_time = NOW() \
                     WHERE id = $4",
                )
                .bind(message_location)
                .bind(is_signed)
                .bind(is_encrypted)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx(OutStatus::TABLE, e))?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound {
                        table: OutStatus::TABLE,
                        id,
                    });
                }
                Ok::<_, StoreError>(())
            })
            .await
    }

    async fn has_acknowledgement(&self, ebms_message_id: &str) -> StoreResult<bool> {
        self.retry
            .run("has_acknowledgement", move || async move {
                let row = sqlx::query(
                    "SELECT EXISTS (\
                         SELECT 1 FROM in_messages \
                         WHERE ebms_ref_to_message_id = $1 \
                           AND ebms_message_type IN ($2, $3)) AS acknowledged",
                )
                .bind(ebms_message_id)
                .bind(MessageType::Receipt.to_string())
                .bind(MessageType::Error.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx(InStatus::TABLE, e))?;
                row.try_get::<bool, _>("acknowledged")
                    .map_err(|e| StoreError::from_sqlx(InStatus::TABLE, e))
            })
            .await
    }

    async fn insert_in_exception(&self, exception: InException) -> StoreResult<InException> {
        let exception = &exception;
        self.retry
            .run("insert_in_exception", move || async move {
                self.try_insert_exception(exception).await
            })
            .await
    }

    async fn insert_out_exception(&self, exception: OutException) -> StoreResult<OutException> {
        let exception = &exception;
        self.retry
            .run("insert_out_exception", move || async move {
                self.try_insert_exception(exception).await
            })
            .await
    }

    async fn get_in_exception(&self, id: EntityId) -> StoreResult<InException> {
        self.retry
            .run("get_in_exception", move || async move {
                self.try_get_exception::<Inbound>(id).await
            })
            .await
    }

    async fn get_out_exception(&self, id: EntityId) -> StoreResult<OutException> {
        self.retry
            .run("get_out_exception", move || async move {
                self.try_get_exception::<Outbound>(id).await
            })
            .await
    }

    #[instrument(skip(self))]
    async fn claim_in_exceptions(
        &self,
        from: Operation,
        limit: u32,
    ) -> StoreResult<Vec<InException>> {
        self.retry
            .run("claim_in_exceptions", move || async move {
                self.try_claim_exceptions(from, limit).await
            })
            .await
    }

    #[instrument(skip(self))]
    async fn claim_out_exceptions(
        &self,
        from: Operation,
        limit: u32,
    ) -> StoreResult<Vec<OutException>> {
        self.retry
            .run("claim_out_exceptions", move || async move {
                self.try_claim_exceptions(from, limit).await
            })
            .await
    }

    async fn find_in_exceptions_by_ref(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Vec<InException>> {
        self.retry
            .run("find_in_exceptions", move || async move {
                self.try_find_exceptions(ebms_message_id).await
            })
            .await
    }

    async fn find_out_exceptions_by_ref(
        &self,
        ebms_message_id: &str,
    ) -> StoreResult<Vec<OutException>> {
        self.retry
            .run("find_out_exceptions", move || async move {
                self.try_find_exceptions(ebms_message_id).await
            })
            .await
    }

    async fn transition(
        &self,
        target: RetryTarget,
        expected: Operation,
        event: OperationEvent,
    ) -> StoreResult<bool> {
        self.retry
            .run("transition", move || async move {
                compare_and_set_operation(&self.pool, target, expected, event).await
            })
            .await
    }

    async fn insert_retry_reliability(
        &self,
        record: RetryReliability,
    ) -> StoreResult<RetryReliability> {
        let record = &record;
        self.retry
            .run("insert_retry_reliability", move || async move {
                let (in_message, out_message, in_exception, out_exception) =
                    target_columns(record.target);
                let sql = format!(
                    "INSERT INTO retry_reliability (ref_to_in_message_id, ref_to_out_message_id, \
                     ref_to_in_exception_id, ref_to_out_exception_id, current_retry_count, \
                     max_retry_count, retry_interval_ms, retry_type, status, last_retry_time, \
                     insertion_time, modification_time) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW()) \
                     RETURNING {RETRY_COLUMNS}"
                );
                let row = sqlx::query(&sql)
                    .bind(in_message)
                    .bind(out_message)
                    .bind(in_exception)
                    .bind(out_exception)
                    .bind(count_to_db(record.current_retry_count))
                    .bind(count_to_db(record.max_retry_count))
                    .bind(duration_to_ms(record.retry_interval))
                    .bind(record.retry_type.to_string())
                    .bind(record.status.to_string())
                    .bind(record.last_retry_time)
                    .bind(record.insertion_time)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| StoreError::from_sqlx(RETRY_TABLE, e))?;
                retry_from_row(&row)
            })
            .await
    }

    async fn find_retry_reliability(
        &self,
        target: RetryTarget,
        retry_type: RetryType,
    ) -> StoreResult<Option<RetryReliability>> {
        self.retry
            .run("find_retry_reliability", move || async move {
                let sql = format!(
                    "SELECT {RETRY_COLUMNS} FROM retry_reliability \
                     WHERE {} = $1 AND retry_type = $2",
                    target.column()
                );
                sqlx::query(&sql)
                    .bind(target.entity_id())
                    .bind(retry_type.to_string())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StoreError::from_sqlx(RETRY_TABLE, e))?
                    .map(|row| retry_from_row(&row))
                    .transpose()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<RetryReliability>> {
        self.retry
            .run("claim_due_retries", move || async move {
                let sql = format!(
                    "UPDATE retry_reliability SET status = $1, modification_time = $2 \
                     WHERE id IN (\
                         SELECT r.id FROM retry_reliability r \
                         LEFT JOIN in_messages im ON im.id = r.ref_to_in_message_id \
                         LEFT JOIN out_messages om ON om.id = r.ref_to_out_message_id \
                         LEFT JOIN in_exceptions ie ON ie.id = r.ref_to_in_exception_id \
                         LEFT JOIN out_exceptions oe ON oe.id = r.ref_to_out_exception_id \
                         WHERE r.status = $3 \
                           AND (r.last_retry_time IS NULL \
                                OR r.last_retry_time \
                                   + r.retry_interval_ms * INTERVAL '1 millisecond' <= $2) \
                           AND COALESCE(im.operation, om.operation, ie.operation, oe.operation) = $4 \
                         ORDER BY r.id LIMIT $5 \
                         FOR UPDATE OF r SKIP LOCKED) \
                     RETURNING {RETRY_COLUMNS}"
                );
                let rows = sqlx::query(&sql)
                    .bind(RetryStatus::Busy.to_string())
                    .bind(now)
                    .bind(RetryStatus::Pending.to_string())
                    .bind(Operation::ToBeRetried.to_string())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| StoreError::from_sqlx(RETRY_TABLE, e))?;
                let mut claimed: Vec<RetryReliability> =
                    rows.iter().map(retry_from_row).collect::<StoreResult<_>>()?;
                claimed.sort_by_key(|r| r.id);
                Ok::<_, StoreError>(claimed)
            })
            .await
    }

    async fn rearm_retry(&self, record_id: EntityId) -> StoreResult<bool> {
        self.retry
            .run("rearm_retry", move || async move {
                self.try_rearm_retry(record_id).await
            })
            .await
    }

    async fn apply_retry_update(&self, update: RetryUpdate) -> StoreResult<bool> {
        let update = &update;
        self.retry
            .run("apply_retry_update", move || async move {
                self.try_apply_retry_update(update).await
            })
            .await
    }

    async fn insert_reception_awareness(
        &self,
        record: ReceptionAwareness,
    ) -> StoreResult<ReceptionAwareness> {
        let record = &record;
        self.retry
            .run("insert_reception_awareness", move || async move {
                let sql = format!(
                    "INSERT INTO reception_awareness (ref_to_out_message_id, \
                     ref_to_ebms_message_id, current_retry_count, total_retry_count, \
                     retry_interval_ms, last_send_time, status, insertion_time, \
                     modification_time) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW()) \
                     RETURNING {RECEPTION_COLUMNS}"
                );
                let row = sqlx::query(&sql)
                    .bind(record.ref_to_out_message_id)
                    .bind(&record.ref_to_ebms_message_id)
                    .bind(count_to_db(record.current_retry_count))
                    .bind(count_to_db(record.total_retry_count))
                    .bind(duration_to_ms(record.retry_interval))
                    .bind(record.last_send_time)
                    .bind(record.status.to_string())
                    .bind(record.insertion_time)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| StoreError::from_sqlx(RECEPTION_TABLE, e))?;
                reception_from_row(&row)
            })
            .await
    }

    async fn find_reception_awareness(
        &self,
        out_message_id: EntityId,
    ) -> StoreResult<Option<ReceptionAwareness>> {
        self.retry
            .run("find_reception_awareness", move || async move {
                let sql = format!(
                    "SELECT {RECEPTION_COLUMNS} FROM reception_awareness \
                     WHERE ref_to_out_message_id = $1"
                );
                sqlx::query(&sql)
                    .bind(out_message_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StoreError::from_sqlx(RECEPTION_TABLE, e))?
                    .map(|row| reception_from_row(&row))
                    .transpose()
            })
            .await
    }

    #[instrument(skip(self))]
    async fn claim_due_reception_awareness(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<ReceptionAwareness>> {
        self.retry
            .run("claim_due_reception_awareness", move || async move {
                let sql = format!(
                    "UPDATE reception_awareness SET status = $1, modification_time = $2 \
                     WHERE id IN (\
                         SELECT ra.id FROM reception_awareness ra \
                         JOIN out_messages om ON om.id = ra.ref_to_out_message_id \
                         WHERE ra.status = $3 \
                           AND om.operation = $4 \
                           AND (ra.last_send_time IS NULL \
                                OR ra.last_send_time \
                                   + ra.retry_interval_ms * INTERVAL '1 millisecond' <= $2) \
                         ORDER BY ra.id LIMIT $5 \
                         FOR UPDATE OF ra SKIP LOCKED) \
                     RETURNING {RECEPTION_COLUMNS}"
                );
                let rows = sqlx::query(&sql)
                    .bind(RetryStatus::Busy.to_string())
                    .bind(now)
                    .bind(RetryStatus::Pending.to_string())
                    .bind(Operation::Sent.to_string())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| StoreError::from_sqlx(RECEPTION_TABLE, e))?;
                let mut claimed: Vec<ReceptionAwareness> =
                    rows.iter().map(reception_from_row).collect::<StoreResult<_>>()?;
                claimed.sort_by_key(|r| r.id);
                Ok::<_, StoreError>(claimed)
            })
            .await
    }

    async fn apply_reception_update(&self, update: ReceptionUpdate) -> StoreResult<bool> {
        let update = &update;
        self.retry
            .run("apply_reception_update", move || async move {
                self.try_apply_reception_update(update).await
            })
            .await
    }

    async fn complete_reception_awareness(&self, ebms_message_id: &str) -> StoreResult<bool> {
        self.retry
            .run("complete_reception_awareness", move || async move {
                let result = sqlx::query(
                    "UPDATE reception_awareness SET status = $1, modification_time = NOW() \
                     WHERE ref_to_ebms_message_id = $2 AND status <> $1",
                )
                .bind(RetryStatus::Completed.to_string())
                .bind(ebms_message_id)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx(RECEPTION_TABLE, e))?;
                Ok::<_, StoreError>(result.rows_affected() > 0)
            })
            .await
    }

    #[instrument(skip(self, criteria), fields(mpc = %criteria.mpc))]
    async fn select_piggyback_signal(
        &self,
        criteria: &PiggybackCriteria,
    ) -> StoreResult<Option<OutMessage>> {
        let to = determine_target_operation(Operation::ToBePiggyBacked, OperationEvent::Claim)?;
        self.retry
            .run("select_piggyback_signal", move || async move {
                let sql = format!(
                    "UPDATE out_messages SET operation = $1, modification_time = NOW() \
                     WHERE id = (\
                         SELECT id FROM out_messages \
                         WHERE operation = $2 \
                           AND ebms_message_type IN ($3, $4) \
                           AND mpc = $5 \
                           AND url = $6 \
                           AND ($7 OR NOT is_signed) \
                         ORDER BY insertion_time, id LIMIT 1 \
                         FOR UPDATE SKIP LOCKED) \
                     RETURNING {MESSAGE_COLUMNS}"
                );
                sqlx::query(&sql)
                    .bind(to.to_string())
                    .bind(Operation::ToBePiggyBacked.to_string())
                    .bind(MessageType::Receipt.to_string())
                    .bind(MessageType::Error.to_string())
                    .bind(&criteria.mpc)
                    .bind(&criteria.url)
                    .bind(criteria.signing_enabled)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StoreError::from_sqlx(OutStatus::TABLE, e))?
                    .map(|row| message_from_row(&row))
                    .transpose()
            })
            .await
    }
}

/// Check-and-set the Operation of `target`, moving the Status along with it
async fn compare_and_set_operation<'e, E: PgExecutor<'e>>(
    executor: E,
    target: RetryTarget,
    expected: Operation,
    event: OperationEvent,
) -> StoreResult<bool> {
    let next = determine_target_operation(expected, event)?;
    let status = match target {
        RetryTarget::InMessage(_) => InStatus::for_operation(next).map(|s| s.to_string()),
        RetryTarget::OutMessage(_) => OutStatus::for_operation(next).map(|s| s.to_string()),
        RetryTarget::InException(_) | RetryTarget::OutException(_) => None,
    };

    let query = match target {
        RetryTarget::InMessage(_) | RetryTarget::OutMessage(_) => sqlx::query(match target {
            RetryTarget::InMessage(_) => {
                "UPDATE in_messages SET operation = $1, status = COALESCE($2, status), \
                 modification_time = NOW() WHERE id = $3 AND operation = $4"
            }
            _ => {
                "UPDATE out_messages SET operation = $1, status = COALESCE($2, status), \
                 modification_time = NOW() WHERE id = $3 AND operation = $4"
            }
        })
        .bind(next.to_string())
        .bind(status),
        RetryTarget::InException(_) | RetryTarget::OutException(_) => sqlx::query(match target {
            RetryTarget::InException(_) => {
                "UPDATE in_exceptions SET operation = $1, modification_time = NOW() \
                 WHERE id = $2 AND operation = $3"
            }
            _ => {
                "UPDATE out_exceptions SET operation = $1, modification_time = NOW() \
                 WHERE id = $2 AND operation = $3"
            }
        })
        .bind(next.to_string()),
    };

    let result = query
        .bind(target.entity_id())
        .bind(expected.to_string())
        .execute(executor)
        .await
        .map_err(|e| StoreError::from_sqlx(target.table(), e))?;

    let moved = result.rows_affected() == 1;
    debug!(%target, %expected, %next, moved, "Operation check-and-set");
    Ok(moved)
}

async fn insert_exception<'e, E: PgExecutor<'e>, D: ExceptionDirection>(
    executor: E,
    exception: &ExceptionEntity<D>,
) -> StoreResult<PgRow> {
    let sql = format!(
        "INSERT INTO {} (ebms_ref_to_message_id, exception, pmode_id, pmode_data, message_body, \
         operation, notify_method, insertion_time, modification_time) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW()) \
         RETURNING {EXCEPTION_COLUMNS}",
        D::TABLE
    );
    sqlx::query(&sql)
        .bind(&exception.ebms_ref_to_message_id)
        .bind(&exception.exception)
        .bind(&exception.pmode_id)
        .bind(&exception.pmode_data)
        .bind(&exception.message_body)
        .bind(exception.operation.to_string())
        .bind(&exception.notify_method)
        .bind(exception.insertion_time)
        .fetch_one(executor)
        .await
        .map_err(|e| StoreError::from_sqlx(D::TABLE, e))
}

async fn lock_retry_record(
    tx: &mut Transaction<'_, Postgres>,
    id: EntityId,
) -> StoreResult<Option<RetryReliability>> {
    let sql = format!("SELECT {RETRY_COLUMNS} FROM retry_reliability WHERE id = $1 FOR UPDATE");
    sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| StoreError::from_sqlx(RETRY_TABLE, e))?
        .map(|row| retry_from_row(&row))
        .transpose()
}

fn target_columns(
    target: RetryTarget,
) -> (
    Option<EntityId>,
    Option<EntityId>,
    Option<EntityId>,
    Option<EntityId>,
) {
    match target {
        RetryTarget::InMessage(id) => (Some(id), None, None, None),
        RetryTarget::OutMessage(id) => (None, Some(id), None, None),
        RetryTarget::InException(id) => (None, None, Some(id), None),
        RetryTarget::OutException(id) => (None, None, None, Some(id)),
    }
}

fn count_to_db(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn column<'r, T>(row: &'r PgRow, table: &'static str, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(|e| StoreError::from_sqlx(table, e))
}

fn parsed<T: FromStr<Err = String>>(
    row: &PgRow,
    table: &'static str,
    name: &str,
) -> StoreResult<T> {
    let raw: String = column(row, table, name)?;
    raw.parse()
        .map_err(|e: String| StoreError::corrupt(table, format!("{name}: {e}")))
}

fn count(row: &PgRow, table: &'static str, name: &str) -> StoreResult<u32> {
    let raw: i32 = column(row, table, name)?;
    u32::try_from(raw).map_err(|_| StoreError::corrupt(table, format!("{name} is negative")))
}

fn interval(row: &PgRow, table: &'static str) -> StoreResult<Duration> {
    let raw: i64 = column(row, table, "retry_interval_ms")?;
    u64::try_from(raw)
        .map(Duration::from_millis)
        .map_err(|_| StoreError::corrupt(table, "retry_interval_ms is negative"))
}

fn message_from_row<S: MessageStatus>(row: &PgRow) -> StoreResult<MessageEntity<S>> {
    let table = S::TABLE;
    let mut message = MessageEntity::<S>::new(column::<String>(row, table, "ebms_message_id")?);
    message.id = column(row, table, "id")?;
    message.ebms_ref_to_message_id = column(row, table, "ebms_ref_to_message_id")?;
    message.message_location = column(row, table, "message_location")?;
    message.from_party = column(row, table, "from_party")?;
    message.to_party = column(row, table, "to_party")?;
    message.conversation_id = column(row, table, "conversation_id")?;
    message.pmode_id = column(row, table, "pmode_id")?;
    message.pmode_data = column(row, table, "pmode_data")?;
    message.mep = parsed(row, table, "mep")?;
    message.ebms_message_type = parsed(row, table, "ebms_message_type")?;
    message.operation = parsed(row, table, "operation")?;
    message.status = parsed(row, table, "status")?;
    message.mpc = column(row, table, "mpc")?;
    message.url = column(row, table, "url")?;
    message.is_signed = column(row, table, "is_signed")?;
    message.is_encrypted = column(row, table, "is_encrypted")?;
    message.is_duplicate = column(row, table, "is_duplicate")?;
    message.is_test = column(row, table, "is_test")?;
    message.insertion_time = column(row, table, "insertion_time")?;
    message.modification_time = column(row, table, "modification_time")?;
    Ok(message)
}

fn exception_from_row<D: ExceptionDirection>(row: &PgRow) -> StoreResult<ExceptionEntity<D>> {
    let table = D::TABLE;
    let mut exception = ExceptionEntity::<D>::new(
        column(row, table, "ebms_ref_to_message_id")?,
        column::<String>(row, table, "exception")?,
    );
    exception.id = column(row, table, "id")?;
    exception.pmode_id = column(row, table, "pmode_id")?;
    exception.pmode_data = column(row, table, "pmode_data")?;
    exception.message_body = column(row, table, "message_body")?;
    exception.operation = parsed(row, table, "operation")?;
    exception.notify_method = column(row, table, "notify_method")?;
    exception.insertion_time = column(row, table, "insertion_time")?;
    exception.modification_time = column(row, table, "modification_time")?;
    Ok(exception)
}

fn retry_from_row(row: &PgRow) -> StoreResult<RetryReliability> {
    let table = RETRY_TABLE;
    let target = RetryTarget::from_columns(
        column(row, table, "ref_to_in_message_id")?,
        column(row, table, "ref_to_out_message_id")?,
        column(row, table, "ref_to_in_exception_id")?,
        column(row, table, "ref_to_out_exception_id")?,
    )
    .ok_or_else(|| StoreError::corrupt(table, "exactly one reference must be set"))?;

    let mut record = RetryReliability::new(
        target,
        parsed(row, table, "retry_type")?,
        count(row, table, "max_retry_count")?,
        interval(row, table)?,
    );
    record.id = column(row, table, "id")?;
    record.current_retry_count = count(row, table, "current_retry_count")?;
    record.status = parsed(row, table, "status")?;
    record.last_retry_time = column(row, table, "last_retry_time")?;
    record.insertion_time = column(row, table, "insertion_time")?;
    record.modification_time = column(row, table, "modification_time")?;
    Ok(record)
}

fn reception_from_row(row: &PgRow) -> StoreResult<ReceptionAwareness> {
    let table = RECEPTION_TABLE;
    let mut record = ReceptionAwareness::new(
        column(row, table, "ref_to_out_message_id")?,
        column::<String>(row, table, "ref_to_ebms_message_id")?,
        count(row, table, "total_retry_count")?,
        interval(row, table)?,
    );
    record.id = column(row, table, "id")?;
    record.current_retry_count = count(row, table, "current_retry_count")?;
    record.last_send_time = column(row, table, "last_send_time")?;
    record.status = parsed(row, table, "status")?;
    record.insertion_time = column(row, table, "insertion_time")?;
    record.modification_time = column(row, table, "modification_time")?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_columns_set_exactly_one() {
        let columns = target_columns(RetryTarget::OutException(9));
        assert_eq!(columns, (None, None, None, Some(9)));
        assert_eq!(
            RetryTarget::from_columns(columns.0, columns.1, columns.2, columns.3),
            Some(RetryTarget::OutException(9))
        );
    }

    #[test]
    fn test_numeric_conversions_saturate() {
        assert_eq!(count_to_db(u32::MAX), i32::MAX);
        assert_eq!(duration_to_ms(Duration::from_secs(2)), 2000);
    }
}
