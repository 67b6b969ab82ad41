//! PostgreSQL durable store
//!
//! The production implementation of the work coordinator: all eight steps of
//! `process_work_batch` commit in one transaction, so reported results,
//! stored messages, orphan recovery, and the returned claim are never
//! observed partially. Claims use `FOR UPDATE SKIP LOCKED` so concurrent
//! instances never block each other on the same rows.
//!
//! The claim SQL mirrors `rly_domain::claim::plan_claims` clause-for-clause;
//! change one and you must change the other.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};

use rly_domain::{
    instance_rank, partition_for_stream, Envelope, EventRecord, InboxWork, InstanceId,
    MessageCompletion, MessageFailure, MessageId, NewInboxMessage, NewOutboxMessage, OutboxWork,
    StreamId, WorkBatchOptions, WorkBatchReply, WorkBatchRequest, EMPTY_STREAM_SEQUENCE,
};
use rly_ports::{CoordinatorError, EventStore, EventStoreError, WorkCoordinator};

/// Schema applied by `ensure_schema`
const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS relay;

CREATE TABLE IF NOT EXISTS relay.outbox (
    message_id       TEXT PRIMARY KEY,
    destination      TEXT NOT NULL,
    envelope_type    TEXT NOT NULL,
    envelope         JSONB NOT NULL,
    metadata         JSONB,
    stream_id        TEXT NOT NULL,
    partition_number INTEGER NOT NULL,
    status_flags     INTEGER NOT NULL DEFAULT 1,
    attempts         INTEGER NOT NULL DEFAULT 0,
    instance_id      TEXT,
    lease_expiry     TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    published_at     TIMESTAMPTZ,
    processed_at     TIMESTAMPTZ,
    error            TEXT,
    CONSTRAINT outbox_lease_paired CHECK ((instance_id IS NULL) = (lease_expiry IS NULL))
);

CREATE INDEX IF NOT EXISTS outbox_claim_idx
    ON relay.outbox (partition_number, created_at)
    WHERE (status_flags & 4) = 0;

CREATE INDEX IF NOT EXISTS outbox_stream_idx
    ON relay.outbox (stream_id, created_at);

CREATE TABLE IF NOT EXISTS relay.inbox (
    message_id       TEXT PRIMARY KEY,
    handler_name     TEXT NOT NULL,
    envelope_type    TEXT NOT NULL,
    envelope         JSONB NOT NULL,
    metadata         JSONB,
    stream_id        TEXT NOT NULL,
    partition_number INTEGER NOT NULL,
    status_flags     INTEGER NOT NULL DEFAULT 1,
    attempts         INTEGER NOT NULL DEFAULT 0,
    instance_id      TEXT,
    lease_expiry     TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    published_at     TIMESTAMPTZ,
    processed_at     TIMESTAMPTZ,
    error            TEXT,
    CONSTRAINT inbox_lease_paired CHECK ((instance_id IS NULL) = (lease_expiry IS NULL))
);

CREATE INDEX IF NOT EXISTS inbox_claim_idx
    ON relay.inbox (partition_number, created_at)
    WHERE (status_flags & 4) = 0;

CREATE INDEX IF NOT EXISTS inbox_stream_idx
    ON relay.inbox (stream_id, created_at);

CREATE TABLE IF NOT EXISTS relay.event_store (
    stream_id   TEXT NOT NULL,
    sequence    BIGINT NOT NULL,
    event_id    TEXT NOT NULL,
    envelope    JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (stream_id, sequence)
);

CREATE INDEX IF NOT EXISTS event_store_event_id_idx
    ON relay.event_store (stream_id, event_id);

CREATE TABLE IF NOT EXISTS relay.service_instances (
    instance_id       TEXT PRIMARY KEY,
    service_name      TEXT NOT NULL,
    host_name         TEXT NOT NULL,
    process_id        INTEGER NOT NULL,
    started_at        TIMESTAMPTZ NOT NULL,
    last_heartbeat_at TIMESTAMPTZ NOT NULL,
    metadata          JSONB
);

CREATE INDEX IF NOT EXISTS service_instances_alive_idx
    ON relay.service_instances (service_name, last_heartbeat_at);

CREATE TABLE IF NOT EXISTS relay.message_deduplication (
    message_id    TEXT PRIMARY KEY,
    first_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS relay.sequences (
    name  TEXT PRIMARY KEY,
    value BIGINT NOT NULL
);
"#;

fn db_err(e: sqlx::Error) -> CoordinatorError {
    CoordinatorError::ConnectionError {
        message: e.to_string(),
    }
}

fn es_err(e: sqlx::Error) -> EventStoreError {
    EventStoreError::ConnectionError {
        message: e.to_string(),
    }
}

/// PostgreSQL-backed work store
pub struct PostgresWorkStore {
    pool: PgPool,
}

impl PostgresWorkStore {
    /// Create a store over an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and create a store
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoordinatorError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    /// Get a reference to the underlying pool (for testing/migrations)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema; idempotent
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), CoordinatorError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        debug!("Durable store schema ensured");
        Ok(())
    }

    /// Allocate the next value of a named monotone counter, starting at 0
    pub async fn allocate_sequence(&self, name: &str) -> Result<i64, CoordinatorError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO relay.sequences (name, value)
            VALUES ($1, 0)
            ON CONFLICT (name) DO UPDATE SET value = relay.sequences.value + 1
            RETURNING value
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn upsert_heartbeat(
        tx: &mut Transaction<'_, Postgres>,
        request: &WorkBatchRequest,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        sqlx::query(
            r#"
            INSERT INTO relay.service_instances
                (instance_id, service_name, host_name, process_id, started_at, last_heartbeat_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $5, $6)
            ON CONFLICT (instance_id) DO UPDATE
            SET last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                host_name = EXCLUDED.host_name,
                process_id = EXCLUDED.process_id,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(request.instance.instance_id.as_str())
        .bind(&request.instance.service_name)
        .bind(&request.instance.host_name)
        .bind(request.instance.process_id as i32)
        .bind(now)
        .bind(&request.instance.metadata)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn apply_completions(
        tx: &mut Transaction<'_, Postgres>,
        table: QueueTable,
        completions: &[MessageCompletion],
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        for completion in completions {
            if completion.status.is_none() {
                // Release without progress: lease cleared, flags untouched
                sqlx::query(&format!(
                    "UPDATE {} SET instance_id = NULL, lease_expiry = NULL WHERE message_id = $1",
                    table.name()
                ))
                .bind(completion.message_id.as_str())
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
                continue;
            }

            // A completion resolves any prior failure before OR-ing its
            // status in, so a retried-and-succeeded row is clean again.
            // Outbox completions stamp published_at on the first PUBLISHED
            // bit; inbox completions stamp processed_at once. The in-memory
            // store applies the same conditions.
            let stamp = match table {
                QueueTable::Outbox => {
                    "published_at = CASE \
                         WHEN ($2 & 4) <> 0 AND published_at IS NULL THEN $3 \
                         ELSE published_at \
                     END"
                }
                QueueTable::Inbox => {
                    "processed_at = CASE \
                         WHEN processed_at IS NULL THEN $3 \
                         ELSE processed_at \
                     END"
                }
            };
            sqlx::query(&format!(
                r#"
                UPDATE {table}
                SET status_flags = (status_flags & ~24) | $2,
                    {stamp},
                    instance_id = NULL,
                    lease_expiry = NULL
                WHERE message_id = $1
                "#,
                table = table.name(),
                stamp = stamp,
            ))
            .bind(completion.message_id.as_str())
            .bind(completion.status.bits() as i32)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;

            if table == QueueTable::Inbox {
                sqlx::query(
                    "DELETE FROM relay.inbox WHERE message_id = $1 AND (status_flags & 7) = 7",
                )
                .bind(completion.message_id.as_str())
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
            }
        }
        Ok(())
    }

    /// Apply failures and return the failed rows' stream positions for the
    /// cascade step
    async fn apply_failures(
        tx: &mut Transaction<'_, Postgres>,
        table: QueueTable,
        failures: &[MessageFailure],
        max_attempts: u32,
    ) -> Result<Vec<(String, DateTime<Utc>, String)>, CoordinatorError> {
        let mut failed = Vec::with_capacity(failures.len());
        for failure in failures {
            let row = sqlx::query(&format!(
                r#"
                UPDATE {}
                SET attempts = attempts + 1,
                    status_flags = CASE
                        WHEN attempts + 1 >= $4 THEN (status_flags | $2 | 8) & ~16
                        ELSE status_flags | $2 | 8 | 16
                    END,
                    error = $3,
                    instance_id = NULL,
                    lease_expiry = NULL
                WHERE message_id = $1
                RETURNING stream_id, created_at, message_id
                "#,
                table.name()
            ))
            .bind(failure.message_id.as_str())
            .bind(failure.completed_status.bits() as i32)
            .bind(&failure.error)
            .bind(max_attempts as i32)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;

            if let Some(row) = row {
                failed.push((
                    row.get("stream_id"),
                    row.get("created_at"),
                    row.get("message_id"),
                ));
            }
        }
        Ok(failed)
    }

    /// Release every later not-yet-published row of a failed row's stream
    async fn cascade_release(
        tx: &mut Transaction<'_, Postgres>,
        table: QueueTable,
        failed: &[(String, DateTime<Utc>, String)],
    ) -> Result<(), CoordinatorError> {
        for (stream_id, created_at, message_id) in failed {
            let released = sqlx::query(&format!(
                r#"
                UPDATE {}
                SET instance_id = NULL, lease_expiry = NULL
                WHERE stream_id = $1
                  AND (status_flags & 4) = 0
                  AND (created_at, message_id) > ($2, $3)
                  AND instance_id IS NOT NULL
                "#,
                table.name()
            ))
            .bind(stream_id)
            .bind(created_at)
            .bind(message_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;

            if released.rows_affected() > 0 {
                debug!(
                    stream_id = %stream_id,
                    released = released.rows_affected(),
                    "Stream failure cascade released later rows"
                );
            }
        }
        Ok(())
    }

    async fn insert_outbox(
        tx: &mut Transaction<'_, Postgres>,
        messages: &[NewOutboxMessage],
        options: &WorkBatchOptions,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        for new in messages {
            let partition = partition_for_stream(&new.stream_id, options.partition_count);
            sqlx::query(
                r#"
                INSERT INTO relay.outbox
                    (message_id, destination, envelope_type, envelope, metadata,
                     stream_id, partition_number, status_flags, attempts, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 1, 0, $8)
                ON CONFLICT (message_id) DO NOTHING
                "#,
            )
            .bind(new.message_id.as_str())
            .bind(&new.destination)
            .bind(&new.envelope_type)
            .bind(&new.envelope)
            .bind(&new.metadata)
            .bind(new.stream_id.as_str())
            .bind(partition as i32)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn insert_inbox(
        tx: &mut Transaction<'_, Postgres>,
        messages: &[NewInboxMessage],
        options: &WorkBatchOptions,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        for new in messages {
            // The dedup row gates the insert: a redelivered message id never
            // produces a second inbox row.
            let fresh = sqlx::query(
                r#"
                INSERT INTO relay.message_deduplication (message_id, first_seen_at)
                VALUES ($1, $2)
                ON CONFLICT (message_id) DO NOTHING
                RETURNING message_id
                "#,
            )
            .bind(new.message_id.as_str())
            .bind(now)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;

            if fresh.is_none() {
                continue;
            }

            let partition = partition_for_stream(&new.stream_id, options.partition_count);
            sqlx::query(
                r#"
                INSERT INTO relay.inbox
                    (message_id, handler_name, envelope_type, envelope, metadata,
                     stream_id, partition_number, status_flags, attempts, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 1, 0, $8)
                ON CONFLICT (message_id) DO NOTHING
                "#,
            )
            .bind(new.message_id.as_str())
            .bind(&new.handler_name)
            .bind(&new.envelope_type)
            .bind(&new.envelope)
            .bind(&new.metadata)
            .bind(new.stream_id.as_str())
            .bind(partition as i32)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn renew_leases(
        tx: &mut Transaction<'_, Postgres>,
        table: QueueTable,
        ids: &[MessageId],
        instance_id: &InstanceId,
        expiry: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET lease_expiry = $3
            WHERE message_id = ANY($1) AND instance_id = $2
            "#,
            table.name()
        ))
        .bind(&ids)
        .bind(instance_id.as_str())
        .bind(expiry)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn alive_instances(
        tx: &mut Transaction<'_, Postgres>,
        service_name: &str,
        now: DateTime<Utc>,
        stale_threshold_seconds: u32,
    ) -> Result<Vec<InstanceId>, CoordinatorError> {
        let cutoff = now - Duration::seconds(i64::from(stale_threshold_seconds));
        let rows = sqlx::query(
            r#"
            SELECT instance_id
            FROM relay.service_instances
            WHERE service_name = $1 AND last_heartbeat_at > $2
            ORDER BY instance_id ASC
            "#,
        )
        .bind(service_name)
        .bind(cutoff)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| InstanceId::from_string(row.get("instance_id")))
            .collect())
    }

    /// The claim: candidate filter, stream-order exclusion, modulo
    /// assignment, and lease acquisition in one statement.
    ///
    /// The WHERE clauses are the SQL rendering of
    /// `rly_domain::claim::plan_claims`; the NOT EXISTS implements the
    /// cross-instance stream-ordering rule.
    async fn claim_rows(
        tx: &mut Transaction<'_, Postgres>,
        table: QueueTable,
        instance_id: &InstanceId,
        rank: u32,
        alive_count: u32,
        options: &WorkBatchOptions,
        now: DateTime<Utc>,
    ) -> Result<Vec<PgRow>, CoordinatorError> {
        if options.batch_size == 0 || alive_count == 0 {
            return Ok(Vec::new());
        }
        let expiry = now + Duration::seconds(i64::from(options.lease_seconds));
        let rows = sqlx::query(&format!(
            r#"
            WITH candidates AS (
                SELECT q.message_id
                FROM {table} q
                WHERE (q.status_flags & 4) = 0
                  AND ((q.status_flags & 8) = 0 OR (q.status_flags & 16) <> 0)
                  AND (q.instance_id IS NULL OR q.lease_expiry < $1)
                  AND (q.partition_number % $2) = $3
                  AND NOT EXISTS (
                      SELECT 1
                      FROM {table} older
                      WHERE older.stream_id = q.stream_id
                        AND (older.status_flags & 4) = 0
                        AND (older.created_at, older.message_id) < (q.created_at, q.message_id)
                        AND (
                            (older.instance_id IS NOT NULL
                                 AND older.instance_id <> $4
                                 AND older.lease_expiry >= $1)
                            OR ((older.status_flags & 8) <> 0 AND (older.status_flags & 16) = 0)
                        )
                  )
                ORDER BY q.created_at ASC, q.message_id ASC
                LIMIT $5
                FOR UPDATE OF q SKIP LOCKED
            )
            UPDATE {table} u
            SET instance_id = $4, lease_expiry = $6
            FROM candidates c
            WHERE u.message_id = c.message_id
            RETURNING u.message_id, u.{routing}, u.envelope_type, u.envelope, u.metadata,
                      u.stream_id, u.partition_number, u.attempts, u.created_at
            "#,
            table = table.name(),
            routing = table.routing_column(),
        ))
        .bind(now)
        .bind(alive_count as i32)
        .bind(rank as i32)
        .bind(instance_id.as_str())
        .bind(options.batch_size as i64)
        .bind(expiry)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(rows)
    }
}

/// The two queue tables sharing one shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueTable {
    Outbox,
    Inbox,
}

impl QueueTable {
    fn name(self) -> &'static str {
        match self {
            QueueTable::Outbox => "relay.outbox",
            QueueTable::Inbox => "relay.inbox",
        }
    }

    fn routing_column(self) -> &'static str {
        match self {
            QueueTable::Outbox => "destination",
            QueueTable::Inbox => "handler_name",
        }
    }
}

fn row_to_outbox_work(row: &PgRow) -> OutboxWork {
    OutboxWork {
        message_id: MessageId::from_string(row.get("message_id")),
        destination: row.get("destination"),
        envelope_type: row.get("envelope_type"),
        envelope: row.get("envelope"),
        metadata: row.get::<Option<serde_json::Value>, _>("metadata").unwrap_or(serde_json::Value::Null),
        stream_id: StreamId::from_string(row.get("stream_id")),
        partition_number: row.get::<i32, _>("partition_number") as u32,
        attempts: row.get::<i32, _>("attempts") as u32,
        created_at: row.get("created_at"),
    }
}

fn row_to_inbox_work(row: &PgRow) -> InboxWork {
    InboxWork {
        message_id: MessageId::from_string(row.get("message_id")),
        handler_name: row.get("handler_name"),
        envelope_type: row.get("envelope_type"),
        envelope: row.get("envelope"),
        metadata: row.get::<Option<serde_json::Value>, _>("metadata").unwrap_or(serde_json::Value::Null),
        stream_id: StreamId::from_string(row.get("stream_id")),
        partition_number: row.get::<i32, _>("partition_number") as u32,
        attempts: row.get::<i32, _>("attempts") as u32,
        created_at: row.get("created_at"),
    }
}

impl WorkCoordinator for PostgresWorkStore {
    /// One atomic round-trip: heartbeat, completions, failures, cascade,
    /// inserts, renewals, claim. Either everything commits or nothing does.
    #[instrument(skip(self, request), fields(instance_id = %request.instance.instance_id))]
    async fn process_work_batch(
        &self,
        request: WorkBatchRequest,
    ) -> Result<WorkBatchReply, CoordinatorError> {
        let now = Utc::now();
        let options = request.options;
        let me = request.instance.instance_id.clone();
        let lease_expiry = now + Duration::seconds(i64::from(options.lease_seconds));

        let mut tx = self.pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin work batch transaction");
            db_err(e)
        })?;

        // 1. Heartbeat upsert
        Self::upsert_heartbeat(&mut tx, &request, now).await?;

        // 2. Apply completions
        Self::apply_completions(&mut tx, QueueTable::Outbox, &request.outbox_completions, now)
            .await?;
        Self::apply_completions(&mut tx, QueueTable::Inbox, &request.inbox_completions, now)
            .await?;

        // 3. Apply failures
        let failed_outbox = Self::apply_failures(
            &mut tx,
            QueueTable::Outbox,
            &request.outbox_failures,
            options.max_attempts,
        )
        .await?;
        let failed_inbox = Self::apply_failures(
            &mut tx,
            QueueTable::Inbox,
            &request.inbox_failures,
            options.max_attempts,
        )
        .await?;

        // 4. Stream failure cascade
        Self::cascade_release(&mut tx, QueueTable::Outbox, &failed_outbox).await?;
        Self::cascade_release(&mut tx, QueueTable::Inbox, &failed_inbox).await?;

        // 5. Insert new messages
        Self::insert_outbox(&mut tx, &request.new_outbox_messages, &options, now).await?;
        Self::insert_inbox(&mut tx, &request.new_inbox_messages, &options, now).await?;

        // 6. Renew leases
        Self::renew_leases(
            &mut tx,
            QueueTable::Outbox,
            &request.renew_outbox_lease_ids,
            &me,
            lease_expiry,
        )
        .await?;
        Self::renew_leases(
            &mut tx,
            QueueTable::Inbox,
            &request.renew_inbox_lease_ids,
            &me,
            lease_expiry,
        )
        .await?;

        // 7/8. Claim work and return it in batch order
        let alive = Self::alive_instances(
            &mut tx,
            &request.instance.service_name,
            now,
            options.stale_threshold_seconds,
        )
        .await?;

        let mut reply = WorkBatchReply::default();
        if let Some((rank, count)) = instance_rank(&me, &alive) {
            let outbox_rows = Self::claim_rows(
                &mut tx,
                QueueTable::Outbox,
                &me,
                rank,
                count,
                &options,
                now,
            )
            .await?;
            reply.outbox = outbox_rows.iter().map(row_to_outbox_work).collect();
            reply
                .outbox
                .sort_by(|a, b| (a.created_at, &a.message_id).cmp(&(b.created_at, &b.message_id)));

            let inbox_rows = Self::claim_rows(
                &mut tx,
                QueueTable::Inbox,
                &me,
                rank,
                count,
                &options,
                now,
            )
            .await?;
            reply.inbox = inbox_rows.iter().map(row_to_inbox_work).collect();
            reply
                .inbox
                .sort_by(|a, b| (a.created_at, &a.message_id).cmp(&(b.created_at, &b.message_id)));
        }

        tx.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit work batch transaction");
            db_err(e)
        })?;

        debug!(
            outbox_claimed = reply.outbox.len(),
            inbox_claimed = reply.inbox.len(),
            "Work batch processed"
        );
        Ok(reply)
    }

    async fn is_duplicate(&self, message_id: &MessageId) -> Result<bool, CoordinatorError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM relay.message_deduplication WHERE message_id = $1)",
        )
        .bind(message_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }
}

impl EventStore for PostgresWorkStore {
    /// Append under the stream's sequence-counter row lock, so concurrent
    /// appends to one stream serialize and sequences stay gapless.
    #[instrument(skip(self, envelope), fields(stream_id = %stream_id))]
    async fn append(
        &self,
        stream_id: &StreamId,
        envelope: &Envelope,
    ) -> Result<i64, EventStoreError> {
        let envelope_value =
            serde_json::to_value(envelope).map_err(|e| EventStoreError::SerializationError {
                message: e.to_string(),
            })?;

        let mut tx = self.pool.begin().await.map_err(es_err)?;

        let sequence = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO relay.sequences (name, value)
            VALUES ($1, 0)
            ON CONFLICT (name) DO UPDATE SET value = relay.sequences.value + 1
            RETURNING value
            "#,
        )
        .bind(format!("event_store:{}", stream_id.as_str()))
        .fetch_one(&mut *tx)
        .await
        .map_err(es_err)?;

        sqlx::query(
            r#"
            INSERT INTO relay.event_store (stream_id, sequence, event_id, envelope, recorded_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(stream_id.as_str())
        .bind(sequence)
        .bind(envelope.message_id.as_str())
        .bind(&envelope_value)
        .execute(&mut *tx)
        .await
        .map_err(es_err)?;

        tx.commit().await.map_err(es_err)?;
        Ok(sequence)
    }

    async fn read(
        &self,
        stream_id: &StreamId,
        from_sequence: i64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT stream_id, sequence, event_id, envelope, recorded_at
            FROM relay.event_store
            WHERE stream_id = $1 AND sequence >= $2
            ORDER BY sequence ASC
            LIMIT $3
            "#,
        )
        .bind(stream_id.as_str())
        .bind(from_sequence)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(es_err)?;

        Ok(rows.iter().map(row_to_event_record).collect())
    }

    async fn last_sequence(&self, stream_id: &StreamId) -> Result<i64, EventStoreError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(sequence), $2) FROM relay.event_store WHERE stream_id = $1",
        )
        .bind(stream_id.as_str())
        .bind(EMPTY_STREAM_SEQUENCE)
        .fetch_one(&self.pool)
        .await
        .map_err(es_err)
    }

    async fn events_between(
        &self,
        stream_id: &StreamId,
        after_event_id: Option<&MessageId>,
        up_to_event_id: &MessageId,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT stream_id, sequence, event_id, envelope, recorded_at
            FROM relay.event_store
            WHERE stream_id = $1
              AND ($2::TEXT IS NULL OR event_id > $2)
              AND event_id <= $3
            ORDER BY event_id ASC
            "#,
        )
        .bind(stream_id.as_str())
        .bind(after_event_id.map(|id| id.as_str().to_string()))
        .bind(up_to_event_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(es_err)?;

        Ok(rows.iter().map(row_to_event_record).collect())
    }
}

fn row_to_event_record(row: &PgRow) -> EventRecord {
    EventRecord {
        stream_id: StreamId::from_string(row.get("stream_id")),
        sequence: row.get("sequence"),
        event_id: MessageId::from_string(row.get("event_id")),
        envelope: row.get("envelope"),
        recorded_at: row.get("recorded_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rly_domain::StatusFlags;

    #[test]
    fn test_schema_declares_all_tables() {
        for table in [
            "relay.outbox",
            "relay.inbox",
            "relay.event_store",
            "relay.service_instances",
            "relay.message_deduplication",
            "relay.sequences",
        ] {
            assert!(SCHEMA_SQL.contains(table), "schema missing {table}");
        }
    }

    #[test]
    fn test_schema_pairs_lease_columns() {
        assert!(SCHEMA_SQL.contains("(instance_id IS NULL) = (lease_expiry IS NULL)"));
    }

    #[test]
    fn test_queue_table_mapping() {
        assert_eq!(QueueTable::Outbox.name(), "relay.outbox");
        assert_eq!(QueueTable::Inbox.name(), "relay.inbox");
        assert_eq!(QueueTable::Outbox.routing_column(), "destination");
        assert_eq!(QueueTable::Inbox.routing_column(), "handler_name");
    }

    #[test]
    fn test_status_flag_literals_match_domain() {
        // The SQL uses literal bit values; keep them in lock-step with the
        // domain constants.
        assert_eq!(StatusFlags::PUBLISHED.bits(), 4);
        assert_eq!(StatusFlags::FAILED.bits(), 8);
        assert_eq!(StatusFlags::RETRY.bits(), 16);
        assert_eq!((StatusFlags::FAILED | StatusFlags::RETRY).bits(), 24);
        assert_eq!(StatusFlags::FULLY_COMPLETED.bits(), 7);
    }
}
