//! PostgreSQL implementation of TaskHubStore
//!
//! Production persistence using PostgreSQL with:
//! - Instance locks with expiring lease tokens
//! - Efficient work claiming with SKIP LOCKED
//! - One transaction per commit, guarded by the history length

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{apply_instance_update, StoreError, TaskHubStore};
use super::work_item::*;
use crate::history::{HistoryEvent, InstanceState, OrchestrationStatus, RecordedEvent};

/// Instances considered per orchestrator lease attempt
const LEASE_CANDIDATES: i64 = 16;

/// PostgreSQL implementation of TaskHubStore
///
/// Uses a connection pool for efficient database access. Time is read from
/// the database (`NOW()`), so all workers agree on lease expiry.
///
/// # Example
///
/// ```ignore
/// use taskhub_durable::PostgresTaskHubStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresTaskHubStore::new(pool);
/// store.initialize().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskHubStore {
    pool: PgPool,
}

impl PostgresTaskHubStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a pool of at most `max_connections`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis() as i64
}

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

// =============================================================================
// Row mapping
// =============================================================================

fn row_to_instance(row: &PgRow) -> Result<InstanceState, StoreError> {
    let status: String = row.get("status");
    let failure: Option<serde_json::Value> = row.get("failure");
    let parent: Option<serde_json::Value> = row.get("parent");

    Ok(InstanceState {
        instance_id: row.get("instance_id"),
        execution_id: row.get("execution_id"),
        name: row.get("name"),
        status: status
            .parse::<OrchestrationStatus>()
            .map_err(StoreError::Serialization)?,
        input: row.get("input"),
        output: row.get("output"),
        custom_status: row.get("custom_status"),
        failure: failure.map(serde_json::from_value).transpose()?,
        parent: parent.map(serde_json::from_value).transpose()?,
        history_length: row.get("history_length"),
        created_at: row.get("created_at"),
        last_updated_at: row.get("last_updated_at"),
    })
}

fn row_to_lease(row: &PgRow) -> Lease {
    Lease {
        token: row.get("lock_token"),
        owner: row.get("locked_by"),
        expires_at: row.get("locked_until"),
    }
}

fn row_to_activity(row: &PgRow) -> ActivityWorkItem {
    ActivityWorkItem {
        id: row.get("id"),
        request: ActivityRequest {
            instance_id: row.get("instance_id"),
            execution_id: row.get("execution_id"),
            task_id: row.get::<i64, _>("task_id") as u64,
            name: row.get("name"),
            input: row.get("input"),
        },
        lease: row_to_lease(row),
        dequeue_count: row.get::<i32, _>("dequeue_count") as u32,
    }
}

fn row_to_timer(row: &PgRow) -> TimerWorkItem {
    TimerWorkItem {
        id: row.get("id"),
        request: TimerRequest {
            instance_id: row.get("instance_id"),
            execution_id: row.get("execution_id"),
            timer_id: row.get::<i64, _>("timer_id") as u64,
            fire_at: row.get("fire_at"),
        },
        lease: row_to_lease(row),
        dequeue_count: row.get::<i32, _>("dequeue_count") as u32,
    }
}

fn row_to_dead_letter(row: &PgRow) -> Result<DeadLetterEntry, StoreError> {
    let queue: String = row.get("queue_kind");
    Ok(DeadLetterEntry {
        id: row.get("id"),
        queue: queue.parse().map_err(StoreError::Serialization)?,
        instance_id: row.get("instance_id"),
        payload: row.get("payload"),
        reason: row.get("reason"),
        dequeue_count: row.get::<i32, _>("dequeue_count") as u32,
        created_at: row.get("created_at"),
    })
}

// =============================================================================
// Transaction helpers
// =============================================================================

async fn fetch_instance(
    conn: &mut PgConnection,
    instance_id: &str,
    for_update: bool,
) -> Result<Option<InstanceState>, StoreError> {
    let query = if for_update {
        "SELECT * FROM taskhub_instances WHERE instance_id = $1 FOR UPDATE"
    } else {
        "SELECT * FROM taskhub_instances WHERE instance_id = $1"
    };
    let row = sqlx::query(query)
        .bind(instance_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    row.as_ref().map(row_to_instance).transpose()
}

async fn fetch_history(
    conn: &mut PgConnection,
    instance_id: &str,
    execution_id: &str,
) -> Result<Vec<RecordedEvent>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT sequence_num, payload, created_at
        FROM taskhub_history
        WHERE instance_id = $1 AND execution_id = $2
        ORDER BY sequence_num
        "#,
    )
    .bind(instance_id)
    .bind(execution_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let payload: serde_json::Value = row.get("payload");
        events.push(RecordedEvent {
            sequence: row.get("sequence_num"),
            timestamp: row.get("created_at"),
            event: serde_json::from_value(payload)?,
        });
    }
    Ok(events)
}

async fn insert_instance(
    conn: &mut PgConnection,
    instance: &NewInstance,
) -> Result<bool, StoreError> {
    let parent = instance
        .parent
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    let result = sqlx::query(
        r#"
        INSERT INTO taskhub_instances (instance_id, execution_id, name, status, input, parent)
        VALUES ($1, $2, $3, 'pending', $4, $5)
        ON CONFLICT (instance_id) DO NOTHING
        "#,
    )
    .bind(&instance.instance_id)
    .bind(&instance.execution_id)
    .bind(&instance.name)
    .bind(&instance.input)
    .bind(&parent)
    .execute(&mut *conn)
    .await
    .map_err(db)?;

    Ok(result.rows_affected() == 1)
}

async fn delete_instance(conn: &mut PgConnection, instance_id: &str) -> Result<(), StoreError> {
    for table in [
        "taskhub_history",
        "taskhub_instance_locks",
        "taskhub_orchestrator_queue",
        "taskhub_activity_queue",
        "taskhub_timers",
        "taskhub_dead_letters",
        "taskhub_instances",
    ] {
        sqlx::query(&format!("DELETE FROM {} WHERE instance_id = $1", table))
            .bind(instance_id)
            .execute(&mut *conn)
            .await
            .map_err(db)?;
    }
    Ok(())
}

async fn push_message(
    conn: &mut PgConnection,
    message: &OrchestratorMessage,
) -> Result<(), StoreError> {
    if let HistoryEvent::ExecutionStarted {
        name,
        input,
        parent,
    } = &message.event
    {
        let instance = NewInstance {
            instance_id: message.instance_id.clone(),
            execution_id: message
                .execution_id
                .clone()
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            name: name.clone(),
            input: input.clone(),
            parent: parent.clone(),
        };
        if !insert_instance(conn, &instance).await? {
            let existing = fetch_instance(conn, &message.instance_id, false).await?;
            if let Some(rejection) = existing
                .as_ref()
                .and_then(|existing| message.rejected_sub_orchestration(&existing.execution_id))
            {
                debug!(instance_id = %message.instance_id, "sub-orchestration id already in use");
                return insert_message(conn, &rejection).await;
            }
        }
    }

    insert_message(conn, message).await
}

async fn insert_message(
    conn: &mut PgConnection,
    message: &OrchestratorMessage,
) -> Result<(), StoreError> {
    let payload = serde_json::to_value(&message.event)?;
    sqlx::query(
        r#"
        INSERT INTO taskhub_orchestrator_queue (instance_id, execution_id, payload)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(&message.instance_id)
    .bind(&message.execution_id)
    .bind(&payload)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn push_activity(conn: &mut PgConnection, request: &ActivityRequest) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO taskhub_activity_queue (id, instance_id, execution_id, task_id, name, input)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(&request.instance_id)
    .bind(&request.execution_id)
    .bind(request.task_id as i64)
    .bind(&request.name)
    .bind(&request.input)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn push_timer(conn: &mut PgConnection, request: &TimerRequest) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO taskhub_timers (id, instance_id, execution_id, timer_id, fire_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (instance_id, execution_id, timer_id) DO NOTHING
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(&request.instance_id)
    .bind(&request.execution_id)
    .bind(request.timer_id as i64)
    .bind(request.fire_at)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn push_downstream(conn: &mut PgConnection, batch: &CommitBatch) -> Result<(), StoreError> {
    for message in &batch.orchestrator_messages {
        push_message(conn, message).await?;
    }
    for request in &batch.activities {
        push_activity(conn, request).await?;
    }
    for request in &batch.timers {
        push_timer(conn, request).await?;
    }
    Ok(())
}

/// Verify the instance lock is still held by `lease`
async fn check_instance_lock(
    conn: &mut PgConnection,
    instance_id: &str,
    lease: &Lease,
) -> Result<(), StoreError> {
    let held = sqlx::query(
        r#"
        SELECT 1 FROM taskhub_instance_locks
        WHERE instance_id = $1 AND lock_token = $2 AND locked_until > NOW()
        FOR UPDATE
        "#,
    )
    .bind(instance_id)
    .bind(lease.token)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db)?;

    if held.is_none() {
        return Err(StoreError::LeaseLost);
    }
    Ok(())
}

async fn commit_orchestrator(
    conn: &mut PgConnection,
    item: &OrchestratorWorkItem,
    batch: &CommitBatch,
) -> Result<(), StoreError> {
    check_instance_lock(conn, &item.instance_id, &item.lease).await?;

    let current = fetch_instance(conn, &item.instance_id, true).await?;
    if let Some(snapshot) = &item.state {
        let current = current
            .as_ref()
            .ok_or_else(|| StoreError::InstanceNotFound(item.instance_id.clone()))?;
        if current.history_length != snapshot.history_length
            || current.execution_id != snapshot.execution_id
        {
            return Err(StoreError::ConcurrencyConflict {
                expected: snapshot.history_length,
                actual: current.history_length,
            });
        }
    }

    if !batch.history.is_empty() || batch.instance_update.is_some() {
        let mut instance =
            current.ok_or_else(|| StoreError::InstanceNotFound(item.instance_id.clone()))?;

        for event in &batch.history {
            let payload = serde_json::to_value(event)?;
            sqlx::query(
                r#"
                INSERT INTO taskhub_history (instance_id, execution_id, sequence_num, event_type, payload)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&instance.instance_id)
            .bind(&instance.execution_id)
            .bind(instance.history_length)
            .bind(event.event_type())
            .bind(&payload)
            .execute(&mut *conn)
            .await
            .map_err(db)?;
            instance.history_length += 1;
        }

        if let Some(update) = batch.instance_update.clone() {
            apply_instance_update(&mut instance, update)?;
        }

        let failure = instance
            .failure
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            r#"
            UPDATE taskhub_instances
            SET execution_id = $2,
                status = $3,
                input = $4,
                output = $5,
                failure = $6,
                custom_status = $7,
                history_length = $8,
                last_updated_at = NOW()
            WHERE instance_id = $1
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.execution_id)
        .bind(instance.status.as_str())
        .bind(&instance.input)
        .bind(&instance.output)
        .bind(&failure)
        .bind(&instance.custom_status)
        .bind(instance.history_length)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    }

    sqlx::query("DELETE FROM taskhub_orchestrator_queue WHERE lock_token = $1")
        .bind(item.lease.token)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    sqlx::query("DELETE FROM taskhub_instance_locks WHERE instance_id = $1")
        .bind(&item.instance_id)
        .execute(&mut *conn)
        .await
        .map_err(db)?;

    push_downstream(conn, batch).await
}

async fn delete_activity(conn: &mut PgConnection, item: &ActivityWorkItem) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        DELETE FROM taskhub_activity_queue
        WHERE id = $1 AND lock_token = $2 AND locked_until > NOW()
        "#,
    )
    .bind(item.id)
    .bind(item.lease.token)
    .execute(&mut *conn)
    .await
    .map_err(db)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::LeaseLost);
    }
    Ok(())
}

async fn release_timer(
    conn: &mut PgConnection,
    item: &TimerWorkItem,
    delete: bool,
) -> Result<(), StoreError> {
    let query = if delete {
        r#"
        DELETE FROM taskhub_timers
        WHERE id = $1 AND lock_token = $2 AND locked_until > NOW() AND NOT fired
        "#
    } else {
        r#"
        UPDATE taskhub_timers
        SET fired = TRUE, lock_token = NULL, locked_by = NULL, locked_until = NULL
        WHERE id = $1 AND lock_token = $2 AND locked_until > NOW() AND NOT fired
        "#
    };
    let result = sqlx::query(query)
        .bind(item.id)
        .bind(item.lease.token)
        .execute(&mut *conn)
        .await
        .map_err(db)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::LeaseLost);
    }
    Ok(())
}

async fn insert_dead_letter(
    conn: &mut PgConnection,
    queue: QueueKind,
    instance_id: &str,
    payload: &serde_json::Value,
    reason: &str,
    dequeue_count: u32,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO taskhub_dead_letters (id, queue_kind, instance_id, payload, reason, dequeue_count)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(queue.as_str())
    .bind(instance_id)
    .bind(payload)
    .bind(reason)
    .bind(dequeue_count as i32)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

// =============================================================================
// Leasing
// =============================================================================

impl PostgresTaskHubStore {
    async fn lease_orchestrator(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<OrchestratorWorkItem>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        // Instances with visible messages and no live lock, oldest first.
        // No row locks here; the advisory lock below serializes leasers.
        let candidates: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT q.instance_id
            FROM taskhub_orchestrator_queue q
            LEFT JOIN taskhub_instance_locks l ON l.instance_id = q.instance_id
            WHERE q.visible_at <= NOW()
              AND (l.instance_id IS NULL OR l.locked_until <= NOW())
            GROUP BY q.instance_id
            ORDER BY MIN(q.id)
            LIMIT $1
            "#,
        )
        .bind(LEASE_CANDIDATES)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;

        let mut claimed = None;
        for instance_id in candidates {
            let acquired: bool =
                sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtext($1))")
                    .bind(&instance_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db)?;
            if !acquired {
                continue;
            }

            let lock = sqlx::query(
                r#"
                INSERT INTO taskhub_instance_locks (instance_id, lock_token, locked_by, locked_until)
                VALUES ($1, $2, $3, NOW() + ($4::bigint * INTERVAL '1 millisecond'))
                ON CONFLICT (instance_id) DO UPDATE
                SET lock_token = EXCLUDED.lock_token,
                    locked_by = EXCLUDED.locked_by,
                    locked_until = EXCLUDED.locked_until
                WHERE taskhub_instance_locks.locked_until <= NOW()
                RETURNING lock_token, locked_by, locked_until
                "#,
            )
            .bind(&instance_id)
            .bind(Uuid::now_v7())
            .bind(worker_id)
            .bind(millis(lease_duration))
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;

            // `None` when a lease was taken after the candidate scan
            if let Some(lock) = lock {
                claimed = Some((instance_id, lock));
                break;
            }
        }

        let Some((instance_id, lock)) = claimed else {
            return Ok(None);
        };
        let lease = row_to_lease(&lock);

        let rows = sqlx::query(
            r#"
            UPDATE taskhub_orchestrator_queue
            SET lock_token = $2, dequeue_count = dequeue_count + 1
            WHERE id IN (
                SELECT id FROM taskhub_orchestrator_queue
                WHERE instance_id = $1 AND visible_at <= NOW()
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, execution_id, payload, dequeue_count
            "#,
        )
        .bind(&instance_id)
        .bind(lease.token)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;

        // Consumed by a commit that raced the candidate scan; rolled back on drop
        if rows.is_empty() {
            return Ok(None);
        }

        let mut queued = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.get("payload");
            queued.push((
                row.get::<i64, _>("id"),
                row.get::<i32, _>("dequeue_count") as u32,
                OrchestratorMessage {
                    instance_id: instance_id.clone(),
                    execution_id: row.get("execution_id"),
                    event: serde_json::from_value(payload)?,
                },
            ));
        }
        queued.sort_by_key(|(id, _, _)| *id);
        let dequeue_count = queued.iter().map(|(_, count, _)| *count).max().unwrap_or(0);
        let messages = queued.into_iter().map(|(_, _, message)| message).collect();

        let state = fetch_instance(&mut tx, &instance_id, false).await?;
        let history = match &state {
            Some(state) => fetch_history(&mut tx, &instance_id, &state.execution_id).await?,
            None => Vec::new(),
        };

        tx.commit().await.map_err(db)?;

        debug!(worker_id, %instance_id, "leased orchestrator work item");
        Ok(Some(OrchestratorWorkItem {
            instance_id,
            state,
            history,
            messages,
            lease,
            dequeue_count,
        }))
    }

    async fn lease_activity(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<ActivityWorkItem>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM taskhub_activity_queue
                WHERE visible_at <= NOW()
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE taskhub_activity_queue a
            SET lock_token = $1,
                locked_by = $2,
                locked_until = NOW() + ($3::bigint * INTERVAL '1 millisecond'),
                dequeue_count = a.dequeue_count + 1
            FROM claimable c
            WHERE a.id = c.id
            RETURNING a.id, a.instance_id, a.execution_id, a.task_id, a.name, a.input,
                      a.lock_token, a.locked_by, a.locked_until, a.dequeue_count
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(worker_id)
        .bind(millis(lease_duration))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to lease activity: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.as_ref().map(row_to_activity))
    }

    async fn lease_timer(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<TimerWorkItem>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM taskhub_timers
                WHERE NOT fired
                  AND fire_at <= NOW()
                  AND visible_at <= NOW()
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY fire_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE taskhub_timers t
            SET lock_token = $1,
                locked_by = $2,
                locked_until = NOW() + ($3::bigint * INTERVAL '1 millisecond'),
                dequeue_count = t.dequeue_count + 1
            FROM due d
            WHERE t.id = d.id
            RETURNING t.id, t.instance_id, t.execution_id, t.timer_id, t.fire_at,
                      t.lock_token, t.locked_by, t.locked_until, t.dequeue_count
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(worker_id)
        .bind(millis(lease_duration))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to lease timer: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.as_ref().map(row_to_timer))
    }
}

#[async_trait]
impl TaskHubStore for PostgresTaskHubStore {
    #[instrument(skip(self))]
    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(())
    }

    // =========================================================================
    // Instance Operations
    // =========================================================================

    #[instrument(skip(self, instance), fields(instance_id = %instance.instance_id))]
    async fn create_instance(&self, instance: NewInstance) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        if let Some(existing) = fetch_instance(&mut tx, &instance.instance_id, true).await? {
            if !existing.status.is_terminal() {
                return Err(StoreError::InstanceAlreadyExists(instance.instance_id));
            }
            delete_instance(&mut tx, &instance.instance_id).await?;
        }

        if !insert_instance(&mut tx, &instance).await? {
            return Err(StoreError::InstanceAlreadyExists(instance.instance_id));
        }
        push_message(&mut tx, &instance.start_message()).await?;

        tx.commit().await.map_err(|e| {
            error!("Failed to create instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(name = %instance.name, "created instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceState>, StoreError> {
        let row = sqlx::query("SELECT * FROM taskhub_instances WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get instance: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(row_to_instance).transpose()
    }

    #[instrument(skip(self))]
    async fn read_history(&self, instance_id: &str) -> Result<Vec<RecordedEvent>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            error!("Failed to read history: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let instance = fetch_instance(&mut conn, instance_id, false)
            .await?
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;
        fetch_history(&mut conn, instance_id, &instance.execution_id).await
    }

    #[instrument(skip(self))]
    async fn purge_instance(&self, instance_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let Some(instance) = fetch_instance(&mut tx, instance_id, true).await? else {
            return Ok(false);
        };
        if !instance.status.is_terminal() {
            return Err(StoreError::InstanceNotTerminal(instance_id.to_string()));
        }

        delete_instance(&mut tx, instance_id).await?;
        tx.commit().await.map_err(|e| {
            error!("Failed to purge instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!("purged instance");
        Ok(true)
    }

    // =========================================================================
    // Queue Operations
    // =========================================================================

    #[instrument(skip(self, message), fields(instance_id = %message.instance_id))]
    async fn enqueue_orchestrator_message(
        &self,
        message: OrchestratorMessage,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        push_message(&mut tx, &message).await?;
        tx.commit().await.map_err(|e| {
            error!("Failed to enqueue orchestrator message: {}", e);
            StoreError::Database(e.to_string())
        })
    }

    #[instrument(skip(self, request), fields(instance_id = %request.instance_id, name = %request.name))]
    async fn enqueue_activity_work(&self, request: ActivityRequest) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        push_activity(&mut conn, &request).await.map_err(|e| {
            error!("Failed to enqueue activity: {}", e);
            e
        })
    }

    #[instrument(skip(self, request), fields(instance_id = %request.instance_id, timer_id = request.timer_id))]
    async fn enqueue_timer(&self, request: TimerRequest) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        push_timer(&mut conn, &request).await.map_err(|e| {
            error!("Failed to enqueue timer: {}", e);
            e
        })
    }

    async fn lease_next(
        &self,
        queue: QueueKind,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<WorkItem>, StoreError> {
        let item = match queue {
            QueueKind::Orchestrator => self
                .lease_orchestrator(worker_id, lease_duration)
                .await?
                .map(WorkItem::Orchestrator),
            QueueKind::Activity => self
                .lease_activity(worker_id, lease_duration)
                .await?
                .map(WorkItem::Activity),
            QueueKind::Timer => self
                .lease_timer(worker_id, lease_duration)
                .await?
                .map(WorkItem::Timer),
        };
        Ok(item)
    }

    #[instrument(skip(self, item, batch), fields(kind = %item.kind(), instance_id = %item.instance_id()))]
    async fn complete_and_commit(
        &self,
        item: &WorkItem,
        batch: CommitBatch,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        match item {
            WorkItem::Orchestrator(item) => commit_orchestrator(&mut tx, item, &batch).await?,
            WorkItem::Activity(item) => {
                delete_activity(&mut tx, item).await?;
                push_downstream(&mut tx, &batch).await?;
            }
            WorkItem::Timer(item) => {
                release_timer(&mut tx, item, false).await?;
                push_downstream(&mut tx, &batch).await?;
            }
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit work item: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(())
    }

    #[instrument(skip(self, item), fields(kind = %item.kind(), instance_id = %item.instance_id()))]
    async fn abandon_work_item(
        &self,
        item: &WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), StoreError> {
        let delay_ms = millis(delay.unwrap_or(Duration::ZERO));
        let mut tx = self.pool.begin().await.map_err(db)?;

        match item {
            WorkItem::Orchestrator(item) => {
                check_instance_lock(&mut tx, &item.instance_id, &item.lease).await?;
                sqlx::query("DELETE FROM taskhub_instance_locks WHERE instance_id = $1")
                    .bind(&item.instance_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                sqlx::query(
                    r#"
                    UPDATE taskhub_orchestrator_queue
                    SET lock_token = NULL,
                        visible_at = NOW() + ($2::bigint * INTERVAL '1 millisecond')
                    WHERE lock_token = $1
                    "#,
                )
                .bind(item.lease.token)
                .bind(delay_ms)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            }
            WorkItem::Activity(item) => {
                let result = sqlx::query(
                    r#"
                    UPDATE taskhub_activity_queue
                    SET lock_token = NULL, locked_by = NULL, locked_until = NULL,
                        visible_at = NOW() + ($3::bigint * INTERVAL '1 millisecond')
                    WHERE id = $1 AND lock_token = $2 AND locked_until > NOW()
                    "#,
                )
                .bind(item.id)
                .bind(item.lease.token)
                .bind(delay_ms)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::LeaseLost);
                }
            }
            WorkItem::Timer(item) => {
                let result = sqlx::query(
                    r#"
                    UPDATE taskhub_timers
                    SET lock_token = NULL, locked_by = NULL, locked_until = NULL,
                        visible_at = NOW() + ($3::bigint * INTERVAL '1 millisecond')
                    WHERE id = $1 AND lock_token = $2 AND locked_until > NOW() AND NOT fired
                    "#,
                )
                .bind(item.id)
                .bind(item.lease.token)
                .bind(delay_ms)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::LeaseLost);
                }
            }
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to abandon work item: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(())
    }

    async fn renew_lease(
        &self,
        item: &WorkItem,
        extend_by: Duration,
    ) -> Result<Lease, StoreError> {
        let extend_ms = millis(extend_by);
        let token = item.lease().token;

        let row = match item {
            WorkItem::Orchestrator(item) => {
                sqlx::query(
                    r#"
                    UPDATE taskhub_instance_locks
                    SET locked_until = NOW() + ($3::bigint * INTERVAL '1 millisecond')
                    WHERE instance_id = $1 AND lock_token = $2 AND locked_until > NOW()
                    RETURNING lock_token, locked_by, locked_until
                    "#,
                )
                .bind(&item.instance_id)
                .bind(token)
                .bind(extend_ms)
                .fetch_optional(&self.pool)
                .await
            }
            WorkItem::Activity(item) => {
                sqlx::query(
                    r#"
                    UPDATE taskhub_activity_queue
                    SET locked_until = NOW() + ($3::bigint * INTERVAL '1 millisecond')
                    WHERE id = $1 AND lock_token = $2 AND locked_until > NOW()
                    RETURNING lock_token, locked_by, locked_until
                    "#,
                )
                .bind(item.id)
                .bind(token)
                .bind(extend_ms)
                .fetch_optional(&self.pool)
                .await
            }
            WorkItem::Timer(item) => {
                sqlx::query(
                    r#"
                    UPDATE taskhub_timers
                    SET locked_until = NOW() + ($3::bigint * INTERVAL '1 millisecond')
                    WHERE id = $1 AND lock_token = $2 AND locked_until > NOW() AND NOT fired
                    RETURNING lock_token, locked_by, locked_until
                    "#,
                )
                .bind(item.id)
                .bind(token)
                .bind(extend_ms)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|e| {
            error!("Failed to renew lease: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::LeaseLost)?;

        Ok(row_to_lease(&row))
    }

    #[instrument(skip(self, item, batch), fields(kind = %item.kind(), instance_id = %item.instance_id()))]
    async fn dead_letter(
        &self,
        item: &WorkItem,
        reason: &str,
        batch: CommitBatch,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let dequeue_count = item.dequeue_count();

        match item {
            WorkItem::Orchestrator(orchestrator) => {
                check_instance_lock(&mut tx, &orchestrator.instance_id, &orchestrator.lease)
                    .await?;
                let rows = sqlx::query(
                    r#"
                    SELECT execution_id, payload
                    FROM taskhub_orchestrator_queue
                    WHERE lock_token = $1
                    ORDER BY id
                    "#,
                )
                .bind(orchestrator.lease.token)
                .fetch_all(&mut *tx)
                .await
                .map_err(db)?;

                let mut payloads = Vec::with_capacity(rows.len());
                for row in rows {
                    let event: serde_json::Value = row.get("payload");
                    let message = OrchestratorMessage {
                        instance_id: orchestrator.instance_id.clone(),
                        execution_id: row.get("execution_id"),
                        event: serde_json::from_value(event)?,
                    };
                    payloads.push(serde_json::to_value(&message)?);
                }

                commit_orchestrator(&mut tx, orchestrator, &batch).await?;
                for payload in &payloads {
                    insert_dead_letter(
                        &mut tx,
                        QueueKind::Orchestrator,
                        &orchestrator.instance_id,
                        payload,
                        reason,
                        dequeue_count,
                    )
                    .await?;
                }
            }
            WorkItem::Activity(activity) => {
                delete_activity(&mut tx, activity).await?;
                push_downstream(&mut tx, &batch).await?;
                let payload = serde_json::to_value(&activity.request)?;
                insert_dead_letter(
                    &mut tx,
                    QueueKind::Activity,
                    &activity.request.instance_id,
                    &payload,
                    reason,
                    dequeue_count,
                )
                .await?;
            }
            WorkItem::Timer(timer) => {
                release_timer(&mut tx, timer, true).await?;
                push_downstream(&mut tx, &batch).await?;
                let payload = serde_json::to_value(&timer.request)?;
                insert_dead_letter(
                    &mut tx,
                    QueueKind::Timer,
                    &timer.request.instance_id,
                    &payload,
                    reason,
                    dequeue_count,
                )
                .await?;
            }
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to dead-letter work item: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(())
    }

    // =========================================================================
    // Management Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue_kind, instance_id, payload, reason, dequeue_count, created_at
            FROM taskhub_dead_letters
            WHERE ($1::text IS NULL OR instance_id = $1)
              AND ($2::text IS NULL OR queue_kind = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(&filter.instance_id)
        .bind(filter.queue.map(QueueKind::as_str))
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list dead letters: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(row_to_dead_letter).collect()
    }

    async fn queue_depths(&self) -> Result<QueueDepths, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM taskhub_orchestrator_queue) AS orchestrator_messages,
                (SELECT COUNT(*) FROM taskhub_activity_queue) AS activities,
                (SELECT COUNT(*) FROM taskhub_timers WHERE NOT fired) AS timers,
                (SELECT COUNT(*) FROM taskhub_dead_letters) AS dead_letters
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to read queue depths: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(QueueDepths {
            orchestrator_messages: row.get::<i64, _>("orchestrator_messages") as u64,
            activities: row.get::<i64, _>("activities") as u64,
            timers: row.get::<i64, _>("timers") as u64,
            dead_letters: row.get::<i64, _>("dead_letters") as u64,
        })
    }
}
