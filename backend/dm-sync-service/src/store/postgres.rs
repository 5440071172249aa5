use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_schema::{
    Cursor, MessageDto, MessagePage, ReceiptAdvance, ReceiptDto, ReceiptStatus, UnreadCount,
};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{cursor_column, normalize_participants, MessageStore, StoreError, StoreResult};
use crate::models::{direct_key, InsertOutcome, NewMessage, PageQuery, Thread};

const MESSAGE_COLUMNS: &str = "id, thread_id, sender_id, client_msg_id, body, created_at";

#[derive(sqlx::FromRow)]
struct ThreadRecord {
    id: Uuid,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    archived_at: Option<DateTime<Utc>>,
    last_message_id: Option<i64>,
    last_message_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct MessageRecord {
    id: i64,
    thread_id: Uuid,
    sender_id: Uuid,
    client_msg_id: Uuid,
    body: String,
    created_at: DateTime<Utc>,
}

impl From<MessageRecord> for MessageDto {
    fn from(r: MessageRecord) -> Self {
        MessageDto {
            id: r.id,
            thread_id: r.thread_id,
            sender_id: r.sender_id,
            client_msg_id: r.client_msg_id,
            body: r.body,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReceiptRecord {
    message_id: i64,
    user_id: Uuid,
    status: i16,
    updated_at: DateTime<Utc>,
}

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_thread<'e, E>(executor: E, record: ThreadRecord) -> StoreResult<Thread>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let participant_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM dm_thread_participants WHERE thread_id = $1 ORDER BY user_id",
        )
        .bind(record.id)
        .fetch_all(executor)
        .await?;

        let last_message = match (record.last_message_at, record.last_message_id) {
            (Some(at), Some(id)) => Some(Cursor::new(at, id)),
            _ => None,
        };

        Ok(Thread {
            id: record.id,
            participant_ids,
            created_by: record.created_by,
            created_at: record.created_at,
            archived_at: record.archived_at,
            last_message,
        })
    }

    async fn thread_record(
        tx: &mut Transaction<'_, Postgres>,
        thread_id: Uuid,
    ) -> StoreResult<ThreadRecord> {
        Self::select_thread(tx, thread_id, "").await
    }

    /// Row lock on the thread. Held until commit, so inserts into one thread
    /// commit in the order their ids and timestamps were assigned.
    async fn lock_thread(
        tx: &mut Transaction<'_, Postgres>,
        thread_id: Uuid,
    ) -> StoreResult<ThreadRecord> {
        Self::select_thread(tx, thread_id, "FOR UPDATE").await
    }

    async fn select_thread(
        tx: &mut Transaction<'_, Postgres>,
        thread_id: Uuid,
        lock: &str,
    ) -> StoreResult<ThreadRecord> {
        sqlx::query_as::<_, ThreadRecord>(&format!(
            r#"
            SELECT id, created_by, created_at, archived_at, last_message_id, last_message_at
            FROM dm_threads
            WHERE id = $1
            {lock}
            "#
        ))
        .bind(thread_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::ThreadNotFound)
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create_thread(&self, creator: Uuid, others: &[Uuid]) -> StoreResult<Thread> {
        let participant_ids = normalize_participants(creator, others)?;
        let key = direct_key(&participant_ids);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, ThreadRecord>(
            r#"
            INSERT INTO dm_threads (id, direct_key, created_by)
            VALUES ($1, $2, $3)
            ON CONFLICT (direct_key) DO NOTHING
            RETURNING id, created_by, created_at, archived_at, last_message_id, last_message_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.as_deref())
        .bind(creator)
        .fetch_optional(&mut *tx)
        .await?;

        let record = match inserted {
            Some(record) => {
                sqlx::query(
                    r#"
                    INSERT INTO dm_thread_participants (thread_id, user_id)
                    SELECT $1, UNNEST($2::uuid[])
                    "#,
                )
                .bind(record.id)
                .bind(&participant_ids)
                .execute(&mut *tx)
                .await?;
                record
            }
            // Lost the race for this direct_key; the winner's thread is authoritative
            None => sqlx::query_as::<_, ThreadRecord>(
                r#"
                SELECT id, created_by, created_at, archived_at, last_message_id, last_message_at
                FROM dm_threads
                WHERE direct_key = $1
                "#,
            )
            .bind(key.as_deref())
            .fetch_one(&mut *tx)
            .await?,
        };

        let thread = Self::load_thread(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Thread> {
        let mut tx = self.pool.begin().await?;
        let record = Self::thread_record(&mut tx, thread_id).await?;
        let thread = Self::load_thread(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(thread)
    }

    async fn archive_thread(&self, thread_id: Uuid) -> StoreResult<Thread> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE dm_threads SET archived_at = NOW() WHERE id = $1 AND archived_at IS NULL",
        )
        .bind(thread_id)
        .execute(&mut *tx)
        .await?;
        let record = Self::thread_record(&mut tx, thread_id).await?;
        let thread = Self::load_thread(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(thread)
    }

    async fn insert_message(&self, message: &NewMessage) -> StoreResult<InsertOutcome> {
        let mut tx = self.pool.begin().await?;
        Self::lock_thread(&mut tx, message.thread_id).await?;

        let inserted = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            INSERT INTO dm_messages (thread_id, sender_id, client_msg_id, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (thread_id, client_msg_id) DO NOTHING
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(message.thread_id)
        .bind(message.sender_id)
        .bind(message.client_msg_id)
        .bind(&message.body)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            // Redelivery of an already stored send
            let existing = sqlx::query_as::<_, MessageRecord>(&format!(
                r#"
                SELECT {MESSAGE_COLUMNS} FROM dm_messages
                WHERE thread_id = $1 AND client_msg_id = $2
                "#
            ))
            .bind(message.thread_id)
            .bind(message.client_msg_id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(InsertOutcome {
                message: existing.into(),
                created: false,
            });
        };

        sqlx::query(
            r#"
            INSERT INTO dm_receipts (message_id, user_id, status, updated_at)
            SELECT $1, p.user_id, $4, $5
            FROM dm_thread_participants p
            WHERE p.thread_id = $2 AND p.user_id <> $3
            ON CONFLICT (message_id, user_id) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(row.thread_id)
        .bind(row.sender_id)
        .bind(ReceiptStatus::Sent.rank())
        .bind(row.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE dm_threads
            SET last_message_id = $2, last_message_at = $3
            WHERE id = $1
              AND (last_message_at IS NULL OR (last_message_at, last_message_id) < ($3, $2))
            "#,
        )
        .bind(row.thread_id)
        .bind(row.id)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(InsertOutcome {
            message: row.into(),
            created: true,
        })
    }

    async fn list_messages(&self, thread_id: Uuid, query: PageQuery) -> StoreResult<MessagePage> {
        let mut tx = self.pool.begin().await?;
        Self::thread_record(&mut tx, thread_id).await?;

        let limit = query.limit().max(0);
        // One extra row tells whether another page exists
        let fetch = limit + 1;
        let mut rows: Vec<MessageRecord> = match query {
            PageQuery::Latest { .. } => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS} FROM dm_messages
                    WHERE thread_id = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#
                ))
                .bind(thread_id)
                .bind(fetch)
                .fetch_all(&mut *tx)
                .await?
            }
            PageQuery::Before { cursor, .. } => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS} FROM dm_messages
                    WHERE thread_id = $1 AND (created_at, id) < ($2, $3)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4
                    "#
                ))
                .bind(thread_id)
                .bind(cursor.created_at)
                .bind(cursor.id)
                .bind(fetch)
                .fetch_all(&mut *tx)
                .await?
            }
            PageQuery::After { cursor, .. } => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS} FROM dm_messages
                    WHERE thread_id = $1 AND (created_at, id) > ($2, $3)
                    ORDER BY created_at ASC, id ASC
                    LIMIT $4
                    "#
                ))
                .bind(thread_id)
                .bind(cursor.created_at)
                .bind(cursor.id)
                .bind(fetch)
                .fetch_all(&mut *tx)
                .await?
            }
        };
        tx.commit().await?;

        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);
        let mut messages: Vec<MessageDto> = rows.into_iter().map(Into::into).collect();
        messages.sort_by_key(MessageDto::cursor);
        Ok(MessagePage { messages, has_more })
    }

    async fn advance_receipts(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        up_to_message_id: i64,
        status: ReceiptStatus,
    ) -> StoreResult<ReceiptAdvance> {
        let mut tx = self.pool.begin().await?;

        let target_at: DateTime<Utc> = sqlx::query_scalar(
            "SELECT created_at FROM dm_messages WHERE id = $1 AND thread_id = $2",
        )
        .bind(up_to_message_id)
        .bind(thread_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::MessageNotInThread(up_to_message_id))?;

        // Cursors only move forward in (created_at, id) order, the order pages use
        let column = cursor_column(status);
        let cursor_advanced = sqlx::query(&format!(
            r#"
            UPDATE dm_thread_participants p
            SET {column} = $3
            WHERE p.thread_id = $1 AND p.user_id = $2
              AND (
                p.{column} IS NULL
                OR ($4, $3) > (SELECT m.created_at, m.id FROM dm_messages m WHERE m.id = p.{column})
              )
            "#
        ))
        .bind(thread_id)
        .bind(user_id)
        .bind(up_to_message_id)
        .bind(target_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        // Reading implies delivery, so missing rows are inserted at the new rank
        let receipts_updated = sqlx::query(
            r#"
            INSERT INTO dm_receipts (message_id, user_id, status, updated_at)
            SELECT m.id, $2, $5, NOW()
            FROM dm_messages m
            WHERE m.thread_id = $1
              AND m.sender_id <> $2
              AND (m.created_at, m.id) <= ($3, $4)
            ON CONFLICT (message_id, user_id) DO UPDATE
            SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at
            WHERE dm_receipts.status < EXCLUDED.status
            "#,
        )
        .bind(thread_id)
        .bind(user_id)
        .bind(target_at)
        .bind(up_to_message_id)
        .bind(status.rank())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(ReceiptAdvance {
            thread_id,
            user_id,
            up_to_message_id,
            status,
            cursor_advanced,
            receipts_updated,
        })
    }

    async fn receipts_for(
        &self,
        thread_id: Uuid,
        caller: Uuid,
        message_ids: &[i64],
    ) -> StoreResult<Vec<ReceiptDto>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, ReceiptRecord>(
            r#"
            SELECT r.message_id, r.user_id, r.status, r.updated_at
            FROM dm_receipts r
            JOIN dm_messages m ON m.id = r.message_id
            WHERE m.thread_id = $1
              AND m.sender_id = $2
              AND r.user_id <> $2
              AND r.message_id = ANY($3)
            ORDER BY r.message_id, r.user_id
            "#,
        )
        .bind(thread_id)
        .bind(caller)
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                ReceiptStatus::from_rank(r.status).map(|status| ReceiptDto {
                    message_id: r.message_id,
                    user_id: r.user_id,
                    status,
                    updated_at: r.updated_at,
                })
            })
            .collect())
    }

    async fn unread_count(&self, thread_id: Uuid, user_id: Uuid) -> StoreResult<UnreadCount> {
        let last_read: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT last_read_message_id FROM dm_thread_participants
            WHERE thread_id = $1 AND user_id = $2
            "#,
        )
        .bind(thread_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::ThreadNotFound)?;

        let unread: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::bigint FROM dm_messages m
            WHERE m.thread_id = $1 AND m.sender_id <> $2
              AND (
                $3::BIGINT IS NULL
                OR (m.created_at, m.id) > (
                    SELECT r.created_at, r.id FROM dm_messages r WHERE r.id = $3
                )
              )
            "#,
        )
        .bind(thread_id)
        .bind(user_id)
        .bind(last_read)
        .fetch_one(&self.pool)
        .await?;

        Ok(UnreadCount {
            thread_id,
            unread,
            last_read_message_id: last_read,
        })
    }

    async fn record_dead_letter(
        &self,
        entry_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<()> {
        sqlx::query("INSERT INTO dm_dead_letters (entry_id, reason, payload) VALUES ($1, $2, $3)")
            .bind(entry_id)
            .bind(reason)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
