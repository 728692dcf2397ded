use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scribe_core::{
    ArchiveStats, CanonicalMessage, ChannelCount, ChannelKey, CommitResult, MessagePosition,
    Source, SyncCursor, SyncMode,
};
use scribe_storage::BackoffPolicy;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{
    advance_outcome, content_hash, decide, AdvanceOutcome, CommitFailure, CursorStore,
    MessageStore, StoredVersion, WriteDecision,
};

/// Open a pool, retrying while the database is still coming up.
pub async fn connect_with_retry(database_url: &str, policy: BackoffPolicy) -> Result<PgPool> {
    let attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        let result = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await;
        match result {
            Ok(pool) => {
                info!(attempt = attempt + 1, "connected to database");
                return Ok(pool);
            }
            Err(err) if attempt + 1 < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "database connection failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("connecting to database after {attempts} attempts")
                })
            }
        }
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("applying database migrations")
}

/// Postgres-backed message and cursor store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    run_id: Uuid,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Identifier stamped on rows written or updated through this store.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &CanonicalMessage,
    ) -> Result<WriteDecision, sqlx::Error> {
        let hash = content_hash(message);
        let row = sqlx::query(
            r#"
            SELECT content_hash, edited_at
              FROM messages
             WHERE source = $1 AND channel_id = $2 AND message_id = $3
               FOR UPDATE
            "#,
        )
        .bind(message.source.as_str())
        .bind(&message.channel_id)
        .bind(&message.message_id)
        .fetch_optional(&mut **tx)
        .await?;

        let stored = match row {
            Some(row) => Some(StoredVersion {
                content_hash: row.try_get("content_hash")?,
                edited_at: row.try_get("edited_at")?,
            }),
            None => None,
        };

        let decision = decide(stored.as_ref(), message, &hash);
        match decision {
            WriteDecision::Insert => {
                sqlx::query(
                    r#"
                    INSERT INTO messages (
                        source, channel_id, message_id, guild_id, author_id,
                        author_display_name, sent_at, body_text, reply_to_message_id,
                        attachments, edited_at, is_pinned, content_hash, ingest_run_id,
                        channel_name
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                    "#,
                )
                .bind(message.source.as_str())
                .bind(&message.channel_id)
                .bind(&message.message_id)
                .bind(&message.guild_id)
                .bind(&message.author_id)
                .bind(&message.author_display_name)
                .bind(message.sent_at)
                .bind(&message.body_text)
                .bind(&message.reply_to_message_id)
                .bind(Json(&message.attachments))
                .bind(message.edited_at)
                .bind(message.is_pinned)
                .bind(&hash)
                .bind(self.run_id)
                .bind(&message.channel_name)
                .execute(&mut **tx)
                .await?;
            }
            WriteDecision::Overwrite => {
                sqlx::query(
                    r#"
                    UPDATE messages
                       SET guild_id = $4,
                           author_id = $5,
                           author_display_name = $6,
                           sent_at = $7,
                           body_text = $8,
                           reply_to_message_id = $9,
                           attachments = $10,
                           edited_at = $11,
                           is_pinned = $12,
                           content_hash = $13,
                           ingest_run_id = $14,
                           channel_name = $15,
                           updated_at = NOW()
                     WHERE source = $1 AND channel_id = $2 AND message_id = $3
                    "#,
                )
                .bind(message.source.as_str())
                .bind(&message.channel_id)
                .bind(&message.message_id)
                .bind(&message.guild_id)
                .bind(&message.author_id)
                .bind(&message.author_display_name)
                .bind(message.sent_at)
                .bind(&message.body_text)
                .bind(&message.reply_to_message_id)
                .bind(Json(&message.attachments))
                .bind(message.edited_at)
                .bind(message.is_pinned)
                .bind(&hash)
                .bind(self.run_id)
                .bind(&message.channel_name)
                .execute(&mut **tx)
                .await?;
            }
            WriteDecision::Skip => {}
        }
        Ok(decision)
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn commit_batch(&self, batch: &[CanonicalMessage]) -> Result<CommitResult, CommitFailure> {
        let mut tx = self.pool.begin().await?;
        let mut result = CommitResult::default();
        for message in batch {
            match self.apply(&mut tx, message).await? {
                WriteDecision::Insert => result.written += 1,
                WriteDecision::Overwrite => result.updated += 1,
                WriteDecision::Skip => result.skipped += 1,
            }
        }
        tx.commit().await?;
        debug!(written = result.written, updated = result.updated, skipped = result.skipped, "batch committed");
        Ok(result)
    }

    async fn stats(&self) -> Result<ArchiveStats> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   MIN(sent_at) AS earliest,
                   MAX(sent_at) AS latest,
                   COALESCE(SUM(jsonb_array_length(attachments)), 0)::BIGINT AS attachments
              FROM messages
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("querying archive totals")?;

        let rows = sqlx::query(
            r#"
            SELECT source, channel_id, COUNT(*) AS messages
              FROM messages
             GROUP BY source, channel_id
             ORDER BY messages DESC, source, channel_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("querying per-channel counts")?;

        let mut channels = Vec::with_capacity(rows.len());
        for row in rows {
            let source: String = row.try_get("source")?;
            channels.push(ChannelCount {
                source: parse_source(&source)?,
                channel_id: row.try_get("channel_id")?,
                messages: row.try_get("messages")?,
            });
        }

        Ok(ArchiveStats {
            total_messages: totals.try_get("total")?,
            earliest_sent_at: totals.try_get("earliest")?,
            latest_sent_at: totals.try_get("latest")?,
            attachment_count: totals.try_get("attachments")?,
            channels,
        })
    }
}

#[async_trait]
impl CursorStore for PgStore {
    async fn get(&self, key: &ChannelKey, mode: SyncMode) -> Result<Option<SyncCursor>> {
        let row = sqlx::query(
            r#"
            SELECT last_message_id, last_sent_at, updated_at
              FROM sync_cursors
             WHERE source = $1 AND channel_id = $2 AND mode = $3
            "#,
        )
        .bind(key.source.as_str())
        .bind(&key.channel_id)
        .bind(mode.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("reading {mode} cursor for {key}"))?;

        row.map(|row| -> Result<SyncCursor> {
            Ok(SyncCursor {
                source: key.source,
                channel_id: key.channel_id.clone(),
                mode,
                last_message_id: row.try_get("last_message_id")?,
                last_sent_at: row.try_get("last_sent_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn advance(
        &self,
        key: &ChannelKey,
        mode: SyncMode,
        position: &MessagePosition,
    ) -> Result<AdvanceOutcome> {
        let mut tx = self.pool.begin().await.context("opening cursor transaction")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO sync_cursors (source, channel_id, mode, last_message_id, last_sent_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (source, channel_id, mode) DO NOTHING
            "#,
        )
        .bind(key.source.as_str())
        .bind(&key.channel_id)
        .bind(mode.as_str())
        .bind(&position.message_id)
        .bind(position.sent_at)
        .execute(&mut *tx)
        .await
        .context("inserting cursor")?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await.context("committing cursor")?;
            return Ok(AdvanceOutcome::Advanced);
        }

        let row = sqlx::query(
            r#"
            SELECT last_message_id, last_sent_at
              FROM sync_cursors
             WHERE source = $1 AND channel_id = $2 AND mode = $3
               FOR UPDATE
            "#,
        )
        .bind(key.source.as_str())
        .bind(&key.channel_id)
        .bind(mode.as_str())
        .fetch_one(&mut *tx)
        .await
        .context("locking cursor row")?;
        let last_sent_at: DateTime<Utc> = row.try_get("last_sent_at")?;
        let stored = MessagePosition::new(row.try_get::<String, _>("last_message_id")?, last_sent_at);

        let outcome = advance_outcome(key, mode, Some(&stored), position);
        if outcome == AdvanceOutcome::Advanced {
            sqlx::query(
                r#"
                UPDATE sync_cursors
                   SET last_message_id = $4,
                       last_sent_at = $5,
                       updated_at = NOW()
                 WHERE source = $1 AND channel_id = $2 AND mode = $3
                "#,
            )
            .bind(key.source.as_str())
            .bind(&key.channel_id)
            .bind(mode.as_str())
            .bind(&position.message_id)
            .bind(position.sent_at)
            .execute(&mut *tx)
            .await
            .context("updating cursor")?;
        }
        tx.commit().await.context("committing cursor")?;
        Ok(outcome)
    }

    async fn reset(&self, key: &ChannelKey, mode: SyncMode) -> Result<bool> {
        let deleted = sqlx::query(
            "DELETE FROM sync_cursors WHERE source = $1 AND channel_id = $2 AND mode = $3",
        )
        .bind(key.source.as_str())
        .bind(&key.channel_id)
        .bind(mode.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("resetting {mode} cursor for {key}"))?
        .rows_affected();
        Ok(deleted > 0)
    }
}

fn parse_source(value: &str) -> Result<Source> {
    value
        .parse()
        .map_err(|err| anyhow!("stored row has {err}"))
}
