//! Runs against a real Postgres when `DATABASE_URL` is set; otherwise each
//! test returns early.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use scribe_core::{CanonicalMessage, ChannelKey, MessagePosition, Source, SyncMode};
use scribe_sync::{run_migrations, AdvanceOutcome, CursorStore, MessageStore, PgStore};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

async fn store_from_env() -> Option<Arc<PgStore>> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    run_migrations(&pool).await.expect("migrations apply");
    Some(Arc::new(PgStore::new(pool)))
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
}

fn unique_channel() -> String {
    format!("it-{}", Uuid::new_v4())
}

fn message(channel_id: &str, id: u64, body: &str, edited: Option<i64>) -> CanonicalMessage {
    CanonicalMessage {
        source: Source::Discord,
        channel_id: channel_id.to_string(),
        message_id: id.to_string(),
        guild_id: Some("700".into()),
        channel_name: Some("ops-alerts".into()),
        author_id: "7".into(),
        author_display_name: "ada".into(),
        sent_at: ts(id as i64),
        body_text: body.to_string(),
        reply_to_message_id: None,
        attachments: Vec::new(),
        edited_at: edited.map(ts),
        is_pinned: false,
    }
}

#[tokio::test]
async fn replayed_batches_are_idempotent_and_edits_win() {
    let Some(store) = store_from_env().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let channel = unique_channel();
    let batch: Vec<_> = (1..=3).map(|id| message(&channel, id, "draft", None)).collect();

    let first = store.commit_batch(&batch).await.unwrap();
    assert_eq!((first.written, first.updated, first.skipped), (3, 0, 0));
    let replay = store.commit_batch(&batch).await.unwrap();
    assert_eq!((replay.written, replay.updated, replay.skipped), (0, 0, 3));

    let edited = store
        .commit_batch(&[message(&channel, 2, "final", Some(100))])
        .await
        .unwrap();
    assert_eq!(edited.updated, 1);
    let stale = store
        .commit_batch(&[message(&channel, 2, "draft", None)])
        .await
        .unwrap();
    assert_eq!(stale.skipped, 1);

    let rows = sqlx::query(
        "SELECT message_id, body_text, guild_id, channel_name FROM messages WHERE channel_id = $1 ORDER BY sent_at",
    )
    .bind(&channel)
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(rows.len(), 3);
    let body: String = rows[1].try_get("body_text").unwrap();
    assert_eq!(body, "final");
    let guild: Option<String> = rows[1].try_get("guild_id").unwrap();
    assert_eq!(guild.as_deref(), Some("700"));
    let name: Option<String> = rows[0].try_get("channel_name").unwrap();
    assert_eq!(name.as_deref(), Some("ops-alerts"));
}

#[tokio::test]
async fn cursor_only_moves_forward() {
    let Some(store) = store_from_env().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let key = ChannelKey::new(Source::Discord, unique_channel());
    let older = MessagePosition::new("10", ts(10));
    let newer = MessagePosition::new("20", ts(20));

    assert_eq!(
        store.advance(&key, SyncMode::Backfill, &newer).await.unwrap(),
        AdvanceOutcome::Advanced
    );
    assert_eq!(
        store.advance(&key, SyncMode::Backfill, &older).await.unwrap(),
        AdvanceOutcome::RejectedStale {
            stored: newer.clone()
        }
    );
    assert_eq!(
        store.advance(&key, SyncMode::Backfill, &newer).await.unwrap(),
        AdvanceOutcome::Unchanged
    );
    assert!(store.get(&key, SyncMode::Tail).await.unwrap().is_none());

    let stored = store.get(&key, SyncMode::Backfill).await.unwrap().unwrap();
    assert_eq!(stored.position(), newer);

    assert!(store.reset(&key, SyncMode::Backfill).await.unwrap());
    assert!(!store.reset(&key, SyncMode::Backfill).await.unwrap());
    assert!(store.get(&key, SyncMode::Backfill).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_advances_keep_the_greatest_position() {
    let Some(store) = store_from_env().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let key = ChannelKey::new(Source::Discord, unique_channel());

    let mut tasks = Vec::new();
    for id in [5_i64, 40, 12, 33, 1, 27, 19, 8] {
        let store = store.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let position = MessagePosition::new(id.to_string(), ts(id));
            store.advance(&key, SyncMode::Tail, &position).await.unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stored = store.get(&key, SyncMode::Tail).await.unwrap().unwrap();
    assert_eq!(stored.last_message_id, "40");
}
