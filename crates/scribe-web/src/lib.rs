//! Axum + Askama operational surface for the sync loops.

use std::future::Future;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use scribe_core::{ChannelKey, ChannelStatus, Source, SyncState};
use scribe_sync::{ControlPanel, MessageStore, StatusBoard};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "scribe-web";

#[derive(Clone)]
pub struct AppState {
    pub board: StatusBoard,
    pub controls: ControlPanel,
    pub store: Option<Arc<dyn MessageStore>>,
}

impl AppState {
    pub fn new(board: StatusBoard, controls: ControlPanel) -> Self {
        Self {
            board,
            controls,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }
}

#[derive(Debug, Clone)]
struct StatusRow {
    channel: String,
    label: String,
    mode: String,
    state: String,
    cursor: String,
    pages: u64,
    written: u64,
    updated: u64,
    skipped: u64,
    updated_at: String,
    last_error: String,
}

impl From<&ChannelStatus> for StatusRow {
    fn from(status: &ChannelStatus) -> Self {
        Self {
            channel: status.key().to_string(),
            label: status.label.clone().unwrap_or_default(),
            mode: status.mode.to_string(),
            state: status.state.to_string(),
            cursor: status
                .last_cursor
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string()),
            pages: status.pages_committed,
            written: status.messages_written,
            updated: status.messages_updated,
            skipped: status.records_skipped,
            updated_at: status.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            last_error: status.last_error.clone().unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "status.html")]
struct StatusTemplate {
    rows: Vec<StatusRow>,
    failed: usize,
    generated_at: String,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    channel: String,
    action: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/status/{source}/{channel_id}", get(channel_status_handler))
        .route("/api/channels/{source}/{channel_id}/pause", post(pause_handler))
        .route("/api/channels/{source}/{channel_id}/resume", post(resume_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let statuses = state.board.snapshot().await;
    let tpl = StatusTemplate {
        failed: statuses
            .iter()
            .filter(|s| s.state == SyncState::Failed)
            .count(),
        rows: statuses.iter().map(StatusRow::from).collect(),
        generated_at: Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    };
    render_html(tpl)
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ChannelStatus>> {
    Json(state.board.snapshot().await)
}

async fn channel_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((source, channel_id)): AxumPath<(String, String)>,
) -> Response {
    let key = match parse_key(&source, channel_id) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let statuses = state.board.channel(&key).await;
    if statuses.is_empty() {
        return json_error(StatusCode::NOT_FOUND, format!("no sync loop for {key}"));
    }
    Json(statuses).into_response()
}

async fn pause_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((source, channel_id)): AxumPath<(String, String)>,
) -> Response {
    control(&state, &source, channel_id, "pause")
}

async fn resume_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((source, channel_id)): AxumPath<(String, String)>,
) -> Response {
    control(&state, &source, channel_id, "resume")
}

fn control(state: &AppState, source: &str, channel_id: String, action: &'static str) -> Response {
    let key = match parse_key(source, channel_id) {
        Ok(key) => key,
        Err(resp) => return resp,
    };
    let applied = match action {
        "pause" => state.controls.pause(&key),
        _ => state.controls.resume(&key),
    };
    if !applied {
        return json_error(StatusCode::NOT_FOUND, format!("no sync loop for {key}"));
    }
    info!(channel = %key, action, "operator control applied");
    (
        StatusCode::ACCEPTED,
        Json(ControlResponse {
            channel: key.to_string(),
            action,
        }),
    )
        .into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(store) = &state.store else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "no message store attached".to_string());
    };
    match store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => {
            warn!(error = %err, "stats query failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
        }
    }
}

fn parse_key(source: &str, channel_id: String) -> Result<ChannelKey, Response> {
    let source: Source = source
        .parse()
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, format!("{err}")))?;
    Ok(ChannelKey::new(source, channel_id))
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}

fn json_error(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use scribe_core::{CanonicalMessage, SyncMode};
    use scribe_sync::MemoryStore;
    use tower::ServiceExt;

    async fn seeded_state() -> AppState {
        let board = StatusBoard::new();
        let controls = ControlPanel::new();
        let key = ChannelKey::new(Source::Discord, "881");
        let _rx = controls.register(&key, SyncMode::Tail);
        board
            .register(ChannelStatus::new(&key, SyncMode::Tail, Some("ops".into())))
            .await;
        let failed = ChannelKey::new(Source::TelegramExport, "gone");
        board
            .update(&failed, SyncMode::Backfill, |s| {
                s.state = SyncState::Failed;
                s.last_error = Some("export <missing>".into());
            })
            .await;
        AppState::new(board, controls)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn index_renders_escaped_status_table() {
        let resp = app(seeded_state().await).oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Scribe Sync Status"));
        assert!(text.contains("discord/881"));
        assert!(text.contains("1 failed"));
        assert!(text.contains("export &lt;missing&gt;"));
    }

    #[tokio::test]
    async fn status_endpoints_return_json() {
        let app = app(seeded_state().await);
        let all = app.clone().oneshot(get("/api/status")).await.unwrap();
        assert_eq!(all.status(), StatusCode::OK);
        assert_eq!(
            all.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        assert_eq!(body_json(all).await.as_array().unwrap().len(), 2);

        let one = app
            .clone()
            .oneshot(get("/api/status/telegram_export/gone"))
            .await
            .unwrap();
        let one = body_json(one).await;
        assert_eq!(one[0]["state"], "failed");

        let missing = app.clone().oneshot(get("/api/status/discord/404")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let bad = app.oneshot(get("/api/status/slack/1")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pause_and_resume_reach_the_control_panel() {
        let board = StatusBoard::new();
        let controls = ControlPanel::new();
        let key = ChannelKey::new(Source::Discord, "881");
        let rx = controls.register(&key, SyncMode::Tail);
        let app = app(AppState::new(board, controls));

        let paused = app
            .clone()
            .oneshot(post("/api/channels/discord/881/pause"))
            .await
            .unwrap();
        assert_eq!(paused.status(), StatusCode::ACCEPTED);
        assert_eq!(*rx.borrow(), scribe_sync::Control::Pause);

        let resumed = app
            .clone()
            .oneshot(post("/api/channels/discord/881/resume"))
            .await
            .unwrap();
        assert_eq!(body_json(resumed).await["action"], "resume");
        assert_eq!(*rx.borrow(), scribe_sync::Control::Run);

        let unknown = app
            .oneshot(post("/api/channels/discord/999/pause"))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_require_a_store() {
        let state = seeded_state().await;
        let without = app(state.clone()).oneshot(get("/api/stats")).await.unwrap();
        assert_eq!(without.status(), StatusCode::SERVICE_UNAVAILABLE);

        let store = Arc::new(MemoryStore::new());
        store
            .commit_batch(&[CanonicalMessage {
                source: Source::Discord,
                channel_id: "881".into(),
                message_id: "1".into(),
                guild_id: None,
                channel_name: None,
                author_id: "7".into(),
                author_display_name: "ada".into(),
                sent_at: Utc::now(),
                body_text: "hello".into(),
                reply_to_message_id: None,
                attachments: vec![],
                edited_at: None,
                is_pinned: false,
            }])
            .await
            .unwrap();
        let with = app(state.with_store(store))
            .oneshot(get("/api/stats"))
            .await
            .unwrap();
        assert_eq!(with.status(), StatusCode::OK);
        assert_eq!(body_json(with).await["total_messages"], 1);
    }
}
