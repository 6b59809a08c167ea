use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use realtime::{
    serve_socket, ConnectionContext, Dispatcher, DispatcherConfig, LogPushNotifier,
    NotifierConfig, PeerPresence, PresenceOracle, PushNotifier, WebhookPushNotifier,
};
use serde::{Deserialize, Serialize};
use server_api::{
    ack_messages, add_chat_member, create_chat, list_chats, list_messages, login, send_message,
    sync, ApiContext,
};
use shared::{
    domain::{ChatId, SeqId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AckMessagesRequest, AckMessagesResponse, AddChatMemberRequest, ChatSummary,
        CreateChatRequest, LoginRequest, LoginResponse, MessagePayload, SendMessageRequest,
        SyncResponse,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url, Settings};

const MAX_REQUEST_BYTES: usize = 1024 * 1024;

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    connections: ConnectionContext,
}

impl AppState {
    fn new(api: ApiContext, ping_interval: Duration, write_timeout: Duration) -> Self {
        let connections = ConnectionContext {
            dispatcher: api.dispatcher.clone(),
            saver: Arc::new(api.clone()),
            directory: Arc::new(api.storage.clone()),
            ping_interval,
            write_timeout,
        };
        Self { api, connections }
    }
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    user_id: i64,
    #[serde(default)]
    offset: u32,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SyncQuery {
    user_id: i64,
    #[serde(default)]
    last_seq_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PresenceResponse {
    user_id: UserId,
    online: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::open(&database_url, settings.node_id)
        .await
        .map_err(|error| {
            error!(
                %database_url,
                %error,
                "failed to open SQLite database; verify parent directory exists and permissions are correct"
            );
            error
        })?;

    let state = build_state(&settings, storage)?;
    let dispatcher = state.api.dispatcher.clone();
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, node_id = settings.node_id, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!(
        open_connections = dispatcher.connection_count().await,
        "server stopped"
    );
    Ok(())
}

fn build_state(settings: &Settings, storage: Storage) -> anyhow::Result<AppState> {
    let presence: Option<Arc<dyn PresenceOracle>> = if settings.presence_peers.is_empty() {
        None
    } else {
        info!(peers = settings.presence_peers.len(), "cross-node presence enabled");
        Some(Arc::new(PeerPresence::new(settings.presence_peers.clone())?))
    };
    let dispatcher = Dispatcher::spawn(
        DispatcherConfig {
            command_capacity: settings.command_queue_capacity,
            outbound_capacity: settings.outbound_queue_capacity,
        },
        presence,
    );

    let pusher: Arc<dyn PushNotifier> = match &settings.push_webhook_url {
        Some(url) => Arc::new(WebhookPushNotifier::new(url.clone())?),
        None => {
            warn!("no push webhook configured; offline notifications are only logged");
            Arc::new(LogPushNotifier)
        }
    };

    let api = ApiContext::new(
        storage,
        dispatcher,
        pusher,
        NotifierConfig {
            max_recipients: settings.push_max_recipients,
            summary_max_chars: settings.push_summary_max_chars,
        },
        settings.sync_page_limit,
    );
    Ok(AppState::new(
        api,
        settings.ping_interval(),
        settings.write_timeout(),
    ))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(http_login))
        .route("/chats", get(http_list_chats).post(http_create_chat))
        .route("/chats/:chat_id/members", post(http_add_chat_member))
        .route("/chats/:chat_id/messages", get(http_list_messages))
        .route("/messages", post(http_send_message))
        .route("/messages/ack", post(http_ack_messages))
        .route("/sync", get(http_sync))
        .route("/presence/:user_id", get(http_presence))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn http_error(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(message = %err.message, "request failed");
    }
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> HttpResult<&'static str> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| http_error(ApiError::internal(e.to_string())))?;
    Ok("ok")
}

async fn http_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> HttpResult<Json<LoginResponse>> {
    login(&state.api, req).await.map(Json).map_err(http_error)
}

async fn http_list_chats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Json<Vec<ChatSummary>>> {
    list_chats(&state.api, UserId(q.user_id))
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_create_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateChatRequest>,
) -> HttpResult<Json<ChatSummary>> {
    create_chat(&state.api, req)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_add_chat_member(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Json(req): Json<AddChatMemberRequest>,
) -> HttpResult<StatusCode> {
    add_chat_member(&state.api, ChatId(chat_id), req)
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> HttpResult<Json<Vec<MessagePayload>>> {
    list_messages(
        &state.api,
        UserId(q.user_id),
        ChatId(chat_id),
        q.offset,
        q.limit,
    )
    .await
    .map(Json)
    .map_err(http_error)
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> HttpResult<Json<MessagePayload>> {
    send_message(&state.api, req)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_ack_messages(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AckMessagesRequest>,
) -> HttpResult<Json<AckMessagesResponse>> {
    ack_messages(&state.api, req)
        .await
        .map(Json)
        .map_err(http_error)
}

async fn http_sync(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SyncQuery>,
) -> HttpResult<Json<SyncResponse>> {
    sync(&state.api, UserId(q.user_id), SeqId(q.last_seq_id))
        .await
        .map(Json)
        .map_err(http_error)
}

/// Answers peers asking whether this node holds a live connection.
async fn http_presence(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Json<PresenceResponse> {
    let user_id = UserId(user_id);
    let online = state.api.dispatcher.is_locally_present(user_id).await;
    Json(PresenceResponse { user_id, online })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Response {
    let Some(user_id) = q.user_id.filter(|id| *id > 0).map(UserId) else {
        return http_error(ApiError::new(ErrorCode::Unauthorized, "user_id is required"))
            .into_response();
    };
    match state.api.storage.user_exists(user_id).await {
        Ok(true) => {}
        Ok(false) => {
            return http_error(ApiError::new(ErrorCode::Unauthorized, "unknown user"))
                .into_response();
        }
        Err(e) => return http_error(ApiError::internal(e.to_string())).into_response(),
    }

    let ctx = state.connections.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, user_id, ctx))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
