use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Result;
use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Path, Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use futures::{SinkExt, StreamExt};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::ChatError;
use crate::events::{Broadcaster, Channel, ChatEvent, Envelope};
use crate::model::User;
use crate::presence::PresenceStore;
use crate::{auth, chats, db, housekeeping, messages, metrics, reads, users};

/// Authenticated caller, injected by the bearer middleware.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub i64);

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<SqliteConnectionManager>,
    pub cache: Arc<TtlCache>,
    pub presence: PresenceStore,
    pub broadcaster: Broadcaster,
    pub jwt_secret: Arc<Vec<u8>>,
    pub config: Config,
    pub login_limiter: auth::LoginRateLimiter,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let pool = db::build_pool(config.db_path())?;
        let jwt_secret = {
            let conn = pool.get()?;
            auth::load_or_create_secret(&conn)?
        };
        let cache = Arc::new(TtlCache::new());
        Ok(Self {
            pool,
            presence: PresenceStore::new(cache.clone()),
            cache,
            broadcaster: Broadcaster::new(256),
            jwt_secret: Arc::new(jwt_secret),
            config,
            login_limiter: auth::LoginRateLimiter::new(5, std::time::Duration::from_secs(60)),
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/auth/me", get(me))
        .route("/api/users/search", get(search_users))
        .route(
            "/api/users/me",
            get(me).put(update_profile).delete(delete_account),
        )
        .route("/api/users/online-status", post(online_status))
        .route("/api/users/:id", get(show_user))
        .route("/api/contacts", get(contacts))
        .route("/api/chats", get(list_chats))
        .route("/api/chats/direct", post(create_direct_chat))
        .route("/api/chats/:id", get(show_chat).delete(leave_chat))
        .route("/api/chats/:id/read", post(mark_chat_read))
        .route("/api/chats/:id/typing", post(typing))
        .route("/api/chats/:id/messages", get(list_messages).post(send_message))
        .route(
            "/api/chats/:id/messages/:mid",
            put(edit_message).delete(delete_message),
        )
        .route("/api/chats/:id/messages/:mid/read", post(mark_message_read))
        .route("/api/messages/search", get(search_messages))
        .route("/api/metrics", get(metrics_snapshot))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .merge(protected)
        .with_state(state)
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let user_id = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .and_then(|token| auth::verify_jwt(&state.jwt_secret, token).ok());
    match user_id {
        Some(id) => {
            req.extensions_mut().insert(AuthUser(id));
            Ok(next.run(req).await)
        }
        None => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(Serialize)]
struct MessageResp {
    message: &'static str,
}

fn ok_msg(message: &'static str) -> Json<MessageResp> {
    Json(MessageResp { message })
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state
        .pool
        .get()
        .map_err(ChatError::from)
        .and_then(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };
    Json(serde_json::json!({
        "status": "ok",
        "services": { "database": database, "cache": "ok" },
        "timestamp": time::OffsetDateTime::now_utc().unix_timestamp(),
    }))
}

#[derive(Deserialize)]
struct RegisterReq {
    name: String,
    email: String,
    password: String,
}

#[derive(Serialize)]
struct AuthResp {
    token: String,
    user: User,
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterReq>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    let user = users::create(&conn, &req.name, &req.email, &req.password)?;
    let token = auth::issue_jwt(&state.jwt_secret, user.id, Duration::hours(24))?;
    Ok((StatusCode::CREATED, Json(AuthResp { token, user })))
}

#[derive(Deserialize)]
struct LoginReq {
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<impl IntoResponse, ChatError> {
    if !state.login_limiter.check(&req.email).await {
        return Err(ChatError::RateLimited);
    }
    let conn = state.pool.get()?;
    let (user, hash) = users::find_by_email(&conn, &req.email)?.ok_or(ChatError::Unauthorized)?;
    if !auth::verify_password(&req.password, &hash) {
        return Err(ChatError::Unauthorized);
    }
    let token = auth::issue_jwt(&state.jwt_secret, user.id, Duration::hours(24))?;
    Ok(Json(AuthResp { token, user }))
}

async fn me(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<User>, ChatError> {
    let conn = state.pool.get()?;
    Ok(Json(users::get(&conn, user_id)?))
}

async fn show_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<User>, ChatError> {
    let conn = state.pool.get()?;
    let target = id.parse::<i64>().map_err(|_| ChatError::NotFound)?;
    Ok(Json(users::get(&conn, target)?))
}

async fn update_profile(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<users::ProfileUpdate>,
) -> Result<Json<User>, ChatError> {
    let conn = state.pool.get()?;
    Ok(Json(users::update(&conn, user_id, &req)?))
}

async fn delete_account(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ChatError> {
    let mut conn = state.pool.get()?;
    users::delete_account(&mut conn, &state.cache, user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct OnlineStatusReq {
    is_online: bool,
}

async fn online_status(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<OnlineStatusReq>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    let presence = state.presence.set_online(&conn, user_id, req.is_online)?;
    // presence changes go to everyone, the actor included
    state.broadcaster.publish(
        Channel::Users,
        ChatEvent::UserStatus {
            user_id,
            is_online: presence.is_online,
            last_seen_at: presence.last_seen_at,
        },
    );
    Ok(Json(presence))
}

#[derive(Deserialize)]
struct ListQuery {
    q: Option<String>,
    limit: Option<usize>,
}

async fn search_users(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    let found = users::search(
        &conn,
        &state.presence,
        user_id,
        query.q.as_deref().unwrap_or(""),
        query.limit.unwrap_or(20),
    )?;
    Ok(Json(found))
}

async fn contacts(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    Ok(Json(users::contacts(&conn, &state.presence, user_id)?))
}

async fn list_chats(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    let listing = chats::list_for_user(&conn, &state.cache, &state.presence, user_id)?;
    Ok(Json(listing))
}

#[derive(Deserialize)]
struct DirectChatReq {
    user_id: i64,
}

#[derive(Serialize)]
struct ChatResp {
    chat: crate::model::ChatSummary,
}

async fn create_direct_chat(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(req): Json<DirectChatReq>,
) -> Result<impl IntoResponse, ChatError> {
    let mut conn = state.pool.get()?;
    let (chat, _created) =
        chats::get_or_create_direct(&mut conn, &state.cache, user_id, req.user_id)?;
    let mut summary = chats::summary_for(&conn, &chat, user_id)?;
    for user in &mut summary.users {
        state.presence.overlay(user);
    }
    Ok(Json(ChatResp { chat: summary }))
}

async fn show_chat(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    let chat = chats::get_for_member(&conn, &chat_id, user_id)?;
    let mut summary = chats::summary_for(&conn, &chat, user_id)?;
    for user in &mut summary.users {
        state.presence.overlay(user);
    }
    Ok(Json(ChatResp { chat: summary }))
}

async fn leave_chat(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
) -> Result<impl IntoResponse, ChatError> {
    let mut conn = state.pool.get()?;
    chats::leave(&mut conn, &state.cache, &chat_id, user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_chat_read(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
) -> Result<impl IntoResponse, ChatError> {
    let mut conn = state.pool.get()?;
    reads::mark_chat_read(&mut conn, &chat_id, user_id)?;
    chats::invalidate_member_listings(&conn, &state.cache, &chat_id)?;
    Ok(ok_msg("chat marked as read"))
}

#[derive(Deserialize)]
struct TypingReq {
    is_typing: bool,
}

async fn typing(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<TypingReq>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    chats::get_for_member(&conn, &chat_id, user_id)?;
    let user = users::get(&conn, user_id)?;
    state.presence.set_typing(&chat_id, user_id, req.is_typing);
    state.broadcaster.publish_to_others(
        Channel::Chat(chat_id),
        user_id,
        ChatEvent::UserTyping {
            user_id,
            name: user.name,
            is_typing: req.is_typing,
        },
    );
    Ok(ok_msg("typing status sent"))
}

#[derive(Deserialize)]
struct MessagesQuery {
    before: Option<Uuid>,
    limit: Option<usize>,
    search: Option<String>,
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    chats::get_for_member(&conn, &chat_id, user_id)?;
    let page = messages::list(
        &conn,
        &chat_id,
        query.before.as_ref(),
        query.limit.unwrap_or(50),
        query.search.as_deref(),
    )?;
    Ok(Json(page))
}

#[derive(Deserialize)]
struct MessageBodyReq {
    content: String,
}

#[derive(Serialize)]
struct MessageViewResp {
    message: crate::model::MessageView,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<MessageBodyReq>,
) -> Result<impl IntoResponse, ChatError> {
    let started = Instant::now();
    let mut conn = state.pool.get()?;
    chats::get_for_member(&conn, &chat_id, user_id)?;
    let message = messages::append(&mut conn, &chat_id, user_id, &req.content)?;
    let view = messages::view(&conn, &message.id)?;
    // delivery is best-effort; the message is already durable
    state.broadcaster.publish_to_others(
        Channel::Chat(chat_id),
        user_id,
        ChatEvent::MessageSent {
            message: view.clone(),
        },
    );
    chats::invalidate_member_listings(&conn, &state.cache, &chat_id)?;
    metrics::increment(&state.cache, "messages.sent", 1);
    metrics::timing(
        &state.cache,
        "messages.send_duration",
        started.elapsed().as_secs_f64() * 1000.0,
    );
    Ok((StatusCode::CREATED, Json(MessageViewResp { message: view })))
}

async fn edit_message(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<MessageBodyReq>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    chats::get_for_member(&conn, &chat_id, user_id)?;
    let view = messages::edit(&conn, &message_id, user_id, &req.content)?;
    if view.message.chat_id != chat_id {
        return Err(ChatError::NotFound);
    }
    Ok(Json(MessageViewResp { message: view }))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ChatError> {
    let mut conn = state.pool.get()?;
    chats::get_for_member(&conn, &chat_id, user_id)?;
    let owner = messages::remove(&mut conn, &message_id, user_id)?;
    if owner != chat_id {
        return Err(ChatError::NotFound);
    }
    chats::invalidate_member_listings(&conn, &state.cache, &chat_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_message_read(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path((chat_id, message_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    chats::get_for_member(&conn, &chat_id, user_id)?;
    let outcome = reads::mark_message_read(&conn, &message_id, user_id)?;
    if outcome.chat_id != chat_id {
        return Err(ChatError::NotFound);
    }
    // repeats keep the persisted state and stay silent on the wire
    if let Some(read_at) = outcome.newly_read {
        state.broadcaster.publish_to_others(
            Channel::Chat(chat_id),
            user_id,
            ChatEvent::MessageRead {
                message_id,
                read_by_user_id: user_id,
                read_at,
            },
        );
        chats::invalidate_member_listings(&conn, &state.cache, &chat_id)?;
    }
    Ok(ok_msg("message marked as read"))
}

async fn search_messages(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    let found = messages::search(
        &conn,
        user_id,
        query.q.as_deref().unwrap_or(""),
        query.limit.unwrap_or(20),
    )?;
    Ok(Json(found))
}

async fn metrics_snapshot(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.pool.get()?;
    Ok(Json(metrics::snapshot(&conn, &state.cache)?))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

#[derive(Deserialize)]
struct ClientFrame {
    action: String,
    chat_id: Uuid,
}

fn delivers_to(envelope: &Envelope, user_id: i64, subscribed: &HashSet<Uuid>) -> bool {
    if envelope.exclude_user == Some(user_id) {
        return false;
    }
    if envelope.channel == "users" {
        return true;
    }
    envelope
        .channel
        .strip_prefix("chat.")
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .map(|chat_id| subscribed.contains(&chat_id))
        .unwrap_or(false)
}

async fn handle_socket(stream: WebSocket, state: AppState, user_id: i64) {
    let (mut sender, mut receiver) = stream.split();
    let mut events = BroadcastStream::new(state.broadcaster.subscribe());
    let mut subscribed: HashSet<Uuid> = HashSet::new();
    let _ = sender.send(WsFrame::Text("{\"t\":\"hello\"}".into())).await;
    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(Ok(envelope)) => {
                        if delivers_to(&envelope, user_id, &subscribed) {
                            if let Ok(text) = serde_json::to_string(&envelope) {
                                if sender.send(WsFrame::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    // lagging receivers skip ahead; clients reconcile via REST
                    Some(Err(_)) => {}
                    None => break,
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                            continue;
                        };
                        let reply = match frame.action.as_str() {
                            "subscribe" => {
                                // chat channels are private; membership is the auth check
                                let allowed = state
                                    .pool
                                    .get()
                                    .ok()
                                    .map(|conn| {
                                        chats::get_for_member(&conn, &frame.chat_id, user_id).is_ok()
                                    })
                                    .unwrap_or(false);
                                if allowed {
                                    subscribed.insert(frame.chat_id);
                                    format!("{{\"t\":\"subscribed\",\"chat_id\":\"{}\"}}", frame.chat_id)
                                } else {
                                    format!("{{\"t\":\"error\",\"error\":\"not_found\",\"chat_id\":\"{}\"}}", frame.chat_id)
                                }
                            }
                            "unsubscribe" => {
                                subscribed.remove(&frame.chat_id);
                                format!("{{\"t\":\"unsubscribed\",\"chat_id\":\"{}\"}}", frame.chat_id)
                            }
                            _ => continue,
                        };
                        if sender.send(WsFrame::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

/// Run the HTTP server bound to the configured address.
pub async fn run_http_server(config: Config) -> Result<()> {
    let state = AppState::new(config.clone()).await?;
    housekeeping::spawn_retention(state.pool.clone(), config.retention_days);
    let addr: SocketAddr = config.bind.parse()?;
    tracing::info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}

// Integration tests live in the tests/ directory.
