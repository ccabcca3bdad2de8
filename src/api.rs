use crate::config::Config;
use crate::error::{ChatError, RetryPolicy};
use crate::events::{Event, EventBus};
use crate::matchqueue::EnqueueOutcome;
use crate::model::{
    ChatMessage, ChatSession, Group, GroupMessage, MemberRole, Membership, PresenceStatus,
    ReportRecord, SupportTicket, TicketStatus,
};
use crate::{chats, db, groups, matchqueue, moderation, presence, tickets};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Extension, Path, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use uuid::Uuid;

/// Principal resolved by the identity collaborator upstream. The engine
/// trusts the headers; it never authenticates.
#[derive(Clone, Debug)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<SqliteConnectionManager>,
    pub events: Arc<EventBus>,
    pub config: Config,
    pub retry: RetryPolicy,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let pool = db::open_pool(config.data_dir.join("pairline.db"))?;
        Ok(Self {
            pool,
            events: Arc::new(EventBus::default()),
            config,
            retry: RetryPolicy::default(),
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/match", post(enqueue_match).delete(cancel_match))
        .route("/api/chats/:id", get(get_chat))
        .route("/api/chats/:id/messages", get(list_chat_messages).post(send_chat_message))
        .route("/api/chats/:id/read", post(mark_chat_read))
        .route("/api/chats/:id/end", post(end_chat))
        .route("/api/chats/:id/report", post(report_chat))
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/:id", get(get_group).patch(update_group))
        .route("/api/groups/:id/join", post(join_group))
        .route("/api/groups/:id/leave", post(leave_group))
        .route("/api/groups/:id/role", post(set_group_role))
        .route("/api/groups/:id/members", get(list_group_members))
        .route("/api/groups/:id/messages", get(list_group_messages).post(post_group_message))
        .route("/api/groups/:id/messages/:message_id", delete(remove_group_message))
        .route("/api/groups/:id/recount", post(recount_group))
        .route("/api/my/groups", get(my_groups))
        .route("/api/presence/heartbeat", post(heartbeat))
        .route("/api/presence/offline", post(go_offline))
        .route("/api/presence/:user_id", get(presence_status))
        .route("/api/tickets", get(list_tickets).post(create_ticket))
        .route("/api/tickets/:id/assign", post(assign_ticket))
        .route("/api/tickets/:id/resolve", post(resolve_ticket))
        .route("/api/tickets/:id/reject", post(reject_ticket))
        .route("/api/reports/:target", get(list_reports))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn(identity_middleware));
    Router::new()
        .route("/api/health", get(health))
        .merge(api)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn identity_middleware<B>(
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let user_id = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned);
    let Some(user_id) = user_id else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let display_name = req
        .headers()
        .get("x-display-name")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(&user_id)
        .to_string();
    req.extensions_mut().insert(Identity {
        user_id,
        display_name,
    });
    Ok(next.run(req).await)
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::InvalidState(_) => StatusCode::CONFLICT,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Store(_) | ChatError::Pool(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ChatError>;

// ---- matchmaking ----

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum EnqueueResp {
    Paired { chat: ChatSession },
    Waiting { enqueued_at: i64 },
    AlreadyQueued,
}

async fn enqueue_match(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
) -> ApiResult<EnqueueResp> {
    let mut conn = state.pool.get()?;
    let out = matchqueue::enqueue(&mut conn, &ident.user_id, &ident.display_name, &state.retry)?;
    Ok(Json(match out {
        EnqueueOutcome::Paired(chat) => {
            state.events.publish(Event::Paired {
                chat_id: chat.id,
                users: chat.participants.iter().map(|p| p.user_id.clone()).collect(),
            });
            EnqueueResp::Paired { chat }
        }
        EnqueueOutcome::Waiting(entry) => EnqueueResp::Waiting {
            enqueued_at: entry.enqueued_at,
        },
        EnqueueOutcome::AlreadyQueued => EnqueueResp::AlreadyQueued,
    }))
}

async fn cancel_match(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
) -> ApiResult<serde_json::Value> {
    let conn = state.pool.get()?;
    matchqueue::cancel(&conn, &ident.user_id)?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

// ---- one-to-one chats ----

#[derive(Deserialize)]
struct SendMessageReq {
    text: String,
}

#[derive(Deserialize)]
struct MarkReadReq {
    message_id: Uuid,
}

#[derive(Deserialize)]
struct ReportReq {
    reason: String,
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    status: Option<String>,
}

fn require_participant(chat: &ChatSession, user_id: &str) -> Result<(), ChatError> {
    if chat.has_participant(user_id) {
        Ok(())
    } else {
        Err(ChatError::Forbidden("not_a_participant"))
    }
}

async fn get_chat(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<ChatSession> {
    let conn = state.pool.get()?;
    let chat = chats::get(&conn, &id)?;
    require_participant(&chat, &ident.user_id)?;
    Ok(Json(chat))
}

async fn list_chat_messages(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<ChatMessage>> {
    let conn = state.pool.get()?;
    let chat = chats::get(&conn, &id)?;
    require_participant(&chat, &ident.user_id)?;
    let msgs = chats::list_messages(&conn, &id, query.limit.unwrap_or(100))?;
    Ok(Json(msgs))
}

async fn send_chat_message(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageReq>,
) -> ApiResult<ChatMessage> {
    let mut conn = state.pool.get()?;
    let message = chats::send_message(&mut conn, &id, &ident.user_id, &req.text)?;
    state.events.publish(Event::ChatMessage {
        chat_id: id,
        message: message.clone(),
    });
    Ok(Json(message))
}

async fn mark_chat_read(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<MarkReadReq>,
) -> ApiResult<serde_json::Value> {
    let conn = state.pool.get()?;
    chats::mark_read(&conn, &id, &req.message_id, &ident.user_id)?;
    Ok(Json(serde_json::json!({ "read": true })))
}

async fn end_chat(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let conn = state.pool.get()?;
    chats::end(&conn, &id, &ident.user_id)?;
    state.events.publish(Event::ChatEnded { chat_id: id });
    Ok(Json(serde_json::json!({ "ended": true })))
}

async fn report_chat(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReportReq>,
) -> ApiResult<serde_json::Value> {
    let conn = state.pool.get()?;
    chats::report(&conn, &id, &ident.user_id, &req.reason)?;
    Ok(Json(serde_json::json!({ "reported": true })))
}

// ---- groups ----

async fn create_group(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Json(req): Json<groups::NewGroup>,
) -> ApiResult<Group> {
    let mut conn = state.pool.get()?;
    let group = groups::create(&mut conn, &ident.user_id, &ident.display_name, &req)?;
    Ok(Json(group))
}

async fn list_groups(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Group>> {
    let conn = state.pool.get()?;
    Ok(Json(groups::list_public(&conn, query.limit.unwrap_or(50))?))
}

async fn my_groups(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
) -> ApiResult<Vec<Group>> {
    let conn = state.pool.get()?;
    Ok(Json(groups::groups_for_user(&conn, &ident.user_id)?))
}

/// Private groups are visible to active members only.
fn require_group_access(
    conn: &rusqlite::Connection,
    group: &Group,
    user_id: &str,
) -> Result<(), ChatError> {
    if group.is_public {
        return Ok(());
    }
    let active = groups::membership(conn, &group.id, user_id)?
        .map(|m| m.is_active)
        .unwrap_or(false);
    if active {
        Ok(())
    } else {
        Err(ChatError::Forbidden("not_a_member"))
    }
}

async fn get_group(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<Group> {
    let conn = state.pool.get()?;
    let group = groups::get(&conn, &id)?;
    require_group_access(&conn, &group, &ident.user_id)?;
    Ok(Json(group))
}

async fn update_group(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<groups::GroupUpdate>,
) -> ApiResult<Group> {
    let mut conn = state.pool.get()?;
    let group = groups::update_settings(&mut conn, &id, &ident.user_id, &req)?;
    Ok(Json(group))
}

async fn join_group(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let mut conn = state.pool.get()?;
    let joined = groups::join(&mut conn, &id, &ident.user_id, &ident.display_name)?;
    if joined {
        state.events.publish(Event::MemberJoined {
            group_id: id,
            user_id: ident.user_id.clone(),
        });
    }
    // false means the caller was already an active member
    Ok(Json(serde_json::json!({ "joined": joined })))
}

async fn leave_group(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let mut conn = state.pool.get()?;
    groups::leave(&mut conn, &id, &ident.user_id, &ident.display_name)?;
    state.events.publish(Event::MemberLeft {
        group_id: id,
        user_id: ident.user_id.clone(),
    });
    Ok(Json(serde_json::json!({ "left": true })))
}

#[derive(Deserialize)]
struct RoleReq {
    user_id: String,
    role: MemberRole,
}

async fn set_group_role(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<RoleReq>,
) -> ApiResult<serde_json::Value> {
    let mut conn = state.pool.get()?;
    groups::set_role(&mut conn, &id, &ident.user_id, &req.user_id, req.role)?;
    Ok(Json(serde_json::json!({ "updated": true })))
}

async fn list_group_members(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Membership>> {
    let conn = state.pool.get()?;
    let group = groups::get(&conn, &id)?;
    require_group_access(&conn, &group, &ident.user_id)?;
    Ok(Json(groups::members(&conn, &id)?))
}

async fn list_group_messages(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<GroupMessage>> {
    let conn = state.pool.get()?;
    let group = groups::get(&conn, &id)?;
    require_group_access(&conn, &group, &ident.user_id)?;
    Ok(Json(groups::list_messages(&conn, &id, query.limit.unwrap_or(100))?))
}

async fn post_group_message(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageReq>,
) -> ApiResult<GroupMessage> {
    let mut conn = state.pool.get()?;
    let message = groups::post(&mut conn, &id, &ident.user_id, &ident.display_name, &req.text)?;
    state.events.publish(Event::GroupMessage {
        group_id: id,
        message: message.clone(),
    });
    Ok(Json(message))
}

async fn remove_group_message(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path((id, message_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<serde_json::Value> {
    let mut conn = state.pool.get()?;
    groups::remove_message(&mut conn, &id, &message_id, &ident.user_id)?;
    Ok(Json(serde_json::json!({ "removed": true })))
}

async fn recount_group(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    let conn = state.pool.get()?;
    let count = groups::recount_members(&conn, &id)?;
    Ok(Json(serde_json::json!({ "member_count": count })))
}

// ---- presence ----

async fn heartbeat(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
) -> ApiResult<serde_json::Value> {
    let conn = state.pool.get()?;
    // best effort: a missed beat self-corrects on the next tick
    if let Err(e) = presence::heartbeat(&conn, &ident.user_id) {
        debug!("heartbeat dropped for {}: {e}", ident.user_id);
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn go_offline(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
) -> ApiResult<serde_json::Value> {
    let conn = state.pool.get()?;
    presence::mark_offline(&conn, &ident.user_id)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn presence_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<PresenceStatus> {
    let conn = state.pool.get()?;
    Ok(Json(presence::status(&conn, &user_id)?))
}

// ---- moderation ----

async fn list_reports(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> ApiResult<Vec<ReportRecord>> {
    let conn = state.pool.get()?;
    Ok(Json(moderation::list_reports(&conn, &target)?))
}

// ---- support tickets ----

#[derive(Deserialize)]
struct TicketReq {
    message: String,
}

#[derive(Deserialize)]
struct ResolveReq {
    response: String,
}

async fn create_ticket(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Json(req): Json<TicketReq>,
) -> ApiResult<SupportTicket> {
    let conn = state.pool.get()?;
    let ticket = tickets::create(&conn, &ident.user_id, &req.message)?;
    Ok(Json(ticket))
}

async fn list_tickets(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<SupportTicket>> {
    let conn = state.pool.get()?;
    let status = match query.status.as_deref() {
        Some(s) => Some(TicketStatus::parse(s).ok_or(ChatError::Validation("bad_status"))?),
        None => None,
    };
    Ok(Json(tickets::list(&conn, status)?))
}

async fn assign_ticket(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<SupportTicket> {
    let conn = state.pool.get()?;
    let ticket = tickets::assign(&conn, &id, &ident.user_id)?;
    state.events.publish(Event::TicketUpdated {
        ticket_id: id,
        status: ticket.status,
    });
    Ok(Json(ticket))
}

async fn resolve_ticket(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveReq>,
) -> ApiResult<SupportTicket> {
    let conn = state.pool.get()?;
    let ticket = tickets::resolve(&conn, &id, &ident.user_id, &req.response)?;
    state.events.publish(Event::TicketUpdated {
        ticket_id: id,
        status: ticket.status,
    });
    Ok(Json(ticket))
}

async fn reject_ticket(
    State(state): State<AppState>,
    Extension(ident): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> ApiResult<SupportTicket> {
    let conn = state.pool.get()?;
    let ticket = tickets::reject(&conn, &id, &ident.user_id)?;
    state.events.publish(Event::TicketUpdated {
        ticket_id: id,
        status: ticket.status,
    });
    Ok(Json(ticket))
}

// ---- live updates ----

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, StatusCode> {
    let topics: Vec<String> = params
        .get("topics")
        .map(|t| t.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, topics)))
}

/// Forward matching events until the client goes away. Closing the
/// socket drops the receiver; nothing is delivered afterwards.
async fn handle_socket(stream: WebSocket, state: AppState, topics: Vec<String>) {
    let (mut sender, mut receiver) = stream.split();
    let mut rx = BroadcastStream::new(state.events.subscribe());
    let _ = sender.send(Message::Text("hello".into())).await;
    loop {
        tokio::select! {
            ev = rx.next() => {
                match ev {
                    Some(Ok(event)) if event.matches(&topics) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(_) => {} // non-matching or lagged; keep going
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
}

/// Run the HTTP server bound to the provided address.
pub async fn run_http_server(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(config.clone())?;
    crate::housekeeping::run(state.clone());
    let addr: SocketAddr = config.bind.parse()?;
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}

// Integration tests live in the tests/ directory
