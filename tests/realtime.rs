use futures::StreamExt;
use pairline::api::{build_router, AppState};
use pairline::config::Config;
use std::net::{SocketAddr, TcpListener};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message as WsMessage,
};
use uuid::Uuid;

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, AppState, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: addr.to_string(),
        data_dir: tmp.path().to_path_buf(),
        heartbeat_secs: 60,
        logging_enabled: false,
    };
    let state = AppState::new(config).unwrap();
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, state, tmp)
}

async fn connect_ws(
    addr: SocketAddr,
    topics: &str,
    user: &str,
    name: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let mut req = format!("ws://{}/ws?topics={}", addr, topics)
        .into_client_request()
        .unwrap();
    req.headers_mut().append("X-User-Id", user.parse().unwrap());
    req.headers_mut()
        .append("X-Display-Name", name.parse().unwrap());
    let (ws, _) = connect_async(req).await.unwrap();
    ws
}

fn as_user(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: String,
    user: &str,
    name: &str,
) -> reqwest::RequestBuilder {
    client
        .request(method, url)
        .header("X-User-Id", user)
        .header("X-Display-Name", name)
}

#[tokio::test]
async fn match_chat_and_events_flow() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();

    // no identity, no service
    let resp = client
        .post(format!("http://{}/api/match", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // the socket carries the same identity headers as the REST calls;
    // a handshake without them is refused
    assert!(connect_async(format!("ws://{}/ws", addr)).await.is_err());

    // Ann subscribes to her own topic before searching
    let mut ann_ws = connect_ws(addr, "user:ann", "ann", "Ann").await;
    ann_ws.next().await; // hello

    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/match", addr),
        "ann",
        "Ann",
    )
    .send()
    .await
    .unwrap();
    let v: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(v["outcome"], "waiting");

    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/match", addr),
        "ben",
        "Ben",
    )
    .send()
    .await
    .unwrap();
    let v: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(v["outcome"], "paired");
    let chat_id = v["chat"]["id"].as_str().unwrap().parse::<Uuid>().unwrap();

    // Ann hears about the pairing on her topic
    let ev = timeout(Duration::from_secs(2), ann_ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .into_text()
        .unwrap();
    let v: serde_json::Value = serde_json::from_str(&ev).unwrap();
    assert_eq!(v["t"], "paired");
    assert_eq!(v["chat_id"].as_str().unwrap(), chat_id.to_string());

    // Ben listens on the chat topic; Ann speaks
    let mut ben_ws = connect_ws(addr, &format!("chat:{}", chat_id), "ben", "Ben").await;
    ben_ws.next().await; // hello
    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/chats/{}/messages", addr, chat_id),
        "ann",
        "Ann",
    )
    .json(&serde_json::json!({ "text": "hi ben" }))
    .send()
    .await
    .unwrap();
    assert!(resp.status().is_success());
    let sent: serde_json::Value = resp.json().await.unwrap();

    let ev = timeout(Duration::from_secs(2), ben_ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .into_text()
        .unwrap();
    let v: serde_json::Value = serde_json::from_str(&ev).unwrap();
    assert_eq!(v["t"], "chat_message");
    assert_eq!(v["message"]["id"], sent["id"]);

    // outsiders cannot read the chat
    let resp = as_user(
        &client,
        reqwest::Method::GET,
        format!("http://{}/api/chats/{}", addr, chat_id),
        "mallory",
        "Mallory",
    )
    .send()
    .await
    .unwrap();
    assert_eq!(resp.status(), 403);

    // end, then sending is a conflict
    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/chats/{}/end", addr, chat_id),
        "ben",
        "Ben",
    )
    .send()
    .await
    .unwrap();
    assert!(resp.status().is_success());
    if let Some(Ok(WsMessage::Text(txt))) = timeout(Duration::from_secs(2), ben_ws.next())
        .await
        .unwrap()
    {
        let v: serde_json::Value = serde_json::from_str(&txt).unwrap();
        assert_eq!(v["t"], "chat_ended");
    }
    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/chats/{}/messages", addr, chat_id),
        "ann",
        "Ann",
    )
    .json(&serde_json::json!({ "text": "still there?" }))
    .send()
    .await
    .unwrap();
    assert_eq!(resp.status(), 409);
    server.abort();
}

#[tokio::test]
async fn group_and_ticket_http_flow() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/groups", addr),
        "ann",
        "Ann",
    )
    .json(&serde_json::json!({ "name": "Night Owls", "is_anonymous": true }))
    .send()
    .await
    .unwrap();
    assert!(resp.status().is_success());
    let group: serde_json::Value = resp.json().await.unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();

    // anonymous group posts carry a stable pseudonym, not the real name
    let mut ws = connect_ws(addr, &format!("group:{}", group_id), "ann", "Ann").await;
    ws.next().await; // hello
    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/groups/{}/messages", addr, group_id),
        "ben",
        "Ben",
    )
    .json(&serde_json::json!({ "text": "anyone awake?" }))
    .send()
    .await
    .unwrap();
    assert!(resp.status().is_success());
    let msg: serde_json::Value = resp.json().await.unwrap();
    let shown = msg["sender_name"].as_str().unwrap();
    assert!(shown.starts_with("anon-"));
    assert_ne!(shown, "Ben");

    let ev = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .into_text()
        .unwrap();
    let v: serde_json::Value = serde_json::from_str(&ev).unwrap();
    assert_eq!(v["t"], "group_message");

    // posting auto-joined Ben
    let resp = as_user(
        &client,
        reqwest::Method::GET,
        format!("http://{}/api/my/groups", addr),
        "ben",
        "Ben",
    )
    .send()
    .await
    .unwrap();
    let mine: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(mine.as_array().unwrap().len(), 1);

    // a fresh join reports true, a repeat join reports the no-op
    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/groups/{}/join", addr, group_id),
        "cam",
        "Cam",
    )
    .send()
    .await
    .unwrap();
    let v: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(v["joined"], true);
    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/groups/{}/join", addr, group_id),
        "ben",
        "Ben",
    )
    .send()
    .await
    .unwrap();
    let v: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(v["joined"], false);

    // ticket triage over HTTP
    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/tickets", addr),
        "ben",
        "Ben",
    )
    .json(&serde_json::json!({ "message": "my match vanished" }))
    .send()
    .await
    .unwrap();
    let ticket: serde_json::Value = resp.json().await.unwrap();
    let ticket_id = ticket["id"].as_str().unwrap().to_string();

    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/tickets/{}/assign", addr, ticket_id),
        "staff1",
        "Staff",
    )
    .send()
    .await
    .unwrap();
    let ticket: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(ticket["status"], "processing");

    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/tickets/{}/resolve", addr, ticket_id),
        "staff1",
        "Staff",
    )
    .json(&serde_json::json!({ "response": "they went offline" }))
    .send()
    .await
    .unwrap();
    let ticket: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(ticket["status"], "resolved");

    // resolved is terminal
    let resp = as_user(
        &client,
        reqwest::Method::POST,
        format!("http://{}/api/tickets/{}/reject", addr, ticket_id),
        "staff2",
        "Staff",
    )
    .send()
    .await
    .unwrap();
    assert_eq!(resp.status(), 409);
    server.abort();
}
