use relay_chat::api::{build_router, AppState};
use relay_chat::config::Config;
use reqwest::StatusCode;
use std::net::{SocketAddr, TcpListener};
use tokio::task::JoinHandle;

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: addr.to_string(),
        data_dir: tmp.path().to_path_buf(),
        logging_enabled: false,
        retention_days: 365,
    };
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state);
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, tmp)
}

async fn register(
    client: &reqwest::Client,
    addr: &SocketAddr,
    name: &str,
    email: &str,
) -> (String, i64) {
    let resp = client
        .post(format!("http://{}/api/auth/register", addr))
        .json(&serde_json::json!({"name": name, "email": email, "password": "password1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let v: serde_json::Value = resp.json().await.unwrap();
    (
        v["token"].as_str().unwrap().to_string(),
        v["user"]["id"].as_i64().unwrap(),
    )
}

#[tokio::test]
async fn register_login_and_me() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();

    let (token, alice_id) = register(&client, &addr, "Alice", "alice@example.com").await;

    // duplicate email is a field-level validation error
    let resp = client
        .post(format!("http://{}/api/auth/register", addr))
        .json(&serde_json::json!({"name":"Imposter","email":"alice@example.com","password":"password1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let v: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(v["field"], "email");

    let resp = client
        .post(format!("http://{}/api/auth/login", addr))
        .json(&serde_json::json!({"email":"alice@example.com","password":"wrong-password"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .post(format!("http://{}/api/auth/login", addr))
        .json(&serde_json::json!({"email":"alice@example.com","password":"password1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let me: serde_json::Value = client
        .get(format!("http://{}/api/auth/me", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["id"].as_i64().unwrap(), alice_id);
    assert_eq!(me["email"], "alice@example.com");

    // no token, no entry
    let resp = client
        .get(format!("http://{}/api/auth/me", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    server.abort();
}

#[tokio::test]
async fn direct_chat_dedup_and_self_chat() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice_token, alice_id) = register(&client, &addr, "Alice", "alice@example.com").await;
    let (bob_token, bob_id) = register(&client, &addr, "Bob", "bob@example.com").await;

    let resp = client
        .post(format!("http://{}/api/chats/direct", addr))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"user_id": alice_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let resp = client
        .post(format!("http://{}/api/chats/direct", addr))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"user_id": 9999}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let first: serde_json::Value = client
        .post(format!("http://{}/api/chats/direct", addr))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"user_id": bob_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = first["chat"]["id"].as_str().unwrap().to_string();
    assert_eq!(first["chat"]["kind"], "direct");
    assert_eq!(first["chat"]["users"][0]["id"].as_i64().unwrap(), bob_id);

    // same pair from the other side resolves to the same chat
    let second: serde_json::Value = client
        .post(format!("http://{}/api/chats/direct", addr))
        .bearer_auth(&bob_token)
        .json(&serde_json::json!({"user_id": alice_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["chat"]["id"].as_str().unwrap(), chat_id);

    let listing: serde_json::Value = client
        .get(format!("http://{}/api/chats", addr))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing.as_array().unwrap().len(), 1);

    server.abort();
}

#[tokio::test]
async fn message_flow_read_tracking_and_masking() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice_token, _alice_id) = register(&client, &addr, "Alice", "alice@example.com").await;
    let (bob_token, bob_id) = register(&client, &addr, "Bob", "bob@example.com").await;
    let (carol_token, _carol_id) = register(&client, &addr, "Carol", "carol@example.com").await;

    let chat: serde_json::Value = client
        .post(format!("http://{}/api/chats/direct", addr))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"user_id": bob_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["chat"]["id"].as_str().unwrap().to_string();

    // validation: empty and oversized content
    let resp = client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"content": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let resp = client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"content": "x".repeat(5001)}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    // outsiders cannot send, and cannot tell the chat exists
    let resp = client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .bearer_auth(&carol_token)
        .json(&serde_json::json!({"content": "hello?"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = client
        .get(format!("http://{}/api/chats/{}", addr, chat_id))
        .bearer_auth(&carol_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"content": "hi bob"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let sent: serde_json::Value = resp.json().await.unwrap();
    let message_id = sent["message"]["id"].as_str().unwrap().to_string();
    assert_eq!(sent["message"]["is_read"], false);
    assert_eq!(sent["message"]["author"]["name"], "Alice");

    // the listing reflects the new last message and Bob's unread count
    let listing: serde_json::Value = client
        .get(format!("http://{}/api/chats", addr))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        listing[0]["last_message"]["id"].as_str().unwrap(),
        message_id
    );
    assert_eq!(listing[0]["unread_count"], 1);

    // the author cannot mark their own message read
    let resp = client
        .post(format!(
            "http://{}/api/chats/{}/messages/{}/read",
            addr, chat_id, message_id
        ))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // Bob can, and a repeat is a quiet no-op
    for _ in 0..2 {
        let resp = client
            .post(format!(
                "http://{}/api/chats/{}/messages/{}/read",
                addr, chat_id, message_id
            ))
            .bearer_auth(&bob_token)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let listing: serde_json::Value = client
        .get(format!("http://{}/api/chats", addr))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing[0]["unread_count"], 0);
    assert_eq!(listing[0]["last_message"]["is_read"], true);

    // bulk read: two more from Alice, then mark the chat
    for content in ["one", "two"] {
        client
            .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
            .bearer_auth(&alice_token)
            .json(&serde_json::json!({"content": content}))
            .send()
            .await
            .unwrap();
    }
    let resp = client
        .post(format!("http://{}/api/chats/{}/read", addr, chat_id))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let listing: serde_json::Value = client
        .get(format!("http://{}/api/chats", addr))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing[0]["unread_count"], 0);

    server.abort();
}

#[tokio::test]
async fn edit_delete_and_search() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice_token, _) = register(&client, &addr, "Alice", "alice@example.com").await;
    let (bob_token, bob_id) = register(&client, &addr, "Bob", "bob@example.com").await;
    let (carol_token, carol_id) = register(&client, &addr, "Carol", "carol@example.com").await;

    let chat: serde_json::Value = client
        .post(format!("http://{}/api/chats/direct", addr))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"user_id": bob_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["chat"]["id"].as_str().unwrap().to_string();

    let sent: serde_json::Value = client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"content": "the launch codes"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let message_id = sent["message"]["id"].as_str().unwrap().to_string();

    // a non-author member editing gets the same 404 as a missing message
    let resp = client
        .put(format!(
            "http://{}/api/chats/{}/messages/{}",
            addr, chat_id, message_id
        ))
        .bearer_auth(&bob_token)
        .json(&serde_json::json!({"content": "redacted"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let edited: serde_json::Value = client
        .put(format!(
            "http://{}/api/chats/{}/messages/{}",
            addr, chat_id, message_id
        ))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"content": "the LAUNCH window"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(edited["message"]["content"], "the LAUNCH window");

    // global search is scoped to the viewer's chats
    let chat2: serde_json::Value = client
        .post(format!("http://{}/api/chats/direct", addr))
        .bearer_auth(&bob_token)
        .json(&serde_json::json!({"user_id": carol_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat2_id = chat2["chat"]["id"].as_str().unwrap().to_string();
    client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat2_id))
        .bearer_auth(&carol_token)
        .json(&serde_json::json!({"content": "launch party"}))
        .send()
        .await
        .unwrap();

    let found: serde_json::Value = client
        .get(format!("http://{}/api/messages/search?q=launch", addr))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found.as_array().unwrap().len(), 1);
    let found: serde_json::Value = client
        .get(format!("http://{}/api/messages/search?q=launch", addr))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found.as_array().unwrap().len(), 2);

    // delete: non-author masked, author allowed
    let resp = client
        .delete(format!(
            "http://{}/api/chats/{}/messages/{}",
            addr, chat_id, message_id
        ))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = client
        .delete(format!(
            "http://{}/api/chats/{}/messages/{}",
            addr, chat_id, message_id
        ))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let listing: serde_json::Value = client
        .get(format!("http://{}/api/chats", addr))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listing[0]["last_message"].is_null());

    server.abort();
}

#[tokio::test]
async fn contacts_profile_and_leave() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice_token, _) = register(&client, &addr, "Alice", "alice@example.com").await;
    let (bob_token, bob_id) = register(&client, &addr, "Bob", "bob@example.com").await;

    let chat: serde_json::Value = client
        .post(format!("http://{}/api/chats/direct", addr))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"user_id": bob_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["chat"]["id"].as_str().unwrap().to_string();

    let contacts: serde_json::Value = client
        .get(format!("http://{}/api/contacts", addr))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(contacts.as_array().unwrap().len(), 1);
    assert_eq!(contacts[0]["name"], "Bob");

    let found: serde_json::Value = client
        .get(format!("http://{}/api/users/search?q=bo", addr))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found.as_array().unwrap().len(), 1);

    let updated: serde_json::Value = client
        .put(format!("http://{}/api/users/me", addr))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"bio": "hello there"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["bio"], "hello there");

    let resp = client
        .put(format!("http://{}/api/users/me", addr))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"email": "bob@example.com"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    // leaving: first member detaches, second removal deletes the chat
    let resp = client
        .delete(format!("http://{}/api/chats/{}", addr, chat_id))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    // Alice is gone; the chat no longer exists for her
    let resp = client
        .get(format!("http://{}/api/chats/{}", addr, chat_id))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = client
        .delete(format!("http://{}/api/chats/{}", addr, chat_id))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let listing: serde_json::Value = client
        .get(format!("http://{}/api/chats", addr))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listing.as_array().unwrap().is_empty());

    server.abort();
}

#[tokio::test]
async fn health_and_metrics() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("http://{}/api/health", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["services"]["database"], "ok");

    let (alice_token, _) = register(&client, &addr, "Alice", "alice@example.com").await;
    let (_, bob_id) = register(&client, &addr, "Bob", "bob@example.com").await;
    let chat: serde_json::Value = client
        .post(format!("http://{}/api/chats/direct", addr))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"user_id": bob_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chat_id = chat["chat"]["id"].as_str().unwrap().to_string();
    client
        .post(format!("http://{}/api/chats/{}/messages", addr, chat_id))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({"content": "hello"}))
        .send()
        .await
        .unwrap();

    let metrics: serde_json::Value = client
        .get(format!("http://{}/api/metrics", addr))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["users"]["total"], 2);
    assert_eq!(metrics["chats"]["total"], 1);
    assert_eq!(metrics["messages"]["total"], 1);
    assert_eq!(metrics["messages"]["sent"], 1);

    server.abort();
}
