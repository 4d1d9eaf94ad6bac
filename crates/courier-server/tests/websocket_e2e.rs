use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use courier_db::Database;
use courier_gateway::{Collaborators, Gateway, GatewayConfig, JwtVerifier};
use courier_server::routes;
use courier_types::api::{AckOutcome, Claims, ErrorCode};
use courier_types::events::{GatewayCommand, ServerEvent};
use courier_types::models::{Conversation, MessageKind};

const SECRET: &str = "e2e-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> SocketAddr {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let verifier = Arc::new(JwtVerifier::new(SECRET));
    let gateway = Gateway::new(GatewayConfig::default(), Collaborators::sqlite(db, verifier));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, routes::router(gateway)).await.unwrap();
    });
    addr
}

fn token(user_id: Uuid, name: &str) -> String {
    let claims = Claims {
        sub: user_id,
        username: name.into(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

async fn connect_with_query(addr: SocketAddr, user_id: Uuid, name: &str) -> Client {
    let url = format!("ws://{}/gateway?token={}", addr, token(user_id, name));
    let (ws, _) = connect_async(url).await.expect("upgrade should succeed");
    ws
}

async fn connect_with_header(addr: SocketAddr, user_id: Uuid, name: &str) -> Client {
    let mut request = format!("ws://{}/gateway", addr).into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", token(user_id, name)).parse().unwrap(),
    );
    let (ws, _) = connect_async(request).await.expect("upgrade should succeed");
    ws
}

async fn next_event(ws: &mut Client) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for an event")
            .expect("socket closed")
            .expect("websocket error");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_for(ws: &mut Client, wanted: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    loop {
        let event = next_event(ws).await;
        if wanted(&event) {
            return event;
        }
    }
}

async fn issue(ws: &mut Client, command: &GatewayCommand) {
    let text = serde_json::to_string(command).unwrap();
    ws.send(WsMessage::Text(text.into())).await.unwrap();
}

#[tokio::test]
async fn test_direct_message_over_websocket() {
    let addr = spawn_server().await;
    let (ada, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let mut ada_ws = connect_with_query(addr, ada, "ada").await;
    assert!(matches!(next_event(&mut ada_ws).await, ServerEvent::Ready { user_id, .. } if user_id == ada));
    let mut bob_ws = connect_with_header(addr, bob, "bob").await;
    assert!(matches!(next_event(&mut bob_ws).await, ServerEvent::Ready { user_id, .. } if user_id == bob));

    issue(
        &mut ada_ws,
        &GatewayCommand::SendMessage {
            target: Conversation::Direct(bob),
            body: "hello over the wire".into(),
            kind: MessageKind::Text,
            parent_id: None,
            client_temp_id: Some("tmp-42".into()),
        },
    )
    .await;

    let ack = wait_for(&mut ada_ws, |e| matches!(e, ServerEvent::Ack { .. })).await;
    let sent_id = match ack {
        ServerEvent::Ack {
            op,
            client_temp_id,
            outcome: AckOutcome::Ok { message: Some(message) },
        } => {
            assert_eq!(op, "send_message");
            assert_eq!(client_temp_id.as_deref(), Some("tmp-42"));
            message.id
        }
        other => panic!("unexpected ack {:?}", other),
    };

    let created = wait_for(&mut bob_ws, |e| matches!(e, ServerEvent::MessageCreated { .. })).await;
    assert!(matches!(created, ServerEvent::MessageCreated { message } if message.id == sent_id));
    let unread = wait_for(&mut bob_ws, |e| matches!(e, ServerEvent::UnreadCountChanged { .. })).await;
    assert_eq!(
        unread,
        ServerEvent::UnreadCountChanged {
            conversation: Conversation::Direct(ada),
            count: 1,
        }
    );
}

#[tokio::test]
async fn test_upgrade_refused_without_valid_credential() {
    let addr = spawn_server().await;

    for url in [
        format!("ws://{}/gateway", addr),
        format!("ws://{}/gateway?token=garbage", addr),
    ] {
        match connect_async(url).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("upgrade should have been refused"),
        }
    }
}

#[tokio::test]
async fn test_malformed_command_gets_error_ack() {
    let addr = spawn_server().await;
    let mut ws = connect_with_query(addr, Uuid::new_v4(), "ada").await;
    next_event(&mut ws).await;

    ws.send(WsMessage::Text("{not json".into())).await.unwrap();

    match wait_for(&mut ws, |e| matches!(e, ServerEvent::Ack { .. })).await {
        ServerEvent::Ack {
            op,
            outcome: AckOutcome::Error { code, retryable, .. },
            ..
        } => {
            assert_eq!(op, "unknown");
            assert_eq!(code, ErrorCode::Invalid);
            assert!(!retryable);
        }
        other => panic!("unexpected ack {:?}", other),
    }
}

#[tokio::test]
async fn test_closing_last_socket_announces_offline() {
    let addr = spawn_server().await;
    let (ada, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let mut bob_ws = connect_with_query(addr, bob, "bob").await;
    next_event(&mut bob_ws).await;

    let mut ada_ws = connect_with_query(addr, ada, "ada").await;
    wait_for(&mut bob_ws, |e| {
        matches!(e, ServerEvent::PresenceChanged { user_id, online: true } if *user_id == ada)
    })
    .await;

    ada_ws.close(None).await.unwrap();
    wait_for(&mut bob_ws, |e| {
        matches!(e, ServerEvent::PresenceChanged { user_id, online: false } if *user_id == ada)
    })
    .await;
}

#[tokio::test]
async fn test_health() {
    let addr = spawn_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"ok""#));
}
