//! Control-channel integration: a simulated client registers over framed
//! TCP, serves one proxied request, and disconnects.

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use grok_auth::{generate_client_token, hash_token};
use grok_control::{ControlListener, ControlListenerConfig, ServiceSettings, TunnelService};
use grok_db::entities::{auth_token, tunnel, user};
use grok_events::EventBus;
use grok_proto::{
    decode_message, encode_message, ControlMessage, EndpointRequest, RegisterOptions,
};
use grok_proxy::forward_once;
use grok_registry::{PortPool, TunnelRegistry};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use uuid::Uuid;

async fn seed(db: &DatabaseConnection) -> String {
    let user_id = Uuid::new_v4();
    user::ActiveModel {
        id: Set(user_id),
        email: Set("dev@test".to_string()),
        password_hash: Set("x".to_string()),
        name: Set("Dev".to_string()),
        role: Set("org_user".to_string()),
        organization_id: Set(None),
        two_factor_enabled: Set(false),
        two_factor_secret: Set(None),
        is_active: Set(true),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .unwrap();

    let raw = generate_client_token();
    auth_token::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        token_hash: Set(hash_token(&raw)),
        name: Set("test".to_string()),
        scopes: Set(String::new()),
        expires_at: Set(None),
        is_active: Set(true),
        last_used_at: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .unwrap();
    raw
}

async fn start_server(port: u16) -> (Arc<TunnelService>, DatabaseConnection, String) {
    let db = grok_db::connect("sqlite::memory:").await.unwrap();
    grok_db::migrate(&db).await.unwrap();
    let raw_token = seed(&db).await;

    let (events, _bus_rx) = EventBus::new();
    let service = Arc::new(TunnelService::new(
        db.clone(),
        Arc::new(TunnelRegistry::new()),
        Arc::new(PortPool::new(20000, 20010)),
        events,
        ServiceSettings {
            domain: "localhost".to_string(),
            max_per_user: 10,
        },
    ));

    let listener = ControlListener::new(
        ControlListenerConfig {
            bind_addr: ([127, 0, 0, 1], port).into(),
            idle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_millis(100),
        },
        service.clone(),
    );
    tokio::spawn(async move {
        let _ = listener.start().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (service, db, raw_token)
}

type Client = Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>;

async fn connect_and_register(port: u16, raw_token: &str, subdomain: &str) -> (Client, Uuid) {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut framed = Framed::new(stream, grok_proto::codec());

    let register = ControlMessage::Register {
        client_id: format!("client-{subdomain}"),
        auth_token: raw_token.to_string(),
        endpoint: EndpointRequest::Http {
            subdomain: subdomain.to_string(),
        },
        options: RegisterOptions {
            local_addr: "localhost:3000".to_string(),
            saved_name: None,
            persistent: false,
        },
    };
    framed
        .send(encode_message(&register).unwrap())
        .await
        .unwrap();

    let frame = framed.next().await.unwrap().unwrap();
    match decode_message(&frame).unwrap() {
        ControlMessage::RegisterAck { tunnel_id, .. } => (framed, tunnel_id),
        other => panic!("expected RegisterAck, got {other:?}"),
    }
}

#[tokio::test]
async fn test_register_proxy_and_disconnect() {
    let port = 42851;
    let (service, db, raw_token) = start_server(port).await;

    let (mut client, tunnel_id) = connect_and_register(port, &raw_token, "api").await;

    // The channel is live and routable
    let handle = service.registry().find_by_subdomain("api").unwrap();
    assert_eq!(handle.meta.id, tunnel_id);

    // Client task: answer the first proxied request with 200 "hi"
    let server_side = tokio::spawn(async move {
        while let Some(frame) = client.next().await {
            let msg = decode_message(&frame.unwrap()).unwrap();
            if let ControlMessage::HttpRequestBody {
                request_id,
                is_final: true,
                ..
            } = msg
            {
                let head = ControlMessage::HttpResponse {
                    request_id,
                    status: 200,
                    headers: vec![("content-type".to_string(), "text/plain".to_string())],
                };
                client.send(encode_message(&head).unwrap()).await.unwrap();
                let body = ControlMessage::HttpResponseBody {
                    request_id,
                    data: b"hi".to_vec(),
                    is_final: true,
                };
                client.send(encode_message(&body).unwrap()).await.unwrap();
                break;
            }
        }
        client
    });

    let response = forward_once(
        &handle,
        "GET",
        "/hello",
        vec![("host".to_string(), "api.localhost".to_string())],
        b"",
        Duration::from_secs(2),
        1024,
    )
    .await
    .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hi");

    // Drop the client transport; the server unregisters the tunnel
    let client = server_side.await.unwrap();
    drop(client);

    tokio::time::timeout(Duration::from_secs(2), async {
        while service.registry().get(tunnel_id).is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("tunnel should leave the registry after disconnect");

    let row = tunnel::Entity::find_by_id(tunnel_id)
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "disconnected");
    assert!(row.disconnected_at.is_some());
}

#[tokio::test]
async fn test_register_rejected_with_bad_token() {
    let port = 42852;
    let (_service, _db, _raw_token) = start_server(port).await;

    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut framed = Framed::new(stream, grok_proto::codec());

    let register = ControlMessage::Register {
        client_id: "client-x".to_string(),
        auth_token: "grok_bogus".to_string(),
        endpoint: EndpointRequest::Http {
            subdomain: "api".to_string(),
        },
        options: RegisterOptions::default(),
    };
    framed
        .send(encode_message(&register).unwrap())
        .await
        .unwrap();

    let frame = framed.next().await.unwrap().unwrap();
    match decode_message(&frame).unwrap() {
        ControlMessage::RegisterError { code, .. } => {
            assert_eq!(code, "authentication_failed");
        }
        other => panic!("expected RegisterError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_heartbeat_echo() {
    let port = 42853;
    let (_service, _db, raw_token) = start_server(port).await;
    let (mut client, _tunnel_id) = connect_and_register(port, &raw_token, "beat").await;

    client
        .send(encode_message(&ControlMessage::Heartbeat { timestamp: 77 }).unwrap())
        .await
        .unwrap();

    let echoed = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(frame) = client.next().await {
            if let ControlMessage::Heartbeat { timestamp } = decode_message(&frame.unwrap()).unwrap()
            {
                return timestamp;
            }
        }
        panic!("stream ended before heartbeat echo");
    })
    .await
    .unwrap();
    assert_eq!(echoed, 77);
}

#[tokio::test]
async fn test_in_flight_request_fails_on_disconnect() {
    let port = 42854;
    let (service, db, raw_token) = start_server(port).await;
    let (mut client, tunnel_id) = connect_and_register(port, &raw_token, "drop").await;

    let handle = service.registry().find_by_subdomain("drop").unwrap();

    // Client reads the request, then hangs up without responding
    let killer = tokio::spawn(async move {
        while let Some(frame) = client.next().await {
            let msg = decode_message(&frame.unwrap()).unwrap();
            if matches!(msg, ControlMessage::HttpRequestBody { is_final: true, .. }) {
                break;
            }
        }
        drop(client);
    });

    let result = forward_once(
        &handle,
        "GET",
        "/",
        vec![],
        b"",
        Duration::from_secs(5),
        1024,
    )
    .await;
    assert!(matches!(
        result,
        Err(grok_proxy::ForwardError::TunnelDisconnected)
    ));
    killer.await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let row = tunnel::Entity::find_by_id(tunnel_id)
                .one(&db)
                .await
                .unwrap()
                .unwrap();
            if row.status == "disconnected" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("row should be marked disconnected");
}
