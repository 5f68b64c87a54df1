//! Admin API integration: login flow, CSRF rotation, RBAC scoping.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use grok_api::middleware::{CsrfStore, JwtState, RateLimiter};
use grok_api::{build_router, AppState};
use grok_auth::hash_password;
use grok_control::{ServiceSettings, TunnelService};
use grok_db::entities::user;
use grok_events::{EventBus, SseBroker};
use grok_registry::{PortPool, TunnelRegistry};
use http_body_util::BodyExt;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "integration-test-secret-0123456789abcdef";

struct Harness {
    router: axum::Router,
    db: DatabaseConnection,
}

async fn harness() -> Harness {
    let db = grok_db::connect("sqlite::memory:").await.unwrap();
    grok_db::migrate(&db).await.unwrap();

    let (events, bus_rx) = EventBus::new();
    let broker = SseBroker::spawn(bus_rx);
    let writer = grok_db::LogWriter::spawn(db.clone(), 0);

    let service = Arc::new(TunnelService::new(
        db.clone(),
        Arc::new(TunnelRegistry::new()),
        Arc::new(PortPool::new(30000, 30010)),
        events.clone(),
        ServiceSettings {
            domain: "localhost".to_string(),
            max_per_user: 10,
        },
    ));

    let state = Arc::new(AppState {
        db: db.clone(),
        service,
        broker,
        events,
        log: writer.handle(),
        jwt: JwtState::new(SECRET.as_bytes()),
        csrf: CsrfStore::new(),
        limiter: RateLimiter::new(),
        domain: "localhost".to_string(),
        cors_origins: vec![],
        is_https: false,
        started_at: std::time::Instant::now(),
    });

    Harness {
        router: build_router(state),
        db,
    }
}

async fn seed_user(db: &DatabaseConnection, email: &str, role: &str, password: &str) -> Uuid {
    let id = Uuid::new_v4();
    user::ActiveModel {
        id: Set(id),
        email: Set(email.to_string()),
        password_hash: Set(hash_password(password).unwrap()),
        name: Set("Test".to_string()),
        role: Set(role.to_string()),
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
    id
}

fn with_conn_info(mut req: Request<Body>) -> Request<Body> {
    let addr: SocketAddr = "203.0.113.5:55555".parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

/// Login and return (bearer token, first CSRF token).
async fn login(harness: &Harness, email: &str, password: &str) -> (String, String) {
    let body = serde_json::json!({ "email": email, "password": password }).to_string();
    let response = harness
        .router
        .clone()
        .oneshot(with_conn_info(
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let csrf = response
        .headers()
        .get("x-csrf-token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    (parsed["token"].as_str().unwrap().to_string(), csrf)
}

#[tokio::test]
async fn test_health_is_public() {
    let harness = harness().await;
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["database"], "ok");
}

#[tokio::test]
async fn test_protected_routes_require_auth() {
    let harness = harness().await;
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/tunnels")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_bad_password() {
    let harness = harness().await;
    seed_user(&harness.db, "a@test", "org_user", "right-password").await;

    let body = serde_json::json!({ "email": "a@test", "password": "wrong" }).to_string();
    let response = harness
        .router
        .clone()
        .oneshot(with_conn_info(
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_and_list_tunnels() {
    let harness = harness().await;
    seed_user(&harness.db, "a@test", "org_user", "pass-123456").await;
    let (token, _csrf) = login(&harness, "a@test", "pass-123456").await;

    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/tunnels")
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_mutation_requires_csrf() {
    let harness = harness().await;
    seed_user(&harness.db, "a@test", "org_user", "pass-123456").await;
    let (token, csrf) = login(&harness, "a@test", "pass-123456").await;

    let body = serde_json::json!({ "name": "laptop" }).to_string();

    // Without the CSRF header the mutation is refused
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tokens")
                .header("Authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // With it, the token is minted and a fresh CSRF token is rotated in
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tokens")
                .header("Authorization", format!("Bearer {token}"))
                .header("x-csrf-token", &csrf)
                .header("content-type", "application/json")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let rotated = response
        .headers()
        .get("x-csrf-token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(rotated, csrf);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(parsed["token"].as_str().unwrap().starts_with("grok_"));

    // The consumed CSRF token cannot be replayed
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tokens")
                .header("Authorization", format!("Bearer {token}"))
                .header("x-csrf-token", &csrf)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_org_user_cannot_create_orgs() {
    let harness = harness().await;
    seed_user(&harness.db, "a@test", "org_user", "pass-123456").await;
    let (token, csrf) = login(&harness, "a@test", "pass-123456").await;

    let body = serde_json::json!({ "name": "Acme", "subdomain": "acme" }).to_string();
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/organizations")
                .header("Authorization", format!("Bearer {token}"))
                .header("x-csrf-token", &csrf)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_super_admin_creates_org_and_user() {
    let harness = harness().await;
    seed_user(&harness.db, "root@test", "super_admin", "pass-123456").await;
    let (token, csrf) = login(&harness, "root@test", "pass-123456").await;

    let body = serde_json::json!({ "name": "Acme", "subdomain": "acme" }).to_string();
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/organizations")
                .header("Authorization", format!("Bearer {token}"))
                .header("x-csrf-token", &csrf)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let rotated = response
        .headers()
        .get("x-csrf-token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let org: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    let body = serde_json::json!({
        "email": "member@acme.test",
        "password": "member-pass-1",
        "name": "Member",
        "role": "org_user",
        "organization_id": org["id"],
    })
    .to_string();
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/users")
                .header("Authorization", format!("Bearer {token}"))
                .header("x-csrf-token", &rotated)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_two_factor_login_flow() {
    let harness = harness().await;

    // Seed an account with 2FA enrolled
    let secret = grok_auth::generate_totp_secret();
    let id = Uuid::new_v4();
    user::ActiveModel {
        id: Set(id),
        email: Set("2fa@test".to_string()),
        password_hash: Set(hash_password("pass-123456").unwrap()),
        name: Set("TwoFactor".to_string()),
        role: Set("org_user".to_string()),
        organization_id: Set(None),
        two_factor_enabled: Set(true),
        two_factor_secret: Set(Some(secret.clone())),
        is_active: Set(true),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(&harness.db)
    .await
    .unwrap();

    // Step 1: password only yields a pending token, no cookie
    let body = serde_json::json!({ "email": "2fa@test", "password": "pass-123456" }).to_string();
    let response = harness
        .router
        .clone()
        .oneshot(with_conn_info(
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("set-cookie").is_none());

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["two_factor_required"], true);
    let pending = parsed["token"].as_str().unwrap().to_string();

    // The pending token is not a session
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/tunnels")
                .header("Authorization", format!("Bearer {pending}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Step 2: current TOTP code completes the login
    let code = {
        use totp_rs::{Algorithm, Secret, TOTP};
        let bytes = Secret::Encoded(secret).to_bytes().unwrap();
        TOTP::new(Algorithm::SHA1, 6, 1, 30, bytes)
            .unwrap()
            .generate_current()
            .unwrap()
    };
    let body = serde_json::json!({ "code": code }).to_string();
    let response = harness
        .router
        .clone()
        .oneshot(with_conn_info(
            Request::builder()
                .method("POST")
                .uri("/api/auth/2fa")
                .header("Authorization", format!("Bearer {pending}"))
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("set-cookie").is_some());

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["two_factor_required"], false);
    let session = parsed["token"].as_str().unwrap().to_string();

    // The full session works
    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/tunnels")
                .header("Authorization", format!("Bearer {session}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_self_deletion_prohibited() {
    let harness = harness().await;
    let my_id = seed_user(&harness.db, "root@test", "super_admin", "pass-123456").await;
    let (token, csrf) = login(&harness, "root@test", "pass-123456").await;

    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/users/{my_id}"))
                .header("Authorization", format!("Bearer {token}"))
                .header("x-csrf-token", &csrf)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Still present
    assert!(user::Entity::find_by_id(my_id)
        .one(&harness.db)
        .await
        .unwrap()
        .is_some());
}
