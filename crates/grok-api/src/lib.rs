//! Admin/control REST API
//!
//! Axum router with the middleware chain
//! Logging ∘ SecurityHeaders ∘ CORS ∘ RateLimit ∘ CSRF ∘ Auth ∘ handlers,
//! the SSE dashboard stream, OpenAPI docs, and the embedded dashboard
//! bundle as the fallback.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    body::Body,
    http::{header, HeaderValue, Method, Response, StatusCode},
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use grok_control::TunnelService;
use grok_db::writer::LogWriterHandle;
use grok_events::{EventBus, SseBroker};
use rust_embed::RustEmbed;
use sea_orm::DatabaseConnection;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use middleware::{CsrfStore, JwtState, RateLimiter};

#[derive(RustEmbed)]
#[folder = "dashboard/dist"]
struct DashboardAssets;

/// Application state shared across handlers
pub struct AppState {
    pub db: DatabaseConnection,
    pub service: Arc<TunnelService>,
    pub broker: SseBroker,
    pub events: EventBus,
    pub log: LogWriterHandle,
    pub jwt: JwtState,
    pub csrf: CsrfStore,
    pub limiter: RateLimiter,
    /// Base public domain, used to compose webhook hosts
    pub domain: String,
    /// Origins allowed to make credentialed dashboard requests
    pub cors_origins: Vec<String>,
    /// Secure flag on session cookies
    pub is_https: bool,
    pub started_at: Instant,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "grok API",
        version = "0.1.0",
        description = "REST API for the grok reverse-tunnel relay",
    ),
    paths(
        handlers::auth::login,
        handlers::auth::verify_2fa,
        handlers::auth::logout,
        handlers::auth::me,
        handlers::tokens::list_tokens,
        handlers::tokens::create_token,
        handlers::tokens::delete_token,
        handlers::tunnels::list_tunnels,
        handlers::tunnels::get_tunnel,
        handlers::tunnels::delete_tunnel,
        handlers::tunnels::list_requests,
        handlers::orgs::list_organizations,
        handlers::orgs::create_organization,
        handlers::orgs::update_organization,
        handlers::orgs::list_users,
        handlers::orgs::create_user,
        handlers::orgs::delete_user,
        handlers::orgs::list_domains,
        handlers::orgs::create_domain,
        handlers::orgs::delete_domain,
        handlers::webhooks::list_apps,
        handlers::webhooks::create_app,
        handlers::webhooks::delete_app,
        handlers::webhooks::list_routes,
        handlers::webhooks::create_route,
        handlers::webhooks::delete_route,
        handlers::webhooks::list_events,
        handlers::system::health,
        handlers::system::stats,
        handlers::sse::stream,
    ),
    components(schemas(
        models::ErrorResponse,
        models::LoginRequest,
        models::LoginResponse,
        models::TwoFactorRequest,
        models::UserInfo,
        models::CreateUserRequest,
        models::CreateOrganizationRequest,
        models::UpdateOrganizationRequest,
        models::OrganizationInfo,
        models::CreateTokenRequest,
        models::CreateTokenResponse,
        models::TokenInfo,
        models::TunnelInfo,
        models::CreateDomainRequest,
        models::DomainInfo,
        models::CreateWebhookAppRequest,
        models::WebhookAppInfo,
        models::CreateWebhookRouteRequest,
        models::WebhookRouteInfo,
        models::RequestLogInfo,
        models::PoolStatsInfo,
        models::StatsResponse,
        models::HealthResponse,
    )),
    tags(
        (name = "auth", description = "Authentication"),
        (name = "tokens", description = "Client token management"),
        (name = "tunnels", description = "Tunnel management"),
        (name = "traffic", description = "Traffic inspection"),
        (name = "organizations", description = "Organization management"),
        (name = "users", description = "User management"),
        (name = "domains", description = "Subdomain reservations"),
        (name = "webhooks", description = "Webhook fan-out management"),
        (name = "system", description = "Health, stats, and events"),
    )
)]
struct ApiDoc;

/// Build the full admin router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let jwt_state = Arc::new(state.jwt.clone());

    // Login (both steps) gets the rate limit; no session exists yet so no CSRF
    let login_router = Router::new()
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/2fa", post(handlers::auth::verify_2fa))
        .route_layer(axum_middleware::from_fn_with_state(
            state.limiter.clone(),
            middleware::rate_limit::limit_logins,
        ))
        .with_state(state.clone());

    let public_router = Router::new()
        .route("/api/health", get(handlers::system::health))
        .with_state(state.clone());

    // SSE authenticates inside the handler (cookie, bearer, or ?token=)
    let sse_router = Router::new()
        .route("/api/sse", get(handlers::sse::stream))
        .with_state(state.clone());

    let protected_router = Router::new()
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/auth/me", get(handlers::auth::me))
        .route(
            "/api/tokens",
            get(handlers::tokens::list_tokens).post(handlers::tokens::create_token),
        )
        .route(
            "/api/tokens/{id}",
            axum::routing::delete(handlers::tokens::delete_token),
        )
        .route("/api/tunnels", get(handlers::tunnels::list_tunnels))
        .route(
            "/api/tunnels/{id}",
            get(handlers::tunnels::get_tunnel).delete(handlers::tunnels::delete_tunnel),
        )
        .route("/api/requests", get(handlers::tunnels::list_requests))
        .route(
            "/api/organizations",
            get(handlers::orgs::list_organizations).post(handlers::orgs::create_organization),
        )
        .route(
            "/api/organizations/{id}",
            axum::routing::patch(handlers::orgs::update_organization),
        )
        .route(
            "/api/users",
            get(handlers::orgs::list_users).post(handlers::orgs::create_user),
        )
        .route(
            "/api/users/{id}",
            axum::routing::delete(handlers::orgs::delete_user),
        )
        .route(
            "/api/domains",
            get(handlers::orgs::list_domains).post(handlers::orgs::create_domain),
        )
        .route(
            "/api/domains/{id}",
            axum::routing::delete(handlers::orgs::delete_domain),
        )
        .route(
            "/api/webhooks/apps",
            get(handlers::webhooks::list_apps).post(handlers::webhooks::create_app),
        )
        .route(
            "/api/webhooks/apps/{id}",
            axum::routing::delete(handlers::webhooks::delete_app),
        )
        .route(
            "/api/webhooks/apps/{id}/routes",
            get(handlers::webhooks::list_routes).post(handlers::webhooks::create_route),
        )
        .route(
            "/api/webhooks/routes/{id}",
            axum::routing::delete(handlers::webhooks::delete_route),
        )
        .route(
            "/api/webhooks/apps/{id}/events",
            get(handlers::webhooks::list_events),
        )
        .route("/api/stats", get(handlers::system::stats))
        .with_state(state.clone())
        // CSRF wraps auth so mutations are checked before handlers run
        .layer(axum_middleware::from_fn_with_state(
            jwt_state.clone(),
            middleware::require_auth,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.csrf.clone(),
            middleware::require_csrf,
        ));

    let api_router = login_router
        .merge(public_router)
        .merge(sse_router)
        .merge(protected_router);

    let mut router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
        .fallback(serve_dashboard);

    // CORS is restricted to the configured origins; cookies require
    // credentialed requests, so a wildcard is never used.
    router = router.layer(cors_layer(state.allowed_origins()));
    router = router.layer(axum_middleware::from_fn(middleware::security_headers));
    router = router.layer(TraceLayer::new_for_http());

    router
}

impl AppState {
    fn allowed_origins(&self) -> Vec<HeaderValue> {
        self.cors_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect()
    }
}

fn cors_layer(origins: Vec<HeaderValue>) -> CorsLayer {
    let mut cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::COOKIE,
            header::HeaderName::from_static("x-csrf-token"),
        ])
        .allow_credentials(true);
    if !origins.is_empty() {
        cors = cors.allow_origin(origins);
    }
    cors
}

/// Run the admin API listener.
pub async fn serve(state: Arc<AppState>, bind_addr: SocketAddr) -> std::io::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Admin API on http://{}", bind_addr);
    info!("OpenAPI spec at http://{}/api/openapi.json", bind_addr);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

/// Serve the embedded dashboard bundle with an SPA fallback.
async fn serve_dashboard(req: axum::extract::Request) -> impl IntoResponse {
    let path = req.uri().path().trim_start_matches('/');

    if let Some(content) = DashboardAssets::get(path) {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let mut response = Response::new(Body::from(content.data.to_vec()));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(mime.as_ref())
                .unwrap_or(HeaderValue::from_static("application/octet-stream")),
        );
        return response;
    }

    if !path.starts_with("api") && !path.starts_with("swagger-ui") {
        if let Some(content) = DashboardAssets::get("index.html") {
            let mut response = Response::new(Body::from(content.data.to_vec()));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
            return response;
        }
    }

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("Not Found"))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
