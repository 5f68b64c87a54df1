//! Webhook fan-out router
//!
//! Hosts of the form `{app}-{org}-webhook.{base}` resolve to a webhook app.
//! The request body is read once, delivered concurrently to every enabled
//! route under a per-route deadline, and the public response is the
//! lowest-priority successful route (ties broken by lowest route id). One
//! WebhookEvent plus one WebhookTunnelResponse per attempted route is
//! persisted through the async log writer.

use crate::health::{route_health_after, HealthStatus};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use grok_db::writer::{LogWriterHandle, WebhookEventRecord, WebhookResponseRecord};
use grok_db::entities::{organization, tunnel, webhook_app, webhook_route};
use grok_events::{Event, EventBus};
use grok_proxy::body::ProxyBody;
use grok_proxy::headers::{from_wire_headers, to_wire_headers};
use grok_proxy::http::error_response;
use grok_proxy::{forward_once, ForwardError};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Hard cap on bodies the router will buffer for fan-out.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Router settings derived from configuration
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Deadline per route delivery
    pub per_route_timeout: Duration,
    /// Capture cap for stored request/response bodies
    pub max_capture_bytes: usize,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            per_route_timeout: Duration::from_secs(30),
            max_capture_bytes: 64 * 1024,
        }
    }
}

/// Fan-out router; plugs into the HTTP front-end as its webhook handler.
pub struct WebhookRouter {
    db: DatabaseConnection,
    registry: Arc<grok_registry::TunnelRegistry>,
    log: LogWriterHandle,
    events: EventBus,
    settings: WebhookSettings,
}

struct RouteOutcome {
    route: webhook_route::Model,
    tunnel_subdomain: String,
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    duration_ms: i64,
    error: Option<String>,
}

impl RouteOutcome {
    fn success(&self) -> bool {
        matches!(self.status, Some(s) if s < 500)
    }

    /// "subdomain: reason" fragment for aggregated error summaries.
    fn error_summary(&self) -> String {
        format!(
            "{}: {}",
            self.tunnel_subdomain,
            self.error
                .clone()
                .unwrap_or_else(|| format!("status {}", self.status.unwrap_or(0)))
        )
    }
}

impl WebhookRouter {
    pub fn new(
        db: DatabaseConnection,
        registry: Arc<grok_registry::TunnelRegistry>,
        log: LogWriterHandle,
        events: EventBus,
        settings: WebhookSettings,
    ) -> Self {
        Self {
            db,
            registry,
            log,
            events,
            settings,
        }
    }

    /// Resolve `{name}-{org_subdomain}` to an app, longest org match first.
    async fn resolve_app(
        &self,
        app_host: &str,
    ) -> Result<(organization::Model, webhook_app::Model), Response<ProxyBody>> {
        for (i, _) in app_host.match_indices('-') {
            let (name, org_subdomain) = (&app_host[..i], &app_host[i + 1..]);
            if name.is_empty() || org_subdomain.is_empty() {
                continue;
            }
            let Some(org) = organization::Entity::find()
                .filter(organization::Column::Subdomain.eq(org_subdomain))
                .one(&self.db)
                .await
                .map_err(internal)?
            else {
                continue;
            };
            if !org.is_active {
                return Err(error_response(StatusCode::SERVICE_UNAVAILABLE, "org_inactive"));
            }
            let Some(app) = webhook_app::Entity::find()
                .filter(webhook_app::Column::OrganizationId.eq(org.id))
                .filter(webhook_app::Column::Name.eq(name))
                .one(&self.db)
                .await
                .map_err(internal)?
            else {
                continue;
            };
            if !app.is_active {
                return Err(error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "webhook_inactive",
                ));
            }
            return Ok((org, app));
        }
        Err(error_response(StatusCode::NOT_FOUND, "webhook_not_found"))
    }

    async fn deliver(
        &self,
        route: webhook_route::Model,
        tunnel_subdomain: String,
        method: &str,
        uri: &str,
        headers: Vec<(String, String)>,
        body: Arc<Vec<u8>>,
    ) -> RouteOutcome {
        let started = Instant::now();

        let Some(handle) = self.registry.get(route.tunnel_id) else {
            return RouteOutcome {
                route,
                tunnel_subdomain,
                status: None,
                headers: Vec::new(),
                body: Vec::new(),
                duration_ms: started.elapsed().as_millis() as i64,
                error: Some("tunnel_disconnected".to_string()),
            };
        };

        let result = forward_once(
            &handle,
            method,
            uri,
            headers,
            &body,
            self.settings.per_route_timeout,
            MAX_BODY_BYTES,
        )
        .await;

        let duration_ms = started.elapsed().as_millis() as i64;
        match result {
            Ok(response) => RouteOutcome {
                route,
                tunnel_subdomain,
                status: Some(response.status),
                headers: response.headers,
                body: response.body,
                duration_ms,
                error: None,
            },
            Err(e) => {
                let code = match e {
                    ForwardError::TunnelDisconnected => "tunnel_disconnected",
                    ForwardError::ChannelWriteFailed => "channel_write_failed",
                    ForwardError::UpstreamTimeout => "upstream_timeout",
                };
                RouteOutcome {
                    route,
                    tunnel_subdomain,
                    status: None,
                    headers: Vec::new(),
                    body: Vec::new(),
                    duration_ms,
                    error: Some(code.to_string()),
                }
            }
        }
    }

    async fn update_route_health(&self, outcome: &RouteOutcome) {
        let current = HealthStatus::parse(&outcome.route.health_status);
        let (failures, status) =
            route_health_after(current, outcome.route.failure_count, outcome.success());

        let mut am: webhook_route::ActiveModel = outcome.route.clone().into();
        am.failure_count = Set(failures);
        am.health_status = Set(status.as_str().to_string());
        am.last_health_check = Set(Some(Utc::now()));
        if let Err(e) = am.update(&self.db).await {
            error!(route_id = %outcome.route.id, "Failed to update route health: {}", e);
        }
    }

    fn capture(&self, body: &[u8]) -> (Option<String>, bool) {
        if body.is_empty() {
            return (None, false);
        }
        let truncated = body.len() > self.settings.max_capture_bytes;
        let slice = &body[..body.len().min(self.settings.max_capture_bytes)];
        (Some(BASE64.encode(slice)), truncated)
    }

    /// Core fan-out, generic over the body so tests can use buffered bodies.
    pub async fn dispatch<B>(
        &self,
        app_host: &str,
        req: Request<B>,
        client_ip: IpAddr,
    ) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        let started = Instant::now();

        let (_org, app) = match self.resolve_app(app_host).await {
            Ok(pair) => pair,
            Err(response) => return response,
        };

        let method = req.method().as_str().to_string();
        let uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let path = req.uri().path().to_string();
        let wire_headers = to_wire_headers(req.headers());

        // Read the body once; every route gets the same buffered copy
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("Webhook body read failed: {}", e);
                return error_response(StatusCode::BAD_REQUEST, "body_read_failed");
            }
        };
        if body.len() > MAX_BODY_BYTES {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "body_too_large");
        }
        let body = Arc::new(body.to_vec());

        // Enabled, healthy routes only; "unknown" passes so a fresh route can
        // earn its first success
        let routes = match webhook_route::Entity::find()
            .filter(webhook_route::Column::WebhookAppId.eq(app.id))
            .filter(webhook_route::Column::IsEnabled.eq(true))
            .filter(webhook_route::Column::HealthStatus.ne(HealthStatus::Unhealthy.as_str()))
            .order_by_asc(webhook_route::Column::Priority)
            .order_by_asc(webhook_route::Column::Id)
            .all(&self.db)
            .await
        {
            Ok(routes) => routes,
            Err(e) => return internal(e),
        };

        let headers_json =
            serde_json::to_string(&wire_headers).unwrap_or_else(|_| "[]".to_string());

        if routes.is_empty() {
            self.persist_event(
                &app,
                &method,
                &path,
                client_ip,
                &body,
                &headers_json,
                StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                started.elapsed().as_millis() as i64,
                "failed",
                0,
                0,
                Some("no_routes".to_string()),
                Vec::new(),
                0,
            );
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "no_routes");
        }

        // Snapshot subdomains for rows whose tunnel is not live
        let tunnel_ids: Vec<Uuid> = routes.iter().map(|r| r.tunnel_id).collect();
        let subdomains: HashMap<Uuid, String> = tunnel::Entity::find()
            .filter(tunnel::Column::Id.is_in(tunnel_ids))
            .all(&self.db)
            .await
            .map(|rows| rows.into_iter().map(|t| (t.id, t.subdomain)).collect())
            .unwrap_or_default();

        // Concurrent delivery, individual deadlines, no interleaving constraints
        let deliveries = routes.into_iter().map(|route| {
            let subdomain = subdomains
                .get(&route.tunnel_id)
                .cloned()
                .unwrap_or_default();
            self.deliver(
                route,
                subdomain,
                &method,
                &uri,
                wire_headers.clone(),
                body.clone(),
            )
        });
        let outcomes: Vec<RouteOutcome> = futures::future::join_all(deliveries).await;

        for outcome in &outcomes {
            self.update_route_health(outcome).await;
        }

        let tunnel_count = outcomes.len() as u32;
        let success_count = outcomes.iter().filter(|o| o.success()).count() as u32;
        let routing_status = match success_count {
            0 => "failed",
            n if n == tunnel_count => "success",
            _ => "partial",
        };

        // Winner: lowest priority number, then lowest route id
        let winner = outcomes
            .iter()
            .filter(|o| o.success())
            .min_by(|a, b| {
                (a.route.priority, a.route.id).cmp(&(b.route.priority, b.route.id))
            });

        let (public_status, response) = match winner {
            Some(outcome) => {
                let status = StatusCode::from_u16(outcome.status.unwrap_or(200))
                    .unwrap_or(StatusCode::OK);
                let mut builder = Response::builder().status(status);
                if let Some(map) = builder.headers_mut() {
                    *map = from_wire_headers(&outcome.headers);
                }
                let response = builder
                    .body(grok_proxy::body::full(outcome.body.clone()))
                    .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal"));
                (status.as_u16(), response)
            }
            None => {
                let summary = outcomes
                    .iter()
                    .map(RouteOutcome::error_summary)
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(app = %app.name, "Webhook fan-out failed on all routes: {}", summary);

                // The public 502 carries the aggregated per-route summary
                let payload = serde_json::json!({
                    "error": "all_routes_failed",
                    "detail": summary,
                })
                .to_string();
                let response = Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(grok_proxy::body::full(payload))
                    .unwrap_or_else(|_| {
                        error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
                    });
                (StatusCode::BAD_GATEWAY.as_u16(), response)
            }
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        let bytes_out = outcomes
            .iter()
            .filter(|o| o.success())
            .map(|o| o.body.len() as i64)
            .max()
            .unwrap_or(0);

        let error_message = if success_count == tunnel_count {
            None
        } else {
            Some(
                outcomes
                    .iter()
                    .filter(|o| !o.success())
                    .map(RouteOutcome::error_summary)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };

        let responses: Vec<WebhookResponseRecord> = outcomes
            .iter()
            .map(|o| {
                let (body_b64, _) = self.capture(&o.body);
                WebhookResponseRecord {
                    tunnel_id: o.route.tunnel_id,
                    tunnel_subdomain: o.tunnel_subdomain.clone(),
                    status_code: o.status,
                    duration_ms: o.duration_ms,
                    success: o.success(),
                    error_message: o.error.clone(),
                    headers_json: serde_json::to_string(&o.headers)
                        .unwrap_or_else(|_| "[]".to_string()),
                    body_b64,
                }
            })
            .collect();

        self.persist_event(
            &app,
            &method,
            &path,
            client_ip,
            &body,
            &headers_json,
            public_status,
            duration_ms,
            routing_status,
            tunnel_count,
            success_count,
            error_message,
            responses,
            bytes_out,
        );

        info!(
            app = %app.name,
            routing_status,
            tunnel_count,
            success_count,
            status = public_status,
            "Webhook delivered"
        );
        self.events.publish(Event::webhook_event(
            app.id,
            routing_status,
            tunnel_count,
            success_count,
            public_status,
        ));

        response
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_event(
        &self,
        app: &webhook_app::Model,
        method: &str,
        path: &str,
        client_ip: IpAddr,
        body: &[u8],
        headers_json: &str,
        status_code: u16,
        duration_ms: i64,
        routing_status: &str,
        tunnel_count: u32,
        success_count: u32,
        error_message: Option<String>,
        responses: Vec<WebhookResponseRecord>,
        bytes_out: i64,
    ) {
        let (request_body_b64, body_truncated) = self.capture(body);
        self.log.log_webhook(WebhookEventRecord {
            webhook_app_id: app.id,
            request_path: path.to_string(),
            method: method.to_string(),
            status_code,
            duration_ms,
            bytes_in: body.len() as i64,
            bytes_out,
            client_ip: client_ip.to_string(),
            routing_status: routing_status.to_string(),
            tunnel_count,
            success_count,
            error_message,
            request_headers_json: headers_json.to_string(),
            request_body_b64,
            body_truncated,
            responses,
        });
    }
}

#[async_trait]
impl grok_proxy::WebhookHandler for WebhookRouter {
    async fn handle(
        &self,
        app_host: &str,
        req: Request<Incoming>,
        client_ip: IpAddr,
    ) -> Response<ProxyBody> {
        self.dispatch(app_host, req, client_ip).await
    }
}

fn internal<E: std::fmt::Display>(e: E) -> Response<ProxyBody> {
    error!("Webhook router internal error: {}", e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
}
