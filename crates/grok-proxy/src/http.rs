//! HTTP reverse-proxy front-end
//!
//! Resolves a request's host to a live tunnel and streams the exchange
//! through the client channel: request body out as delimited frames,
//! response head awaited under the request deadline, response body streamed
//! back frame-at-a-time. Every completed exchange enqueues a RequestLog
//! record and publishes `request.completed`.

use crate::body::{self, ProxyBody};
use crate::forward::frame_chunks;
use crate::headers::{add_forwarding_headers, from_wire_headers, to_wire_headers};
use crate::host::{classify, HostTarget};
use async_trait::async_trait;
use bytes::Bytes;
use grok_db::entities::{organization, tunnel};
use grok_db::writer::{LogWriterHandle, RequestLogRecord};
use grok_events::{Event, EventBus};
use grok_proto::{ControlMessage, TunnelStatus};
use grok_registry::{ChannelError, ResponseChunk, TunnelHandle, TunnelRegistry};
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Front-end settings derived from configuration
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Base public domain
    pub domain: String,
    /// Deadline for one proxied exchange up to the response head
    pub request_timeout: Duration,
}

/// Hook for `-webhook` hosts, implemented by the fan-out router.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(
        &self,
        app_host: &str,
        req: Request<Incoming>,
        client_ip: IpAddr,
    ) -> Response<ProxyBody>;
}

/// HTTP(S) proxy front-end
pub struct HttpFrontend {
    registry: Arc<TunnelRegistry>,
    db: DatabaseConnection,
    settings: ProxySettings,
    log: LogWriterHandle,
    events: EventBus,
    webhook: Option<Arc<dyn WebhookHandler>>,
}

impl HttpFrontend {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        db: DatabaseConnection,
        settings: ProxySettings,
        log: LogWriterHandle,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            db,
            settings,
            log,
            events,
            webhook: None,
        }
    }

    pub fn with_webhook_handler(mut self, handler: Arc<dyn WebhookHandler>) -> Self {
        self.webhook = Some(handler);
        self
    }

    /// Accept loop for a plaintext listener.
    pub async fn serve(self: Arc<Self>, bind_addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!("HTTP proxy listening on {}", bind_addr);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Proxy accept failed: {}", e);
                    continue;
                }
            };
            let frontend = self.clone();
            tokio::spawn(async move {
                frontend.serve_connection(stream, peer_addr, "http").await;
            });
        }
    }

    /// Accept loop for the TLS listener; the acceptor terminates TLS first.
    pub async fn serve_tls(
        self: Arc<Self>,
        bind_addr: SocketAddr,
        tls: tokio_rustls::TlsAcceptor,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!("HTTPS proxy listening on {}", bind_addr);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Proxy accept failed: {}", e);
                    continue;
                }
            };
            let frontend = self.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls.accept(stream).await {
                    Ok(stream) => {
                        frontend.serve_tls_connection(stream, peer_addr).await;
                    }
                    Err(e) => {
                        debug!("TLS handshake with {} failed: {}", peer_addr, e);
                    }
                }
            });
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
        scheme: &'static str,
    ) {
        let io = TokioIo::new(stream);
        let frontend = self.clone();
        let service = service_fn(move |req| {
            let frontend = frontend.clone();
            async move {
                Ok::<_, Infallible>(frontend.handle_request(req, peer_addr.ip(), scheme).await)
            }
        });

        if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
        {
            debug!("Connection from {} ended: {}", peer_addr, e);
        }
    }

    async fn serve_tls_connection(
        self: Arc<Self>,
        stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
        peer_addr: SocketAddr,
    ) {
        let io = TokioIo::new(stream);
        let frontend = self.clone();
        let service = service_fn(move |req| {
            let frontend = frontend.clone();
            async move {
                Ok::<_, Infallible>(frontend.handle_request(req, peer_addr.ip(), "https").await)
            }
        });

        if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
        {
            debug!("TLS connection from {} ended: {}", peer_addr, e);
        }
    }

    /// Route one public request.
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        client_ip: IpAddr,
        scheme: &'static str,
    ) -> Response<ProxyBody> {
        let Some(host) = request_host(&req) else {
            return error_response(StatusCode::BAD_REQUEST, "missing_host");
        };

        match classify(&host, &self.settings.domain) {
            HostTarget::Webhook(app_host) => match &self.webhook {
                Some(handler) => handler.handle(&app_host, req, client_ip).await,
                None => error_response(StatusCode::NOT_FOUND, "webhook_not_found"),
            },
            HostTarget::Tunnel(subdomain) => {
                self.proxy_to_tunnel(&subdomain, req, client_ip, &host, scheme)
                    .await
            }
            HostTarget::Unrecognized => error_response(StatusCode::NOT_FOUND, "tunnel_not_found"),
        }
    }

    async fn proxy_to_tunnel(
        &self,
        subdomain: &str,
        req: Request<Incoming>,
        client_ip: IpAddr,
        host: &str,
        scheme: &'static str,
    ) -> Response<ProxyBody> {
        let Some(handle) = self.registry.find_by_subdomain(subdomain) else {
            return self.miss_response(subdomain).await;
        };

        let started = Instant::now();
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();
        let uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut wire_headers = to_wire_headers(req.headers());
        add_forwarding_headers(&mut wire_headers, &client_ip.to_string(), scheme, host);

        let request_id = Uuid::new_v4();
        let rx = match handle.start_request(request_id, method.clone(), uri, wire_headers) {
            Ok(rx) => rx,
            Err(e) => {
                let (status, code) = channel_error_response(&e);
                self.finish(
                    &handle,
                    &method,
                    &path,
                    status.as_u16(),
                    started,
                    0,
                    0,
                    client_ip,
                );
                return error_response(status, code);
            }
        };

        // Drop guard: if the public client goes away mid-exchange, release
        // the correlation slot and tell the client to stop.
        let mut guard = CancelGuard {
            handle: handle.clone(),
            request_id,
            armed: true,
        };

        let exchange = tokio::time::timeout(
            self.settings.request_timeout,
            self.send_and_await_head(&handle, request_id, req, rx),
        )
        .await;

        let (head, bytes_in, mut rx) = match exchange {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                guard.armed = false;
                handle.cancel_request(request_id);
                let (status, code) = forward_error_response(&e);
                self.finish(
                    &handle,
                    &method,
                    &path,
                    status.as_u16(),
                    started,
                    0,
                    0,
                    client_ip,
                );
                return error_response(status, code);
            }
            Err(_) => {
                guard.armed = false;
                handle.cancel_request(request_id);
                warn!(tunnel_id = %handle.meta.id, path = %path, "Upstream timeout");
                self.finish(
                    &handle,
                    &method,
                    &path,
                    StatusCode::GATEWAY_TIMEOUT.as_u16(),
                    started,
                    0,
                    0,
                    client_ip,
                );
                return error_response(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout");
            }
        };
        guard.armed = false;

        let (status, headers) = head;
        let status_code =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Stream the response body back without materializing it
        let (body_tx, proxy_body) = body::channel(64);
        let pump_handle = handle.clone();
        let log = self.log.clone();
        let events = self.events.clone();
        let pump_method = method.clone();
        let pump_path = path.clone();
        let client_ip_str = client_ip.to_string();
        tokio::spawn(async move {
            let mut bytes_out: i64 = 0;
            let mut logged_status = status;
            loop {
                match rx.recv().await {
                    Some(ResponseChunk::Body { data, is_final }) => {
                        bytes_out += data.len() as i64;
                        pump_handle
                            .counters
                            .bytes_out
                            .fetch_add(data.len() as u64, Ordering::Relaxed);
                        if !data.is_empty()
                            && body_tx.send(Ok(Bytes::from(data))).await.is_err()
                        {
                            // Public client went away; stop the upstream too
                            pump_handle.cancel_request(request_id);
                            break;
                        }
                        if is_final {
                            break;
                        }
                    }
                    Some(ResponseChunk::Head { .. }) => continue,
                    None => {
                        // Tunnel died mid-body; surface a stream error and
                        // record the exchange as a disconnect, not as the
                        // head status that never finished
                        let _ = body_tx
                            .send(Err(std::io::Error::other("tunnel disconnected")))
                            .await;
                        logged_status = StatusCode::BAD_GATEWAY.as_u16();
                        break;
                    }
                }
            }

            let duration_ms = started.elapsed().as_millis() as i64;
            pump_handle.counters.requests.fetch_add(1, Ordering::Relaxed);
            log.log_request(RequestLogRecord {
                tunnel_id: pump_handle.meta.id,
                method: pump_method.clone(),
                path: pump_path.clone(),
                status_code: logged_status,
                duration_ms,
                bytes_in,
                bytes_out,
                client_ip: client_ip_str,
            });
            events.publish(Event::request_completed(
                pump_handle.meta.id,
                &pump_method,
                &pump_path,
                logged_status,
                duration_ms,
                bytes_in,
                bytes_out,
            ));
        });

        let mut response = Response::builder().status(status_code);
        if let Some(map) = response.headers_mut() {
            *map = from_wire_headers(&headers);
        }
        response.body(proxy_body).unwrap_or_else(|e| {
            error!("Failed to build proxied response: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        })
    }

    /// Pump the request body upstream, then wait for the response head.
    async fn send_and_await_head(
        &self,
        handle: &Arc<TunnelHandle>,
        request_id: Uuid,
        req: Request<Incoming>,
        mut rx: tokio::sync::mpsc::Receiver<ResponseChunk>,
    ) -> Result<
        (
            (u16, Vec<(String, String)>),
            i64,
            tokio::sync::mpsc::Receiver<ResponseChunk>,
        ),
        crate::forward::ForwardError,
    > {
        use crate::forward::ForwardError;

        let map_err = |e: ChannelError| match e {
            ChannelError::BackpressureDropped => ForwardError::ChannelWriteFailed,
            ChannelError::TunnelDisconnected => ForwardError::TunnelDisconnected,
        };

        let mut bytes_in: i64 = 0;
        let mut body = req.into_body();
        while let Some(next) = body.frame().await {
            // A failed read means the public client aborted the upload
            let Ok(frame) = next else { break };
            if let Ok(data) = frame.into_data() {
                bytes_in += data.len() as i64;
                handle
                    .counters
                    .bytes_in
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                for chunk in frame_chunks(&data) {
                    handle
                        .send(ControlMessage::HttpRequestBody {
                            request_id,
                            data: chunk.to_vec(),
                            is_final: false,
                        })
                        .map_err(map_err)?;
                }
            }
        }
        handle
            .send(ControlMessage::HttpRequestBody {
                request_id,
                data: Vec::new(),
                is_final: true,
            })
            .map_err(map_err)?;

        match rx.recv().await {
            Some(ResponseChunk::Head { status, headers }) => {
                Ok(((status, headers), bytes_in, rx))
            }
            Some(ResponseChunk::Body { .. }) | None => Err(ForwardError::TunnelDisconnected),
        }
    }

    /// No live channel: distinguish an offline persistent tunnel (503) from
    /// an unknown host (404), and inactive organizations (503).
    async fn miss_response(&self, subdomain: &str) -> Response<ProxyBody> {
        let row = tunnel::Entity::find()
            .filter(tunnel::Column::Subdomain.eq(subdomain))
            .filter(tunnel::Column::Status.ne(TunnelStatus::Disconnected.as_str()))
            .one(&self.db)
            .await;

        match row {
            Ok(Some(row)) => {
                if let Some(org_id) = row.organization_id {
                    let org = organization::Entity::find_by_id(org_id).one(&self.db).await;
                    if let Ok(Some(org)) = org {
                        if !org.is_active {
                            return error_response(StatusCode::SERVICE_UNAVAILABLE, "org_inactive");
                        }
                    }
                }
                error_response(StatusCode::SERVICE_UNAVAILABLE, "tunnel_inactive")
            }
            Ok(None) => error_response(StatusCode::NOT_FOUND, "tunnel_not_found"),
            Err(e) => {
                error!("Tunnel miss lookup failed: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }

    /// Record an error outcome for a request that reached a live tunnel.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        handle: &Arc<TunnelHandle>,
        method: &str,
        path: &str,
        status: u16,
        started: Instant,
        bytes_in: i64,
        bytes_out: i64,
        client_ip: IpAddr,
    ) {
        let duration_ms = started.elapsed().as_millis() as i64;
        handle.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.log.log_request(RequestLogRecord {
            tunnel_id: handle.meta.id,
            method: method.to_string(),
            path: path.to_string(),
            status_code: status,
            duration_ms,
            bytes_in,
            bytes_out,
            client_ip: client_ip.to_string(),
        });
        self.events.publish(Event::request_completed(
            handle.meta.id,
            method,
            path,
            status,
            duration_ms,
            bytes_in,
            bytes_out,
        ));
    }
}

struct CancelGuard {
    handle: Arc<TunnelHandle>,
    request_id: Uuid,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.handle.cancel_request(self.request_id);
        }
    }
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }
    req.headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn channel_error_response(e: &ChannelError) -> (StatusCode, &'static str) {
    match e {
        // Backpressure is not surfaced to the public client directly
        ChannelError::BackpressureDropped => (StatusCode::BAD_GATEWAY, "channel_write_failed"),
        ChannelError::TunnelDisconnected => (StatusCode::BAD_GATEWAY, "tunnel_disconnected"),
    }
}

fn forward_error_response(e: &crate::forward::ForwardError) -> (StatusCode, &'static str) {
    use crate::forward::ForwardError;
    match e {
        ForwardError::TunnelDisconnected => (StatusCode::BAD_GATEWAY, "tunnel_disconnected"),
        ForwardError::ChannelWriteFailed => (StatusCode::BAD_GATEWAY, "channel_write_failed"),
        ForwardError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
    }
}

/// Structured JSON error body, e.g. `{"error":"tunnel_disconnected"}`.
pub fn error_response(status: StatusCode, code: &str) -> Response<ProxyBody> {
    let payload = serde_json::json!({ "error": code }).to_string();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body::full(payload))
        .expect("static error response")
}
