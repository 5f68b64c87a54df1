//! Live dashboard event stream
//!
//! One long-lived SSE response per client: `data: <json>` frames plus a
//! keepalive comment every 15 seconds. Authentication accepts the session
//! cookie, a bearer header, or `?token=` (EventSource cannot set headers).
//! Dropping the stream unregisters the subscriber from the broker.

use axum::{
    extract::{Query, Request, State},
    response::sse::{Event as SseEvent, KeepAlive, KeepAliveStream, Sse},
};
use futures::Stream;
use grok_events::{SseBroker, Subscriber, DEFAULT_CLIENT_BUFFER};
use serde::Deserialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::auth::{auth_user_from_claims, extract_token};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    /// Session token for EventSource clients
    pub token: Option<String>,
}

/// Subscriber stream that unregisters itself when the client goes away.
pub struct EventStream {
    rx: tokio::sync::mpsc::Receiver<grok_events::Event>,
    broker: SseBroker,
    id: Uuid,
}

impl Stream for EventStream {
    type Item = Result<SseEvent, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let sse = SseEvent::default()
                    .event(event.kind.clone())
                    .data(serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string()));
                Poll::Ready(Some(Ok(sse)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        debug!(client_id = %self.id, "SSE stream dropped, unregistering");
        self.broker.unregister_nowait(self.id);
    }
}

/// `GET /api/sse`
#[utoipa::path(
    get,
    path = "/api/sse",
    tag = "system",
    responses(
        (status = 200, description = "Event stream (text/event-stream)"),
        (status = 401, description = "Not authenticated"),
    )
)]
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SseQuery>,
    request: Request,
) -> Result<Sse<KeepAliveStream<EventStream>>, ApiError> {
    let token = extract_token(&request)
        .or(query.token)
        .ok_or(ApiError::Unauthorized)?;
    let claims = state
        .jwt
        .validator
        .validate(&token)
        .map_err(|_| ApiError::Unauthorized)?;
    let auth = auth_user_from_claims(&claims).map_err(|_| ApiError::Unauthorized)?;

    let Subscriber { id, rx } = state
        .broker
        .register(DEFAULT_CLIENT_BUFFER)
        .await
        .ok_or_else(|| ApiError::Internal("event broker is shut down".to_string()))?;

    debug!(client_id = %id, user_id = %auth.user_id, "SSE client connected");

    let stream = EventStream {
        rx,
        broker: state.broker.clone(),
        id,
    };
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
