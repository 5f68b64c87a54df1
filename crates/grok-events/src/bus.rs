//! Event bus
//!
//! A single bounded queue between producers (registry, proxy, webhook router)
//! and the SSE broker, its sole consumer. Producers never block: a full
//! buffer drops the event and bumps a counter.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Bus buffer size
pub const BUS_CAPACITY: usize = 1024;

/// A timestamped message published by the registry or webhook router
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn tunnel_registered(
        tunnel_id: Uuid,
        tunnel_type: &str,
        subdomain: &str,
        remote_port: Option<u16>,
    ) -> Self {
        Self::new(
            "tunnel.registered",
            json!({
                "tunnel_id": tunnel_id,
                "tunnel_type": tunnel_type,
                "subdomain": subdomain,
                "remote_port": remote_port,
            }),
        )
    }

    pub fn tunnel_disconnected(tunnel_id: Uuid, status: &str) -> Self {
        Self::new(
            "tunnel.disconnected",
            json!({
                "tunnel_id": tunnel_id,
                "status": status,
            }),
        )
    }

    pub fn request_completed(
        tunnel_id: Uuid,
        method: &str,
        path: &str,
        status: u16,
        duration_ms: i64,
        bytes_in: i64,
        bytes_out: i64,
    ) -> Self {
        Self::new(
            "request.completed",
            json!({
                "tunnel_id": tunnel_id,
                "method": method,
                "path": path,
                "status": status,
                "duration_ms": duration_ms,
                "bytes_in": bytes_in,
                "bytes_out": bytes_out,
            }),
        )
    }

    pub fn webhook_event(
        webhook_app_id: Uuid,
        routing_status: &str,
        tunnel_count: u32,
        success_count: u32,
        status: u16,
    ) -> Self {
        Self::new(
            "webhook.event",
            json!({
                "webhook_app_id": webhook_app_id,
                "routing_status": routing_status,
                "tunnel_count": tunnel_count,
                "success_count": success_count,
                "status": status,
            }),
        )
    }
}

/// Producer half of the bus; cheap to clone
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create the bus; the receiver goes to the broker.
    pub fn new() -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Publish without blocking; drops with a counter when the bus is full
    /// or the broker is gone.
    pub fn publish(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total % 100 == 1 {
                warn!(total, "Event bus full or closed, dropping events");
            }
        }
    }

    /// Total events dropped at the bus since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
