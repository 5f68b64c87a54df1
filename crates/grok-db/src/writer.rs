//! Asynchronous log writer
//!
//! Keeps DB latency off the proxy hot path: callers enqueue records without
//! blocking, a single task batches inserts (size or interval, whichever
//! first) and trims webhook retention after each batch. Overflow drops the
//! oldest pending record and bumps a counter; the caller never fails.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::entities::{request_log, webhook_event, webhook_tunnel_response};

const BATCH_SIZE: usize = 64;
const FLUSH_INTERVAL_MS: u64 = 1000;
const PENDING_CAP: usize = 4096;

/// One proxied HTTP request
#[derive(Debug, Clone)]
pub struct RequestLogRecord {
    pub tunnel_id: Uuid,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub duration_ms: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub client_ip: String,
}

/// Per-route outcome attached to a webhook event
#[derive(Debug, Clone)]
pub struct WebhookResponseRecord {
    pub tunnel_id: Uuid,
    pub tunnel_subdomain: String,
    pub status_code: Option<u16>,
    pub duration_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
    pub headers_json: String,
    pub body_b64: Option<String>,
}

/// One webhook fan-out delivery with its per-route outcomes
#[derive(Debug, Clone)]
pub struct WebhookEventRecord {
    pub webhook_app_id: Uuid,
    pub request_path: String,
    pub method: String,
    pub status_code: u16,
    pub duration_ms: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub client_ip: String,
    pub routing_status: String,
    pub tunnel_count: u32,
    pub success_count: u32,
    pub error_message: Option<String>,
    pub request_headers_json: String,
    pub request_body_b64: Option<String>,
    pub body_truncated: bool,
    pub responses: Vec<WebhookResponseRecord>,
}

#[derive(Debug)]
enum Record {
    Request(RequestLogRecord),
    Webhook(Box<WebhookEventRecord>),
    /// Flush everything still queued and stop the task
    Shutdown,
}

/// Cheap cloneable handle used by the proxy and webhook paths.
#[derive(Clone)]
pub struct LogWriterHandle {
    tx: mpsc::Sender<Record>,
    dropped: Arc<AtomicU64>,
}

impl LogWriterHandle {
    /// Enqueue a request log; drops (with a counter) instead of blocking.
    pub fn log_request(&self, record: RequestLogRecord) {
        if self.tx.try_send(Record::Request(record)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Request log queue full, dropping record");
        }
    }

    /// Enqueue a webhook event with its per-route responses.
    pub fn log_webhook(&self, record: WebhookEventRecord) {
        if self.tx.try_send(Record::Webhook(Box::new(record))).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Webhook log queue full, dropping record");
        }
    }

    /// Total records dropped on overflow since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Owns the writer task; dropping the handle without `shutdown` leaves
/// queued records unflushed.
pub struct LogWriter {
    handle: LogWriterHandle,
    task: JoinHandle<()>,
}

impl LogWriter {
    /// Spawn the writer task.
    ///
    /// `max_events` is the per-app webhook retention cap; 0 disables trimming.
    pub fn spawn(db: DatabaseConnection, max_events: u64) -> Self {
        let (tx, rx) = mpsc::channel(PENDING_CAP);
        let dropped = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_writer(db, rx, max_events, dropped.clone()));

        Self {
            handle: LogWriterHandle { tx, dropped },
            task,
        }
    }

    pub fn handle(&self) -> LogWriterHandle {
        self.handle.clone()
    }

    /// Flush remaining records and stop the task.
    ///
    /// Works even while other handle clones are still alive; their
    /// subsequent sends are counted as drops.
    pub async fn shutdown(self) {
        let LogWriter { handle, task } = self;
        let _ = handle.tx.send(Record::Shutdown).await;
        drop(handle);
        if let Err(e) = task.await {
            error!("Log writer task failed during shutdown: {}", e);
        }
    }
}

async fn run_writer(
    db: DatabaseConnection,
    mut rx: mpsc::Receiver<Record>,
    max_events: u64,
    dropped: Arc<AtomicU64>,
) {
    let mut pending: VecDeque<Record> = VecDeque::new();
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(FLUSH_INTERVAL_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(Record::Shutdown) | None => break,
                    Some(record) => {
                        if pending.len() >= PENDING_CAP {
                            pending.pop_front();
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        pending.push_back(record);
                        if pending.len() >= BATCH_SIZE {
                            flush(&db, &mut pending, max_events).await;
                        }
                    }
                }
            }
            _ = interval.tick() => {
                if !pending.is_empty() {
                    flush(&db, &mut pending, max_events).await;
                }
            }
        }
    }

    // Final flush on shutdown
    while let Ok(record) = rx.try_recv() {
        if !matches!(record, Record::Shutdown) {
            pending.push_back(record);
        }
    }
    if !pending.is_empty() {
        flush(&db, &mut pending, max_events).await;
    }
    debug!("Log writer stopped");
}

async fn flush(db: &DatabaseConnection, pending: &mut VecDeque<Record>, max_events: u64) {
    let mut request_models = Vec::new();
    let mut touched_apps: HashSet<Uuid> = HashSet::new();
    let now = Utc::now();

    for record in pending.drain(..) {
        match record {
            Record::Request(r) => {
                request_models.push(request_log::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    tunnel_id: Set(r.tunnel_id),
                    method: Set(r.method),
                    path: Set(r.path),
                    status_code: Set(r.status_code as i32),
                    duration_ms: Set(r.duration_ms),
                    bytes_in: Set(r.bytes_in),
                    bytes_out: Set(r.bytes_out),
                    client_ip: Set(r.client_ip),
                    created_at: Set(now),
                });
            }
            Record::Webhook(event) => {
                touched_apps.insert(event.webhook_app_id);
                if let Err(e) = insert_webhook_event(db, *event, now).await {
                    error!("Failed to persist webhook event: {}", e);
                }
            }
            Record::Shutdown => {}
        }
    }

    if !request_models.is_empty() {
        let count = request_models.len();
        if let Err(e) = request_log::Entity::insert_many(request_models).exec(db).await {
            error!("Failed to persist {} request logs: {}", count, e);
        } else {
            debug!("Flushed {} request logs", count);
        }
    }

    if max_events > 0 {
        for app_id in touched_apps {
            if let Err(e) = trim_webhook_events(db, app_id, max_events).await {
                error!(app_id = %app_id, "Webhook retention trim failed: {}", e);
            }
        }
    }
}

async fn insert_webhook_event(
    db: &DatabaseConnection,
    event: WebhookEventRecord,
    now: chrono::DateTime<Utc>,
) -> Result<(), sea_orm::DbErr> {
    let event_id = Uuid::new_v4();

    webhook_event::ActiveModel {
        id: Set(event_id),
        webhook_app_id: Set(event.webhook_app_id),
        request_path: Set(event.request_path),
        method: Set(event.method),
        status_code: Set(event.status_code as i32),
        duration_ms: Set(event.duration_ms),
        bytes_in: Set(event.bytes_in),
        bytes_out: Set(event.bytes_out),
        client_ip: Set(event.client_ip),
        routing_status: Set(event.routing_status),
        tunnel_count: Set(event.tunnel_count as i32),
        success_count: Set(event.success_count as i32),
        error_message: Set(event.error_message),
        request_headers: Set(event.request_headers_json),
        request_body: Set(event.request_body_b64),
        body_truncated: Set(event.body_truncated),
        created_at: Set(now),
    }
    .insert(db)
    .await?;

    if !event.responses.is_empty() {
        let models: Vec<webhook_tunnel_response::ActiveModel> = event
            .responses
            .into_iter()
            .map(|r| webhook_tunnel_response::ActiveModel {
                id: Set(Uuid::new_v4()),
                webhook_event_id: Set(event_id),
                tunnel_id: Set(r.tunnel_id),
                tunnel_subdomain: Set(r.tunnel_subdomain),
                status_code: Set(r.status_code.map(|s| s as i32)),
                duration_ms: Set(r.duration_ms),
                success: Set(r.success),
                error_message: Set(r.error_message),
                headers: Set(r.headers_json),
                body: Set(r.body_b64),
                created_at: Set(now),
            })
            .collect();
        webhook_tunnel_response::Entity::insert_many(models)
            .exec(db)
            .await?;
    }

    Ok(())
}

/// Delete the oldest events above the retention cap (cascades to responses).
async fn trim_webhook_events(
    db: &DatabaseConnection,
    app_id: Uuid,
    max_events: u64,
) -> Result<(), sea_orm::DbErr> {
    let count = webhook_event::Entity::find()
        .filter(webhook_event::Column::WebhookAppId.eq(app_id))
        .count(db)
        .await?;

    if count <= max_events {
        return Ok(());
    }

    let excess = count - max_events;
    let victims: Vec<Uuid> = webhook_event::Entity::find()
        .filter(webhook_event::Column::WebhookAppId.eq(app_id))
        .order_by_asc(webhook_event::Column::CreatedAt)
        .limit(excess)
        .all(db)
        .await?
        .into_iter()
        .map(|m| m.id)
        .collect();

    if !victims.is_empty() {
        let trimmed = victims.len();
        webhook_event::Entity::delete_many()
            .filter(webhook_event::Column::Id.is_in(victims))
            .exec(db)
            .await?;
        debug!(app_id = %app_id, trimmed, "Trimmed webhook events past retention");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> DatabaseConnection {
        let db = crate::connect("sqlite::memory:").await.unwrap();
        crate::migrate(&db).await.unwrap();
        db
    }

    async fn seed_app(db: &DatabaseConnection) -> (Uuid, Uuid, Uuid) {
        use crate::entities::{auth_token, organization, tunnel, user, webhook_app};

        let org_id = Uuid::new_v4();
        organization::ActiveModel {
            id: Set(org_id),
            name: Set("Acme".to_string()),
            subdomain: Set("acme".to_string()),
            is_active: Set(true),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap();

        let user_id = Uuid::new_v4();
        user::ActiveModel {
            id: Set(user_id),
            email: Set("u@acme.test".to_string()),
            password_hash: Set("x".to_string()),
            name: Set("U".to_string()),
            role: Set("org_admin".to_string()),
            organization_id: Set(Some(org_id)),
            two_factor_enabled: Set(false),
            two_factor_secret: Set(None),
            is_active: Set(true),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap();

        let token_id = Uuid::new_v4();
        auth_token::ActiveModel {
            id: Set(token_id),
            user_id: Set(user_id),
            token_hash: Set("hash".to_string()),
            name: Set("default".to_string()),
            scopes: Set(String::new()),
            expires_at: Set(None),
            is_active: Set(true),
            last_used_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap();

        let tunnel_id = Uuid::new_v4();
        tunnel::ActiveModel {
            id: Set(tunnel_id),
            user_id: Set(user_id),
            token_id: Set(token_id),
            organization_id: Set(Some(org_id)),
            tunnel_type: Set("http".to_string()),
            subdomain: Set("api-acme".to_string()),
            remote_port: Set(None),
            local_addr: Set("localhost:3000".to_string()),
            public_url: Set("http://api-acme.localhost".to_string()),
            client_id: Set("client-1".to_string()),
            saved_name: Set(None),
            is_persistent: Set(false),
            status: Set("active".to_string()),
            bytes_in: Set(0),
            bytes_out: Set(0),
            requests_count: Set(0),
            connected_at: Set(Utc::now()),
            disconnected_at: Set(None),
            last_activity_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap();

        let app_id = Uuid::new_v4();
        webhook_app::ActiveModel {
            id: Set(app_id),
            organization_id: Set(org_id),
            user_id: Set(user_id),
            name: Set("pay".to_string()),
            is_active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .unwrap();

        (tunnel_id, app_id, user_id)
    }

    fn webhook_record(app_id: Uuid, tunnel_id: Uuid) -> WebhookEventRecord {
        WebhookEventRecord {
            webhook_app_id: app_id,
            request_path: "/hook".to_string(),
            method: "POST".to_string(),
            status_code: 200,
            duration_ms: 12,
            bytes_in: 100,
            bytes_out: 2,
            client_ip: "203.0.113.9".to_string(),
            routing_status: "success".to_string(),
            tunnel_count: 1,
            success_count: 1,
            error_message: None,
            request_headers_json: "{}".to_string(),
            request_body_b64: None,
            body_truncated: false,
            responses: vec![WebhookResponseRecord {
                tunnel_id,
                tunnel_subdomain: "api-acme".to_string(),
                status_code: Some(200),
                duration_ms: 10,
                success: true,
                error_message: None,
                headers_json: "{}".to_string(),
                body_b64: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_request_logs_flushed_on_shutdown() {
        let db = setup().await;
        let (tunnel_id, _, _) = seed_app(&db).await;

        let writer = LogWriter::spawn(db.clone(), 0);
        let handle = writer.handle();

        for i in 0..5 {
            handle.log_request(RequestLogRecord {
                tunnel_id,
                method: "GET".to_string(),
                path: format!("/page/{i}"),
                status_code: 200,
                duration_ms: 3,
                bytes_in: 0,
                bytes_out: 128,
                client_ip: "198.51.100.7".to_string(),
            });
        }

        writer.shutdown().await;

        let count = request_log::Entity::find().count(&db).await.unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_webhook_event_with_responses_persisted() {
        let db = setup().await;
        let (tunnel_id, app_id, _) = seed_app(&db).await;

        let writer = LogWriter::spawn(db.clone(), 0);
        writer.handle().log_webhook(webhook_record(app_id, tunnel_id));
        writer.shutdown().await;

        let events = webhook_event::Entity::find().all(&db).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].routing_status, "success");

        let responses = webhook_tunnel_response::Entity::find().all(&db).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].webhook_event_id, events[0].id);
    }

    #[tokio::test]
    async fn test_retention_trim_keeps_newest() {
        let db = setup().await;
        let (tunnel_id, app_id, _) = seed_app(&db).await;

        // Insert 5 events directly with distinct timestamps
        for i in 0..5 {
            let mut record = webhook_record(app_id, tunnel_id);
            record.request_path = format!("/hook/{i}");
            let ts = Utc::now() - chrono::Duration::seconds(100 - i);
            insert_webhook_event(&db, record, ts).await.unwrap();
        }

        trim_webhook_events(&db, app_id, 2).await.unwrap();

        let remaining = webhook_event::Entity::find()
            .order_by_asc(webhook_event::Column::CreatedAt)
            .all(&db)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].request_path, "/hook/3");
        assert_eq!(remaining[1].request_path, "/hook/4");

        // Cascade removed the orphaned responses
        let responses = webhook_tunnel_response::Entity::find().count(&db).await.unwrap();
        assert_eq!(responses, 2);
    }

    #[tokio::test]
    async fn test_trim_disabled_when_zero() {
        let db = setup().await;
        let (tunnel_id, app_id, _) = seed_app(&db).await;

        let writer = LogWriter::spawn(db.clone(), 0);
        let handle = writer.handle();
        for _ in 0..4 {
            handle.log_webhook(webhook_record(app_id, tunnel_id));
        }
        writer.shutdown().await;

        let count = webhook_event::Entity::find().count(&db).await.unwrap();
        assert_eq!(count, 4);
    }
}
