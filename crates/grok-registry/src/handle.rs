//! Server-side handle for one connected client channel
//!
//! The handle owns the bounded outbound queue feeding the connection's single
//! writer task, the request-id correlation map, per-tunnel byte counters, and
//! the TCP stream table. The connection task (grok-control) drains the queue
//! and routes inbound frames back through [`TunnelHandle::deliver_response`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use grok_proto::{ControlMessage, TunnelType};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound frames queued per channel before sends start failing.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Buffered body/response chunks per in-flight proxied request.
const RESPONSE_QUEUE_CAPACITY: usize = 64;

/// Channel errors observed by the proxy path
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Outbound queue full; the frame was dropped
    #[error("Channel backpressure: outbound queue full")]
    BackpressureDropped,

    /// Channel already closed
    #[error("Tunnel disconnected")]
    TunnelDisconnected,
}

/// Immutable registration facts snapshotted into the handle
#[derive(Debug, Clone)]
pub struct TunnelMeta {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub tunnel_type: TunnelType,
    /// Full composed subdomain; empty for TCP tunnels
    pub subdomain: String,
    pub remote_port: Option<u16>,
    pub local_addr: String,
    pub public_url: String,
    pub client_id: String,
    pub persistent: bool,
}

/// Atomic traffic counters, updated off the registry lock
#[derive(Debug, Default)]
pub struct TunnelCounters {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub requests: AtomicU64,
}

/// One chunk of a proxied response as it streams back from the client
#[derive(Debug)]
pub enum ResponseChunk {
    Head {
        status: u16,
        headers: Vec<(String, String)>,
    },
    Body {
        data: Vec<u8>,
        is_final: bool,
    },
}

/// Inbound events for one bridged TCP stream
#[derive(Debug)]
pub enum TcpStreamEvent {
    Data(Vec<u8>),
    Close,
}

/// Live channel handle stored in the registry
pub struct TunnelHandle {
    pub meta: TunnelMeta,
    pub counters: TunnelCounters,
    outbound: mpsc::Sender<ControlMessage>,
    pending: DashMap<Uuid, mpsc::Sender<ResponseChunk>>,
    tcp_streams: DashMap<u32, mpsc::Sender<TcpStreamEvent>>,
    next_stream_id: AtomicU32,
    closed: AtomicBool,
    last_frame_at: AtomicI64,
    connected_at: DateTime<Utc>,
}

impl TunnelHandle {
    /// Create a handle; the paired receiver feeds the connection's writer task.
    pub fn new(meta: TunnelMeta) -> (Arc<Self>, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let handle = Arc::new(Self {
            meta,
            counters: TunnelCounters::default(),
            outbound: tx,
            pending: DashMap::new(),
            tcp_streams: DashMap::new(),
            next_stream_id: AtomicU32::new(grok_proto::FIRST_TCP_STREAM_ID),
            closed: AtomicBool::new(false),
            last_frame_at: AtomicI64::new(Utc::now().timestamp_millis()),
            connected_at: Utc::now(),
        });
        (handle, rx)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Enqueue a frame without blocking.
    ///
    /// A full queue surfaces as `BackpressureDropped` (observable upstream as
    /// a channel write failure); a closed channel as `TunnelDisconnected`.
    pub fn send(&self, msg: ControlMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::TunnelDisconnected);
        }
        match self.outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(tunnel_id = %self.meta.id, kind = msg.kind(), "Outbound queue full, dropping frame");
                Err(ChannelError::BackpressureDropped)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::TunnelDisconnected),
        }
    }

    /// Begin a proxied request: register the correlation slot and send the
    /// request head. Body frames follow via [`TunnelHandle::send`].
    pub fn start_request(
        &self,
        request_id: Uuid,
        method: String,
        uri: String,
        headers: Vec<(String, String)>,
    ) -> Result<mpsc::Receiver<ResponseChunk>, ChannelError> {
        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
        self.pending.insert(request_id, tx);

        let result = self.send(ControlMessage::HttpRequest {
            request_id,
            method,
            uri,
            headers,
        });
        if result.is_err() {
            self.pending.remove(&request_id);
        }
        result.map(|_| rx)
    }

    /// Route an inbound response frame to its waiting request.
    ///
    /// Returns false when no slot matches (late frame after cancel).
    pub async fn deliver_response(&self, request_id: Uuid, chunk: ResponseChunk) -> bool {
        let is_final = matches!(&chunk, ResponseChunk::Body { is_final: true, .. });

        let Some(tx) = self.pending.get(&request_id).map(|e| e.value().clone()) else {
            debug!(request_id = %request_id, "Response frame without pending request");
            return false;
        };

        let delivered = tx.send(chunk).await.is_ok();
        if is_final || !delivered {
            self.pending.remove(&request_id);
        }
        delivered
    }

    /// Drop the correlation slot and tell the client to stop.
    ///
    /// Used when the public request goes away (disconnect, timeout).
    pub fn cancel_request(&self, request_id: Uuid) {
        if self.pending.remove(&request_id).is_some() {
            // Best effort; a closed channel is already torn down
            let _ = self.send(ControlMessage::Cancel { request_id });
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Open a bridged TCP stream; returns (stream id, inbound event receiver).
    pub fn open_tcp_stream(
        &self,
    ) -> Result<(u32, mpsc::Receiver<TcpStreamEvent>), ChannelError> {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
        self.tcp_streams.insert(stream_id, tx);

        let result = self.send(ControlMessage::TcpOpen { stream_id });
        if result.is_err() {
            self.tcp_streams.remove(&stream_id);
        }
        result.map(|_| (stream_id, rx))
    }

    /// Route inbound TCP data/close frames to the bridging task.
    pub async fn deliver_tcp_event(&self, stream_id: u32, event: TcpStreamEvent) -> bool {
        let closing = matches!(event, TcpStreamEvent::Close);
        let Some(tx) = self.tcp_streams.get(&stream_id).map(|e| e.value().clone()) else {
            return false;
        };
        let delivered = tx.send(event).await.is_ok();
        if closing || !delivered {
            self.tcp_streams.remove(&stream_id);
        }
        delivered
    }

    /// Remove a TCP stream when the public side closes first.
    pub fn close_tcp_stream(&self, stream_id: u32) {
        if self.tcp_streams.remove(&stream_id).is_some() {
            let _ = self.send(ControlMessage::TcpClose { stream_id });
        }
    }

    /// Record frame arrival for the idle watchdog.
    pub fn touch(&self) {
        self.last_frame_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the last inbound frame.
    pub fn idle_millis(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_frame_at.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed and fail every in-flight request and TCP stream.
    ///
    /// Pending receivers observe a closed stream, which the proxy reports as
    /// `TunnelDisconnected`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending.clear();
        let streams: Vec<u32> = self.tcp_streams.iter().map(|e| *e.key()).collect();
        for stream_id in streams {
            if let Some((_, tx)) = self.tcp_streams.remove(&stream_id) {
                let _ = tx.try_send(TcpStreamEvent::Close);
            }
        }
        debug!(tunnel_id = %self.meta.id, "Channel handle closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta() -> TunnelMeta {
        TunnelMeta {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_id: Uuid::new_v4(),
            organization_id: None,
            tunnel_type: TunnelType::Http,
            subdomain: "api-acme".to_string(),
            remote_port: None,
            local_addr: "localhost:3000".to_string(),
            public_url: "http://api-acme.localhost".to_string(),
            client_id: "client-1".to_string(),
            persistent: false,
        }
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (handle, mut outbound) = TunnelHandle::new(test_meta());
        let request_id = Uuid::new_v4();

        let mut rx = handle
            .start_request(request_id, "GET".to_string(), "/".to_string(), vec![])
            .unwrap();
        assert_eq!(handle.pending_count(), 1);

        // Request head was queued for the writer task
        let queued = outbound.recv().await.unwrap();
        assert!(matches!(queued, ControlMessage::HttpRequest { .. }));

        handle
            .deliver_response(
                request_id,
                ResponseChunk::Head {
                    status: 200,
                    headers: vec![],
                },
            )
            .await;
        handle
            .deliver_response(
                request_id,
                ResponseChunk::Body {
                    data: b"ok".to_vec(),
                    is_final: true,
                },
            )
            .await;

        assert!(matches!(
            rx.recv().await,
            Some(ResponseChunk::Head { status: 200, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ResponseChunk::Body { is_final: true, .. })
        ));

        // Final frame released the slot
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_responses_matched_by_id_not_order() {
        let (handle, _outbound) = TunnelHandle::new(test_meta());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let mut rx1 = handle
            .start_request(first, "GET".to_string(), "/a".to_string(), vec![])
            .unwrap();
        let mut rx2 = handle
            .start_request(second, "GET".to_string(), "/b".to_string(), vec![])
            .unwrap();

        // Client answers the second request first
        handle
            .deliver_response(
                second,
                ResponseChunk::Head {
                    status: 201,
                    headers: vec![],
                },
            )
            .await;
        handle
            .deliver_response(
                first,
                ResponseChunk::Head {
                    status: 200,
                    headers: vec![],
                },
            )
            .await;

        assert!(matches!(
            rx2.recv().await,
            Some(ResponseChunk::Head { status: 201, .. })
        ));
        assert!(matches!(
            rx1.recv().await,
            Some(ResponseChunk::Head { status: 200, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_releases_slot() {
        let (handle, mut outbound) = TunnelHandle::new(test_meta());
        let request_id = Uuid::new_v4();

        let _rx = handle
            .start_request(request_id, "GET".to_string(), "/".to_string(), vec![])
            .unwrap();
        handle.cancel_request(request_id);
        assert_eq!(handle.pending_count(), 0);

        // Request head, then the cancel frame
        let _ = outbound.recv().await.unwrap();
        let cancel = outbound.recv().await.unwrap();
        assert!(matches!(cancel, ControlMessage::Cancel { .. }));

        // Late frames are dropped
        let delivered = handle
            .deliver_response(
                request_id,
                ResponseChunk::Head {
                    status: 200,
                    headers: vec![],
                },
            )
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let (handle, _outbound) = TunnelHandle::new(test_meta());
        let request_id = Uuid::new_v4();

        let mut rx = handle
            .start_request(request_id, "GET".to_string(), "/".to_string(), vec![])
            .unwrap();

        handle.close();

        // Receiver observes end-of-stream without a head
        assert!(rx.recv().await.is_none());
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(ControlMessage::Heartbeat { timestamp: 0 }),
            Err(ChannelError::TunnelDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_backpressure_drops() {
        let (handle, _outbound) = TunnelHandle::new(test_meta());

        // Fill the queue without draining it
        let mut dropped = false;
        for i in 0..=OUTBOUND_QUEUE_CAPACITY {
            match handle.send(ControlMessage::Heartbeat { timestamp: i as u64 }) {
                Ok(()) => {}
                Err(ChannelError::BackpressureDropped) => {
                    dropped = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(dropped);
    }

    #[tokio::test]
    async fn test_tcp_stream_lifecycle() {
        let (handle, mut outbound) = TunnelHandle::new(test_meta());

        let (stream_id, mut rx) = handle.open_tcp_stream().unwrap();
        assert!(matches!(
            outbound.recv().await.unwrap(),
            ControlMessage::TcpOpen { .. }
        ));

        handle
            .deliver_tcp_event(stream_id, TcpStreamEvent::Data(vec![1, 2, 3]))
            .await;
        assert!(matches!(
            rx.recv().await,
            Some(TcpStreamEvent::Data(d)) if d == vec![1, 2, 3]
        ));

        handle.deliver_tcp_event(stream_id, TcpStreamEvent::Close).await;
        assert!(matches!(rx.recv().await, Some(TcpStreamEvent::Close)));

        // Stream is gone; further data is dropped
        assert!(
            !handle
                .deliver_tcp_event(stream_id, TcpStreamEvent::Data(vec![4]))
                .await
        );
    }

    #[test]
    fn test_idle_tracking() {
        let (handle, _outbound) = TunnelHandle::new(test_meta());
        handle.touch();
        assert!(handle.idle_millis() < 1000);
    }
}
