//! Single-shot request forwarding through a tunnel channel
//!
//! The webhook router delivers one buffered request to several tunnels; each
//! delivery is this primitive: send the request, stream the body in frames,
//! collect the response up to a capture cap, all under one deadline.

use bytes::Bytes;
use grok_registry::{ChannelError, ResponseChunk, TunnelHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Request body frames are split at this size.
pub const BODY_FRAME_SIZE: usize = 64 * 1024;

/// Forwarding failures, each with its public error class
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Tunnel disconnected")]
    TunnelDisconnected,

    #[error("Channel write failed")]
    ChannelWriteFailed,

    #[error("Upstream timeout")]
    UpstreamTimeout,
}

/// Collected response from one tunnel
#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Body capped at the caller's capture limit
    pub body: Vec<u8>,
    pub body_truncated: bool,
}

/// Send one fully-buffered request through a tunnel and collect the response.
pub async fn forward_once(
    handle: &TunnelHandle,
    method: &str,
    uri: &str,
    headers: Vec<(String, String)>,
    body: &[u8],
    timeout: Duration,
    capture_cap: usize,
) -> Result<TunnelResponse, ForwardError> {
    let request_id = Uuid::new_v4();

    let rx = handle
        .start_request(request_id, method.to_string(), uri.to_string(), headers)
        .map_err(|e| match e {
            ChannelError::BackpressureDropped => ForwardError::ChannelWriteFailed,
            ChannelError::TunnelDisconnected => ForwardError::TunnelDisconnected,
        })?;

    let result = tokio::time::timeout(
        timeout,
        exchange(handle, request_id, body, rx, capture_cap),
    )
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => {
            debug!(request_id = %request_id, "Forward deadline exceeded");
            handle.cancel_request(request_id);
            Err(ForwardError::UpstreamTimeout)
        }
    }
}

async fn exchange(
    handle: &TunnelHandle,
    request_id: Uuid,
    body: &[u8],
    mut rx: tokio::sync::mpsc::Receiver<ResponseChunk>,
    capture_cap: usize,
) -> Result<TunnelResponse, ForwardError> {
    send_body_frames(handle, request_id, body).map_err(|e| {
        handle.cancel_request(request_id);
        e
    })?;

    // Head first, then body frames until final
    let (status, headers) = match rx.recv().await {
        Some(ResponseChunk::Head { status, headers }) => (status, headers),
        Some(ResponseChunk::Body { .. }) | None => {
            handle.cancel_request(request_id);
            return Err(ForwardError::TunnelDisconnected);
        }
    };

    let mut collected = Vec::new();
    let mut truncated = false;
    loop {
        match rx.recv().await {
            Some(ResponseChunk::Body { data, is_final }) => {
                if collected.len() < capture_cap {
                    let room = capture_cap - collected.len();
                    if data.len() > room {
                        collected.extend_from_slice(&data[..room]);
                        truncated = true;
                    } else {
                        collected.extend_from_slice(&data);
                    }
                } else if !data.is_empty() {
                    truncated = true;
                }
                if is_final {
                    break;
                }
            }
            Some(ResponseChunk::Head { .. }) => {
                // Duplicate head; treat as protocol violation
                handle.cancel_request(request_id);
                return Err(ForwardError::TunnelDisconnected);
            }
            None => {
                return Err(ForwardError::TunnelDisconnected);
            }
        }
    }

    Ok(TunnelResponse {
        status,
        headers,
        body: collected,
        body_truncated: truncated,
    })
}

/// Split a buffered body into wire frames; always ends with a final frame.
fn send_body_frames(
    handle: &TunnelHandle,
    request_id: Uuid,
    body: &[u8],
) -> Result<(), ForwardError> {
    let map_err = |e: ChannelError| match e {
        ChannelError::BackpressureDropped => ForwardError::ChannelWriteFailed,
        ChannelError::TunnelDisconnected => ForwardError::TunnelDisconnected,
    };

    if body.is_empty() {
        handle
            .send(grok_proto::ControlMessage::HttpRequestBody {
                request_id,
                data: Vec::new(),
                is_final: true,
            })
            .map_err(map_err)?;
        return Ok(());
    }

    let mut chunks = body.chunks(BODY_FRAME_SIZE).peekable();
    while let Some(chunk) = chunks.next() {
        handle
            .send(grok_proto::ControlMessage::HttpRequestBody {
                request_id,
                data: chunk.to_vec(),
                is_final: chunks.peek().is_none(),
            })
            .map_err(map_err)?;
    }
    Ok(())
}

/// Split bytes for the streaming path as well.
pub fn frame_chunks(data: &Bytes) -> impl Iterator<Item = Bytes> + '_ {
    (0..data.len())
        .step_by(BODY_FRAME_SIZE)
        .map(move |start| data.slice(start..(start + BODY_FRAME_SIZE).min(data.len())))
}
