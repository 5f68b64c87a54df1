//! Control listener and per-channel connection driving
//!
//! Each client connection is a framed TCP stream. The first frame must be a
//! Register; after the ack, one writer task drains the handle's outbound
//! queue while the read loop routes inbound frames to pending requests, TCP
//! bridges, or the spontaneous handlers (heartbeat, close). A watchdog closes
//! channels that go silent past `idle_timeout`.

use crate::handler::TunnelService;
use futures::{SinkExt, StreamExt};
use grok_proto::{decode_message, encode_message, ControlMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Control listener errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Proto(#[from] grok_proto::ProtoError),

    #[error("First frame was not Register")]
    ExpectedRegister,
}

/// Control listener configuration
#[derive(Debug, Clone)]
pub struct ControlListenerConfig {
    pub bind_addr: SocketAddr,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Accepts client control connections and drives their channels.
pub struct ControlListener {
    config: ControlListenerConfig,
    service: Arc<TunnelService>,
}

impl ControlListener {
    pub fn new(config: ControlListenerConfig, service: Arc<TunnelService>) -> Self {
        Self { config, service }
    }

    /// Run the accept loop until the task is aborted.
    pub async fn start(&self) -> Result<(), ControlError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("Control listener on {}", self.config.bind_addr);

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Client connection from {}", peer_addr);
                    let service = self.service.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, peer_addr, service, config).await
                        {
                            debug!("Connection from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    service: Arc<TunnelService>,
    config: ControlListenerConfig,
) -> Result<(), ControlError> {
    let mut framed = Framed::new(socket, grok_proto::codec());

    // Registration handshake: exactly one Register frame opens the channel
    let first = match framed.next().await {
        Some(frame) => decode_message(&frame?)?,
        None => return Ok(()),
    };

    let ControlMessage::Register {
        client_id,
        auth_token,
        endpoint,
        options,
    } = first
    else {
        return Err(ControlError::ExpectedRegister);
    };

    let (handle, mut outbound_rx) = match service
        .register(&client_id, &auth_token, endpoint, options)
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            warn!(client_id = %client_id, peer = %peer_addr, "Registration rejected: {}", e);
            let reject = ControlMessage::RegisterError {
                code: e.code().to_string(),
                message: e.to_string(),
            };
            let _ = framed.send(encode_message(&reject)?).await;
            return Ok(());
        }
    };

    let tunnel_id = handle.meta.id;
    let ack = ControlMessage::RegisterAck {
        tunnel_id,
        public_url: handle.meta.public_url.clone(),
        remote_port: handle.meta.remote_port,
    };
    framed.send(encode_message(&ack)?).await?;

    let (mut sink, mut stream) = framed.split();

    // Single writer task serializes all outbound frames
    let writer_handle = handle.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let frame = match encode_message(&msg) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(tunnel_id = %writer_handle.meta.id, "Dropping unencodable frame: {}", e);
                    continue;
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Watchdog closes the channel when no frame arrives within idle_timeout
    let watchdog_handle = handle.clone();
    let idle_timeout = config.idle_timeout;
    let watchdog = tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.heartbeat_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if watchdog_handle.is_closed() {
                break;
            }
            if watchdog_handle.idle_millis() > idle_timeout.as_millis() as i64 {
                warn!(tunnel_id = %watchdog_handle.meta.id, "Idle timeout, closing channel");
                watchdog_handle.close();
                break;
            }
        }
    });

    // Read loop: route frames until the transport closes or the watchdog
    // force-closes the channel
    let mut closed_check = tokio::time::interval(Duration::from_secs(1));
    closed_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = closed_check.tick() => {
                if handle.is_closed() {
                    break;
                }
                continue;
            }
        };

        let Some(frame) = frame else { break };
        let msg = match frame {
            Ok(bytes) => match decode_message(&bytes) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(tunnel_id = %tunnel_id, "Undecodable frame, closing: {}", e);
                    break;
                }
            },
            Err(e) => {
                debug!(tunnel_id = %tunnel_id, "Transport error: {}", e);
                break;
            }
        };

        handle.touch();
        if handle.is_closed() {
            break;
        }

        match msg {
            ControlMessage::Heartbeat { timestamp } => {
                // Echo so the client can watch liveness too
                let _ = handle.send(ControlMessage::Heartbeat { timestamp });
            }
            ControlMessage::HttpResponse {
                request_id,
                status,
                headers,
            } => {
                handle
                    .deliver_response(
                        request_id,
                        grok_registry::ResponseChunk::Head { status, headers },
                    )
                    .await;
            }
            ControlMessage::HttpResponseBody {
                request_id,
                data,
                is_final,
            } => {
                handle
                    .deliver_response(
                        request_id,
                        grok_registry::ResponseChunk::Body { data, is_final },
                    )
                    .await;
            }
            ControlMessage::TcpData { stream_id, data } => {
                handle
                    .deliver_tcp_event(stream_id, grok_registry::TcpStreamEvent::Data(data))
                    .await;
            }
            ControlMessage::TcpClose { stream_id } => {
                handle
                    .deliver_tcp_event(stream_id, grok_registry::TcpStreamEvent::Close)
                    .await;
            }
            ControlMessage::Close { reason } => {
                info!(tunnel_id = %tunnel_id, reason = %reason, "Client closed channel");
                break;
            }
            other => {
                debug!(tunnel_id = %tunnel_id, kind = other.kind(), "Ignoring unexpected frame");
            }
        }
    }

    // Teardown: fail pending requests, free the address, persist the status
    service.unregister(tunnel_id).await;
    watchdog.abort();
    writer.abort();
    debug!(tunnel_id = %tunnel_id, peer = %peer_addr, "Connection closed");
    Ok(())
}
