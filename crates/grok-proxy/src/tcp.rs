//! TCP proxy front-end
//!
//! One accept loop per allocated port. A reconciler tick compares the
//! registry's live ports against running loops and starts or stops them, so
//! the front-end needs no direct coupling to the registration path. Each
//! accepted connection opens a fresh stream on the tunnel channel and pipes
//! bytes both ways until either side closes.

use grok_proto::ControlMessage;
use grok_registry::{TcpStreamEvent, TunnelHandle, TunnelRegistry};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);
const READ_BUFFER: usize = 16 * 1024;

/// Manages per-port accept loops for TCP tunnels.
pub struct TcpFrontend {
    registry: Arc<TunnelRegistry>,
    bind_ip: IpAddr,
    loops: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl TcpFrontend {
    pub fn new(registry: Arc<TunnelRegistry>, bind_ip: IpAddr) -> Arc<Self> {
        Arc::new(Self {
            registry,
            bind_ip,
            loops: Mutex::new(HashMap::new()),
        })
    }

    /// Run the reconciler until aborted.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(RECONCILE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.reconcile();
        }
    }

    /// Start loops for newly live ports, stop loops for dead ones.
    pub fn reconcile(self: &Arc<Self>) {
        let live = self.registry.live_ports();
        let mut loops = self.loops.lock().unwrap();

        loops.retain(|port, task| {
            let keep = live.contains(port) && !task.is_finished();
            if !keep {
                task.abort();
                debug!(port, "Stopped TCP accept loop");
            }
            keep
        });

        for port in live {
            if !loops.contains_key(&port) {
                let addr = SocketAddr::new(self.bind_ip, port);
                let registry = self.registry.clone();
                let task = tokio::spawn(accept_loop(addr, port, registry));
                loops.insert(port, task);
            }
        }
    }

    /// Ports with a running accept loop (tests, stats).
    pub fn active_ports(&self) -> Vec<u16> {
        self.loops.lock().unwrap().keys().copied().collect()
    }

    /// Abort every accept loop.
    pub fn shutdown(&self) {
        let mut loops = self.loops.lock().unwrap();
        for (port, task) in loops.drain() {
            task.abort();
            debug!(port, "Stopped TCP accept loop");
        }
    }
}

async fn accept_loop(addr: SocketAddr, port: u16, registry: Arc<TunnelRegistry>) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port, "Failed to bind TCP tunnel port: {}", e);
            return;
        }
    };
    info!(port, "TCP tunnel port open");

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                // Resolve at accept time; the tunnel may have changed
                let Some(handle) = registry.find_by_port(port) else {
                    debug!(port, "No tunnel for port, dropping connection");
                    continue;
                };
                tokio::spawn(async move {
                    if let Err(e) = bridge(socket, peer_addr, handle).await {
                        debug!(port, "TCP bridge from {} ended: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                warn!(port, "TCP accept failed: {}", e);
            }
        }
    }
}

/// Pipe bytes both directions until either side closes.
async fn bridge(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    handle: Arc<TunnelHandle>,
) -> std::io::Result<()> {
    let (stream_id, mut events) = match handle.open_tcp_stream() {
        Ok(pair) => pair,
        Err(e) => {
            debug!(peer = %peer_addr, "Could not open tunnel stream: {}", e);
            return Ok(());
        }
    };
    debug!(tunnel_id = %handle.meta.id, stream_id, peer = %peer_addr, "TCP stream open");

    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        tokio::select! {
            read = socket.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        handle.close_tcp_stream(stream_id);
                        break;
                    }
                    Ok(n) => {
                        handle
                            .counters
                            .bytes_in
                            .fetch_add(n as u64, Ordering::Relaxed);
                        let sent = handle.send(ControlMessage::TcpData {
                            stream_id,
                            data: buf[..n].to_vec(),
                        });
                        if sent.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        handle.close_tcp_stream(stream_id);
                        return Err(e);
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(TcpStreamEvent::Data(data)) => {
                        handle
                            .counters
                            .bytes_out
                            .fetch_add(data.len() as u64, Ordering::Relaxed);
                        socket.write_all(&data).await?;
                    }
                    Some(TcpStreamEvent::Close) | None => {
                        let _ = socket.shutdown().await;
                        break;
                    }
                }
            }
        }
    }

    debug!(tunnel_id = %handle.meta.id, stream_id, "TCP stream closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grok_proto::TunnelType;
    use grok_registry::TunnelMeta;
    use uuid::Uuid;

    fn tcp_handle(port: u16) -> (Arc<TunnelHandle>, tokio::sync::mpsc::Receiver<ControlMessage>) {
        TunnelHandle::new(TunnelMeta {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_id: Uuid::new_v4(),
            organization_id: None,
            tunnel_type: TunnelType::Tcp,
            subdomain: String::new(),
            remote_port: Some(port),
            local_addr: "localhost:5432".to_string(),
            public_url: format!("tcp://localhost:{port}"),
            client_id: Uuid::new_v4().to_string(),
            persistent: false,
        })
    }

    #[tokio::test]
    async fn test_reconcile_starts_and_stops_loops() {
        let registry = Arc::new(TunnelRegistry::new());
        let frontend = TcpFrontend::new(registry.clone(), "127.0.0.1".parse().unwrap());

        // Use ephemeral-range ports unlikely to clash in CI
        let (handle, _rx) = tcp_handle(42801);
        let id = handle.meta.id;
        registry.insert(handle).unwrap();

        frontend.reconcile();
        assert_eq!(frontend.active_ports(), vec![42801]);

        registry.remove(id);
        frontend.reconcile();
        assert!(frontend.active_ports().is_empty());
    }

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let registry = Arc::new(TunnelRegistry::new());
        let frontend = TcpFrontend::new(registry.clone(), "127.0.0.1".parse().unwrap());

        let (handle, mut outbound) = tcp_handle(42802);
        registry.insert(handle.clone()).unwrap();
        frontend.reconcile();

        // Simulated client: echoes TcpData back uppercased
        let echo_handle = handle.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                if let ControlMessage::TcpData { stream_id, data } = msg {
                    let upper: Vec<u8> = data.iter().map(|b| b.to_ascii_uppercase()).collect();
                    echo_handle
                        .deliver_tcp_event(stream_id, TcpStreamEvent::Data(upper))
                        .await;
                }
            }
        });

        // Give the accept loop a moment to bind
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut public = TcpStream::connect("127.0.0.1:42802").await.unwrap();
        public.write_all(b"hello").await.unwrap();

        let mut response = [0u8; 5];
        public.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"HELLO");

        assert!(handle.counters.bytes_in.load(Ordering::Relaxed) >= 5);
        assert!(handle.counters.bytes_out.load(Ordering::Relaxed) >= 5);

        frontend.shutdown();
    }
}
