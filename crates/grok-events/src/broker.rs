//! SSE broker
//!
//! A single coordinator task owns the subscriber table and processes
//! register/unregister commands, bus events, and a reap tick. Slow clients
//! never block the loop: a full per-client queue drops that client's event.
//! Clients idle past the stale window (no successful send for 5 minutes) are
//! reaped on a 30-second tick. Shutdown closes every client queue and exits
//! the coordinator deterministically.

use crate::bus::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-client queue size used by the SSE endpoint
pub const DEFAULT_CLIENT_BUFFER: usize = 64;

const REAP_TICK: Duration = Duration::from_secs(30);
const STALE_AFTER: Duration = Duration::from_secs(300);

enum Command {
    Register {
        id: Uuid,
        buffer: usize,
        reply: oneshot::Sender<mpsc::Receiver<Event>>,
    },
    Unregister(Uuid),
    Shutdown,
}

struct Client {
    tx: mpsc::Sender<Event>,
    last_seen: Instant,
}

/// A registered dashboard stream
pub struct Subscriber {
    pub id: Uuid,
    pub rx: mpsc::Receiver<Event>,
}

/// Handle to the broker coordinator
#[derive(Clone)]
pub struct SseBroker {
    cmd_tx: mpsc::Sender<Command>,
    client_count: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
}

impl SseBroker {
    /// Spawn the coordinator consuming the bus receiver.
    pub fn spawn(bus_rx: mpsc::Receiver<Event>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let client_count = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        tokio::spawn(coordinator(
            cmd_rx,
            bus_rx,
            client_count.clone(),
            dropped.clone(),
        ));

        Self {
            cmd_tx,
            client_count,
            dropped,
        }
    }

    /// Register a subscriber with the given queue buffer.
    ///
    /// Returns None when the broker has shut down.
    pub async fn register(&self, buffer: usize) -> Option<Subscriber> {
        let id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register { id, buffer, reply })
            .await
            .ok()?;
        let rx = rx.await.ok()?;
        Some(Subscriber { id, rx })
    }

    /// Drop a subscriber; its queue closes.
    pub async fn unregister(&self, id: Uuid) {
        let _ = self.cmd_tx.send(Command::Unregister(id)).await;
    }

    /// Non-blocking unregister for Drop impls. If the command queue is
    /// momentarily full, the stale-client reaper collects the subscriber.
    pub fn unregister_nowait(&self, id: Uuid) {
        let _ = self.cmd_tx.try_send(Command::Unregister(id));
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    /// Events dropped on full per-client queues since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close all client queues and stop the coordinator.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

async fn coordinator(
    mut cmd_rx: mpsc::Receiver<Command>,
    mut bus_rx: mpsc::Receiver<Event>,
    client_count: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
) {
    let mut clients: HashMap<Uuid, Client> = HashMap::new();
    let mut tick = tokio::time::interval(REAP_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Register { id, buffer, reply }) => {
                        let (tx, rx) = mpsc::channel(buffer.max(1));
                        clients.insert(id, Client { tx, last_seen: Instant::now() });
                        client_count.store(clients.len(), Ordering::Relaxed);
                        debug!(client_id = %id, total = clients.len(), "SSE client registered");
                        let _ = reply.send(rx);
                    }
                    Some(Command::Unregister(id)) => {
                        if clients.remove(&id).is_some() {
                            client_count.store(clients.len(), Ordering::Relaxed);
                            debug!(client_id = %id, total = clients.len(), "SSE client unregistered");
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                }
            }
            event = bus_rx.recv() => {
                match event {
                    Some(event) => {
                        broadcast(&mut clients, event, &dropped);
                        client_count.store(clients.len(), Ordering::Relaxed);
                    }
                    // Producers are gone; keep serving registered clients
                    // until an explicit shutdown.
                    None => {}
                }
            }
            _ = tick.tick() => {
                let before = clients.len();
                clients.retain(|id, client| {
                    let stale = client.last_seen.elapsed() > STALE_AFTER;
                    if stale {
                        info!(client_id = %id, "Reaping stale SSE client");
                    }
                    !stale
                });
                if clients.len() != before {
                    client_count.store(clients.len(), Ordering::Relaxed);
                }
            }
        }
    }

    // Deterministic teardown: dropping the senders closes every queue
    let remaining = clients.len();
    clients.clear();
    client_count.store(0, Ordering::Relaxed);
    info!(clients = remaining, "SSE broker stopped");
}

fn broadcast(clients: &mut HashMap<Uuid, Client>, event: Event, dropped: &AtomicU64) {
    let mut gone: Vec<Uuid> = Vec::new();

    for (id, client) in clients.iter_mut() {
        match client.tx.try_send(event.clone()) {
            Ok(()) => {
                client.last_seen = Instant::now();
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Slow client; skip this event for them only
                dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                gone.push(*id);
            }
        }
    }

    for id in gone {
        clients.remove(&id);
        warn!(client_id = %id, "SSE client queue closed, removing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;

    #[tokio::test]
    async fn test_register_broadcast_unregister() {
        let (bus, bus_rx) = EventBus::new();
        let broker = SseBroker::spawn(bus_rx);

        let mut sub = broker.register(8).await.unwrap();
        // Wait for the coordinator to process registration
        tokio::task::yield_now().await;
        assert_eq!(broker.client_count(), 1);

        bus.publish(Event::new("test", serde_json::json!({"n": 1})));
        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.kind, "test");

        broker.unregister(sub.id).await;
        tokio::task::yield_now().await;
        assert_eq!(broker.client_count(), 0);

        // Queue closed after unregister
        assert!(sub.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_client_does_not_block_others() {
        let (bus, bus_rx) = EventBus::new();
        let broker = SseBroker::spawn(bus_rx);

        // Slow subscriber never reads; fast one does
        let _slow = broker.register(10).await.unwrap();
        let mut fast = broker.register(2048).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(broker.client_count(), 2);

        for i in 0..1000u32 {
            bus.publish(Event::new("flood", serde_json::json!({ "i": i })));
        }

        let mut received = 0;
        while received < 1000 {
            match tokio::time::timeout(Duration::from_secs(5), fast.rx.recv()).await {
                Ok(Some(_)) => received += 1,
                other => panic!("fast client starved: {other:?}"),
            }
        }

        // Slow client lost events (its queue holds at most 10) but stayed
        // registered, and the broker kept running.
        assert!(broker.dropped_count() >= 990);
        assert_eq!(broker.client_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_client_reaped() {
        let (bus, bus_rx) = EventBus::new();
        let broker = SseBroker::spawn(bus_rx);

        let mut sub = broker.register(1).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(broker.client_count(), 1);

        // Fill the one-slot queue so further sends never succeed, then let
        // the client sit idle past the stale window.
        bus.publish(Event::new("fill", serde_json::json!({})));
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        tokio::task::yield_now().await;

        assert_eq!(broker.client_count(), 0);
        // Drain the prefilled event; then the closed queue ends the stream
        assert!(sub.rx.recv().await.is_some());
        assert!(sub.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_queues() {
        let (_bus, bus_rx) = EventBus::new();
        let broker = SseBroker::spawn(bus_rx);

        let mut a = broker.register(8).await.unwrap();
        let mut b = broker.register(8).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(broker.client_count(), 2);

        broker.shutdown().await;
        tokio::task::yield_now().await;

        assert_eq!(broker.client_count(), 0);
        assert!(a.rx.recv().await.is_none());
        assert!(b.rx.recv().await.is_none());

        // Registering after shutdown fails cleanly
        assert!(broker.register(8).await.is_none());
    }

    #[tokio::test]
    async fn test_disconnected_client_removed_on_broadcast() {
        let (bus, bus_rx) = EventBus::new();
        let broker = SseBroker::spawn(bus_rx);

        let sub = broker.register(8).await.unwrap();
        tokio::task::yield_now().await;
        drop(sub.rx);

        bus.publish(Event::new("test", serde_json::json!({})));
        tokio::task::yield_now().await;

        assert_eq!(broker.client_count(), 0);
    }
}
