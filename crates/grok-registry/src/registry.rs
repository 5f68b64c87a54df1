//! Tunnel registry
//!
//! Authoritative map from tunnel id to live channel handle, with secondary
//! indexes by subdomain (HTTP/HTTPS/TLS) and public port (TCP). All three
//! maps mutate inside one write-lock critical section so readers never
//! observe a primary entry without its index or vice versa. Nothing awaits
//! while the lock is held; persistence happens outside, in grok-control.

use crate::handle::TunnelHandle;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Subdomain {0} is already bound to a live tunnel")]
    SubdomainTaken(String),

    #[error("Port {0} is already bound to a live tunnel")]
    PortTaken(u16),

    #[error("Tunnel {0} is already registered")]
    AlreadyRegistered(Uuid),
}

#[derive(Default)]
struct RegistryState {
    tunnels: HashMap<Uuid, Arc<TunnelHandle>>,
    by_subdomain: HashMap<String, Uuid>,
    by_port: HashMap<u16, Uuid>,
}

/// Live-tunnel map with subdomain and port indexes
pub struct TunnelRegistry {
    state: RwLock<RegistryState>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Insert a handle and its indexes atomically.
    ///
    /// All conflicts are checked before any map is touched, so a failed
    /// insert leaves no partial state behind.
    pub fn insert(&self, handle: Arc<TunnelHandle>) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap();
        let meta = &handle.meta;

        if state.tunnels.contains_key(&meta.id) {
            return Err(RegistryError::AlreadyRegistered(meta.id));
        }
        if meta.tunnel_type.is_http_like() && state.by_subdomain.contains_key(&meta.subdomain) {
            return Err(RegistryError::SubdomainTaken(meta.subdomain.clone()));
        }
        if let Some(port) = meta.remote_port {
            if state.by_port.contains_key(&port) {
                return Err(RegistryError::PortTaken(port));
            }
        }

        if meta.tunnel_type.is_http_like() {
            state.by_subdomain.insert(meta.subdomain.clone(), meta.id);
        }
        if let Some(port) = meta.remote_port {
            state.by_port.insert(port, meta.id);
        }
        info!(
            tunnel_id = %meta.id,
            tunnel_type = meta.tunnel_type.as_str(),
            subdomain = %meta.subdomain,
            port = ?meta.remote_port,
            "Tunnel registered"
        );
        state.tunnels.insert(meta.id, handle.clone());
        Ok(())
    }

    /// Remove a handle and its indexes atomically. Returns the handle so the
    /// caller can fail in-flight requests and persist the state change.
    pub fn remove(&self, tunnel_id: Uuid) -> Option<Arc<TunnelHandle>> {
        let mut state = self.state.write().unwrap();
        let handle = state.tunnels.remove(&tunnel_id)?;

        if handle.meta.tunnel_type.is_http_like() {
            state.by_subdomain.remove(&handle.meta.subdomain);
        }
        if let Some(port) = handle.meta.remote_port {
            state.by_port.remove(&port);
        }
        debug!(tunnel_id = %tunnel_id, "Tunnel removed from registry");
        Some(handle)
    }

    pub fn get(&self, tunnel_id: Uuid) -> Option<Arc<TunnelHandle>> {
        self.state.read().unwrap().tunnels.get(&tunnel_id).cloned()
    }

    /// Resolve a full subdomain (leftmost public label) to its live channel.
    pub fn find_by_subdomain(&self, subdomain: &str) -> Option<Arc<TunnelHandle>> {
        let state = self.state.read().unwrap();
        let id = state.by_subdomain.get(subdomain)?;
        state.tunnels.get(id).cloned()
    }

    /// Resolve a public TCP port to its live channel.
    pub fn find_by_port(&self, port: u16) -> Option<Arc<TunnelHandle>> {
        let state = self.state.read().unwrap();
        let id = state.by_port.get(&port)?;
        state.tunnels.get(id).cloned()
    }

    /// Is this full subdomain currently live?
    pub fn subdomain_in_use(&self, subdomain: &str) -> bool {
        self.state.read().unwrap().by_subdomain.contains_key(subdomain)
    }

    /// Count of live tunnels owned by a user, for quota enforcement.
    pub fn count_for_user(&self, user_id: Uuid) -> usize {
        self.state
            .read()
            .unwrap()
            .tunnels
            .values()
            .filter(|h| h.meta.user_id == user_id)
            .count()
    }

    pub fn count(&self) -> usize {
        self.state.read().unwrap().tunnels.len()
    }

    pub fn list(&self) -> Vec<Arc<TunnelHandle>> {
        self.state.read().unwrap().tunnels.values().cloned().collect()
    }

    /// All live ports, for the TCP front-end to reconcile accept loops.
    pub fn live_ports(&self) -> Vec<u16> {
        self.state.read().unwrap().by_port.keys().copied().collect()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::TunnelMeta;
    use grok_proto::TunnelType;

    fn http_handle(subdomain: &str, user_id: Uuid) -> Arc<TunnelHandle> {
        let (handle, _rx) = TunnelHandle::new(TunnelMeta {
            id: Uuid::new_v4(),
            user_id,
            token_id: Uuid::new_v4(),
            organization_id: None,
            tunnel_type: TunnelType::Http,
            subdomain: subdomain.to_string(),
            remote_port: None,
            local_addr: "localhost:3000".to_string(),
            public_url: format!("http://{subdomain}.localhost"),
            client_id: Uuid::new_v4().to_string(),
            persistent: false,
        });
        handle
    }

    fn tcp_handle(port: u16, user_id: Uuid) -> Arc<TunnelHandle> {
        let (handle, _rx) = TunnelHandle::new(TunnelMeta {
            id: Uuid::new_v4(),
            user_id,
            token_id: Uuid::new_v4(),
            organization_id: None,
            tunnel_type: TunnelType::Tcp,
            subdomain: String::new(),
            remote_port: Some(port),
            local_addr: "localhost:5432".to_string(),
            public_url: format!("tcp://localhost:{port}"),
            client_id: Uuid::new_v4().to_string(),
            persistent: false,
        });
        handle
    }

    #[test]
    fn test_insert_and_lookup_by_subdomain() {
        let registry = TunnelRegistry::new();
        let handle = http_handle("api-acme", Uuid::new_v4());
        let id = handle.meta.id;

        registry.insert(handle).unwrap();

        let found = registry.find_by_subdomain("api-acme").unwrap();
        assert_eq!(found.meta.id, id);
        assert!(registry.find_by_subdomain("other").is_none());
    }

    #[test]
    fn test_insert_and_lookup_by_port() {
        let registry = TunnelRegistry::new();
        let handle = tcp_handle(10500, Uuid::new_v4());
        let id = handle.meta.id;

        registry.insert(handle).unwrap();

        assert_eq!(registry.find_by_port(10500).unwrap().meta.id, id);
        assert!(registry.find_by_port(10501).is_none());
        // TCP tunnels do not occupy the subdomain index
        assert!(!registry.subdomain_in_use(""));
    }

    #[test]
    fn test_subdomain_collision() {
        let registry = TunnelRegistry::new();
        registry.insert(http_handle("api-acme", Uuid::new_v4())).unwrap();

        let result = registry.insert(http_handle("api-acme", Uuid::new_v4()));
        assert!(matches!(result, Err(RegistryError::SubdomainTaken(_))));
        // Failed insert left no partial state
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_collision_clears_after_remove() {
        let registry = TunnelRegistry::new();
        let first = http_handle("api-acme", Uuid::new_v4());
        let first_id = first.meta.id;
        registry.insert(first).unwrap();

        assert!(matches!(
            registry.insert(http_handle("api-acme", Uuid::new_v4())),
            Err(RegistryError::SubdomainTaken(_))
        ));

        registry.remove(first_id).unwrap();

        // Retry succeeds once the first tunnel is gone
        registry.insert(http_handle("api-acme", Uuid::new_v4())).unwrap();
    }

    #[test]
    fn test_port_collision() {
        let registry = TunnelRegistry::new();
        registry.insert(tcp_handle(10500, Uuid::new_v4())).unwrap();

        let result = registry.insert(tcp_handle(10500, Uuid::new_v4()));
        assert!(matches!(result, Err(RegistryError::PortTaken(10500))));
    }

    #[test]
    fn test_remove_clears_indexes() {
        let registry = TunnelRegistry::new();
        let handle = tcp_handle(10500, Uuid::new_v4());
        let id = handle.meta.id;
        registry.insert(handle).unwrap();

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.meta.id, id);
        assert!(registry.find_by_port(10500).is_none());
        assert!(registry.get(id).is_none());
        assert_eq!(registry.count(), 0);

        // Double remove is a no-op
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_count_for_user() {
        let registry = TunnelRegistry::new();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        registry.insert(http_handle("a-acme", user)).unwrap();
        registry.insert(http_handle("b-acme", user)).unwrap();
        registry.insert(http_handle("c-acme", other)).unwrap();

        assert_eq!(registry.count_for_user(user), 2);
        assert_eq!(registry.count_for_user(other), 1);
        assert_eq!(registry.count_for_user(Uuid::new_v4()), 0);
    }

    #[test]
    fn test_live_ports() {
        let registry = TunnelRegistry::new();
        registry.insert(tcp_handle(10500, Uuid::new_v4())).unwrap();
        registry.insert(tcp_handle(10501, Uuid::new_v4())).unwrap();

        let mut ports = registry.live_ports();
        ports.sort_unstable();
        assert_eq!(ports, vec![10500, 10501]);
    }
}
