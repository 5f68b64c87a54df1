//! TCP port pool
//!
//! Manages a contiguous range of public ports. Persistent tunnels keep their
//! allocation across disconnects (a reservation); everything else returns to
//! the tail of the available queue on release.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Port pool errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("No available ports in pool")]
    NoAvailablePorts,

    #[error("Port {0} is held by another tunnel")]
    PortInUse(u16),

    #[error("Port {0} is outside the configured range")]
    OutOfRange(u16),
}

/// Pool utilization snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub start: u16,
    pub end: u16,
    pub total: usize,
    pub allocated: usize,
    pub available: usize,
    pub utilization: f64,
}

struct PoolState {
    allocated: HashMap<u16, Uuid>,
    by_tunnel: HashMap<Uuid, u16>,
    available: VecDeque<u16>,
}

/// Allocates and reserves public TCP ports in `[start, end]`.
pub struct PortPool {
    start: u16,
    end: u16,
    state: Mutex<PoolState>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            state: Mutex::new(PoolState {
                allocated: HashMap::new(),
                by_tunnel: HashMap::new(),
                available: (start..=end).collect(),
            }),
        }
    }

    /// Rebuild pool state from persisted tunnels at startup.
    ///
    /// `entries` are `(port, tunnel_id)` pairs from rows that are active, or
    /// persistent and offline. Ports outside the configured range (a previous
    /// deployment used a different range) stay allocated but never re-enter
    /// the available queue.
    pub fn rehydrate(start: u16, end: u16, entries: &[(u16, Uuid)]) -> Self {
        let pool = Self::new(start, end);
        {
            let mut state = pool.state.lock().unwrap();
            for &(port, tunnel_id) in entries {
                if state.allocated.contains_key(&port) {
                    warn!(port, tunnel_id = %tunnel_id, "Duplicate port during rehydrate, keeping first owner");
                    continue;
                }
                if port < start || port > end {
                    info!(port, tunnel_id = %tunnel_id, "Rehydrated port outside configured range");
                } else {
                    state.available.retain(|&p| p != port);
                }
                state.allocated.insert(port, tunnel_id);
                state.by_tunnel.insert(tunnel_id, port);
            }
        }
        pool
    }

    /// Allocate a port for a tunnel. Idempotent: a tunnel that already holds
    /// a port gets the same one back.
    pub fn allocate(&self, tunnel_id: Uuid) -> Result<u16, PoolError> {
        let mut state = self.state.lock().unwrap();

        if let Some(&port) = state.by_tunnel.get(&tunnel_id) {
            return Ok(port);
        }

        let port = state
            .available
            .pop_front()
            .ok_or(PoolError::NoAvailablePorts)?;
        state.allocated.insert(port, tunnel_id);
        state.by_tunnel.insert(tunnel_id, port);
        debug!(port, tunnel_id = %tunnel_id, "Allocated port");
        Ok(port)
    }

    /// Release a port when its tunnel disconnects.
    ///
    /// Persistent tunnels keep the reservation (no-op). Releasing a port
    /// nobody holds is a logged no-op.
    pub fn release(&self, port: u16, is_persistent: bool) -> Result<(), PoolError> {
        if port < self.start || port > self.end {
            return Err(PoolError::OutOfRange(port));
        }

        let mut state = self.state.lock().unwrap();

        if is_persistent {
            debug!(port, "Keeping port reservation for persistent tunnel");
            return Ok(());
        }

        match state.allocated.remove(&port) {
            Some(tunnel_id) => {
                state.by_tunnel.remove(&tunnel_id);
                state.available.push_back(port);
                debug!(port, tunnel_id = %tunnel_id, "Released port");
            }
            None => {
                warn!(port, "Release of unallocated port ignored");
            }
        }
        Ok(())
    }

    /// Re-bind a reconnecting persistent tunnel to its previous port.
    pub fn reallocate(&self, tunnel_id: Uuid, previous_port: u16) -> Result<u16, PoolError> {
        let mut state = self.state.lock().unwrap();

        match state.allocated.get(&previous_port) {
            Some(owner) if *owner == tunnel_id => Ok(previous_port),
            Some(_) => Err(PoolError::PortInUse(previous_port)),
            None => {
                state.available.retain(|&p| p != previous_port);
                state.allocated.insert(previous_port, tunnel_id);
                state.by_tunnel.insert(tunnel_id, previous_port);
                debug!(port = previous_port, tunnel_id = %tunnel_id, "Reclaimed port for reconnect");
                Ok(previous_port)
            }
        }
    }

    /// Port currently held by a tunnel, if any.
    pub fn port_for(&self, tunnel_id: Uuid) -> Option<u16> {
        self.state.lock().unwrap().by_tunnel.get(&tunnel_id).copied()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        let total = (self.end - self.start) as usize + 1;
        let allocated = state.allocated.len();
        PoolStats {
            start: self.start,
            end: self.end,
            total,
            allocated,
            available: state.available.len(),
            utilization: if total == 0 {
                0.0
            } else {
                allocated as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_round_trip() {
        let pool = PortPool::new(10000, 10002);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        assert_eq!(pool.allocate(a).unwrap(), 10000);
        assert_eq!(pool.allocate(b).unwrap(), 10001);

        pool.release(10000, false).unwrap();
        assert_eq!(pool.stats().available, 2);

        // 10000 went to the tail, so the next allocation takes 10002
        assert_eq!(pool.allocate(c).unwrap(), 10002);

        // No double-issue: remaining port is the released one
        let d = Uuid::new_v4();
        assert_eq!(pool.allocate(d).unwrap(), 10000);
        assert_eq!(pool.allocate(Uuid::new_v4()), Err(PoolError::NoAvailablePorts));
    }

    #[test]
    fn test_allocate_idempotent_per_tunnel() {
        let pool = PortPool::new(10000, 10001);
        let a = Uuid::new_v4();

        let first = pool.allocate(a).unwrap();
        let second = pool.allocate(a).unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_release_persistent_keeps_reservation() {
        let pool = PortPool::new(10500, 10501);
        let t = Uuid::new_v4();
        let port = pool.allocate(t).unwrap();

        pool.release(port, true).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.available, 1);

        // Reconnect binds back to the same port
        assert_eq!(pool.reallocate(t, port).unwrap(), port);
    }

    #[test]
    fn test_reallocate_conflict() {
        let pool = PortPool::new(10000, 10001);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let port = pool.allocate(a).unwrap();

        assert_eq!(pool.reallocate(b, port), Err(PoolError::PortInUse(port)));
    }

    #[test]
    fn test_reallocate_unallocated_claims() {
        let pool = PortPool::new(10000, 10002);
        let t = Uuid::new_v4();

        assert_eq!(pool.reallocate(t, 10001).unwrap(), 10001);
        // 10001 must not be issued to anyone else
        assert_eq!(pool.allocate(Uuid::new_v4()).unwrap(), 10000);
        assert_eq!(pool.allocate(Uuid::new_v4()).unwrap(), 10002);
        assert_eq!(pool.allocate(Uuid::new_v4()), Err(PoolError::NoAvailablePorts));
    }

    #[test]
    fn test_release_out_of_range() {
        let pool = PortPool::new(10000, 10001);
        assert_eq!(pool.release(20000, false), Err(PoolError::OutOfRange(20000)));
    }

    #[test]
    fn test_release_unallocated_is_noop() {
        let pool = PortPool::new(10000, 10001);
        pool.release(10000, false).unwrap();
        assert_eq!(pool.stats().available, 2);
        assert_eq!(pool.stats().allocated, 0);
    }

    #[test]
    fn test_rehydrate_in_range() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let pool = PortPool::rehydrate(10000, 10004, &[(10001, a), (10003, b)]);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.available, 3);
        // Invariant: allocated + available covers the range exactly
        assert_eq!(stats.allocated + stats.available, stats.total);

        assert_eq!(pool.port_for(a), Some(10001));
        assert_eq!(pool.allocate(a).unwrap(), 10001);
    }

    #[test]
    fn test_rehydrate_legacy_range() {
        let a = Uuid::new_v4();
        // Port 9000 comes from an older configuration
        let pool = PortPool::rehydrate(10000, 10002, &[(9000, a)]);

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.available, 3);

        // Legacy ports are out of range for release and never re-enter
        // the available queue
        assert_eq!(pool.release(9000, false), Err(PoolError::OutOfRange(9000)));
        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.available, 3);
    }

    #[test]
    fn test_stats_utilization() {
        let pool = PortPool::new(10000, 10003);
        pool.allocate(Uuid::new_v4()).unwrap();
        pool.allocate(Uuid::new_v4()).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total, 4);
        assert!((stats.utilization - 0.5).abs() < f64::EPSILON);
    }
}
