use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ProcError;

/// Availability check for a single candidate port.
pub type PortProbe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Probe a port by binding and immediately releasing it on loopback.
pub fn bind_probe(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

struct PoolInner {
    used: BTreeSet<u16>,
}

/// The set of ports reserved for preview servers, bounded by an inclusive
/// range.
///
/// Allocation holds the pool lock across the scan and the reservation, so
/// two concurrent callers can never receive the same port.
#[derive(Clone)]
pub struct PortPool {
    start: u16,
    end: u16,
    probe: PortProbe,
    inner: Arc<Mutex<PoolInner>>,
}

impl std::fmt::Debug for PortPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortPool")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("used", &self.inner.lock().used)
            .finish()
    }
}

impl PortPool {
    /// Create a pool that probes candidates with a real loopback bind.
    pub fn new(start: u16, end: u16) -> Self {
        Self::with_probe(start, end, Arc::new(bind_probe))
    }

    pub fn with_probe(start: u16, end: u16, probe: PortProbe) -> Self {
        Self {
            start,
            end,
            probe,
            inner: Arc::new(Mutex::new(PoolInner {
                used: BTreeSet::new(),
            })),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Reserve the lowest port in range that is neither reserved nor bound
    /// by anyone else.
    pub fn allocate(&self) -> Result<u16, ProcError> {
        let mut inner = self.inner.lock();
        for port in self.start..=self.end {
            if inner.used.contains(&port) {
                continue;
            }
            if !(self.probe)(port) {
                tracing::debug!(port, "port busy outside the pool, skipping");
                continue;
            }
            inner.used.insert(port);
            tracing::debug!(port, "port allocated");
            return Ok(port);
        }
        Err(ProcError::Allocation {
            start: self.start,
            end: self.end,
        })
    }

    /// Release a reservation. No-op if the port is not reserved.
    pub fn deallocate(&self, port: u16) {
        if self.inner.lock().used.remove(&port) {
            tracing::debug!(port, "port released");
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.inner.lock().used.contains(&port)
    }

    /// Sorted snapshot of reserved ports.
    pub fn reserved(&self) -> Vec<u16> {
        self.inner.lock().used.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn always_free() -> PortProbe {
        Arc::new(|_| true)
    }

    #[test]
    fn allocates_sequentially_from_range_start() {
        let pool = PortPool::with_probe(3000, 3005, always_free());
        assert_eq!(pool.allocate().unwrap(), 3000);
        assert_eq!(pool.allocate().unwrap(), 3001);
        assert_eq!(pool.reserved(), vec![3000, 3001]);
    }

    #[test]
    fn exhausted_range_fails_with_allocation_error() {
        let pool = PortPool::with_probe(3000, 3001, always_free());
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        let err = pool.allocate().unwrap_err();
        assert_eq!(err, ProcError::Allocation { start: 3000, end: 3001 });
    }

    #[test]
    fn skips_ports_failing_the_probe() {
        let pool = PortPool::with_probe(3000, 3003, Arc::new(|p| p != 3000 && p != 3001));
        assert_eq!(pool.allocate().unwrap(), 3002);
    }

    #[test]
    fn deallocate_makes_port_available_again() {
        let pool = PortPool::with_probe(3000, 3000, always_free());
        let port = pool.allocate().unwrap();
        assert!(pool.allocate().is_err());
        pool.deallocate(port);
        assert!(!pool.is_reserved(port));
        assert_eq!(pool.allocate().unwrap(), 3000);
    }

    #[test]
    fn deallocate_unknown_port_is_noop() {
        let pool = PortPool::with_probe(3000, 3001, always_free());
        pool.deallocate(4242);
        assert!(pool.reserved().is_empty());
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let pool = PortPool::with_probe(3000, 3063, always_free());
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.allocate().unwrap())
            })
            .collect();
        let ports: HashSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ports.len(), 64);
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn bind_probe_rejects_a_port_held_elsewhere() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!bind_probe(port));

        let pool = PortPool::new(port, port);
        assert!(pool.allocate().is_err());
        drop(listener);
        assert_eq!(pool.allocate().unwrap(), port);
    }
}
