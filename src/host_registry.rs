//! Leases loopback IPs from a bounded, process-wide pool.

use crate::error::{HarnessError, Result};
use crate::ids::IpAddress;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Leases and releases unique loopback addresses. Shared process-wide and
/// thread-safe; an exhausted pool fails loudly rather than blocking.
#[derive(Debug)]
pub struct HostRegistry {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    available: Vec<IpAddress>,
    leased: HashSet<IpAddress>,
}

impl HostRegistry {
    /// Builds a registry over `127.0.<octet3>.2 .. 127.0.<octet3>.254` for a
    /// given third octet, yielding up to 253 addresses per octet.
    pub fn with_range(octet3: u8, count: u8) -> Self {
        let available = (2..=count.min(254))
            .map(|last| Ipv4Addr::new(127, 0, octet3, last))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                available,
                leased: HashSet::new(),
            }),
        }
    }

    pub fn new() -> Self {
        Self::with_range(0, 253)
    }

    /// Leases an address not currently leased. Fails if the pool is exhausted.
    pub fn lease_host(&self) -> Result<IpAddress> {
        let mut inner = self.inner.lock().expect("host registry mutex poisoned");
        let ip = inner.available.pop().ok_or(HarnessError::HostPoolExhausted)?;
        inner.leased.insert(ip);
        Ok(ip)
    }

    /// Returns a previously leased address to the pool.
    pub fn release_host(&self, ip: IpAddress) {
        let mut inner = self.inner.lock().expect("host registry mutex poisoned");
        if inner.leased.remove(&ip) {
            inner.available.push(ip);
        }
    }

    pub fn leased_count(&self) -> usize {
        self.inner.lock().expect("host registry mutex poisoned").leased.len()
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_are_unique_until_released() {
        let registry = HostRegistry::with_range(1, 2);
        let a = registry.lease_host().unwrap();
        let b = registry.lease_host().unwrap();
        assert_ne!(a, b);
        assert!(registry.lease_host().is_err());

        registry.release_host(a);
        let c = registry.lease_host().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn exhausted_pool_fails() {
        let registry = HostRegistry::with_range(1, 1);
        registry.lease_host().unwrap();
        assert!(matches!(
            registry.lease_host(),
            Err(HarnessError::HostPoolExhausted)
        ));
    }

    #[test]
    fn releasing_an_unleased_address_is_a_no_op() {
        let registry = HostRegistry::with_range(1, 1);
        registry.release_host(Ipv4Addr::new(127, 0, 1, 99));
        assert_eq!(registry.leased_count(), 0);
    }
}
