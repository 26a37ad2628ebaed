use core::net::IpAddr;
use core::ops::RangeInclusive;
use std::collections::HashSet;

use tracing::warn;

use crate::Endpoint;

/// Source address/port pool used by SNAT and FNAT.
#[derive(Debug, Clone)]
pub struct PortPool {
    ips: Vec<IpAddr>,
    ports: RangeInclusive<u16>,
    cursor: usize,
    in_use: HashSet<Endpoint>,
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new(Vec::new(), 1..=0)
    }
}

impl PortPool {
    pub fn new(ips: Vec<IpAddr>, ports: RangeInclusive<u16>) -> Self {
        Self {
            ips,
            ports,
            cursor: 0,
            in_use: HashSet::new(),
        }
    }

    fn port_count(&self) -> usize {
        if self.ports.is_empty() {
            0
        } else {
            (*self.ports.end() - *self.ports.start()) as usize + 1
        }
    }

    fn endpoint_at(&self, index: usize) -> Endpoint {
        let ports = self.port_count();
        let ip = self.ips[index / ports];
        let port = *self.ports.start() + (index % ports) as u16;
        Endpoint::new(ip, port)
    }

    /// Picks the next free endpoint, round robin, in the address family of `dst`.
    pub fn allocate(&mut self, dst: Endpoint) -> Option<Endpoint> {
        let total = self.ips.len() * self.port_count();
        for i in 0..total {
            let index = (self.cursor + i) % total;
            let candidate = self.endpoint_at(index);
            if candidate.is_ipv4() != dst.is_ipv4() || self.in_use.contains(&candidate) {
                continue;
            }
            self.cursor = (index + 1) % total;
            self.in_use.insert(candidate);
            return Some(candidate);
        }
        warn!(%dst, "unable to allocate a source address from the pool");
        None
    }

    pub fn release(&mut self, endpoint: Endpoint) -> bool {
        self.in_use.remove(&endpoint)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    pub fn is_allocated(&self, endpoint: Endpoint) -> bool {
        self.in_use.contains(&endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_and_exhaustion() {
        let mut pool = PortPool::new(vec!["192.0.2.1".parse().unwrap()], 1000..=1001);
        let dst: Endpoint = "198.51.100.1:80".parse().unwrap();
        let a = pool.allocate(dst).unwrap();
        let b = pool.allocate(dst).unwrap();
        assert_eq!(a.port(), 1000);
        assert_eq!(b.port(), 1001);
        assert_eq!(pool.allocate(dst), None);

        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert_eq!(pool.allocate(dst), Some(a));
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn matches_destination_family() {
        let mut pool = PortPool::new(
            vec!["192.0.2.1".parse().unwrap(), "fd00::1".parse().unwrap()],
            2000..=2000,
        );
        let v6 = pool.allocate("[fd00::2]:443".parse().unwrap()).unwrap();
        assert!(v6.is_ipv6());
        let v4 = pool.allocate("198.51.100.1:443".parse().unwrap()).unwrap();
        assert!(v4.is_ipv4());
        assert!(pool.allocate("198.51.100.1:443".parse().unwrap()).is_none());
    }

    #[test]
    fn empty_pool_never_allocates() {
        let mut pool = PortPool::default();
        assert!(pool.allocate("198.51.100.1:80".parse().unwrap()).is_none());
    }
}
