//! Virtual IP address management
//!
//! Allocates per-peer /32 addresses out of the base subnet, one /24 at a
//! time. Allocation order is deterministic: every host that processes the
//! same party roster in the same order converges on the same addresses,
//! which is what keeps allowed-ips consistent across the mesh.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use ipnet::Ipv4Net;

use crate::error::IpamError;

/// Virtual IP allocator for one base subnet
pub struct Ipam {
    state: Mutex<IpamState>,
}

struct IpamState {
    base: Ipv4Net,
    /// Materialized /24s, in allocation order
    subnets: Vec<SubnetState>,
    by_peer: HashMap<String, Ipv4Addr>,
    by_ip: HashMap<Ipv4Addr, String>,
    /// Permanently unavailable addresses (network/broadcast of each /24,
    /// plus anything reserved explicitly)
    reserved: BTreeSet<Ipv4Addr>,
}

struct SubnetState {
    net: Ipv4Net,
    /// Offset of the next untried host address from the subnet's network
    cursor: u32,
    /// Released addresses, reusable lowest-first
    freed: BTreeSet<Ipv4Addr>,
}

impl SubnetState {
    fn new(net: Ipv4Net) -> Self {
        SubnetState {
            net,
            cursor: 1,
            freed: BTreeSet::new(),
        }
    }

    fn host_count(&self) -> u32 {
        // /24 → 254 usable hosts
        (1u32 << (32 - self.net.prefix_len())) - 2
    }
}

impl Ipam {
    pub fn new(base: Ipv4Net) -> Self {
        Ipam {
            state: Mutex::new(IpamState {
                base,
                subnets: Vec::new(),
                by_peer: HashMap::new(),
                by_ip: HashMap::new(),
                reserved: BTreeSet::new(),
            }),
        }
    }

    /// Allocate a virtual IP for `peer_id`
    ///
    /// Idempotent: a peer that already holds an address gets the same one
    /// back. Scans released addresses lowest-first, then the cursor of the
    /// newest /24, materializing further /24s from the base subnet on
    /// demand.
    pub fn allocate(&self, peer_id: &str) -> Result<Ipv4Addr, IpamError> {
        let mut state = self.state.lock().expect("ipam lock");

        if let Some(ip) = state.by_peer.get(peer_id) {
            return Ok(*ip);
        }

        if state.subnets.is_empty() {
            state.materialize_next()?;
        }

        loop {
            // released addresses first, in subnet order
            let freed = state.subnets.iter().find_map(|s| s.freed.iter().next().copied());
            if let Some(ip) = freed {
                for subnet in state.subnets.iter_mut() {
                    subnet.freed.remove(&ip);
                }
                state.assign(peer_id, ip);
                return Ok(ip);
            }

            // then the scan cursor of the newest /24
            let last = state.subnets.len() - 1;
            let (network, hosts, cursor) = {
                let subnet = &state.subnets[last];
                (u32::from(subnet.net.network()), subnet.host_count(), subnet.cursor)
            };
            let mut offset = cursor;
            while offset <= hosts {
                let candidate = Ipv4Addr::from(network + offset);
                offset += 1;
                if state.reserved.contains(&candidate) || state.by_ip.contains_key(&candidate) {
                    continue;
                }
                state.subnets[last].cursor = offset;
                state.assign(peer_id, candidate);
                return Ok(candidate);
            }
            state.subnets[last].cursor = offset;

            state.materialize_next()?;
        }
    }

    /// Release a peer's address back into its /24's free pool. Idempotent.
    pub fn release(&self, peer_id: &str) {
        let mut state = self.state.lock().expect("ipam lock");
        let Some(ip) = state.by_peer.remove(peer_id) else {
            return;
        };
        state.by_ip.remove(&ip);
        if let Some(subnet) = state.subnets.iter_mut().find(|s| s.net.contains(&ip)) {
            subnet.freed.insert(ip);
        }
        tracing::debug!(peer_id, virtual_ip = %ip, "Released virtual IP");
    }

    /// Mark an address permanently unavailable
    pub fn reserve(&self, ip: Ipv4Addr) -> Result<(), IpamError> {
        let mut state = self.state.lock().expect("ipam lock");
        if !state.base.contains(&ip) {
            return Err(IpamError::OutOfRange {
                ip: ip.to_string(),
                subnet: state.base.to_string(),
            });
        }
        state.reserved.insert(ip);
        for subnet in state.subnets.iter_mut() {
            subnet.freed.remove(&ip);
        }
        Ok(())
    }

    pub fn lookup(&self, peer_id: &str) -> Option<Ipv4Addr> {
        self.state.lock().expect("ipam lock").by_peer.get(peer_id).copied()
    }

    pub fn lookup_peer(&self, ip: Ipv4Addr) -> Option<String> {
        self.state.lock().expect("ipam lock").by_ip.get(&ip).cloned()
    }

    /// Number of active allocations
    pub fn allocated(&self) -> usize {
        self.state.lock().expect("ipam lock").by_peer.len()
    }
}

impl IpamState {
    fn assign(&mut self, peer_id: &str, ip: Ipv4Addr) {
        self.by_peer.insert(peer_id.to_string(), ip);
        self.by_ip.insert(ip, peer_id.to_string());
        tracing::debug!(peer_id, virtual_ip = %ip, "Allocated virtual IP");
    }

    /// Materialize the next /24 of the base subnet
    fn materialize_next(&mut self) -> Result<(), IpamError> {
        let next = self
            .base
            .subnets(24)
            .expect("base prefix validated at configuration time")
            .nth(self.subnets.len())
            .ok_or_else(|| IpamError::PoolExhausted {
                subnet: self.base.to_string(),
            })?;
        self.reserved.insert(next.network());
        self.reserved.insert(next.broadcast());
        self.subnets.push(SubnetState::new(next));
        tracing::debug!(subnet = %next, "Materialized sub-subnet");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipam() -> Ipam {
        Ipam::new("10.66.0.0/16".parse().unwrap())
    }

    #[test]
    fn test_first_allocation_is_first_host() {
        let pool = ipam();
        assert_eq!(pool.allocate("a").unwrap(), Ipv4Addr::new(10, 66, 0, 1));
        assert_eq!(pool.allocate("b").unwrap(), Ipv4Addr::new(10, 66, 0, 2));
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let pool = ipam();
        let first = pool.allocate("a").unwrap();
        assert_eq!(pool.allocate("a").unwrap(), first);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_release_then_reallocate_yields_same_ip() {
        let pool = ipam();
        pool.allocate("a").unwrap();
        let b = pool.allocate("b").unwrap();
        pool.allocate("c").unwrap();

        pool.release("b");
        assert_eq!(pool.allocate("b").unwrap(), b);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = ipam();
        pool.allocate("a").unwrap();
        pool.release("a");
        pool.release("a");
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_released_ip_is_reused_before_cursor() {
        let pool = ipam();
        let a = pool.allocate("a").unwrap();
        pool.allocate("b").unwrap();
        pool.release("a");

        // lowest freed address wins over the cursor position
        assert_eq!(pool.allocate("c").unwrap(), a);
    }

    #[test]
    fn test_reserved_ip_is_skipped() {
        let pool = ipam();
        pool.reserve(Ipv4Addr::new(10, 66, 0, 1)).unwrap();
        assert_eq!(pool.allocate("a").unwrap(), Ipv4Addr::new(10, 66, 0, 2));
    }

    #[test]
    fn test_reserve_out_of_range_is_rejected() {
        let pool = ipam();
        let err = pool.reserve(Ipv4Addr::new(192, 168, 1, 1)).unwrap_err();
        assert!(matches!(err, IpamError::OutOfRange { .. }));
    }

    #[test]
    fn test_lookup_both_directions() {
        let pool = ipam();
        let ip = pool.allocate("a").unwrap();
        assert_eq!(pool.lookup("a"), Some(ip));
        assert_eq!(pool.lookup_peer(ip).as_deref(), Some("a"));
        assert_eq!(pool.lookup("missing"), None);
        assert_eq!(pool.lookup_peer(Ipv4Addr::new(10, 66, 9, 9)), None);
    }

    #[test]
    fn test_exhausting_a_slash_24_expands_into_the_next() {
        let pool = ipam();
        for i in 0..254 {
            pool.allocate(&format!("peer-{i}")).unwrap();
        }
        assert_eq!(
            pool.lookup("peer-253").unwrap(),
            Ipv4Addr::new(10, 66, 0, 254)
        );
        // 255th allocation lands in the next /24
        assert_eq!(
            pool.allocate("peer-254").unwrap(),
            Ipv4Addr::new(10, 66, 1, 1)
        );
    }

    #[test]
    fn test_pool_exhausted_on_final_subnet() {
        let pool = Ipam::new("10.66.0.0/24".parse().unwrap());
        for i in 0..254 {
            pool.allocate(&format!("peer-{i}")).unwrap();
        }
        let err = pool.allocate("one-too-many").unwrap_err();
        assert!(matches!(err, IpamError::PoolExhausted { .. }));
    }

    #[test]
    fn test_allocation_map_stays_injective() {
        let pool = ipam();
        let base: Ipv4Net = "10.66.0.0/16".parse().unwrap();
        let mut live: HashMap<String, Ipv4Addr> = HashMap::new();

        // interleaved allocate/release churn
        for round in 0..40u32 {
            let id = format!("peer-{}", round % 13);
            if round % 3 == 2 {
                pool.release(&id);
                live.remove(&id);
            } else {
                let ip = pool.allocate(&id).unwrap();
                assert!(base.contains(&ip), "{ip} escaped the base subnet");
                live.insert(id, ip);
            }

            let mut seen = BTreeSet::new();
            for ip in live.values() {
                assert!(seen.insert(*ip), "duplicate allocation of {ip}");
            }
        }
        assert_eq!(pool.allocated(), live.len());
    }

    #[test]
    fn test_fresh_pools_allocate_identically() {
        let left = ipam();
        let right = ipam();
        for id in ["red", "green", "blue", "cyan"] {
            assert_eq!(left.allocate(id).unwrap(), right.allocate(id).unwrap());
        }
    }
}
