use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::collections::HashMap;

use tracing::warn;

use crate::entry::TcpEntry;
use crate::listen::TcpListenEntry;
use crate::nat::{NatId, TcpNat};
use crate::pool::PortPool;
use crate::timer::{TimerEvent, TimerQueue};
use crate::{Endpoint, Tuple};

/// Tracked entries keyed by local endpoint, then remote endpoint.
#[derive(Debug, Default)]
pub struct TcpTable {
    entries: HashMap<Endpoint, HashMap<Endpoint, TcpEntry>>,
    len: usize,
}

impl TcpTable {
    /// Inserts `entry`, returning the entry previously stored under the same tuple.
    pub fn insert(&mut self, entry: TcpEntry) -> Option<TcpEntry> {
        let old = self
            .entries
            .entry(entry.local)
            .or_default()
            .insert(entry.remote, entry);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    pub fn get(&self, tuple: Tuple) -> Option<&TcpEntry> {
        self.entries.get(&tuple.local)?.get(&tuple.remote)
    }

    pub fn get_mut(&mut self, tuple: Tuple) -> Option<&mut TcpEntry> {
        self.entries.get_mut(&tuple.local)?.get_mut(&tuple.remote)
    }

    pub fn remove(&mut self, tuple: Tuple) -> Option<TcpEntry> {
        let by_remote = self.entries.get_mut(&tuple.local)?;
        let entry = by_remote.remove(&tuple.remote)?;
        if by_remote.is_empty() {
            self.entries.remove(&tuple.local);
        }
        self.len -= 1;
        Some(entry)
    }

    pub fn contains(&self, tuple: Tuple) -> bool {
        self.get(tuple).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tuples(&self) -> Vec<Tuple> {
        self.entries
            .values()
            .flat_map(|by_remote| by_remote.values().map(TcpEntry::tuple))
            .collect()
    }
}

/// Connection tracking state of one stack: listeners, tracked entries and NAT pairs.
#[derive(Debug, Default)]
pub struct Conntrack {
    listens: HashMap<Endpoint, TcpListenEntry>,
    tcp: TcpTable,
    nats: HashMap<NatId, TcpNat>,
    next_nat_id: u64,
}

fn wildcard(endpoint: Endpoint) -> Endpoint {
    let ip = match endpoint.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    Endpoint::new(ip, endpoint.port())
}

impl Conntrack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. A listener already bound to the same endpoint is replaced; its
    /// pending entries are removed from the table, destroyed and returned.
    pub fn listen_tcp(
        &mut self,
        entry: TcpListenEntry,
        timers: &mut TimerQueue<TimerEvent>,
    ) -> Vec<TcpEntry> {
        let listening = entry.listening();
        match self.listens.insert(listening, entry) {
            Some(mut old) => {
                warn!(%listening, "replacing existing tcp listener");
                self.destroy_pending(&mut old, timers)
            }
            None => Vec::new(),
        }
    }

    /// Finds the listener for `local`, falling back to the unspecified address of its family.
    pub fn lookup_tcp_listen(&self, local: Endpoint) -> Option<&TcpListenEntry> {
        self.listens
            .get(&local)
            .or_else(|| self.listens.get(&wildcard(local)))
    }

    pub fn lookup_tcp_listen_mut(&mut self, local: Endpoint) -> Option<&mut TcpListenEntry> {
        let key = if self.listens.contains_key(&local) {
            local
        } else {
            wildcard(local)
        };
        self.listens.get_mut(&key)
    }

    /// Removes the listener bound exactly to `listening` and destroys its pending entries.
    pub fn remove_tcp_listen(
        &mut self,
        listening: Endpoint,
        timers: &mut TimerQueue<TimerEvent>,
    ) -> Vec<TcpEntry> {
        match self.listens.remove(&listening) {
            Some(mut listen) => self.destroy_pending(&mut listen, timers),
            None => Vec::new(),
        }
    }

    fn destroy_pending(
        &mut self,
        listen: &mut TcpListenEntry,
        timers: &mut TimerQueue<TimerEvent>,
    ) -> Vec<TcpEntry> {
        listen
            .drain()
            .into_iter()
            .filter_map(|tuple| self.tcp.remove(tuple))
            .map(|mut entry| {
                entry.destroy(timers);
                entry
            })
            .collect()
    }

    pub fn insert_tcp(&mut self, entry: TcpEntry) -> Option<TcpEntry> {
        self.tcp.insert(entry)
    }

    pub fn lookup_tcp(&self, tuple: Tuple) -> Option<&TcpEntry> {
        self.tcp.get(tuple)
    }

    pub fn lookup_tcp_mut(&mut self, tuple: Tuple) -> Option<&mut TcpEntry> {
        self.tcp.get_mut(tuple)
    }

    pub fn remove_tcp(&mut self, tuple: Tuple) -> Option<TcpEntry> {
        self.tcp.remove(tuple)
    }

    pub fn count_tcp_entries(&self) -> usize {
        self.tcp.len()
    }

    pub fn tcp_table(&self) -> &TcpTable {
        &self.tcp
    }

    pub fn tcp_table_mut(&mut self) -> &mut TcpTable {
        &mut self.tcp
    }

    pub fn next_nat_id(&mut self) -> NatId {
        let id = NatId(self.next_nat_id);
        self.next_nat_id += 1;
        id
    }

    pub fn insert_nat(&mut self, nat: TcpNat) {
        self.nats.insert(nat.id(), nat);
    }

    pub fn nat(&self, id: NatId) -> Option<&TcpNat> {
        self.nats.get(&id)
    }

    pub fn nat_mut(&mut self, id: NatId) -> Option<&mut TcpNat> {
        self.nats.get_mut(&id)
    }

    pub fn count_nats(&self) -> usize {
        self.nats.len()
    }

    /// Tears down a NAT pair and both of its legs. Returns `false` if it was not tracked.
    pub fn destroy_nat(
        &mut self,
        id: NatId,
        timers: &mut TimerQueue<TimerEvent>,
        pool: &mut PortPool,
    ) -> bool {
        match self.nats.remove(&id) {
            Some(mut nat) => nat.destroy(&mut self.tcp, timers, pool),
            None => false,
        }
    }

    /// Destroys every listener, NAT pair and entry. Returns the destroyed entries that were
    /// not NAT legs.
    pub fn destroy_all(
        &mut self,
        timers: &mut TimerQueue<TimerEvent>,
        pool: &mut PortPool,
    ) -> Vec<TcpEntry> {
        let ids: Vec<NatId> = self.nats.keys().copied().collect();
        for id in ids {
            self.destroy_nat(id, timers, pool);
        }
        self.listens.clear();
        let mut destroyed = Vec::new();
        for tuple in self.tcp.tuples() {
            if let Some(mut entry) = self.tcp.remove(tuple) {
                entry.destroy(timers);
                destroyed.push(entry);
            }
        }
        destroyed
    }
}
