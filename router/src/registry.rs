//! Fixed-capacity flow tables.
//!
//! Slots are reused through a free list; every reuse bumps the slot's
//! generation so a handle held by an in-flight host operation can never
//! reach the flow that replaced its own.

use std::fmt;

use crate::packet::{IP_PROTO_ICMP, IP_PROTO_TCP, IP_PROTO_UDP};

/// Generation-checked handle into a [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

pub type ConnId = SlotId;
pub type ListenerId = SlotId;
pub type SessionId = SlotId;

/// Lookup key: protocol plus guest-side and remote ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: u8,
    pub local_port: u16,
    pub remote_port: u16,
}

impl FlowKey {
    pub fn tcp(local_port: u16, remote_port: u16) -> Self {
        FlowKey {
            protocol: IP_PROTO_TCP,
            local_port,
            remote_port,
        }
    }

    pub fn udp(local_port: u16, remote_port: u16) -> Self {
        FlowKey {
            protocol: IP_PROTO_UDP,
            local_port,
            remote_port,
        }
    }

    pub fn icmp() -> Self {
        FlowKey {
            protocol: IP_PROTO_ICMP,
            local_port: 0,
            remote_port: 0,
        }
    }
}

pub trait Flow {
    fn key(&self) -> FlowKey;

    /// Permanent entries are never evicted.
    fn permanent(&self) -> bool {
        false
    }

    /// Whether a new flow on the same local port may evict this entry.
    fn yields_local_port(&self) -> bool {
        !self.permanent()
    }
}

/// Result of [`Registry::claim`].
#[derive(Debug)]
pub enum Claim<T> {
    Existing(SlotId),
    /// No entry for the key. `stale` holds entries that shared the local
    /// port and were removed; the caller must close them.
    Vacant { stale: Vec<(SlotId, T)> },
}

struct Entry<T> {
    stamp: u64,
    value: T,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

pub struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    len: usize,
    next_stamp: u64,
}

impl<T: Flow> Registry<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            capacity: capacity.max(1),
            len: 0,
            next_stamp: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn find(&self, key: FlowKey) -> Option<SlotId> {
        self.iter().find(|(_, v)| v.key() == key).map(|(id, _)| id)
    }

    /// Looks `key` up; when absent, evicts every entry of the same protocol
    /// on its local port that [`Flow::yields_local_port`].
    pub fn claim(&mut self, key: FlowKey) -> Claim<T> {
        if let Some(id) = self.find(key) {
            return Claim::Existing(id);
        }
        let colliding: Vec<SlotId> = self
            .iter()
            .filter(|(_, v)| {
                let k = v.key();
                v.yields_local_port() && k.protocol == key.protocol && k.local_port == key.local_port
            })
            .map(|(id, _)| id)
            .collect();
        let stale = colliding
            .into_iter()
            .filter_map(|id| self.remove(id).map(|v| (id, v)))
            .collect();
        Claim::Vacant { stale }
    }

    /// Inserts `value`. A full table first evicts its oldest non-permanent
    /// entry, which is returned so the caller can close it.
    pub fn insert(&mut self, value: T) -> (SlotId, Option<(SlotId, T)>) {
        let evicted = if self.len >= self.capacity {
            self.oldest_evictable()
                .and_then(|id| self.remove(id).map(|v| (id, v)))
        } else {
            None
        };

        let stamp = self.next_stamp;
        self.next_stamp += 1;
        let entry = Some(Entry { stamp, value });

        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.entry = entry;
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry,
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.len += 1;

        let id = SlotId {
            index,
            generation: self.slots[index as usize].generation,
        };
        (id, evicted)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_ref())
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_mut())
            .map(|e| &mut e.value)
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        self.free.push(id.index);
        self.len -= 1;
        Some(entry.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|e| {
                (
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    &e.value,
                )
            })
        })
    }

    /// Snapshot of live handles, for passes that mutate while walking.
    pub fn ids(&self) -> Vec<SlotId> {
        self.iter().map(|(id, _)| id).collect()
    }

    fn oldest_evictable(&self) -> Option<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.entry.as_ref()?;
                if entry.value.permanent() {
                    return None;
                }
                Some((
                    entry.stamp,
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                ))
            })
            .min_by_key(|(stamp, _)| *stamp)
            .map(|(_, id)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TestFlow {
        key: FlowKey,
        permanent: bool,
        shares_port: bool,
    }

    impl Flow for TestFlow {
        fn key(&self) -> FlowKey {
            self.key
        }

        fn permanent(&self) -> bool {
            self.permanent
        }

        fn yields_local_port(&self) -> bool {
            !self.permanent && !self.shares_port
        }
    }

    fn udp(local: u16, remote: u16) -> TestFlow {
        TestFlow {
            key: FlowKey::udp(local, remote),
            permanent: false,
            shares_port: false,
        }
    }

    #[test]
    fn test_find_and_remove() {
        let mut reg = Registry::with_capacity(4);
        let (a, _) = reg.insert(udp(1000, 53));
        let (b, _) = reg.insert(udp(1001, 53));

        assert_eq!(reg.find(FlowKey::udp(1000, 53)), Some(a));
        assert_eq!(reg.find(FlowKey::udp(1001, 53)), Some(b));
        assert_eq!(reg.find(FlowKey::tcp(1000, 53)), None);

        assert!(reg.remove(a).is_some());
        assert!(reg.remove(a).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_stale_handle_does_not_reach_reused_slot() {
        let mut reg = Registry::with_capacity(2);
        let (old, _) = reg.insert(udp(1000, 53));
        reg.remove(old);
        let (new, _) = reg.insert(udp(2000, 53));

        assert_ne!(old, new);
        assert!(reg.get(old).is_none());
        assert_eq!(reg.get(new).map(|f| f.key), Some(FlowKey::udp(2000, 53)));
    }

    #[test]
    fn test_claim_evicts_local_port_reuse() {
        let mut reg = Registry::with_capacity(8);
        let (old, _) = reg.insert(udp(1000, 53));
        reg.insert(udp(1001, 53));
        reg.insert(TestFlow {
            key: FlowKey::tcp(1000, 80),
            permanent: false,
            shares_port: false,
        });

        match reg.claim(FlowKey::udp(1000, 123)) {
            Claim::Vacant { stale } => {
                assert_eq!(stale.len(), 1);
                assert_eq!(stale[0].0, old);
            }
            Claim::Existing(_) => panic!("expected vacant"),
        }
        // other protocol on the same port is untouched
        assert!(reg.find(FlowKey::tcp(1000, 80)).is_some());
        assert_eq!(reg.len(), 2);

        let (id, _) = reg.insert(udp(1000, 123));
        assert!(matches!(reg.claim(FlowKey::udp(1000, 123)), Claim::Existing(e) if e == id));
    }

    #[test]
    fn test_claim_keeps_entries_sharing_local_port() {
        let mut reg = Registry::with_capacity(8);
        let (shared, _) = reg.insert(TestFlow {
            key: FlowKey::tcp(8080, 61000),
            permanent: false,
            shares_port: true,
        });

        match reg.claim(FlowKey::tcp(8080, 443)) {
            Claim::Vacant { stale } => assert!(stale.is_empty()),
            Claim::Existing(_) => panic!("expected vacant"),
        }
        assert!(reg.get(shared).is_some());
    }

    #[test]
    fn test_full_table_evicts_oldest_non_permanent() {
        let mut reg = Registry::with_capacity(3);
        reg.insert(TestFlow {
            key: FlowKey::icmp(),
            permanent: true,
            shares_port: false,
        });
        let (first, _) = reg.insert(udp(1000, 53));
        reg.insert(udp(1001, 53));

        let (_, evicted) = reg.insert(udp(1002, 53));
        let (id, flow) = evicted.expect("table was full");
        assert_eq!(id, first);
        assert_eq!(flow.key, FlowKey::udp(1000, 53));
        assert_eq!(reg.len(), 3);
        assert!(reg.find(FlowKey::icmp()).is_some());
    }
}
