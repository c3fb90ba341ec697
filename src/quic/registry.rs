//! Connection handles and the process-wide CID routing table
//!
//! Tables in this crate never hold a connection directly. They store a
//! `ConnectionHandle`, a slab index plus generation counter; once the owning
//! connection is removed from its `ConnectionRegistry`, stale handles stop
//! resolving instead of dangling.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::types::ConnectionId;

/// Non-owning reference to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

#[derive(Debug)]
struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
}

/// Generational slab of connections
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    slots: RwLock<Slots<T>>,
}

impl<T> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    pub fn insert(&self, value: T) -> ConnectionHandle {
        let mut slots = self.slots.write();
        let value = Some(Arc::new(value));

        if let Some(index) = slots.free.pop() {
            let slot = &mut slots.entries[index as usize];
            slot.value = value;
            return ConnectionHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = slots.entries.len() as u32;
        slots.entries.push(Slot { generation: 0, value });
        ConnectionHandle { index, generation: 0 }
    }

    /// Resolve a handle; `None` once the connection has been removed
    pub fn get(&self, handle: ConnectionHandle) -> Option<Arc<T>> {
        let slots = self.slots.read();
        let slot = slots.entries.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.clone()
    }

    pub fn remove(&self, handle: ConnectionHandle) -> Option<Arc<T>> {
        let mut slots = self.slots.write();
        let slot = slots.entries.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(handle.index);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.read().entries.iter().filter(|slot| slot.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes inbound packets by destination connection ID.
///
/// A connection ID maps to at most one connection at a time.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: DashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `cid`. Returns false if the CID is already routed somewhere.
    pub fn insert(&self, cid: ConnectionId, connection: ConnectionHandle) -> bool {
        match self.entries.entry(cid) {
            Entry::Occupied(entry) => {
                debug!("Connection ID {} already routed to {}", entry.key(), entry.get());
                false
            }
            Entry::Vacant(entry) => {
                trace!("Routing {} to {}", entry.key(), connection);
                entry.insert(connection);
                true
            }
        }
    }

    pub fn lookup(&self, cid: &ConnectionId) -> Option<ConnectionHandle> {
        self.entries.get(cid).map(|entry| *entry.value())
    }

    /// Remove the route for `cid` if it still points at `connection`
    pub fn remove(&self, cid: &ConnectionId, connection: ConnectionHandle) -> bool {
        self.entries
            .remove_if(cid, |_, owner| *owner == connection)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_live_handles() {
        let registry = ConnectionRegistry::new();
        let a = registry.insert("a");
        let b = registry.insert("b");

        assert_eq!(registry.get(a).as_deref(), Some(&"a"));
        assert_eq!(registry.get(b).as_deref(), Some(&"b"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_stale_handle_does_not_resolve_after_reuse() {
        let registry = ConnectionRegistry::new();
        let old = registry.insert(1u32);
        assert!(registry.remove(old).is_some());

        let new = registry.insert(2u32);
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        assert!(registry.get(old).is_none());
        assert!(registry.remove(old).is_none());
        assert_eq!(registry.get(new).as_deref(), Some(&2));
    }

    #[test]
    fn test_connection_table_refuses_duplicates() {
        let registry = ConnectionRegistry::new();
        let a = registry.insert(());
        let b = registry.insert(());
        let table = ConnectionTable::new();
        let cid = ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap();

        assert!(table.insert(cid.clone(), a));
        assert!(!table.insert(cid.clone(), b));
        assert_eq!(table.lookup(&cid), Some(a));

        // Only the owner can remove the route
        assert!(!table.remove(&cid, b));
        assert!(table.remove(&cid, a));
        assert!(table.lookup(&cid).is_none());
    }
}
