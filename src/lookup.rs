//! Per-worker connection lookup table.
//!
//! Maps (interface, local address, remote address, local port, remote
//! port) to a control block handle. Listening control blocks are inserted
//! with the wildcard remote (0.0.0.0:0); [`ConnectionTable::find`] falls
//! back to the wildcard entry when no exact match exists, which is how an
//! incoming SYN reaches its listener. Storage is a plain `HashMap`; the
//! hashing strategy is not part of the contract.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::packet::FlowTuple;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TableKey {
    interface: u32,
    flow: FlowTuple,
}

/// Connection lookup table, one per worker. `T` is the handle type stored
/// per connection.
#[derive(Debug)]
pub struct ConnectionTable<T> {
    entries: HashMap<TableKey, T>,
}

impl<T: Copy> ConnectionTable<T> {
    /// Creates an empty table.
    pub fn new() -> ConnectionTable<T> {
        ConnectionTable {
            entries: HashMap::new(),
        }
    }

    /// Number of entries, wildcard listeners included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up the handle for `flow` on `interface`: exact match first,
    /// then the wildcard-remote listener entry.
    pub fn find(&self, interface: u32, flow: FlowTuple) -> Option<T> {
        let key = TableKey { interface, flow };
        if let Some(&handle) = self.entries.get(&key) {
            return Some(handle);
        }

        let listen_key = TableKey {
            interface,
            flow: Self::wildcard(flow),
        };
        self.entries.get(&listen_key).copied()
    }

    /// Inserts `handle` under the exact tuple.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry for the tuple already exists.
    pub fn insert(&mut self, interface: u32, flow: FlowTuple, handle: T) -> Result<()> {
        let key = TableKey { interface, flow };
        if self.entries.contains_key(&key) {
            return Err(Error::DuplicateConnection);
        }

        self.entries.insert(key, handle);
        Ok(())
    }

    /// Removes the entry for the exact tuple, returning the handle if one
    /// was present.
    pub fn remove(&mut self, interface: u32, flow: FlowTuple) -> Option<T> {
        self.entries.remove(&TableKey { interface, flow })
    }

    fn wildcard(flow: FlowTuple) -> FlowTuple {
        FlowTuple {
            local_addr: flow.local_addr,
            remote_addr: Ipv4Addr::UNSPECIFIED,
            local_port: flow.local_port,
            remote_port: 0,
        }
    }
}

impl<T: Copy> Default for ConnectionTable<T> {
    fn default() -> ConnectionTable<T> {
        ConnectionTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(remote_port: u16) -> FlowTuple {
        FlowTuple {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            local_port: 80,
            remote_port,
        }
    }

    #[test]
    fn exact_match_wins_over_listener() {
        let mut table = ConnectionTable::new();

        let listen = FlowTuple {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            remote_addr: Ipv4Addr::UNSPECIFIED,
            local_port: 80,
            remote_port: 0,
        };
        table.insert(0, listen, 1u32).unwrap();
        table.insert(0, flow(4242), 2u32).unwrap();

        assert_eq!(table.find(0, flow(4242)), Some(2));
        // Unknown remote falls back to the listener.
        assert_eq!(table.find(0, flow(9999)), Some(1));
        // Different interface sees neither.
        assert_eq!(table.find(1, flow(4242)), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut table = ConnectionTable::new();

        table.insert(0, flow(4242), 1u32).unwrap();
        assert!(matches!(
            table.insert(0, flow(4242), 2u32),
            Err(Error::DuplicateConnection)
        ));

        assert_eq!(table.remove(0, flow(4242)), Some(1));
        assert_eq!(table.remove(0, flow(4242)), None);
        assert!(table.is_empty());
    }
}
