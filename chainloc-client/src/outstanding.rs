//! # Outstanding Query Table
//!
//! Purpose: Track the queries in flight on one connection, indexed two ways:
//! a generational slot map owning the queries, and a key multimap used only
//! for lookup.
//!
//! ## Design Principles
//! 1. **Stable Handles**: Results, timeouts, and requeries all refer to a
//!    query through a `QueryHandle`; a reused slot bumps its generation so a
//!    stale handle resolves to nothing instead of the wrong query.
//! 2. **Snapshot Iteration**: Callers iterate over a snapshot of handles, so
//!    removing while walking cannot invalidate anything.
//! 3. **Multimap Keys**: Several queries for one key may be outstanding at
//!    once (an interleaved GET and SET is normal); removal filters by kind.

use std::collections::HashMap;

use bytes::Bytes;
use chainloc_common::{DataKey, Query, QueryKind};

/// Stable reference to one entry in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueryHandle {
    index: u32,
    generation: u32,
}

/// A query in flight plus the exact bytes that were written for it, kept so
/// a reconnect can re-issue the unmodified request.
#[derive(Debug, Clone)]
pub(crate) struct PendingQuery {
    pub query: Query,
    pub request: Bytes,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    occupant: Option<PendingQuery>,
}

/// Per-connection table of in-flight queries.
#[derive(Debug, Default)]
pub(crate) struct OutstandingTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_key: HashMap<DataKey, Vec<QueryHandle>>,
    len: usize,
}

impl OutstandingTable {
    pub fn new() -> Self {
        OutstandingTable::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a pending query and returns its handle.
    pub fn insert(&mut self, pending: PendingQuery) -> QueryHandle {
        let key = pending.query.key;
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.occupant = Some(pending);
                QueryHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    occupant: Some(pending),
                });
                QueryHandle {
                    index,
                    generation: 0,
                }
            }
        };
        self.by_key.entry(key).or_default().push(handle);
        self.len += 1;
        handle
    }

    /// Removes the query behind `handle`, if it is still present.
    ///
    /// A stale handle (already removed, or its slot reused) is a no-op; this
    /// is what settles the race between a deadline firing and a response
    /// arriving.
    pub fn remove(&mut self, handle: QueryHandle) -> Option<PendingQuery> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.occupant.is_none() {
            return None;
        }
        let pending = slot.occupant.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;

        let key = pending.query.key;
        if let Some(handles) = self.by_key.get_mut(&key) {
            handles.retain(|h| *h != handle);
            if handles.is_empty() {
                self.by_key.remove(&key);
            }
        }
        Some(pending)
    }

    /// Returns a reference to the pending query behind `handle`.
    pub fn get(&self, handle: QueryHandle) -> Option<&PendingQuery> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.occupant.as_ref()
    }

    /// Removes and returns every outstanding query for `key` of the given
    /// kind. Queries of the other kind stay in the table.
    pub fn take_matching(&mut self, key: &DataKey, kind: QueryKind) -> Vec<PendingQuery> {
        let handles = match self.by_key.get(key) {
            Some(handles) => handles.clone(),
            None => return Vec::new(),
        };
        let mut taken = Vec::new();
        for handle in handles {
            let matches = self
                .get(handle)
                .map_or(false, |pending| pending.query.kind == kind);
            if matches {
                if let Some(pending) = self.remove(handle) {
                    taken.push(pending);
                }
            }
        }
        taken
    }

    /// Snapshot of every live handle, in slot order.
    pub fn handles(&self) -> Vec<QueryHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.occupant.is_some())
            .map(|(index, slot)| QueryHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainloc_common::{Entry, KEY_WIDTH};

    fn key(fill: u8) -> DataKey {
        DataKey::new(&[fill; KEY_WIDTH]).unwrap()
    }

    fn pending(query: Query) -> PendingQuery {
        PendingQuery {
            query,
            request: Bytes::new(),
        }
    }

    #[test]
    fn same_key_holds_both_kinds_until_matched() {
        let k = key(b'1');
        let mut table = OutstandingTable::new();
        table.insert(pending(Query::get(k)));
        table.insert(pending(Query::set(k, Entry::new(5), false, 0)));
        table.insert(pending(Query::get(k)));
        assert_eq!(table.len(), 3);

        let gets = table.take_matching(&k, QueryKind::Get);
        assert_eq!(gets.len(), 2);
        assert_eq!(table.len(), 1);

        // The SET for the same key is untouched.
        let sets = table.take_matching(&k, QueryKind::Set);
        assert_eq!(sets.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn stale_handle_is_a_no_op() {
        let k = key(b'2');
        let mut table = OutstandingTable::new();
        let handle = table.insert(pending(Query::get(k)));
        assert!(table.remove(handle).is_some());
        assert!(table.remove(handle).is_none());

        // The slot is reused with a new generation; the old handle stays dead.
        let fresh = table.insert(pending(Query::get(k)));
        assert!(table.remove(handle).is_none());
        assert!(table.get(handle).is_none());
        assert!(table.get(fresh).is_some());
    }

    #[test]
    fn handles_snapshot_survives_removals() {
        let mut table = OutstandingTable::new();
        let a = table.insert(pending(Query::get(key(b'3'))));
        let b = table.insert(pending(Query::get(key(b'4'))));
        let snapshot = table.handles();
        assert_eq!(snapshot.len(), 2);

        table.remove(a);
        // Walking the stale snapshot only resolves what is still live.
        let live: Vec<_> = snapshot
            .into_iter()
            .filter(|h| table.get(*h).is_some())
            .collect();
        assert_eq!(live, vec![b]);
    }

    #[test]
    fn take_matching_on_absent_key_is_empty() {
        let mut table = OutstandingTable::new();
        assert!(table.take_matching(&key(b'5'), QueryKind::Get).is_empty());
    }
}
