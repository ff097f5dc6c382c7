//! Ordered Entry List Module
//!
//! Arena-backed doubly-linked list of cache entries ordered by deadline.

use tokio::time::Instant;

use crate::cache::{Entry, EntryId, SweepStats};

// == Slot ==
#[derive(Debug)]
struct Slot<P> {
    generation: u32,
    entry: Option<Entry<P>>,
}

// == Entry List ==
/// Owns cache entries and keeps the expirable ones in deadline order.
///
/// Entries live in an arena addressed by [`EntryId`]. Linked entries form a
/// doubly-linked sequence where:
/// - Head = earliest deadline
/// - Tail = latest deadline
///
/// Every deadline change goes through [`requeue`](Self::requeue), so the
/// sequence stays sorted without ever comparing deadlines.
#[derive(Debug)]
pub struct EntryList<P> {
    slots: Vec<Slot<P>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    /// Number of linked entries
    len: usize,
    /// Number of stored entries, linked or not
    stored: usize,
    stats: SweepStats,
}

impl<P> EntryList<P> {
    // == Constructor ==
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            stored: 0,
            stats: SweepStats::new(),
        }
    }

    // == Reset ==
    /// Drops every entry and empties the ordering.
    ///
    /// Handles issued before the reset stop resolving.
    pub fn reset(&mut self) {
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
            self.free.push(index as u32);
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
        self.stored = 0;
    }

    // == Insert ==
    /// Stores a new unlinked entry and returns its handle.
    pub fn insert(&mut self, key: impl Into<String>, payload: P, deadline: Instant) -> EntryId {
        let entry = Entry::new(key.into(), payload, deadline);
        self.stored += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return EntryId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        EntryId {
            index,
            generation: 0,
        }
    }

    // == Take ==
    /// Unlinks and frees an entry, returning it to the caller.
    pub fn take(&mut self, id: EntryId) -> Option<Entry<P>> {
        if !self.contains(id) {
            return None;
        }
        self.detach(id.index);

        let slot = &mut self.slots[id.index as usize];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.stored -= 1;
        Some(entry)
    }

    // == Link Tail ==
    /// Appends an unlinked entry at the tail.
    ///
    /// Returns false if the handle is stale or the entry is already linked.
    pub fn link_tail(&mut self, id: EntryId) -> bool {
        match self.get(id) {
            Some(entry) if !entry.linked => {
                self.attach_tail(id.index);
                true
            }
            _ => false,
        }
    }

    // == Unlink ==
    /// Removes an entry from the ordering while keeping it stored.
    pub fn unlink(&mut self, id: EntryId) -> bool {
        match self.get(id) {
            Some(entry) if entry.linked => {
                self.detach(id.index);
                true
            }
            _ => false,
        }
    }

    // == Requeue ==
    /// Moves a linked entry to the tail. Unlinked entries are left alone.
    pub fn requeue(&mut self, id: EntryId) {
        if self.unlink(id) {
            self.attach_tail(id.index);
        }
    }

    // == Lookup ==
    pub fn get(&self, id: EntryId) -> Option<&Entry<P>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?
            .entry
            .as_ref()
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry<P>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?
            .entry
            .as_mut()
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.get(id).is_some()
    }

    /// Handle of the entry with the earliest deadline.
    pub fn head(&self) -> Option<EntryId> {
        self.head.map(|index| self.id_of(index))
    }

    /// Handle of the entry following `id` in deadline order.
    pub fn next(&self, id: EntryId) -> Option<EntryId> {
        let entry = self.get(id).filter(|entry| entry.linked)?;
        entry.next.map(|index| self.id_of(index))
    }

    // == Expire Walk ==
    /// Visits linked entries from the head until `visit` returns false.
    ///
    /// The successor is read before `visit` runs, so the callback may requeue
    /// the visited entry. The walk covers at most the entries linked when it
    /// started, which keeps requeued entries from being visited twice.
    ///
    /// Returns the number of entries for which `visit` returned true.
    pub fn expire_walk<F>(&mut self, mut visit: F) -> usize
    where
        F: FnMut(&mut Self, EntryId) -> bool,
    {
        let budget = self.len;
        let mut cursor = self.head;
        let mut processed = 0;

        for _ in 0..budget {
            let Some(index) = cursor else { break };
            let next = match self.slots[index as usize].entry.as_ref() {
                Some(entry) if entry.linked => entry.next,
                _ => break,
            };
            let id = self.id_of(index);
            cursor = next;

            if !visit(self, id) {
                break;
            }
            processed += 1;
        }

        processed
    }

    // == Iteration ==
    /// Iterates linked entries from head to tail.
    pub fn iter(&self) -> Iter<'_, P> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Deadlines of linked entries from head to tail.
    pub fn deadlines(&self) -> impl Iterator<Item = Instant> + '_ {
        self.iter().map(|(_, entry)| entry.deadline)
    }

    // == Length ==
    /// Returns the number of entries taking part in the sweep.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of stored entries, expirable or not.
    pub fn stored(&self) -> usize {
        self.stored
    }

    // == Stats ==
    pub fn stats(&self) -> SweepStats {
        self.stats.clone()
    }

    pub(crate) fn stats_mut(&mut self) -> &mut SweepStats {
        &mut self.stats
    }

    // -- Internal helpers --

    fn id_of(&self, index: u32) -> EntryId {
        EntryId {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut Entry<P> {
        self.slots[index as usize]
            .entry
            .as_mut()
            .expect("linked slot is vacant")
    }

    fn attach_tail(&mut self, index: u32) {
        let old_tail = self.tail;
        {
            let node = self.node_mut(index);
            node.prev = old_tail;
            node.next = None;
            node.linked = true;
        }
        match old_tail {
            Some(tail) => self.node_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    fn detach(&mut self, index: u32) {
        let (prev, next) = match self.slots[index as usize].entry.as_mut() {
            Some(node) if node.linked => {
                node.linked = false;
                (node.prev.take(), node.next.take())
            }
            _ => return,
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }
}

impl<P> Default for EntryList<P> {
    fn default() -> Self {
        Self::new()
    }
}

// == Iterator ==
pub struct Iter<'a, P> {
    list: &'a EntryList<P>,
    cursor: Option<u32>,
}

impl<'a, P> Iterator for Iter<'a, P> {
    type Item = (EntryId, &'a Entry<P>);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = self.list.slots.get(index as usize)?;
        let entry = slot.entry.as_ref()?;
        self.cursor = entry.next;
        Some((
            EntryId {
                index,
                generation: slot.generation,
            },
            entry,
        ))
    }
}
