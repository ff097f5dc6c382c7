//! Keyed Map Module
//!
//! String-keyed lookup tables layered over a shared [`EntryList`].

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use crate::cache::{Entry, EntryId, EntryList};

// == Key Folding ==
/// Key normalization applied before every lookup, insert and delete.
pub trait KeyFold {
    fn fold(key: &str) -> Cow<'_, str>;
}

/// Keys match byte for byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exact;

impl KeyFold for Exact {
    fn fold(key: &str) -> Cow<'_, str> {
        Cow::Borrowed(key)
    }
}

/// Keys match regardless of case; they are stored upper-cased.
#[derive(Debug, Clone, Copy, Default)]
pub struct FoldCase;

impl KeyFold for FoldCase {
    fn fold(key: &str) -> Cow<'_, str> {
        Cow::Owned(key.to_uppercase())
    }
}

// == Key Map ==
/// Maps string keys to entries stored in an [`EntryList`].
///
/// The map only holds handles. Several maps can point into the same list, so
/// one sweep covers all of them.
pub struct KeyMap<F> {
    items: HashMap<String, EntryId>,
    _fold: PhantomData<F>,
}

/// Case-sensitive map.
pub type ExactMap = KeyMap<Exact>;

/// Case-insensitive map.
pub type FoldedMap = KeyMap<FoldCase>;

impl<F: KeyFold> KeyMap<F> {
    // == Constructor ==
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            _fold: PhantomData,
        }
    }

    // == Get ==
    /// Looks up the entry stored under `key`.
    pub fn get(&self, key: &str) -> Option<EntryId> {
        self.items.get(F::fold(key).as_ref()).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.items.contains_key(F::fold(key).as_ref())
    }

    // == Set ==
    /// Maps `key` to `id`, replacing any previous mapping.
    ///
    /// When `expirable` is set the entry is appended to the tail of the shared
    /// list, unless it is already linked, in which case it keeps its place;
    /// otherwise it stays visible to lookups but is never swept. A
    /// replaced entry is unlinked but stays stored, and its handle is returned
    /// so the caller can take it.
    pub fn set<P>(
        &mut self,
        list: &mut EntryList<P>,
        key: &str,
        id: EntryId,
        expirable: bool,
    ) -> Option<EntryId> {
        let replaced = self
            .items
            .insert(F::fold(key).into_owned(), id)
            .filter(|old| *old != id);
        if let Some(old) = replaced {
            list.unlink(old);
        }

        let linked = list.get(id).is_some_and(Entry::is_expirable);
        if !expirable {
            list.unlink(id);
        } else if !linked {
            list.link_tail(id);
        }
        replaced
    }

    // == Delete ==
    /// Removes the mapping and frees the entry from the shared list.
    ///
    /// The entry is returned untouched; tearing down its payload is up to the
    /// caller.
    pub fn delete<P>(&mut self, list: &mut EntryList<P>, key: &str) -> Option<Entry<P>> {
        let id = self.items.remove(F::fold(key).as_ref())?;
        list.take(id)
    }

    /// Like [`delete`](Self::delete), but only when `key` still maps to `id`.
    pub fn delete_entry<P>(
        &mut self,
        list: &mut EntryList<P>,
        key: &str,
        id: EntryId,
    ) -> Option<Entry<P>> {
        let folded = F::fold(key);
        if self.items.get(folded.as_ref()) != Some(&id) {
            return None;
        }
        self.items.remove(folded.as_ref());
        list.take(id)
    }

    /// Drops every mapping, freeing the entries from the shared list.
    pub fn clear<P>(&mut self, list: &mut EntryList<P>) -> Vec<Entry<P>> {
        self.items
            .drain()
            .filter_map(|(_, id)| list.take(id))
            .collect()
    }

    // == Length ==
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Normalized keys currently mapped.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.items.values().copied()
    }
}

impl<F: KeyFold> Default for KeyMap<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> fmt::Debug for KeyMap<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.items.iter()).finish()
    }
}
