//! Cache Entry Module
//!
//! Defines the cached unit and the stable handle used to address it.

use tokio::time::Instant;

// == Entry Id ==
/// Stable handle to an entry stored in an [`EntryList`](super::EntryList).
///
/// The generation is bumped every time a slot is freed, so a handle kept past
/// the removal of its entry never resolves to the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

// == Entry ==
/// A single cached resource together with its expiration bookkeeping.
///
/// `deadline` and `refcount` are only reachable through the list that owns the
/// entry, which in turn is only reachable through the shared lock.
#[derive(Debug)]
pub struct Entry<P> {
    /// Key under which the entry was created
    pub(crate) key: String,
    /// The cached resource
    pub(crate) payload: P,
    /// Instant after which the sweep considers the entry due
    pub(crate) deadline: Instant,
    /// Number of live acquisitions
    pub(crate) refcount: i64,
    /// Whether the entry takes part in the expiration ordering
    pub(crate) linked: bool,
    pub(crate) prev: Option<u32>,
    pub(crate) next: Option<u32>,
}

impl<P> Entry<P> {
    // == Constructor ==
    /// Creates an unlinked, unreferenced entry.
    pub(crate) fn new(key: String, payload: P, deadline: Instant) -> Self {
        Self {
            key,
            payload,
            deadline,
            refcount: 0,
            linked: false,
            prev: None,
            next: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    /// Consumes the entry, handing the payload back for teardown.
    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn refcount(&self) -> i64 {
        self.refcount
    }

    /// Returns true while at least one caller holds the resource.
    pub fn is_referenced(&self) -> bool {
        self.refcount > 0
    }

    /// Returns true when the entry takes part in the sweep.
    pub fn is_expirable(&self) -> bool {
        self.linked
    }

    // == Is Due ==
    /// Checks whether the deadline has been reached at `now`.
    ///
    /// An entry is due once `now` is at or past its deadline.
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}
