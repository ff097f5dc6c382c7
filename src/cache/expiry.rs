//! Cache Core Module
//!
//! Reference counting and TTL expiration over state guarded by a lock that
//! the cache shares with its owner.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{EntryId, EntryList, SWEEP_INTERVAL};
use crate::tasks::{spawn_sweep_task, SweepHandle};

// == Guarded State ==
/// State protected by the lock a [`Cache`] is bound to.
///
/// The implementor owns the entry list together with every map that points
/// into it, plus whatever else its critical section covers.
pub trait Guarded: Send + 'static {
    /// The cached resource type. Heterogeneous resources share one cache
    /// through an enum payload.
    type Payload: Send + 'static;

    /// The entry list all of this state's maps are bound to.
    fn entries(&mut self) -> &mut EntryList<Self::Payload>;

    /// Tears down an entry the sweep found due and unreferenced.
    ///
    /// Called with the lock held, after the walk of the current pass has
    /// finished. Returns whether the entry was handled.
    fn reclaim(&mut self, id: EntryId, expiry: &Expiry) -> bool;
}

// == Expiry ==
/// Clock and TTL of the sweep pass currently running.
///
/// Handed to [`Guarded::reclaim`] so teardown can release references it
/// holds on other entries under the same clock as the pass.
#[derive(Debug, Clone, Copy)]
pub struct Expiry {
    now: Instant,
    ttl: Duration,
}

impl Expiry {
    pub fn new(now: Instant, ttl: Duration) -> Self {
        Self { now, ttl }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Same as [`Cache::touch`], stamped with the pass clock.
    pub fn touch<P>(&self, list: &mut EntryList<P>, id: EntryId, delta: i64) -> bool {
        touch_entry(list, id, delta, self.now, self.ttl)
    }
}

// == Sweep Outcome ==
/// What a single sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Due entries that were rescheduled
    pub processed: usize,
    /// Due entries kept because they were still referenced
    pub deferred: usize,
    /// Idle entries that were reclaimed
    pub reclaimed: usize,
}

// == Cache ==
/// Reference-counted TTL cache bound to an externally owned lock.
///
/// The cache holds no entries of its own: entries live in the guarded state's
/// [`EntryList`]. It decides when an entry may be torn down and runs the
/// background sweep that does so.
pub struct Cache<S> {
    state: Arc<Mutex<S>>,
    ttl: Duration,
    sweep_interval: Duration,
    sweeper: Option<SweepHandle>,
}

impl<S: Guarded> Cache<S> {
    // == Constructor ==
    /// Binds a new idle cache to `state`.
    pub fn new(state: Arc<Mutex<S>>) -> Self {
        Self {
            state,
            ttl: Duration::ZERO,
            sweep_interval: SWEEP_INTERVAL,
            sweeper: None,
        }
    }

    /// Overrides how often the sweep wakes up.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    // == Lock ==
    /// Acquires the shared lock.
    pub async fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().await
    }

    pub fn state(&self) -> &Arc<Mutex<S>> {
        &self.state
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.is_some()
    }

    /// Deadline granted to an entry touched now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.ttl
    }

    // == Touch ==
    /// Records an acquire (`delta = 1`) or release (`delta = -1`).
    ///
    /// Must be called with the lock held, which the `&mut` list enforces.
    /// Resets the entry's expiration clock. A linked entry is also moved to
    /// the tail: a refreshed deadline left in place would sit ahead of older
    /// ones and stop the sweep walk early. Returns false if the handle no
    /// longer resolves.
    pub fn touch<P>(&self, list: &mut EntryList<P>, id: EntryId, delta: i64) -> bool {
        touch_entry(list, id, delta, Instant::now(), self.ttl)
    }

    // == Expire ==
    /// Expire callback for one entry of a sweep pass.
    ///
    /// Returns false without modifying the entry if it is not due at `now`.
    /// Otherwise grants it another TTL window, requeues it at the tail, calls
    /// `destroy` if nobody references it, and returns true.
    pub fn expire<P, F>(
        &self,
        list: &mut EntryList<P>,
        id: EntryId,
        now: Instant,
        destroy: F,
    ) -> bool
    where
        F: FnOnce(),
    {
        expire_entry(list, id, now, self.ttl, destroy)
    }

    // == Sweep Now ==
    /// Runs one sweep pass immediately, outside the background cadence.
    pub async fn sweep_now(&self) -> SweepOutcome {
        let mut state = self.state.lock().await;
        sweep(&mut *state, self.ttl, Instant::now())
    }

    // == Start ==
    /// Records `ttl` and launches the background sweep.
    ///
    /// Starting a running cache is a caller error and is ignored.
    pub fn start(&mut self, ttl: Duration) {
        if self.sweeper.is_some() {
            warn!("Cache sweep already running, start ignored");
            return;
        }
        self.ttl = ttl;
        self.sweeper = Some(spawn_sweep_task(
            Arc::clone(&self.state),
            ttl,
            self.sweep_interval,
        ));
        info!(
            "Cache sweep started: ttl={:?}, interval={:?}",
            ttl, self.sweep_interval
        );
    }

    // == Stop ==
    /// Stops the background sweep and waits for it to exit.
    ///
    /// No sweep pass runs after this returns. Stopping an idle cache is a
    /// caller error and is ignored.
    pub async fn stop(&mut self) {
        let Some(sweeper) = self.sweeper.take() else {
            warn!("Cache sweep not running, stop ignored");
            return;
        };
        sweeper.shutdown().await;
        self.ttl = Duration::ZERO;
        info!("Cache sweep stopped");
    }
}

// == Entry Bookkeeping ==
pub(crate) fn touch_entry<P>(
    list: &mut EntryList<P>,
    id: EntryId,
    delta: i64,
    now: Instant,
    ttl: Duration,
) -> bool {
    let Some(entry) = list.get_mut(id) else {
        return false;
    };
    entry.deadline = now + ttl;
    entry.refcount += delta;
    if entry.refcount < 0 {
        warn!(
            "Refcount of '{}' dropped to {}, clamping to zero",
            entry.key, entry.refcount
        );
        entry.refcount = 0;
    }
    list.requeue(id);
    true
}

pub(crate) fn expire_entry<P, F>(
    list: &mut EntryList<P>,
    id: EntryId,
    now: Instant,
    ttl: Duration,
    destroy: F,
) -> bool
where
    F: FnOnce(),
{
    let Some(entry) = list.get_mut(id) else {
        return false;
    };
    if entry.deadline > now {
        return false;
    }
    entry.deadline = now + ttl;
    let idle = entry.refcount <= 0;

    list.requeue(id);
    if idle {
        destroy();
    }
    true
}

// == Sweep Pass ==
/// Walks due entries under the lock, then reclaims the idle ones.
pub(crate) fn sweep<S: Guarded>(state: &mut S, ttl: Duration, now: Instant) -> SweepOutcome {
    let mut idle = Vec::new();
    let processed = state
        .entries()
        .expire_walk(|list, id| expire_entry(list, id, now, ttl, || idle.push(id)));
    let deferred = processed - idle.len();

    let expiry = Expiry::new(now, ttl);
    let mut reclaimed = 0;
    for id in idle {
        if state.reclaim(id, &expiry) {
            reclaimed += 1;
        } else {
            debug!("Reclaim of {:?} not handled", id);
        }
    }

    state
        .entries()
        .stats_mut()
        .record_pass(processed, deferred, reclaimed);
    SweepOutcome {
        processed,
        deferred,
        reclaimed,
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FoldedMap;

    const TTL: Duration = Duration::from_secs(10);

    /// Minimal guarded state: one folded map, reclaim drops the entry.
    #[derive(Default)]
    struct Table {
        entries: EntryList<&'static str>,
        names: FoldedMap,
        dropped: Vec<&'static str>,
    }

    impl Table {
        fn add(&mut self, key: &'static str, now: Instant) -> EntryId {
            let id = self.entries.insert(key, key, now + TTL);
            self.names.set(&mut self.entries, key, id, true);
            id
        }
    }

    impl Guarded for Table {
        type Payload = &'static str;

        fn entries(&mut self) -> &mut EntryList<&'static str> {
            &mut self.entries
        }

        fn reclaim(&mut self, id: EntryId, _expiry: &Expiry) -> bool {
            let Some(key) = self.entries.get(id).map(|e| e.key().to_string()) else {
                return false;
            };
            match self.names.delete_entry(&mut self.entries, &key, id) {
                Some(entry) => {
                    self.dropped.push(entry.into_payload());
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn test_touch_updates_deadline_and_refcount() {
        let now = Instant::now();
        let mut table = Table::default();
        let a = table.add("a", now);
        table.add("b", now);

        let later = now + Duration::from_secs(1);
        assert!(touch_entry(&mut table.entries, a, 1, later, TTL));

        let entry = table.entries.get(a).unwrap();
        assert_eq!(entry.refcount(), 1);
        assert_eq!(entry.deadline(), later + TTL);
        // Touched entry moves behind untouched ones
        assert_eq!(table.entries.iter().last().unwrap().0, a);
    }

    #[test]
    fn test_touch_clamps_over_release() {
        let now = Instant::now();
        let mut table = Table::default();
        let a = table.add("a", now);

        touch_entry(&mut table.entries, a, -1, now, TTL);

        assert_eq!(table.entries.get(a).unwrap().refcount(), 0);
    }

    #[test]
    fn test_touch_stale_handle() {
        let now = Instant::now();
        let mut table = Table::default();
        let a = table.add("a", now);
        table.names.delete(&mut table.entries, "a");

        assert!(!touch_entry(&mut table.entries, a, 1, now, TTL));
    }

    #[test]
    fn test_expire_not_due() {
        let now = Instant::now();
        let mut table = Table::default();
        let a = table.add("a", now);
        let mut destroyed = false;

        assert!(!expire_entry(&mut table.entries, a, now, TTL, || destroyed = true));
        assert!(!destroyed);
        assert_eq!(table.entries.get(a).unwrap().deadline(), now + TTL);
    }

    #[test]
    fn test_expire_due_and_idle() {
        let now = Instant::now();
        let mut table = Table::default();
        let a = table.add("a", now);
        table.add("b", now);
        let later = now + TTL;
        let mut destroyed = false;

        assert!(expire_entry(&mut table.entries, a, later, TTL, || destroyed = true));
        assert!(destroyed);
        assert_eq!(table.entries.get(a).unwrap().deadline(), later + TTL);
        assert_eq!(table.entries.iter().last().unwrap().0, a);
    }

    #[test]
    fn test_expire_due_but_referenced() {
        let now = Instant::now();
        let mut table = Table::default();
        let a = table.add("a", now);
        touch_entry(&mut table.entries, a, 1, now, TTL);
        let mut destroyed = false;

        assert!(expire_entry(&mut table.entries, a, now + TTL, TTL, || destroyed = true));
        assert!(!destroyed);
    }

    #[test]
    fn test_sweep_reclaims_only_idle_due_entries() {
        let now = Instant::now();
        let mut table = Table::default();
        let a = table.add("a", now);
        let b = table.add("b", now);
        touch_entry(&mut table.entries, b, 1, now, TTL);
        table.add("c", now + Duration::from_secs(5));

        let outcome = sweep(&mut table, TTL, now + TTL);

        assert_eq!(
            outcome,
            SweepOutcome {
                processed: 2,
                deferred: 1,
                reclaimed: 1
            }
        );
        assert_eq!(table.dropped, vec!["a"]);
        assert!(table.entries.get(a).is_none());
        assert!(table.names.get("B").is_some());
        assert!(table.names.get("c").is_some());

        let stats = table.entries.stats();
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.deferred, 1);
    }

    #[test]
    fn test_unhandled_reclaim_is_not_deferred() {
        let now = Instant::now();
        let mut table = Table::default();
        // Linked but unmapped, so reclaim has nothing to remove
        let orphan = table.entries.insert("orphan", "orphan", now);
        table.entries.link_tail(orphan);

        let outcome = sweep(&mut table, TTL, now + TTL);

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.deferred, 0);
        assert_eq!(outcome.reclaimed, 0);
        assert_eq!(table.entries.stats().deferred, 0);
    }

    #[test]
    fn test_sweep_keeps_deadlines_sorted() {
        let now = Instant::now();
        let mut table = Table::default();
        for key in ["a", "b", "c", "d"] {
            table.add(key, now);
        }
        let c = table.names.get("c").unwrap();
        touch_entry(&mut table.entries, c, 1, now + Duration::from_secs(3), TTL);

        sweep(&mut table, TTL, now + TTL + Duration::from_secs(1));

        let deadlines: Vec<_> = table.entries.deadlines().collect();
        assert!(deadlines.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(table.names.len(), 1);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let state = Arc::new(Mutex::new(Table::default()));
        let mut cache = Cache::new(state).with_sweep_interval(Duration::from_millis(10));
        assert!(!cache.is_running());
        assert_eq!(cache.sweep_interval(), Duration::from_millis(10));

        cache.start(TTL);
        assert!(cache.is_running());
        assert_eq!(cache.ttl(), TTL);

        // Ignored while running
        cache.start(Duration::from_secs(1));
        assert_eq!(cache.ttl(), TTL);

        cache.stop().await;
        assert!(!cache.is_running());
        assert_eq!(cache.ttl(), Duration::ZERO);

        // Ignored while idle
        cache.stop().await;
        assert!(!cache.is_running());
    }

    #[tokio::test]
    async fn test_cache_expire_grants_configured_ttl() {
        let state = Arc::new(Mutex::new(Table::default()));
        let mut cache = Cache::new(Arc::clone(&state));
        cache.start(TTL);

        let mut guard = cache.lock().await;
        let table = &mut *guard;
        let now = Instant::now();
        let a = table.add("a", now);
        let mut destroyed = 0;

        assert!(!cache.expire(&mut table.entries, a, now, || destroyed += 1));
        assert!(cache.expire(&mut table.entries, a, now + TTL, || destroyed += 1));
        assert_eq!(destroyed, 1);
        assert_eq!(table.entries.get(a).unwrap().deadline(), now + TTL + TTL);
        drop(guard);

        cache.stop().await;
    }

    #[tokio::test]
    async fn test_sweep_now() {
        let state = Arc::new(Mutex::new(Table::default()));
        let cache = Cache::new(Arc::clone(&state));
        {
            let mut guard = cache.lock().await;
            let table = &mut *guard;
            // Zero TTL while idle: due immediately
            let id = table.entries.insert("a", "a", cache.deadline());
            table.names.set(&mut table.entries, "a", id, true);
        }

        let outcome = cache.sweep_now().await;

        assert_eq!(outcome.reclaimed, 1);
        assert_eq!(state.lock().await.dropped, vec!["a"]);
    }
}
