//! Snapshot Map Implementation
//!
//! This module implements a concurrency-safe map with lock-free reads against
//! an immutable snapshot and a single mutex guarding a mutable overlay. The
//! design favors workloads where reads dominate and the key set is mostly
//! stable: once a key has been folded into the snapshot, loading it costs one
//! atomic pointer load and a hash lookup, with no lock and no contention
//! against writers.
//!
//! ## Design
//!
//! The map keeps two tiers:
//! - A read-only snapshot (`ReadOnly`), published through an epoch-managed
//!   atomic pointer. Readers pin the epoch, load the pointer, and look keys up
//!   without any further synchronization.
//! - A mutex-guarded overlay holding entries stored since the last promotion.
//!   When lookups miss the snapshot as often as the overlay has entries, the
//!   overlay is promoted to become the new snapshot and cleared.
//!
//! Both tiers share entry slots through `Arc`, so a value written through the
//! snapshot fast path is the same value the overlay sees. A slot holds its
//! value in an epoch-managed pointer with three states:
//!
//! ```text
//! value     live, visible to load/range
//! null      tombstoned; the key is logically absent but the slot can be
//!           revived by a later store without touching the overlay
//! expunged  tombstoned and omitted from the overlay; a store must first
//!           re-link the slot into the overlay under the mutex
//! ```
//!
//! ## Memory Ordering
//!
//! - Reads use `Acquire` so a loaded value is fully visible
//! - Value installation uses `AcqRel` compare-and-swap, establishing the
//!   happens-before edge from `store` to any later `load` of that key
//! - The snapshot pointer is swapped with `AcqRel` and loaded with `Acquire`
//!
//! ## Memory Reclamation
//!
//! Replaced values and retired snapshots are freed through epoch-based
//! reclamation (`crossbeam_epoch`), so a reader holding a reference obtained
//! from the snapshot can never observe freed memory. Reclamation timing is an
//! internal matter; it never affects what callers observe.
//!
//! ## Performance Characteristics
//!
//! - **load**: O(1), lock-free once the key is in the snapshot
//! - **store** to an existing live key: O(1), lock-free
//! - **store** of a new key: O(1) amortized, takes the overlay mutex
//! - **range**: O(n) over one coherent snapshot, no lock held while visiting

use crate::util::CachePadded;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use fxhash::{FxBuildHasher, FxHashMap};
use parking_lot::Mutex;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pointer tag marking a slot as expunged: tombstoned and absent from the
/// overlay. Stores hitting an expunged slot must re-link it under the mutex.
const EXPUNGED: usize = 1;

/// Heap cell for a stored value.
///
/// The 2-byte minimum alignment guarantees one free low bit in every value
/// pointer, so the expunged tag works regardless of `V`'s own alignment.
#[repr(align(2))]
struct ValueBox<V> {
    value: V,
}

/// A single entry slot, shared between the snapshot and the overlay.
///
/// All transitions are CAS loops on the value pointer, which is what makes
/// per-key operations linearizable: every mutation of a key is one successful
/// CAS on its slot (or happens under the overlay mutex before the slot is
/// reachable by anyone else).
struct Slot<V> {
    p: Atomic<ValueBox<V>>,
}

impl<V> Slot<V> {
    fn new(value: V) -> Self {
        Slot {
            p: Atomic::new(ValueBox { value }),
        }
    }

    /// Read the current value, if the slot is live.
    fn load<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        let current = self.p.load(Ordering::Acquire, guard);
        if current.is_null() {
            None
        } else {
            Some(unsafe { &current.deref().value })
        }
    }

    /// Install `value`, returning the replaced value's pointer, unless the
    /// slot is expunged, in which case `value` is handed back untouched.
    fn try_swap<'g>(&self, value: V, guard: &'g Guard) -> Result<Option<Shared<'g, ValueBox<V>>>, V> {
        let mut current = self.p.load(Ordering::Acquire, guard);
        if current.tag() == EXPUNGED {
            return Err(value);
        }
        let mut value = Owned::new(ValueBox { value });
        loop {
            match self
                .p
                .compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    return Ok(if current.is_null() {
                        None
                    } else {
                        unsafe { guard.defer_destroy(current) };
                        Some(current)
                    });
                }
                Err(e) => {
                    current = e.current;
                    value = e.new;
                    if current.tag() == EXPUNGED {
                        return Err(value.into_box().value);
                    }
                }
            }
        }
    }

    /// Install `value` unconditionally. Only valid while the overlay mutex is
    /// held and the slot is known not to be expunged.
    fn swap_locked<'g>(&self, value: V, guard: &'g Guard) -> Option<Shared<'g, ValueBox<V>>> {
        let previous = self
            .p
            .swap(Owned::new(ValueBox { value }), Ordering::AcqRel, guard);
        if previous.is_null() {
            None
        } else {
            unsafe { guard.defer_destroy(previous) };
            Some(previous)
        }
    }

    /// Return the current value if live, otherwise install `value`; fails
    /// only when the slot is expunged, handing `value` back.
    fn try_load_or_store<'g>(&self, value: V, guard: &'g Guard) -> Result<(&'g V, bool), V> {
        let mut current = self.p.load(Ordering::Acquire, guard);
        if current.tag() == EXPUNGED {
            return Err(value);
        }
        if !current.is_null() {
            return Ok((unsafe { &current.deref().value }, true));
        }
        let mut value = Owned::new(ValueBox { value });
        loop {
            match self
                .p
                .compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(installed) => return Ok((unsafe { &installed.deref().value }, false)),
                Err(e) => {
                    current = e.current;
                    value = e.new;
                    if current.tag() == EXPUNGED {
                        return Err(value.into_box().value);
                    }
                    if !current.is_null() {
                        return Ok((unsafe { &current.deref().value }, true));
                    }
                }
            }
        }
    }

    /// `try_load_or_store` for slots that cannot be expunged because the
    /// overlay mutex is held and the slot was just unexpunged or came from
    /// the overlay itself. A racing lock-free store can still land between
    /// the load and the CAS, hence the retry loop.
    fn load_or_store_locked<'g>(&self, value: V, guard: &'g Guard) -> (&'g V, bool) {
        let mut value = Owned::new(ValueBox { value });
        loop {
            let current = self.p.load(Ordering::Acquire, guard);
            if !current.is_null() {
                return (unsafe { &current.deref().value }, true);
            }
            match self
                .p
                .compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(installed) => return (unsafe { &installed.deref().value }, false),
                Err(e) => value = e.new,
            }
        }
    }

    /// Tombstone the slot, returning the removed value's pointer if it was
    /// live. Never changes an expunged slot.
    fn delete<'g>(&self, guard: &'g Guard) -> Option<Shared<'g, ValueBox<V>>> {
        let mut current = self.p.load(Ordering::Acquire, guard);
        loop {
            if current.is_null() {
                return None;
            }
            match self.p.compare_exchange(
                current,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    return Some(current);
                }
                Err(e) => current = e.current,
            }
        }
    }

    /// CAS on the value: replace it with `new` only if it is live and equal
    /// to `old`.
    fn try_compare_and_swap(&self, old: &V, new: V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut current = self.p.load(Ordering::Acquire, guard);
        if current.is_null() || unsafe { &current.deref().value } != old {
            return false;
        }
        let mut new = Owned::new(ValueBox { value: new });
        loop {
            match self
                .p
                .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    return true;
                }
                Err(e) => {
                    current = e.current;
                    new = e.new;
                    if current.is_null() || unsafe { &current.deref().value } != old {
                        return false;
                    }
                }
            }
        }
    }

    /// Tombstone the slot only if its value is live and equal to `old`.
    fn try_compare_and_delete(&self, old: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut current = self.p.load(Ordering::Acquire, guard);
        loop {
            if current.is_null() || unsafe { &current.deref().value } != old {
                return false;
            }
            match self.p.compare_exchange(
                current,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    return true;
                }
                Err(e) => current = e.current,
            }
        }
    }

    /// While building a fresh overlay: mark a tombstoned slot expunged so it
    /// is not carried over. Returns whether the slot ended up expunged.
    fn try_expunge_locked(&self, guard: &Guard) -> bool {
        let mut current = self.p.load(Ordering::Acquire, guard);
        while current.is_null() && current.tag() != EXPUNGED {
            match self.p.compare_exchange(
                current,
                Shared::null().with_tag(EXPUNGED),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return true,
                Err(e) => current = e.current,
            }
        }
        current.tag() == EXPUNGED
    }

    /// Clear the expunged mark so the slot behaves as a plain tombstone
    /// again. Returns true if this call did the clearing, in which case the
    /// caller must re-link the slot into the overlay.
    fn unexpunge_locked(&self, guard: &Guard) -> bool {
        self.p
            .compare_exchange(
                Shared::null().with_tag(EXPUNGED),
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
    }
}

impl<V> Drop for Slot<V> {
    fn drop(&mut self) {
        // Last reference to this slot; nobody can be reading the value.
        let current = unsafe { self.p.load(Ordering::Relaxed, epoch::unprotected()) };
        if !current.is_null() {
            drop(unsafe { current.into_owned() });
        }
    }
}

/// The immutable read tier.
///
/// `amended` flips to true when the overlay holds keys this snapshot does
/// not; readers that miss here must then fall through to the overlay.
struct ReadOnly<K, V> {
    m: FxHashMap<K, Arc<Slot<V>>>,
    amended: AtomicBool,
}

impl<K, V> ReadOnly<K, V> {
    fn new(m: FxHashMap<K, Arc<Slot<V>>>) -> Self {
        ReadOnly {
            m,
            amended: AtomicBool::new(false),
        }
    }

    fn amended(&self) -> bool {
        self.amended.load(Ordering::Acquire)
    }
}

/// The mutable write tier, guarded by the overlay mutex.
struct Overlay<K, V> {
    /// Entries not yet folded into the snapshot. `None` between a promotion
    /// and the next store of a snapshot-missing key.
    map: Option<FxHashMap<K, Arc<Slot<V>>>>,
    /// Snapshot misses since the last promotion. Promotion triggers once this
    /// reaches the overlay size.
    misses: usize,
}

/// A concurrent map with lock-free snapshot reads
///
/// `SnapshotMap` maps keys to values and is safe for any number of
/// simultaneous readers and writers. Reads of keys that have been folded into
/// the snapshot are lock-free; writes of new keys and deletions coordinate
/// through a single mutex over a small overlay, which is periodically
/// promoted to become the next snapshot.
///
/// # Type Parameters
///
/// * `K` - The key type; keys are immutable once inserted
/// * `V` - The value type; values cross the API boundary by clone
///
/// Requiring `Eq + Hash` on `K` makes an uncomparable key type a compile
/// error rather than anything the map has to handle at runtime.
///
/// # Consistency
///
/// Operations on a single key are linearizable with respect to each other.
/// Operations on different keys are independent. [`range`](SnapshotMap::range)
/// walks one coherent snapshot and is weakly consistent under concurrent
/// mutation: see its documentation for the exact contract.
///
/// # Examples
///
/// ```rust
/// use snapmap::SnapshotMap;
///
/// let map: SnapshotMap<String, i32> = SnapshotMap::new();
/// map.store("one".to_string(), 1);
/// assert_eq!(map.load(&"one".to_string()), Some(1));
/// map.delete(&"one".to_string());
/// assert_eq!(map.load(&"one".to_string()), None);
/// ```
pub struct SnapshotMap<K, V> {
    // Epoch-managed pointer to the current snapshot; never null.
    read: CachePadded<Atomic<ReadOnly<K, V>>>,

    // Overlay mutex. Held for new-key stores, snapshot misses, deletions of
    // overlay-only keys, and promotion; never held while invoking a caller's
    // range callback.
    dirty: CachePadded<Mutex<Overlay<K, V>>>,
}

impl<K, V> SnapshotMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a new, empty map
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapmap::SnapshotMap;
    ///
    /// let map: SnapshotMap<String, i32> = SnapshotMap::new();
    /// assert_eq!(map.load(&"missing".to_string()), None);
    /// ```
    pub fn new() -> Self {
        Self {
            read: CachePadded::new(Atomic::new(ReadOnly::new(FxHashMap::default()))),
            dirty: CachePadded::new(Mutex::new(Overlay {
                map: None,
                misses: 0,
            })),
        }
    }

    /// Return the value stored for `key`, if a live entry exists
    ///
    /// Lock-free whenever the key is covered by the snapshot. Falls back to
    /// the overlay (under the mutex) only while the snapshot is amended, and
    /// each such fallback counts toward the next promotion.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapmap::SnapshotMap;
    ///
    /// let map: SnapshotMap<&str, i32> = SnapshotMap::new();
    /// map.store("k", 7);
    /// assert_eq!(map.load(&"k"), Some(7));
    /// assert_eq!(map.load(&"absent"), None);
    /// ```
    pub fn load(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let guard = &epoch::pin();
        let read = self.read_snapshot(guard);
        if let Some(slot) = read.m.get(key) {
            return slot.load(guard).cloned();
        }
        if !read.amended() {
            return None;
        }

        let mut overlay = self.dirty.get().lock();
        // A concurrent promotion may have folded the overlay in while we
        // waited for the lock; check the fresh snapshot first.
        let read = self.read_snapshot(guard);
        if let Some(slot) = read.m.get(key) {
            return slot.load(guard).cloned();
        }
        let slot = if read.amended() {
            let slot = overlay
                .map
                .as_ref()
                .and_then(|dirty| dirty.get(key))
                .map(Arc::clone);
            // The miss counts whether or not the overlay has the key.
            self.miss_locked(&mut overlay, guard);
            slot
        } else {
            None
        };
        drop(overlay);
        slot.and_then(|slot| slot.load(guard).cloned())
    }

    /// Install `value` for `key`, creating the entry or overwriting it
    ///
    /// After this call returns, a `load` of the same key on any thread
    /// observes this value or a later one, never an earlier one and never
    /// absence.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapmap::SnapshotMap;
    ///
    /// let map: SnapshotMap<&str, i32> = SnapshotMap::new();
    /// map.store("k", 1);
    /// map.store("k", 2);
    /// assert_eq!(map.load(&"k"), Some(2));
    /// ```
    pub fn store(&self, key: K, value: V) {
        let guard = &epoch::pin();
        let _ = self.swap_shared(key, value, guard);
    }

    /// Install `value` for `key` and return the previous value, if any
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapmap::SnapshotMap;
    ///
    /// let map: SnapshotMap<&str, i32> = SnapshotMap::new();
    /// assert_eq!(map.swap("k", 1), None);
    /// assert_eq!(map.swap("k", 2), Some(1));
    /// ```
    pub fn swap(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = &epoch::pin();
        self.swap_shared(key, value, guard)
            .map(|previous| unsafe { previous.deref().value.clone() })
    }

    /// Tombstone the entry for `key`; a no-op if no live entry exists
    ///
    /// Idempotent: deleting twice is the same as deleting once.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapmap::SnapshotMap;
    ///
    /// let map: SnapshotMap<&str, i32> = SnapshotMap::new();
    /// map.store("k", 1);
    /// map.delete(&"k");
    /// map.delete(&"k"); // no-op
    /// assert_eq!(map.load(&"k"), None);
    /// ```
    pub fn delete(&self, key: &K) {
        let guard = &epoch::pin();
        let _ = self.delete_shared(key, guard);
    }

    /// Atomically read the current value for `key` and tombstone the entry
    ///
    /// No other call observes the entry as present after this call returns
    /// and before a subsequent store. Returns `None` if no live entry
    /// existed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapmap::SnapshotMap;
    ///
    /// let map: SnapshotMap<&str, i32> = SnapshotMap::new();
    /// map.store("k", 9);
    /// assert_eq!(map.load_and_delete(&"k"), Some(9));
    /// assert_eq!(map.load_and_delete(&"k"), None);
    /// ```
    pub fn load_and_delete(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let guard = &epoch::pin();
        self.delete_shared(key, guard)
            .map(|removed| unsafe { removed.deref().value.clone() })
    }

    /// Return the existing value for `key`, or install `value` if absent
    ///
    /// The returned flag is `true` when the value was already present. Among
    /// racing callers on the same absent key, exactly one installs its value
    /// and sees `false`; every other caller observes the winner's value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapmap::SnapshotMap;
    ///
    /// let map: SnapshotMap<&str, i32> = SnapshotMap::new();
    /// assert_eq!(map.load_or_store("k", 1), (1, false));
    /// assert_eq!(map.load_or_store("k", 2), (1, true));
    /// ```
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool)
    where
        V: Clone,
    {
        let guard = &epoch::pin();
        let read = self.read_snapshot(guard);
        let mut value = value;
        if let Some(slot) = read.m.get(&key) {
            match slot.try_load_or_store(value, guard) {
                Ok((actual, loaded)) => return (actual.clone(), loaded),
                Err(v) => value = v,
            }
        }

        let mut overlay = self.dirty.get().lock();
        let read = self.read_snapshot(guard);
        if let Some(slot) = read.m.get(&key) {
            let slot = Arc::clone(slot);
            if slot.unexpunge_locked(guard) {
                // The slot was expunged, so the overlay does not know it.
                overlay
                    .map
                    .get_or_insert_with(FxHashMap::default)
                    .insert(key, Arc::clone(&slot));
            }
            let (actual, loaded) = slot.load_or_store_locked(value, guard);
            (actual.clone(), loaded)
        } else if let Some(slot) = overlay.map.as_ref().and_then(|dirty| dirty.get(&key)) {
            let slot = Arc::clone(slot);
            let (actual, loaded) = slot.load_or_store_locked(value, guard);
            let result = (actual.clone(), loaded);
            self.miss_locked(&mut overlay, guard);
            result
        } else {
            if !read.amended() {
                self.dirty_locked(&mut overlay, read, guard);
            }
            let actual = value.clone();
            overlay
                .map
                .get_or_insert_with(FxHashMap::default)
                .insert(key, Arc::new(Slot::new(value)));
            (actual, false)
        }
    }

    /// Replace the value for `key` with `new` only if it is currently `old`
    ///
    /// Returns whether the swap happened. The comparison and the replacement
    /// are one atomic step with respect to every other operation on the key.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapmap::SnapshotMap;
    ///
    /// let map: SnapshotMap<&str, i32> = SnapshotMap::new();
    /// map.store("k", 1);
    /// assert!(map.compare_and_swap(&"k", &1, 2));
    /// assert!(!map.compare_and_swap(&"k", &1, 3));
    /// assert_eq!(map.load(&"k"), Some(2));
    /// ```
    pub fn compare_and_swap(&self, key: &K, old: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        let read = self.read_snapshot(guard);
        if let Some(slot) = read.m.get(key) {
            return slot.try_compare_and_swap(old, new, guard);
        }
        if !read.amended() {
            return false;
        }

        let mut overlay = self.dirty.get().lock();
        let read = self.read_snapshot(guard);
        if let Some(slot) = read.m.get(key) {
            slot.try_compare_and_swap(old, new, guard)
        } else if let Some(slot) = overlay.map.as_ref().and_then(|dirty| dirty.get(key)) {
            let slot = Arc::clone(slot);
            let swapped = slot.try_compare_and_swap(old, new, guard);
            self.miss_locked(&mut overlay, guard);
            swapped
        } else {
            false
        }
    }

    /// Tombstone the entry for `key` only if its value is currently `old`
    ///
    /// Returns whether the entry was deleted.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapmap::SnapshotMap;
    ///
    /// let map: SnapshotMap<&str, i32> = SnapshotMap::new();
    /// map.store("k", 1);
    /// assert!(!map.compare_and_delete(&"k", &2));
    /// assert!(map.compare_and_delete(&"k", &1));
    /// assert_eq!(map.load(&"k"), None);
    /// ```
    pub fn compare_and_delete(&self, key: &K, old: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        let read = self.read_snapshot(guard);
        let mut slot = read.m.get(key).map(Arc::clone);
        if slot.is_none() && read.amended() {
            let mut overlay = self.dirty.get().lock();
            let read = self.read_snapshot(guard);
            slot = read.m.get(key).map(Arc::clone);
            if slot.is_none() && read.amended() {
                slot = overlay
                    .map
                    .as_ref()
                    .and_then(|dirty| dirty.get(key))
                    .map(Arc::clone);
                self.miss_locked(&mut overlay, guard);
            }
        }
        match slot {
            Some(slot) => slot.try_compare_and_delete(old, guard),
            None => false,
        }
    }

    /// Visit every live entry; stop early when `visit` returns `false`
    ///
    /// The iteration walks one coherent snapshot. Every entry that is present
    /// continuously for the whole call is visited exactly once; entries
    /// stored or deleted concurrently may or may not appear, but no entry is
    /// ever visited twice or in a partially-applied state. Iteration order is
    /// unspecified. Once `visit` returns `false`, it is not invoked again.
    ///
    /// If the snapshot is amended, the overlay is promoted first so the walk
    /// covers recent writes; the mutex is released before the first `visit`
    /// call, so the callback may freely call back into the map.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use snapmap::SnapshotMap;
    ///
    /// let map: SnapshotMap<String, i32> = SnapshotMap::new();
    /// for i in 0..3 {
    ///     map.store(format!("k{}", i), i);
    /// }
    /// let mut sum = 0;
    /// map.range(|_, value| {
    ///     sum += value;
    ///     true
    /// });
    /// assert_eq!(sum, 3);
    /// ```
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let guard = &epoch::pin();
        let mut read = self.read_snapshot(guard);
        if read.amended() {
            let mut overlay = self.dirty.get().lock();
            read = self.read_snapshot(guard);
            if read.amended() {
                if let Some(dirty) = overlay.map.take() {
                    self.install_read(ReadOnly::new(dirty), guard);
                }
                overlay.misses = 0;
                read = self.read_snapshot(guard);
            }
            drop(overlay);
        }

        for (key, slot) in &read.m {
            if let Some(value) = slot.load(guard) {
                if !visit(key, value) {
                    break;
                }
            }
        }
    }

    // Private helper methods

    fn read_snapshot<'g>(&self, guard: &'g Guard) -> &'g ReadOnly<K, V> {
        let read = self.read.get().load(Ordering::Acquire, guard);
        // Installed non-null at construction and only ever swapped for
        // another live snapshot.
        unsafe { read.deref() }
    }

    fn install_read(&self, read: ReadOnly<K, V>, guard: &Guard) {
        let old = self
            .read
            .get()
            .swap(Owned::new(read), Ordering::AcqRel, guard);
        unsafe { guard.defer_destroy(old) };
    }

    /// Shared body of `store` and `swap`: install the value and return the
    /// replaced value's pointer, if any.
    fn swap_shared<'g>(
        &self,
        key: K,
        value: V,
        guard: &'g Guard,
    ) -> Option<Shared<'g, ValueBox<V>>> {
        let read = self.read_snapshot(guard);
        let mut value = value;
        if let Some(slot) = read.m.get(&key) {
            match slot.try_swap(value, guard) {
                Ok(previous) => return previous,
                Err(v) => value = v,
            }
        }

        let mut overlay = self.dirty.get().lock();
        let read = self.read_snapshot(guard);
        if let Some(slot) = read.m.get(&key) {
            let slot = Arc::clone(slot);
            if slot.unexpunge_locked(guard) {
                overlay
                    .map
                    .get_or_insert_with(FxHashMap::default)
                    .insert(key, Arc::clone(&slot));
            }
            slot.swap_locked(value, guard)
        } else if let Some(slot) = overlay.map.as_ref().and_then(|dirty| dirty.get(&key)) {
            let slot = Arc::clone(slot);
            slot.swap_locked(value, guard)
        } else {
            if !read.amended() {
                // First snapshot-missing key since the last promotion: build
                // the overlay from the snapshot and mark it amended.
                self.dirty_locked(&mut overlay, read, guard);
            }
            overlay
                .map
                .get_or_insert_with(FxHashMap::default)
                .insert(key, Arc::new(Slot::new(value)));
            None
        }
    }

    /// Shared body of `delete` and `load_and_delete`: tombstone the entry and
    /// return the removed value's pointer, if any.
    fn delete_shared<'g>(&self, key: &K, guard: &'g Guard) -> Option<Shared<'g, ValueBox<V>>> {
        let read = self.read_snapshot(guard);
        if let Some(slot) = read.m.get(key) {
            return slot.delete(guard);
        }
        if !read.amended() {
            return None;
        }

        let mut overlay = self.dirty.get().lock();
        let read = self.read_snapshot(guard);
        if let Some(slot) = read.m.get(key) {
            return slot.delete(guard);
        }
        let slot = if read.amended() {
            // Overlay-only entries are removed physically; the slot was never
            // published in any snapshot.
            let slot = overlay.map.as_mut().and_then(|dirty| dirty.remove(key));
            self.miss_locked(&mut overlay, guard);
            slot
        } else {
            None
        };
        drop(overlay);
        slot.and_then(|slot| slot.delete(guard))
    }

    /// Record a snapshot miss; promote the overlay once misses catch up with
    /// its size, so a hot key never pays the mutex twice in steady state.
    fn miss_locked(&self, overlay: &mut Overlay<K, V>, guard: &Guard) {
        overlay.misses += 1;
        let overlay_len = overlay.map.as_ref().map_or(0, |dirty| dirty.len());
        if overlay.misses < overlay_len {
            return;
        }
        if let Some(dirty) = overlay.map.take() {
            self.install_read(ReadOnly::new(dirty), guard);
        }
        overlay.misses = 0;
    }

    /// Build a fresh overlay from the snapshot: live entries are carried over
    /// sharing their slots; tombstoned entries are expunged and left behind,
    /// to be dropped with the snapshot at the next promotion.
    fn dirty_locked(&self, overlay: &mut Overlay<K, V>, read: &ReadOnly<K, V>, guard: &Guard) {
        if overlay.map.is_some() {
            return;
        }
        let mut dirty = FxHashMap::with_capacity_and_hasher(read.m.len(), FxBuildHasher::default());
        for (key, slot) in &read.m {
            if !slot.try_expunge_locked(guard) {
                dirty.insert(key.clone(), Arc::clone(slot));
            }
        }
        overlay.map = Some(dirty);
        read.amended.store(true, Ordering::Release);
    }
}

impl<K, V> Default for SnapshotMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for SnapshotMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("SnapshotMap { .. }")
    }
}

impl<K, V> Drop for SnapshotMap<K, V> {
    fn drop(&mut self) {
        // Exclusive access: free the snapshot directly. Slot values are freed
        // by `Slot::drop` once the last `Arc` (snapshot or overlay) goes.
        let read = unsafe {
            self.read
                .get()
                .load(Ordering::Relaxed, epoch::unprotected())
        };
        if !read.is_null() {
            drop(unsafe { read.into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let map: SnapshotMap<String, String> = SnapshotMap::new();

        assert_eq!(map.load(&"name".to_string()), None);

        map.store("name".to_string(), "value".to_string());
        assert_eq!(map.load(&"name".to_string()), Some("value".to_string()));

        map.store("name".to_string(), "updated".to_string());
        assert_eq!(map.load(&"name".to_string()), Some("updated".to_string()));

        map.delete(&"name".to_string());
        assert_eq!(map.load(&"name".to_string()), None);
    }

    #[test]
    fn test_store_load_delete_cycle() {
        // The full single-key lifecycle through every operation.
        let map: SnapshotMap<String, String> = SnapshotMap::new();
        let key = "name".to_string();

        map.store(key.clone(), "duyuqing".to_string());
        assert_eq!(map.load(&key), Some("duyuqing".to_string()));

        assert_eq!(map.load_and_delete(&key), Some("duyuqing".to_string()));
        assert_eq!(map.load(&key), None);

        assert_eq!(
            map.load_or_store(key.clone(), "duyuqing".to_string()),
            ("duyuqing".to_string(), false)
        );
        assert_eq!(
            map.load_or_store(key.clone(), "other".to_string()),
            ("duyuqing".to_string(), true)
        );
    }

    #[test]
    fn test_delete_is_idempotent() {
        let map: SnapshotMap<&str, i32> = SnapshotMap::new();
        map.store("k", 1);
        map.delete(&"k");
        map.delete(&"k");
        assert_eq!(map.load(&"k"), None);
        assert_eq!(map.load_and_delete(&"k"), None);
    }

    #[test]
    fn test_swap_returns_previous() {
        let map: SnapshotMap<&str, i32> = SnapshotMap::new();
        assert_eq!(map.swap("k", 1), None);
        assert_eq!(map.swap("k", 2), Some(1));
        assert_eq!(map.swap("k", 3), Some(2));
        map.delete(&"k");
        assert_eq!(map.swap("k", 4), None);
        assert_eq!(map.load(&"k"), Some(4));
    }

    #[test]
    fn test_compare_and_swap() {
        let map: SnapshotMap<&str, i32> = SnapshotMap::new();
        assert!(!map.compare_and_swap(&"k", &0, 1));

        map.store("k", 1);
        assert!(map.compare_and_swap(&"k", &1, 2));
        assert!(!map.compare_and_swap(&"k", &1, 3));
        assert_eq!(map.load(&"k"), Some(2));

        map.delete(&"k");
        assert!(!map.compare_and_swap(&"k", &2, 3));
        assert_eq!(map.load(&"k"), None);
    }

    #[test]
    fn test_compare_and_delete() {
        let map: SnapshotMap<&str, i32> = SnapshotMap::new();
        assert!(!map.compare_and_delete(&"k", &1));

        map.store("k", 1);
        assert!(!map.compare_and_delete(&"k", &2));
        assert_eq!(map.load(&"k"), Some(1));
        assert!(map.compare_and_delete(&"k", &1));
        assert_eq!(map.load(&"k"), None);
        assert!(!map.compare_and_delete(&"k", &1));
    }

    #[test]
    fn test_tombstone_reuse() {
        // Delete then re-store the same key; the slot is revived in place.
        let map: SnapshotMap<String, i32> = SnapshotMap::new();
        for round in 0..5 {
            map.store("k".to_string(), round);
            assert_eq!(map.load(&"k".to_string()), Some(round));
            map.delete(&"k".to_string());
            assert_eq!(map.load(&"k".to_string()), None);
        }
    }

    #[test]
    fn test_expunge_and_revive() {
        // Exercise the expunged state: a key deleted before the overlay is
        // rebuilt is expunged, and a later store must re-link it.
        let map: SnapshotMap<String, i32> = SnapshotMap::new();

        map.store("a".to_string(), 1);
        // Promote so "a" lives in the snapshot.
        for _ in 0..4 {
            map.load(&"b".to_string());
            map.store("b".to_string(), 2);
            map.load(&"b".to_string());
        }
        map.delete(&"a".to_string());
        // Storing a brand-new key rebuilds the overlay, expunging "a".
        map.store("c".to_string(), 3);
        // Reviving "a" goes through the unexpunge path.
        map.store("a".to_string(), 10);

        assert_eq!(map.load(&"a".to_string()), Some(10));
        assert_eq!(map.load(&"b".to_string()), Some(2));
        assert_eq!(map.load(&"c".to_string()), Some(3));
    }

    #[test]
    fn test_promotion_keeps_all_entries() {
        // Force repeated promotions and verify nothing is lost or duplicated.
        let map: SnapshotMap<String, usize> = SnapshotMap::new();
        for i in 0..100 {
            map.store(format!("key-{}", i), i);
            // Misses on snapshot-covered keys drive promotion.
            for j in 0..=i {
                assert_eq!(map.load(&format!("key-{}", j)), Some(j));
            }
        }
        let mut seen = std::collections::HashSet::new();
        map.range(|key, _| {
            assert!(seen.insert(key.clone()), "key visited twice: {}", key);
            true
        });
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_range_visits_live_entries_once() {
        let map: SnapshotMap<String, i32> = SnapshotMap::new();
        for i in 0..10 {
            map.store(format!("name-{}", i), i);
        }
        map.delete(&"name-3".to_string());

        let mut visited = std::collections::HashMap::new();
        map.range(|key, value| {
            assert!(visited.insert(key.clone(), *value).is_none());
            true
        });
        assert_eq!(visited.len(), 9);
        assert!(!visited.contains_key("name-3"));
        assert_eq!(visited.get("name-7"), Some(&7));
    }

    #[test]
    fn test_range_early_stop() {
        let map: SnapshotMap<String, i32> = SnapshotMap::new();
        for i in 0..10 {
            map.store(format!("k{}", i), i);
        }
        let mut calls = 0;
        map.range(|_, _| {
            calls += 1;
            calls < 3
        });
        // No further invocations after the first false return.
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_load_or_store_sequential() {
        let map: SnapshotMap<&str, i32> = SnapshotMap::new();
        assert_eq!(map.load_or_store("k", 1), (1, false));
        assert_eq!(map.load_or_store("k", 2), (1, true));
        map.delete(&"k");
        assert_eq!(map.load_or_store("k", 3), (3, false));
    }

    #[test]
    fn test_default_and_debug() {
        let map: SnapshotMap<String, i32> = SnapshotMap::default();
        map.store("k".to_string(), 1);
        assert_eq!(format!("{:?}", map), "SnapshotMap { .. }");
    }
}
