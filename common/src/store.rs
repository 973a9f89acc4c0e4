//! Correlation store
//!
//! Keyed in-flight state shared by the entry and exit halves of a probe
//! pair. The kernel backs the [`CorrelationStore`] contract with BPF hash
//! maps; [`FixedMap`] is the open-addressed arena used in user space by the
//! replay harness and the tests. Both have a hard capacity and fail silently
//! (with [`StoreError::Full`]) instead of growing.

use crate::types::{NfsdOpKey, RpcKey, ThreadKey};

/// Why a store write was rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The entry ceiling was reached and the key was not already present
    Full,
}

/// Fixed-capacity keyed map holding in-flight records
///
/// Every single operation is atomic on its own. Sequences (get then put,
/// take then put) are not, and callers must tolerate another CPU writing
/// the same key in between.
pub trait CorrelationStore<K, V> {
    /// Unconditional upsert
    fn put(&mut self, key: &K, value: &V) -> Result<(), StoreError>;

    /// Lookup without side effects
    fn get(&self, key: &K) -> Option<V>;

    /// Lookup and delete
    fn take(&mut self, key: &K) -> Option<V>;

    /// Insert `default` if absent, then return the current value
    ///
    /// Returns `None` only when the key was absent and the store is full.
    fn get_or_init(&mut self, key: &K, default: &V) -> Option<V>;

    /// Mutate the stored value in place and return the updated copy
    fn update<F: FnOnce(&mut V)>(&mut self, key: &K, f: F) -> Option<V>;

    fn remove(&mut self, key: &K);
}

impl<K, V, M: CorrelationStore<K, V> + ?Sized> CorrelationStore<K, V> for &mut M {
    #[inline(always)]
    fn put(&mut self, key: &K, value: &V) -> Result<(), StoreError> {
        (**self).put(key, value)
    }

    #[inline(always)]
    fn get(&self, key: &K) -> Option<V> {
        (**self).get(key)
    }

    #[inline(always)]
    fn take(&mut self, key: &K) -> Option<V> {
        (**self).take(key)
    }

    #[inline(always)]
    fn get_or_init(&mut self, key: &K, default: &V) -> Option<V> {
        (**self).get_or_init(key, default)
    }

    #[inline(always)]
    fn update<F: FnOnce(&mut V)>(&mut self, key: &K, f: F) -> Option<V> {
        (**self).update(key, f)
    }

    #[inline(always)]
    fn remove(&mut self, key: &K) {
        (**self).remove(key)
    }
}

// ============================================================================
// Key Hashing
// ============================================================================

/// Key usable in a [`FixedMap`]
pub trait SlotKey: Copy + Eq {
    fn slot_hash(&self) -> u64;
}

/// 64-bit finalizer (splitmix64)
#[inline(always)]
const fn mix(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[inline(always)]
const fn pair(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

impl SlotKey for u32 {
    fn slot_hash(&self) -> u64 {
        mix(*self as u64)
    }
}

impl SlotKey for u64 {
    fn slot_hash(&self) -> u64 {
        mix(*self)
    }
}

impl SlotKey for ThreadKey {
    fn slot_hash(&self) -> u64 {
        mix(pair(self.pid, self.tid))
    }
}

impl SlotKey for RpcKey {
    fn slot_hash(&self) -> u64 {
        mix(pair(self.task_id, self.client_id))
    }
}

impl SlotKey for NfsdOpKey {
    fn slot_hash(&self) -> u64 {
        mix(pair(self.op_type, self.pid))
    }
}

// ============================================================================
// Open-Addressed Arena Map
// ============================================================================

/// One bucket of a [`FixedMap`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot<K, V> {
    Empty,
    /// Previously occupied; keeps probe chains intact after a delete
    Tombstone,
    Occupied(K, V),
}

/// Open-addressed hash map over caller-provided storage
///
/// Capacity is the length of the slot storage. Linear probing is bounded
/// by that length, so every operation terminates in at most `capacity`
/// steps.
#[derive(Clone, Debug)]
pub struct FixedMap<K, V, S> {
    slots: S,
    len: usize,
    _marker: core::marker::PhantomData<(K, V)>,
}

enum Probe {
    Found(usize),
    Vacant(usize),
    Exhausted,
}

impl<K, V, S> FixedMap<K, V, S>
where
    K: SlotKey,
    V: Copy,
    S: AsRef<[Slot<K, V>]> + AsMut<[Slot<K, V>]>,
{
    /// Wrap `slots`, discarding anything already in them
    pub fn new(mut slots: S) -> Self {
        for slot in slots.as_mut().iter_mut() {
            *slot = Slot::Empty;
        }
        Self {
            slots,
            len: 0,
            _marker: core::marker::PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.as_ref().len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        for slot in self.slots.as_mut().iter_mut() {
            *slot = Slot::Empty;
        }
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.as_ref().iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((k, v)),
            _ => None,
        })
    }

    /// Turn the tombstone at `idx` and the run of tombstones before it back
    /// into empty slots when no probe chain continues past them
    fn trim_tombstones(&mut self, idx: usize) {
        let slots = self.slots.as_mut();
        let cap = slots.len();
        if !matches!(slots[(idx + 1) % cap], Slot::Empty) {
            return;
        }
        let mut at = idx;
        for _ in 0..cap {
            if !matches!(slots[at], Slot::Tombstone) {
                break;
            }
            slots[at] = Slot::Empty;
            at = (at + cap - 1) % cap;
        }
    }

    fn probe(&self, key: &K) -> Probe {
        let slots = self.slots.as_ref();
        let cap = slots.len();
        if cap == 0 {
            return Probe::Exhausted;
        }
        let start = (key.slot_hash() % cap as u64) as usize;
        let mut first_free = None;
        for step in 0..cap {
            let idx = (start + step) % cap;
            match &slots[idx] {
                Slot::Occupied(k, _) if k == key => return Probe::Found(idx),
                Slot::Occupied(..) => {}
                Slot::Tombstone => {
                    if first_free.is_none() {
                        first_free = Some(idx);
                    }
                }
                Slot::Empty => return Probe::Vacant(first_free.unwrap_or(idx)),
            }
        }
        match first_free {
            Some(idx) => Probe::Vacant(idx),
            None => Probe::Exhausted,
        }
    }
}

impl<K, V, S> CorrelationStore<K, V> for FixedMap<K, V, S>
where
    K: SlotKey,
    V: Copy,
    S: AsRef<[Slot<K, V>]> + AsMut<[Slot<K, V>]>,
{
    fn put(&mut self, key: &K, value: &V) -> Result<(), StoreError> {
        match self.probe(key) {
            Probe::Found(idx) => {
                self.slots.as_mut()[idx] = Slot::Occupied(*key, *value);
                Ok(())
            }
            Probe::Vacant(idx) => {
                self.slots.as_mut()[idx] = Slot::Occupied(*key, *value);
                self.len += 1;
                Ok(())
            }
            Probe::Exhausted => Err(StoreError::Full),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        match self.probe(key) {
            Probe::Found(idx) => match &self.slots.as_ref()[idx] {
                Slot::Occupied(_, v) => Some(*v),
                _ => None,
            },
            _ => None,
        }
    }

    fn take(&mut self, key: &K) -> Option<V> {
        let Probe::Found(idx) = self.probe(key) else {
            return None;
        };
        let slot = core::mem::replace(&mut self.slots.as_mut()[idx], Slot::Tombstone);
        self.len -= 1;
        if self.len == 0 {
            self.clear();
        } else {
            self.trim_tombstones(idx);
        }
        match slot {
            Slot::Occupied(_, v) => Some(v),
            _ => None,
        }
    }

    fn get_or_init(&mut self, key: &K, default: &V) -> Option<V> {
        if let Some(v) = self.get(key) {
            return Some(v);
        }
        self.put(key, default).ok().map(|()| *default)
    }

    fn update<F: FnOnce(&mut V)>(&mut self, key: &K, f: F) -> Option<V> {
        let Probe::Found(idx) = self.probe(key) else {
            return None;
        };
        match &mut self.slots.as_mut()[idx] {
            Slot::Occupied(_, v) => {
                f(v);
                Some(*v)
            }
            _ => None,
        }
    }

    fn remove(&mut self, key: &K) {
        let _ = self.take(key);
    }
}

impl<K: SlotKey, V: Copy, const N: usize> FixedMap<K, V, [Slot<K, V>; N]> {
    /// Map backed by an inline array of `N` slots
    pub fn inline() -> Self {
        Self::new([Slot::Empty; N])
    }
}
