//! Open-addressed hash table (spec §4.4)
//!
//! Power-of-two capacity, linear probing, 75% max load. Used both for the
//! global environment and for per-object field/method tables, and (keyed
//! differently, see `find_string`) for the interned-string set.
//!
//! Keys are string object handles (`ObjRef`); the table itself never needs
//! to look at string *contents* to do ordinary get/set/delete — callers
//! supply the key's cached hash and an equality predicate, so this module
//! has no dependency on the heap or on how strings are stored.

use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;
const INITIAL_CAPACITY: usize = 8;

#[derive(Clone)]
enum Entry {
    Empty,
    Tombstone,
    Occupied { key: ObjRef, hash: u32, value: Value },
}

/// A hash table keyed by string handles. A bucket is empty, a tombstone
/// (deleted but still occupying a probe slot), or live.
#[derive(Clone)]
pub struct Table {
    entries: Vec<Entry>,
    /// Live entries only.
    live: usize,
    /// Live entries + tombstones; this is what's checked against the load
    /// factor, since tombstones still cost a probe step.
    occupied: usize,
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            live: 0,
            occupied: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Linear-probe starting at `hash mod capacity`. Returns the index of a
    /// matching live entry if one exists, otherwise the first available
    /// slot (preferring a tombstone over the terminating empty slot, so
    /// insertion reuses tombstones).
    fn find_slot(entries: &[Entry], hash: u32, mut matches: impl FnMut(ObjRef) -> bool) -> usize {
        let capacity = entries.len();
        let mut index = hash as usize % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            match &entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Occupied { key, hash: h, .. } => {
                    if *h == hash && matches(*key) {
                        return index;
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn get(&self, hash: u32, matches: impl FnMut(ObjRef) -> bool) -> Option<&Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_slot(&self.entries, hash, matches);
        match &self.entries[idx] {
            Entry::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn get_key(&self, hash: u32, matches: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_slot(&self.entries, hash, matches);
        match &self.entries[idx] {
            Entry::Occupied { key, .. } => Some(*key),
            _ => None,
        }
    }

    /// `find-string` (spec §4.4): used only during interning, to dedup a
    /// candidate string against the intern table by hash then content.
    /// Identical in implementation to `get_key`; kept as a separate name so
    /// call sites read the way the spec's operation list does.
    pub fn find_string(&self, hash: u32, matches_content: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        self.get_key(hash, matches_content)
    }

    /// Insert or overwrite. Returns `true` if this created a brand-new key.
    pub fn set(
        &mut self,
        key: ObjRef,
        hash: u32,
        value: Value,
        matches: impl FnMut(ObjRef) -> bool,
    ) -> bool {
        if self.entries.is_empty() {
            self.adjust_capacity(INITIAL_CAPACITY);
        } else if (self.occupied + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.adjust_capacity(self.capacity() * 2);
        }

        let idx = Self::find_slot(&self.entries, hash, matches);
        let is_new = !matches!(self.entries[idx], Entry::Occupied { .. });
        let was_empty = matches!(self.entries[idx], Entry::Empty);
        if is_new {
            self.live += 1;
            if was_empty {
                self.occupied += 1;
            }
        }
        self.entries[idx] = Entry::Occupied { key, hash, value };
        is_new
    }

    /// Delete replaces the bucket with a tombstone so later probes that
    /// skipped past it keep working.
    pub fn delete(&mut self, hash: u32, matches: impl FnMut(ObjRef) -> bool) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Self::find_slot(&self.entries, hash, matches);
        if matches!(self.entries[idx], Entry::Occupied { .. }) {
            self.entries[idx] = Entry::Tombstone;
            self.live -= 1;
            true
        } else {
            false
        }
    }

    fn adjust_capacity(&mut self, new_capacity: usize) {
        let mut new_entries = (0..new_capacity).map(|_| Entry::Empty).collect::<Vec<_>>();
        let mut live = 0;
        for entry in std::mem::take(&mut self.entries) {
            if let Entry::Occupied { key, hash, value } = entry {
                let idx = Self::find_slot(&new_entries, hash, |_| false);
                new_entries[idx] = Entry::Occupied { key, hash, value };
                live += 1;
            }
        }
        self.entries = new_entries;
        self.live = live;
        self.occupied = live;
    }

    /// GC sweep support: drop every entry whose key string was not marked
    /// reachable this cycle, so freed strings don't leave dangling keys
    /// (spec §4.5).
    pub fn remove_white(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Entry::Occupied { key, .. } = entry {
                if !is_marked(*key) {
                    *entry = Entry::Tombstone;
                    self.live -= 1;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &Value)> {
        self.entries.iter().filter_map(|e| match e {
            Entry::Occupied { key, value, .. } => Some((*key, value)),
            _ => None,
        })
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(n: u32) -> ObjRef {
        ObjRef::for_test(n)
    }

    #[test]
    fn set_and_get_roundtrip() {
        let mut t = Table::new();
        assert!(t.set(r(1), 100, Value::Number(1.0), |k| k == r(1)));
        assert_eq!(t.get(100, |k| k == r(1)), Some(&Value::Number(1.0)));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn overwrite_does_not_grow_live_count() {
        let mut t = Table::new();
        t.set(r(1), 100, Value::Number(1.0), |k| k == r(1));
        let was_new = t.set(r(1), 100, Value::Number(2.0), |k| k == r(1));
        assert!(!was_new);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(100, |k| k == r(1)), Some(&Value::Number(2.0)));
    }

    #[test]
    fn delete_then_reinsert_reuses_tombstone() {
        let mut t = Table::new();
        t.set(r(1), 1, Value::Nil, |k| k == r(1));
        t.set(r(2), 1, Value::Nil, |k| k == r(2)); // same bucket (hash collision)
        assert!(t.delete(1, |k| k == r(1)));
        assert_eq!(t.get(1, |k| k == r(1)), None);
        // r(2) must still be reachable: the tombstone left by deleting r(1)
        // must not break the probe sequence to r(2).
        assert_eq!(t.get(1, |k| k == r(2)), Some(&Value::Nil));
    }

    #[test]
    fn grows_past_75_percent_load() {
        let mut t = Table::new();
        for i in 0..100 {
            t.set(r(i), i, Value::Number(i as f64), move |k| k == r(i));
        }
        assert_eq!(t.len(), 100);
        for i in 0..100 {
            assert_eq!(t.get(i, move |k| k == r(i)), Some(&Value::Number(i as f64)));
        }
    }

    #[test]
    fn remove_white_drops_unmarked_keys() {
        let mut t = Table::new();
        t.set(r(1), 1, Value::Nil, |k| k == r(1));
        t.set(r(2), 2, Value::Nil, |k| k == r(2));
        t.remove_white(|k| k == r(1));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(1, |k| k == r(1)), Some(&Value::Nil));
        assert_eq!(t.get(2, |k| k == r(2)), None);
    }
}
