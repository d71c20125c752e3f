//! Fixed-capacity containers for long-uptime caches.
//!
//! Eviction is strict FIFO by insertion order. The set/map variants keep a
//! companion order queue; the lookup structure may briefly hold more entries
//! than the queue, and is intersected back to the queue's contents once it
//! outgrows the capacity by more than [`SET_SLACK`].

use std::collections::{HashMap, HashSet, VecDeque};

/// How far a lookup set may outgrow its order queue before it is rebuilt.
pub const SET_SLACK: usize = 100;

/// FIFO-bounded set of string keys.
#[derive(Debug)]
pub struct BoundedSet {
    set: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl BoundedSet {
    pub fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    /// Insert a key. Returns false if it was already present.
    pub fn insert(&mut self, value: impl Into<String>) -> bool {
        let value = value.into();
        if self.set.contains(&value) {
            return false;
        }
        self.set.insert(value.clone());
        self.order.push_back(value);
        if self.order.len() > self.cap {
            self.order.pop_front();
        }
        if self.set.len() > self.cap + SET_SLACK {
            self.rebuild();
        }
        true
    }

    pub fn contains(&self, value: &str) -> bool {
        self.set.contains(value)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    fn rebuild(&mut self) {
        let live: HashSet<&String> = self.order.iter().collect();
        self.set.retain(|k| live.contains(k));
    }
}

/// FIFO-bounded map keyed by string.
#[derive(Debug)]
pub struct BoundedMap<V> {
    map: HashMap<String, V>,
    order: VecDeque<String>,
    cap: usize,
}

impl<V> BoundedMap<V> {
    pub fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    /// Insert or update. Only a brand-new key takes an order slot; updating
    /// an existing key never evicts anything.
    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        let existed = self.map.insert(key.clone(), value).is_some();
        if existed {
            return;
        }
        self.order.push_back(key);
        if self.order.len() > self.cap {
            self.order.pop_front();
        }
        if self.map.len() > self.cap + SET_SLACK {
            self.rebuild();
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn rebuild(&mut self) {
        let live: HashSet<&String> = self.order.iter().collect();
        self.map.retain(|k, _| live.contains(k));
    }
}

/// Plain FIFO ring of values (no lookup side).
#[derive(Debug)]
pub struct BoundedRing<T> {
    items: VecDeque<T>,
    cap: usize,
}

impl<T> BoundedRing<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        if self.items.len() > self.cap {
            self.items.pop_front();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// The newest `n` items, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<T>
    where
        T: Clone,
    {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: PartialEq> BoundedRing<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_evicts_fifo() {
        let mut s = BoundedSet::new(3);
        for i in 0..5 {
            assert!(s.insert(i.to_string()));
        }
        // Order queue holds only the newest 3; the set still remembers all 5
        // until slack is exceeded.
        assert!(s.contains("4"));
        assert!(s.contains("2"));
        assert!(!s.insert("4"));
    }

    #[test]
    fn set_rebuilds_past_slack() {
        let mut s = BoundedSet::new(10);
        for i in 0..(10 + SET_SLACK + 5) {
            s.insert(format!("k{i}"));
        }
        // After the rebuild the set tracks the order queue again.
        assert!(s.len() <= 10 + SET_SLACK);
        assert!(s.contains(&format!("k{}", 10 + SET_SLACK + 4)));
        assert!(!s.contains("k0"));
    }

    #[test]
    fn map_keeps_newest_values() {
        let mut m = BoundedMap::new(2);
        m.insert("a", 1);
        m.insert("b", 2);
        m.insert("a", 3);
        assert_eq!(m.get("a"), Some(&3));
    }

    #[test]
    fn map_repeated_key_updates_without_taking_order_slots() {
        let mut m = BoundedMap::new(2);
        m.insert("a", 1);
        m.insert("a", 2);
        m.insert("a", 3);
        // Still one entry, one order slot.
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("a"), Some(&3));

        // The rest of the queue is free for other keys: "b" keeps its slot
        // through the updates, and "c" evicts "a" (the oldest), not "b".
        m.insert("b", 4);
        m.insert("a", 5);
        m.insert("c", 6);
        assert_eq!(m.get("b"), Some(&4));
        assert_eq!(m.get("c"), Some(&6));
    }

    #[test]
    fn map_rebuilds_past_slack() {
        let mut m = BoundedMap::new(10);
        for i in 0..(10 + SET_SLACK + 5) {
            m.insert(format!("k{i}"), i);
        }
        assert!(m.len() <= 10 + SET_SLACK);
        assert!(m.get(&format!("k{}", 10 + SET_SLACK + 4)).is_some());
        assert!(m.get("k0").is_none());
    }

    #[test]
    fn ring_last_n_is_oldest_first() {
        let mut r = BoundedRing::new(4);
        for i in 0..6 {
            r.push(i);
        }
        assert_eq!(r.last_n(3), vec![3, 4, 5]);
        assert_eq!(r.len(), 4);
        assert!(r.contains(&5));
        assert!(!r.contains(&1));
    }
}
