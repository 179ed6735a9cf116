//! Bounded window of recently seen ids.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

type EvictHook<K> = Box<dyn FnMut(K) + Send>;

/// Remembers the last `capacity` distinct keys, oldest evicted first.
///
/// The eviction hook runs synchronously, exactly once for every key pushed out
/// of the window.
pub struct SeenWindow<K> {
    capacity: usize,
    order: VecDeque<K>,
    seen: HashSet<K>,
    on_evict: Option<EvictHook<K>>,
}

impl<K: Eq + Hash + Clone> SeenWindow<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
            on_evict: None,
        }
    }

    /// Call `hook` for every key that falls out of the window.
    pub fn with_eviction_hook(mut self, hook: impl FnMut(K) + Send + 'static) -> Self {
        self.on_evict = Some(Box::new(hook));
        self
    }

    /// Record `key`. Returns true if it was not already in the window.
    pub fn insert(&mut self, key: K) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        while self.order.len() >= self.capacity {
            let Some(old) = self.order.pop_front() else {
                break;
            };
            self.seen.remove(&old);
            if let Some(hook) = self.on_evict.as_mut() {
                hook(old);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Forget everything without running the hook.
    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

impl<K> std::fmt::Debug for SeenWindow<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeenWindow")
            .field("capacity", &self.capacity)
            .field("len", &self.order.len())
            .finish()
    }
}
