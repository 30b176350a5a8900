use std::collections::HashMap;

#[derive(Clone, Copy, Debug)]
pub struct TimerNode {
    pub key: u64,
    pub expire_ms: u64,
}

/// Min-heap of user-scheduled async timers with a `key → heap index` side
/// map for O(log n) cancellation. Expiries are rounded to the nearest
/// coalesce-window multiple so timers landing close together share one
/// wakeup. The side map and the heap are consistent at every function
/// boundary.
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    id_map: HashMap<u64, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            id_map: HashMap::with_capacity(512),
        }
    }

    /// Rejects duplicate keys: at most one pending timer per connection.
    pub fn insert(&mut self, key: u64, expire_ms: u64, coalesce_ms: u64) -> bool {
        if self.id_map.contains_key(&key) {
            return false;
        }

        let expire = Self::round_to_bucket(expire_ms, coalesce_ms);
        let idx = self.heap.len();
        self.heap.push(TimerNode { key, expire_ms: expire });
        self.id_map.insert(key, idx);
        self.fix_heap(idx);
        true
    }

    /// Removing an absent key is a success (already expired or cancelled).
    pub fn remove(&mut self, key: u64) -> bool {
        let Some(&idx) = self.id_map.get(&key) else {
            return true;
        };
        self.id_map.remove(&key);

        let last = self.heap.len() - 1;
        if idx != last {
            self.heap.swap(idx, last);
            let moved_key = self.heap[idx].key;
            match self.id_map.get_mut(&moved_key) {
                Some(slot) => *slot = idx,
                // Map lost track of a live node: roll the swap back and
                // report failure rather than corrupt the heap
                None => {
                    self.heap.swap(idx, last);
                    self.id_map.insert(key, idx);
                    return false;
                }
            }
            self.heap.pop();
            self.fix_heap(idx);
        } else {
            self.heap.pop();
        }
        true
    }

    /// Pop the minimum iff it expired at or before `now_ms`.
    pub fn pop_expired(&mut self, now_ms: u64) -> Option<u64> {
        let min = self.heap.first()?;
        if min.expire_ms > now_ms {
            return None;
        }
        let key = min.key;
        self.remove(key);
        Some(key)
    }

    pub fn min(&self) -> Option<TimerNode> {
        self.heap.first().copied()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, key: u64) -> bool {
        self.id_map.contains_key(&key)
    }

    fn fix_heap(&mut self, mut idx: usize) {
        // Sift up
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[idx].expire_ms >= self.heap[parent].expire_ms {
                break;
            }
            self.swap_nodes(idx, parent);
            idx = parent;
        }

        // Then sift down
        let n = self.heap.len();
        loop {
            let mut smallest = idx;
            let l = 2 * idx + 1;
            let r = 2 * idx + 2;
            if l < n && self.heap[l].expire_ms < self.heap[smallest].expire_ms {
                smallest = l;
            }
            if r < n && self.heap[r].expire_ms < self.heap[smallest].expire_ms {
                smallest = r;
            }
            if smallest == idx {
                break;
            }
            self.swap_nodes(idx, smallest);
            idx = smallest;
        }
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let ka = self.heap[a].key;
        let kb = self.heap[b].key;
        if let Some(slot) = self.id_map.get_mut(&ka) {
            *slot = a;
        }
        if let Some(slot) = self.id_map.get_mut(&kb) {
            *slot = b;
        }
    }

    fn round_to_bucket(expire: u64, delta: u64) -> u64 {
        if delta == 0 {
            return expire;
        }
        (expire + delta / 2) / delta * delta
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_expiry_order() {
        let mut heap = TimerHeap::new();
        assert!(heap.insert(1, 300, 0));
        assert!(heap.insert(2, 100, 0));
        assert!(heap.insert(3, 200, 0));

        assert_eq!(heap.pop_expired(1000), Some(2));
        assert_eq!(heap.pop_expired(1000), Some(3));
        assert_eq!(heap.pop_expired(1000), Some(1));
        assert_eq!(heap.pop_expired(1000), None);
    }

    #[test]
    fn respects_now() {
        let mut heap = TimerHeap::new();
        heap.insert(7, 500, 0);
        assert_eq!(heap.pop_expired(499), None);
        assert_eq!(heap.pop_expired(500), Some(7));
    }

    #[test]
    fn rejects_duplicates() {
        let mut heap = TimerHeap::new();
        assert!(heap.insert(9, 100, 0));
        assert!(!heap.insert(9, 200, 0));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn coalesces_to_window_multiples() {
        let mut heap = TimerHeap::new();
        heap.insert(1, 104, 10);
        heap.insert(2, 106, 10);
        assert_eq!(heap.min().unwrap().expire_ms, 100);
        heap.remove(1);
        assert_eq!(heap.min().unwrap().expire_ms, 110);
    }

    #[test]
    fn remove_arbitrary_keeps_heap_consistent() {
        let mut heap = TimerHeap::new();
        for (k, e) in [(1u64, 50u64), (2, 10), (3, 40), (4, 20), (5, 30)] {
            heap.insert(k, e, 0);
        }
        assert!(heap.remove(3));
        assert!(heap.remove(3)); // absent removal is success
        assert!(!heap.contains(3));

        let mut order = Vec::new();
        while let Some(k) = heap.pop_expired(u64::MAX) {
            order.push(k);
        }
        assert_eq!(order, vec![2, 4, 5, 1]);
    }

    #[test]
    fn side_map_tracks_swaps() {
        let mut heap = TimerHeap::new();
        for k in 0..32u64 {
            heap.insert(k, 1000 - k, 0);
        }
        for k in (0..32u64).step_by(3) {
            assert!(heap.remove(k));
        }
        let mut last = 0;
        while let Some(k) = heap.pop_expired(u64::MAX) {
            let node_expire = 1000 - k;
            assert!(node_expire >= last);
            last = node_expire;
        }
        assert!(heap.is_empty());
    }
}
