//! Binary min-heap.
//!
//! A plain array-backed heap with explicit sift-up / sift-down. After every
//! mutation each parent is `<=` both of its children.

use paymaster_core::error::HeapError;

/// Array-backed binary min-heap.
#[derive(Debug, Clone)]
pub struct MinHeap<T: Ord> {
    values: Vec<T>,
}

impl<T: Ord> Default for MinHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> MinHeap<T> {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Create an empty heap with room for `capacity` values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
        }
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the heap holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Insert a value, restoring the heap order by sifting it up.
    pub fn insert(&mut self, value: T) {
        self.values.push(value);
        self.sift_up(self.values.len() - 1);
    }

    /// Smallest value without removing it.
    pub fn peek_min(&self) -> Result<&T, HeapError> {
        self.values.first().ok_or(HeapError::EmptyHeap)
    }

    /// Remove and return the smallest value.
    pub fn pop_min(&mut self) -> Result<T, HeapError> {
        if self.values.is_empty() {
            return Err(HeapError::EmptyHeap);
        }
        let last = self.values.len() - 1;
        self.values.swap(0, last);
        let min = self.values.pop().ok_or(HeapError::EmptyHeap)?;
        if !self.values.is_empty() {
            self.sift_down(0);
        }
        Ok(min)
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.values[index] < self.values[parent] {
                self.values.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.values.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.values[left] < self.values[smallest] {
                smallest = left;
            }
            if right < len && self.values[right] < self.values[smallest] {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.values.swap(index, smallest);
            index = smallest;
        }
    }

    #[cfg(test)]
    fn is_valid(&self) -> bool {
        (1..self.values.len()).all(|i| self.values[(i - 1) / 2] <= self.values[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_heap_errors() {
        let mut heap: MinHeap<u64> = MinHeap::new();
        assert_eq!(heap.peek_min(), Err(HeapError::EmptyHeap));
        assert_eq!(heap.pop_min(), Err(HeapError::EmptyHeap));
        assert!(heap.is_empty());
    }

    #[test]
    fn returns_elements_in_ascending_order() {
        let mut heap = MinHeap::new();
        for v in (0..10u64).rev() {
            heap.insert(v);
        }
        for expected in 0..10u64 {
            assert_eq!(*heap.peek_min().unwrap(), expected);
            assert_eq!(heap.pop_min().unwrap(), expected);
        }
        assert!(heap.is_empty());
    }

    #[test]
    fn keeps_duplicates() {
        let mut heap = MinHeap::new();
        for v in [5u64, 1, 5, 1, 3] {
            heap.insert(v);
        }
        let drained: Vec<u64> = std::iter::from_fn(|| heap.pop_min().ok()).collect();
        assert_eq!(drained, vec![1, 1, 3, 5, 5]);
    }

    #[test]
    fn orders_tuples_lexicographically() {
        let mut heap = MinHeap::with_capacity(3);
        heap.insert((20u64, 0usize));
        heap.insert((10, 2));
        heap.insert((10, 1));
        assert_eq!(heap.pop_min().unwrap(), (10, 1));
        assert_eq!(heap.pop_min().unwrap(), (10, 2));
        assert_eq!(heap.pop_min().unwrap(), (20, 0));
    }

    #[test]
    fn interleaved_insert_and_pop() {
        let mut heap = MinHeap::new();
        heap.insert(7u64);
        heap.insert(3);
        assert_eq!(heap.pop_min().unwrap(), 3);
        heap.insert(1);
        heap.insert(9);
        assert_eq!(heap.pop_min().unwrap(), 1);
        assert_eq!(heap.pop_min().unwrap(), 7);
        assert_eq!(heap.len(), 1);
    }

    proptest! {
        #[test]
        fn invariant_holds_after_every_mutation(ops in proptest::collection::vec(proptest::option::of(0u64..1_000), 0..200)) {
            let mut heap = MinHeap::new();
            for op in ops {
                match op {
                    Some(v) => heap.insert(v),
                    None => { let _ = heap.pop_min(); }
                }
                prop_assert!(heap.is_valid());
            }
        }

        #[test]
        fn drains_sorted(values in proptest::collection::vec(any::<u64>(), 0..100)) {
            let mut heap = MinHeap::new();
            for v in &values {
                heap.insert(*v);
            }
            let mut sorted = values.clone();
            sorted.sort_unstable();
            let drained: Vec<u64> = std::iter::from_fn(|| heap.pop_min().ok()).collect();
            prop_assert_eq!(drained, sorted);
        }
    }
}
