//! Arena-backed binary min-heap with stable handles
//!
//! Elements live in a slot arena; the heap orders slot indices. A [`Handle`]
//! stays valid while its element is queued, so callers can mutate an element
//! in place and restore the heap property with [`IndexedHeap::fix`].

use std::cmp::Ordering;

/// Total order used by an [`IndexedHeap`]. `Less` pops first.
pub trait HeapOrder {
    fn heap_cmp(&self, other: &Self) -> Ordering;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

#[derive(Debug)]
struct Slot<T> {
    value: T,
    /// Position of this slot inside `IndexedHeap::order`
    position: usize,
}

#[derive(Debug)]
pub struct IndexedHeap<T> {
    slots: Vec<Option<Slot<T>>>,
    free: Vec<usize>,
    order: Vec<usize>,
}

impl<T: HeapOrder> IndexedHeap<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn push(&mut self, value: T) -> Handle {
        let position = self.order.len();
        let slot = Slot { value, position };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.order.push(index);
        self.sift_up(position);
        Handle(index)
    }

    pub fn peek(&self) -> Option<&T> {
        self.order.first().and_then(|index| self.value(*index))
    }

    pub fn peek_handle(&self) -> Option<Handle> {
        self.order.first().map(|index| Handle(*index))
    }

    pub fn pop(&mut self) -> Option<T> {
        let handle = self.peek_handle()?;
        self.remove(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.value(handle.0)
    }

    /// Mutable access. Call [`fix`](Self::fix) after changing ordering fields.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.0)
            .and_then(|slot| slot.as_mut())
            .map(|slot| &mut slot.value)
    }

    /// Restore the heap property around one element after it changed.
    pub fn fix(&mut self, handle: Handle) {
        let Some(position) = self.position(handle.0) else {
            return;
        };
        if !self.sift_down(position) {
            self.sift_up(position);
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let position = self.position(handle.0)?;
        let last = self.order.len() - 1;
        self.swap(position, last);
        self.order.pop();
        let slot = self.slots[handle.0].take()?;
        self.free.push(handle.0);
        if position < self.order.len() {
            self.fix(Handle(self.order[position]));
        }
        Some(slot.value)
    }

    /// Re-establish the heap property after arbitrary mutation of every element.
    pub fn rebuild(&mut self) {
        for position in (0..self.order.len() / 2).rev() {
            self.sift_down(position);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.order.iter().filter_map(|index| self.value(*index))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.as_mut())
            .map(|slot| &mut slot.value)
    }

    /// Remove every element, in no particular order.
    pub fn drain(&mut self) -> Vec<T> {
        self.order.clear();
        self.free.clear();
        self.slots
            .drain(..)
            .flatten()
            .map(|slot| slot.value)
            .collect()
    }

    fn value(&self, index: usize) -> Option<&T> {
        self.slots
            .get(index)
            .and_then(|slot| slot.as_ref())
            .map(|slot| &slot.value)
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.slots
            .get(index)
            .and_then(|slot| slot.as_ref())
            .map(|slot| slot.position)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        match (self.value(self.order[a]), self.value(self.order[b])) {
            (Some(x), Some(y)) => x.heap_cmp(y) == Ordering::Less,
            _ => false,
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.order.swap(a, b);
        for position in [a, b] {
            let index = self.order[position];
            if let Some(slot) = self.slots[index].as_mut() {
                slot.position = position;
            }
        }
    }

    fn sift_up(&mut self, mut position: usize) {
        while position > 0 {
            let parent = (position - 1) / 2;
            if !self.less(position, parent) {
                break;
            }
            self.swap(position, parent);
            position = parent;
        }
    }

    /// Returns true if the element moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let len = self.order.len();
        let mut position = start;
        loop {
            let left = 2 * position + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, position) {
                break;
            }
            self.swap(position, child);
            position = child;
        }
        position > start
    }
}

impl<T: HeapOrder> Default for IndexedHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Item(i64);

    impl HeapOrder for Item {
        fn heap_cmp(&self, other: &Self) -> Ordering {
            self.0.cmp(&other.0)
        }
    }

    fn drain_sorted(heap: &mut IndexedHeap<Item>) -> Vec<i64> {
        std::iter::from_fn(|| heap.pop()).map(|item| item.0).collect()
    }

    #[test]
    fn test_pops_in_order() {
        let mut heap = IndexedHeap::new();
        for v in [5, 1, 4, 2, 3, 0] {
            heap.push(Item(v));
        }
        assert_eq!(heap.peek().unwrap().0, 0);
        assert_eq!(drain_sorted(&mut heap), vec![0, 1, 2, 3, 4, 5]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_handles_survive_sifting() {
        let mut heap = IndexedHeap::new();
        let handles: Vec<Handle> = (0..8).map(|v| heap.push(Item(v * 10))).collect();

        heap.get_mut(handles[7]).unwrap().0 = -1;
        heap.fix(handles[7]);
        heap.get_mut(handles[0]).unwrap().0 = 100;
        heap.fix(handles[0]);

        assert_eq!(heap.get(handles[3]).unwrap().0, 30);
        assert_eq!(heap.peek_handle(), Some(handles[7]));
        assert_eq!(
            drain_sorted(&mut heap),
            vec![-1, 10, 20, 30, 40, 50, 60, 100]
        );
    }

    #[test]
    fn test_remove_and_reuse_slots() {
        let mut heap = IndexedHeap::new();
        let a = heap.push(Item(3));
        let b = heap.push(Item(1));
        heap.push(Item(2));

        assert_eq!(heap.remove(b).unwrap().0, 1);
        assert!(heap.get(b).is_none());
        assert!(heap.remove(b).is_none());

        let c = heap.push(Item(0));
        assert_eq!(heap.peek_handle(), Some(c));
        assert_eq!(heap.get(a).unwrap().0, 3);
        assert_eq!(drain_sorted(&mut heap), vec![0, 2, 3]);
    }

    #[test]
    fn test_rebuild_after_bulk_update() {
        let mut heap = IndexedHeap::new();
        for v in 0..10 {
            heap.push(Item(v));
        }
        for item in heap.iter_mut() {
            item.0 = -item.0;
        }
        heap.rebuild();
        assert_eq!(heap.peek().unwrap().0, -9);
        assert_eq!(heap.len(), 10);
    }
}
