use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{pack, unpack};

struct Node<T> {
    item: MaybeUninit<T>,
    next: AtomicU64,
}

/// Treiber stack: `push`/`pop` safe under arbitrary concurrent callers,
/// lock-free but not wait-free.
///
/// Popped nodes are recycled on an internal spare list instead of being
/// returned to the allocator, so a racing reader dereferencing a just-popped
/// node always touches live memory; the generation tag in the head word
/// rejects any CAS against a recycled node.
pub struct Stack<T> {
    head: AtomicU64,
    spare: AtomicU64,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    pub fn new() -> Self {
        Stack {
            head: AtomicU64::new(pack::<Node<T>>(ptr::null_mut(), 0)),
            spare: AtomicU64::new(pack::<Node<T>>(ptr::null_mut(), 0)),
            _marker: PhantomData,
        }
    }

    pub fn push(&self, item: T) {
        let node = self.acquire_node(item);
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (head_ptr, tag) = unpack::<Node<T>>(head);
            unsafe { (*node).next.store(pack(head_ptr, 0), Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(node, tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (head_ptr, tag) = unpack::<Node<T>>(head);
            if head_ptr.is_null() {
                return None;
            }
            let (next_ptr, _) = unpack::<Node<T>>(unsafe { (*head_ptr).next.load(Ordering::Acquire) });
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(next_ptr, tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // The winner owns the unlinked node exclusively.
                let item = unsafe { (*head_ptr).item.as_ptr().read() };
                self.release_node(head_ptr);
                return Some(item);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let (head_ptr, _) = unpack::<Node<T>>(self.head.load(Ordering::Acquire));
        head_ptr.is_null()
    }

    fn acquire_node(&self, item: T) -> *mut Node<T> {
        loop {
            let spare = self.spare.load(Ordering::Acquire);
            let (node, tag) = unpack::<Node<T>>(spare);
            if node.is_null() {
                return Box::into_raw(Box::new(Node {
                    item: MaybeUninit::new(item),
                    next: AtomicU64::new(pack::<Node<T>>(ptr::null_mut(), 0)),
                }));
            }
            let (next_ptr, _) = unpack::<Node<T>>(unsafe { (*node).next.load(Ordering::Acquire) });
            if self
                .spare
                .compare_exchange_weak(
                    spare,
                    pack(next_ptr, tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                unsafe { (*node).item.as_mut_ptr().write(item) };
                return node;
            }
        }
    }

    fn release_node(&self, node: *mut Node<T>) {
        loop {
            let spare = self.spare.load(Ordering::Acquire);
            let (spare_ptr, tag) = unpack::<Node<T>>(spare);
            unsafe { (*node).next.store(pack(spare_ptr, 0), Ordering::Relaxed) };
            if self
                .spare
                .compare_exchange_weak(
                    spare,
                    pack(node, tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
        }
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // Exclusive access: drain live items, then free both node chains.
        while self.pop().is_some() {}
        for list in [&self.head, &self.spare] {
            let (mut node, _) = unpack::<Node<T>>(list.load(Ordering::Relaxed));
            while !node.is_null() {
                let boxed = unsafe { Box::from_raw(node) };
                let (next, _) = unpack::<Node<T>>(boxed.next.load(Ordering::Relaxed));
                node = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_lifo() {
        let stack = Stack::new();
        stack.push(1u32);
        stack.push(2);
        stack.push(3);
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        stack.push(4);
        assert_eq!(stack.pop(), Some(4));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn recycles_nodes_across_generations() {
        let stack = Stack::new();
        for round in 0..64u64 {
            stack.push(round);
            assert_eq!(stack.pop(), Some(round));
        }
        assert!(stack.is_empty());
    }
}
