use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{pack, unpack};

struct Node<T> {
    item: MaybeUninit<T>,
    next: AtomicU64,
}

impl<T> Node<T> {
    fn boxed() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            item: MaybeUninit::uninit(),
            next: AtomicU64::new(pack::<Node<T>>(ptr::null_mut(), 0)),
        }))
    }
}

/// Michael–Scott FIFO queue over a head/tail pair of tagged pointers, with
/// a sentinel node. Same reclamation scheme as [`super::Stack`]: retired
/// sentinels are recycled on a spare list, and generation tags keep every
/// CAS honest against recycled addresses.
pub struct Queue<T> {
    head: AtomicU64,
    tail: AtomicU64,
    spare: AtomicU64,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    pub fn new() -> Self {
        let sentinel = Node::<T>::boxed();
        Queue {
            head: AtomicU64::new(pack(sentinel, 0)),
            tail: AtomicU64::new(pack(sentinel, 0)),
            spare: AtomicU64::new(pack::<Node<T>>(ptr::null_mut(), 0)),
            _marker: PhantomData,
        }
    }

    pub fn enqueue(&self, item: T) {
        let node = self.acquire_node(item);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let (tail_ptr, tail_tag) = unpack::<Node<T>>(tail);
            let next = unsafe { (*tail_ptr).next.load(Ordering::Acquire) };
            let (next_ptr, next_tag) = unpack::<Node<T>>(next);
            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if next_ptr.is_null() {
                if unsafe {
                    (*tail_ptr)
                        .next
                        .compare_exchange_weak(
                            next,
                            pack(node, next_tag.wrapping_add(1)),
                            Ordering::Release,
                            Ordering::Acquire,
                        )
                        .is_ok()
                } {
                    // Swing the tail; losing this CAS just means someone helped.
                    let _ = self.tail.compare_exchange(
                        tail,
                        pack(node, tail_tag.wrapping_add(1)),
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return;
                }
            } else {
                // Tail is lagging; help it forward.
                let _ = self.tail.compare_exchange(
                    tail,
                    pack(next_ptr, tail_tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }
        }
    }

    pub fn dequeue(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (head_ptr, head_tag) = unpack::<Node<T>>(head);
            let tail = self.tail.load(Ordering::Acquire);
            let (tail_ptr, tail_tag) = unpack::<Node<T>>(tail);
            let next = unsafe { (*head_ptr).next.load(Ordering::Acquire) };
            let (next_ptr, _) = unpack::<Node<T>>(next);
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }
            if next_ptr.is_null() {
                return None;
            }
            if head_ptr == tail_ptr {
                // Sentinel still equals tail: an enqueue is mid-flight.
                let _ = self.tail.compare_exchange(
                    tail,
                    pack(next_ptr, tail_tag.wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }
            // Copy the payload before the CAS: if another dequeuer wins, the
            // copy is discarded unread, so the race on the recycled node is
            // confined to this byte copy.
            let item = unsafe { (*next_ptr).item.as_ptr().read() };
            if self
                .head
                .compare_exchange_weak(
                    head,
                    pack(next_ptr, head_tag.wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // The old sentinel is now exclusively ours to retire.
                self.release_node(head_ptr);
                return Some(item);
            }
            std::mem::forget(item);
        }
    }

    pub fn is_empty(&self) -> bool {
        let (head_ptr, _) = unpack::<Node<T>>(self.head.load(Ordering::Acquire));
        let (next_ptr, _) = unpack::<Node<T>>(unsafe { (*head_ptr).next.load(Ordering::Acquire) });
        next_ptr.is_null()
    }

    fn acquire_node(&self, item: T) -> *mut Node<T> {
        loop {
            let spare = self.spare.load(Ordering::Acquire);
            let (node, tag) = unpack::<Node<T>>(spare);
            if node.is_null() {
                let fresh = Node::<T>::boxed();
                unsafe { (*fresh).item.as_mut_ptr().write(item) };
                return fresh;
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
                unsafe {
                    let next_tag = unpack::<Node<T>>((*node).next.load(Ordering::Relaxed)).1;
                    (*node)
                        .next
                        .store(pack::<Node<T>>(ptr::null_mut(), next_tag.wrapping_add(1)), Ordering::Relaxed);
                    (*node).item.as_mut_ptr().write(item);
                }
                return node;
            }
        }
    }

    fn release_node(&self, node: *mut Node<T>) {
        loop {
            let spare = self.spare.load(Ordering::Acquire);
            let (spare_ptr, tag) = unpack::<Node<T>>(spare);
            unsafe {
                let next_tag = unpack::<Node<T>>((*node).next.load(Ordering::Relaxed)).1;
                (*node)
                    .next
                    .store(pack(spare_ptr, next_tag.wrapping_add(1)), Ordering::Relaxed);
            }
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

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
        // Free the remaining sentinel chain and the spare list.
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
    fn enqueue_dequeue_fifo() {
        let queue = Queue::new();
        assert!(queue.is_empty());
        queue.enqueue(10u32);
        queue.enqueue(20);
        queue.enqueue(30);
        assert_eq!(queue.dequeue(), Some(10));
        queue.enqueue(40);
        assert_eq!(queue.dequeue(), Some(20));
        assert_eq!(queue.dequeue(), Some(30));
        assert_eq!(queue.dequeue(), Some(40));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn sentinel_recycling_preserves_order() {
        let queue = Queue::new();
        for round in 0..128u64 {
            queue.enqueue(round);
        }
        for round in 0..128u64 {
            assert_eq!(queue.dequeue(), Some(round));
        }
        assert!(queue.is_empty());
    }
}
