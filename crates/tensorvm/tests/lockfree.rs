//! Lock-free conservation: under N concurrent threads each performing M
//! operations, the structures neither lose nor duplicate items. Payloads
//! are tagged per thread so every item is distinguishable.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use tensorvm::sync::{Queue, Stack};

const THREADS: u64 = 8;
const ITEMS: u64 = 2_000;

fn tag(thread: u64, item: u64) -> u64 {
    (thread << 32) | item
}

#[test]
fn concurrent_stack_conserves_tagged_items() {
    let stack = Arc::new(Stack::new());
    let popped = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let stack = Arc::clone(&stack);
            let popped = Arc::clone(&popped);
            thread::spawn(move || {
                let mut local = Vec::new();
                for i in 0..ITEMS {
                    stack.push(tag(t, i));
                    // Interleave pops so free-list style traffic is mixed,
                    // tolerating momentary emptiness.
                    if i % 2 == 1 {
                        if let Some(v) = stack.pop() {
                            local.push(v);
                        }
                    }
                }
                popped.lock().unwrap().extend(local);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut seen = popped.lock().unwrap().clone();
    while let Some(v) = stack.pop() {
        seen.push(v);
    }

    assert_eq!(seen.len() as u64, THREADS * ITEMS);
    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(unique.len() as u64, THREADS * ITEMS, "item duplicated or lost");
    for t in 0..THREADS {
        for i in 0..ITEMS {
            assert!(unique.contains(&tag(t, i)));
        }
    }
}

#[test]
fn concurrent_queue_conserves_tagged_items() {
    let queue = Arc::new(Queue::new());
    let popped = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let queue = Arc::clone(&queue);
            let popped = Arc::clone(&popped);
            thread::spawn(move || {
                let mut local = Vec::new();
                for i in 0..ITEMS {
                    queue.enqueue(tag(t, i));
                    if i % 3 == 2 {
                        if let Some(v) = queue.dequeue() {
                            local.push(v);
                        }
                    }
                }
                popped.lock().unwrap().extend(local);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut seen = popped.lock().unwrap().clone();
    while let Some(v) = queue.dequeue() {
        seen.push(v);
    }

    assert_eq!(seen.len() as u64, THREADS * ITEMS);
    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(unique.len() as u64, THREADS * ITEMS, "item duplicated or lost");
}

#[test]
fn queue_preserves_order_between_one_producer_and_one_consumer() {
    let queue = Arc::new(Queue::new());
    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            for i in 0..10_000u64 {
                queue.enqueue(i);
            }
        })
    };
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut expected = 0u64;
            while expected < 10_000 {
                if let Some(v) = queue.dequeue() {
                    assert_eq!(v, expected, "FIFO order violated");
                    expected += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        })
    };
    producer.join().unwrap();
    consumer.join().unwrap();
}
