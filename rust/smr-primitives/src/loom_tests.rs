#![cfg(all(test, loom))]

use crate::cirque::Cirque;
use crate::freestack::FreeStack;
use crate::lock::ShmLock;
use crate::region::HeapRegion;
use crate::sync::{AtomicU64, Ordering, thread};
use loom::sync::Arc;

#[test]
fn freestack_concurrent_pop_push() {
    loom::model(|| {
        let owner = Arc::new(HeapRegion::new_zeroed(FreeStack::required_size(2, 64)));
        let pool = Arc::new(unsafe { FreeStack::init(owner.region(), 0, 2, 64) });

        let handles: alloc::vec::Vec<_> = (0..2)
            .map(|_| {
                let pool = pool.clone();
                let owner = owner.clone();
                thread::spawn(move || {
                    let _keep = owner;
                    if let Some(i) = pool.pop() {
                        pool.push(i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(pool.free_count(), 2);
        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        assert_ne!(a, b);
        assert!(pool.pop().is_none());
    });
}

#[test]
fn freestack_never_hands_out_twice() {
    loom::model(|| {
        let owner = Arc::new(HeapRegion::new_zeroed(FreeStack::required_size(2, 64)));
        let pool = Arc::new(unsafe { FreeStack::init(owner.region(), 0, 2, 64) });

        let t_pool = pool.clone();
        let t_owner = owner.clone();
        let t = thread::spawn(move || {
            let _keep = t_owner;
            t_pool.pop()
        });
        let mine = pool.pop();
        let theirs = t.join().unwrap();

        assert!(mine.is_some() && theirs.is_some());
        assert_ne!(mine, theirs);
    });
}

#[test]
fn lock_excludes_second_holder() {
    loom::model(|| {
        let owner = Arc::new(HeapRegion::new_zeroed(64));
        {
            let lock: &mut ShmLock = unsafe { owner.region().get_mut(0) };
            lock.init();
        }
        let counter = Arc::new(AtomicU64::new(0));

        let handles: alloc::vec::Vec<_> = (0..2)
            .map(|_| {
                let owner = owner.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    let lock: &ShmLock = unsafe { owner.region().get(0) };
                    let _guard = lock.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    });
}

#[test]
fn cirque_producer_consumer_under_lock() {
    loom::model(|| {
        let queue_off = 64;
        let owner = Arc::new(HeapRegion::new_zeroed(
            queue_off + Cirque::<u64>::required_size(2),
        ));
        {
            let lock: &mut ShmLock = unsafe { owner.region().get_mut(0) };
            lock.init();
        }
        let queue = unsafe { Cirque::<u64>::init(owner.region(), queue_off, 2) };

        let p_owner = owner.clone();
        let p_queue = queue.clone();
        let producer = thread::spawn(move || {
            let lock: &ShmLock = unsafe { p_owner.region().get(0) };
            let _guard = lock.lock();
            p_queue.push(7).unwrap();
        });

        let lock: &ShmLock = unsafe { owner.region().get(0) };
        let seen = {
            let _guard = lock.lock();
            let v = queue.front().copied();
            if v.is_some() {
                queue.discard();
            }
            v
        };
        producer.join().unwrap();

        let _guard = lock.lock();
        match seen {
            Some(v) => {
                assert_eq!(v, 7);
                assert!(queue.is_empty());
            }
            None => assert_eq!(queue.front().copied(), Some(7)),
        }
    });
}
