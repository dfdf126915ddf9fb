//! Races between real threads on one machine.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use txcache_core::{AuditEventKind, StateKind, StatePolicy, TransactionId};
use txcache_test_utils::assertions::assert_state;
use txcache_test_utils::fixtures::{actor_update, static_machine_with};
use txcache_test_utils::{CountingStaticFactory, TestCache};

const THREADS: usize = 8;

fn slow_factory() -> CountingStaticFactory {
    CountingStaticFactory::new().with_delay(Duration::from_millis(20))
}

#[test]
fn test_racing_writers_observe_single_published_instance() {
    let (machine, factory, audit) = static_machine_with(slow_factory(), StatePolicy::Default);
    let barrier = Barrier::new(THREADS);

    let results: Vec<Arc<TestCache>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    machine.get_cache(TransactionId::new(), true).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let published = machine.get_cache_fast(TransactionId::new()).unwrap();
    for cache in &results {
        assert!(Arc::ptr_eq(cache, &published));
    }
    assert_eq!(
        audit.count(|event| event.kind
            == AuditEventKind::Switched {
                from: StateKind::Empty,
                to: StateKind::Initialized,
            }),
        1
    );
    // Losing writers built too, but nothing of theirs was published.
    assert!(factory.builds() >= 1);
    assert_eq!(published.commits(), 1);
}

#[test]
fn test_racing_readers_build_exactly_once() {
    let (machine, factory, _) = static_machine_with(slow_factory(), StatePolicy::Default);
    let barrier = Barrier::new(THREADS);

    let results: Vec<Arc<TestCache>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    machine.get_cache(TransactionId::new(), false).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(factory.builds(), 1);
    assert!(results.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
}

#[test]
fn test_concurrent_changes_are_all_tracked() {
    let (machine, _, _) = static_machine_with(CountingStaticFactory::new(), StatePolicy::Default);
    machine.get_cache(TransactionId::new(), true).unwrap();
    let transactions: Vec<TransactionId> = (0..THREADS).map(|_| TransactionId::new()).collect();
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for &tx in &transactions {
            let machine = &machine;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                machine.on_change(tx, &actor_update());
                assert!(machine.is_dirty_for_transaction(tx));
            });
        }
    });

    assert_eq!(machine.dirty_transaction_count(), THREADS);
    for tx in &transactions {
        assert!(machine.is_dirty_for_transaction(*tx));
    }
}

#[test]
fn test_exactly_one_completion_reports_all_done() {
    let (machine, _, audit) =
        static_machine_with(CountingStaticFactory::new(), StatePolicy::Isolated);
    machine.get_cache(TransactionId::new(), true).unwrap();
    let transactions: Vec<TransactionId> = (0..THREADS).map(|_| TransactionId::new()).collect();
    for tx in &transactions {
        machine.on_change(*tx, &actor_update());
    }
    let barrier = Barrier::new(THREADS);

    let flags: Vec<bool> = thread::scope(|scope| {
        let handles: Vec<_> = transactions
            .iter()
            .map(|&tx| {
                let machine = &machine;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    machine.before_transaction_complete(tx);
                    let all_done = machine.on_transaction_completed(tx);
                    assert!(!machine.is_dirty_for_transaction(tx));
                    all_done
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(flags.iter().filter(|&&done| done).count(), 1);
    assert_eq!(
        audit.count(|event| event.kind == AuditEventKind::AllTransactionsCompleted),
        1
    );
    assert_state(&machine, StateKind::Empty);
}

#[test]
fn test_writer_never_sees_own_invalidated_cache_under_contention() {
    let (machine, _, _) = static_machine_with(CountingStaticFactory::new(), StatePolicy::Isolated);
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for worker in 0..THREADS {
            let machine = &machine;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for _ in 0..25 {
                    let tx = TransactionId::new();
                    let before = machine.get_cache(tx, worker % 2 == 0).unwrap();
                    machine.on_change(tx, &actor_update());
                    let after = machine.get_cache(tx, worker % 2 == 0).unwrap();
                    assert!(!Arc::ptr_eq(&before, &after));
                    assert!(machine.is_dirty_for_transaction(tx));
                    machine.before_transaction_complete(tx);
                    machine.on_transaction_completed(tx);
                    assert!(!machine.is_dirty_for_transaction(tx));
                }
            });
        }
    });

    assert_eq!(machine.dirty_transaction_count(), 0);
}

#[test]
fn test_drop_races_with_builders() {
    let (machine, _, _) = static_machine_with(CountingStaticFactory::new(), StatePolicy::Default);
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        for worker in 0..THREADS {
            let machine = &machine;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    if worker == 0 {
                        machine.drop_cache();
                    } else {
                        machine.get_cache(TransactionId::new(), worker % 2 == 0).unwrap();
                    }
                }
            });
        }
    });

    machine.drop_cache();
    assert_state(&machine, StateKind::Empty);
    let fresh = machine.get_cache(TransactionId::new(), true).unwrap();
    assert_eq!(fresh.commits(), 1);
}
