use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tessera::future::{make_future, when_all_iter, Future, Promise};
use tessera::persona::{current_persona, ProgressLevel};
use tessera::when_all;

fn drain_here() {
    current_persona().progress(ProgressLevel::User);
}

#[test]
fn make_future_is_ready() {
    let f = make_future(5i32);
    assert!(f.ready());
    assert_eq!(f.result(), 5);
    assert_eq!(f.wait(), 5);
}

#[test]
fn promise_requires_exactly_k_plus_result() {
    let p = Promise::<u32>::new();
    let f = p.get_future();
    p.require_anonymous(3);

    p.fulfill_anonymous(1);
    assert!(!f.ready());
    p.fulfill_result(9);
    assert!(!f.ready(), "two anonymous requirements still outstanding");
    p.fulfill_anonymous(1);
    assert!(!f.ready());
    p.fulfill_anonymous(1);
    assert!(f.ready(), "ready exactly after k anonymous + result");
    assert_eq!(f.result(), 9);
}

#[test]
fn then_defers_through_the_current_persona() {
    let p = Promise::<u64>::new();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();
    let g = p.get_future().then(move |v| {
        ran2.fetch_add(1, Ordering::SeqCst);
        v + 1
    });
    p.fulfill_result(1);
    // readiness propagation is queued, not run inline
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(!g.ready());
    drain_here();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(g.result(), 2);
}

#[test]
fn then_lazy_short_circuits_when_ready() {
    let f = make_future(10i64);
    let g = f.then_lazy(|v| v * 2);
    // no progress needed
    assert!(g.ready());
    assert_eq!(g.result(), 20);
}

#[test]
fn continuations_run_in_fifo_order() {
    let p = Promise::<()>::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..4 {
        let order = order.clone();
        p.get_future().then(move |_| order.lock().push(i));
    }
    p.fulfill_result(());
    drain_here();
    assert_eq!(&*order.lock(), &[0, 1, 2, 3]);
}

#[test]
fn when_all_runs_once_after_both_with_results_in_order() {
    let pa = Promise::<u32>::new();
    let pb = Promise::<&'static str>::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();
    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    let joined = when_all!(pa.get_future(), pb.get_future());
    joined.then(move |vals| {
        runs2.fetch_add(1, Ordering::SeqCst);
        *seen2.lock() = Some(vals);
    });

    pb.fulfill_result("beta");
    drain_here();
    assert_eq!(runs.load(Ordering::SeqCst), 0, "one input still pending");

    pa.fulfill_result(7);
    drain_here();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock(), Some((7, "beta")));

    // repeated progress does not rerun the continuation
    drain_here();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn empty_when_all_is_ready() {
    let f: Future<()> = when_all!();
    assert!(f.ready());
}

#[test]
fn when_all_iter_collects_in_input_order() {
    let promises: Vec<Promise<usize>> = (0..6).map(|_| Promise::new()).collect();
    let joined = when_all_iter(promises.iter().map(|p| p.get_future()));
    // fulfill back to front
    for (i, p) in promises.iter().enumerate().rev() {
        p.fulfill_result(i * 10);
    }
    drain_here();
    assert!(joined.ready());
    assert_eq!(joined.result(), vec![0, 10, 20, 30, 40, 50]);
}

// A deterministic promise-driven scheduler: fib leaves are promises
// fulfilled in a deliberately scrambled order after the dependency
// graph is fully built.
fn fib(n: u64, leaves: &mut Vec<(Promise<u64>, u64)>) -> Future<u64> {
    if n < 2 {
        let p = Promise::new();
        leaves.push((p.clone(), n));
        p.get_future()
    } else {
        let a = fib(n - 1, leaves);
        let b = fib(n - 2, leaves);
        when_all!(a, b).then(|(x, y)| x + y)
    }
}

fn fib_scrambled(n: u64) -> u64 {
    let mut leaves = Vec::new();
    let f = fib(n, &mut leaves);
    // odd indices first, then even: a permutation unlike build order
    let len = leaves.len();
    for i in (1..len).step_by(2).chain((0..len).step_by(2)) {
        let (p, v) = &leaves[i];
        p.fulfill_result(*v);
    }
    f.wait()
}

#[test]
fn fib_via_futures() {
    assert_eq!(fib_scrambled(5), 5);
    assert_eq!(fib_scrambled(6), 8);
    assert_eq!(fib_scrambled(16), 987);
}

#[test]
fn multiple_observers_share_one_header() {
    let p = Promise::<u64>::new();
    let f1 = p.get_future();
    let f2 = f1.clone();
    p.fulfill_result(11);
    assert!(f1.ready() && f2.ready());
    assert_eq!(f1.result() + f2.result(), 22);
}
