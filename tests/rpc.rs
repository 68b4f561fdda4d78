use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use serial_test::serial;
use tessera::active_messaging::RemoteFn;
use tessera::future::Future;
use tessera::global_ptr::GlobalPtr;
use tessera::persona::ProgressLevel;
use tessera::register_remote_fn;
use tessera::runtime::Runtime;
use tessera::serialize::View;

fn drive_until(rts: &[Runtime], mut done: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        for rt in rts {
            rt.progress(ProgressLevel::User);
        }
        if done() {
            return;
        }
    }
    panic!("no completion within bounded progress cycles");
}

// ---- S1: shared counter increments ----

#[derive(Serialize, Deserialize)]
struct FetchAdd {
    counter: GlobalPtr<AtomicI64>,
    amount: i64,
}

impl RemoteFn for FetchAdd {
    type Output = i64;
    const NAME: &'static str = concat!(module_path!(), "::FetchAdd");
    fn call(self, rt: &Runtime) -> i64 {
        let p = rt.localize(self.counter);
        unsafe { (*p.as_ptr()).fetch_add(self.amount, Ordering::SeqCst) }
    }
}
register_remote_fn!(FetchAdd);

#[test]
#[serial]
fn shared_counter_increments() {
    let rts = Runtime::cluster(2);
    let counter = rts[0].new_with(|| AtomicI64::new(0)).unwrap();

    let mut futs: Vec<Future<i64>> = Vec::new();
    for rt in &rts {
        for _ in 0..10 {
            futs.push(rt.rpc(
                0,
                FetchAdd {
                    counter,
                    amount: 1,
                },
            ));
        }
    }
    drive_until(&rts, || futs.iter().all(|f| f.ready()));

    let p = rts[0].localize(counter);
    assert_eq!(unsafe { (*p.as_ptr()).load(Ordering::SeqCst) }, 20);

    // every fetch-add observed a distinct prior value
    let mut seen: Vec<i64> = futs.iter().map(|f| f.result()).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..20).collect::<Vec<i64>>());
    unsafe { rts[0].delete_(counter) };
}

// ---- invariant: rpc result equals fn applied at the target, args
// deserialized (and the body run) exactly once per call ----

static SCALE_CALLS: AtomicUsize = AtomicUsize::new(0);

#[derive(Serialize, Deserialize)]
struct Scale {
    value: i64,
    by: i64,
}

impl RemoteFn for Scale {
    type Output = i64;
    const NAME: &'static str = concat!(module_path!(), "::Scale");
    fn call(self, _rt: &Runtime) -> i64 {
        SCALE_CALLS.fetch_add(1, Ordering::SeqCst);
        self.value * self.by
    }
}
register_remote_fn!(Scale);

#[test]
#[serial]
fn rpc_result_matches_and_executes_once() {
    let rts = Runtime::cluster(2);
    SCALE_CALLS.store(0, Ordering::SeqCst);
    let f1 = rts[0].rpc(1, Scale { value: 6, by: 7 });
    let f2 = rts[0].rpc(1, Scale { value: -3, by: 5 });
    let f3 = rts[1].rpc(0, Scale { value: 2, by: 2 });
    drive_until(&rts, || f1.ready() && f2.ready() && f3.ready());
    assert_eq!(f1.result(), 42);
    assert_eq!(f2.result(), -15);
    assert_eq!(f3.result(), 4);
    assert_eq!(SCALE_CALLS.load(Ordering::SeqCst), 3);
}

// ---- invariant: rpc_ff delivers exactly once; its future is ready on
// return ----

static FF_HITS: AtomicUsize = AtomicUsize::new(0);

#[derive(Serialize, Deserialize)]
struct Poke;

impl RemoteFn for Poke {
    type Output = ();
    const NAME: &'static str = concat!(module_path!(), "::Poke");
    fn call(self, _rt: &Runtime) {
        FF_HITS.fetch_add(1, Ordering::SeqCst);
    }
}
register_remote_fn!(Poke);

#[test]
#[serial]
fn rpc_ff_fires_exactly_once_and_source_is_trivial() {
    let rts = Runtime::cluster(2);
    FF_HITS.store(0, Ordering::SeqCst);
    let f = rts[0].rpc_ff(1, Poke);
    assert!(f.ready(), "source completion is trivial");
    drive_until(&rts, || FF_HITS.load(Ordering::SeqCst) == 1);
    // more cycles must not redeliver
    for _ in 0..10 {
        for rt in &rts {
            rt.progress(ProgressLevel::User);
        }
    }
    assert_eq!(FF_HITS.load(Ordering::SeqCst), 1);
}

// ---- S5: view argument plus by-value struct ----

static VIEW_OK: AtomicBool = AtomicBool::new(false);

#[derive(Serialize, Deserialize, Clone)]
struct A {
    x: i32,
}

#[derive(Serialize, Deserialize)]
struct ViewCheck {
    items: View<i32>,
    a: A,
}

impl RemoteFn for ViewCheck {
    type Output = ();
    const NAME: &'static str = concat!(module_path!(), "::ViewCheck");
    fn call(self, _rt: &Runtime) {
        assert_eq!(self.items.len(), 10);
        assert!(
            self.items.references_buffer(),
            "an unpacked view must borrow the inbound buffer"
        );
        for (i, item) in self.items.iter().enumerate() {
            assert_eq!(item, i as i32);
        }
        assert_eq!(self.a.x, -1);
        VIEW_OK.store(true, Ordering::SeqCst);
    }
}
register_remote_fn!(ViewCheck);

#[test]
#[serial]
fn view_rpc_observes_elements_in_place() {
    let rts = Runtime::cluster(2);
    VIEW_OK.store(false, Ordering::SeqCst);
    let data: Vec<i32> = (0..10).collect();
    rts[0].rpc_ff(
        1,
        ViewCheck {
            items: View::new(&data),
            a: A { x: -1 },
        },
    );
    drive_until(&rts, || VIEW_OK.load(Ordering::SeqCst));
}

// ---- rendezvous: commands above the eager cutover stage through the
// sender's shared segment and the staging is reclaimed ----

#[derive(Serialize, Deserialize)]
struct Sum {
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

impl RemoteFn for Sum {
    type Output = u64;
    const NAME: &'static str = concat!(module_path!(), "::Sum");
    fn call(self, _rt: &Runtime) -> u64 {
        self.payload.iter().map(|b| *b as u64).sum()
    }
}
register_remote_fn!(Sum);

#[test]
#[serial]
fn rendezvous_roundtrip_reclaims_staging() {
    let rts = Runtime::cluster(2);
    let baseline = rts[0].shared_segment_used();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expect: u64 = payload.iter().map(|b| *b as u64).sum();
    let f = rts[0].rpc(1, Sum { payload });
    drive_until(&rts, || f.ready());
    assert_eq!(f.result(), expect);
    // the receiver's staging-free notice lands on the next cycles
    drive_until(&rts, || rts[0].shared_segment_used() == baseline);
}

// ---- rpc initiated from a user persona gets its reply there ----

#[test]
#[serial]
fn reply_lands_on_the_initiating_persona() {
    let rts = Runtime::cluster(2);
    let persona = tessera::persona::Persona::new();
    let f = {
        let _scope = tessera::persona::PersonaScope::new(&persona);
        rts[0].rpc(1, Scale { value: 4, by: 4 })
    };
    // progress outside the scope: the recipient executes and replies,
    // but the reply may only run once the persona is active again
    for _ in 0..50 {
        for rt in &rts {
            rt.progress(ProgressLevel::User);
        }
    }
    assert!(!f.ready(), "reply must not run while its persona is inactive");
    {
        let _scope = tessera::persona::PersonaScope::new(&persona);
        drive_until(&rts, || f.ready());
    }
    assert_eq!(f.result(), 16);
}
