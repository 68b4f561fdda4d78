use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use serial_test::serial;
use tessera::active_messaging::RemoteFn;
use tessera::persona::{current_persona, Persona, PersonaScope, ProgressLevel};
use tessera::register_remote_fn;
use tessera::runtime::Runtime;

static HITS: AtomicUsize = AtomicUsize::new(0);

#[derive(Serialize, Deserialize)]
struct Bump;

impl RemoteFn for Bump {
    type Output = ();
    const NAME: &'static str = concat!(module_path!(), "::Bump");
    fn call(self, _rt: &Runtime) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }
}
register_remote_fn!(Bump);

#[test]
#[serial]
fn user_level_bodies_wait_for_user_progress() {
    let rts = Runtime::cluster(2);
    HITS.store(0, Ordering::SeqCst);
    rts[0].rpc_ff(1, Bump);
    // internal progress routes and bookkeeps but must not run the body
    for _ in 0..20 {
        for rt in &rts {
            rt.progress(ProgressLevel::Internal);
        }
    }
    assert_eq!(HITS.load(Ordering::SeqCst), 0);
    for rt in &rts {
        rt.progress(ProgressLevel::User);
    }
    assert_eq!(HITS.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn send_am_persona_targets_a_specific_persona() {
    let rts = Runtime::cluster(2);
    HITS.store(0, Ordering::SeqCst);
    // a worker persona on rank 1
    let worker = Persona::new();
    rts[0].send_am_persona(ProgressLevel::User, 1, worker.id(), Bump);
    // rank 1's master progress routes the message but the worker queue
    // only drains while the worker is current
    for _ in 0..20 {
        for rt in &rts {
            rt.progress(ProgressLevel::User);
        }
    }
    assert_eq!(HITS.load(Ordering::SeqCst), 0);
    {
        let _scope = PersonaScope::new(&worker);
        rts[1].progress(ProgressLevel::User);
    }
    assert_eq!(HITS.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn scopes_nest_and_restore() {
    let base = current_persona();
    let p1 = Persona::new();
    let p2 = Persona::new();
    {
        let _s1 = PersonaScope::new(&p1);
        assert_eq!(current_persona().id(), p1.id());
        {
            let _s2 = PersonaScope::new(&p2);
            assert_eq!(current_persona().id(), p2.id());
        }
        assert_eq!(current_persona().id(), p1.id());
    }
    assert_eq!(current_persona().id(), base.id());
}

#[test]
#[serial]
fn master_scope_is_reentrant_across_calls() {
    let rts = Runtime::cluster(1);
    let rt = &rts[0];
    {
        let _scope = rt.activate_master();
        assert_eq!(current_persona().id(), rt.master_persona().id());
        // progress while the master is already current must not
        // double-activate it
        rt.progress(ProgressLevel::User);
    }
    rt.progress(ProgressLevel::User);
}

#[test]
#[serial]
fn discharge_flushes_internal_work() {
    let rts = Runtime::cluster(2);
    // seed some traffic, then discharge the initiator
    for _ in 0..4 {
        rts[0].rpc_ff(1, Bump);
    }
    rts[0].discharge();
    assert!(!rts[0].progress_required());
}

#[test]
#[serial]
fn progress_required_sees_queued_work() {
    let rts = Runtime::cluster(1);
    let rt = &rts[0];
    HITS.store(0, Ordering::SeqCst);
    rt.discharge();
    assert!(!rt.progress_required());
    // a self-send parks work in our own mailbox
    rt.rpc_ff(0, Bump);
    assert!(rt.progress_required());
    while rt.progress_required() {
        rt.progress(ProgressLevel::User);
    }
    assert_eq!(HITS.load(Ordering::SeqCst), 1);
}
