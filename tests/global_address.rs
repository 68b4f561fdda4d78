use std::collections::{BTreeSet, HashSet};

use serial_test::serial;
use tessera::global_ptr::GlobalPtr;
use tessera::persona::ProgressLevel;
use tessera::runtime::Runtime;

// localize-globalize roundtrip, and bytes written by the owner are
// visible through local()

#[test]
#[serial]
fn localize_globalize_roundtrip() {
    let rts = Runtime::cluster(2);
    let rt = &rts[0];
    let gp = rt.allocate::<u8>(64).unwrap();
    let local = rt.localize(gp);
    unsafe {
        std::ptr::copy_nonoverlapping(b"deadbeef".as_ptr(), local.as_ptr(), 8);
    }
    assert_eq!(rt.globalize(local.as_ptr() as *const u8), gp);

    // the whole loopback job is the local team: the peer maps the same
    // bytes
    assert!(rts[1].is_local(gp));
    let peer = rts[1].localize(gp);
    let bytes = unsafe { std::slice::from_raw_parts(peer.as_ptr(), 8) };
    assert_eq!(bytes, b"deadbeef");

    rt.deallocate(gp);
}

#[test]
#[serial]
fn pointer_arithmetic_against_allocation() {
    let rts = Runtime::cluster(1);
    let rt = &rts[0];
    let gp = rt.allocate::<u64>(10).unwrap();
    let third = gp.add(3);
    assert_eq!(third.offset_from(&gp), 3);
    let p0 = rt.localize(gp).as_ptr();
    let p3 = rt.localize(third).as_ptr();
    assert_eq!(unsafe { p0.add(3) }, p3);
    rt.deallocate(gp);
}

// alloc/free cycles return segment accounting to its starting value

#[test]
#[serial]
fn allocation_accounting_is_idempotent() {
    let rts = Runtime::cluster(1);
    let rt = &rts[0];
    let start = rt.shared_segment_used();
    for _ in 0..50 {
        let a = rt.allocate::<u64>(100).unwrap();
        let b = rt.allocate::<u8>(37).unwrap();
        rt.deallocate(b);
        rt.deallocate(a);
    }
    assert_eq!(rt.shared_segment_used(), start);
}

// std ordering and hashing over global pointers

#[test]
#[serial]
fn pointers_order_totally_and_hash_consistently() {
    let rts = Runtime::cluster(2);
    let mut ptrs: Vec<GlobalPtr<u32>> = Vec::new();
    for rt in &rts {
        for _ in 0..4 {
            ptrs.push(rt.allocate::<u32>(1).unwrap());
        }
    }
    let set: BTreeSet<GlobalPtr<u32>> = ptrs.iter().cloned().collect();
    assert_eq!(set.len(), ptrs.len());
    // strict total order: each element compares less than its successor
    let sorted: Vec<_> = set.iter().cloned().collect();
    for w in sorted.windows(2) {
        assert!(w[0] < w[1]);
        assert!(!(w[1] < w[0]));
    }
    let hashed: HashSet<GlobalPtr<u32>> = ptrs.iter().cloned().collect();
    assert_eq!(hashed.len(), ptrs.len());
    assert!(hashed.contains(&ptrs[0]));

    for (i, rt) in rts.iter().enumerate() {
        for gp in &ptrs[i * 4..(i + 1) * 4] {
            rt.deallocate(*gp);
        }
    }
}

#[test]
#[serial]
fn null_is_universal() {
    let rts = Runtime::cluster(1);
    let rt = &rts[0];
    let null = GlobalPtr::<i64>::null();
    assert!(null.is_null());
    assert!(rt.try_local(null).is_none());
    // deleting null is a no-op
    rt.deallocate(null);
    unsafe { rt.delete_(null) };
}

#[test]
#[serial]
fn finalize_discharges_and_deactivates() {
    let rts = Runtime::cluster(2);
    assert!(rts.iter().all(|rt| rt.initialized()));
    rts[0].progress(ProgressLevel::User);
    for rt in &rts {
        rt.finalize();
    }
    assert!(rts.iter().all(|rt| !rt.initialized()));
}
