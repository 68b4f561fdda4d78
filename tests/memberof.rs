use std::sync::Arc;

use serial_test::serial;
use tessera::device::EmulatedDevice;
use tessera::global_ptr::GlobalPtr;
use tessera::memory_kind::{AnyKind, MemoryKind};
use tessera::persona::ProgressLevel;
use tessera::runtime::Runtime;
use tessera::{memberof, memberof_general};

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

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct Rec {
    tag: u8,
    y: i64,
    z: u32,
}

#[test]
#[serial]
fn memberof_points_into_the_object() {
    let rts = Runtime::cluster(1);
    let rt = &rts[0];
    let gp = rt
        .new_(Rec {
            tag: 3,
            y: -77,
            z: 9,
        })
        .unwrap();
    let yp: GlobalPtr<i64, _> = memberof!(gp, Rec, y);
    let zp: GlobalPtr<u32, _> = memberof!(gp, Rec, z);
    assert_eq!(unsafe { *rt.localize(yp).as_ptr() }, -77i64);
    assert_eq!(unsafe { *rt.localize(zp).as_ptr() }, 9u32);
    unsafe { rt.delete_(gp) };
}

#[test]
#[serial]
fn memberof_general_is_immediate_when_mappable() {
    let rts = Runtime::cluster(2);
    let gp = rts[1].new_(Rec { tag: 1, y: 42, z: 0 }).unwrap();
    // the peer's host segment is mapped, so no round trip is needed
    let fut = memberof_general!(rts[0], gp, Rec, y, i64);
    assert!(fut.ready());
    let yp = fut.result();
    let got = rts[0].rget_value(yp.dynamic_kind_cast::<tessera::memory_kind::Host>().unwrap());
    drive_until(&rts, || got.ready());
    assert_eq!(got.result(), 42);
    unsafe { rts[1].delete_(gp) };
}

#[test]
#[serial]
fn memberof_general_resolves_device_members_by_rpc() {
    const Y: i64 = 31337;
    let rts = Runtime::cluster(2);
    // rank 1 holds the object in device memory
    let dev = rts[1].register_device(Arc::new(EmulatedDevice::new()), 1 << 16);
    let host_stage = rts[1].new_(Rec { tag: 2, y: Y, z: 1 }).unwrap();
    let dev_obj = dev.allocate::<Rec>(1).unwrap();
    let up = rts[1].copy(host_stage, dev_obj, 1);
    drive_until(&rts, || up.ready());

    // a device pointer of another rank is not locally mappable on rank
    // 0, so the owner computes the offset
    let wide = dev_obj.static_kind_cast::<AnyKind>();
    assert!(!rts[0].is_local(wide));
    let fut = memberof_general!(rts[0], wide.cast::<Rec>(), Rec, y, i64);
    drive_until(&rts, || fut.ready());
    let member = fut.result();
    assert_eq!(member.rank(), 1);
    assert_eq!(member.dynamic_kind(), MemoryKind::CudaDevice);
    assert_eq!(member.heap_index(), dev.heap_index());

    // round trip: pull the member's bytes back through the copy engine
    let landing = rts[0].allocate::<i64>(1).unwrap();
    let pull = rts[0].copy(member, landing.any_kind(), 1);
    drive_until(&rts, || pull.ready());
    assert_eq!(unsafe { *rts[0].localize(landing).as_ptr() }, Y);

    rts[0].deallocate(landing);
    dev.deallocate(dev_obj);
    unsafe { rts[1].delete_(host_stage) };
}
