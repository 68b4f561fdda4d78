//! Device memory: the external API contract and device segments.
//!
//! The core never talks to real device APIs; it drives anything that
//! implements [`DeviceApi`]: allocate/free a segment, move bytes between
//! host and device (or device and device), and poll the completion event
//! of an asynchronous copy. [`EmulatedDevice`] backs device memory with
//! host allocations so device-kind code paths (including the copy
//! engine's bounce choreography) run everywhere, in the same spirit as
//! the loopback fabric.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{AllocResult, BadSegmentAlloc};
use crate::global_ptr::GlobalPtr;
use crate::memory_kind::{Cuda, MemoryKind, MAX_DEVICE_HEAPS};
use crate::runtime::Runtime;
use crate::segment::HeapAlloc;

/// One endpoint of a device copy; addresses are raw within their
/// respective address spaces.
#[derive(Debug, Clone, Copy)]
pub enum DevCopy {
    HostToDev { src: usize, dst: usize, len: usize },
    DevToHost { src: usize, dst: usize, len: usize },
    DevToDev { src: usize, dst: usize, len: usize },
}

/// Completion token of an asynchronous device copy, polled by the
/// persona that issued the copy.
#[derive(Clone, Debug)]
pub struct DeviceEvent {
    done: Arc<AtomicBool>,
}

impl DeviceEvent {
    pub fn new() -> DeviceEvent {
        DeviceEvent {
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl Default for DeviceEvent {
    fn default() -> Self {
        DeviceEvent::new()
    }
}

/// The contract a device backend exposes to the core.
pub trait DeviceApi: Send + Sync {
    fn name(&self) -> &'static str;
    /// Reserve a device segment; `None` when the device is out of
    /// memory.
    fn segment_alloc(&self, len: usize) -> Option<usize>;
    fn segment_free(&self, base: usize);
    /// Start an asynchronous copy; the returned event completes when the
    /// data is visible at the destination.
    fn copy(&self, op: DevCopy) -> DeviceEvent;
}

/// Device memory emulated in host storage; copies complete immediately
/// but are still reported through events so callers poll exactly as they
/// would for a real device.
#[derive(Debug, Default)]
pub struct EmulatedDevice {
    segments: Mutex<HashMap<usize, Box<[u8]>>>,
}

impl EmulatedDevice {
    pub fn new() -> EmulatedDevice {
        EmulatedDevice::default()
    }
}

impl DeviceApi for EmulatedDevice {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn segment_alloc(&self, len: usize) -> Option<usize> {
        let mut storage = vec![0u8; len].into_boxed_slice();
        let base = storage.as_mut_ptr() as usize;
        self.segments.lock().insert(base, storage);
        Some(base)
    }

    fn segment_free(&self, base: usize) {
        self.segments.lock().remove(&base);
    }

    fn copy(&self, op: DevCopy) -> DeviceEvent {
        let (src, dst, len) = match op {
            DevCopy::HostToDev { src, dst, len }
            | DevCopy::DevToHost { src, dst, len }
            | DevCopy::DevToDev { src, dst, len } => (src, dst, len),
        };
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
        }
        let ev = DeviceEvent::new();
        ev.complete();
        ev
    }
}

/// A registered device segment on this rank: heap index, geometry, and
/// the allocator carving it up.
pub struct DeviceHeap {
    pub(crate) idx: u16,
    pub(crate) base: usize,
    pub(crate) size: usize,
    pub(crate) alloc: Mutex<HeapAlloc>,
    pub(crate) api: Arc<dyn DeviceApi>,
}

impl std::fmt::Debug for DeviceHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DeviceHeap")
            .field("idx", &self.idx)
            .field("size", &self.size)
            .field("device", &self.api.name())
            .finish()
    }
}

/// Handle for allocating on one registered device heap.
#[derive(Clone)]
pub struct DeviceAllocator {
    rt: Runtime,
    heap: Arc<DeviceHeap>,
}

impl DeviceAllocator {
    pub fn heap_index(&self) -> u16 {
        self.heap.idx
    }

    /// Reserve `n` elements in the device segment.
    pub fn allocate<T>(&self, n: usize) -> AllocResult<GlobalPtr<T, Cuda>> {
        let size = n * std::mem::size_of::<T>();
        let mut alloc = self.heap.alloc.lock();
        match alloc.try_malloc(size, std::mem::align_of::<T>().max(1)) {
            Some(addr) => Ok(GlobalPtr::from_parts(
                self.rt.rank_me(),
                addr,
                self.heap.idx,
                MemoryKind::CudaDevice,
            )),
            None => Err(crate::error::BadSharedAlloc {
                requested: size,
                used: alloc.used(),
                capacity: self.heap.size,
            }),
        }
    }

    pub fn deallocate<T>(&self, gp: GlobalPtr<T, Cuda>) {
        if gp.is_null() {
            return;
        }
        self.rt.check_owner(gp, "device deallocate");
        self.heap.alloc.lock().free(gp.raw_addr());
    }
}

impl Runtime {
    /// Register a device and create its segment, returning an allocator
    /// bound to the new device heap. Segment exhaustion during setup is
    /// fatal.
    pub fn register_device(
        &self,
        api: Arc<dyn DeviceApi>,
        segment_len: usize,
    ) -> DeviceAllocator {
        self.check_init("register_device");
        let mut devices = self.inner.devices.write();
        if devices.len() >= MAX_DEVICE_HEAPS {
            crate::misuse!(
                "at most {} device heaps may be registered per rank",
                MAX_DEVICE_HEAPS
            );
        }
        let base = match api.segment_alloc(segment_len) {
            Some(base) => base,
            None => {
                let err = BadSegmentAlloc {
                    device: api.name(),
                    requested: segment_len,
                };
                crate::fatal!("bad-segment-alloc: {}", err);
            }
        };
        let idx = (devices.len() + 1) as u16;
        let heap = Arc::new(DeviceHeap {
            idx,
            base,
            size: segment_len,
            alloc: Mutex::new(HeapAlloc::new(base, segment_len)),
            api,
        });
        devices.push(heap.clone());
        DeviceAllocator {
            rt: self.clone(),
            heap,
        }
    }
}
