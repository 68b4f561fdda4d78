//! Runtime lifecycle: rank identity, the shared segment, the master
//! persona, and the progress engine tying the pieces together.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::active_messaging::PendingOp;
use crate::copy::CopyPending;
use crate::device::DeviceHeap;
use crate::env_var::config;
use crate::error::{AllocResult, BadGlobalPtr};
use crate::fabric::{create_fabrics, Backend, Fabric, FabricAm, FabricComm, FabricRdma};
use crate::global_ptr::GlobalPtr;
use crate::memory_kind::{Host, KindSet, MemoryKind};
use crate::persona::{current_persona, Persona, PersonaScope, ProgressLevel};
use crate::segment::{SegmentMap, SharedHeap};

pub(crate) struct RuntimeInner {
    my_rank: usize,
    num_ranks: usize,
    pub(crate) fabric: Fabric,
    pub(crate) heap: SharedHeap,
    pub(crate) seg_map: SegmentMap,
    pub(crate) master: Persona,
    pub(crate) pending: Mutex<HashMap<u64, PendingOp>>,
    pub(crate) copies: Mutex<HashMap<u64, CopyPending>>,
    pub(crate) devices: RwLock<Vec<Arc<DeviceHeap>>>,
    next_id: AtomicU64,
    initialized: AtomicBool,
}

/// Handle to one rank's runtime. Clones are cheap and share state.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

/// Builder for a runtime instance, in the usual builder shape:
///
/// ```no_run
/// use tessera::runtime::RuntimeBuilder;
/// let rt = RuntimeBuilder::new().build();
/// ```
pub struct RuntimeBuilder {
    backend: Backend,
    heap_size: Option<usize>,
}

impl RuntimeBuilder {
    pub fn new() -> RuntimeBuilder {
        RuntimeBuilder {
            backend: Default::default(),
            heap_size: None,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = Some(bytes);
        self
    }

    /// Collective initialization of a single-rank job.
    pub fn build(self) -> Runtime {
        let heap_size = self.heap_size.unwrap_or(config().heap_size);
        let mut fabrics = create_fabrics(self.backend, 1, heap_size);
        Runtime::from_fabric(fabrics.remove(0))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder::new()
    }
}

impl Runtime {
    /// Collective initialization of an `n`-rank loopback job hosted by
    /// this process. Returns one runtime handle per rank.
    pub fn cluster(num_ranks: usize) -> Vec<Runtime> {
        Runtime::cluster_with_heap(num_ranks, config().heap_size)
    }

    pub fn cluster_with_heap(num_ranks: usize, heap_size: usize) -> Vec<Runtime> {
        create_fabrics(Backend::Loopback, num_ranks, heap_size)
            .into_iter()
            .map(Runtime::from_fabric)
            .collect()
    }

    pub(crate) fn from_fabric(fabric: Fabric) -> Runtime {
        let my_rank = fabric.my_rank();
        let num_ranks = fabric.num_ranks();
        let base = fabric.segment_base(my_rank);
        let size = fabric.segment_size(my_rank);
        let lb = fabric.local_team_lb();
        let team_len = fabric.local_team_len();
        let mut bases = Vec::with_capacity(team_len);
        let mut sizes = Vec::with_capacity(team_len);
        let mut translation = Vec::with_capacity(team_len);
        for r in lb..lb + team_len {
            let rbase = fabric.segment_base(r);
            bases.push(fabric.local_addr(r, rbase));
            sizes.push(fabric.segment_size(r));
            translation.push(fabric.local_addr(r, rbase) as isize - rbase as isize);
        }
        crate::diagnostic::set_diag_rank(my_rank);
        let rt = Runtime {
            inner: Arc::new(RuntimeInner {
                my_rank,
                num_ranks,
                fabric,
                heap: SharedHeap::new(base, size),
                seg_map: SegmentMap::new(lb, bases, sizes, translation),
                master: Persona::new_master(),
                pending: Mutex::new(HashMap::new()),
                copies: Mutex::new(HashMap::new()),
                devices: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                initialized: AtomicBool::new(true),
            }),
        };
        trace!(rank = my_rank, ranks = num_ranks, "runtime initialized");
        rt
    }

    /// This process's rank within the job. Immutable after init.
    pub fn rank_me(&self) -> usize {
        self.inner.my_rank
    }

    /// Total ranks in the job. Immutable after init.
    pub fn rank_n(&self) -> usize {
        self.inner.num_ranks
    }

    pub fn initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    pub fn master_persona(&self) -> &Persona {
        &self.inner.master
    }

    /// Activate this runtime's master persona on the calling thread for
    /// the returned scope's lifetime.
    pub fn activate_master(&self) -> PersonaScope<'static> {
        PersonaScope::new(&self.inner.master)
    }

    /// Mark the master persona eligible for acquisition by threads other
    /// than the one that initialized the runtime.
    pub fn liberate_master_persona(&self) {
        self.inner.master.liberate();
    }

    pub(crate) fn next_op_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drive completion delivery. One call performs a network poll
    /// (inbound active messages are routed to their target personas,
    /// completed operation handles fire), then drains internal queues,
    /// and at [`ProgressLevel::User`] the user queues as well.
    ///
    /// Queues are drained for the master persona (activated for the
    /// duration of the call when this thread may hold it, as on the main
    /// thread right after init) and for the calling thread's current
    /// persona.
    pub fn progress(&self, level: ProgressLevel) {
        self.check_init("progress");
        self.poll_network();
        let master = &self.inner.master;
        let cur = current_persona();
        if cur.id() != master.id() && !master.active() {
            let _scope = PersonaScope::new(master);
            master.progress(level);
        }
        cur.progress(level);
    }

    /// Whether this runtime's master or the calling thread's current
    /// persona has queued work or outstanding handles, or the fabric has
    /// inbound messages for this rank.
    pub fn progress_required(&self) -> bool {
        let master = &self.inner.master;
        let cur = current_persona();
        master.has_work(ProgressLevel::Internal)
            || master.has_work(ProgressLevel::User)
            || cur.has_work(ProgressLevel::Internal)
            || cur.has_work(ProgressLevel::User)
            || self.inner.fabric.inbound_pending()
    }

    /// Repeat internal-level progress until no more is required. Flushes
    /// outgoing work before teardown or blocking.
    pub fn discharge(&self) {
        loop {
            self.progress(ProgressLevel::Internal);
            let master = &self.inner.master;
            let cur = current_persona();
            if !master.has_work(ProgressLevel::Internal)
                && !cur.has_work(ProgressLevel::Internal)
                && !self.inner.fabric.inbound_pending()
            {
                break;
            }
        }
    }

    /// Collective teardown. Discharges outstanding internal work, then
    /// marks this rank finalized.
    pub fn finalize(&self) {
        self.check_init("finalize");
        self.discharge();
        self.inner.fabric.shutdown();
        // drain anything peers pushed while we were discharging
        while self.inner.fabric.inbound_pending() {
            self.progress(ProgressLevel::Internal);
        }
        self.inner.initialized.store(false, Ordering::Release);
        trace!(rank = self.inner.my_rank, "runtime finalized");
    }

    // ---- shared heap ----

    /// Reserve raw bytes in the host shared segment.
    pub fn allocate_bytes(&self, size: usize, align: usize) -> AllocResult<usize> {
        self.check_init("allocate");
        self.inner.heap.allocate(size, align)
    }

    /// Release a reservation made by [`Runtime::allocate_bytes`].
    pub fn deallocate_bytes(&self, addr: usize) {
        self.check_init("deallocate");
        self.inner.heap.deallocate(addr);
    }

    /// Bytes currently reserved in the host shared segment.
    pub fn shared_segment_used(&self) -> usize {
        self.inner.heap.used()
    }

    // ---- address translation ----

    /// Whether dereferencing `gp` locally is defined: the owning rank is
    /// in the local team and, for device heaps, the device is visible.
    pub fn is_local<T, K: KindSet>(&self, gp: GlobalPtr<T, K>) -> bool {
        if gp.is_null() {
            return true;
        }
        if gp.heap == 0 {
            self.inner.seg_map.contains_rank(gp.rank)
        } else {
            gp.rank == self.inner.my_rank && self.device_heap(gp.heap).is_some()
        }
    }

    /// Translate to a raw local pointer, or `None` when the target is
    /// not locally mappable. Null maps to `None`.
    pub fn try_local<T, K: KindSet>(&self, gp: GlobalPtr<T, K>) -> Option<NonNull<T>> {
        if gp.is_null() || gp.heap != 0 {
            return None;
        }
        let local = self.inner.seg_map.localize(gp.rank, gp.raw)?;
        NonNull::new(local as *mut T)
    }

    /// Translate to a raw local pointer; fatal on a pointer that is not
    /// locally mappable.
    pub fn localize<T, K: KindSet>(&self, gp: GlobalPtr<T, K>) -> NonNull<T> {
        self.check_gp(gp, std::mem::align_of::<T>());
        match self.try_local(gp) {
            Some(p) => p,
            None => crate::fatal!(
                "invalid-address: {:?} is not locally dereferenceable on rank {}",
                gp,
                self.inner.my_rank
            ),
        }
    }

    /// Promote a raw pointer into this rank's shared segment to a global
    /// pointer. `None` when the address lies outside the segment.
    pub fn try_globalize<T>(&self, ptr: *const T) -> Option<GlobalPtr<T, Host>> {
        if ptr.is_null() {
            return Some(GlobalPtr::null());
        }
        let addr = ptr as usize;
        let base = self.inner.heap.base();
        if addr.wrapping_sub(base) < self.inner.heap.size() {
            Some(GlobalPtr::from_parts(
                self.inner.my_rank,
                addr,
                0,
                MemoryKind::Host,
            ))
        } else {
            None
        }
    }

    pub fn globalize<T>(&self, ptr: *const T) -> GlobalPtr<T, Host> {
        match self.try_globalize(ptr) {
            Some(gp) => gp,
            None => crate::fatal!(
                "globalize of address {:#x} outside the shared segment",
                ptr as usize
            ),
        }
    }

    pub(crate) fn device_heap(&self, heap: u16) -> Option<Arc<DeviceHeap>> {
        let idx = (heap as usize).checked_sub(1)?;
        self.inner.devices.read().get(idx).cloned()
    }

    // ---- validation ----

    pub(crate) fn check_init(&self, what: &str) {
        if !self.initialized() {
            crate::misuse!("{} called outside an initialized runtime", what);
        }
    }

    /// Checked-build validation of a global pointer: rank range, segment
    /// bounds, alignment.
    pub(crate) fn check_gp<T, K: KindSet>(&self, gp: GlobalPtr<T, K>, align: usize) {
        if !cfg!(any(debug_assertions, feature = "checked-gptr")) {
            return;
        }
        self.check_init("global pointer use");
        if gp.is_null() {
            return;
        }
        if gp.rank >= self.inner.num_ranks {
            crate::fatal!(
                "bad-global-pointer: {}",
                BadGlobalPtr::RankOutOfRange {
                    rank: gp.rank,
                    rank_n: self.inner.num_ranks
                }
            );
        }
        if gp.heap == 0 {
            if let Some((base, size)) = self.inner.seg_map.segment_bounds(gp.rank) {
                // translate before bounds-testing so the test sees the
                // same address space as the base
                if let Some(local) = self.inner.seg_map.localize(gp.rank, gp.raw) {
                    if local.wrapping_sub(base) >= size {
                        crate::fatal!(
                            "bad-global-pointer: {}",
                            BadGlobalPtr::OutsideSegment {
                                rank: gp.rank,
                                addr: gp.raw,
                                base,
                                size
                            }
                        );
                    }
                } else {
                    crate::fatal!(
                        "bad-global-pointer: {}",
                        BadGlobalPtr::OutsideSegment {
                            rank: gp.rank,
                            addr: gp.raw,
                            base,
                            size
                        }
                    );
                }
            }
        } else if gp.rank == self.inner.my_rank {
            match self.device_heap(gp.heap) {
                None => crate::fatal!(
                    "bad-global-pointer: {}",
                    BadGlobalPtr::UnknownHeap { heap: gp.heap }
                ),
                Some(heap) => {
                    if gp.raw.wrapping_sub(heap.base) >= heap.size {
                        crate::fatal!(
                            "bad-global-pointer: {}",
                            BadGlobalPtr::OutsideSegment {
                                rank: gp.rank,
                                addr: gp.raw,
                                base: heap.base,
                                size: heap.size
                            }
                        );
                    }
                }
            }
        }
        if gp.raw % align != 0 {
            crate::fatal!(
                "bad-global-pointer: {}",
                BadGlobalPtr::Misaligned {
                    addr: gp.raw,
                    align
                }
            );
        }
    }

    pub(crate) fn check_owner<T, K: KindSet>(&self, gp: GlobalPtr<T, K>, what: &str) {
        if gp.rank != self.inner.my_rank {
            crate::misuse!(
                "{} must be invoked by the owning rank: {}",
                what,
                BadGlobalPtr::WrongOwner {
                    owner: gp.rank,
                    caller: self.inner.my_rank
                }
            );
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("rank", &self.inner.my_rank)
            .field("ranks", &self.inner.num_ranks)
            .finish()
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        trace!(rank = self.my_rank, "runtime dropping");
    }
}
