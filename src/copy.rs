//! The copy engine: transfers between any pair of
//! {local host, remote host, local device, remote device} endpoints.
//!
//! The wire only moves host memory (unless the fabric reports native
//! device support), so device-resident endpoints are staged through
//! bounce buffers carved from the shared host heap. The choreography is
//! driven by internal-level active messages:
//!
//! * both endpoints local: an intra-process copy (memcpy for host pairs,
//!   an event-completed device copy otherwise);
//! * the initiator is the destination (a semantic GET): ask the source
//!   to stage and PUT into our (possibly bounced) buffer, then finalize
//!   locally;
//! * the initiator is the source (a semantic PUT): stage locally, ask
//!   the destination to GET and finalize, then hear back.
//!
//! Every bounce buffer is freed on the rank that allocated it.

use serde::{Deserialize, Serialize};

use crate::active_messaging::{Cmd, Msg, RemoteAm};
use crate::completion::{Completions, CxHandles, CxState};
use crate::device::DevCopy;
use crate::env_var::config;
use crate::future::Future;
use crate::global_ptr::GlobalPtr;
use crate::memory_kind::KindSet;
use crate::persona::{current_persona, HandleCb, Persona, ProgressLevel};
use crate::runtime::Runtime;
use crate::serialize::{deserialize, serialize};

#[derive(Serialize, Deserialize, Debug)]
enum CopyMsg {
    /// To the source rank: stage `size` bytes at (`src_heap`,
    /// `src_addr`) into host memory if needed, PUT them into
    /// `dst_bounce` on the requesting rank, then send `DestFinalize`.
    StagePut {
        req_id: u64,
        src_heap: u16,
        src_addr: usize,
        size: usize,
        dst_bounce: usize,
    },
    /// Back at the destination: land the bounced payload in the true
    /// destination and fire user-visible completions.
    DestFinalize { req_id: u64 },
    /// To the destination rank: GET `size` bytes from `fetch_addr` on
    /// the requesting rank into (`dst_heap`, `dst_raw`), run the remote
    /// completion, then send `SrcDone`.
    DestFetch {
        req_id: u64,
        fetch_addr: usize,
        size: usize,
        dst_heap: u16,
        dst_raw: usize,
        src_used_bounce: bool,
        remote: Option<RemoteAm>,
    },
    /// Back at the source: release staging and fire completions.
    SrcDone { req_id: u64 },
}

/// Initiator-side state of an in-flight copy.
pub(crate) enum CopyPending {
    AsDest {
        persona: Persona,
        cx: CxState,
        dst_heap: u16,
        dst_raw: usize,
        bounce_d: Option<usize>,
        size: usize,
    },
    AsSource {
        persona: Persona,
        cx: CxState,
        bounce_s: Option<usize>,
    },
}

impl Runtime {
    /// Copy `n` elements from `src` to `dst` with the default completion
    /// set; the returned future is the operation completion.
    pub fn copy<T, Ks, Kd>(
        &self,
        src: GlobalPtr<T, Ks>,
        dst: GlobalPtr<T, Kd>,
        n: usize,
    ) -> Future<()>
    where
        T: Copy + Send + Sync + 'static,
        Ks: KindSet,
        Kd: KindSet,
    {
        self.copy_with(src, dst, n, Completions::operation_future())
            .operation()
    }

    pub fn copy_with<T, Ks, Kd>(
        &self,
        src: GlobalPtr<T, Ks>,
        dst: GlobalPtr<T, Kd>,
        n: usize,
        cxs: Completions,
    ) -> CxHandles
    where
        T: Copy + Send + Sync + 'static,
        Ks: KindSet,
        Kd: KindSet,
    {
        self.check_init("copy");
        self.check_gp(src, std::mem::align_of::<T>());
        self.check_gp(dst, std::mem::align_of::<T>());
        if src.is_null() || dst.is_null() {
            crate::misuse!("copy endpoints must be non-null");
        }
        let size = n * std::mem::size_of::<T>();
        let me = self.rank_me();
        let (mut state, handles) = CxState::new(cxs);
        let hook = {
            let rt = self.clone();
            move || rt.progress(ProgressLevel::User)
        };
        if let Some(f) = &handles.source {
            f.set_progress_hook(Box::new(hook.clone()));
        }
        if let Some(f) = &handles.operation {
            f.set_progress_hook(Box::new(hook));
        }
        if size == 0 {
            state.signal_operation();
            if let Some(am) = state.remote.take() {
                self.send_am_packed(ProgressLevel::User, dst.rank(), am);
            }
            return handles;
        }

        if src.rank() == dst.rank() {
            if src.rank() != me {
                crate::misuse!("a fully remote copy must be initiated by the endpoint rank");
            }
            self.copy_local(
                src.heap_index(),
                src.raw_addr(),
                dst.heap_index(),
                dst.raw_addr(),
                size,
                state,
            );
        } else if dst.rank() == me {
            // semantically a GET, even though a PUT moves the bytes
            self.copy_as_dest(src.rank(), src.heap_index(), src.raw_addr(), dst, size, state);
        } else if src.rank() == me {
            // semantically a PUT, carried by a GET on the wire
            self.copy_as_source(src.heap_index(), src.raw_addr(), dst, size, state);
        } else {
            crate::misuse!("copy requires the initiating rank to be one of the endpoints");
        }
        handles
    }

    // ---- intra-process ----

    fn copy_local(
        &self,
        src_heap: u16,
        src_addr: usize,
        dst_heap: u16,
        dst_addr: usize,
        size: usize,
        mut state: CxState,
    ) {
        let me = self.rank_me();
        let rt = self.clone();
        let finish = move |mut state: CxState| {
            state.signal_operation();
            if let Some(am) = state.remote.take() {
                rt.send_am_packed(ProgressLevel::User, me, am);
            }
        };
        if src_heap == 0 && dst_heap == 0 {
            if src_addr < dst_addr + size && dst_addr < src_addr + size {
                crate::misuse!(
                    "overlapping host copy: src {:#x} dst {:#x} len {}",
                    src_addr,
                    dst_addr,
                    size
                );
            }
            unsafe {
                std::ptr::copy_nonoverlapping(src_addr as *const u8, dst_addr as *mut u8, size);
            }
            finish(state);
            return;
        }
        // at least one device endpoint: run the device copy and finish
        // from its event callback
        if src_heap != 0 && dst_heap != 0 && src_heap != dst_heap {
            // distinct devices: stage through a host bounce
            let bounce = self.alloc_bounce(size);
            let rt = self.clone();
            self.device_copy(
                src_heap,
                DevCopy::DevToHost {
                    src: src_addr,
                    dst: bounce,
                    len: size,
                },
                move || {
                    let rt2 = rt.clone();
                    rt.device_copy(
                        dst_heap,
                        DevCopy::HostToDev {
                            src: bounce,
                            dst: dst_addr,
                            len: size,
                        },
                        move || {
                            rt2.deallocate_bytes(bounce);
                            finish(state);
                        },
                    );
                },
            );
            return;
        }
        let (heap, op) = if src_heap == 0 {
            (
                dst_heap,
                DevCopy::HostToDev {
                    src: src_addr,
                    dst: dst_addr,
                    len: size,
                },
            )
        } else if dst_heap == 0 {
            (
                src_heap,
                DevCopy::DevToHost {
                    src: src_addr,
                    dst: dst_addr,
                    len: size,
                },
            )
        } else {
            (
                src_heap,
                DevCopy::DevToDev {
                    src: src_addr,
                    dst: dst_addr,
                    len: size,
                },
            )
        };
        self.device_copy(heap, op, move || finish(state));
    }

    // ---- initiator is the destination ----

    fn copy_as_dest<T, Kd: KindSet>(
        &self,
        src_rank: usize,
        src_heap: u16,
        src_addr: usize,
        dst: GlobalPtr<T, Kd>,
        size: usize,
        state: CxState,
    ) {
        let req_id = self.next_op_id();
        let dst_heap = dst.heap_index();
        let bounce_d = if dst_heap != 0 && !self.native_device_support() {
            Some(self.alloc_bounce(size))
        } else {
            None
        };
        let dst_bounce = bounce_d.unwrap_or_else(|| dst.raw_addr());
        self.inner.copies.lock().insert(
            req_id,
            CopyPending::AsDest {
                persona: current_persona(),
                cx: state,
                dst_heap,
                dst_raw: dst.raw_addr(),
                bounce_d,
                size,
            },
        );
        self.send_copy_msg(
            src_rank,
            &CopyMsg::StagePut {
                req_id,
                src_heap,
                src_addr,
                size,
                dst_bounce,
            },
        );
    }

    // ---- initiator is the source ----

    fn copy_as_source<T, Kd: KindSet>(
        &self,
        src_heap: u16,
        src_addr: usize,
        dst: GlobalPtr<T, Kd>,
        size: usize,
        mut state: CxState,
    ) {
        let req_id = self.next_op_id();
        let dst_rank = dst.rank();
        let dst_heap = dst.heap_index();
        let dst_raw = dst.raw_addr();
        let remote = state.remote.take();
        let stage_bounce = src_heap != 0 && !self.native_device_support();
        if stage_bounce {
            let bounce_s = self.alloc_bounce(size);
            self.inner.copies.lock().insert(
                req_id,
                CopyPending::AsSource {
                    persona: current_persona(),
                    cx: state,
                    bounce_s: Some(bounce_s),
                },
            );
            let rt = self.clone();
            self.device_copy(
                src_heap,
                DevCopy::DevToHost {
                    src: src_addr,
                    dst: bounce_s,
                    len: size,
                },
                move || {
                    // the source buffer is reusable as soon as the
                    // bounce is populated
                    rt.signal_copy_source(req_id);
                    rt.send_copy_msg(
                        dst_rank,
                        &CopyMsg::DestFetch {
                            req_id,
                            fetch_addr: bounce_s,
                            size,
                            dst_heap,
                            dst_raw,
                            src_used_bounce: true,
                            remote,
                        },
                    );
                },
            );
        } else {
            self.inner.copies.lock().insert(
                req_id,
                CopyPending::AsSource {
                    persona: current_persona(),
                    cx: state,
                    bounce_s: None,
                },
            );
            self.send_copy_msg(
                dst_rank,
                &CopyMsg::DestFetch {
                    req_id,
                    fetch_addr: src_addr,
                    size,
                    dst_heap,
                    dst_raw,
                    src_used_bounce: false,
                    remote,
                },
            );
        }
    }

    // ---- message handlers ----

    fn handle_stage_put(
        &self,
        dst_rank: usize,
        req_id: u64,
        src_heap: u16,
        src_addr: usize,
        size: usize,
        dst_bounce: usize,
    ) {
        let rt = self.clone();
        let put = move |staged_addr: usize, bounce_used: bool| {
            let rt2 = rt.clone();
            let src_bytes =
                unsafe { std::slice::from_raw_parts(staged_addr as *const u8, size) };
            rt.rma_put_raw(dst_rank, dst_bounce, src_bytes, move || {
                if bounce_used {
                    rt2.deallocate_bytes(staged_addr);
                }
                rt2.send_copy_msg(dst_rank, &CopyMsg::DestFinalize { req_id });
            });
        };
        if src_heap != 0 && !self.native_device_support() {
            let bounce_s = self.alloc_bounce(size);
            self.device_copy(
                src_heap,
                DevCopy::DevToHost {
                    src: src_addr,
                    dst: bounce_s,
                    len: size,
                },
                move || put(bounce_s, true),
            );
        } else {
            put(src_addr, false);
        }
    }

    fn handle_dest_finalize(&self, req_id: u64) {
        let entry = self.inner.copies.lock().remove(&req_id);
        let (persona, cx, dst_heap, dst_raw, bounce_d, size) = match entry {
            Some(CopyPending::AsDest {
                persona,
                cx,
                dst_heap,
                dst_raw,
                bounce_d,
                size,
            }) => (persona, cx, dst_heap, dst_raw, bounce_d, size),
            _ => crate::misuse!("copy finalize for unknown request {}", req_id),
        };
        match bounce_d {
            Some(bounce) => {
                let rt = self.clone();
                self.device_copy(
                    dst_heap,
                    DevCopy::HostToDev {
                        src: bounce,
                        dst: dst_raw,
                        len: size,
                    },
                    move || {
                        rt.deallocate_bytes(bounce);
                        rt.finish_copy(persona, cx, rt.rank_me());
                    },
                );
            }
            None => self.finish_copy(persona, cx, self.rank_me()),
        }
    }

    fn handle_dest_fetch(
        &self,
        src_rank: usize,
        req_id: u64,
        fetch_addr: usize,
        size: usize,
        dst_heap: u16,
        dst_raw: usize,
        remote: Option<RemoteAm>,
    ) {
        let bounce_d = if dst_heap != 0 && !self.native_device_support() {
            Some(self.alloc_bounce(size))
        } else {
            None
        };
        let land_addr = bounce_d.unwrap_or(dst_raw);
        let rt = self.clone();
        let after_landed = move |rt: Runtime| {
            if let Some(am) = remote {
                // the remote completion is user-visible; defer it to
                // user-level progress on this rank's master
                let rt2 = rt.clone();
                rt.master_persona().push_lpc(
                    ProgressLevel::User,
                    Box::new(move || am.execute(&rt2, src_rank)),
                );
            }
            rt.send_copy_msg(src_rank, &CopyMsg::SrcDone { req_id });
        };
        unsafe {
            self.rma_get_raw(src_rank, fetch_addr, land_addr, size, move || {
                match bounce_d {
                    Some(bounce) => {
                        let rt2 = rt.clone();
                        rt.device_copy(
                            dst_heap,
                            DevCopy::HostToDev {
                                src: bounce,
                                dst: dst_raw,
                                len: size,
                            },
                            move || {
                                rt2.deallocate_bytes(bounce);
                                after_landed(rt2.clone());
                            },
                        );
                    }
                    None => after_landed(rt.clone()),
                }
            });
        }
    }

    fn handle_src_done(&self, req_id: u64) {
        let entry = self.inner.copies.lock().remove(&req_id);
        let (persona, cx, bounce_s) = match entry {
            Some(CopyPending::AsSource {
                persona,
                cx,
                bounce_s,
            }) => (persona, cx, bounce_s),
            _ => crate::misuse!("copy source-done for unknown request {}", req_id),
        };
        if let Some(bounce) = bounce_s {
            self.deallocate_bytes(bounce);
        }
        // signal_operation also fires source when no bounce was staged
        self.finish_copy(persona, cx, self.rank_me());
    }

    // ---- shared plumbing ----

    fn finish_copy(&self, persona: Persona, mut cx: CxState, remote_rank: usize) {
        let rt = self.clone();
        persona.push_lpc(
            ProgressLevel::User,
            Box::new(move || {
                cx.signal_operation();
                if let Some(am) = cx.remote.take() {
                    rt.send_am_packed(ProgressLevel::User, remote_rank, am);
                }
            }),
        );
    }

    fn signal_copy_source(&self, req_id: u64) {
        if let Some(CopyPending::AsSource { cx, .. }) = self.inner.copies.lock().get_mut(&req_id) {
            cx.signal_source();
        }
    }

    fn alloc_bounce(&self, size: usize) -> usize {
        match self.allocate_bytes(size, config().bounce_align) {
            Ok(addr) => addr,
            Err(err) => crate::fatal!("bounce buffer allocation failed: {}", err),
        }
    }

    pub(crate) fn device_copy(&self, heap: u16, op: DevCopy, cb: impl FnOnce() + Send + 'static) {
        let dev = match self.device_heap(heap) {
            Some(dev) => dev,
            None => crate::misuse!("device copy against unregistered heap {}", heap),
        };
        let ev = dev.api.copy(op);
        current_persona().push_handle_cb(HandleCb {
            done: Box::new(move || ev.done()),
            run: Box::new(cb),
        });
    }

    fn native_device_support(&self) -> bool {
        use crate::fabric::FabricComm;
        self.inner.fabric.native_device_support()
    }

    fn send_copy_msg(&self, rank: usize, msg: &CopyMsg) {
        let wire_msg = Msg {
            cmd: Cmd::CopyProto,
            src: self.rank_me() as u16,
            req_id: 0,
            persona: 0,
            level: ProgressLevel::Internal,
        };
        let body = serialize(msg).expect("copy msg pack");
        self.send_wire(rank, wire_msg, body);
    }
}

/// Entry point from the wire dispatcher: copy choreography runs at
/// internal-level progress on the master persona.
pub(crate) fn handle_copy_msg(rt: &Runtime, src: usize, _msg: Msg, body: Vec<u8>) {
    let msg: CopyMsg = deserialize(&body).expect("copy msg decode");
    let rt = rt.clone();
    let master = rt.master_persona().clone();
    master.push_lpc(
        ProgressLevel::Internal,
        Box::new(move || match msg {
            CopyMsg::StagePut {
                req_id,
                src_heap,
                src_addr,
                size,
                dst_bounce,
            } => rt.handle_stage_put(src, req_id, src_heap, src_addr, size, dst_bounce),
            CopyMsg::DestFinalize { req_id } => rt.handle_dest_finalize(req_id),
            CopyMsg::DestFetch {
                req_id,
                fetch_addr,
                size,
                dst_heap,
                dst_raw,
                src_used_bounce: _,
                remote,
            } => rt.handle_dest_fetch(src, req_id, fetch_addr, size, dst_heap, dst_raw, remote),
            CopyMsg::SrcDone { req_id } => rt.handle_src_done(req_id),
        }),
    );
}
