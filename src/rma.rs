//! One-sided put/get against registered segments.
//!
//! The raw layer registers a handle callback on the issuing persona;
//! progress polls the handle and runs the callback exactly once on
//! completion. The typed layer validates global pointers and exposes
//! future-returning transfers for plain-data element types.

use crate::completion::{Completions, CxHandles, CxState};
use crate::fabric::FabricRdma;
use crate::future::{Future, Promise};
use crate::global_ptr::GlobalPtr;
use crate::memory_kind::{Host, KindSet};
use crate::persona::{current_persona, HandleCb, ProgressLevel};
use crate::runtime::Runtime;

/// Handles of a get: the fetched values plus one future per event bound
/// to a future sink, in event order.
#[derive(Debug)]
pub struct GetHandles<V> {
    pub values: Future<V>,
    pub source: Option<Future<()>>,
    pub operation: Option<Future<()>>,
}

impl Runtime {
    /// Raw one-sided put; `cb` runs on the current persona once the
    /// source buffer may be reused and the data is visible at the
    /// target.
    pub(crate) fn rma_put_raw(
        &self,
        rank: usize,
        dst_addr: usize,
        src: &[u8],
        cb: impl FnOnce() + Send + 'static,
    ) {
        let handle = self.inner.fabric.put(rank, dst_addr, src);
        current_persona().push_handle_cb(HandleCb {
            done: Box::new(move || handle.done()),
            run: Box::new(cb),
        });
    }

    /// Raw one-sided get into local memory at `dst_addr`.
    ///
    /// # Safety
    /// `dst_addr` must point to at least `len` writable bytes that stay
    /// valid until `cb` runs.
    pub(crate) unsafe fn rma_get_raw(
        &self,
        rank: usize,
        src_addr: usize,
        dst_addr: usize,
        len: usize,
        cb: impl FnOnce() + Send + 'static,
    ) {
        let dst = std::slice::from_raw_parts_mut(dst_addr as *mut u8, len);
        let handle = self.inner.fabric.get(rank, src_addr, dst);
        current_persona().push_handle_cb(HandleCb {
            done: Box::new(move || handle.done()),
            run: Box::new(cb),
        });
    }

    /// Put `src` into the memory named by `dest`. Completion order per
    /// operation: source, then operation, then the optional remote AM on
    /// the target.
    pub fn rput_with<T, K>(&self, src: &[T], dest: GlobalPtr<T, K>, cxs: Completions) -> CxHandles
    where
        T: Copy + Send + Sync + 'static,
        K: KindSet,
    {
        self.check_init("rput");
        self.check_gp(dest, std::mem::align_of::<T>());
        if dest.is_null() {
            crate::misuse!("rput to a null global pointer");
        }
        let (mut state, handles) = CxState::new(cxs);
        let bytes = unsafe {
            std::slice::from_raw_parts(src.as_ptr() as *const u8, std::mem::size_of_val(src))
        };
        let rank = dest.rank();
        let rt = self.clone();
        self.rma_put_raw(rank, dest.raw_addr(), bytes, move || {
            state.signal_operation();
            if let Some(am) = state.remote.take() {
                rt.send_am_packed(ProgressLevel::User, rank, am);
            }
        });
        self.attach_progress(&handles);
        handles
    }

    /// Put with the default completion set; the returned future is the
    /// operation completion.
    pub fn rput<T>(&self, src: &[T], dest: GlobalPtr<T, Host>) -> Future<()>
    where
        T: Copy + Send + Sync + 'static,
    {
        self.rput_with(src, dest, Completions::operation_future())
            .operation()
    }

    /// Get `n` elements starting at `src` with an explicit completion
    /// set. The fetched values always arrive through the dedicated
    /// `values` future; the set routes the source/operation events to
    /// additional sinks and the optional remote AM runs on the rank that
    /// was read.
    pub fn rget_with<T>(
        &self,
        src: GlobalPtr<T, Host>,
        n: usize,
        cxs: Completions,
    ) -> GetHandles<Vec<T>>
    where
        T: Copy + Send + Sync + 'static,
    {
        self.check_init("rget");
        self.check_gp(src, std::mem::align_of::<T>());
        if src.is_null() {
            crate::misuse!("rget from a null global pointer");
        }
        let (mut state, handles) = CxState::new(cxs);
        let mut storage: Vec<T> = Vec::with_capacity(n);
        let handle = {
            let dst = unsafe {
                std::slice::from_raw_parts_mut(
                    storage.as_mut_ptr() as *mut u8,
                    n * std::mem::size_of::<T>(),
                )
            };
            self.inner.fabric.get(src.rank(), src.raw_addr(), dst)
        };
        let promise = Promise::<Vec<T>>::new();
        let values = promise.get_future();
        let rank = src.rank();
        let rt = self.clone();
        current_persona().push_handle_cb(HandleCb {
            done: Box::new(move || handle.done()),
            run: Box::new(move || {
                let mut storage = storage;
                unsafe { storage.set_len(n) };
                promise.fulfill_result(storage);
                state.signal_operation();
                if let Some(am) = state.remote.take() {
                    rt.send_am_packed(ProgressLevel::User, rank, am);
                }
            }),
        });
        self.attach_progress(&handles);
        let rt = self.clone();
        values.set_progress_hook(Box::new(move || rt.progress(ProgressLevel::User)));
        GetHandles {
            values,
            source: handles.source,
            operation: handles.operation,
        }
    }

    /// Get `n` elements starting at `src`. The returned future holds the
    /// fetched values.
    pub fn rget<T>(&self, src: GlobalPtr<T, Host>, n: usize) -> Future<Vec<T>>
    where
        T: Copy + Send + Sync + 'static,
    {
        self.rget_with(src, n, Completions::none()).values
    }

    /// Get a single value with an explicit completion set.
    pub fn rget_value_with<T>(&self, src: GlobalPtr<T, Host>, cxs: Completions) -> GetHandles<T>
    where
        T: Copy + Send + Sync + 'static,
    {
        let inner = self.rget_with(src, 1, cxs);
        GetHandles {
            values: inner.values.then(|mut v| v.remove(0)),
            source: inner.source,
            operation: inner.operation,
        }
    }

    /// Get a single value.
    pub fn rget_value<T>(&self, src: GlobalPtr<T, Host>) -> Future<T>
    where
        T: Copy + Send + Sync + 'static,
    {
        self.rget_value_with(src, Completions::none()).values
    }

    fn attach_progress(&self, handles: &CxHandles) {
        let hook = {
            let rt = self.clone();
            move || rt.progress(ProgressLevel::User)
        };
        if let Some(f) = &handles.source {
            let hook = hook.clone();
            f.set_progress_hook(Box::new(hook));
        }
        if let Some(f) = &handles.operation {
            f.set_progress_hook(Box::new(hook));
        }
    }
}
