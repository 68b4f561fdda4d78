//! The network fabric contract.
//!
//! The core never speaks a wire protocol itself; it drives a fabric
//! through these traits: point-to-point active-message envelopes,
//! one-sided put/get against registered segments with handle-based
//! completion, and segment geometry queries for the local team. The
//! shipped backend is [`loopback::LoopbackFabric`], an in-process
//! cluster in which every rank's segment is mapped, used for
//! development and for the test suite.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::env_var::config;

pub(crate) mod loopback;
use loopback::LoopbackFabric;

/// The list of available fabric backends.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy)]
pub enum Backend {
    /// In-process execution; every rank's segment is mapped
    Loopback,
}

impl Default for Backend {
    fn default() -> Self {
        match config().backend.as_str() {
            "loopback" => Backend::Loopback,
            other => panic!("unknown fabric backend '{}'", other),
        }
    }
}

/// Completion token for a one-sided operation. Progress polls it.
#[derive(Clone, Debug)]
pub(crate) struct CommHandle {
    done: Arc<AtomicBool>,
}

impl CommHandle {
    pub(crate) fn new() -> CommHandle {
        CommHandle {
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// A delivered active message: the sender's rank and the packed bytes.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) src: usize,
    pub(crate) buf: Vec<u8>,
}

#[enum_dispatch]
pub(crate) trait FabricComm {
    fn my_rank(&self) -> usize;
    fn num_ranks(&self) -> usize;
    fn backend(&self) -> Backend;
    /// Whether put/get accept device-resident endpoints directly, in
    /// which case the copy engine skips bounce staging.
    fn native_device_support(&self) -> bool;
    /// Collective teardown; returns once every rank has entered.
    fn shutdown(&self);
    fn shutdown_done(&self) -> bool;
}

#[enum_dispatch]
pub(crate) trait FabricAm {
    fn send(&self, rank: usize, env: Envelope);
    fn try_recv(&self) -> Option<Envelope>;
    fn inbound_pending(&self) -> bool;
}

#[enum_dispatch]
pub(crate) trait FabricRdma {
    /// One-sided put of `src` into `dst_addr` in `rank`'s address space.
    fn put(&self, rank: usize, dst_addr: usize, src: &[u8]) -> CommHandle;
    /// One-sided get of `dst.len()` bytes from `src_addr` in `rank`'s
    /// address space.
    fn get(&self, rank: usize, src_addr: usize, dst: &mut [u8]) -> CommHandle;
    fn segment_base(&self, rank: usize) -> usize;
    fn segment_size(&self, rank: usize) -> usize;
    /// Lower bound of the contiguous rank range whose segments are
    /// mapped into this process.
    fn local_team_lb(&self) -> usize;
    fn local_team_len(&self) -> usize;
    /// Translate a local-team peer's raw address into one dereferenceable
    /// here. The caller has already bounds-checked.
    fn local_addr(&self, rank: usize, raw: usize) -> usize;
}

#[enum_dispatch(FabricComm, FabricAm, FabricRdma)]
#[derive(Debug)]
pub(crate) enum Fabric {
    Loopback(LoopbackFabric),
}

/// Construct the fabrics of a job. Every backend is collective over its
/// ranks; the loopback backend materializes all of them at once in this
/// process.
pub(crate) fn create_fabrics(backend: Backend, num_ranks: usize, heap_size: usize) -> Vec<Fabric> {
    match backend {
        Backend::Loopback => loopback::cluster(num_ranks, heap_size)
            .into_iter()
            .map(Fabric::Loopback)
            .collect(),
    }
}
