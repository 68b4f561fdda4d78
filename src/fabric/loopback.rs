//! The loopback fabric: an entire job inside one process.
//!
//! Each rank owns a heap-allocated segment; since all segments share the
//! process address space, the whole job is the local team and address
//! translation is the identity. Active messages travel through per-rank
//! channels and RMA is a direct memory copy whose completion is still
//! reported through a pollable handle, so the callers' completion
//! machinery is exercised exactly as it would be on a real network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};

use super::{Backend, CommHandle, Envelope, FabricAm, FabricComm, FabricRdma};

struct SegMem {
    // kept alive for the cluster's lifetime; RMA writes go through raw
    // pointers into this storage
    _storage: Box<[u8]>,
    base: usize,
    len: usize,
}

unsafe impl Send for SegMem {}
unsafe impl Sync for SegMem {}

pub(crate) struct Cluster {
    num_ranks: usize,
    segs: Vec<SegMem>,
    mailboxes: Vec<(Sender<Envelope>, Receiver<Envelope>)>,
    finalized: AtomicUsize,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("num_ranks", &self.num_ranks)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LoopbackFabric {
    my_rank: usize,
    cluster: Arc<Cluster>,
}

/// Build the fabrics of an `n`-rank loopback job.
pub(crate) fn cluster(num_ranks: usize, heap_size: usize) -> Vec<LoopbackFabric> {
    assert!(num_ranks > 0, "a job has at least one rank");
    let segs = (0..num_ranks)
        .map(|_| {
            let mut storage = vec![0u8; heap_size].into_boxed_slice();
            let base = storage.as_mut_ptr() as usize;
            SegMem {
                _storage: storage,
                base,
                len: heap_size,
            }
        })
        .collect();
    let mailboxes = (0..num_ranks).map(|_| unbounded()).collect();
    let cluster = Arc::new(Cluster {
        num_ranks,
        segs,
        mailboxes,
        finalized: AtomicUsize::new(0),
    });
    (0..num_ranks)
        .map(|my_rank| LoopbackFabric {
            my_rank,
            cluster: cluster.clone(),
        })
        .collect()
}

impl FabricComm for LoopbackFabric {
    fn my_rank(&self) -> usize {
        self.my_rank
    }

    fn num_ranks(&self) -> usize {
        self.cluster.num_ranks
    }

    fn backend(&self) -> Backend {
        Backend::Loopback
    }

    fn native_device_support(&self) -> bool {
        false
    }

    fn shutdown(&self) {
        self.cluster.finalized.fetch_add(1, Ordering::AcqRel);
    }

    fn shutdown_done(&self) -> bool {
        self.cluster.finalized.load(Ordering::Acquire) >= self.cluster.num_ranks
    }
}

impl FabricAm for LoopbackFabric {
    fn send(&self, rank: usize, env: Envelope) {
        self.cluster.mailboxes[rank]
            .0
            .send(env)
            .expect("loopback mailbox lives as long as the cluster");
    }

    fn try_recv(&self) -> Option<Envelope> {
        self.cluster.mailboxes[self.my_rank].1.try_recv().ok()
    }

    fn inbound_pending(&self) -> bool {
        !self.cluster.mailboxes[self.my_rank].1.is_empty()
    }
}

impl FabricRdma for LoopbackFabric {
    fn put(&self, rank: usize, dst_addr: usize, src: &[u8]) -> CommHandle {
        debug_assert!(rank < self.cluster.num_ranks);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst_addr as *mut u8, src.len());
        }
        let handle = CommHandle::new();
        handle.complete();
        handle
    }

    fn get(&self, rank: usize, src_addr: usize, dst: &mut [u8]) -> CommHandle {
        debug_assert!(rank < self.cluster.num_ranks);
        unsafe {
            std::ptr::copy_nonoverlapping(src_addr as *const u8, dst.as_mut_ptr(), dst.len());
        }
        let handle = CommHandle::new();
        handle.complete();
        handle
    }

    fn segment_base(&self, rank: usize) -> usize {
        self.cluster.segs[rank].base
    }

    fn segment_size(&self, rank: usize) -> usize {
        self.cluster.segs[rank].len
    }

    fn local_team_lb(&self) -> usize {
        0
    }

    fn local_team_len(&self) -> usize {
        self.cluster.num_ranks
    }

    fn local_addr(&self, _rank: usize, raw: usize) -> usize {
        // one address space: peers publish directly usable addresses
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rma_between_segments() {
        let fabrics = cluster(2, 4096);
        let dst = fabrics[1].segment_base(1);
        let payload = [1u8, 2, 3, 4];
        let h = fabrics[0].put(1, dst, &payload);
        assert!(h.done());
        let mut back = [0u8; 4];
        let h = fabrics[0].get(1, dst, &mut back);
        assert!(h.done());
        assert_eq!(back, payload);
    }

    #[test]
    fn am_mailboxes() {
        let fabrics = cluster(2, 1024);
        fabrics[0].send(
            1,
            Envelope {
                src: 0,
                buf: vec![7, 8, 9],
            },
        );
        assert!(fabrics[1].inbound_pending());
        let env = fabrics[1].try_recv().expect("delivered");
        assert_eq!(env.src, 0);
        assert_eq!(env.buf, vec![7, 8, 9]);
        assert!(fabrics[0].try_recv().is_none());
    }
}
