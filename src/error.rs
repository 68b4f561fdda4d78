//! Recoverable error types surfaced by allocation and pointer validation.

use crate::memory_kind::MemoryKind;

/// The shared host heap could not satisfy an allocation request.
#[derive(Debug, Clone)]
pub struct BadSharedAlloc {
    pub requested: usize,
    pub used: usize,
    pub capacity: usize,
}

impl std::fmt::Display for BadSharedAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "shared heap is out of memory: requested {} bytes with {} of {} in use \
             (a larger heap can be requested via TESSERA_HEAP_SIZE)",
            self.requested, self.used, self.capacity
        )
    }
}

impl std::error::Error for BadSharedAlloc {}

pub type AllocResult<T> = Result<T, BadSharedAlloc>;

/// A device segment could not be created during setup.
#[derive(Debug, Clone)]
pub struct BadSegmentAlloc {
    pub device: &'static str,
    pub requested: usize,
}

impl std::fmt::Display for BadSegmentAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "failed to allocate a {} byte segment on device {}",
            self.requested, self.device
        )
    }
}

impl std::error::Error for BadSegmentAlloc {}

/// Misuse of a global pointer. Raised through the fatal channel in
/// checked builds; the variants exist so validation sites can compose a
/// precise message.
#[derive(Debug, Clone)]
pub enum BadGlobalPtr {
    Null,
    RankOutOfRange { rank: usize, rank_n: usize },
    OutsideSegment { rank: usize, addr: usize, base: usize, size: usize },
    Misaligned { addr: usize, align: usize },
    WrongOwner { owner: usize, caller: usize },
    UnknownHeap { heap: u16 },
    KindMismatch { have: MemoryKind },
}

impl std::fmt::Display for BadGlobalPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BadGlobalPtr::Null => write!(f, "null global pointer where non-null is required"),
            BadGlobalPtr::RankOutOfRange { rank, rank_n } => {
                write!(f, "rank {} out of range for job of {} ranks", rank, rank_n)
            }
            BadGlobalPtr::OutsideSegment { rank, addr, base, size } => write!(
                f,
                "address {:#x} outside the segment of rank {} [{:#x}, {:#x})",
                addr,
                rank,
                base,
                base + size
            ),
            BadGlobalPtr::Misaligned { addr, align } => {
                write!(f, "address {:#x} violates alignment {}", addr, align)
            }
            BadGlobalPtr::WrongOwner { owner, caller } => write!(
                f,
                "operation restricted to owning rank {} was invoked on rank {}",
                owner, caller
            ),
            BadGlobalPtr::UnknownHeap { heap } => {
                write!(f, "heap index {} does not name a registered segment", heap)
            }
            BadGlobalPtr::KindMismatch { have } => {
                write!(f, "dynamic memory kind {:?} not a member of the target kind set", have)
            }
        }
    }
}

impl std::error::Error for BadGlobalPtr {}
