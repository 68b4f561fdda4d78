//! Memory kinds and compile-time kind sets.
//!
//! A global pointer's type carries a *kind set*: the set of memory kinds
//! its target may dynamically have. Most pointers are statically
//! host-only; pointers produced by generic code that must handle both
//! host and device memory use [`AnyKind`] and recover the static kind
//! with a checked cast.

use serde::{Deserialize, Serialize};

/// The dynamic memory kind of an individual allocation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryKind {
    Host,
    CudaDevice,
}

/// Maximum number of concurrently registered device heaps per rank.
/// Heap index 0 is the host shared segment; device heaps occupy 1..=MAX.
pub const MAX_DEVICE_HEAPS: usize = 32;

/// A compile-time-known, non-empty subset of [`MemoryKind`].
pub trait KindSet: Copy + Clone + Send + Sync + 'static {
    /// Membership test for a dynamic kind.
    fn contains(kind: MemoryKind) -> bool;
    /// The single member when the set is a singleton, used to default
    /// the dynamic kind of pointers constructed under this set.
    const SINGLE: Option<MemoryKind>;
    const NAME: &'static str;
}

/// The singleton kind set {host}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Host;

/// The singleton kind set {cuda_device}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cuda;

/// The full kind set {host, cuda_device}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnyKind;

impl KindSet for Host {
    fn contains(kind: MemoryKind) -> bool {
        kind == MemoryKind::Host
    }
    const SINGLE: Option<MemoryKind> = Some(MemoryKind::Host);
    const NAME: &'static str = "host";
}

impl KindSet for Cuda {
    fn contains(kind: MemoryKind) -> bool {
        kind == MemoryKind::CudaDevice
    }
    const SINGLE: Option<MemoryKind> = Some(MemoryKind::CudaDevice);
    const NAME: &'static str = "cuda_device";
}

impl KindSet for AnyKind {
    fn contains(_kind: MemoryKind) -> bool {
        true
    }
    const SINGLE: Option<MemoryKind> = None;
    const NAME: &'static str = "any";
}

/// Witness that every member of `Self` is a member of `K`. Drives the
/// implicit narrower-to-broader conversions on global pointers;
/// narrowing goes through the checked dynamic cast instead.
pub trait SubsetOf<K: KindSet>: KindSet {}

impl SubsetOf<Host> for Host {}
impl SubsetOf<Cuda> for Cuda {}
impl SubsetOf<AnyKind> for Host {}
impl SubsetOf<AnyKind> for Cuda {}
impl SubsetOf<AnyKind> for AnyKind {}
