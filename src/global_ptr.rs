//! Typed global pointers.
//!
//! A [`GlobalPtr`] names memory anywhere in the job: the owning rank, the
//! raw byte address inside that rank's segment, the heap index (0 is the
//! host shared segment, positive indices are device segments), and the
//! dynamic memory kind. The pointer itself is plain data: it is `Copy`,
//! serializable, and carries no liveness; address translation and
//! validation live on [`crate::runtime::Runtime`], which holds the
//! segment map.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::memory_kind::{AnyKind, Host, KindSet, MemoryKind, SubsetOf};

pub struct GlobalPtr<T, K: KindSet = Host> {
    pub(crate) heap: u16,
    pub(crate) rank: usize,
    pub(crate) raw: usize,
    pub(crate) kind: MemoryKind,
    _elem: PhantomData<fn() -> T>,
    _kinds: PhantomData<K>,
}

impl<T, K: KindSet> GlobalPtr<T, K> {
    pub(crate) fn from_parts(rank: usize, raw: usize, heap: u16, kind: MemoryKind) -> Self {
        debug_assert!(raw == 0 || K::contains(kind));
        GlobalPtr {
            heap,
            rank,
            raw,
            kind,
            _elem: PhantomData,
            _kinds: PhantomData,
        }
    }

    /// The null pointer: rank 0, address 0, heap 0.
    pub fn null() -> Self {
        GlobalPtr {
            heap: 0,
            rank: 0,
            raw: 0,
            kind: MemoryKind::Host,
            _elem: PhantomData,
            _kinds: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.raw == 0
    }

    /// The rank owning the target memory.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Heap index: 0 for the host shared segment, 1.. for device heaps.
    pub fn heap_index(&self) -> u16 {
        self.heap
    }

    /// Raw byte address within the owner's segment address space.
    pub fn raw_addr(&self) -> usize {
        self.raw
    }

    /// The dynamic memory kind of the target allocation.
    pub fn dynamic_kind(&self) -> MemoryKind {
        self.kind
    }

    /// Pointer arithmetic in element units.
    pub fn add(self, n: usize) -> Self {
        let mut y = self;
        y.raw += n * std::mem::size_of::<T>();
        y
    }

    pub fn sub(self, n: usize) -> Self {
        let mut y = self;
        y.raw -= n * std::mem::size_of::<T>();
        y
    }

    /// Element distance `self - rhs`. Both pointers must name the same
    /// rank and heap.
    pub fn offset_from(&self, rhs: &Self) -> isize {
        if self.rank != rhs.rank || self.heap != rhs.heap {
            crate::misuse!(
                "global pointer subtraction requires identical rank and heap \
                 (lhs rank {} heap {}, rhs rank {} heap {})",
                self.rank,
                self.heap,
                rhs.rank,
                rhs.heap
            );
        }
        (self.raw as isize - rhs.raw as isize) / std::mem::size_of::<T>() as isize
    }

    /// Reinterpret the element type. The raw address is unchanged; the
    /// caller asserts the new type's layout is valid at that address.
    pub fn cast<U>(self) -> GlobalPtr<U, K> {
        GlobalPtr::from_parts(self.rank, self.raw, self.heap, self.kind)
    }

    /// Widen the kind set. Statically checked: every member of `K` must
    /// be a member of `K2`.
    pub fn static_kind_cast<K2: KindSet>(self) -> GlobalPtr<T, K2>
    where
        K: SubsetOf<K2>,
    {
        GlobalPtr::from_parts(self.rank, self.raw, self.heap, self.kind)
    }

    /// Narrow the kind set, checking the dynamic kind for membership.
    /// Returns `None` when the target's kind is not in `K2`.
    pub fn dynamic_kind_cast<K2: KindSet>(self) -> Option<GlobalPtr<T, K2>> {
        if self.is_null() || K2::contains(self.kind) {
            Some(GlobalPtr::from_parts(self.rank, self.raw, self.heap, self.kind))
        } else {
            None
        }
    }
}

impl<T> GlobalPtr<T, Host> {
    /// Erase the host-only static kind.
    pub fn any_kind(self) -> GlobalPtr<T, AnyKind> {
        self.static_kind_cast()
    }
}

impl<T> From<GlobalPtr<T, Host>> for GlobalPtr<T, AnyKind> {
    fn from(p: GlobalPtr<T, Host>) -> Self {
        p.static_kind_cast()
    }
}

impl<T> From<GlobalPtr<T, crate::memory_kind::Cuda>> for GlobalPtr<T, AnyKind> {
    fn from(p: GlobalPtr<T, crate::memory_kind::Cuda>) -> Self {
        p.static_kind_cast()
    }
}

// Plain-data trait impls are written by hand: a derive would demand the
// bounds on `T`, but the pointer never holds a `T`.

impl<T, K: KindSet> Clone for GlobalPtr<T, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, K: KindSet> Copy for GlobalPtr<T, K> {}

impl<T, K: KindSet> PartialEq for GlobalPtr<T, K> {
    fn eq(&self, other: &Self) -> bool {
        self.heap == other.heap
            && self.rank == other.rank
            && self.raw == other.raw
            && self.kind == other.kind
    }
}

impl<T, K: KindSet> Eq for GlobalPtr<T, K> {}

impl<T, K: KindSet> PartialOrd for GlobalPtr<T, K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, K: KindSet> Ord for GlobalPtr<T, K> {
    // total order by (heap, rank, raw); kind breaks the residual tie so
    // that Ord stays consistent with Eq
    fn cmp(&self, other: &Self) -> Ordering {
        (self.heap, self.rank, self.raw, self.kind).cmp(&(
            other.heap,
            other.rank,
            other.raw,
            other.kind,
        ))
    }
}

impl<T, K: KindSet> Hash for GlobalPtr<T, K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.heap.hash(state);
        self.rank.hash(state);
        self.raw.hash(state);
        self.kind.hash(state);
    }
}

impl<T, K: KindSet> std::fmt::Debug for GlobalPtr<T, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "(gp: rank {}, {:#x}, heap {}, {:?})",
            self.rank, self.raw, self.heap, self.kind
        )
    }
}

impl<T, K: KindSet> Serialize for GlobalPtr<T, K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.heap, self.rank, self.raw, self.kind).serialize(serializer)
    }
}

impl<'de, T, K: KindSet> Deserialize<'de> for GlobalPtr<T, K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (heap, rank, raw, kind) = <(u16, usize, usize, MemoryKind)>::deserialize(deserializer)?;
        Ok(GlobalPtr::from_parts(rank, raw, heap, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::collections::BTreeSet;

    fn gp(rank: usize, raw: usize, heap: u16) -> GlobalPtr<u64> {
        GlobalPtr::from_parts(rank, raw, heap, MemoryKind::Host)
    }

    #[test]
    fn null_compares_equal_across_element_types() {
        let a: GlobalPtr<u8> = GlobalPtr::null();
        let b: GlobalPtr<i64> = GlobalPtr::null();
        assert_eq!(a, b.cast::<u8>());
        assert!(a.is_null());
    }

    #[test]
    fn arithmetic_in_element_units() {
        let p = gp(1, 0x1000, 0);
        let q = p.add(3);
        assert_eq!(q.raw_addr(), 0x1000 + 3 * 8);
        assert_eq!(q.offset_from(&p), 3);
        assert_eq!(q.sub(3), p);
    }

    #[test]
    fn total_order_is_heap_rank_raw() {
        let mut set = BTreeSet::new();
        set.insert(gp(1, 0x10, 1));
        set.insert(gp(0, 0x20, 1));
        set.insert(gp(2, 0x30, 0));
        let v: Vec<_> = set.iter().cloned().collect();
        assert_eq!(v[0], gp(2, 0x30, 0));
        assert_eq!(v[1], gp(0, 0x20, 1));
        assert_eq!(v[2], gp(1, 0x10, 1));
    }

    #[test]
    fn hash_respects_equality() {
        let a = gp(3, 0x40, 0);
        let b = gp(3, 0x40, 0);
        let hash = |p: &GlobalPtr<u64>| {
            let mut h = DefaultHasher::new();
            p.hash(&mut h);
            h.finish()
        };
        assert_eq!(a, b);
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn kind_casts() {
        let p = gp(0, 0x100, 0);
        let wide: GlobalPtr<u64, AnyKind> = p.any_kind();
        assert_eq!(wide.dynamic_kind(), MemoryKind::Host);
        let narrowed = wide.dynamic_kind_cast::<Host>().expect("host member");
        assert_eq!(narrowed, p);
        assert!(wide.dynamic_kind_cast::<crate::memory_kind::Cuda>().is_none());
    }

    #[test]
    fn wire_roundtrip() {
        let p = gp(2, 0xbeef, 1);
        let bytes = bincode::serialize(&p).unwrap();
        let q: GlobalPtr<u64> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(p, q);
    }
}
