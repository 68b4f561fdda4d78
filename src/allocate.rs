//! Typed allocation in the shared host segment: placement construction
//! with panic-safe unwinding, array allocation with a count header, and
//! owner-checked destruction.

use std::panic::{self, AssertUnwindSafe};

use crate::error::AllocResult;
use crate::global_ptr::GlobalPtr;
use crate::memory_kind::{Host, MemoryKind};
use crate::runtime::Runtime;

fn array_padding<T>() -> usize {
    let align = std::mem::align_of::<T>().max(std::mem::align_of::<usize>());
    (std::mem::size_of::<usize>() + align - 1) & !(align - 1)
}

impl Runtime {
    /// Reserve `n` elements of `T` in the shared segment. The memory is
    /// uninitialized; pair with [`Runtime::deallocate`].
    pub fn allocate<T>(&self, n: usize) -> AllocResult<GlobalPtr<T, Host>> {
        let addr =
            self.allocate_bytes(n * std::mem::size_of::<T>(), std::mem::align_of::<T>())?;
        Ok(GlobalPtr::from_parts(
            self.rank_me(),
            addr,
            0,
            MemoryKind::Host,
        ))
    }

    /// Construct a `T` in the shared segment from `f`'s result. When the
    /// constructor panics, the allocation is reclaimed and the panic
    /// resumes.
    pub fn new_with<T, F>(&self, f: F) -> AllocResult<GlobalPtr<T, Host>>
    where
        F: FnOnce() -> T,
    {
        let gp = self.allocate::<T>(1)?;
        let value = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => value,
            Err(payload) => {
                self.deallocate_bytes(gp.raw_addr());
                panic::resume_unwind(payload);
            }
        };
        unsafe {
            std::ptr::write(gp.raw_addr() as *mut T, value);
        }
        Ok(gp)
    }

    /// Construct a `T` in the shared segment by value.
    pub fn new_<T>(&self, value: T) -> AllocResult<GlobalPtr<T, Host>> {
        self.new_with(move || value)
    }

    /// Allocate and default-construct `n` elements, preceded by a count
    /// header. Elements are constructed in order; a panicking
    /// constructor destroys the already-constructed prefix in reverse
    /// and reclaims the allocation.
    pub fn new_array<T: Default>(&self, n: usize) -> AllocResult<GlobalPtr<T, Host>> {
        let padding = array_padding::<T>();
        let total = padding
            .checked_add(n.checked_mul(std::mem::size_of::<T>()).unwrap_or_else(|| {
                crate::misuse!("new_array({}) overflows the addressable size", n)
            }))
            .unwrap_or_else(|| crate::misuse!("new_array({}) overflows the addressable size", n));
        let align = std::mem::align_of::<T>().max(std::mem::align_of::<usize>());
        let block = self.allocate_bytes(total, align)?;
        unsafe {
            std::ptr::write(block as *mut usize, n);
        }
        let elems = block + padding;
        let mut built = 0usize;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            for i in 0..n {
                unsafe {
                    std::ptr::write((elems + i * std::mem::size_of::<T>()) as *mut T, T::default());
                }
                built = i + 1;
            }
        }));
        if let Err(payload) = result {
            for i in (0..built).rev() {
                unsafe {
                    std::ptr::drop_in_place((elems + i * std::mem::size_of::<T>()) as *mut T);
                }
            }
            self.deallocate_bytes(block);
            panic::resume_unwind(payload);
        }
        Ok(GlobalPtr::from_parts(
            self.rank_me(),
            elems,
            0,
            MemoryKind::Host,
        ))
    }

    /// Release memory obtained from [`Runtime::allocate`]. Null is a
    /// no-op; calling from a rank other than the owner is misuse.
    pub fn deallocate<T>(&self, gp: GlobalPtr<T, Host>) {
        if gp.is_null() {
            return;
        }
        self.check_owner(gp, "deallocate");
        self.deallocate_bytes(gp.raw_addr());
    }

    /// Destroy a value built by [`Runtime::new_`] / [`Runtime::new_with`]
    /// and release its memory.
    ///
    /// # Safety
    /// `gp` must name a live value constructed by `new_`/`new_with` on
    /// this rank, not yet deleted.
    pub unsafe fn delete_<T>(&self, gp: GlobalPtr<T, Host>) {
        if gp.is_null() {
            return;
        }
        self.check_owner(gp, "delete_");
        std::ptr::drop_in_place(gp.raw_addr() as *mut T);
        self.deallocate_bytes(gp.raw_addr());
    }

    /// Destroy an array built by [`Runtime::new_array`], dropping the
    /// recorded number of elements, and release its memory.
    ///
    /// # Safety
    /// `gp` must be exactly the pointer returned by `new_array` on this
    /// rank, not yet deleted.
    pub unsafe fn delete_array<T>(&self, gp: GlobalPtr<T, Host>) {
        if gp.is_null() {
            return;
        }
        self.check_owner(gp, "delete_array");
        let padding = array_padding::<T>();
        let block = gp.raw_addr() - padding;
        let n = *(block as *const usize);
        if std::mem::needs_drop::<T>() {
            for i in 0..n {
                std::ptr::drop_in_place((gp.raw_addr() + i * std::mem::size_of::<T>()) as *mut T);
            }
        }
        self.deallocate_bytes(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_and_delete_roundtrip() {
        let rt = crate::runtime::Runtime::cluster_with_heap(1, 1 << 16).remove(0);
        let start = rt.shared_segment_used();
        let gp = rt.new_(41u64).unwrap();
        unsafe {
            let p = rt.localize(gp).as_ptr();
            assert_eq!(*p, 41);
            *p += 1;
            assert_eq!(*p, 42);
            rt.delete_(gp);
        }
        assert_eq!(rt.shared_segment_used(), start);
    }

    #[test]
    fn new_array_header_and_cleanup() {
        let rt = crate::runtime::Runtime::cluster_with_heap(1, 1 << 16).remove(0);
        let start = rt.shared_segment_used();
        let gp = rt.new_array::<u32>(100).unwrap();
        unsafe {
            let p = rt.localize(gp).as_ptr();
            for i in 0..100 {
                assert_eq!(*p.add(i), 0);
                *p.add(i) = i as u32;
            }
            rt.delete_array(gp);
        }
        assert_eq!(rt.shared_segment_used(), start);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let rt = crate::runtime::Runtime::cluster_with_heap(1, 4096).remove(0);
        assert!(rt.allocate::<u8>(1 << 20).is_err());
        // the heap remains usable after a failed request
        let gp = rt.allocate::<u8>(64).unwrap();
        rt.deallocate(gp);
    }
}
