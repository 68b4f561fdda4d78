//! Field pointers: form a global pointer to a member of a remotely
//! allocated object.
//!
//! [`memberof!`] resolves the field offset locally with
//! `memoffset::offset_of!`, which is well-defined for `repr(C)` types.
//! [`memberof_general!`] returns a future: immediately ready when the
//! target is locally mappable, otherwise resolved by an RPC to the
//! owning rank, which computes the offset against its own instantiation
//! of the type.

use crate::global_ptr::GlobalPtr;
use crate::memory_kind::KindSet;

#[doc(hidden)]
pub fn member_ptr<T, F, K: KindSet>(gp: GlobalPtr<T, K>, offset: usize) -> GlobalPtr<F, K> {
    if gp.is_null() {
        crate::misuse!("memberof of a null global pointer");
    }
    debug_assert!(offset < std::mem::size_of::<T>());
    GlobalPtr::from_parts(
        gp.rank(),
        gp.raw_addr() + offset,
        gp.heap_index(),
        gp.dynamic_kind(),
    )
}

/// `memberof!(gp, Type, field)` is a global pointer to `(*gp).field`.
/// `Type` must be the pointer's element type and should be `repr(C)` for
/// a well-defined field offset.
#[macro_export]
macro_rules! memberof {
    ($gp:expr, $t:ty, $field:tt) => {
        $crate::memberof::member_ptr::<$t, _, _>($gp, $crate::memoffset::offset_of!($t, $field))
    };
}

/// `memberof_general!(rt, gp, Type, field, FieldType)` is a future of a
/// global pointer to `(*gp).field`, usable even when the target is not
/// locally mappable: the owner computes the offset against its own
/// instantiation of the type and replies. The pointer's kind set is
/// widened to [`crate::memory_kind::AnyKind`].
#[macro_export]
macro_rules! memberof_general {
    ($rt:expr, $gp:expr, $t:ty, $field:tt, $f:ty) => {{
        let rt = &$rt;
        let gp: $crate::global_ptr::GlobalPtr<$t, $crate::memory_kind::AnyKind> =
            $gp.static_kind_cast();
        if rt.is_local(gp) {
            $crate::future::make_future($crate::memberof!(gp, $t, $field))
        } else {
            #[derive($crate::serde::Serialize, $crate::serde::Deserialize)]
            struct __ResolveMember {
                gp: $crate::global_ptr::GlobalPtr<$t, $crate::memory_kind::AnyKind>,
            }
            impl $crate::active_messaging::RemoteFn for __ResolveMember {
                type Output =
                    $crate::global_ptr::GlobalPtr<$f, $crate::memory_kind::AnyKind>;
                const NAME: &'static str = concat!(
                    "memberof::",
                    module_path!(),
                    "::",
                    stringify!($t),
                    "::",
                    stringify!($field)
                );
                fn call(self, _rt: &$crate::runtime::Runtime) -> Self::Output {
                    $crate::memberof!(self.gp, $t, $field)
                }
            }
            $crate::register_remote_fn!(__ResolveMember);
            rt.rpc(gp.rank(), __ResolveMember { gp })
        }
    }};
}
