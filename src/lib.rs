//! Tessera is a partitioned global address space (PGAS) runtime core: N
//! cooperating ranks address each other's memory through typed global
//! pointers, invoke typed remote procedure calls whose arguments and
//! results cross the wire serialized, and compose asynchronous
//! completions through futures delivered at explicit progress points.
//!
//! Execution is single-program-multiple-data and cooperatively
//! scheduled: the runtime never spawns threads. Completions and inbound
//! calls are delivered into per-thread *personas* and run only when the
//! application calls [`runtime::Runtime::progress`].
//!
//! EXAMPLES
//! --------
//!
//! # Shared allocation and one-sided access
//! ```
//! use tessera::runtime::Runtime;
//!
//! let rt = Runtime::cluster(1).remove(0);
//! let counter = rt.new_(0u64).unwrap();
//! let fetched = rt.rget_value(counter).wait();
//! assert_eq!(fetched, 0);
//! unsafe { rt.delete_(counter) };
//! ```
//!
//! # A remote procedure call
//! ```
//! use serde::{Deserialize, Serialize};
//! use tessera::active_messaging::RemoteFn;
//! use tessera::runtime::Runtime;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Scale {
//!     value: i64,
//!     by: i64,
//! }
//!
//! impl RemoteFn for Scale {
//!     type Output = i64;
//!     const NAME: &'static str = concat!(module_path!(), "::Scale");
//!     fn call(self, _rt: &Runtime) -> i64 {
//!         self.value * self.by
//!     }
//! }
//! tessera::register_remote_fn!(Scale);
//!
//! let rts = Runtime::cluster(2);
//! let fut = rts[0].rpc(1, Scale { value: 6, by: 7 });
//! // drive both ranks until the reply lands
//! loop {
//!     for rt in &rts {
//!         rt.progress(tessera::persona::ProgressLevel::User);
//!     }
//!     if fut.ready() {
//!         break;
//!     }
//! }
//! assert_eq!(fut.result(), 42);
//! ```

#[macro_use]
extern crate lazy_static;

#[doc(hidden)]
pub extern crate serde;

#[doc(hidden)]
pub use inventory;

#[doc(hidden)]
pub use memoffset;

pub mod active_messaging;
mod allocate;
pub mod completion;
mod copy;
pub mod device;
pub mod diagnostic;
pub mod env_var;
pub mod error;
pub mod fabric;
pub mod future;
pub mod global_ptr;
pub mod memberof;
pub mod memory_kind;
pub mod persona;
pub mod rma;
pub mod runtime;
mod segment;
pub mod serialize;

pub use env_var::config;

pub mod prelude {
    pub use crate::active_messaging::{RemoteAm, RemoteFn};
    pub use crate::completion::{Completions, CxHandles, CxSink};
    pub use crate::device::{DeviceApi, EmulatedDevice};
    pub use crate::error::{BadGlobalPtr, BadSegmentAlloc, BadSharedAlloc};
    pub use crate::future::{make_future, when_all_iter, Future, Promise};
    pub use crate::global_ptr::GlobalPtr;
    pub use crate::memory_kind::{AnyKind, Cuda, Host, KindSet, MemoryKind};
    pub use crate::persona::{current_persona, Persona, PersonaScope, ProgressLevel};
    pub use crate::rma::GetHandles;
    pub use crate::runtime::{Runtime, RuntimeBuilder};
    pub use crate::serialize::{Dist, View};
    pub use crate::{memberof, memberof_general, register_remote_fn, when_all};
}
