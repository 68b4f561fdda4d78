//! Active messages and remote procedure calls.
//!
//! A remote callable is a plain serializable struct implementing
//! [`RemoteFn`]: its fields are the bound arguments and its `NAME` keys
//! a process-wide registry of monomorphized exec shims collected through
//! `inventory`. On the wire a call is `(Msg, name, args)`; small packed
//! commands travel eagerly inside the envelope, large ones by
//! rendezvous (the payload is staged in the sender's shared segment and
//! the receiver pulls it with a one-sided get before dispatch).
//!
//! Inbound commands are never executed during the network poll itself:
//! they are pushed onto the target persona's queue for the requested
//! progress level and run at the corresponding progress call.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::trace;

use crate::env_var::config;
use crate::fabric::{Envelope, FabricAm, FabricRdma};
use crate::future::{make_future, Future};
use crate::persona::{current_persona, HandleCb, Persona, ProgressLevel};
use crate::runtime::Runtime;
use crate::serialize::{deserialize, serialize};

/// Wire commands.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Cmd {
    /// Execute a packed callable; no reply.
    Exec,
    /// Execute a packed callable and reply with its serialized result.
    ExecReturn,
    /// Carry a call's serialized result back to the initiator.
    Reply,
    /// A large command was staged in the sender's segment; pull it.
    RendezvousNotice,
    /// Release a rendezvous staging allocation on the sender.
    StagingFree,
    /// Copy-engine choreography (see `copy.rs`).
    CopyProto,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub(crate) struct Msg {
    pub(crate) cmd: Cmd,
    pub(crate) src: u16,
    pub(crate) req_id: u64,
    /// Target persona id; 0 addresses the recipient's master persona.
    pub(crate) persona: u64,
    pub(crate) level: ProgressLevel,
}

/// A user-defined remote callable: the struct's fields are the bound
/// arguments, shipped by value and deserialized exactly once at the
/// recipient.
pub trait RemoteFn: Serialize + DeserializeOwned + Send + 'static {
    /// The result carried back by [`Runtime::rpc`]. Must be an owned,
    /// serializable value (no views, no borrowed buffers).
    type Output: Serialize + DeserializeOwned + Clone + Send + 'static;

    /// Process-unique registry key. Use
    /// `concat!(module_path!(), "::", stringify!(TypeName))`.
    const NAME: &'static str;

    fn call(self, rt: &Runtime) -> Self::Output;

    /// Execution as a future, for callables whose result is itself
    /// asynchronous. The default wraps the synchronous result.
    fn call_as_future(self, rt: &Runtime) -> Future<Self::Output>
    where
        Self: Sized,
    {
        make_future(self.call(rt))
    }
}

/// Reply plumbing handed to the exec shim for round-trip calls.
pub struct ReplyCtx {
    rt: Runtime,
    dst: usize,
    req_id: u64,
}

impl ReplyCtx {
    fn send(self, result: Vec<u8>) {
        let msg = Msg {
            cmd: Cmd::Reply,
            src: self.rt.rank_me() as u16,
            req_id: self.req_id,
            persona: 0,
            level: ProgressLevel::User,
        };
        self.rt.send_wire(self.dst, msg, result);
    }
}

#[doc(hidden)]
pub type ExecFn = fn(&Runtime, usize, &[u8], Option<ReplyCtx>) -> Result<(), anyhow::Error>;

/// One registry entry; submitted by [`crate::register_remote_fn!`].
pub struct RegisteredFn {
    pub name: &'static str,
    pub exec: ExecFn,
}

inventory::collect!(RegisteredFn);

lazy_static! {
    pub(crate) static ref REMOTE_FNS: BTreeMap<&'static str, ExecFn> = {
        let mut temp = BTreeMap::new();
        for entry in inventory::iter::<RegisteredFn> {
            trace!(fn_name = entry.name, "registered remote fn");
            temp.insert(entry.name, entry.exec);
        }
        temp
    };
}

/// Monomorphized unpack-and-execute shim for one callable type.
pub fn exec_shim<F: RemoteFn>(
    rt: &Runtime,
    _src: usize,
    args: &[u8],
    reply: Option<ReplyCtx>,
) -> Result<(), anyhow::Error> {
    let f: F = deserialize(args)?;
    match reply {
        None => {
            let _ = f.call(rt);
        }
        Some(ctx) => {
            // the callable runs as a future; the reply ships once it
            // is ready
            f.call_as_future(rt).then(move |out| {
                let bytes = serialize(&out).expect("rpc result serialize");
                ctx.send(bytes);
            });
        }
    }
    Ok(())
}

/// Register a [`RemoteFn`] implementation for remote dispatch.
#[macro_export]
macro_rules! register_remote_fn {
    ($t:ty) => {
        $crate::inventory::submit! {
            $crate::active_messaging::RegisteredFn {
                name: <$t as $crate::active_messaging::RemoteFn>::NAME,
                exec: $crate::active_messaging::exec_shim::<$t>,
            }
        }
    };
}

/// A packed, type-erased remote callable, shippable inside other
/// messages (remote completions, copy choreography).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RemoteAm {
    name: String,
    args: ByteBuf,
}

impl RemoteAm {
    pub fn new<F: RemoteFn>(f: &F) -> RemoteAm {
        RemoteAm {
            name: F::NAME.to_owned(),
            args: ByteBuf::from(serialize(f).expect("remote am serialize")),
        }
    }

    pub(crate) fn execute(self, rt: &Runtime, src: usize) {
        let exec = match REMOTE_FNS.get(self.name.as_str()) {
            Some(exec) => *exec,
            None => crate::misuse!(
                "remote fn '{}' is not registered on rank {}",
                self.name,
                rt.rank_me()
            ),
        };
        let args: std::sync::Arc<[u8]> = self.args.into_vec().into();
        let unpacked = crate::serialize::with_inbound(&args, || exec(rt, src, &args, None));
        if let Err(err) = unpacked {
            crate::fatal!("remote fn '{}' failed to unpack: {}", self.name, err);
        }
    }
}

pub(crate) struct PendingOp {
    pub(crate) persona: Persona,
    pub(crate) complete: Box<dyn FnOnce(Vec<u8>) + Send>,
}

impl Runtime {
    /// Ship `f` for execution on `rank`'s master persona at progress
    /// level `level`. Source completion is trivial.
    pub fn send_am_master<F>(&self, level: ProgressLevel, rank: usize, f: F)
    where
        F: RemoteFn<Output = ()>,
    {
        self.check_init("send_am_master");
        let args = serialize(&f).expect("am serialize");
        self.send_call(rank, 0, level, Cmd::Exec, 0, F::NAME, args);
    }

    /// Like [`Runtime::send_am_master`] but targeting a specific persona
    /// on the recipient, named by id.
    pub fn send_am_persona<F>(&self, level: ProgressLevel, rank: usize, persona: u64, f: F)
    where
        F: RemoteFn<Output = ()>,
    {
        self.check_init("send_am_persona");
        let args = serialize(&f).expect("am serialize");
        self.send_call(rank, persona, level, Cmd::Exec, 0, F::NAME, args);
    }

    pub(crate) fn send_am_packed(&self, level: ProgressLevel, rank: usize, am: RemoteAm) {
        let RemoteAm { name, args } = am;
        let msg = Msg {
            cmd: Cmd::Exec,
            src: self.rank_me() as u16,
            req_id: 0,
            persona: 0,
            level,
        };
        let body = serialize(&(name, args)).expect("am pack");
        self.send_wire(rank, msg, body);
    }

    /// Fire-and-forget remote invocation of `f` at `rank`, executed at
    /// user-level progress on the recipient's master persona. The
    /// returned future reflects source completion, which is trivial: it
    /// is ready on return.
    pub fn rpc_ff<F>(&self, rank: usize, f: F) -> Future<()>
    where
        F: RemoteFn<Output = ()>,
    {
        self.send_am_master(ProgressLevel::User, rank, f);
        make_future(())
    }

    /// Round-trip remote invocation: `f` runs at `rank` (as a future, at
    /// user-level progress on the master persona) and its result is
    /// delivered back into the returned future on this persona.
    pub fn rpc<F>(&self, rank: usize, f: F) -> Future<F::Output>
    where
        F: RemoteFn,
    {
        self.check_init("rpc");
        let req_id = self.next_op_id();
        let promise = crate::future::Promise::<F::Output>::new();
        let fut = promise.get_future();
        self.inner.pending.lock().insert(
            req_id,
            PendingOp {
                persona: current_persona(),
                complete: Box::new(move |bytes| {
                    let out: F::Output =
                        deserialize(&bytes).expect("rpc result deserialize");
                    promise.fulfill_result(out);
                }),
            },
        );
        let args = serialize(&f).expect("rpc serialize");
        self.send_call(rank, 0, ProgressLevel::User, Cmd::ExecReturn, req_id, F::NAME, args);
        let rt = self.clone();
        fut.set_progress_hook(Box::new(move || rt.progress(ProgressLevel::User)));
        fut
    }

    fn send_call(
        &self,
        rank: usize,
        persona: u64,
        level: ProgressLevel,
        cmd: Cmd,
        req_id: u64,
        name: &str,
        args: Vec<u8>,
    ) {
        if rank >= self.rank_n() {
            crate::misuse!("rank {} out of range for job of {} ranks", rank, self.rank_n());
        }
        let msg = Msg {
            cmd,
            src: self.rank_me() as u16,
            req_id,
            persona,
            level,
        };
        let body = serialize(&(name.to_owned(), ByteBuf::from(args))).expect("call pack");
        self.send_wire(rank, msg, body);
    }

    /// Eager-or-rendezvous shipment of one packed command.
    pub(crate) fn send_wire(&self, rank: usize, msg: Msg, body: Vec<u8>) {
        let wire = serialize(&(msg, ByteBuf::from(body))).expect("wire pack");
        if wire.len() <= config().eager_cutover {
            self.inner.fabric.send(
                rank,
                Envelope {
                    src: self.rank_me(),
                    buf: wire,
                },
            );
            return;
        }
        // rendezvous: stage in our shared segment, ship a notice, let
        // the receiver pull
        let addr = match self.allocate_bytes(wire.len(), 8) {
            Ok(addr) => addr,
            Err(err) => crate::fatal!("rendezvous staging failed: {}", err),
        };
        unsafe {
            std::ptr::copy_nonoverlapping(wire.as_ptr(), addr as *mut u8, wire.len());
        }
        let notice = Msg {
            cmd: Cmd::RendezvousNotice,
            src: self.rank_me() as u16,
            req_id: 0,
            persona: 0,
            level: ProgressLevel::Internal,
        };
        let notice_body = serialize(&(addr, wire.len())).expect("notice pack");
        let notice_wire =
            serialize(&(notice, ByteBuf::from(notice_body))).expect("notice wire pack");
        self.inner.fabric.send(
            rank,
            Envelope {
                src: self.rank_me(),
                buf: notice_wire,
            },
        );
    }

    /// Stage 1 of progress: pull every inbound envelope and route it to
    /// its target persona's queues.
    pub(crate) fn poll_network(&self) {
        while let Some(env) = self.inner.fabric.try_recv() {
            self.dispatch_wire(env.src, env.buf);
        }
    }

    pub(crate) fn dispatch_wire(&self, src: usize, buf: Vec<u8>) {
        let (msg, body): (Msg, ByteBuf) = match deserialize(&buf) {
            Ok(parts) => parts,
            Err(err) => crate::fatal!("malformed wire message from rank {}: {}", src, err),
        };
        let body = body.into_vec();
        match msg.cmd {
            Cmd::Exec | Cmd::ExecReturn => self.dispatch_call(src, msg, body),
            Cmd::Reply => {
                let pending = self.inner.pending.lock().remove(&msg.req_id);
                match pending {
                    Some(op) => {
                        let complete = op.complete;
                        op.persona
                            .push_lpc(ProgressLevel::User, Box::new(move || complete(body)));
                    }
                    None => crate::misuse!(
                        "reply for unknown request {} from rank {}",
                        msg.req_id,
                        src
                    ),
                }
            }
            Cmd::RendezvousNotice => {
                let (addr, len): (usize, usize) =
                    deserialize(&body).expect("rendezvous notice decode");
                let mut staged = vec![0u8; len];
                let handle = self.inner.fabric.get(src, addr, &mut staged);
                let rt = self.clone();
                current_persona().push_handle_cb(HandleCb {
                    done: Box::new(move || handle.done()),
                    run: Box::new(move || {
                        rt.dispatch_wire(src, staged);
                        let free = Msg {
                            cmd: Cmd::StagingFree,
                            src: rt.rank_me() as u16,
                            req_id: 0,
                            persona: 0,
                            level: ProgressLevel::Internal,
                        };
                        let free_body = serialize(&addr).expect("staging free pack");
                        rt.send_wire(src, free, free_body);
                    }),
                });
            }
            Cmd::StagingFree => {
                let addr: usize = deserialize(&body).expect("staging free decode");
                let rt = self.clone();
                self.inner.master.push_lpc(
                    ProgressLevel::Internal,
                    Box::new(move || rt.deallocate_bytes(addr)),
                );
            }
            Cmd::CopyProto => crate::copy::handle_copy_msg(self, src, msg, body),
        }
    }

    fn dispatch_call(&self, src: usize, msg: Msg, body: Vec<u8>) {
        let (name, args): (String, ByteBuf) = deserialize(&body).expect("call decode");
        let target = if msg.persona == 0 {
            self.inner.master.clone()
        } else {
            match Persona::lookup(msg.persona) {
                Some(p) => p,
                None => {
                    tracing::warn!(
                        persona = msg.persona,
                        "dropping message for dead persona"
                    );
                    return;
                }
            }
        };
        let rt = self.clone();
        let reply_needed = msg.cmd == Cmd::ExecReturn;
        // ref-counted so views unpacked from the arguments can keep the
        // buffer alive without copying
        let args: std::sync::Arc<[u8]> = args.into_vec().into();
        target.push_lpc(
            msg.level,
            Box::new(move || {
                let exec = match REMOTE_FNS.get(name.as_str()) {
                    Some(exec) => *exec,
                    None => crate::misuse!(
                        "remote fn '{}' is not registered on rank {}",
                        name,
                        rt.rank_me()
                    ),
                };
                let reply = if reply_needed {
                    Some(ReplyCtx {
                        rt: rt.clone(),
                        dst: src,
                        req_id: msg.req_id,
                    })
                } else {
                    None
                };
                let unpacked =
                    crate::serialize::with_inbound(&args, || exec(&rt, src, &args, reply));
                if let Err(err) = unpacked {
                    crate::fatal!("remote fn '{}' failed to unpack: {}", name, err);
                }
            }),
        );
    }
}
