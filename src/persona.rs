//! Personas: thread-affine owners of completion queues.
//!
//! A persona is the logical agent on whose behalf asynchronous work
//! completes. It owns a queue of outstanding network-handle callbacks
//! and one deferred-closure (lpc) queue per progress level. At any
//! moment a persona is active on at most one thread; each thread keeps a
//! stack of active personas and the top is the *current* persona. Every
//! thread also owns a default persona that stands in when the stack is
//! empty, and each runtime owns a master persona that receives inbound
//! active messages.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// The two tiers of deferred work. `Internal` closures are run by any
/// progress cycle; `User` closures (continuations, RPC bodies) run only
/// from explicit user-level progress.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressLevel {
    Internal,
    User,
}

pub(crate) type Lpc = Box<dyn FnOnce() + Send + 'static>;

/// A completion callback bound to a pollable operation handle. Progress
/// polls the handle; once done the callback is executed exactly once and
/// dropped.
pub(crate) struct HandleCb {
    pub(crate) done: Box<dyn Fn() -> bool + Send + 'static>,
    pub(crate) run: Lpc,
}

static NEXT_PERSONA_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    // Process-wide directory so inbound replies can find their target
    // persona by id.
    static ref PERSONAS: Mutex<std::collections::HashMap<u64, Weak<PersonaState>>> =
        Mutex::new(std::collections::HashMap::new());
}

pub(crate) struct PersonaState {
    pub(crate) id: u64,
    lpc_internal: Mutex<VecDeque<Lpc>>,
    lpc_user: Mutex<VecDeque<Lpc>>,
    handle_cbs: Mutex<VecDeque<HandleCb>>,
    active: AtomicBool,
    // master-persona binding: Some(thread) until liberated
    bound_thread: Mutex<Option<ThreadId>>,
    liberated: AtomicBool,
}

impl std::fmt::Debug for PersonaState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Persona").field("id", &self.id).finish()
    }
}

/// Clonable handle to a persona.
#[derive(Clone, Debug)]
pub struct Persona {
    pub(crate) state: Arc<PersonaState>,
}

impl Persona {
    pub fn new() -> Persona {
        let state = Arc::new(PersonaState {
            id: NEXT_PERSONA_ID.fetch_add(1, Ordering::Relaxed),
            lpc_internal: Mutex::new(VecDeque::new()),
            lpc_user: Mutex::new(VecDeque::new()),
            handle_cbs: Mutex::new(VecDeque::new()),
            active: AtomicBool::new(false),
            bound_thread: Mutex::new(None),
            liberated: AtomicBool::new(true),
        });
        PERSONAS.lock().insert(state.id, Arc::downgrade(&state));
        Persona { state }
    }

    /// A master persona starts bound to its creating thread; only that
    /// thread may activate it until it is liberated.
    pub(crate) fn new_master() -> Persona {
        let p = Persona::new();
        *p.state.bound_thread.lock() = Some(std::thread::current().id());
        p.state.liberated.store(false, Ordering::Release);
        p
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Whether this persona is currently active on some thread.
    pub fn active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    /// Mark a master persona eligible for acquisition by other threads.
    pub(crate) fn liberate(&self) {
        self.state.liberated.store(true, Ordering::Release);
    }

    pub(crate) fn lookup(id: u64) -> Option<Persona> {
        PERSONAS
            .lock()
            .get(&id)
            .and_then(|w| w.upgrade())
            .map(|state| Persona { state })
    }

    pub(crate) fn push_lpc(&self, level: ProgressLevel, lpc: Lpc) {
        match level {
            ProgressLevel::Internal => self.state.lpc_internal.lock().push_back(lpc),
            ProgressLevel::User => self.state.lpc_user.lock().push_back(lpc),
        }
    }

    pub(crate) fn push_handle_cb(&self, cb: HandleCb) {
        self.state.handle_cbs.lock().push_back(cb);
    }

    /// Poll outstanding handles, running callbacks whose operation has
    /// completed. Returns true if any callback ran.
    pub(crate) fn poll_handles(&self) -> bool {
        let mut fired = Vec::new();
        {
            let mut cbs = self.state.handle_cbs.lock();
            let mut i = 0;
            while i < cbs.len() {
                if (cbs[i].done)() {
                    fired.push(cbs.remove(i).expect("index in range"));
                } else {
                    i += 1;
                }
            }
        }
        let any = !fired.is_empty();
        for cb in fired {
            (cb.run)();
        }
        any
    }

    /// Drain one lpc queue FIFO, including work enqueued by the drained
    /// closures themselves. Returns true if any closure ran.
    pub(crate) fn drain(&self, level: ProgressLevel) -> bool {
        let queue = match level {
            ProgressLevel::Internal => &self.state.lpc_internal,
            ProgressLevel::User => &self.state.lpc_user,
        };
        let mut any = false;
        loop {
            let lpc = queue.lock().pop_front();
            match lpc {
                Some(lpc) => {
                    any = true;
                    lpc();
                }
                None => break,
            }
        }
        any
    }

    pub(crate) fn has_work(&self, level: ProgressLevel) -> bool {
        let queued = match level {
            ProgressLevel::Internal => !self.state.lpc_internal.lock().is_empty(),
            ProgressLevel::User => !self.state.lpc_user.lock().is_empty(),
        };
        queued || !self.state.handle_cbs.lock().is_empty()
    }

    /// Progress this persona's own queues: poll outstanding handles,
    /// drain the internal queue, and at [`ProgressLevel::User`] the user
    /// queue as well. Network-attached work is driven through
    /// [`crate::runtime::Runtime::progress`]; this entry point serves
    /// personas used standalone. Returns true if any work ran.
    pub fn progress(&self, level: ProgressLevel) -> bool {
        let mut any = self.poll_handles();
        any |= self.drain(ProgressLevel::Internal);
        if level == ProgressLevel::User {
            any |= self.drain(ProgressLevel::User);
        }
        any
    }

    /// Whether either queue (or an outstanding handle) would make a
    /// progress call do work.
    pub fn progress_required(&self) -> bool {
        self.has_work(ProgressLevel::Internal) || self.has_work(ProgressLevel::User)
    }
}

impl Default for Persona {
    fn default() -> Self {
        Persona::new()
    }
}

thread_local! {
    static ACTIVE_STACK: RefCell<Vec<Persona>> = RefCell::new(Vec::new());
    static DEFAULT_PERSONA: Persona = Persona::new();
}

/// The current persona of the calling thread: the top of its active
/// stack, or the thread's default persona when the stack is empty.
pub fn current_persona() -> Persona {
    ACTIVE_STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .cloned()
            .unwrap_or_else(|| DEFAULT_PERSONA.with(|p| p.clone()))
    })
}

/// Scoped activation of a persona on the calling thread. On drop the
/// persona is popped and the previously current persona is restored.
pub struct PersonaScope<'a> {
    persona: Persona,
    _serializer: Option<MutexGuard<'a, ()>>,
}

impl<'a> PersonaScope<'a> {
    pub fn new(persona: &Persona) -> PersonaScope<'static> {
        PersonaScope::activate(persona, None)
    }

    /// Activate with a mutex serializing ownership transfer between
    /// threads: the guard is held for the lifetime of the scope.
    pub fn with_mutex(persona: &Persona, mutex: &'a Mutex<()>) -> PersonaScope<'a> {
        PersonaScope::activate(persona, Some(mutex.lock()))
    }

    fn activate(persona: &Persona, serializer: Option<MutexGuard<'a, ()>>) -> PersonaScope<'a> {
        {
            let bound = persona.state.bound_thread.lock();
            if let Some(owner) = *bound {
                if owner != std::thread::current().id()
                    && !persona.state.liberated.load(Ordering::Acquire)
                {
                    crate::misuse!(
                        "persona {} is bound to another thread and has not been liberated",
                        persona.state.id
                    );
                }
            }
        }
        if persona
            .state
            .active
            .swap(true, Ordering::AcqRel)
        {
            crate::misuse!(
                "persona {} is already active on a thread; a persona may be \
                 active on at most one thread at a time",
                persona.state.id
            );
        }
        ACTIVE_STACK.with(|stack| stack.borrow_mut().push(persona.clone()));
        PersonaScope {
            persona: persona.clone(),
            _serializer: serializer,
        }
    }
}

impl<'a> Drop for PersonaScope<'a> {
    fn drop(&mut self) {
        ACTIVE_STACK.with(|stack| {
            let top = stack.borrow_mut().pop();
            debug_assert!(
                top.map(|p| p.state.id) == Some(self.persona.state.id),
                "persona scopes must unwind in LIFO order"
            );
        });
        self.persona.state.active.store(false, Ordering::Release);
    }
}

impl Drop for PersonaState {
    fn drop(&mut self) {
        PERSONAS.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn scope_push_pop_restores_current() {
        let outer = current_persona();
        let p = Persona::new();
        {
            let _scope = PersonaScope::new(&p);
            assert_eq!(current_persona().id(), p.id());
            assert!(p.active());
        }
        assert!(!p.active());
        assert_eq!(current_persona().id(), outer.id());
    }

    #[test]
    fn lpc_fifo_and_levels() {
        let p = Persona::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            p.push_lpc(
                ProgressLevel::User,
                Box::new(move || order.lock().push(i)),
            );
        }
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        p.push_lpc(
            ProgressLevel::Internal,
            Box::new(move || {
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(p.has_work(ProgressLevel::User));
        p.drain(ProgressLevel::Internal);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        // user work untouched by internal drain
        assert_eq!(order.lock().len(), 0);
        p.drain(ProgressLevel::User);
        assert_eq!(&*order.lock(), &[0, 1, 2]);
    }

    #[test]
    fn handle_cbs_run_once_when_done() {
        let p = Persona::new();
        let flag = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicUsize::new(0));
        let flag2 = flag.clone();
        let ran2 = ran.clone();
        p.push_handle_cb(HandleCb {
            done: Box::new(move || flag2.load(Ordering::SeqCst)),
            run: Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }),
        });
        assert!(!p.poll_handles());
        flag.store(true, Ordering::SeqCst);
        assert!(p.poll_handles());
        assert!(!p.poll_handles());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
