//! Composable one-shot asynchronous values.
//!
//! A [`Future`] references a shared header that is either pending (a
//! dependency count plus a chain of continuations) or holds the result.
//! Readiness transitions exactly once. Continuations installed with
//! [`Future::then`] are delivered through the fulfilling thread's
//! current persona at user-level progress, so they run only at
//! well-defined progress points; [`Future::then_lazy`] short-circuits
//! when the value is already available. [`Promise`] is the producer
//! side, with an explicit anonymous dependency count on top of the
//! result installation.

use std::sync::Arc;
use std::task::{Poll, Waker};
use std::time::Instant;

use parking_lot::Mutex;

use crate::env_var::config;
use crate::persona::{current_persona, ProgressLevel};

type Cont<T> = Box<dyn FnOnce(T) + Send + 'static>;
type ProgressHook = Box<dyn Fn() + Send + Sync + 'static>;

struct Inner<T> {
    result: Option<T>,
    // outstanding requirements: starts at 1 for the result installation,
    // require_anonymous adds more
    deps: usize,
    ready: bool,
    conts: Vec<Cont<T>>,
    wakers: Vec<Waker>,
    // diagnostic: persona that performed the first fulfillment
    fulfill_persona: Option<u64>,
}

pub(crate) struct Header<T> {
    st: Mutex<Inner<T>>,
    // lets wait() drive the runtime that will deliver this future's
    // completion; futures detached from a runtime progress the current
    // persona instead
    progress_hook: Mutex<Option<Arc<ProgressHook>>>,
}

/// A one-shot asynchronous value. Clones share the same header; multiple
/// observers are supported.
pub struct Future<T> {
    hdr: Arc<Header<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            hdr: self.hdr.clone(),
        }
    }
}

/// The producer side of a future, with an explicit dependency count.
pub struct Promise<T> {
    hdr: Arc<Header<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            hdr: self.hdr.clone(),
        }
    }
}

fn new_header<T>() -> Arc<Header<T>> {
    Arc::new(Header {
        st: Mutex::new(Inner {
            result: None,
            deps: 1,
            ready: false,
            conts: Vec::new(),
            wakers: Vec::new(),
            fulfill_persona: None,
        }),
        progress_hook: Mutex::new(None),
    })
}

/// An immediately ready future holding `value`.
pub fn make_future<T: Clone + Send + 'static>(value: T) -> Future<T> {
    let hdr = new_header();
    {
        let mut st = hdr.st.lock();
        st.result = Some(value);
        st.deps = 0;
        st.ready = true;
    }
    Future { hdr }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Promise<T> {
        Promise { hdr: new_header() }
    }

    pub fn get_future(&self) -> Future<T> {
        Future {
            hdr: self.hdr.clone(),
        }
    }

    /// Add `k` anonymous requirements that must be discharged before the
    /// future becomes ready.
    pub fn require_anonymous(&self, k: usize) {
        let mut st = self.hdr.st.lock();
        if st.ready {
            crate::misuse!("require_anonymous on an already fulfilled promise");
        }
        st.deps += k;
    }

    /// Discharge `k` anonymous requirements.
    pub fn fulfill_anonymous(&self, k: usize) {
        self.note_fulfill_persona();
        let conts = {
            let mut st = self.hdr.st.lock();
            if st.deps < k {
                crate::misuse!(
                    "fulfill_anonymous({}) exceeds the {} outstanding requirements",
                    k,
                    st.deps
                );
            }
            st.deps -= k;
            try_ready(&mut st)
        };
        deliver(&self.hdr, conts);
    }

    /// Install the result. Counts as one anonymous fulfillment.
    pub fn fulfill_result(&self, value: T) {
        self.note_fulfill_persona();
        let conts = {
            let mut st = self.hdr.st.lock();
            if st.result.is_some() {
                crate::misuse!("fulfill_result on an already fulfilled promise");
            }
            st.result = Some(value);
            if st.deps == 0 {
                crate::misuse!("fulfill_result without an outstanding requirement");
            }
            st.deps -= 1;
            try_ready(&mut st)
        };
        deliver(&self.hdr, conts);
    }

    // A promise must not fan its readiness out through more than one
    // persona; flag the violation rather than corrupting queues.
    fn note_fulfill_persona(&self) {
        if cfg!(debug_assertions) {
            let cur = current_persona().id();
            let mut st = self.hdr.st.lock();
            match st.fulfill_persona {
                None => st.fulfill_persona = Some(cur),
                Some(prev) if prev != cur && !st.ready => {
                    tracing::warn!(
                        "promise fulfilled from persona {} after persona {}; \
                         a promise may be enqueued into only one persona",
                        cur,
                        prev
                    );
                }
                _ => {}
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

/// If all requirements are discharged and the result installed, mark
/// ready and hand back the continuation chain for delivery.
fn try_ready<T>(st: &mut Inner<T>) -> Vec<Cont<T>> {
    if !st.ready && st.deps == 0 && st.result.is_some() {
        st.ready = true;
        for w in st.wakers.drain(..) {
            w.wake();
        }
        std::mem::take(&mut st.conts)
    } else {
        Vec::new()
    }
}

/// Push each continuation into the current persona's user-level queue.
/// The future is ready strictly before any of them runs.
fn deliver<T: Clone + Send + 'static>(hdr: &Arc<Header<T>>, conts: Vec<Cont<T>>) {
    if conts.is_empty() {
        return;
    }
    let persona = current_persona();
    for cont in conts {
        let hdr = hdr.clone();
        persona.push_lpc(
            ProgressLevel::User,
            Box::new(move || {
                let value = hdr
                    .st
                    .lock()
                    .result
                    .clone()
                    .expect("continuation delivered before readiness");
                cont(value);
            }),
        );
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Whether the result is available.
    pub fn ready(&self) -> bool {
        self.hdr.st.lock().ready
    }

    /// The result of a ready future. Panics when pending.
    pub fn result(&self) -> T {
        let st = self.hdr.st.lock();
        if !st.ready {
            crate::misuse!("result() on a pending future");
        }
        st.result.clone().expect("ready future holds a result")
    }

    /// Block until ready, cooperatively progressing: the submitting
    /// runtime when one is attached, otherwise the current persona's
    /// queues. The only blocking primitive in the core.
    pub fn wait(&self) -> T {
        let hook = self.hdr.progress_hook.lock().clone();
        let start = Instant::now();
        let mut warned = false;
        loop {
            if let Some(v) = {
                let st = self.hdr.st.lock();
                if st.ready {
                    Some(st.result.clone().expect("ready future holds a result"))
                } else {
                    None
                }
            } {
                return v;
            }
            match &hook {
                Some(hook) => hook(),
                None => {
                    current_persona().progress(ProgressLevel::User);
                }
            }
            if !warned && start.elapsed().as_secs_f64() > config().deadlock_timeout {
                warned = true;
                tracing::warn!(
                    "wait() has made no progress for {:.0}s; possible deadlock",
                    config().deadlock_timeout
                );
            }
        }
    }

    /// Chain a continuation. If the future is already ready the
    /// continuation is still deferred through the current persona at
    /// user level; otherwise it runs after readiness arrives.
    pub fn then<U, F>(&self, f: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let p = Promise::<U>::new();
        let p2 = p.clone();
        let mut pending: Option<Cont<T>> = Some(Box::new(move |v| p2.fulfill_result(f(v))));
        {
            let mut st = self.hdr.st.lock();
            if !st.ready {
                st.conts.push(pending.take().expect("unconsumed continuation"));
            }
        }
        if let Some(cont) = pending {
            deliver(&self.hdr, vec![cont]);
        }
        let fut = p.get_future();
        // inherit the progress driver so wait() on the derived future
        // still advances the producer
        let hook = self.hdr.progress_hook.lock().clone();
        *fut.hdr.progress_hook.lock() = hook;
        fut
    }

    /// Like [`Future::then`], but when the future is already ready the
    /// continuation runs immediately and no intermediate promise is
    /// allocated.
    pub fn then_lazy<U, F>(&self, f: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let ready_value = {
            let st = self.hdr.st.lock();
            if st.ready {
                Some(st.result.clone().expect("ready future holds a result"))
            } else {
                None
            }
        };
        match ready_value {
            Some(v) => make_future(f(v)),
            None => self.then(f),
        }
    }

    pub(crate) fn set_progress_hook(&self, hook: ProgressHook) {
        *self.hdr.progress_hook.lock() = Some(Arc::new(hook));
    }
}

impl<T: Clone + Send + 'static> std::future::Future for Future<T> {
    type Output = T;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Self::Output> {
        let mut st = self.hdr.st.lock();
        if st.ready {
            Poll::Ready(st.result.clone().expect("ready future holds a result"))
        } else {
            st.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.hdr.st.lock().ready)
            .finish()
    }
}

/// Conjunction of input futures: ready when all are, with the results
/// gathered in argument order. The empty form is immediately ready.
#[macro_export]
macro_rules! when_all {
    () => {
        $crate::future::make_future(())
    };
    ($f0:expr $(, $f:expr)* $(,)?) => {
        $crate::future::when_all_tuple(($f0.clone(), $($f.clone(),)*))
    };
}

/// Tuple-of-futures join, implemented for small arities. Prefer the
/// [`when_all!`] macro at call sites.
pub fn when_all_tuple<W: WhenAll>(futures: W) -> Future<W::Values> {
    futures.join()
}

pub trait WhenAll {
    type Values: Clone + Send + 'static;
    fn join(self) -> Future<Self::Values>;
}

macro_rules! impl_when_all {
    ($(($($t:ident . $idx:tt),+ ; $n:expr))*) => {$(
        impl<$($t: Clone + Send + 'static),+> WhenAll for ($(Future<$t>,)+) {
            type Values = ($($t,)+);

            fn join(self) -> Future<Self::Values> {
                let p = Promise::<Self::Values>::new();
                let slots = Arc::new(Mutex::new((0usize, ($(Option::<$t>::None,)+))));
                // runs once, when the last input lands
                let finish: Arc<dyn Fn() + Send + Sync> = {
                    let slots = slots.clone();
                    let p = p.clone();
                    Arc::new(move || {
                        let vals = {
                            let mut s = slots.lock();
                            ($(s.1 .$idx.take().expect("slot filled"),)+)
                        };
                        p.fulfill_result(vals);
                    })
                };
                $(
                    {
                        let slots = slots.clone();
                        let finish = finish.clone();
                        let mut pending: Option<Cont<$t>> = Some(Box::new(move |v| {
                            let full = {
                                let mut s = slots.lock();
                                s.1 .$idx = Some(v);
                                s.0 += 1;
                                s.0 == $n
                            };
                            if full {
                                finish();
                            }
                        }));
                        let src = &self.$idx;
                        {
                            let mut st = src.hdr.st.lock();
                            if !st.ready {
                                st.conts.push(pending.take().expect("unconsumed continuation"));
                            }
                        }
                        if let Some(cont) = pending {
                            deliver(&src.hdr, vec![cont]);
                        }
                    }
                )+
                let fut = p.get_future();
                $(
                    if fut.hdr.progress_hook.lock().is_none() {
                        let src_hook = self.$idx.hdr.progress_hook.lock().clone();
                        if src_hook.is_some() {
                            *fut.hdr.progress_hook.lock() = src_hook;
                        }
                    }
                )+
                fut
            }
        }
    )*};
}

impl_when_all! {
    (A.0; 1)
    (A.0, B.1; 2)
    (A.0, B.1, C.2; 3)
    (A.0, B.1, C.2, D.3; 4)
    (A.0, B.1, C.2, D.3, E.4; 5)
}

/// Join a homogeneous collection: ready when every input is, results in
/// input order.
pub fn when_all_iter<T, I>(futures: I) -> Future<Vec<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Future<T>>,
{
    let futures: Vec<Future<T>> = futures.into_iter().collect();
    let n = futures.len();
    if n == 0 {
        return make_future(Vec::new());
    }
    let p = Promise::<Vec<T>>::new();
    let slots: Arc<Mutex<(usize, Vec<Option<T>>)>> = Arc::new(Mutex::new((0, vec![None; n])));
    for (i, f) in futures.iter().enumerate() {
        let p = p.clone();
        let slots = slots.clone();
        let install: Cont<T> = Box::new(move |v| {
            let full = {
                let mut s = slots.lock();
                s.1[i] = Some(v);
                s.0 += 1;
                s.0 == n
            };
            if full {
                let vals = {
                    let mut s = slots.lock();
                    s.1.iter_mut()
                        .map(|slot| slot.take().expect("slot filled"))
                        .collect::<Vec<T>>()
                };
                p.fulfill_result(vals);
            }
        });
        let mut pending = Some(install);
        let immediate_value = {
            let mut st = f.hdr.st.lock();
            if st.ready {
                st.result.clone()
            } else {
                st.conts.push(pending.take().expect("unconsumed continuation"));
                None
            }
        };
        if let Some(v) = immediate_value {
            // already-ready inputs still defer through the persona
            let install = pending.take().expect("unconsumed continuation");
            current_persona().push_lpc(ProgressLevel::User, Box::new(move || install(v)));
        }
    }
    let fut = p.get_future();
    for f in &futures {
        let hook = f.hdr.progress_hook.lock().clone();
        if hook.is_some() {
            *fut.hdr.progress_hook.lock() = hook;
            break;
        }
    }
    fut
}
