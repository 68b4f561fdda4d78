//! Completion sets.
//!
//! Every RPC, RMA, and copy accepts a [`Completions`] describing which
//! of the three per-operation events deliver into which sinks. Events
//! for one operation always fire in the order source → operation →
//! remote; the handles returned to the initiator expose one future per
//! event bound to a future sink.

use crate::active_messaging::RemoteAm;
use crate::future::{Future, Promise};

/// Where a completion event is delivered on the initiator.
pub enum CxSink {
    /// Drop the event.
    Skip,
    /// Mint a new future, returned through [`CxHandles`].
    AsFuture,
    /// Discharge one anonymous requirement of an existing promise.
    ToPromise(Promise<()>),
}

/// The completion set of one operation.
pub struct Completions {
    pub source: CxSink,
    pub operation: CxSink,
    /// Runs on the target rank after the operation's data is visible
    /// there.
    pub remote: Option<RemoteAm>,
}

impl Completions {
    /// The default set: operation completion as a future.
    pub fn operation_future() -> Completions {
        Completions {
            source: CxSink::Skip,
            operation: CxSink::AsFuture,
            remote: None,
        }
    }

    /// The empty set: every event is dropped. A starting point for
    /// operations that carry their payload in a dedicated future and
    /// only route events explicitly bound here.
    pub fn none() -> Completions {
        Completions {
            source: CxSink::Skip,
            operation: CxSink::Skip,
            remote: None,
        }
    }

    pub fn source_as_future(mut self) -> Completions {
        self.source = CxSink::AsFuture;
        self
    }

    pub fn source_to_promise(mut self, p: &Promise<()>) -> Completions {
        p.require_anonymous(1);
        self.source = CxSink::ToPromise(p.clone());
        self
    }

    pub fn operation_to_promise(mut self, p: &Promise<()>) -> Completions {
        p.require_anonymous(1);
        self.operation = CxSink::ToPromise(p.clone());
        self
    }

    pub fn skip_operation(mut self) -> Completions {
        self.operation = CxSink::Skip;
        self
    }

    pub fn remote_am(mut self, am: RemoteAm) -> Completions {
        self.remote = Some(am);
        self
    }
}

impl Default for Completions {
    fn default() -> Self {
        Completions::operation_future()
    }
}

/// Futures minted for the events bound to [`CxSink::AsFuture`], in event
/// order.
#[derive(Debug, Default)]
pub struct CxHandles {
    pub source: Option<Future<()>>,
    pub operation: Option<Future<()>>,
}

impl CxHandles {
    /// The operation future; fatal when the operation event was not
    /// bound to a future sink.
    pub fn operation(self) -> Future<()> {
        match self.operation {
            Some(f) => f,
            None => crate::misuse!("operation completion was not requested as a future"),
        }
    }
}

enum ResolvedSink {
    Skip,
    /// A future minted for this event; install its (unit) result.
    Fulfill(Promise<()>),
    /// A user promise that took one anonymous requirement for this event.
    Anonymous(Promise<()>),
}

/// Initiator-side completion state: resolved sinks for the source and
/// operation events, plus the packed remote AM to ship with the
/// operation.
pub(crate) struct CxState {
    source: Option<ResolvedSink>,
    operation: Option<ResolvedSink>,
    pub(crate) remote: Option<RemoteAm>,
}

impl CxState {
    pub(crate) fn new(cxs: Completions) -> (CxState, CxHandles) {
        let mut handles = CxHandles::default();
        let resolve = |sink: CxSink, slot: &mut Option<Future<()>>| -> ResolvedSink {
            match sink {
                CxSink::Skip => ResolvedSink::Skip,
                CxSink::ToPromise(p) => ResolvedSink::Anonymous(p),
                CxSink::AsFuture => {
                    let p = Promise::new();
                    *slot = Some(p.get_future());
                    ResolvedSink::Fulfill(p)
                }
            }
        };
        let source = resolve(cxs.source, &mut handles.source);
        let operation = resolve(cxs.operation, &mut handles.operation);
        (
            CxState {
                source: Some(source),
                operation: Some(operation),
                remote: cxs.remote,
            },
            handles,
        )
    }

    /// Signal the source event; at most once per operation.
    pub(crate) fn signal_source(&mut self) {
        if let Some(sink) = self.source.take() {
            fire(sink);
        }
    }

    /// Signal the operation event. The source event, if still pending,
    /// fires first to preserve event order.
    pub(crate) fn signal_operation(&mut self) {
        self.signal_source();
        if let Some(sink) = self.operation.take() {
            fire(sink);
        }
    }
}

fn fire(sink: ResolvedSink) {
    match sink {
        ResolvedSink::Skip => {}
        ResolvedSink::Fulfill(p) => p.fulfill_result(()),
        ResolvedSink::Anonymous(p) => p.fulfill_anonymous(1),
    }
}
