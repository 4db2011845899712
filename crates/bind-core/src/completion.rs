//! Single-shot completions and per-call options.
//!
//! `Completion<T>` is the future handed back by operations whose outcome is
//! only known once the remote store answers (fetches, initial sync). The
//! `Resolver` side may be cloned into several callbacks; the first one to
//! resolve wins.

use crate::error::{BindError, Result};
use futures::FutureExt;
use futures::channel::oneshot;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Future resolving to the outcome of a remote round-trip.
///
/// Resolves to `BindError::Cancelled` if every resolver is dropped unresolved.
#[must_use = "a Completion does nothing unless awaited; the operation itself is already issued"]
pub struct Completion<T> {
    state: State<T>,
}

enum State<T> {
    Ready(Option<Result<T>>),
    Pending(oneshot::Receiver<Result<T>>),
}

impl<T> Completion<T> {
    /// A completion that is already resolved.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            state: State::Ready(Some(result)),
        }
    }
}

// No structural pinning: the payload is moved out, never pinned.
impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            State::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(BindError::Cancelled))),
            State::Pending(rx) => rx
                .poll_unpin(cx)
                .map(|received| received.unwrap_or(Err(BindError::Cancelled))),
        }
    }
}

/// Sending half of a `Completion`.
pub struct Resolver<T> {
    tx: Rc<RefCell<Option<oneshot::Sender<Result<T>>>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Rc::clone(&self.tx),
        }
    }
}

impl<T> Resolver<T> {
    /// Resolve the paired completion. Later calls are ignored.
    pub fn resolve(&self, result: Result<T>) {
        if let Some(tx) = self.tx.borrow_mut().take() {
            // Receiver dropped means nobody is waiting.
            let _ = tx.send(result);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_none()
    }
}

/// Create a linked resolver/completion pair.
pub fn channel<T>() -> (Resolver<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Resolver {
            tx: Rc::new(RefCell::new(Some(tx))),
        },
        Completion {
            state: State::Pending(rx),
        },
    )
}

type GateWaiter = Box<dyn FnOnce(Result<()>)>;

/// Resolution of an initial sync, shared by everyone waiting on it.
///
/// Opens once; later `open` calls are ignored. Waiters registered after it
/// opened run immediately.
#[derive(Default)]
pub(crate) struct SyncGate {
    outcome: RefCell<Option<Result<()>>>,
    waiters: RefCell<Vec<GateWaiter>>,
}

impl SyncGate {
    pub(crate) fn is_open(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Returns true if this call opened the gate.
    pub(crate) fn open(&self, outcome: Result<()>) -> bool {
        if self.is_open() {
            return false;
        }
        *self.outcome.borrow_mut() = Some(outcome.clone());
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waiter in waiters {
            waiter(outcome.clone());
        }
        true
    }

    pub(crate) fn on_open(&self, waiter: impl FnOnce(Result<()>) + 'static) {
        let outcome = self.outcome.borrow().clone();
        match outcome {
            Some(outcome) => waiter(outcome),
            None => self.waiters.borrow_mut().push(Box::new(waiter)),
        }
    }
}

pub type SuccessCallback = Rc<dyn Fn(&Value)>;
pub type FailureCallback = Rc<dyn Fn(&Value, &BindError)>;

/// Per-call options for writes, fetches and structural edits.
#[derive(Clone, Default)]
pub struct Options {
    /// Suppress the local signal this call would normally emit.
    pub silent: bool,
    /// Accepted for API parity; remote writes are always asynchronous.
    pub wait: bool,
    /// `fetch` replaces the collection instead of merging into it.
    pub reset: bool,
    success: Option<SuccessCallback>,
    error: Option<FailureCallback>,
    /// Bookkeeping run ahead of the caller's callbacks.
    after_success: Option<SuccessCallback>,
    after_error: Option<Rc<dyn Fn(&BindError)>>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn wait(mut self) -> Self {
        self.wait = true;
        self
    }

    pub fn reset(mut self) -> Self {
        self.reset = true;
        self
    }

    /// Called with the written (or read) item once the remote acknowledges.
    pub fn on_success(mut self, callback: impl Fn(&Value) + 'static) -> Self {
        self.success = Some(Rc::new(callback));
        self
    }

    /// Called with the item and the failure when the remote rejects the call.
    pub fn on_error(mut self, callback: impl Fn(&Value, &BindError) + 'static) -> Self {
        self.error = Some(Rc::new(callback));
        self
    }

    pub fn has_error_handler(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn after_success(mut self, hook: impl Fn(&Value) + 'static) -> Self {
        self.after_success = Some(Rc::new(hook));
        self
    }

    /// Does not count as an error callback for `notify_error`.
    pub(crate) fn after_error(mut self, hook: impl Fn(&BindError) + 'static) -> Self {
        self.after_error = Some(Rc::new(hook));
        self
    }

    pub(crate) fn notify_success(&self, item: &Value) {
        if let Some(hook) = &self.after_success {
            hook(item);
        }
        if let Some(success) = &self.success {
            success(item);
        }
    }

    /// Returns false when no error callback was attached.
    pub(crate) fn notify_error(&self, item: &Value, err: &BindError) -> bool {
        if let Some(hook) = &self.after_error {
            hook(err);
        }
        match &self.error {
            Some(error) => {
                error(item, err);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("silent", &self.silent)
            .field("wait", &self.wait)
            .field("reset", &self.reset)
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_resolver_first_wins() {
        let (resolver, completion) = channel::<u32>();
        let other = resolver.clone();
        resolver.resolve(Ok(1));
        other.resolve(Ok(2));
        assert!(other.is_resolved());
        assert_eq!(completion.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_resolver_cancels() {
        let (resolver, completion) = channel::<()>();
        drop(resolver);
        assert!(matches!(completion.await, Err(BindError::Cancelled)));
    }

    #[tokio::test]
    async fn test_ready_completion() {
        let err = BindError::Remote(RemoteError::Other("boom".into()));
        let result = Completion::<()>::ready(Err(err.clone())).await;
        assert_eq!(result.unwrap_err(), err);
    }

    #[tokio::test]
    async fn test_sync_gate_resolves_early_and_late_waiters() {
        let gate = SyncGate::default();
        let wait = |gate: &SyncGate| {
            let (resolver, completion) = channel();
            gate.on_open(move |outcome| resolver.resolve(outcome));
            completion
        };
        let early = wait(&gate);
        assert!(!gate.is_open());

        assert!(gate.open(Ok(())));
        assert!(!gate.open(Err(BindError::Cancelled)));

        early.await.unwrap();
        wait(&gate).await.unwrap();
    }

    #[test]
    fn test_options_callbacks() {
        let hits = Rc::new(Cell::new(0));
        let hits_success = Rc::clone(&hits);
        let options = Options::new().on_success(move |_| hits_success.set(hits_success.get() + 1));

        options.notify_success(&Value::Null);
        assert_eq!(hits.get(), 1);
        assert!(!options.has_error_handler());
        assert!(!options.notify_error(&Value::Null, &BindError::Cancelled));
    }
}
