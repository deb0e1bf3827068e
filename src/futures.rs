//! Command-bound futures. Every suspension point in workflow code awaits a
//! resolution cell keyed by command id; cells are resolved only by history
//! application, which keeps the interleaving replay-stable under stock
//! combinators (`join!`, `select`).

use crate::error::WorkflowError;
use crate::payload::{Converter, Payload, from_payload};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

/// Resolution slot for one command. Starts pending; history application
/// fills it exactly once.
#[derive(Debug, Default)]
pub(crate) struct FutureCell {
    resolution: Mutex<Option<Result<Payload, WorkflowError>>>,
}

impl FutureCell {
    pub(crate) fn pending() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn ready(result: Result<Payload, WorkflowError>) -> Arc<Self> {
        let cell = Self::default();
        *cell.resolution.lock().unwrap() = Some(result);
        Arc::new(cell)
    }

    pub(crate) fn resolve(&self, result: Result<Payload, WorkflowError>) {
        let mut slot = self.resolution.lock().unwrap();
        // First resolution wins; duplicates are protocol violations dropped
        // upstream.
        if slot.is_none() {
            *slot = Some(result);
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolution.lock().unwrap().is_some()
    }

    fn get(&self) -> Option<Result<Payload, WorkflowError>> {
        self.resolution.lock().unwrap().clone()
    }
}

/// Future for an activity, sub-workflow, or side-effect result, decoding
/// the payload into `T` on completion.
pub struct CommandFuture<T> {
    pub(crate) id: u64,
    pub(crate) cell: Arc<FutureCell>,
    pub(crate) converter: Arc<dyn Converter>,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

/// Awaits an activity result.
pub type ActivityFuture<T> = CommandFuture<T>;
/// Awaits a sub-workflow result; cancellable via
/// `WorkflowContext::cancel_sub_workflow`.
pub type SubWorkflowFuture<T> = CommandFuture<T>;

impl<T: DeserializeOwned> Future for CommandFuture<T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.cell.get() {
            Some(Ok(payload)) => Poll::Ready(from_payload(self.converter.as_ref(), &payload)),
            Some(Err(e)) => Poll::Ready(Err(e)),
            None => Poll::Pending,
        }
    }
}

/// Future for a timer; resolves with `Ok(())` when the timer fires and with
/// a canceled error when the timer is canceled.
pub struct TimerFuture {
    pub(crate) id: u64,
    pub(crate) cell: Arc<FutureCell>,
}

impl Future for TimerFuture {
    type Output = Result<(), WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.cell.get() {
            Some(Ok(_)) => Poll::Ready(Ok(())),
            Some(Err(e)) => Poll::Ready(Err(e)),
            None => Poll::Pending,
        }
    }
}

impl TimerFuture {
    /// Correlation id of the underlying timer command.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> CommandFuture<T> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Future for a signal payload. Signals carry no command id; delivery order
/// is the history order of `SignalReceived` events.
pub struct SignalFuture<T> {
    pub(crate) cell: Arc<FutureCell>,
    pub(crate) converter: Arc<dyn Converter>,
    pub(crate) _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Future for SignalFuture<T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.cell.get() {
            Some(Ok(payload)) => Poll::Ready(from_payload(self.converter.as_ref(), &payload)),
            Some(Err(e)) => Poll::Ready(Err(e)),
            None => Poll::Pending,
        }
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// Poll a future once with a no-op waker. The executor never parks; a
/// pending result means the workflow is suspended on unresolved cells.
pub(crate) fn poll_once<F: Future + ?Sized>(fut: &mut Pin<Box<F>>) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    fut.as_mut().poll(&mut cx)
}
