//! State cell messages
//!
//! Requests carried through a cell's mailbox, and the errors callers see.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use super::handle::{CellId, StateCell};

/// Errors from operations on a started cell
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    /// The wait expired. The request may still run later.
    #[error("Timed out after {0:?} waiting for the cell")]
    Timeout(Duration),

    #[error("Cell crashed: {reason}")]
    Crashed { reason: String },

    #[error("No such cell")]
    NoSuchCell,
}

/// Response from cell operations
pub type CellResult<T> = Result<T, CellError>;

/// Errors from starting a cell
#[derive(Error)]
pub enum StartError<S> {
    /// A live cell is already registered under the requested name
    #[error("Cell already started as {}", .0.id())]
    AlreadyStarted(StateCell<S>),

    /// The name belongs to a live cell holding a different state type
    #[error("Name {name:?} is held by cell {id} with a different state type")]
    NameInUse { name: String, id: CellId },

    #[error("Initializer did not finish within {0:?}")]
    Timeout(Duration),

    /// The initializer returned an error or panicked
    #[error("Initializer failed: {0}")]
    Initializer(eyre::Report),
}

impl<S> fmt::Debug for StartError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted(cell) => f.debug_tuple("AlreadyStarted").field(cell).finish(),
            Self::NameInUse { name, id } => f
                .debug_struct("NameInUse")
                .field("name", name)
                .field("id", id)
                .finish(),
            Self::Timeout(limit) => f.debug_tuple("Timeout").field(limit).finish(),
            Self::Initializer(report) => f.debug_tuple("Initializer").field(report).finish(),
        }
    }
}

/// A synchronous request whose fun and reply type have been erased
///
/// `apply` runs the fun against the state and answers the caller. A panic in
/// the fun is reported to that caller as [`CellError::Crashed`] and returned
/// as `Err(reason)`; the state is gone at that point.
pub(crate) trait Call<S>: Send {
    fn apply(self: Box<Self>, state: S) -> Result<S, String>;

    /// Answer the caller without running the fun
    fn reject(self: Box<Self>, error: CellError);
}

struct GetCall<F, R> {
    fun: F,
    reply: oneshot::Sender<CellResult<R>>,
}

impl<S, F, R> Call<S> for GetCall<F, R>
where
    F: FnOnce(&S) -> R + Send,
    R: Send,
{
    fn apply(self: Box<Self>, state: S) -> Result<S, String> {
        let GetCall { fun, reply } = *self;
        match catch_unwind(AssertUnwindSafe(|| fun(&state))) {
            Ok(value) => {
                let _ = reply.send(Ok(value));
                Ok(state)
            }
            Err(payload) => Err(crashed(reply, payload)),
        }
    }

    fn reject(self: Box<Self>, error: CellError) {
        let _ = self.reply.send(Err(error));
    }
}

struct GetAndUpdateCall<F, R> {
    fun: F,
    reply: oneshot::Sender<CellResult<R>>,
}

impl<S, F, R> Call<S> for GetAndUpdateCall<F, R>
where
    F: FnOnce(S) -> (R, S) + Send,
    R: Send,
{
    fn apply(self: Box<Self>, state: S) -> Result<S, String> {
        let GetAndUpdateCall { fun, reply } = *self;
        match catch_unwind(AssertUnwindSafe(move || fun(state))) {
            Ok((value, next)) => {
                let _ = reply.send(Ok(value));
                Ok(next)
            }
            Err(payload) => Err(crashed(reply, payload)),
        }
    }

    fn reject(self: Box<Self>, error: CellError) {
        let _ = self.reply.send(Err(error));
    }
}

struct UpdateCall<F> {
    fun: F,
    reply: oneshot::Sender<CellResult<()>>,
}

impl<S, F> Call<S> for UpdateCall<F>
where
    F: FnOnce(S) -> S + Send,
{
    fn apply(self: Box<Self>, state: S) -> Result<S, String> {
        let UpdateCall { fun, reply } = *self;
        match catch_unwind(AssertUnwindSafe(move || fun(state))) {
            Ok(next) => {
                let _ = reply.send(Ok(()));
                Ok(next)
            }
            Err(payload) => Err(crashed(reply, payload)),
        }
    }

    fn reject(self: Box<Self>, error: CellError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Tell the caller whose fun panicked, and hand the reason back to the loop
fn crashed<R>(reply: oneshot::Sender<CellResult<R>>, payload: Box<dyn Any + Send>) -> String {
    let reason = panic_reason(payload.as_ref());
    let _ = reply.send(Err(CellError::Crashed { reason: reason.clone() }));
    reason
}

/// Render a panic payload as text
pub(crate) fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// A cast fun
pub(crate) type CastFn<S> = Box<dyn FnOnce(S) -> S + Send>;

/// Requests sent to the cell's execution loop
pub(crate) enum Request<S> {
    Get(Box<dyn Call<S>>),
    GetAndUpdate(Box<dyn Call<S>>),
    Update(Box<dyn Call<S>>),
    Cast(CastFn<S>),
    Stop { reply: oneshot::Sender<CellResult<()>> },
}

impl<S> Request<S> {
    pub(crate) fn get<F, R>(fun: F) -> (Self, oneshot::Receiver<CellResult<R>>)
    where
        F: FnOnce(&S) -> R + Send + 'static,
        R: Send + 'static,
        S: 'static,
    {
        let (reply, rx) = oneshot::channel();
        (Self::Get(Box::new(GetCall { fun, reply })), rx)
    }

    pub(crate) fn get_and_update<F, R>(fun: F) -> (Self, oneshot::Receiver<CellResult<R>>)
    where
        F: FnOnce(S) -> (R, S) + Send + 'static,
        R: Send + 'static,
        S: 'static,
    {
        let (reply, rx) = oneshot::channel();
        (Self::GetAndUpdate(Box::new(GetAndUpdateCall { fun, reply })), rx)
    }

    pub(crate) fn update<F>(fun: F) -> (Self, oneshot::Receiver<CellResult<()>>)
    where
        F: FnOnce(S) -> S + Send + 'static,
        S: 'static,
    {
        let (reply, rx) = oneshot::channel();
        (Self::Update(Box::new(UpdateCall { fun, reply })), rx)
    }

    pub(crate) fn stop() -> (Self, oneshot::Receiver<CellResult<()>>) {
        let (reply, rx) = oneshot::channel();
        (Self::Stop { reply }, rx)
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Get(_) => "get",
            Self::GetAndUpdate(_) => "get_and_update",
            Self::Update(_) => "update",
            Self::Cast(_) => "cast",
            Self::Stop { .. } => "stop",
        }
    }

    /// Fail the request without running it. Casts are dropped silently.
    pub(crate) fn reject(self, error: CellError) {
        match self {
            Self::Get(call) | Self::GetAndUpdate(call) | Self::Update(call) => call.reject(error),
            Self::Cast(_) => {}
            Self::Stop { reply } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply<S>(request: Request<S>, state: S) -> Result<S, String> {
        match request {
            Request::Get(call) | Request::GetAndUpdate(call) | Request::Update(call) => call.apply(state),
            _ => panic!("not a synchronous request"),
        }
    }

    #[test]
    fn test_get_replies_and_keeps_state() {
        let (request, mut rx) = Request::get(|n: &i32| n * 10);
        assert_eq!(request.kind(), "get");

        let state = apply(request, 4).unwrap();
        assert_eq!(state, 4);
        assert_eq!(rx.try_recv().unwrap(), Ok(40));
    }

    #[test]
    fn test_get_and_update_replaces_state() {
        let (request, mut rx) = Request::get_and_update(|n: i32| (n, n + 1));

        let state = apply(request, 5).unwrap();
        assert_eq!(state, 6);
        assert_eq!(rx.try_recv().unwrap(), Ok(5));
    }

    #[test]
    fn test_update_replies_unit() {
        let (request, mut rx) = Request::update(|v: Vec<u8>| {
            let mut v = v;
            v.push(1);
            v
        });

        let state = apply(request, vec![]).unwrap();
        assert_eq!(state, vec![1]);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_panicking_fun_reports_crash_to_caller() {
        let (request, mut rx) = Request::update(|_: i32| -> i32 { panic!("boom") });

        let reason = apply(request, 1).unwrap_err();
        assert_eq!(reason, "boom");
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(CellError::Crashed {
                reason: "boom".to_string()
            })
        );
    }

    #[test]
    fn test_reject_fails_caller_without_running() {
        let (request, mut rx) = Request::get(|_: &i32| -> i32 { panic!("must not run") });
        request.reject(CellError::NoSuchCell);
        assert_eq!(rx.try_recv().unwrap(), Err(CellError::NoSuchCell));

        let (stop, mut stop_rx) = Request::<i32>::stop();
        assert_eq!(stop.kind(), "stop");
        stop.reject(CellError::NoSuchCell);
        assert_eq!(stop_rx.try_recv().unwrap(), Err(CellError::NoSuchCell));
    }

    #[test]
    fn test_panic_reason_formats() {
        let owned: Box<dyn Any + Send> = Box::new(format!("code {}", 7));
        assert_eq!(panic_reason(owned.as_ref()), "code 7");

        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_reason(other.as_ref()), "panic with non-string payload");
    }
}
