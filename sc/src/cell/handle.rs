//! StateCell - client handle for a running cell
//!
//! Every operation is a message to the cell's loop. Synchronous calls wait on
//! a correlated oneshot reply with a bounded timeout; `cast` only enqueues.

use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::core::{Cell, CellStatus, Exit};
use super::messages::{CellError, CellResult, Request, StartError};
use super::options::CellOptions;
use super::registry::Registry;

/// Identity of a cell instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(Uuid);

impl CellId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
enum Linkage {
    /// The cell terminates once every handle is dropped
    Linked,
    /// The cell runs until stopped or crashed
    Unlinked,
}

/// Handle to a cell owning a value of type `S`
///
/// Cloneable; all clones address the same cell. Requests sent through one
/// handle are processed in the order they were sent.
pub struct StateCell<S> {
    id: CellId,
    name: Option<String>,
    tx: mpsc::UnboundedSender<Request<S>>,
    status: watch::Receiver<CellStatus>,
    call_timeout: Duration,
}

impl<S> Clone for StateCell<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            tx: self.tx.clone(),
            status: self.status.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<S> fmt::Debug for StateCell<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl<S> PartialEq for StateCell<S> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<S> Eq for StateCell<S> {}

impl<S> StateCell<S> {
    pub fn id(&self) -> CellId {
        self.id
    }

    /// Registered name, if the cell was started with one
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Current lifecycle position
    pub fn status(&self) -> CellStatus {
        self.status.borrow().clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.status.borrow().is_terminated() && !self.tx.is_closed()
    }

    /// Default timeout for synchronous calls through this handle
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// A handle to the same cell with a different default call timeout
    pub fn with_call_timeout(&self, timeout: Duration) -> Self {
        Self {
            call_timeout: timeout,
            ..self.clone()
        }
    }

    /// Wait until the cell terminates and report why
    ///
    /// A linked cell stays alive while this handle exists, so waiting on one
    /// only returns after a stop or a crash.
    pub async fn terminated(&self) -> Exit {
        let mut status = self.status.clone();
        let exit = match status.wait_for(CellStatus::is_terminated).await {
            Ok(current) => current.exit().cloned(),
            Err(_) => None,
        };
        exit.unwrap_or(Exit::Orphaned)
    }

    pub(crate) fn status_receiver(&self) -> watch::Receiver<CellStatus> {
        self.status.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakCell<S> {
        WeakCell {
            id: self.id,
            name: self.name.clone(),
            tx: self.tx.downgrade(),
            status: self.status.clone(),
            call_timeout: self.call_timeout,
        }
    }

    fn send(&self, request: Request<S>) -> CellResult<()> {
        self.tx.send(request).map_err(|_| CellError::NoSuchCell)
    }

    /// Wait for a correlated reply. Timing out abandons the wait only.
    async fn await_reply<R>(&self, reply: oneshot::Receiver<CellResult<R>>, timeout: Duration) -> CellResult<R> {
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.exit_error()),
            Err(_) => {
                warn!(cell = %self.id, ?timeout, "call timed out, request stays queued");
                Err(CellError::Timeout(timeout))
            }
        }
    }

    /// The error for a reply channel closed without an answer
    fn exit_error(&self) -> CellError {
        match &*self.status.borrow() {
            CellStatus::Terminated(Exit::Crashed(reason)) => CellError::Crashed { reason: reason.clone() },
            _ => CellError::NoSuchCell,
        }
    }
}

impl<S: Send + 'static> StateCell<S> {
    /// Start a linked cell and wait for its initializer
    ///
    /// The cell terminates once every handle to it has been dropped.
    pub async fn start<F>(init: F, options: CellOptions) -> Result<Self, StartError<S>>
    where
        F: FnOnce() -> S + Send + 'static,
    {
        Self::spawn(move || Ok::<S, Infallible>(init()), options, Linkage::Linked).await
    }

    /// Start a cell that outlives its handles
    ///
    /// It runs until stopped or crashed; a named one stays reachable through
    /// [`StateCell::whereis`].
    pub async fn start_unlinked<F>(init: F, options: CellOptions) -> Result<Self, StartError<S>>
    where
        F: FnOnce() -> S + Send + 'static,
    {
        Self::spawn(move || Ok::<S, Infallible>(init()), options, Linkage::Unlinked).await
    }

    /// Start a linked cell with a fallible initializer
    ///
    /// An `Err` from `init` comes back as [`StartError::Initializer`] and can
    /// be downcast to the error type `init` returned.
    pub async fn try_start<F, E>(init: F, options: CellOptions) -> Result<Self, StartError<S>>
    where
        F: FnOnce() -> Result<S, E> + Send + 'static,
        E: Into<eyre::Report>,
    {
        Self::spawn(init, options, Linkage::Linked).await
    }

    /// Start an unlinked cell with a fallible initializer
    pub async fn try_start_unlinked<F, E>(init: F, options: CellOptions) -> Result<Self, StartError<S>>
    where
        F: FnOnce() -> Result<S, E> + Send + 'static,
        E: Into<eyre::Report>,
    {
        Self::spawn(init, options, Linkage::Unlinked).await
    }

    /// Resolve a cell registered in the process-wide registry
    pub fn whereis(name: &str) -> Option<Self> {
        Registry::global().whereis(name)
    }

    async fn spawn<F, E>(init: F, options: CellOptions, linkage: Linkage) -> Result<Self, StartError<S>>
    where
        F: FnOnce() -> Result<S, E> + Send + 'static,
        E: Into<eyre::Report>,
    {
        let id = CellId::new();
        debug!(cell = %id, name = ?options.name, ?linkage, mode = ?options.spawn.mode, "StateCell::spawn: called");

        let registry = options.registry.clone().unwrap_or_else(|| Registry::global().clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CellStatus::Initializing);

        let handle = Self {
            id,
            name: options.name.clone(),
            tx,
            status: status_rx,
            call_timeout: options.call_timeout,
        };

        if let Some(name) = &options.name {
            registry.register(name, &handle)?;
        }

        let cell = Cell {
            id,
            name: options.name.clone(),
            registry: registry.clone(),
            rx,
            keepalive: match linkage {
                Linkage::Linked => None,
                Linkage::Unlinked => Some(handle.tx.clone()),
            },
            status: status_tx,
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        if let Err(e) = cell.spawn(move || init().map_err(Into::into), ready_tx, &options.spawn) {
            handle.release(&registry);
            return Err(StartError::Initializer(
                eyre::Report::new(e).wrap_err("failed to spawn cell thread"),
            ));
        }

        let outcome = match options.init_timeout {
            Some(limit) => match tokio::time::timeout(limit, ready_rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(cell = %id, ?limit, "initializer timed out, terminating cell");
                    handle.release(&registry);
                    let (stop, _) = Request::stop();
                    let _ = handle.send(stop);
                    return Err(StartError::Timeout(limit));
                }
            },
            None => ready_rx.await,
        };

        match outcome {
            Ok(Ok(())) => {
                // The loop publishes Ready right after this reply
                let mut status = handle.status.clone();
                let _ = status.wait_for(|current| *current != CellStatus::Initializing).await;
                info!(cell = %id, name = ?handle.name, "cell started");
                Ok(handle)
            }
            Ok(Err(report)) => Err(StartError::Initializer(report)),
            Err(_) => Err(StartError::Initializer(eyre::eyre!(
                "cell exited before initialization finished"
            ))),
        }
    }

    /// Drop the name claimed during start
    fn release(&self, registry: &Registry) {
        if let Some(name) = &self.name {
            registry.unregister(name, self.id);
        }
    }

    /// Read from the state with the handle's default timeout
    pub async fn get<F, R>(&self, fun: F) -> CellResult<R>
    where
        F: FnOnce(&S) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.get_timeout(fun, self.call_timeout).await
    }

    /// Read from the state; the state is left unchanged
    pub async fn get_timeout<F, R>(&self, fun: F, timeout: Duration) -> CellResult<R>
    where
        F: FnOnce(&S) -> R + Send + 'static,
        R: Send + 'static,
    {
        debug!(cell = %self.id, ?timeout, "get: called");
        let (request, reply) = Request::get(fun);
        self.send(request)?;
        self.await_reply(reply, timeout).await
    }

    /// Read and replace the state with the handle's default timeout
    pub async fn get_and_update<F, R>(&self, fun: F) -> CellResult<R>
    where
        F: FnOnce(S) -> (R, S) + Send + 'static,
        R: Send + 'static,
    {
        self.get_and_update_timeout(fun, self.call_timeout).await
    }

    /// Run `fun` on the state, reply with the first element and keep the second
    pub async fn get_and_update_timeout<F, R>(&self, fun: F, timeout: Duration) -> CellResult<R>
    where
        F: FnOnce(S) -> (R, S) + Send + 'static,
        R: Send + 'static,
    {
        debug!(cell = %self.id, ?timeout, "get_and_update: called");
        let (request, reply) = Request::get_and_update(fun);
        self.send(request)?;
        self.await_reply(reply, timeout).await
    }

    /// Replace the state with the handle's default timeout
    pub async fn update<F>(&self, fun: F) -> CellResult<()>
    where
        F: FnOnce(S) -> S + Send + 'static,
    {
        self.update_timeout(fun, self.call_timeout).await
    }

    /// Replace the state with `fun(state)` and wait for it to be applied
    pub async fn update_timeout<F>(&self, fun: F, timeout: Duration) -> CellResult<()>
    where
        F: FnOnce(S) -> S + Send + 'static,
    {
        debug!(cell = %self.id, ?timeout, "update: called");
        let (request, reply) = Request::update(fun);
        self.send(request)?;
        self.await_reply(reply, timeout).await
    }

    /// Enqueue `fun` and return at once
    ///
    /// There is no acknowledgment and no error, not even when the cell is
    /// gone. A panicking `fun` still terminates the cell.
    pub fn cast<F>(&self, fun: F)
    where
        F: FnOnce(S) -> S + Send + 'static,
    {
        debug!(cell = %self.id, "cast: called");
        let _ = self.tx.send(Request::Cast(Box::new(fun)));
    }

    /// Stop the cell with the handle's default timeout
    pub async fn stop(&self) -> CellResult<()> {
        self.stop_timeout(self.call_timeout).await
    }

    /// Stop the cell after everything queued ahead of the stop has run
    pub async fn stop_timeout(&self, timeout: Duration) -> CellResult<()> {
        debug!(cell = %self.id, ?timeout, "stop: called");
        let (request, reply) = Request::stop();
        self.send(request)?;
        self.await_reply(reply, timeout).await
    }
}

/// Registry-side reference that does not keep a linked cell alive
pub(crate) struct WeakCell<S> {
    id: CellId,
    name: Option<String>,
    tx: mpsc::WeakUnboundedSender<Request<S>>,
    status: watch::Receiver<CellStatus>,
    call_timeout: Duration,
}

impl<S> WeakCell<S> {
    pub(crate) fn upgrade(&self) -> Option<StateCell<S>> {
        let tx = self.tx.upgrade()?;
        if tx.is_closed() {
            return None;
        }
        Some(StateCell {
            id: self.id,
            name: self.name.clone(),
            tx,
            status: self.status.clone(),
            call_timeout: self.call_timeout,
        })
    }
}
