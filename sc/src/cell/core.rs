//! The cell's execution loop
//!
//! One loop owns the state and drains the mailbox strictly in arrival order:
//!
//! ```text
//! Initializing -> Ready -> (Ready -> Processing -> Ready)* -> Stopping -> Terminated
//! ```
//!
//! A panicking fun moves the cell straight from `Processing` to `Terminated`.
//!
//! In task mode the loop itself is async, but the initializer, every fun and
//! the final drop of the state run on tokio's blocking pool. A slow fun never
//! stalls the runtime, so callers' timeouts still fire while it runs.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::handle::CellId;
use super::messages::{CellError, CellResult, Request, panic_reason};
use super::options::{SpawnMode, SpawnOptions};
use super::registry::Registry;

/// Why a cell terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Stopped on request
    Normal,
    /// A fun panicked, or the state panicked while being dropped
    Crashed(String),
    /// A linked cell lost its last handle
    Orphaned,
    /// The initializer failed or `start` stopped waiting for it
    Aborted,
}

/// Lifecycle position of a cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellStatus {
    Initializing,
    Ready,
    Processing,
    Stopping,
    Terminated(Exit),
}

impl CellStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }

    pub fn exit(&self) -> Option<&Exit> {
        match self {
            Self::Terminated(exit) => Some(exit),
            _ => None,
        }
    }
}

/// Reply sent once the initializer has run
pub(crate) type InitReply = oneshot::Sender<eyre::Result<()>>;

type Ack = oneshot::Sender<CellResult<()>>;

/// User code the loop runs against the state; `Err` carries a panic reason
type Work<T> = Box<dyn FnOnce() -> Result<T, String> + Send>;

/// What the loop does with one request
enum Step<S> {
    /// Run a fun; its result is the next state
    Apply(Work<S>),
    /// Drop the state, then terminate
    Halt {
        teardown: Work<()>,
        exit: Exit,
        ack: Option<Ack>,
    },
}

/// Run the initializer, turning a panic into an error
fn guarded<S, F>(init: F) -> eyre::Result<S>
where
    F: FnOnce() -> eyre::Result<S>,
{
    match catch_unwind(AssertUnwindSafe(init)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(eyre::eyre!("initializer panicked: {}", panic_reason(payload.as_ref()))),
    }
}

/// Drop the state, catching a panicking `Drop`
fn teardown<S: Send + 'static>(state: S) -> Work<()> {
    Box::new(move || catch_unwind(AssertUnwindSafe(move || drop(state))).map_err(|payload| panic_reason(payload.as_ref())))
}

/// Run work on the blocking pool so the async workers stay free
async fn offload<T: Send + 'static>(work: Work<T>) -> Result<T, String> {
    tokio::task::spawn_blocking(work)
        .await
        .unwrap_or_else(|e| Err(format!("blocking task failed: {e}")))
}

/// The loop side of a cell
pub(crate) struct Cell<S> {
    pub(crate) id: CellId,
    pub(crate) name: Option<String>,
    pub(crate) registry: Registry,
    pub(crate) rx: mpsc::UnboundedReceiver<Request<S>>,
    /// Held by unlinked cells so the mailbox outlives every handle
    pub(crate) keepalive: Option<mpsc::UnboundedSender<Request<S>>>,
    pub(crate) status: watch::Sender<CellStatus>,
}

impl<S: Send + 'static> Cell<S> {
    /// Launch the loop in the requested execution context
    pub(crate) fn spawn<F>(self, init: F, ready: InitReply, options: &SpawnOptions) -> std::io::Result<()>
    where
        F: FnOnce() -> eyre::Result<S> + Send + 'static,
    {
        match options.mode {
            SpawnMode::Task => {
                tokio::spawn(self.run_task(init, ready));
            }
            SpawnMode::Thread => {
                let name = options
                    .thread_name
                    .clone()
                    .unwrap_or_else(|| format!("cell-{}", self.id));
                let mut builder = thread::Builder::new().name(name);
                if let Some(size) = options.stack_size {
                    builder = builder.stack_size(size);
                }
                builder.spawn(move || self.run_thread(init, ready))?;
            }
        }
        Ok(())
    }

    async fn run_task<F>(mut self, init: F, ready: InitReply)
    where
        F: FnOnce() -> eyre::Result<S> + Send + 'static,
    {
        debug!(cell = %self.id, "run_task: initializing on blocking pool");
        let outcome = tokio::task::spawn_blocking(move || guarded(init))
            .await
            .unwrap_or_else(|e| Err(eyre::eyre!("initializer did not complete: {e}")));

        let mut state = self.initialized(outcome, ready);
        while let Some(current) = state {
            let request = self.rx.recv().await;
            state = match self.take(current, request) {
                Step::Apply(work) => {
                    let applied = offload(work).await;
                    self.settle(applied)
                }
                Step::Halt { teardown, exit, ack } => {
                    let dropped = offload(teardown).await;
                    self.halt(dropped, exit, ack);
                    None
                }
            };
        }
    }

    fn run_thread<F>(mut self, init: F, ready: InitReply)
    where
        F: FnOnce() -> eyre::Result<S>,
    {
        debug!(cell = %self.id, "run_thread: initializing");
        let mut state = self.initialized(guarded(init), ready);
        while let Some(current) = state {
            let request = self.rx.blocking_recv();
            state = self.step(current, request);
        }
    }

    fn publish(&self, status: CellStatus) {
        self.status.send_replace(status);
    }

    /// Report the initializer's outcome to `start`
    ///
    /// `Ready` is published only once `start` has accepted the reply.
    fn initialized(&mut self, outcome: eyre::Result<S>, ready: InitReply) -> Option<S> {
        match outcome {
            Ok(state) => {
                if ready.send(Ok(())).is_err() {
                    warn!(cell = %self.id, "start gave up before initialization finished");
                    let dropped = teardown(state)();
                    self.halt(dropped, Exit::Aborted, None);
                    return None;
                }
                self.publish(CellStatus::Ready);
                Some(state)
            }
            Err(report) => {
                warn!(cell = %self.id, error = %report, "initializer failed");
                self.finish(Exit::Aborted, CellError::NoSuchCell, None);
                let _ = ready.send(Err(report));
                None
            }
        }
    }

    /// Handle one request inline; `None` once the cell has terminated
    fn step(&mut self, state: S, request: Option<Request<S>>) -> Option<S> {
        match self.take(state, request) {
            Step::Apply(work) => self.settle(work()),
            Step::Halt { teardown, exit, ack } => {
                self.halt(teardown(), exit, ack);
                None
            }
        }
    }

    /// Turn the next request into work against `state`
    fn take(&mut self, state: S, request: Option<Request<S>>) -> Step<S> {
        let Some(request) = request else {
            info!(cell = %self.id, "every handle dropped, terminating");
            return Step::Halt {
                teardown: teardown(state),
                exit: Exit::Orphaned,
                ack: None,
            };
        };

        debug!(cell = %self.id, kind = request.kind(), "take: handling request");
        match request {
            Request::Stop { reply } => {
                self.publish(CellStatus::Stopping);
                Step::Halt {
                    teardown: teardown(state),
                    exit: Exit::Normal,
                    ack: Some(reply),
                }
            }
            Request::Get(call) | Request::GetAndUpdate(call) | Request::Update(call) => {
                self.publish(CellStatus::Processing);
                Step::Apply(Box::new(move || call.apply(state)))
            }
            Request::Cast(fun) => {
                self.publish(CellStatus::Processing);
                Step::Apply(Box::new(move || {
                    catch_unwind(AssertUnwindSafe(move || fun(state))).map_err(|payload| panic_reason(payload.as_ref()))
                }))
            }
        }
    }

    /// Resume with the next state, or crash
    fn settle(&mut self, applied: Result<S, String>) -> Option<S> {
        match applied {
            Ok(next) => {
                self.publish(CellStatus::Ready);
                Some(next)
            }
            Err(reason) => {
                warn!(cell = %self.id, %reason, "fun panicked, terminating");
                self.finish(
                    Exit::Crashed(reason.clone()),
                    CellError::Crashed { reason },
                    None,
                );
                None
            }
        }
    }

    /// Terminate after the state was dropped
    fn halt(&mut self, dropped: Result<(), String>, exit: Exit, ack: Option<Ack>) {
        match dropped {
            Ok(()) => self.finish(exit, CellError::NoSuchCell, ack),
            Err(reason) => {
                warn!(cell = %self.id, %reason, "state panicked while being dropped");
                self.finish(
                    Exit::Crashed(reason.clone()),
                    CellError::Crashed { reason },
                    ack,
                );
            }
        }
    }

    /// Close the mailbox, fail whatever is still queued, release the name
    fn finish(&mut self, exit: Exit, pending: CellError, ack: Option<Ack>) {
        self.rx.close();
        self.keepalive = None;

        let mut rejected = 0usize;
        while let Ok(request) = self.rx.try_recv() {
            request.reject(pending.clone());
            rejected += 1;
        }

        if let Some(name) = &self.name {
            self.registry.unregister(name, self.id);
        }

        let acked = match &exit {
            Exit::Crashed(reason) => Err(CellError::Crashed { reason: reason.clone() }),
            _ => Ok(()),
        };

        info!(cell = %self.id, ?exit, rejected, "cell terminated");
        self.publish(CellStatus::Terminated(exit));

        if let Some(ack) = ack {
            let _ = ack.send(acked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_helpers() {
        assert!(!CellStatus::Ready.is_terminated());
        assert_eq!(CellStatus::Processing.exit(), None);

        let status = CellStatus::Terminated(Exit::Crashed("boom".to_string()));
        assert!(status.is_terminated());
        assert_eq!(status.exit(), Some(&Exit::Crashed("boom".to_string())));
    }

    fn new_cell<S>(registry: Registry) -> (Cell<S>, mpsc::UnboundedSender<Request<S>>, watch::Receiver<CellStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(CellStatus::Initializing);
        let cell = Cell {
            id: CellId::new(),
            name: None,
            registry,
            rx,
            keepalive: None,
            status,
        };
        (cell, tx, status_rx)
    }

    #[test]
    fn test_step_runs_requests_in_order() {
        let (mut cell, _tx, status) = new_cell::<i32>(Registry::new());

        let (update, mut update_rx) = Request::update(|n: i32| n + 1);
        let state = cell.step(1, Some(update)).unwrap();
        assert_eq!(state, 2);
        assert_eq!(update_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(*status.borrow(), CellStatus::Ready);

        let state = cell.step(state, Some(Request::Cast(Box::new(|n: i32| n * 10)))).unwrap();
        assert_eq!(state, 20);
    }

    #[test]
    fn test_stop_rejects_requests_queued_behind_it() {
        let (mut cell, tx, status) = new_cell::<i32>(Registry::new());

        let (late, mut late_rx) = Request::get(|n: &i32| *n);
        tx.send(late).map_err(|_| "send").unwrap();

        let (stop, mut stop_rx) = Request::stop();
        assert!(cell.step(7, Some(stop)).is_none());

        assert_eq!(stop_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(late_rx.try_recv().unwrap(), Err(CellError::NoSuchCell));
        assert_eq!(*status.borrow(), CellStatus::Terminated(Exit::Normal));
        assert!(tx.send(Request::Cast(Box::new(|n: i32| n))).is_err());
    }

    #[test]
    fn test_crash_fails_pending_with_reason() {
        let (mut cell, tx, status) = new_cell::<i32>(Registry::new());

        let (pending, mut pending_rx) = Request::update(|n: i32| n);
        tx.send(pending).map_err(|_| "send").unwrap();

        let crash: Request<i32> = Request::Cast(Box::new(|_: i32| -> i32 { panic!("bad fun") }));
        assert!(cell.step(0, Some(crash)).is_none());

        let expected = CellError::Crashed {
            reason: "bad fun".to_string(),
        };
        assert_eq!(pending_rx.try_recv().unwrap(), Err(expected));
        assert_eq!(
            *status.borrow(),
            CellStatus::Terminated(Exit::Crashed("bad fun".to_string()))
        );
    }

    #[test]
    fn test_closed_mailbox_orphans_cell() {
        let (mut cell, tx, status) = new_cell::<i32>(Registry::new());
        drop(tx);

        assert!(cell.step(3, None).is_none());
        assert_eq!(*status.borrow(), CellStatus::Terminated(Exit::Orphaned));
    }

    struct Bomb;

    impl Drop for Bomb {
        fn drop(&mut self) {
            panic!("drop exploded");
        }
    }

    #[test]
    fn test_panicking_drop_on_stop_crashes_cell() {
        let (mut cell, tx, status) = new_cell::<Bomb>(Registry::new());

        let (late, mut late_rx) = Request::get(|_: &Bomb| 1u8);
        tx.send(late).map_err(|_| "send").unwrap();

        let (stop, mut stop_rx) = Request::stop();
        assert!(cell.step(Bomb, Some(stop)).is_none());

        let expected = CellError::Crashed {
            reason: "drop exploded".to_string(),
        };
        assert_eq!(stop_rx.try_recv().unwrap(), Err(expected.clone()));
        assert_eq!(late_rx.try_recv().unwrap(), Err(expected));
        assert_eq!(
            *status.borrow(),
            CellStatus::Terminated(Exit::Crashed("drop exploded".to_string()))
        );
    }

    #[test]
    fn test_abandoned_start_aborts_without_ready() {
        let (mut cell, tx, status) = new_cell::<i32>(Registry::new());
        let (ready, ready_rx) = oneshot::channel();
        drop(ready_rx);

        assert!(cell.initialized(Ok(5), ready).is_none());
        assert_eq!(*status.borrow(), CellStatus::Terminated(Exit::Aborted));
        assert!(tx.is_closed());
    }

    #[test]
    fn test_ready_published_after_start_accepts() {
        let (mut cell, _tx, status) = new_cell::<i32>(Registry::new());
        let (ready, mut ready_rx) = oneshot::channel();

        assert_eq!(cell.initialized(Ok(5), ready), Some(5));
        assert!(ready_rx.try_recv().unwrap().is_ok());
        assert_eq!(*status.borrow(), CellStatus::Ready);
    }

    #[tokio::test]
    async fn test_offload_reports_panics_as_reasons() {
        let work: Work<i32> = Box::new(|| Ok(3));
        assert_eq!(offload(work).await, Ok(3));

        let dropped = offload(teardown(Bomb)).await;
        assert_eq!(dropped, Err("drop exploded".to_string()));
    }
}
