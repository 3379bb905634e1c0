//! Downloads that outlive the caller's interest in them.
//!
//! A background download runs on a detached task. Its outcome goes to the
//! `BackgroundDownload` future if that is still alive; otherwise it is
//! recorded and the host drains it with `take_pending_events` when it comes
//! back. The completion hook fires once nothing is running and nothing is
//! waiting to be drained.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::download::TaskId;
use crate::error::NetworkError;

/// Outcome of one background download.
#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundEvent {
    Completed(PathBuf),
    Failed(NetworkError),
}

type CompletionHook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Ledger {
    in_flight: usize,
    pending: Vec<(TaskId, BackgroundEvent)>,
    hook: Option<CompletionHook>,
}

impl Ledger {
    /// Take the hook if the session has gone quiet.
    fn take_hook_if_idle(&mut self) -> Option<CompletionHook> {
        if self.in_flight == 0 && self.pending.is_empty() {
            self.hook.take()
        } else {
            None
        }
    }
}

struct Shared {
    ledger: Mutex<Ledger>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the ledger, then fire the hook outside the lock if due.
    fn update<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> R {
        let (result, hook) = {
            let mut ledger = self.lock();
            let result = f(&mut ledger);
            (result, ledger.take_hook_if_idle())
        };
        if let Some(hook) = hook {
            debug!("background session idle, running completion hook");
            hook();
        }
        result
    }
}

/// Session that owns every background download of a client.
#[derive(Clone)]
pub struct BackgroundSession {
    identifier: String,
    shared: Arc<Shared>,
}

impl BackgroundSession {
    pub(crate) fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        info!(%identifier, "background session created");
        Self {
            identifier,
            shared: Arc::new(Shared {
                ledger: Mutex::new(Ledger::default()),
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight
    }

    /// Drain outcomes that arrived while nobody was listening.
    pub fn take_pending_events(&self) -> Vec<(TaskId, BackgroundEvent)> {
        self.shared.update(|ledger| std::mem::take(&mut ledger.pending))
    }

    /// Register `hook` to run once the session is idle. Runs immediately if
    /// it already is. Registering again after it ran arms it for the next
    /// batch; registering before it ran replaces the earlier hook.
    pub fn set_completion_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.update(|ledger| ledger.hook = Some(Box::new(hook)));
    }

    /// Run `work` detached and hand its outcome to the returned future, or
    /// record it if that future is gone by then.
    pub(crate) fn spawn<F>(&self, runtime: &Handle, task: TaskId, work: F) -> BackgroundDownload
    where
        F: Future<Output = BackgroundEvent> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.shared.update(|ledger| ledger.in_flight += 1);
        let guard = InFlight {
            shared: self.shared.clone(),
            task,
            delivered: false,
        };
        runtime.spawn(async move {
            let event = work.await;
            guard.deliver(tx, event);
        });
        BackgroundDownload { task, rx }
    }
}

impl fmt::Debug for BackgroundSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self.shared.lock();
        f.debug_struct("BackgroundSession")
            .field("identifier", &self.identifier)
            .field("in_flight", &ledger.in_flight)
            .field("pending", &ledger.pending.len())
            .field("hook_armed", &ledger.hook.is_some())
            .finish()
    }
}

/// Keeps a task counted as in flight until its outcome lands somewhere.
struct InFlight {
    shared: Arc<Shared>,
    task: TaskId,
    delivered: bool,
}

impl InFlight {
    fn deliver(mut self, tx: oneshot::Sender<BackgroundEvent>, event: BackgroundEvent) {
        self.delivered = true;
        let task = self.task;
        self.shared.update(|ledger| {
            ledger.in_flight -= 1;
            if let Err(event) = tx.send(event) {
                debug!(%task, "no listener for background outcome, recording it");
                ledger.pending.push((task, event));
            }
        });
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.delivered {
            let task = self.task;
            self.shared.update(|ledger| {
                ledger.in_flight -= 1;
                ledger.pending.push((
                    task,
                    BackgroundEvent::Failed(NetworkError::Transport(
                        "background task stopped before finishing".to_string(),
                    )),
                ));
            });
        }
    }
}

/// Future of one background download's outcome.
#[derive(Debug)]
pub struct BackgroundDownload {
    task: TaskId,
    rx: oneshot::Receiver<BackgroundEvent>,
}

impl BackgroundDownload {
    /// A download that failed before it could be handed to the session.
    pub(crate) fn failed(task: TaskId, error: NetworkError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(BackgroundEvent::Failed(error));
        Self { task, rx }
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }
}

impl Future for BackgroundDownload {
    type Output = BackgroundEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<BackgroundEvent> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(event)) => Poll::Ready(event),
            Poll::Ready(Err(_)) => Poll::Ready(BackgroundEvent::Failed(NetworkError::Transport(
                "background task stopped before finishing".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
