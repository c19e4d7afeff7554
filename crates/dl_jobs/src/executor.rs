//! Single-flight FIFO job executor.
//!
//! Jobs run one at a time in submission order on a named worker thread. The
//! worker is started on demand when work arrives and exits once the queue is
//! empty, so an idle executor holds no thread. Submitting never blocks.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::job::Job;

/// Bounded wait between queue checks while draining.
const DRAIN_POLL: Duration = Duration::from_secs(1);

const WORKER_THREAD_NAME: &str = "dl-job-worker";

type BoxedJob<C> = Box<dyn Job<C>>;

struct State<C> {
    queue: VecDeque<BoxedJob<C>>,
    /// A job's `run` is executing right now.
    running: bool,
    /// A worker thread exists and will keep taking the queue head.
    worker_active: bool,
    /// Taken by whichever `shutdown` joins; the others wait on `worker_active`.
    worker: Option<JoinHandle<()>>,
    worker_thread: Option<ThreadId>,
    terminating: bool,
}

/// Wakes a draining `shutdown` early. Independent of the context type so the
/// interrupt handle stays non-generic.
#[derive(Default)]
struct Signal {
    changed: Condvar,
    interrupted: AtomicBool,
}

struct Shared<C> {
    state: Mutex<State<C>>,
    signal: Arc<Signal>,
    context: Arc<C>,
}

pub struct JobExecutor<C: Send + Sync + 'static> {
    shared: Arc<Shared<C>>,
}

/// Interrupts a blocked [`JobExecutor::shutdown`]: queued jobs that have not
/// started are discarded. A job already running is still waited for.
#[derive(Clone)]
pub struct ShutdownInterrupt {
    signal: Arc<Signal>,
}

impl ShutdownInterrupt {
    pub fn interrupt(&self) {
        self.signal.interrupted.store(true, Ordering::SeqCst);
        self.signal.changed.notify_all();
    }
}

impl<C: Send + Sync + 'static> JobExecutor<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    running: false,
                    worker_active: false,
                    worker: None,
                    worker_thread: None,
                    terminating: false,
                }),
                signal: Arc::new(Signal::default()),
                context,
            }),
        }
    }

    pub fn context(&self) -> &Arc<C> {
        &self.shared.context
    }

    /// Queue `job` at the tail. Returns `false`, without queueing, once
    /// shutdown has begun.
    pub fn submit<J>(&self, job: J) -> bool
    where
        J: Job<C> + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.terminating {
            debug!(job = job.name(), "executor is shutting down, dropping job");
            return false;
        }
        trace!(job = job.name(), queued = state.queue.len(), "job queued");
        state.queue.push_back(Box::new(job));
        ensure_worker(&self.shared, &mut state);
        true
    }

    /// Jobs queued and not yet started.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn is_terminating(&self) -> bool {
        self.shared.state.lock().terminating
    }

    pub fn interrupt_handle(&self) -> ShutdownInterrupt {
        ShutdownInterrupt {
            signal: Arc::clone(&self.shared.signal),
        }
    }

    /// Stop accepting jobs, wait for the queue to drain, then wait for the
    /// job in flight. An [`interrupt`](ShutdownInterrupt::interrupt) while
    /// waiting discards whatever is still queued. Any number of threads may
    /// call this at once; each returns only after the worker has stopped.
    ///
    /// Called from inside a job this only stops intake; waiting for the
    /// worker from the worker would never return.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if !state.terminating {
            debug!(pending = state.queue.len(), "job executor shutting down");
        }
        state.terminating = true;

        if state.worker_active && state.worker_thread == Some(thread::current().id()) {
            debug!("shutdown requested from a running job, not waiting");
            return;
        }

        while !state.queue.is_empty() {
            if self.shared.signal.interrupted.swap(false, Ordering::SeqCst) {
                let discarded = state.queue.len();
                state.queue.clear();
                info!(discarded, "shutdown interrupted, discarded queued jobs");
                break;
            }
            ensure_worker(&self.shared, &mut state);
            self.shared.signal.changed.wait_for(&mut state, DRAIN_POLL);
        }

        while state.running || state.worker_active {
            self.shared.signal.changed.wait_for(&mut state, DRAIN_POLL);
        }

        let worker = state.worker.take();
        drop(state);

        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!("job worker thread panicked outside a job");
            }
        }
    }
}

impl<C: Send + Sync + 'static> Drop for JobExecutor<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ensure_worker<C: Send + Sync + 'static>(shared: &Arc<Shared<C>>, state: &mut State<C>) {
    if state.worker_active || state.queue.is_empty() {
        return;
    }

    let worker_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(WORKER_THREAD_NAME.into())
        .spawn(move || work(worker_shared));

    match spawned {
        Ok(handle) => {
            state.worker_active = true;
            state.worker_thread = Some(handle.thread().id());
            // A previous worker has already left its loop; detach it.
            state.worker = Some(handle);
        }
        Err(e) => {
            // Jobs stay queued; the next submit or drain poll retries.
            error!(error = %e, "failed to start job worker");
        }
    }
}

fn work<C: Send + Sync + 'static>(shared: Arc<Shared<C>>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            match state.queue.pop_front() {
                Some(job) => {
                    state.running = true;
                    job
                }
                None => {
                    state.worker_active = false;
                    shared.signal.changed.notify_all();
                    return;
                }
            }
        };

        let name = job.name().to_owned();
        trace!(job = %name, "job started");
        let outcome = catch_unwind(AssertUnwindSafe(|| job.run(&shared.context)));
        match outcome {
            Ok(Ok(())) => trace!(job = %name, "job finished"),
            Ok(Err(e)) => warn!(job = %name, error = %format!("{e:#}"), "job failed"),
            Err(payload) => warn!(job = %name, panic = panic_message(&*payload), "job panicked"),
        }

        shared.state.lock().running = false;
        shared.signal.changed.notify_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
