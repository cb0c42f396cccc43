//! Main-thread dispatcher
//!
//! The editor API may only be touched from the editor's own thread. Network
//! I/O runs on tokio worker threads. The [`Dispatcher`] is the only bridge
//! between the two: it queues closures, and the [`MainThreadPump`], owned by
//! the editor thread, runs them once per tick and hands each result back to
//! whoever is awaiting it.
//!
//! The pump also drives a single-threaded executor so that
//! [`Dispatcher::run_on_main_async`] can run futures that stay on the main
//! thread across `.await` points.

use futures::FutureExt;
use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;
use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

type Job = Box<dyn FnOnce(&LocalSpawner) + Send>;

thread_local! {
    static ON_MAIN_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Errors surfaced to callers of the dispatcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The pump is gone; nothing will run the closure
    #[error("Main thread is no longer accepting work")]
    Closed,

    /// The closure panicked on the main thread
    #[error("Main-thread work panicked: {message}")]
    Panicked { message: String },
}

struct Shared {
    main_thread: ThreadId,
    queued: AtomicUsize,
    closed: AtomicBool,
}

/// Cloneable, `Send` handle for scheduling work on the main thread
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("main_thread", &self.shared.main_thread)
            .field("queued", &self.shared.queued.load(Ordering::Relaxed))
            .finish()
    }
}

impl Dispatcher {
    /// True when called from the thread that owns the pump
    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.shared.main_thread
    }

    /// Jobs waiting for the next tick
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Relaxed)
    }

    /// Run `work` on the main thread and return its result.
    ///
    /// Called from the main thread itself, `work` runs inline, so nested
    /// dispatch from inside a dispatched closure cannot deadlock.
    pub async fn run_on_main<T, F>(&self, work: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_main_thread() {
            return catch_unwind(AssertUnwindSafe(work)).map_err(panicked);
        }

        let (tx, rx) = oneshot::channel();
        self.enqueue(Box::new(move |_| {
            let result = catch_unwind(AssertUnwindSafe(work)).map_err(panicked);
            let _ = tx.send(result);
        }))?;

        rx.await.map_err(|_| DispatchError::Closed)?
    }

    /// Run the future produced by `work` on the main thread's executor.
    ///
    /// Always goes through the queue, even from the main thread; the caller
    /// simply awaits until the pump picks the job up on a later tick.
    pub async fn run_on_main_async<T, F, Fut>(&self, work: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Box::new(move |spawner: &LocalSpawner| {
            let future = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(future) => future,
                Err(payload) => {
                    let _ = tx.send(Err(panicked(payload)));
                    return;
                }
            };
            let task = async move {
                let result = AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .map_err(panicked);
                let _ = tx.send(result);
            };
            if let Err(e) = spawner.spawn_local(task) {
                // The task (and its sender) is dropped, the caller sees Closed
                error!("Failed to spawn main-thread task: {}", e);
            }
        }))?;

        rx.await.map_err(|_| DispatchError::Closed)?
    }

    fn enqueue(&self, job: Job) -> Result<(), DispatchError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Closed);
        }
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        self.tx.send(job).map_err(|_| {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            DispatchError::Closed
        })
    }
}

fn panicked(payload: Box<dyn Any + Send>) -> DispatchError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    error!("Main-thread work panicked: {}", message);
    DispatchError::Panicked { message }
}

/// Owned by the main thread. Drains the dispatcher queue once per tick.
pub struct MainThreadPump {
    rx: mpsc::Receiver<Job>,
    stash: VecDeque<Job>,
    pool: LocalPool,
    shared: Arc<Shared>,
    // The pump must stay on the thread that created it
    _not_send: PhantomData<*const ()>,
}

impl MainThreadPump {
    /// Create a pump bound to the current thread, plus its dispatcher handle
    pub fn new() -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            main_thread: thread::current().id(),
            queued: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        ON_MAIN_THREAD.with(|flag| flag.set(true));

        let pump = Self {
            rx,
            stash: VecDeque::new(),
            pool: LocalPool::new(),
            shared: shared.clone(),
            _not_send: PhantomData,
        };
        (pump, Dispatcher { tx, shared })
    }

    /// Run the jobs that were queued when the tick started, then let the
    /// main-thread executor make progress. Returns the number of jobs run.
    ///
    /// Jobs queued while the tick is running wait for the next tick, so a job
    /// that keeps re-dispatching cannot starve the editor's own update.
    pub fn tick(&mut self) -> usize {
        let budget = self.stash.len() + self.shared.queued.load(Ordering::Acquire);
        let spawner = self.pool.spawner();
        let mut ran = 0;

        while ran < budget {
            let job = match self.stash.pop_front() {
                Some(job) => job,
                None => match self.rx.try_recv() {
                    Ok(job) => {
                        self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                        job
                    }
                    Err(_) => break,
                },
            };
            job(&spawner);
            ran += 1;
        }

        self.pool.run_until_stalled();
        if ran > 0 {
            trace!("Main-thread tick ran {} jobs", ran);
        }
        ran
    }

    /// Block the main thread until work arrives or `timeout` elapses
    pub fn park(&mut self, timeout: Duration) {
        if !self.stash.is_empty() {
            return;
        }
        if let Ok(job) = self.rx.recv_timeout(timeout) {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            self.stash.push_back(job);
        }
    }

    /// Stop accepting work. Already queued jobs are dropped with the pump and
    /// their callers see [`DispatchError::Closed`].
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl Drop for MainThreadPump {
    fn drop(&mut self) {
        self.close();
        ON_MAIN_THREAD.with(|flag| flag.set(false));
        debug!("Main-thread pump stopped");
    }
}

/// True on the thread that owns a [`MainThreadPump`]
pub fn is_main_thread() -> bool {
    ON_MAIN_THREAD.with(|flag| flag.get())
}

/// Guard for code that touches the editor API. Panics off the main thread in
/// debug builds.
#[track_caller]
pub fn assert_main_thread() {
    if cfg!(debug_assertions) && !is_main_thread() {
        panic!(
            "editor API called off the main thread (on {:?}); route it through the Dispatcher",
            thread::current().name().unwrap_or("<unnamed>")
        );
    }
}

/// Handle to a main thread started with [`spawn_main_thread`]
pub struct MainThreadHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MainThreadHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Main thread exited by panic");
            }
        }
    }
}

impl Drop for MainThreadHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run a pump on a dedicated OS thread, for embedders whose real main thread
/// is busy elsewhere. `on_tick` runs after every tick, on that thread.
pub fn spawn_main_thread<F>(
    name: &str,
    tick_interval: Duration,
    mut on_tick: F,
) -> std::io::Result<(Dispatcher, MainThreadHandle)>
where
    F: FnMut() + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let thread_stop = stop.clone();

    let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
        let (mut pump, dispatcher) = MainThreadPump::new();
        if ready_tx.send(dispatcher).is_err() {
            return;
        }
        while !thread_stop.load(Ordering::Acquire) {
            pump.tick();
            on_tick();
            pump.park(tick_interval);
        }
        pump.close();
        pump.tick();
    })?;

    let dispatcher = ready_rx.recv().map_err(|_| {
        std::io::Error::other("main thread exited before it was ready")
    })?;

    Ok((
        dispatcher,
        MainThreadHandle {
            stop,
            thread: Some(thread),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_thread() -> (Dispatcher, MainThreadHandle) {
        spawn_main_thread("editor-test", Duration::from_millis(5), || {}).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closures_run_on_the_main_thread() {
        let (dispatcher, _handle) = main_thread();
        let caller = thread::current().id();

        let (observed, flagged) = dispatcher
            .run_on_main(|| (thread::current().id(), is_main_thread()))
            .await
            .unwrap();

        assert_ne!(observed, caller);
        assert!(flagged);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nested_dispatch_does_not_deadlock() {
        let (dispatcher, _handle) = main_thread();
        let inner = dispatcher.clone();

        let value = tokio::time::timeout(
            Duration::from_secs(2),
            dispatcher.run_on_main(move || {
                // Inline on the main thread
                futures::executor::block_on(inner.run_on_main(|| 41)).unwrap() + 1
            }),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_work_stays_on_main_thread() {
        let (dispatcher, _handle) = main_thread();
        let inner = dispatcher.clone();

        let same_thread = dispatcher
            .run_on_main_async(move || async move {
                let before = thread::current().id();
                // Queued from the main thread, answered on a later tick
                let nested = inner.run_on_main_async(|| async { 7 }).await.unwrap();
                (before == thread::current().id(), nested)
            })
            .await
            .unwrap();

        assert_eq!(same_thread, (true, 7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panics_are_reported_not_propagated() {
        let (dispatcher, _handle) = main_thread();

        let err = dispatcher
            .run_on_main(|| -> u32 { panic!("editor exploded") })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::Panicked {
                message: "editor exploded".to_string()
            }
        );

        // The main thread survives
        assert_eq!(dispatcher.run_on_main(|| 5).await.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fifo_order_across_callers() {
        let (dispatcher, _handle) = main_thread();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..50 {
            let order = order.clone();
            dispatcher
                .run_on_main(move || order.lock().push(i))
                .await
                .unwrap();
        }
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stopped_pump_reports_closed() {
        let (dispatcher, handle) = main_thread();
        handle.stop();
        assert_eq!(
            dispatcher.run_on_main(|| ()).await,
            Err(DispatchError::Closed)
        );
    }

    #[test]
    fn test_requeued_work_waits_for_next_tick() {
        let (mut pump, dispatcher) = MainThreadPump::new();
        let inner = dispatcher.clone();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();

        // Called from a helper thread so the outer job goes through the queue
        let caller = thread::spawn(move || {
            futures::executor::block_on(dispatcher.run_on_main_async(move || async move {
                inner.run_on_main_async(|| async {}).await.unwrap();
                flag.store(true, Ordering::SeqCst);
            }))
        });

        pump.park(Duration::from_secs(5));
        assert_eq!(pump.tick(), 1);
        assert!(!done.load(Ordering::SeqCst));

        pump.park(Duration::from_secs(5));
        assert_eq!(pump.tick(), 1);
        assert!(done.load(Ordering::SeqCst));
        caller.join().unwrap().unwrap();
    }

    #[test]
    fn test_guard_panics_off_main_thread() {
        let result = thread::spawn(assert_main_thread).join();
        if cfg!(debug_assertions) {
            assert!(result.is_err());
        }
    }
}
