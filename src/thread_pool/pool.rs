use super::{guard, Message, Settings, TaskResult, ThreadPool};
use crate::error::{Error, ErrorKind, Result};
use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::sync::WaitGroup;
use slog::Logger;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting jobs.
    Running,
    /// `shutdown` is handing out terminate signals.
    Draining,
    /// Every terminate signal was sent and the channel is closed.
    Closed,
}

/// A fixed number of workers sharing one zero-capacity channel.
///
/// There is no queue: `submit` returns only once a worker has taken the job,
/// so at most `capacity` jobs are ever in flight and a saturated pool pushes
/// back on its callers.
///
/// # Example
///
/// ```
/// use routine_pool::{RoutinePool, ThreadPool};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let pool = RoutinePool::new(2).unwrap();
/// let counter = Arc::new(AtomicUsize::new(0));
/// for _ in 0..8 {
///     let counter = counter.clone();
///     pool.submit(move || {
///         counter.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     })
///     .unwrap();
/// }
/// pool.shutdown().unwrap();
/// pool.join();
/// assert_eq!(counter.load(Ordering::SeqCst), 8);
/// ```
pub struct RoutinePool {
    capacity: usize,
    // taken and dropped by shutdown, which closes the channel
    sender: RwLock<Option<Sender<Message>>>,
    state: AtomicCell<PoolState>,
    live: Arc<AtomicUsize>,
    exited: Mutex<Option<WaitGroup>>,
    logger: Logger,
}

impl RoutinePool {
    pub fn with_settings(settings: Settings) -> Result<Self> {
        let capacity = settings.capacity();
        if capacity == 0 {
            return Err(Error::from(ErrorKind::InvalidCapacity(capacity)));
        }

        let logger = settings
            .logger()
            .new(o!("pool" => settings.name().to_string()));
        let (sender, receiver) = bounded::<Message>(0);
        let live = Arc::new(AtomicUsize::new(0));
        let exited = WaitGroup::new();
        spawn_workers(&settings, &logger, &sender, receiver, &live, &exited)?;

        info!(logger, "pool started"; "capacity" => capacity);

        Ok(RoutinePool {
            capacity,
            sender: RwLock::new(Some(sender)),
            state: AtomicCell::new(PoolState::Running),
            live,
            exited: Mutex::new(Some(exited)),
            logger,
        })
    }

    /// Hands the job over only if a worker is idle right now, failing with
    /// `PoolBusy` otherwise. A rejected job is dropped.
    pub fn try_submit<F>(&self, job: F) -> Result<()>
    where
        F: Send + FnOnce() -> TaskResult + 'static,
    {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => Ok(sender.try_send(Message::work(job))?),
            None => Err(Error::from(ErrorKind::PoolClosed)),
        }
    }

    /// Blocks until every worker has left its dispatch loop.
    ///
    /// Returns immediately on later calls. Before `shutdown` it waits for
    /// another thread to shut the pool down.
    pub fn join(&self) {
        let mut exited = self.exited.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(exited) = exited.take() {
            exited.wait();
            debug!(self.logger, "all workers exited");
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Workers that have not yet left their dispatch loop.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PoolState {
        self.state.load()
    }
}

impl ThreadPool for RoutinePool {
    fn new(size: usize) -> Result<Self>
    where
        Self: Sized,
    {
        RoutinePool::with_settings(Settings::new(size))
    }

    fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Send + FnOnce() -> TaskResult + 'static,
    {
        // shutdown waits on the write lock for hand-offs already in progress
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => Ok(sender.send(Message::work(job))?),
            None => Err(Error::from(ErrorKind::PoolClosed)),
        }
    }

    fn shutdown(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(PoolState::Running, PoolState::Draining)
            .is_err()
        {
            return Err(Error::from(ErrorKind::AlreadyShutdown));
        }
        debug!(self.logger, "draining pool"; "capacity" => self.capacity);

        let sender = self
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(sender) = sender {
            let mut signalled = 0;
            for _ in 0..self.capacity {
                // each send waits for a worker to take it
                if sender.send(Message::Terminate).is_err() {
                    break;
                }
                signalled += 1;
            }
            if signalled < self.capacity {
                warn!(self.logger, "workers were gone before their terminate signal";
                    "signalled" => signalled,
                    "capacity" => self.capacity
                );
            }
            // dropping the last sender closes the channel
        }

        self.state.store(PoolState::Closed);
        info!(self.logger, "pool shut down");
        Ok(())
    }
}

// terminate threads when pool is dropped without shutdown
impl Drop for RoutinePool {
    fn drop(&mut self) {
        if self.state() == PoolState::Running {
            if let Err(err) = self.shutdown() {
                error!(self.logger, "unable to shut down pool"; "error" => %err);
            }
        }
    }
}

// Starts `capacity` workers. If one cannot be spawned, those already running
// get a terminate signal each and the spawn error is returned.
fn spawn_workers(
    settings: &Settings,
    logger: &Logger,
    sender: &Sender<Message>,
    receiver: Receiver<Message>,
    live: &Arc<AtomicUsize>,
    exited: &WaitGroup,
) -> Result<()> {
    for id in 0..settings.capacity() {
        let worker = Worker {
            receiver: receiver.clone(),
            logger: logger.new(o!("worker" => id)),
            _exit: ExitSignal::new(live.clone(), exited.clone()),
        };
        let spawned = guard::spawn(
            format!("{}-{}", settings.name(), id),
            settings.stack_size(),
            worker.logger.clone(),
            settings.fatal_handler(),
            move || worker.run(),
        );

        if let Err(err) = spawned {
            error!(logger, "unable to spawn worker"; "worker" => id, "error" => %err);
            // the workers spawned so far are idle, one signal each
            for _ in 0..id {
                if sender.send(Message::Terminate).is_err() {
                    break;
                }
            }
            return Err(Error::from(err));
        }
    }
    Ok(())
}

// Marks a worker as gone when dropped, including while unwinding.
struct ExitSignal {
    live: Arc<AtomicUsize>,
    _exited: WaitGroup,
}

impl ExitSignal {
    fn new(live: Arc<AtomicUsize>, exited: WaitGroup) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        ExitSignal {
            live,
            _exited: exited,
        }
    }
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Worker {
    receiver: Receiver<Message>,
    logger: Logger,
    // declared last so the receiver is released before the exit is signalled
    _exit: ExitSignal,
}

impl Worker {
    fn run(self) {
        // the loop also ends if the channel is closed under us
        while let Ok(message) = self.receiver.recv() {
            match message {
                Message::Work(job) => {
                    if let Err(err) = job() {
                        error!(self.logger, "run work failed"; "error" => %err);
                    }
                }
                Message::Terminate => {
                    debug!(self.logger, "worker received terminate signal");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_pool::RecordFatal;
    use crossbeam::channel::unbounded;
    use failure::err_msg;
    use std::thread;
    use std::time::{Duration, Instant};

    fn pool(capacity: usize) -> RoutinePool {
        RoutinePool::with_settings(
            Settings::new(capacity).with_fatal_handler(Arc::new(RecordFatal::new())),
        )
        .unwrap()
    }

    fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = RoutinePool::new(0).err().unwrap();
        assert!(matches!(err.kind(), ErrorKind::InvalidCapacity(0)));
    }

    #[test]
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn spawn_failure_is_an_io_error() {
        let err = RoutinePool::with_settings(Settings::new(3).with_stack_size(usize::MAX))
            .err()
            .unwrap();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
    }

    #[test]
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn failed_spawn_leaves_no_live_workers() {
        let settings = Settings::new(3).with_stack_size(usize::MAX);
        let logger = settings.logger().clone();
        let (sender, receiver) = bounded::<Message>(0);
        let live = Arc::new(AtomicUsize::new(0));
        let exited = WaitGroup::new();

        let result = spawn_workers(&settings, &logger, &sender, receiver, &live, &exited);

        assert!(matches!(result.unwrap_err().kind(), ErrorKind::Io(_)));
        assert_eq!(live.load(Ordering::SeqCst), 0);
        // no worker holds a receiver any more
        assert!(sender.try_send(Message::Terminate).is_err());
        exited.wait();
    }

    #[test]
    fn workers_start_with_the_pool() {
        let pool = pool(4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.live_workers(), 4);
        assert_eq!(pool.state(), PoolState::Running);
    }

    #[test]
    fn immediate_shutdown_stops_every_worker() {
        let pool = pool(3);
        pool.shutdown().unwrap();
        assert_eq!(pool.state(), PoolState::Closed);
        pool.join();
        assert_eq!(pool.live_workers(), 0);
    }

    #[test]
    fn failed_job_does_not_stop_the_worker() {
        let pool = pool(1);
        let (tx, rx) = unbounded();

        pool.submit(|| Err(err_msg("job failed"))).unwrap();
        pool.submit(move || {
            tx.send("ran").unwrap();
            Ok(())
        })
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("ran"));
        assert_eq!(pool.live_workers(), 1);
        pool.shutdown().unwrap();
    }

    #[test]
    fn submit_after_shutdown_is_closed() {
        let pool = pool(2);
        pool.shutdown().unwrap();

        let err = pool.submit(|| Ok(())).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::PoolClosed));
        let err = pool.try_submit(|| Ok(())).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::PoolClosed));
    }

    #[test]
    fn second_shutdown_is_an_error() {
        let pool = pool(2);
        pool.shutdown().unwrap();

        let err = pool.shutdown().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AlreadyShutdown));
    }

    #[test]
    fn try_submit_fails_when_saturated() {
        let pool = pool(1);
        let (gate_tx, gate_rx) = bounded::<()>(0);

        pool.submit(move || {
            gate_rx.recv().unwrap();
            Ok(())
        })
        .unwrap();

        let err = pool.try_submit(|| Ok(())).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::PoolBusy));

        gate_tx.send(()).unwrap();
        // the worker comes back to the channel once its job is done
        assert!(wait_until(|| pool.try_submit(|| Ok(())).is_ok()));
        pool.shutdown().unwrap();
    }

    #[test]
    fn panicking_job_is_reported_and_worker_lost() {
        let recorder = Arc::new(RecordFatal::new());
        let pool = RoutinePool::with_settings(
            Settings::new(2)
                .with_name("panicky")
                .with_fatal_handler(recorder.clone()),
        )
        .unwrap();

        pool.submit(|| panic!("bad job")).unwrap();
        // the exit is signalled while unwinding, before the report is made
        assert!(wait_until(|| recorder.len() == 1));
        assert_eq!(pool.live_workers(), 1);

        let reports = recorder.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message(), "bad job");
        assert!(reports[0].worker().starts_with("panicky-"));

        // the surviving worker still takes its terminate signal
        pool.shutdown().unwrap();
        pool.join();
        assert_eq!(pool.live_workers(), 0);
    }

    #[test]
    fn drop_shuts_the_pool_down() {
        let pool = pool(2);
        let live = pool.live.clone();
        drop(pool);
        assert!(wait_until(|| live.load(Ordering::SeqCst) == 0));
    }
}
