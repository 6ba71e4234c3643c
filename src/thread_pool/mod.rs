use crate::error::Result;
use std::fmt;

pub mod guard;
mod pool;
mod settings;

pub use guard::{ExitProcess, FatalHandler, FatalReport, RecordFatal};
pub use pool::{PoolState, RoutinePool};
pub use settings::Settings;

/// Outcome of a submitted job. An `Err` is logged by the worker that ran it
/// and never reaches the submitter.
pub type TaskResult = std::result::Result<(), failure::Error>;

pub trait ThreadPool {
    fn new(size: usize) -> Result<Self>
    where
        Self: Sized;

    /// Blocks until an idle worker takes the job.
    fn submit<F>(&self, job: F) -> Result<()>
    where
        // since function works in a thread, it must have static lifetime
        F: Send + FnOnce() -> TaskResult + 'static;

    /// Sends one terminate signal per worker, then closes the pool.
    fn shutdown(&self) -> Result<()>;
}

pub type Job = Box<dyn Send + FnOnce() -> TaskResult + 'static>;

/// What travels through the hand-off channel. Each message is taken by
/// exactly one worker.
pub enum Message {
    Work(Job),
    Terminate,
}

impl Message {
    pub fn work<F>(job: F) -> Self
    where
        F: Send + FnOnce() -> TaskResult + 'static,
    {
        Message::Work(Box::new(job))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Work(_) => f.write_str("Work(..)"),
            Message::Terminate => f.write_str("Terminate"),
        }
    }
}
