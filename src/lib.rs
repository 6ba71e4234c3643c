//! A bounded worker pool built on a rendezvous channel.
//!
//! Jobs are handed straight to an idle worker; nothing is queued. Shutting
//! down sends one terminate signal per worker through the same channel. A
//! job that returns an error is logged and forgotten; a job that panics is
//! treated as fatal, see [`thread_pool::guard`].

#[macro_use]
extern crate slog;

pub mod error;
pub mod logger;
pub mod thread_pool;

pub use error::{Error, ErrorKind, Result};
pub use thread_pool::{
    ExitProcess, FatalHandler, FatalReport, PoolState, RecordFatal, RoutinePool, Settings,
    TaskResult, ThreadPool,
};
