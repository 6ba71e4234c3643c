//! Panic isolation for worker threads.
//!
//! A worker's whole dispatch loop runs under [`spawn`]. A panic escaping any
//! job is caught once, logged with a stack trace, and handed to the
//! [`FatalHandler`] the pool was built with. The default handler,
//! [`ExitProcess`], takes the whole process down: a worker that silently
//! died would shrink the pool with nobody noticing.

use slog::Logger;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::{Arc, Mutex, Once, PoisonError};
use std::thread::{self, JoinHandle};

thread_local! {
    // set only on threads started by `spawn`
    static GUARDED: Cell<bool> = Cell::new(false);
    // stack of the last panic on this thread, taken while it still unwinds
    static PANIC_TRACE: RefCell<Option<Backtrace>> = RefCell::new(None);
}

static TRACE_HOOK: Once = Once::new();

/// Chains a panic hook that records the panicking stack on guarded threads.
/// Once unwinding reaches `catch_unwind` the frames of the job are gone.
fn install_trace_hook() {
    TRACE_HOOK.call_once(|| {
        let previous = panic::take_hook();
        #[allow(deprecated)]
        panic::set_hook(Box::new(move |info: &panic::PanicInfo<'_>| {
            if GUARDED.with(Cell::get) {
                let trace = Backtrace::force_capture();
                PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Backtrace {
    PANIC_TRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(Backtrace::force_capture)
}

/// Receives the report of a worker that panicked.
pub trait FatalHandler: Send + Sync {
    fn report_fatal(&self, report: &FatalReport);
}

#[derive(Debug, Clone)]
pub struct FatalReport {
    worker: String,
    message: String,
    backtrace: String,
}

impl FatalReport {
    fn new(worker: String, payload: &(dyn Any + Send), backtrace: Backtrace) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        FatalReport {
            worker,
            message,
            backtrace: backtrace.to_string(),
        }
    }

    /// Name of the worker thread that panicked.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn backtrace(&self) -> &str {
        &self.backtrace
    }
}

impl fmt::Display for FatalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {} panicked: {}\n{}",
            self.worker, self.message, self.backtrace
        )
    }
}

/// Writes the report to stderr and exits with status 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitProcess;

impl FatalHandler for ExitProcess {
    fn report_fatal(&self, report: &FatalReport) {
        // async log drains are not flushed by process::exit
        eprintln!("{}", report);
        process::exit(1);
    }
}

/// Keeps reports in memory and lets the panicked worker end.
#[derive(Debug, Default)]
pub struct RecordFatal {
    reports: Mutex<Vec<FatalReport>>,
}

impl RecordFatal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<FatalReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FatalHandler for RecordFatal {
    fn report_fatal(&self, report: &FatalReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    }
}

/// Spawns a named thread running `body` under the panic guard.
pub(crate) fn spawn<F>(
    name: String,
    stack_size: Option<usize>,
    logger: Logger,
    handler: Arc<dyn FatalHandler>,
    body: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    install_trace_hook();

    let mut builder = thread::Builder::new().name(name.clone());
    if let Some(size) = stack_size {
        builder = builder.stack_size(size);
    }

    builder.spawn(move || {
        GUARDED.with(|guarded| guarded.set(true));
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
            let report = FatalReport::new(name, payload.as_ref(), take_panic_trace());
            crit!(logger, "worker panicked";
                "panic" => report.message(),
                "backtrace" => report.backtrace()
            );
            handler.report_fatal(&report);
        }
    })
}
