//! Pool settings

use super::guard::{ExitProcess, FatalHandler};
use slog::{Discard, Logger};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

/// Everything a pool needs at construction. The logger and the fatal handler
/// scope how workers report failures; neither can stop a running job.
#[derive(Clone)]
pub struct Settings {
    capacity: usize,
    name: String,
    stack_size: Option<usize>,
    logger: Logger,
    fatal_handler: Arc<dyn FatalHandler>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            capacity: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            name: "routine-pool".to_string(),
            stack_size: None,
            logger: Logger::root(Discard, o!()),
            fatal_handler: Arc::new(ExitProcess),
        }
    }
}

impl Settings {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Prefix of the worker thread names, also attached to every log record.
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_fatal_handler(mut self, handler: Arc<dyn FatalHandler>) -> Self {
        self.fatal_handler = handler;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn fatal_handler(&self) -> Arc<dyn FatalHandler> {
        self.fatal_handler.clone()
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("capacity", &self.capacity)
            .field("name", &self.name)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}
