//! Default terminal logger.

use slog::{Drain, Logger};

/// Full-format terminal output behind an async drain, tagged with the crate
/// version.
pub fn terminal() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
}
