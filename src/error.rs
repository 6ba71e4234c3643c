use crossbeam::channel::{SendError, TrySendError};
use failure::{Backtrace, Context, Fail};
use std::fmt::Display;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "{}", _0)]
    Io(#[cause] io::Error),

    #[fail(display = "pool capacity must be positive, got {}", _0)]
    InvalidCapacity(usize),

    #[fail(display = "pool is closed")]
    PoolClosed,

    #[fail(display = "no idle worker to receive the job")]
    PoolBusy,

    #[fail(display = "pool is already shut down")]
    AlreadyShutdown,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            inner: Context::new(ErrorKind::Io(err)),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(err: ErrorKind) -> Self {
        Error {
            inner: Context::new(err),
        }
    }
}

// every receiver is gone, so no worker is left to take the message
impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Error::from(ErrorKind::PoolClosed)
    }
}

impl<T> From<TrySendError<T>> for Error {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => Error::from(ErrorKind::PoolBusy),
            TrySendError::Disconnected(_) => Error::from(ErrorKind::PoolClosed),
        }
    }
}
