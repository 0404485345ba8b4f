//! Error taxonomy for the daemon-side transport (`spec.md` §7).
//!
//! `Error` groups failures by the kind `spec.md` §7 names so callers can
//! decide the right response without re-deriving it from the underlying
//! `io::Error`/`vhost` error: protocol violations are fatal, a too-small
//! guest buffer just recycles the descriptor, a back-channel failure
//! propagates to the session, and transport failures kill the control loop.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed descriptor chain: {0}")]
    ProtocolViolation(String),

    #[error("guest reply buffer too small: need {needed} bytes, have {available}")]
    ReplyBufferTooSmall { needed: usize, available: usize },

    #[error("back-channel request failed: {0}")]
    BackChannel(#[from] BackChannelError),

    #[error("vhost-user transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("more than one request queue configured ({0}); only one is supported")]
    TooManyRequestQueues(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no descriptor available on the notification queue")]
    NoSpace,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A negative back-channel RPC result, sign-extended per `spec.md` §4.B/§7.
#[derive(thiserror::Error, Debug, Copy, Clone)]
#[error("back-channel RPC failed with errno {0}")]
pub struct BackChannelError(pub i32);

impl BackChannelError {
    /// Decode a raw RPC return value: negative means failure (the value is
    /// `-errno`), zero or positive is a success payload (bytes transferred).
    pub fn check(raw: i64) -> std::result::Result<u64, Self> {
        if raw < 0 {
            Err(Self(-raw as i32))
        } else {
            Ok(raw as u64)
        }
    }
}

/// `fv_panic` as a caller-suppliable callback (`spec.md` §9 Design Note),
/// rather than a hardcoded abort, so tests can observe fatal conditions.
pub type PanicHandler = Box<dyn Fn(&str) -> ! + Send + Sync>;

pub fn default_panic_handler() -> PanicHandler {
    Box::new(|msg| {
        log::error!("fatal: {}", msg);
        std::process::exit(1);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_channel_error_sign_extends() {
        assert_eq!(BackChannelError::check(-22).unwrap_err().0, 22);
        assert_eq!(BackChannelError::check(0).unwrap(), 0);
        assert_eq!(BackChannelError::check(4096).unwrap(), 4096);
    }
}
