use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type TransferResult<T> = Result<T, TransferError>;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum TransferError {
    /// The fabric cannot make progress right now; retry on a later loop.
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ErrorType {
    MalformedVector,
    MalformedProgress,
    TruncatedVector,
    TooManyVectors,
    UnexpectedCompletion,
    MissingPost,
    ContextMismatch,
    PoolExhausted,
    UnknownPeer,
    UnknownKey,
    RegionBounds,
    EndpointClosed,
    AddressInUse,
    PartialWrite,
    InitialMismatch,
    Interrupted,
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for TransferResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(TransferError::Wait) => false,
            _ => true,
        }
    }
}

/// Outcome of one turn of a connection or session loop.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum LoopCtl {
    Continue,
    End,
    Error,
    Canceled,
}

/// Cooperative cancellation flag shared by the drivers, the accept path and
/// every worker. The binaries trip it from their signal handlers; tests trip
/// it directly.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[inline]
    pub fn new() -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_is_not_failure() {
        let wait: TransferResult<()> = Err(TransferError::Wait);
        let fatal: TransferResult<()> = Err(TransferError::Fatal(ErrorType::UnknownPeer));
        let ok: TransferResult<()> = Ok(());

        assert!(!wait.has_failed());
        assert!(fatal.has_failed());
        assert!(!ok.has_failed());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();

        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
