//! Cooperative cancellation
//!
//! One token per job, checked at every suspension point and between parse
//! batches. Cloning shares the flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("canceled")]
pub struct Canceled;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Checkpoint: `Err(Canceled)` once [`cancel`](Self::cancel) was called.
    pub fn ensure_active(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_trips_once_canceled() {
        let token = CancelToken::new();
        assert!(token.ensure_active().is_ok());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_canceled());
        assert_eq!(token.ensure_active(), Err(Canceled));
    }
}
