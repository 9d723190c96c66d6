//! Cooperative cancellation.
//!
//! A [`CancelToken`] is threaded through every attack run and checked at the
//! safe points only (iteration boundaries, around expensive steps). There is
//! no preemption: a cancellation request is honored at the *next* safe point,
//! never mid-step.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{CloakError, Result};

/// A cloneable flag that requests cooperative cancellation of a running task.
///
/// All clones observe the same flag. Cancellation is one-way: once set, the
/// token stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The running task will stop at its next safe
    /// point and surface [`CloakError::Cancelled`].
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Returns whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Returns `Err(CloakError::Cancelled)` if cancellation was requested.
    ///
    /// This is the check performed at every safe point.
    pub fn bail_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CloakError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
        assert!(matches!(
            b.bail_if_cancelled(),
            Err(CloakError::Cancelled)
        ));
    }
}
