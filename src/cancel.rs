//! Cooperative cancellation shared between the interrupt handler, the process
//! executor, and the pipeline controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{BuildError, Result};

/// Cloneable cancellation flag.
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

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BuildError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Route SIGINT/SIGTERM into this token.
    ///
    /// The handler only flips the flag; in-flight tools are killed by the
    /// executor and mounts are released by the controller's teardown path.
    pub fn install_interrupt_handler(&self) -> std::result::Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            if token.is_cancelled() {
                tracing::warn!("second interrupt received; teardown is still in progress");
            } else {
                tracing::warn!("interrupt received; cancelling build");
            }
            token.cancel();
        })
    }
}
