//! Cooperative cancellation for the generation loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable handle to a shared stop flag.
///
/// The generation loop polls it between engine calls; an in-flight decode
/// always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, stop: bool) {
        self.0.store(stop, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.set(true);
    }

    pub fn reset(&self) {
        self.set(false);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
