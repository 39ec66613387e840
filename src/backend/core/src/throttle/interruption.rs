//! Sources of the "process is stopping" signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Reports whether the hosting process has asked running jobs to stop.
///
/// Polled between steps only; a step in progress is never cancelled.
pub trait InterruptionAdapter: Send + Sync {
    fn interrupted(&self) -> bool;
}

/// An adapter that never reports a stop request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverInterrupt;

impl InterruptionAdapter for NeverInterrupt {
    fn interrupted(&self) -> bool {
        false
    }
}

impl InterruptionAdapter for watch::Receiver<bool> {
    fn interrupted(&self) -> bool {
        *self.borrow()
    }
}

impl InterruptionAdapter for Arc<AtomicBool> {
    fn interrupted(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

impl InterruptionAdapter for AtomicBool {
    fn interrupted(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_receiver() {
        let (tx, rx) = watch::channel(false);
        assert!(!rx.interrupted());
        tx.send(true).unwrap();
        assert!(rx.interrupted());
    }

    #[test]
    fn test_never_interrupt() {
        assert!(!NeverInterrupt.interrupted());
    }
}
