//! Process-wide stop signal
//!
//! One flag shared by the signal handler, the stream session and the
//! supervisor. Raising it lets the current session wind down at its next
//! wakeup and prevents any further reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle to a shared abort flag.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Cannot be undone.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let flag = AbortFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_raised());
        flag.raise();
        assert!(observer.is_raised());
    }
}
