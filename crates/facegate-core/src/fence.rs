//! Session fencing for asynchronous camera work.
//!
//! Every camera start, stop, capture and retake advances the fence. Work
//! that was started under an older token must be dropped on completion
//! without touching any state.

use serde::Serialize;

/// Identifier of the camera session a piece of async work belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionToken(u64);

impl SessionToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Monotonic session counter.
#[derive(Debug, Default)]
pub struct SessionFence {
    current: u64,
}

impl SessionFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate all outstanding tokens and return the new current one.
    pub fn advance(&mut self) -> SessionToken {
        self.current += 1;
        SessionToken(self.current)
    }

    pub fn current(&self) -> SessionToken {
        SessionToken(self.current)
    }

    pub fn is_current(&self, token: SessionToken) -> bool {
        token.0 == self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_invalidates_previous() {
        let mut fence = SessionFence::new();
        let a = fence.advance();
        assert!(fence.is_current(a));
        let b = fence.advance();
        assert!(!fence.is_current(a));
        assert!(fence.is_current(b));
        assert!(b > a);
    }

    #[test]
    fn test_current_matches_last_advance() {
        let mut fence = SessionFence::new();
        assert_eq!(fence.current().value(), 0);
        let t = fence.advance();
        assert_eq!(fence.current(), t);
        assert_eq!(t.value(), 1);
    }
}
