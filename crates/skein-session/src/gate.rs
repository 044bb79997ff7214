//! The global exclusive-execution slot.
//!
//! Deployments that share one model backend across tenants can only
//! afford one in-flight query; the gate is that single slot. Occupied
//! means a hard rejection for everyone else, never a queue.

use parking_lot::Mutex;

/// A single execution slot shared by every session on the server.
#[derive(Debug, Default)]
pub struct ExclusiveGate {
    holder: Mutex<Option<String>>,
}

impl ExclusiveGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a session. Re-entrant for the current holder.
    pub fn try_acquire(&self, session_id: &str) -> bool {
        let mut holder = self.holder.lock();
        match holder.as_deref() {
            None => {
                *holder = Some(session_id.to_string());
                true
            }
            Some(current) => current == session_id,
        }
    }

    /// Release the slot. Only the holder can release it; anyone else's
    /// release is a no-op.
    pub fn release(&self, session_id: &str) -> bool {
        let mut holder = self.holder.lock();
        if holder.as_deref() == Some(session_id) {
            *holder = None;
            true
        } else {
            false
        }
    }

    /// The current holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_holder() {
        let gate = ExclusiveGate::new();
        assert!(gate.try_acquire("a"));
        assert!(!gate.try_acquire("b"));
        assert_eq!(gate.holder().as_deref(), Some("a"));
    }

    #[test]
    fn test_reentrant_for_holder() {
        let gate = ExclusiveGate::new();
        assert!(gate.try_acquire("a"));
        assert!(gate.try_acquire("a"));
    }

    #[test]
    fn test_release_is_holder_checked() {
        let gate = ExclusiveGate::new();
        assert!(gate.try_acquire("a"));
        assert!(!gate.release("b"));
        assert_eq!(gate.holder().as_deref(), Some("a"));

        assert!(gate.release("a"));
        assert!(gate.holder().is_none());
        assert!(gate.try_acquire("b"));
    }

    #[test]
    fn test_release_without_holder() {
        let gate = ExclusiveGate::new();
        assert!(!gate.release("a"));
    }
}
