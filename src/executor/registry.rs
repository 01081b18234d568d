// Per-agent single-flight run slots
//
// In-memory only: a non-durable cache that prevents double-dispatch
// within one executor instance. The persisted command status remains the
// source of truth; a crash mid-run leaves a `running` command with no
// in-memory owner, which an external reconciliation sweep has to repair.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
pub struct RunRegistry {
    active: Mutex<HashSet<String>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot for an agent. Returns false if a run is
    /// already active for it.
    pub fn try_acquire(&self, agent_id: &str) -> bool {
        let mut active = self.active.lock().unwrap();
        active.insert(agent_id.to_string())
    }

    /// Release the run slot. Safe to call for an agent without one.
    pub fn release(&self, agent_id: &str) {
        let mut active = self.active.lock().unwrap();
        active.remove(agent_id);
    }

    pub fn is_active(&self, agent_id: &str) -> bool {
        let active = self.active.lock().unwrap();
        active.contains(agent_id)
    }

    pub fn active_count(&self) -> usize {
        let active = self.active.lock().unwrap();
        active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_exclusive_per_agent() {
        let registry = RunRegistry::new();
        assert!(registry.try_acquire("main"));
        assert!(!registry.try_acquire("main"));
        // Different agents do not contend
        assert!(registry.try_acquire("research"));
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_release_frees_slot() {
        let registry = RunRegistry::new();
        assert!(registry.try_acquire("main"));
        registry.release("main");
        assert!(!registry.is_active("main"));
        assert!(registry.try_acquire("main"));
    }

    #[test]
    fn test_release_without_acquire_is_noop() {
        let registry = RunRegistry::new();
        registry.release("main");
        assert_eq!(registry.active_count(), 0);
    }
}
