//! Per-call request context
//!
//! Carries the task nesting level and the lock-holder identity explicitly
//! through call chains instead of keeping them in thread-local state, so they
//! stay correct when work hops between tasks, pools and nodes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    level: u32,
    holder: Uuid,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// Top-level context: level 0, fresh holder identity
    pub fn new() -> Self {
        Self {
            level: 0,
            holder: Uuid::new_v4(),
        }
    }

    /// Context for work submitted from within work running under `self`
    pub fn child(&self) -> Self {
        Self {
            level: self.level.saturating_add(1),
            holder: Uuid::new_v4(),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn holder(&self) -> Uuid {
        self.holder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_increments_level_and_changes_holder() {
        let root = RequestContext::new();
        let child = root.child();
        assert_eq!(root.level(), 0);
        assert_eq!(child.level(), 1);
        assert_ne!(root.holder(), child.holder());
        assert_eq!(child.child().level(), 2);
    }
}
