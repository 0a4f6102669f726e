use async_trait::async_trait;

use aetos_lifecycle::Listing;

use super::{Coordinator, StepOutcome};

/// Coordinator for an integration that does not exist yet. Every attempt
/// reports [`StepOutcome::Pending`].
#[derive(Debug, Clone)]
pub struct PendingCoordinator {
    name: String,
    reason: String,
}

impl PendingCoordinator {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Coordinator for PendingCoordinator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt_step(&self, _listing: &Listing) -> StepOutcome {
        StepOutcome::pending(self.reason.clone())
    }
}
