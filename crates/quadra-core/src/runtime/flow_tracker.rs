use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::queue::QueueBackend;
use crate::error::CoreError;
use crate::types::{JobId, JobState};

/// Event-driven flow completion bookkeeping.
///
/// Keeps a pending-children counter per parent id. Dispatching a flow
/// registers the parent with its child count; every child-terminal
/// transition decrements; at zero the parent is promoted out of
/// `WaitingChildren`. No queue scans.
///
/// Counters are signed so a child that goes terminal before its flow
/// registration lands (the enqueue/register window) is not lost: the
/// counter goes negative and registration settles it. A provisional
/// negative counter is only created while the parent is still barred
/// on its children; terminals for settled flows (a child re-run from
/// the board after the flow finished) are ignored so the map cannot
/// accumulate dead entries.
#[derive(Debug)]
pub struct FlowTracker {
    pending: Mutex<HashMap<JobId, i64>>,
    backend: Arc<dyn QueueBackend>,
}

impl FlowTracker {
    /// Create a tracker over the given backend
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            backend,
        }
    }

    /// Register a freshly dispatched flow. A flow with no children has
    /// no barrier and the parent is promoted immediately.
    pub async fn register(&self, parent_id: &JobId, children: usize) -> Result<(), CoreError> {
        let remaining = {
            let mut pending = self.pending.lock().await;
            let entry = pending.entry(parent_id.clone()).or_insert(0);
            *entry += children as i64;
            let remaining = *entry;
            if remaining <= 0 {
                pending.remove(parent_id);
            }
            remaining
        };

        if remaining <= 0 {
            self.promote(parent_id).await?;
        } else {
            debug!(parent_id = %parent_id, children = remaining, "Flow registered");
        }
        Ok(())
    }

    /// Record that a child of the given parent reached a terminal
    /// state. Success and exhausted failure both lower the barrier; a
    /// failed child must not leave the flow stuck.
    pub async fn child_terminal(&self, parent_id: &JobId) -> Result<(), CoreError> {
        let remaining = match self.decrement_tracked(parent_id).await {
            Some(remaining) => remaining,
            None => {
                // Untracked parent: either the child outran its flow
                // registration, or the flow settled long ago and this
                // is a child re-run from the board. Only a parent
                // still barred on children gets a provisional
                // negative counter for registration to reconcile.
                let parent = self.backend.get_job(parent_id).await?;
                let barred =
                    matches!(parent, Some(job) if job.state == JobState::WaitingChildren);
                if !barred {
                    debug!(parent_id = %parent_id, "Terminal child of a settled flow, ignoring");
                    return Ok(());
                }
                self.decrement_provisional(parent_id).await
            }
        };

        if remaining == 0 {
            self.promote(parent_id).await?;
        } else if remaining > 0 {
            debug!(parent_id = %parent_id, remaining, "Flow child terminal");
        }
        Ok(())
    }

    /// Decrement an existing counter, dropping it at zero. `None` for
    /// an untracked parent.
    async fn decrement_tracked(&self, parent_id: &JobId) -> Option<i64> {
        let mut pending = self.pending.lock().await;
        let entry = pending.get_mut(parent_id)?;
        *entry -= 1;
        let remaining = *entry;
        if remaining == 0 {
            pending.remove(parent_id);
        }
        Some(remaining)
    }

    /// Decrement a parent that was untracked a moment ago, creating
    /// the counter if registration has not raced it in meanwhile.
    async fn decrement_provisional(&self, parent_id: &JobId) -> i64 {
        let mut pending = self.pending.lock().await;
        let entry = pending.entry(parent_id.clone()).or_insert(0);
        *entry -= 1;
        let remaining = *entry;
        if remaining == 0 {
            pending.remove(parent_id);
        }
        remaining
    }

    /// Number of flows currently tracked (for the board / tests)
    pub async fn tracked_flows(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn promote(&self, parent_id: &JobId) -> Result<(), CoreError> {
        debug!(parent_id = %parent_id, "Flow barrier down, promoting parent");
        if let Err(e) = self.backend.promote_parent(parent_id).await {
            warn!(parent_id = %parent_id, error = %e, "Failed to promote flow parent");
            return Err(e);
        }
        Ok(())
    }
}
