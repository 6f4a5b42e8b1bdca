use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{JobId, JobName, QueueName};

/// Transient description of a fan-out flow: one parent job plus a set
/// of children whose collective terminal state gates the parent.
///
/// A flow is not a standing entity. Dispatching one produces a parent
/// `JobInstance` in `WaitingChildren` and N child instances linked by
/// `parent_id`; after that only the instances exist.
#[derive(Debug, Clone)]
pub struct FlowSpec {
    /// Registered name of the parent job
    pub name: JobName,

    /// Queue the parent runs on
    pub queue: QueueName,

    /// Parent handler input
    pub parent_payload: Value,

    /// Children, each a registered job type with its own payload
    pub children: Vec<ChildSpec>,
}

/// One child of a flow
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Registered name of the child job
    pub name: JobName,

    /// Child handler input
    pub payload: Value,
}

impl FlowSpec {
    /// Build a flow with no children yet
    pub fn new(name: JobName, queue: QueueName, parent_payload: Value) -> Self {
        Self {
            name,
            queue,
            parent_payload,
            children: Vec::new(),
        }
    }

    /// Append a child
    pub fn with_child(mut self, name: JobName, payload: Value) -> Self {
        self.children.push(ChildSpec { name, payload });
        self
    }
}

/// Ids produced by dispatching a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowHandle {
    /// Parent job id
    pub parent_id: JobId,

    /// Child job ids, in the order of the spec
    pub child_ids: Vec<JobId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flow_spec_builder() {
        let spec = FlowSpec::new(
            JobName::new("enrollments:sync"),
            QueueName::new("sync"),
            json!({"season": "2024:3"}),
        )
        .with_child(
            JobName::new("enrollments:sync:student"),
            json!({"student_id": "a1"}),
        )
        .with_child(
            JobName::new("enrollments:sync:student"),
            json!({"student_id": "a2"}),
        );

        assert_eq!(spec.children.len(), 2);
        assert_eq!(spec.children[1].payload["student_id"], "a2");
    }
}
