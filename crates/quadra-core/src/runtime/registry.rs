use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::CoreError;
use crate::types::{JobName, JobOptions, QueueName, Schedule};
use crate::JobHandler;

/// Immutable binding of a job name to its handler, queue, options, and
/// optional recurring schedule. Built once at process start, never
/// mutated afterwards.
#[derive(Clone)]
pub struct JobDefinition {
    /// Unique job type name
    pub name: JobName,

    /// Queue the job runs on
    pub queue: QueueName,

    /// Handler invoked per attempt
    pub handler: Arc<dyn JobHandler>,

    /// Execution options copied onto every instance at enqueue time
    pub options: JobOptions,

    /// Recurring schedule, if any
    pub schedule: Option<Schedule>,
}

impl JobDefinition {
    /// Build a definition with default options and no schedule
    pub fn new(name: impl Into<String>, queue: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: JobName::new(name),
            queue: QueueName::new(queue),
            handler,
            options: JobOptions::default(),
            schedule: None,
        }
    }

    /// Replace the execution options
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a recurring schedule
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("options", &self.options)
            .field("schedule", &self.schedule)
            .finish()
    }
}

/// Closed map of job definitions, validated at registration time.
///
/// An explicitly constructed, owned object handed to the manager and
/// the HTTP layer by reference, rather than module-level mutable state.
#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: HashMap<JobName, Arc<JobDefinition>>,
}

impl JobRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition.
    ///
    /// A duplicate name or an invalid schedule is a configuration
    /// error, rejected here rather than discovered at dispatch time.
    pub fn register(&mut self, definition: JobDefinition) -> Result<(), CoreError> {
        if let Some(schedule) = &definition.schedule {
            schedule.validate(&definition.name)?;
        }
        if self.definitions.contains_key(&definition.name) {
            return Err(CoreError::DuplicateJob(definition.name.to_string()));
        }
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Look up a definition by name
    pub fn get(&self, name: &JobName) -> Option<Arc<JobDefinition>> {
        self.definitions.get(name).cloned()
    }

    /// All registered definitions
    pub fn definitions(&self) -> impl Iterator<Item = &Arc<JobDefinition>> {
        self.definitions.values()
    }

    /// Distinct queues referenced by the registered definitions
    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<QueueName> = Vec::new();
        for definition in self.definitions.values() {
            if !queues.contains(&definition.queue) {
                queues.push(definition.queue.clone());
            }
        }
        queues
    }

    /// Number of registered definitions
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether no definitions are registered
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
