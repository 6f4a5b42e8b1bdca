//! Runtime layer: registry, dispatch, workers, scheduling, lifecycle.

pub mod dispatcher;
pub mod flow_tracker;
pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod worker;
