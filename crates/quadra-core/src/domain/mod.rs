//! Domain layer: job/flow model, events, and the persistence contract.

pub mod events;
pub mod flow;
pub mod job;
pub mod queue;
