//! Agents that compose sub-agents: sequential, parallel and loop.

mod loop_agent;
mod parallel;
mod sequential;

use std::sync::Arc;

use strand_core::agent::Agent;

pub use loop_agent::LoopAgent;
pub use parallel::ParallelAgent;
pub use sequential::SequentialAgent;

/// Common construction parameters for workflow agents.
#[derive(Clone, Default)]
pub struct WorkflowConfig {
    pub name: String,
    pub description: String,
    pub sub_agents: Vec<Arc<dyn Agent>>,
}

impl WorkflowConfig {
    pub fn new(name: impl Into<String>, sub_agents: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            sub_agents,
        }
    }
}
