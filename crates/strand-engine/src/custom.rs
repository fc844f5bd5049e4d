use std::sync::Arc;

use strand_core::agent::{validate_sub_agents, Agent, AgentKind, EventStream};
use strand_core::context::InvocationContext;
use strand_core::errors::AgentError;

type RunFn = dyn Fn(InvocationContext) -> EventStream + Send + Sync;

/// Leaf agent whose behavior is a closure producing its event sequence.
pub struct FnAgent {
    name: String,
    description: String,
    run: Arc<RunFn>,
}

impl FnAgent {
    pub fn new<F>(name: impl Into<String>, run: F) -> Result<Self, AgentError>
    where
        F: Fn(InvocationContext) -> EventStream + Send + Sync + 'static,
    {
        let name = name.into();
        validate_sub_agents(&name, &[])?;
        Ok(Self {
            name,
            description: String::new(),
            run: Arc::new(run),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl Agent for FnAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Custom
    }

    fn run(&self, ctx: InvocationContext) -> EventStream {
        (self.run)(ctx)
    }
}
