use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use tracing::{debug, warn};

use strand_core::agent::{validate_sub_agents, Agent, AgentKind, EventStream};
use strand_core::context::InvocationContext;
use strand_core::errors::AgentError;

use super::WorkflowConfig;

/// Repeats a sequential pass over its sub-agents.
///
/// Stops after `max_iterations` passes (zero means unbounded), after
/// yielding an event whose actions escalate, or once the invocation is
/// ended. A sub-agent error ends the loop with that error.
pub struct LoopAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
    max_iterations: u32,
}

impl LoopAgent {
    pub fn new(config: WorkflowConfig, max_iterations: u32) -> Result<Self, AgentError> {
        validate_sub_agents(&config.name, &config.sub_agents)?;
        Ok(Self {
            name: config.name,
            description: config.description,
            sub_agents: config.sub_agents,
            max_iterations,
        })
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }
}

impl Agent for LoopAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Loop
    }

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &self.sub_agents
    }

    fn run(&self, ctx: InvocationContext) -> EventStream {
        let name = self.name.clone();
        let sub_agents = self.sub_agents.clone();
        let max_iterations = self.max_iterations;

        Box::pin(stream! {
            if sub_agents.is_empty() {
                return;
            }
            let mut iteration: u32 = 0;
            'passes: while max_iterations == 0 || iteration < max_iterations {
                for agent in &sub_agents {
                    if ctx.is_ended() {
                        debug!(agent = %name, iteration, "invocation ended; leaving loop");
                        break 'passes;
                    }
                    if ctx.is_cancelled() {
                        yield Err(AgentError::Cancelled);
                        return;
                    }

                    let mut events = agent.run(ctx.clone());
                    while let Some(item) = events.next().await {
                        match item {
                            Ok(event) => {
                                let escalate = event.escalates();
                                yield Ok(event);
                                if escalate {
                                    debug!(agent = %name, iteration, sub_agent = agent.name(), "escalated; leaving loop");
                                    break 'passes;
                                }
                            }
                            Err(e) => {
                                warn!(agent = %name, iteration, sub_agent = agent.name(), error = %e, "sub-agent failed");
                                yield Err(e);
                                return;
                            }
                        }
                    }
                }
                iteration += 1;
            }
        })
    }
}
