use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use tracing::{debug, warn};

use strand_core::agent::{validate_sub_agents, Agent, AgentKind, EventStream};
use strand_core::context::InvocationContext;
use strand_core::errors::AgentError;

use super::WorkflowConfig;

/// Runs sub-agents one after another, concatenating their sequences.
/// The first terminal error stops the remaining sub-agents.
pub struct SequentialAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
}

impl SequentialAgent {
    pub fn new(config: WorkflowConfig) -> Result<Self, AgentError> {
        validate_sub_agents(&config.name, &config.sub_agents)?;
        Ok(Self {
            name: config.name,
            description: config.description,
            sub_agents: config.sub_agents,
        })
    }
}

impl Agent for SequentialAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Sequential
    }

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &self.sub_agents
    }

    fn run(&self, ctx: InvocationContext) -> EventStream {
        let name = self.name.clone();
        let sub_agents = self.sub_agents.clone();

        Box::pin(stream! {
            for agent in sub_agents {
                if ctx.is_ended() {
                    debug!(agent = %name, "invocation ended; skipping remaining sub-agents");
                    break;
                }
                if ctx.is_cancelled() {
                    yield Err(AgentError::Cancelled);
                    return;
                }

                let mut events = agent.run(ctx.clone());
                while let Some(item) = events.next().await {
                    if let Err(e) = &item {
                        warn!(agent = %name, sub_agent = agent.name(), error = %e, "sub-agent failed");
                    }
                    let terminal = item.is_err();
                    yield item;
                    if terminal {
                        return;
                    }
                }
            }
        })
    }
}
