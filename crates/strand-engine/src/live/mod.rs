//! Bidirectional live sessions.

mod flow;
pub mod mock;
mod policy;
mod tasks;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use strand_core::agent::{validate_sub_agents, Agent, AgentKind, EventStream};
use strand_core::context::InvocationContext;
use strand_core::errors::AgentError;
use strand_core::live::LiveConnector;

pub use policy::ReconnectPolicy;

use flow::LiveFlow;

/// Live flow settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub reconnect: ReconnectPolicy,
    /// Bound on joining the sender/receiver pair and closing the connection.
    pub shutdown_timeout_ms: u64,
    /// Capacity of the channel from the sender/receiver pair to the coordinator.
    pub delivery_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            shutdown_timeout_ms: 5000,
            delivery_capacity: 64,
        }
    }
}

impl LiveConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Leaf agent that talks to a model over a persistent live connection.
pub struct LiveAgent {
    name: String,
    description: String,
    connector: Arc<dyn LiveConnector>,
    config: LiveConfig,
}

impl LiveAgent {
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn LiveConnector>,
        config: LiveConfig,
    ) -> Result<Self, AgentError> {
        let name = name.into();
        validate_sub_agents(&name, &[])?;
        if config.reconnect.base_delay_ms > config.reconnect.max_delay_ms {
            return Err(AgentError::Config(format!(
                "{name}: reconnect base delay exceeds max delay"
            )));
        }
        Ok(Self {
            name,
            description: String::new(),
            connector,
            config,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn flow(&self) -> LiveFlow {
        LiveFlow {
            agent_name: self.name.clone(),
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
        }
    }
}

impl Agent for LiveAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Live
    }

    /// A live agent inside a workflow still talks over its live connection,
    /// reading requests from the context's queue.
    fn run(&self, ctx: InvocationContext) -> EventStream {
        self.flow().run(ctx)
    }

    fn run_live(&self, ctx: InvocationContext) -> EventStream {
        self.flow().run(ctx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use strand_core::content::Content;
    use strand_core::context::RunConfig;
    use strand_core::live::{LiveRequestQueue, LiveServerMessage};
    use strand_core::session::Session;

    use super::*;
    use crate::live::mock::{MockConnect, MockConnector, MockScript};
    use crate::testing::{collect, text_agent, texts};
    use crate::workflow::{SequentialAgent, WorkflowConfig};

    #[test]
    fn config_defaults_from_json() {
        let config: LiveConfig =
            serde_json::from_str(r#"{"reconnect": {"max_attempts": 1}}"#).unwrap();
        assert_eq!(config.reconnect.max_attempts, 1);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.delivery_capacity, 64);
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let config = LiveConfig {
            reconnect: ReconnectPolicy {
                base_delay_ms: 10_000,
                max_delay_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = LiveAgent::new("voice", Arc::new(MockConnector::new(vec![])), config);
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn runs_inside_a_sequential_workflow() {
        let connector = Arc::new(MockConnector::new(vec![MockConnect::Accept(
            MockScript::new()
                .message(LiveServerMessage::Content {
                    content: Content::model_text("spoken"),
                    partial: false,
                })
                .end_on_client_close(),
        )]));
        let voice: Arc<dyn Agent> =
            Arc::new(LiveAgent::new("voice", connector.clone(), LiveConfig::default()).unwrap());
        let root = SequentialAgent::new(WorkflowConfig::new(
            "root",
            vec![text_agent("greeter", &["hello"]), voice],
        ))
        .unwrap();

        let queue = LiveRequestQueue::new();
        queue.send_content(Content::user_text("hi"));
        queue.close();
        let ctx = InvocationContext::new(Session::new("app", "u1"), RunConfig::default())
            .with_live_queue(queue);

        let (events, err) = collect(root.run(ctx)).await;
        assert!(err.is_none(), "unexpected error: {err:?}");
        assert_eq!(texts(&events), ["hello", "spoken"]);
        assert_eq!(events[1].author, "voice");
        assert_eq!(connector.connect_calls(), 1);
        assert_eq!(connector.connections()[0].sent().len(), 2);
    }

    #[tokio::test]
    async fn run_without_a_queue_is_a_configuration_error() {
        let connector = Arc::new(MockConnector::new(vec![]));
        let agent = LiveAgent::new("voice", connector.clone(), LiveConfig::default()).unwrap();
        let ctx = InvocationContext::new(Session::new("app", "u1"), RunConfig::default());
        let items: Vec<_> = agent.run(ctx).collect().await;
        assert!(matches!(items.as_slice(), [Err(AgentError::Config(_))]));
        assert_eq!(connector.connect_calls(), 0);
    }
}
