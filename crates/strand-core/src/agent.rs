use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use futures::{stream, Stream};

use crate::context::InvocationContext;
use crate::errors::AgentError;
use crate::event::Event;

/// Lazy, finite, non-restartable event sequence.
///
/// An `Err` item is terminal: nothing follows it. The consumer may drop the
/// stream at any point; implementations release everything they hold when
/// that happens.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, AgentError>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentKind {
    Custom,
    Sequential,
    Parallel,
    Loop,
    Live,
}

/// A named unit of execution. Built once, reused across invocations, and
/// holds no per-invocation state.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn kind(&self) -> AgentKind;

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &[]
    }

    fn run(&self, ctx: InvocationContext) -> EventStream;

    fn run_live(&self, _ctx: InvocationContext) -> EventStream {
        fail(AgentError::Unsupported {
            agent: self.name().to_string(),
            mode: "live",
        })
    }
}

/// A one-item stream carrying a terminal error.
pub fn fail(err: AgentError) -> EventStream {
    Box::pin(stream::once(async move { Err(err) }))
}

/// Reject empty agent names and duplicate sibling names.
pub fn validate_sub_agents(name: &str, sub_agents: &[Arc<dyn Agent>]) -> Result<(), AgentError> {
    if name.is_empty() {
        return Err(AgentError::Config("agent name must not be empty".into()));
    }
    let mut seen = HashSet::new();
    for sub in sub_agents {
        if sub.name().is_empty() {
            return Err(AgentError::Config(format!("{name}: sub-agent name must not be empty")));
        }
        if !seen.insert(sub.name()) {
            return Err(AgentError::Config(format!(
                "{name}: duplicate sub-agent name {:?}",
                sub.name()
            )));
        }
    }
    Ok(())
}

/// Depth-first lookup by name, including `root` itself.
pub fn find_agent(root: &Arc<dyn Agent>, name: &str) -> Option<Arc<dyn Agent>> {
    if root.name() == name {
        return Some(Arc::clone(root));
    }
    root.sub_agents().iter().find_map(|sub| find_agent(sub, name))
}
