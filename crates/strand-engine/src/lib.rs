//! Execution engine: workflow agents, live sessions, the runner and an
//! in-memory session service.

pub mod custom;
pub mod live;
pub mod runner;
pub mod session;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use custom::FnAgent;
pub use live::{LiveAgent, LiveConfig, ReconnectPolicy};
pub use runner::Runner;
pub use session::InMemorySessionService;
pub use workflow::{LoopAgent, ParallelAgent, SequentialAgent, WorkflowConfig};
