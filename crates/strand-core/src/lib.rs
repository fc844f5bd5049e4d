//! Data model and contracts shared by every strand crate: events, the agent
//! trait and its event-sequence contract, the invocation context, live
//! transport traits and the error taxonomy.

pub mod agent;
pub mod content;
pub mod context;
pub mod errors;
pub mod event;
pub mod ids;
pub mod live;
pub mod session;

pub use agent::{Agent, AgentKind, EventStream};
pub use context::{InvocationContext, RunConfig};
pub use errors::{AgentError, FaultClass, LiveError, SessionError};
pub use event::{Event, EventActions};
