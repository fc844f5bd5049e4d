use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use strand_core::agent::{find_agent, Agent, EventStream};
use strand_core::content::Content;
use strand_core::context::{InvocationContext, RunConfig};
use strand_core::errors::AgentError;
use strand_core::event::{Event, USER_AUTHOR};
use strand_core::ids::SessionId;
use strand_core::live::LiveRequestQueue;
use strand_core::session::{Session, SessionService};

/// Drives one agent tree against a session store.
///
/// Every non-partial event an agent yields is appended to the session
/// before being handed to the caller.
#[derive(Clone)]
pub struct Runner {
    app_name: String,
    root_agent: Arc<dyn Agent>,
    session_service: Arc<dyn SessionService>,
    shutdown: CancellationToken,
}

enum Mode {
    Run(Content),
    Live(LiveRequestQueue),
}

impl Runner {
    pub fn new(
        app_name: impl Into<String>,
        root_agent: Arc<dyn Agent>,
        session_service: Arc<dyn SessionService>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            root_agent,
            session_service,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn root_agent(&self) -> &Arc<dyn Agent> {
        &self.root_agent
    }

    /// Cancelling this token cancels every invocation started by this runner.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Append `message` as a user event and run the selected agent.
    pub fn run(
        &self,
        user_id: &str,
        session_id: &SessionId,
        message: Content,
        run_config: RunConfig,
    ) -> EventStream {
        self.drive(user_id, session_id, Mode::Run(message), run_config)
    }

    /// Run the selected agent in live mode, reading requests from `queue`.
    pub fn run_live(
        &self,
        user_id: &str,
        session_id: &SessionId,
        queue: LiveRequestQueue,
        run_config: RunConfig,
    ) -> EventStream {
        self.drive(user_id, session_id, Mode::Live(queue), run_config)
    }

    fn drive(
        &self,
        user_id: &str,
        session_id: &SessionId,
        mode: Mode,
        run_config: RunConfig,
    ) -> EventStream {
        let runner = self.clone();
        let user_id = user_id.to_string();
        let session_id = session_id.clone();

        Box::pin(stream! {
            let live = matches!(mode, Mode::Live(_));
            let (ctx, agent) = match runner.prepare(&user_id, &session_id, mode, run_config).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut events = if live {
                agent.run_live(ctx.clone())
            } else {
                agent.run(ctx.clone())
            };
            let mut persisted = 0usize;
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => {
                        if !event.partial {
                            if let Err(e) = runner.session_service.append_event(ctx.session(), &event).await {
                                warn!(session_id = %session_id, error = %e, "failed to persist event");
                                yield Err(e.into());
                                return;
                            }
                            persisted += 1;
                        }
                        yield Ok(event);
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, agent = agent.name(), error = %e, "invocation failed");
                        yield Err(e);
                        return;
                    }
                }
            }
            debug!(session_id = %session_id, invocation_id = %ctx.invocation_id(), persisted, "invocation finished");
        })
    }

    #[instrument(skip(self, mode, run_config), fields(app = %self.app_name, session_id = %session_id))]
    async fn prepare(
        &self,
        user_id: &str,
        session_id: &SessionId,
        mode: Mode,
        run_config: RunConfig,
    ) -> Result<(InvocationContext, Arc<dyn Agent>), AgentError> {
        let session = self
            .session_service
            .get_session(&self.app_name, user_id, session_id)
            .await?;
        let agent = self.select_agent(&session);

        let ctx = InvocationContext::new(session, run_config)
            .with_cancellation(self.shutdown.child_token());
        let ctx = match mode {
            Mode::Run(message) => {
                let event = Event::new(ctx.invocation_id().clone(), USER_AUTHOR)
                    .with_content(message.clone());
                self.session_service.append_event(ctx.session(), &event).await?;
                ctx.with_user_content(message)
            }
            Mode::Live(queue) => ctx.with_live_queue(queue),
        };

        info!(invocation_id = %ctx.invocation_id(), agent = agent.name(), "invocation started");
        Ok((ctx, agent))
    }

    /// The author of the latest non-user event keeps the conversation if it
    /// is still part of the tree; otherwise the root agent runs.
    fn select_agent(&self, session: &Session) -> Arc<dyn Agent> {
        session
            .events
            .iter()
            .rev()
            .find(|e| e.author != USER_AUTHOR)
            .and_then(|e| find_agent(&self.root_agent, &e.author))
            .unwrap_or_else(|| Arc::clone(&self.root_agent))
    }
}
