//! Coordinator for one live invocation.
//!
//! The generator body in [`LiveFlow::run`] is the coordinating task: it is
//! the only code that yields to the consumer. The sender and receiver tasks
//! of the active connection report to it through one bounded channel.
//!
//! ```text
//! Connecting -> Active -> Draining -> Reconnecting -> Connecting
//!      |                      |------> Closed
//!      |                      `------> Failed
//!      `---> Reconnecting (connect failure)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use strand_core::agent::EventStream;
use strand_core::context::InvocationContext;
use strand_core::errors::{AgentError, LiveError};
use strand_core::event::Event;
use strand_core::live::{LiveConnection, LiveConnector};

use super::policy::{ReconnectBudget, Recovery};
use super::tasks::{run_receiver, run_sender, EventFactory, Outbox, Signal};
use super::LiveConfig;

pub(crate) struct LiveFlow {
    pub(crate) agent_name: String,
    pub(crate) connector: Arc<dyn LiveConnector>,
    pub(crate) config: LiveConfig,
}

enum LiveState {
    Connecting,
    Active(ActiveSession),
    Draining(ActiveSession, Outcome),
    Reconnecting(Cause),
    Closed,
    Failed(AgentError),
}

/// Why an active connection ended.
enum Outcome {
    InboundClosed,
    ClientClosed,
    Fault(LiveError),
    Cancelled,
}

/// Why a reconnect is being considered.
enum Cause {
    PeerClosed,
    Fault(LiveError),
}

enum Step {
    Deliver(Event),
    Continue,
    Done(Outcome),
}

impl LiveFlow {
    pub(crate) fn run(self, ctx: InvocationContext) -> EventStream {
        Box::pin(stream! {
            let mut coordinator = match Coordinator::new(self, ctx) {
                Ok(coordinator) => coordinator,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut state = LiveState::Connecting;
            loop {
                state = match state {
                    LiveState::Connecting => coordinator.connect().await,
                    LiveState::Active(mut session) => {
                        let outcome = loop {
                            match coordinator.next_step(&mut session).await {
                                Step::Deliver(event) => yield Ok(event),
                                Step::Continue => {}
                                Step::Done(outcome) => break outcome,
                            }
                        };
                        LiveState::Draining(session, outcome)
                    }
                    LiveState::Draining(session, outcome) => coordinator.drain(session, outcome).await,
                    LiveState::Reconnecting(cause) => coordinator.reconnect(cause).await,
                    LiveState::Closed => {
                        coordinator.finish("closed");
                        break;
                    }
                    LiveState::Failed(err) => {
                        coordinator.finish("failed");
                        yield Err(err);
                        break;
                    }
                };
            }
        })
    }
}

struct Coordinator {
    ctx: InvocationContext,
    connector: Arc<dyn LiveConnector>,
    config: LiveConfig,
    budget: ReconnectBudget,
    outbox: Arc<Outbox>,
    factory: EventFactory,
}

impl Coordinator {
    fn new(flow: LiveFlow, ctx: InvocationContext) -> Result<Self, AgentError> {
        let queue = ctx
            .live_request_queue()
            .ok_or_else(|| {
                AgentError::Config(format!(
                    "{}: live invocation has no request queue",
                    flow.agent_name
                ))
            })?
            .take_receiver()
            .ok_or_else(|| {
                AgentError::Config(format!(
                    "{}: live request queue is already being consumed",
                    flow.agent_name
                ))
            })?;

        let factory = EventFactory {
            invocation_id: ctx.invocation_id().clone(),
            author: flow.agent_name,
            branch: ctx.branch().map(String::from),
        };

        Ok(Self {
            budget: ReconnectBudget::new(flow.config.reconnect.clone()),
            ctx,
            connector: flow.connector,
            config: flow.config,
            outbox: Arc::new(Outbox::new(queue)),
            factory,
        })
    }

    #[instrument(skip_all, fields(agent = %self.factory.author, invocation_id = %self.factory.invocation_id))]
    async fn connect(&mut self) -> LiveState {
        let handle = if self.ctx.run_config().session_resumption {
            self.ctx.resumption_handle()
        } else {
            None
        };
        debug!(resuming = handle.is_some(), "opening live connection");

        let cancel = self.ctx.cancellation().clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return LiveState::Failed(AgentError::Cancelled),
            result = self.connector.connect(self.ctx.run_config(), handle.as_ref()) => result,
        };

        match result {
            Ok(conn) => LiveState::Active(self.activate(conn)),
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "live connect failed");
                LiveState::Reconnecting(Cause::Fault(e))
            }
        }
    }

    fn activate(&mut self, conn: Arc<dyn LiveConnection>) -> ActiveSession {
        let stop = self.ctx.cancellation().child_token();
        let (tx, rx) = mpsc::channel(self.config.delivery_capacity.max(1));

        let sender = tokio::spawn(run_sender(
            Arc::clone(&conn),
            Arc::clone(&self.outbox),
            tx.clone(),
            stop.clone(),
        ));
        let receiver = tokio::spawn(run_receiver(
            Arc::clone(&conn),
            self.factory.clone(),
            tx,
            stop.clone(),
        ));
        info!(agent = %self.factory.author, "live connection active");

        ActiveSession {
            conn: Some(conn),
            stop,
            sender: Some(sender),
            receiver: Some(receiver),
            signals: rx,
            shutdown_timeout: self.config.shutdown_timeout(),
            delivered: false,
            client_closed: false,
            linger_until: None,
        }
    }

    async fn next_step(&mut self, session: &mut ActiveSession) -> Step {
        let cancel = self.ctx.cancellation().clone();
        let linger = session.linger_until;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Done(Outcome::Cancelled),
            _ = sleep_until(linger.unwrap_or_else(Instant::now)), if linger.is_some() => {
                debug!("peer kept the connection open after client close");
                Step::Done(Outcome::ClientClosed)
            }
            signal = session.signals.recv() => self.on_signal(session, signal),
        }
    }

    fn on_signal(&mut self, session: &mut ActiveSession, signal: Option<Signal>) -> Step {
        match signal {
            Some(Signal::Event(event)) => {
                session.delivered = true;
                Step::Deliver(event)
            }
            Some(Signal::Resumption { handle, resumable }) => {
                session.delivered = true;
                if resumable {
                    if let Some(handle) = handle {
                        debug!("resumption handle updated");
                        self.ctx.set_resumption_handle(Some(handle));
                    }
                }
                Step::Continue
            }
            Some(Signal::GoAway { time_left_ms }) => {
                info!(?time_left_ms, "peer announced disconnect");
                Step::Continue
            }
            Some(Signal::ClientClosed) => {
                session.client_closed = true;
                session.linger_until = Some(Instant::now() + self.config.shutdown_timeout());
                Step::Continue
            }
            Some(Signal::ReceiveFailed(e)) | Some(Signal::SendFailed(e)) => {
                Step::Done(Outcome::Fault(e))
            }
            Some(Signal::Closed) | None => Step::Done(Outcome::InboundClosed),
        }
    }

    #[instrument(skip_all, fields(agent = %self.factory.author, invocation_id = %self.factory.invocation_id))]
    async fn drain(&mut self, mut session: ActiveSession, outcome: Outcome) -> LiveState {
        let sender_closed = session.shutdown().await;

        if session.delivered {
            self.budget.reset();
        }
        let client_closed = session.client_closed || sender_closed == Some(true);

        match outcome {
            Outcome::Cancelled => LiveState::Failed(AgentError::Cancelled),
            Outcome::ClientClosed => LiveState::Closed,
            Outcome::InboundClosed if client_closed => LiveState::Closed,
            Outcome::InboundClosed => {
                let resumable = self.ctx.run_config().session_resumption
                    && self.ctx.resumption_handle().is_some();
                if resumable {
                    LiveState::Reconnecting(Cause::PeerClosed)
                } else {
                    LiveState::Closed
                }
            }
            Outcome::Fault(e) if client_closed && !e.is_fatal() => {
                debug!(error = %e, "ignoring fault after client close");
                LiveState::Closed
            }
            Outcome::Fault(e) => LiveState::Reconnecting(Cause::Fault(e)),
        }
    }

    #[instrument(skip_all, fields(agent = %self.factory.author, invocation_id = %self.factory.invocation_id))]
    async fn reconnect(&mut self, cause: Cause) -> LiveState {
        let recovery = match cause {
            Cause::PeerClosed => self.budget.on_expected_close(),
            Cause::Fault(e) => {
                let has_handle = self.ctx.resumption_handle().is_some();
                self.budget.on_fault(e, has_handle)
            }
        };

        match recovery {
            Recovery::Resume { attempt, delay } => {
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting live session"
                );
                let cancel = self.ctx.cancellation().clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => LiveState::Failed(AgentError::Cancelled),
                    _ = sleep(delay) => LiveState::Connecting,
                }
            }
            Recovery::Fresh => {
                warn!("resumption handle rejected; reconnecting without it");
                self.ctx.set_resumption_handle(None);
                LiveState::Connecting
            }
            Recovery::GiveUp(err) => {
                error!(error = %err, "live session cannot continue");
                LiveState::Failed(err)
            }
        }
    }

    fn finish(&mut self, outcome: &'static str) {
        self.outbox.close();
        info!(
            agent = %self.factory.author,
            invocation_id = %self.factory.invocation_id,
            outcome,
            "live invocation finished"
        );
    }
}

/// One open connection with its sender/receiver pair.
///
/// Dropping it without `shutdown` (the consumer abandoned the sequence)
/// moves the same cleanup onto a background task.
struct ActiveSession {
    conn: Option<Arc<dyn LiveConnection>>,
    stop: CancellationToken,
    sender: Option<JoinHandle<bool>>,
    receiver: Option<JoinHandle<()>>,
    signals: mpsc::Receiver<Signal>,
    shutdown_timeout: Duration,
    delivered: bool,
    client_closed: bool,
    linger_until: Option<Instant>,
}

impl ActiveSession {
    /// Stop both tasks, join them under the shutdown deadline, then close
    /// the connection. Returns whether the sender saw the application close,
    /// or `None` if it had to be aborted.
    async fn shutdown(&mut self) -> Option<bool> {
        self.stop.cancel();
        self.signals.close();

        let until = Instant::now() + self.shutdown_timeout;
        let exit = join_within(self.sender.take(), until, "sender").await;
        join_within(self.receiver.take(), until, "receiver").await;

        if let Some(conn) = self.conn.take() {
            close_connection(conn, self.shutdown_timeout).await;
        }
        exit
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if self.sender.is_none() && self.receiver.is_none() && self.conn.is_none() {
            return;
        }
        self.stop.cancel();

        let sender = self.sender.take();
        let receiver = self.receiver.take();
        let conn = self.conn.take();
        let deadline = self.shutdown_timeout;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("live sequence dropped mid-session; shutting down in background");
                runtime.spawn(async move {
                    let until = Instant::now() + deadline;
                    join_within(sender, until, "sender").await;
                    join_within(receiver, until, "receiver").await;
                    if let Some(conn) = conn {
                        close_connection(conn, deadline).await;
                    }
                });
            }
            Err(_) => {
                warn!("live session dropped outside a runtime; aborting tasks");
                if let Some(sender) = sender {
                    sender.abort();
                }
                if let Some(receiver) = receiver {
                    receiver.abort();
                }
            }
        }
    }
}

async fn join_within<T>(handle: Option<JoinHandle<T>>, until: Instant, task: &'static str) -> Option<T> {
    let mut handle = handle?;
    match timeout_at(until, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!(task, error = %e, "live task failed");
            None
        }
        Err(_) => {
            warn!(task, "live task missed shutdown deadline; aborting");
            handle.abort();
            let _ = handle.await;
            None
        }
    }
}

async fn close_connection(conn: Arc<dyn LiveConnection>, deadline: Duration) {
    match timeout(deadline, conn.close()).await {
        Ok(Ok(())) => debug!("live connection closed"),
        Ok(Err(e)) => warn!(error = %e, "live connection close failed"),
        Err(_) => warn!("live connection close timed out"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn join_within_aborts_overdue_task() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));
        let stuck = tokio::spawn(async move {
            let _flag = flag;
            std::future::pending::<()>().await;
        });

        let started = Instant::now();
        let joined = join_within(Some(stuck), started + Duration::from_millis(250), "stuck").await;

        assert!(joined.is_none());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn join_within_returns_task_output() {
        let done = tokio::spawn(async { true });
        let joined = join_within(Some(done), Instant::now() + Duration::from_secs(1), "done").await;
        assert_eq!(joined, Some(true));
        assert_eq!(join_within::<bool>(None, Instant::now(), "absent").await, None);
    }
}
