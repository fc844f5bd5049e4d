use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use strand_core::agent::{validate_sub_agents, Agent, AgentKind, EventStream};
use strand_core::context::InvocationContext;
use strand_core::errors::AgentError;
use strand_core::event::Event;

use super::WorkflowConfig;

const MERGE_CAPACITY: usize = 64;
/// Branches observe group cancellation at their next poll, so draining is
/// normally immediate. The deadline only delays the error when a sub-agent
/// blocks inside a poll; such branches are aborted once it passes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type BranchItem = Result<Event, AgentError>;

/// Runs every sub-agent concurrently on its own branch and merges their
/// sequences. Per-branch order is preserved; cross-branch order is not.
///
/// The first terminal error from any branch cancels the group, drains the
/// remaining branches, then ends the merged sequence with that error.
pub struct ParallelAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
    drain_timeout: Duration,
}

impl ParallelAgent {
    pub fn new(config: WorkflowConfig) -> Result<Self, AgentError> {
        validate_sub_agents(&config.name, &config.sub_agents)?;
        Ok(Self {
            name: config.name,
            description: config.description,
            sub_agents: config.sub_agents,
            drain_timeout: DRAIN_TIMEOUT,
        })
    }

    /// Bound on waiting for cancelled branches before aborting them.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

impl Agent for ParallelAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Parallel
    }

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &self.sub_agents
    }

    fn run(&self, ctx: InvocationContext) -> EventStream {
        let name = self.name.clone();
        let sub_agents = self.sub_agents.clone();
        let drain_timeout = self.drain_timeout;
        let group = ctx.for_branch(&self.name);

        Box::pin(stream! {
            let (tx, mut rx) = mpsc::channel::<BranchItem>(MERGE_CAPACITY);
            // Dropping this set (consumer stops pulling) aborts every branch.
            let mut branches = JoinSet::new();
            for agent in sub_agents {
                let branch_ctx = group.for_branch(agent.name());
                branches.spawn(run_branch(agent, branch_ctx, tx.clone()));
            }
            drop(tx);

            while let Some(item) = rx.recv().await {
                match item {
                    Ok(event) => yield Ok(event),
                    Err(e) => {
                        warn!(agent = %name, error = %e, "branch failed; cancelling siblings");
                        group.cancellation().cancel();
                        rx.close();
                        drain(&mut branches, drain_timeout).await;
                        yield Err(e);
                        return;
                    }
                }
            }

            while let Some(joined) = branches.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(agent = %name, "branch panicked");
                        group.cancellation().cancel();
                        drain(&mut branches, drain_timeout).await;
                        yield Err(AgentError::Internal(format!("{name}: branch panicked")));
                        return;
                    }
                }
            }

            if ctx.is_cancelled() {
                yield Err(AgentError::Cancelled);
            }
        })
    }
}

/// Forward one branch into the merge channel until it ends, fails, or the
/// group is cancelled.
async fn run_branch(agent: Arc<dyn Agent>, ctx: InvocationContext, tx: mpsc::Sender<BranchItem>) {
    let cancel = ctx.cancellation().clone();
    let mut events = agent.run(ctx);
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = events.next() => item,
        };
        let Some(item) = item else {
            return;
        };
        let terminal = item.is_err();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        if terminal {
            return;
        }
    }
}

async fn drain(branches: &mut JoinSet<()>, timeout: Duration) {
    let joined = tokio::time::timeout(timeout, async {
        while branches.join_next().await.is_some() {}
    })
    .await;
    if joined.is_err() {
        debug!(remaining = branches.len(), "branches did not stop in time; aborting");
        branches.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testing::{collect, ctx, failing_agent, pending_agent, text_agent, texts};

    fn parallel(sub_agents: Vec<Arc<dyn Agent>>) -> ParallelAgent {
        ParallelAgent::new(WorkflowConfig::new("fan_out", sub_agents)).unwrap()
    }

    #[tokio::test]
    async fn preserves_order_within_each_branch() {
        let agent = parallel(vec![
            text_agent("a", &["a1", "a2", "a3"]),
            text_agent("b", &["b1", "b2"]),
            text_agent("c", &[]),
        ]);
        let (events, err) = collect(agent.run(ctx())).await;
        assert!(err.is_none());
        assert_eq!(events.len(), 5);

        let mut per_branch: HashMap<String, Vec<String>> = HashMap::new();
        for event in &events {
            let text = event.content().map(|c| c.text()).unwrap_or_default();
            per_branch.entry(event.author.clone()).or_default().push(text);
        }
        assert_eq!(per_branch["a"], ["a1", "a2", "a3"]);
        assert_eq!(per_branch["b"], ["b1", "b2"]);
    }

    #[tokio::test]
    async fn events_carry_branch_names() {
        let agent = parallel(vec![text_agent("a", &["x"]), text_agent("b", &["y"])]);
        let (events, _) = collect(agent.run(ctx())).await;
        for event in &events {
            let expected = format!("fan_out.{}", event.author);
            assert_eq!(event.branch.as_deref(), Some(expected.as_str()));
        }
    }

    #[tokio::test]
    async fn error_cancels_and_drains_siblings() {
        let alive = Arc::new(AtomicUsize::new(0));
        let agent = parallel(vec![
            pending_agent("slow", Arc::clone(&alive)),
            failing_agent("broken", &["partial"]),
        ]);
        let (events, err) = collect(agent.run(ctx())).await;
        assert!(matches!(err, Some(AgentError::Internal(_))));
        assert_eq!(texts(&events), ["partial"]);
        assert_eq!(alive.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_surfaces_without_waiting_for_drain_deadline() {
        let alive = Arc::new(AtomicUsize::new(0));
        let agent = parallel(vec![
            pending_agent("slow", Arc::clone(&alive)),
            pending_agent("slower", Arc::clone(&alive)),
            failing_agent("broken", &[]),
        ]);
        let started = tokio::time::Instant::now();
        let (_, err) = collect(agent.run(ctx())).await;
        assert!(matches!(err, Some(AgentError::Internal(_))));
        assert!(started.elapsed() < DRAIN_TIMEOUT);
        assert_eq!(alive.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn error_does_not_cancel_parent_context() {
        let agent = parallel(vec![failing_agent("broken", &[])]);
        let ctx = ctx();
        let _ = collect(agent.run(ctx.clone())).await;
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_stops_branches() {
        let alive = Arc::new(AtomicUsize::new(0));
        let agent = parallel(vec![
            pending_agent("a", Arc::clone(&alive)),
            pending_agent("b", Arc::clone(&alive)),
        ]);
        let ctx = ctx();
        let cancel = ctx.cancellation().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let (events, err) = collect(agent.run(ctx)).await;
        assert!(events.is_empty());
        assert!(matches!(err, Some(AgentError::Cancelled)));
        assert_eq!(alive.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_branches() {
        let alive = Arc::new(AtomicUsize::new(0));
        let agent = parallel(vec![
            text_agent("fast", &["f1"]),
            pending_agent("slow", Arc::clone(&alive)),
        ]);
        let mut events = agent.run(ctx());
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.author, "fast");
        drop(events);
        // Aborted tasks drop their futures on the next scheduler pass.
        for _ in 0..10 {
            if alive.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(alive.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_sub_agents_yields_nothing() {
        let agent = parallel(vec![]);
        let (events, err) = collect(agent.run(ctx())).await;
        assert!(events.is_empty());
        assert!(err.is_none());
    }
}
