//! Agents and helpers shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{stream, StreamExt};

use strand_core::agent::{Agent, EventStream};
use strand_core::content::Content;
use strand_core::context::{InvocationContext, RunConfig};
use strand_core::errors::AgentError;
use strand_core::event::Event;
use strand_core::session::Session;

use crate::custom::FnAgent;

pub(crate) fn ctx() -> InvocationContext {
    InvocationContext::new(Session::new("app", "user"), RunConfig::default())
}

fn text_event(ctx: &InvocationContext, author: &str, text: &str) -> Event {
    Event::new(ctx.invocation_id().clone(), author)
        .with_branch(ctx.branch().map(String::from))
        .with_content(Content::model_text(text))
}

/// Emits one event per text, in order.
pub(crate) fn text_agent(name: &str, texts: &[&str]) -> Arc<dyn Agent> {
    let author = name.to_string();
    let texts: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
    Arc::new(
        FnAgent::new(name, move |ctx| -> EventStream {
            let events: Vec<_> = texts
                .iter()
                .map(|t| Ok(text_event(&ctx, &author, t)))
                .collect();
            Box::pin(stream::iter(events))
        })
        .unwrap(),
    )
}

/// Emits `texts`, then fails.
pub(crate) fn failing_agent(name: &str, texts: &[&str]) -> Arc<dyn Agent> {
    let author = name.to_string();
    let texts: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
    Arc::new(
        FnAgent::new(name, move |ctx| -> EventStream {
            let mut items: Vec<_> = texts
                .iter()
                .map(|t| Ok(text_event(&ctx, &author, t)))
                .collect();
            items.push(Err(AgentError::Internal(format!("{author} failed"))));
            Box::pin(stream::iter(items))
        })
        .unwrap(),
    )
}

/// Emits one event carrying the escalate action.
pub(crate) fn escalating_agent(name: &str) -> Arc<dyn Agent> {
    let author = name.to_string();
    Arc::new(
        FnAgent::new(name, move |ctx| -> EventStream {
            let mut event = text_event(&ctx, &author, "exit");
            event.actions_mut().escalate = true;
            Box::pin(stream::iter(vec![Ok(event)]))
        })
        .unwrap(),
    )
}

/// Emits one event and ends the invocation.
pub(crate) fn ending_agent(name: &str) -> Arc<dyn Agent> {
    let author = name.to_string();
    Arc::new(
        FnAgent::new(name, move |ctx| -> EventStream {
            let event = text_event(&ctx, &author, "end");
            ctx.end_invocation();
            Box::pin(stream::iter(vec![Ok(event)]))
        })
        .unwrap(),
    )
}

/// Never yields; counts how many runs are still alive.
pub(crate) fn pending_agent(name: &str, alive: Arc<AtomicUsize>) -> Arc<dyn Agent> {
    Arc::new(
        FnAgent::new(name, move |_ctx| -> EventStream {
            let guard = AliveGuard::new(Arc::clone(&alive));
            Box::pin(stream::pending::<Result<Event, AgentError>>().map(move |item| {
                let _ = &guard;
                item
            }))
        })
        .unwrap(),
    )
}

struct AliveGuard(Arc<AtomicUsize>);

impl AliveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drain a sequence, splitting events from the terminal error.
pub(crate) async fn collect(mut events: EventStream) -> (Vec<Event>, Option<AgentError>) {
    let mut out = Vec::new();
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => out.push(event),
            Err(e) => {
                assert!(events.next().await.is_none(), "items followed a terminal error");
                return (out, Some(e));
            }
        }
    }
    (out, None)
}

pub(crate) fn texts(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e.content().map(|c| c.text()))
        .collect()
}
