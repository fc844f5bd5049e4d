use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::content::Content;
use crate::ids::InvocationId;
use crate::live::{LiveRequestQueue, ResumptionHandle};
use crate::session::Session;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    #[default]
    None,
    Sse,
    Bidi,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Audio,
}

/// Per-invocation run options.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    pub streaming_mode: StreamingMode,
    pub response_modalities: Vec<Modality>,
    /// Ask the live peer for resumption handles and reconnect with them.
    pub session_resumption: bool,
    pub save_input_blobs_as_artifacts: bool,
    /// Zero means unlimited.
    pub max_llm_calls: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            streaming_mode: StreamingMode::None,
            response_modalities: vec![Modality::Text],
            session_resumption: true,
            save_input_blobs_as_artifacts: false,
            max_llm_calls: 500,
        }
    }
}

/// Per-invocation environment handed to every agent in the tree.
///
/// Cloning is cheap; clones share the end flag, resumption slot and live
/// queue. `for_branch` derives a child with its own branch name and a child
/// cancellation token.
#[derive(Clone)]
pub struct InvocationContext {
    invocation_id: InvocationId,
    session: Arc<Session>,
    branch: Option<String>,
    user_content: Option<Content>,
    run_config: Arc<RunConfig>,
    ended: Arc<AtomicBool>,
    live_queue: Option<LiveRequestQueue>,
    resumption: Arc<Mutex<Option<ResumptionHandle>>>,
    cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new(session: Session, run_config: RunConfig) -> Self {
        Self {
            invocation_id: InvocationId::new(),
            session: Arc::new(session),
            branch: None,
            user_content: None,
            run_config: Arc::new(run_config),
            ended: Arc::new(AtomicBool::new(false)),
            live_queue: None,
            resumption: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_user_content(mut self, content: Content) -> Self {
        self.user_content = Some(content);
        self
    }

    pub fn with_live_queue(mut self, queue: LiveRequestQueue) -> Self {
        self.live_queue = Some(queue);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_resumption_handle(self, handle: ResumptionHandle) -> Self {
        *self.resumption.lock() = Some(handle);
        self
    }

    /// Child context for a named sub-branch.
    pub fn for_branch(&self, segment: &str) -> Self {
        let branch = match &self.branch {
            Some(parent) if !parent.is_empty() => format!("{parent}.{segment}"),
            _ => segment.to_string(),
        };
        Self {
            branch: Some(branch),
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn user_content(&self) -> Option<&Content> {
        self.user_content.as_ref()
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    /// Ask every agent in the tree to stop after its current event.
    pub fn end_invocation(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn live_request_queue(&self) -> Option<&LiveRequestQueue> {
        self.live_queue.as_ref()
    }

    pub fn resumption_handle(&self) -> Option<ResumptionHandle> {
        self.resumption.lock().clone()
    }

    pub fn set_resumption_handle(&self, handle: Option<ResumptionHandle>) {
        *self.resumption.lock() = handle;
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
