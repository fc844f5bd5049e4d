use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::content::{Blob, Content, Part};
use crate::context::RunConfig;
use crate::errors::LiveError;

/// Outbound item sent by the application to the live peer.
#[derive(Clone, Debug, PartialEq)]
pub enum LiveRequest {
    Content(Content),
    Realtime(Blob),
    ActivityStart,
    ActivityEnd,
    /// Ends the live invocation once the peer has finished replying.
    Close,
}

/// Application-side handle for feeding a live invocation.
///
/// Every clone writes into the same ordered queue. The receiving half is
/// taken exactly once by the live flow.
#[derive(Clone)]
pub struct LiveRequestQueue {
    tx: mpsc::UnboundedSender<LiveRequest>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<LiveRequest>>>>,
}

impl LiveRequestQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// Returns false once the consuming side is gone.
    pub fn send(&self, request: LiveRequest) -> bool {
        self.tx.send(request).is_ok()
    }

    pub fn send_content(&self, content: Content) -> bool {
        self.send(LiveRequest::Content(content))
    }

    pub fn send_realtime(&self, blob: Blob) -> bool {
        self.send(LiveRequest::Realtime(blob))
    }

    pub fn send_activity_start(&self) -> bool {
        self.send(LiveRequest::ActivityStart)
    }

    pub fn send_activity_end(&self) -> bool {
        self.send(LiveRequest::ActivityEnd)
    }

    pub fn close(&self) -> bool {
        self.send(LiveRequest::Close)
    }

    /// Take the consuming half. Only the first caller gets it.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<LiveRequest>> {
        self.rx.lock().take()
    }
}

impl Default for LiveRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque token that lets a dropped live connection resume where it left off.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumptionHandle(String);

impl ResumptionHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Inbound item from the live peer.
#[derive(Clone, Debug, PartialEq)]
pub enum LiveServerMessage {
    Content { content: Content, partial: bool },
    TurnComplete,
    Interrupted,
    /// Function calls requested by the model. Executing them is the
    /// caller's concern.
    ToolCall(Vec<Part>),
    ResumptionUpdate {
        handle: Option<ResumptionHandle>,
        resumable: bool,
    },
    /// The peer will drop the connection soon.
    GoAway { time_left_ms: Option<u64> },
}

/// Opens live connections.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(
        &self,
        config: &RunConfig,
        resumption: Option<&ResumptionHandle>,
    ) -> Result<Arc<dyn LiveConnection>, LiveError>;
}

/// One open bidirectional connection.
///
/// `send` and `receive` may be called concurrently from two tasks;
/// implementations split their halves internally.
#[async_trait]
pub trait LiveConnection: Send + Sync {
    async fn send(&self, request: LiveRequest) -> Result<(), LiveError>;

    /// Next inbound item; `None` once the inbound stream has closed.
    async fn receive(&self) -> Option<Result<LiveServerMessage, LiveError>>;

    async fn close(&self) -> Result<(), LiveError>;
}
