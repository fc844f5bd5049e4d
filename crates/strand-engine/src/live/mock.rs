use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use strand_core::context::RunConfig;
use strand_core::errors::LiveError;
use strand_core::live::{
    LiveConnection, LiveConnector, LiveRequest, LiveServerMessage, ResumptionHandle,
};

/// What the inbound stream does once the scripted items run out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfterScript {
    /// `receive` returns `None` straight away.
    Close,
    /// `receive` blocks until the connection is closed.
    Hang,
    /// `receive` blocks until the client sends `LiveRequest::Close`.
    EndOnClientClose,
}

/// Pre-programmed behavior of one mock connection.
#[derive(Clone, Debug)]
pub struct MockScript {
    inbound: Vec<Result<LiveServerMessage, LiveError>>,
    after: AfterScript,
    fail_send: Option<LiveError>,
    hang_send: bool,
}

impl MockScript {
    pub fn new() -> Self {
        Self {
            inbound: Vec::new(),
            after: AfterScript::Close,
            fail_send: None,
            hang_send: false,
        }
    }

    pub fn message(mut self, message: LiveServerMessage) -> Self {
        self.inbound.push(Ok(message));
        self
    }

    pub fn error(mut self, error: LiveError) -> Self {
        self.inbound.push(Err(error));
        self
    }

    pub fn hang(mut self) -> Self {
        self.after = AfterScript::Hang;
        self
    }

    pub fn end_on_client_close(mut self) -> Self {
        self.after = AfterScript::EndOnClientClose;
        self
    }

    /// Every `send` fails with this error.
    pub fn fail_send(mut self, error: LiveError) -> Self {
        self.fail_send = Some(error);
        self
    }

    /// Every `send` blocks forever and only ends when its future is dropped.
    pub fn hang_send(mut self) -> Self {
        self.hang_send = true;
        self
    }
}

impl Default for MockScript {
    fn default() -> Self {
        Self::new()
    }
}

/// Mock connection replaying a script, with counters for assertions.
pub struct MockConnection {
    inbound: Mutex<VecDeque<Result<LiveServerMessage, LiveError>>>,
    after: AfterScript,
    fail_send: Option<LiveError>,
    hang_send: bool,
    sent: Mutex<Vec<LiveRequest>>,
    client_closed: CancellationToken,
    closed: CancellationToken,
    receive_calls: AtomicUsize,
    close_calls: AtomicUsize,
    active_sends: AtomicUsize,
    active_receives: AtomicUsize,
}

/// Counts a call while its future is alive.
struct InCall<'a>(&'a AtomicUsize);

impl<'a> InCall<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockConnection {
    pub fn new(script: MockScript) -> Self {
        Self {
            inbound: Mutex::new(script.inbound.into()),
            after: script.after,
            fail_send: script.fail_send,
            hang_send: script.hang_send,
            sent: Mutex::new(Vec::new()),
            client_closed: CancellationToken::new(),
            closed: CancellationToken::new(),
            receive_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            active_sends: AtomicUsize::new(0),
            active_receives: AtomicUsize::new(0),
        }
    }

    pub fn sent(&self) -> Vec<LiveRequest> {
        self.sent.lock().clone()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// `send` calls whose futures have not finished or been dropped yet.
    pub fn active_sends(&self) -> usize {
        self.active_sends.load(Ordering::SeqCst)
    }

    /// `receive` calls whose futures have not finished or been dropped yet.
    pub fn active_receives(&self) -> usize {
        self.active_receives.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveConnection for MockConnection {
    async fn send(&self, request: LiveRequest) -> Result<(), LiveError> {
        let _active = InCall::enter(&self.active_sends);
        if self.hang_send {
            std::future::pending::<()>().await;
        }
        if let Some(e) = &self.fail_send {
            return Err(e.clone());
        }
        let is_close = matches!(request, LiveRequest::Close);
        self.sent.lock().push(request);
        if is_close {
            self.client_closed.cancel();
        }
        Ok(())
    }

    async fn receive(&self) -> Option<Result<LiveServerMessage, LiveError>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        let _active = InCall::enter(&self.active_receives);
        let scripted = self.inbound.lock().pop_front();
        if let Some(item) = scripted {
            return Some(item);
        }
        match self.after {
            AfterScript::Close => {}
            AfterScript::Hang => self.closed.cancelled().await,
            AfterScript::EndOnClientClose => {
                tokio::select! {
                    _ = self.client_closed.cancelled() => {}
                    _ = self.closed.cancelled() => {}
                }
            }
        }
        None
    }

    async fn close(&self) -> Result<(), LiveError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

/// Outcome of one scripted `connect` call.
pub enum MockConnect {
    Accept(MockScript),
    Fail(LiveError),
}

/// Connector that hands out scripted connections in order.
pub struct MockConnector {
    scripts: Mutex<VecDeque<MockConnect>>,
    handles: Mutex<Vec<Option<ResumptionHandle>>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub fn new(scripts: Vec<MockConnect>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            handles: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.handles.lock().len()
    }

    /// The resumption handle passed to each `connect` call, in order.
    pub fn handles(&self) -> Vec<Option<ResumptionHandle>> {
        self.handles.lock().clone()
    }

    /// Connections handed out so far.
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }
}

#[async_trait]
impl LiveConnector for MockConnector {
    async fn connect(
        &self,
        _config: &RunConfig,
        resumption: Option<&ResumptionHandle>,
    ) -> Result<Arc<dyn LiveConnection>, LiveError> {
        self.handles.lock().push(resumption.cloned());
        let next = self.scripts.lock().pop_front();
        match next {
            Some(MockConnect::Accept(script)) => {
                let conn = Arc::new(MockConnection::new(script));
                self.connections.lock().push(Arc::clone(&conn));
                Ok(conn)
            }
            Some(MockConnect::Fail(e)) => Err(e),
            None => Err(LiveError::InvalidConfig(
                "MockConnector: no connection scripted".into(),
            )),
        }
    }
}
