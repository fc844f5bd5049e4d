//! The two helper tasks of an active live connection. Neither one ever
//! reaches the sequence's consumer: everything they observe is posted to the
//! coordinator as a [`Signal`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strand_core::content::{Content, Role};
use strand_core::errors::LiveError;
use strand_core::event::{Event, ModelResponse};
use strand_core::ids::InvocationId;
use strand_core::live::{LiveConnection, LiveRequest, LiveServerMessage, ResumptionHandle};

pub(crate) type RequestReceiver = mpsc::UnboundedReceiver<LiveRequest>;

/// Messages from the sender/receiver pair to the coordinator.
#[derive(Debug)]
pub(crate) enum Signal {
    Event(Event),
    Resumption {
        handle: Option<ResumptionHandle>,
        resumable: bool,
    },
    GoAway {
        time_left_ms: Option<u64>,
    },
    /// The inbound stream ended. Posted at most once per connection.
    Closed,
    ReceiveFailed(LiveError),
    SendFailed(LiveError),
    /// The application asked to end the invocation.
    ClientClosed,
}

/// Requests on their way to the peer.
///
/// Owned by the coordinator and lent to each sender generation, so a sender
/// that fails, is stopped mid-send, or is aborted leaves both the queue and
/// the unsent request behind for the next connection.
pub(crate) struct Outbox {
    queue: AsyncMutex<RequestReceiver>,
    in_flight: Mutex<Option<LiveRequest>>,
}

impl Outbox {
    pub(crate) fn new(queue: RequestReceiver) -> Self {
        Self {
            queue: AsyncMutex::new(queue),
            in_flight: Mutex::new(None),
        }
    }

    /// The request taken off the queue but not yet accepted by a connection.
    pub(crate) fn in_flight(&self) -> Option<LiveRequest> {
        self.in_flight.lock().clone()
    }

    /// Refuse further requests from the application.
    pub(crate) fn close(&self) {
        if let Ok(mut queue) = self.queue.try_lock() {
            queue.close();
        }
        self.in_flight.lock().take();
    }
}

/// Stamps the invocation's identity onto translated events.
#[derive(Clone)]
pub(crate) struct EventFactory {
    pub(crate) invocation_id: InvocationId,
    pub(crate) author: String,
    pub(crate) branch: Option<String>,
}

impl EventFactory {
    fn event(&self, response: ModelResponse, partial: bool) -> Event {
        let mut event = Event::new(self.invocation_id.clone(), self.author.clone())
            .with_branch(self.branch.clone());
        event.response = Some(response);
        event.partial = partial;
        event
    }

    /// Turn one inbound message into signals for the coordinator.
    pub(crate) fn translate(&self, message: LiveServerMessage) -> Signal {
        match message {
            LiveServerMessage::Content { content, partial } => {
                Signal::Event(self.event(ModelResponse::with_content(content), partial))
            }
            LiveServerMessage::TurnComplete => Signal::Event(self.event(
                ModelResponse {
                    turn_complete: true,
                    ..Default::default()
                },
                false,
            )),
            LiveServerMessage::Interrupted => Signal::Event(self.event(
                ModelResponse {
                    interrupted: true,
                    ..Default::default()
                },
                false,
            )),
            LiveServerMessage::ToolCall(parts) => Signal::Event(self.event(
                ModelResponse::with_content(Content {
                    role: Role::Model,
                    parts,
                }),
                false,
            )),
            LiveServerMessage::ResumptionUpdate { handle, resumable } => {
                Signal::Resumption { handle, resumable }
            }
            LiveServerMessage::GoAway { time_left_ms } => Signal::GoAway { time_left_ms },
        }
    }
}

/// Post to the coordinator unless shutdown already started. Returns false
/// when the signal could not be delivered.
async fn post(signals: &mpsc::Sender<Signal>, stop: &CancellationToken, signal: Signal) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        sent = signals.send(signal) => sent.is_ok(),
    }
}

/// Forward queued requests to the connection, one at a time. A request
/// interrupted on an earlier connection goes out first. Returns whether the
/// application closed the session.
pub(crate) async fn run_sender(
    conn: Arc<dyn LiveConnection>,
    outbox: Arc<Outbox>,
    signals: mpsc::Sender<Signal>,
    stop: CancellationToken,
) -> bool {
    let mut queue = tokio::select! {
        biased;
        _ = stop.cancelled() => return false,
        queue = outbox.queue.lock() => queue,
    };

    loop {
        let pending = outbox.in_flight();
        let request = match pending {
            Some(request) => {
                debug!("resending request interrupted on previous connection");
                request
            }
            None => {
                let next = tokio::select! {
                    biased;
                    _ = stop.cancelled() => return false,
                    next = queue.recv() => next,
                };
                let Some(request) = next else {
                    debug!("live request queue dropped by application");
                    post(&signals, &stop, Signal::ClientClosed).await;
                    return true;
                };
                *outbox.in_flight.lock() = Some(request.clone());
                request
            }
        };

        let is_close = matches!(request, LiveRequest::Close);
        let sent = tokio::select! {
            biased;
            _ = stop.cancelled() => return false,
            sent = conn.send(request) => sent,
        };

        if let Err(e) = sent {
            warn!(error = %e, kind = e.error_kind(), "live send failed");
            post(&signals, &stop, Signal::SendFailed(e)).await;
            return false;
        }
        outbox.in_flight.lock().take();

        if is_close {
            post(&signals, &stop, Signal::ClientClosed).await;
            return true;
        }
    }
}

enum ReceiverState {
    Reading,
    Forward(Signal),
    InboundClosed,
    Failed(LiveError),
    Stopped,
}

/// Read inbound messages until the stream closes, fails, or shutdown starts.
pub(crate) async fn run_receiver(
    conn: Arc<dyn LiveConnection>,
    factory: EventFactory,
    signals: mpsc::Sender<Signal>,
    stop: CancellationToken,
) {
    let mut state = ReceiverState::Reading;

    loop {
        state = match state {
            ReceiverState::Reading => {
                let next = tokio::select! {
                    biased;
                    _ = stop.cancelled() => None,
                    next = conn.receive() => Some(next),
                };
                match next {
                    None => ReceiverState::Stopped,
                    Some(Some(Ok(message))) => ReceiverState::Forward(factory.translate(message)),
                    Some(Some(Err(e))) => ReceiverState::Failed(e),
                    Some(None) => ReceiverState::InboundClosed,
                }
            }
            ReceiverState::Forward(signal) => {
                if post(&signals, &stop, signal).await {
                    ReceiverState::Reading
                } else {
                    ReceiverState::Stopped
                }
            }
            ReceiverState::InboundClosed => {
                debug!("live inbound stream closed");
                post(&signals, &stop, Signal::Closed).await;
                ReceiverState::Stopped
            }
            ReceiverState::Failed(e) => {
                warn!(error = %e, kind = e.error_kind(), "live receive failed");
                post(&signals, &stop, Signal::ReceiveFailed(e)).await;
                ReceiverState::Stopped
            }
            ReceiverState::Stopped => break,
        };
    }
}
