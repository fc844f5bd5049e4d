use std::time::Duration;

use thiserror::Error;

/// How the Live flow reacts to a transport fault. Decided once, where the
/// fault is created, and never re-derived from message text downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultClass {
    /// Reconnect with the current resumption handle, under backoff.
    Retryable,
    /// The resumption handle was refused: drop it and reconnect once without it.
    HandleInvalid,
    /// Never retried.
    Fatal,
}

/// Errors raised at the live transport boundary.
#[derive(Clone, Debug, Error)]
pub enum LiveError {
    // Fatal
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("rejected by peer ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    // Handle-invalid
    #[error("session resumption handle rejected: {0}")]
    ResumptionRejected(String),

    // Retryable
    #[error("network error: {0}")]
    Network(String),
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("peer unavailable: {0}")]
    Unavailable(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl LiveError {
    pub fn fault_class(&self) -> FaultClass {
        match self {
            Self::AuthenticationFailed(_) | Self::InvalidConfig(_) | Self::Rejected { .. } => {
                FaultClass::Fatal
            }
            Self::ResumptionRejected(_) => FaultClass::HandleInvalid,
            Self::Network(_) | Self::ConnectionReset(_) | Self::Unavailable(_) | Self::Timeout(_) => {
                FaultClass::Retryable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.fault_class() == FaultClass::Retryable
    }

    pub fn is_fatal(&self) -> bool {
        self.fault_class() == FaultClass::Fatal
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Rejected { .. } => "rejected",
            Self::ResumptionRejected(_) => "resumption_rejected",
            Self::Network(_) => "network_error",
            Self::ConnectionReset(_) => "connection_reset",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an abnormal websocket-style close frame. Normal closes
    /// (1000, 1001) are not errors and should not reach this constructor.
    pub fn from_close_code(code: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match code {
            1006 | 1011 | 1012 | 1013 | 1014 => Self::Unavailable(format!("close {code}: {reason}")),
            4001 | 4003 => Self::AuthenticationFailed(reason),
            4004 => Self::ResumptionRejected(reason),
            1002 | 1003 | 1007 | 1008 | 1009 | 1010 => Self::Rejected { code, reason },
            4000..=4999 => Self::Rejected { code, reason },
            _ => Self::ConnectionReset(format!("close {code}: {reason}")),
        }
    }
}

#[derive(Clone, Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session already exists: {0}")]
    AlreadyExists(String),
    #[error("session store failure: {0}")]
    Store(String),
}

/// Terminal error of an event sequence.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("live transport error: {0}")]
    Live(#[from] LiveError),

    #[error("reconnect gave up after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: LiveError },

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("agent configuration error: {0}")]
    Config(String),

    #[error("agent {agent} does not support {mode} mode")]
    Unsupported { agent: String, mode: &'static str },

    #[error("invocation cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}
