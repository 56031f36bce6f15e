//! Wire calls to inference backends
//!
//! [`BackendClient`] is the capability set the switcher needs from a backend:
//! a liveness probe, a sleep-state probe, and the sleep and wake commands.
//! [`HttpBackendClient`] speaks to real vLLM-style servers and
//! [`ScriptedClient`] stands in for them in tests.
//!
//! Every call takes a [`CancellationToken`] and returns promptly with
//! [`ClientError::Cancelled`] once it fires.

use crate::backend::Endpoint;
use async_trait::async_trait;
use std::fmt;
use tokio_util::sync::CancellationToken;

mod http;
mod scripted;

pub use http::HttpBackendClient;
pub use scripted::{Call, ScriptedClient};

/// Sleep level for hibernating backends
///
/// Different levels trade off wake time vs host memory usage:
/// - L1: Offload weights to host RAM (fast wake, needs room in RAM)
/// - L2: Discard weights (slow wake, weights reload from storage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SleepLevel {
    #[default]
    L1,
    L2,
}

impl SleepLevel {
    /// Get the numeric level (1 or 2)
    pub fn as_u8(&self) -> u8 {
        match self {
            SleepLevel::L1 => 1,
            SleepLevel::L2 => 2,
        }
    }
}

impl fmt::Display for SleepLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.as_u8())
    }
}

/// The backend API call that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Health,
    IsSleeping,
    Sleep,
    WakeUp,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Health => "health",
            Operation::IsSleeping => "is_sleeping",
            Operation::Sleep => "sleep",
            Operation::WakeUp => "wake_up",
        };
        f.write_str(s)
    }
}

/// Errors from a backend call. Each one names the operation and the endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Connection failure, timeout, or a malformed request
    #[error("{op} on {endpoint} failed: {reason}")]
    Transport {
        op: Operation,
        endpoint: Endpoint,
        reason: String,
    },

    /// The backend answered with a non-success status
    #[error("{op} on {endpoint} returned status {status}: {body}")]
    Status {
        op: Operation,
        endpoint: Endpoint,
        status: u16,
        body: String,
    },

    /// The backend answered, but not in the expected shape
    #[error("{op} on {endpoint} returned an invalid body: {reason}")]
    Decode {
        op: Operation,
        endpoint: Endpoint,
        reason: String,
    },

    #[error("{op} on {endpoint} was cancelled")]
    Cancelled { op: Operation, endpoint: Endpoint },
}

impl ClientError {
    pub fn transport(op: Operation, endpoint: &Endpoint, reason: impl fmt::Display) -> Self {
        ClientError::Transport {
            op,
            endpoint: endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn cancelled(op: Operation, endpoint: &Endpoint) -> Self {
        ClientError::Cancelled {
            op,
            endpoint: endpoint.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled { .. })
    }

    pub fn operation(&self) -> Operation {
        match self {
            ClientError::Transport { op, .. }
            | ClientError::Status { op, .. }
            | ClientError::Decode { op, .. }
            | ClientError::Cancelled { op, .. } => *op,
        }
    }
}

/// Calls the switcher makes against a backend
///
/// # Implementation Notes
///
/// - Implementations are shared between an in-flight switch and background
///   resyncs, so every method may be called concurrently
/// - `health` distinguishes "answered unhealthy" (`Ok(false)`) from "could not
///   ask" (`Err`)
/// - `sleep` and `wake_up` report non-success statuses as
///   [`ClientError::Status`] with the response body attached
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// `GET /health`: whether the server answers with a success status
    async fn health(&self, endpoint: &Endpoint, cancel: &CancellationToken)
    -> Result<bool, ClientError>;

    /// `GET /is_sleeping`: the server-reported sleep flag
    async fn is_sleeping(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<bool, ClientError>;

    /// `POST /sleep?level={1,2}`
    async fn sleep(
        &self,
        endpoint: &Endpoint,
        level: SleepLevel,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>;

    /// `POST /wake_up`
    async fn wake_up(&self, endpoint: &Endpoint, cancel: &CancellationToken)
    -> Result<(), ClientError>;
}
