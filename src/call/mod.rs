//! Outbound call lifecycle: one INVITE, a bounded ring, and a guaranteed hangup.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod classify;
pub mod engine;
pub mod message;
pub mod status;
#[cfg(test)]
pub(crate) mod tests;

pub use classify::{classify, ResponseClass};
pub use engine::CallEngine;
pub use status::{StatusReceiver, StatusSender, STATUS_CAPACITY};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipCredential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimings {
    /// How long the INVITE may wait for its first provisional response.
    pub provisional_timeout: Duration,
    /// Counted from the first provisional (or an immediate 2xx), never from the INVITE.
    pub call_duration: Duration,
    pub max_auth_attempts: u32,
    /// How long the cleanup hook waits after its CANCEL/BYE before returning.
    pub cleanup_linger: Duration,
}

impl Default for CallTimings {
    fn default() -> Self {
        Self {
            provisional_timeout: Duration::from_secs(2),
            call_duration: Duration::from_secs(12),
            max_auth_attempts: 3,
            cleanup_linger: Duration::from_millis(500),
        }
    }
}

/// Immutable parameters of the call, built once from configuration.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub username: String,
    pub credential: SipCredential,
    pub domain: String,
    pub destination: String,
    /// Sent as `P-Asserted-Identity` when present.
    pub asserted_identity: Option<String>,
    pub useragent: Option<String>,
    pub timings: CallTimings,
}

/// Progress reported to the observer, serialized as `{"status": "..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    SendingInvite,
    Authenticating,
    Trying,
    HangingUpTimer,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: CallStatus,
}

impl From<CallStatus> for StatusMessage {
    fn from(status: CallStatus) -> Self {
        Self { status }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Answered, then hung up when the call duration elapsed.
    Completed,
    /// The call duration elapsed while the callee was still ringing.
    Unanswered,
    /// Operator shutdown; the cleanup hook sent CANCEL and BYE.
    Interrupted,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("public address discovery failed: {0}")]
    Resolve(String),
    #[error("no provisional response within {0:?}")]
    ProvisionalTimeout(Duration),
    #[error("call rejected: {code} {reason}")]
    Rejected { code: u16, reason: String },
    #[error("too many auth challenges ({0})")]
    AuthExhausted(u32),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response stream closed before a final response")]
    StreamClosed,
}

impl From<anyhow::Error> for CallError {
    fn from(e: anyhow::Error) -> Self {
        CallError::Transport(format!("{:#}", e))
    }
}
