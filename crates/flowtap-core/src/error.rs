//! Error taxonomy shared by every flowtap crate

use crate::flow::FlowKey;
use std::fmt;
use thiserror::Error;

/// Why local redirection cannot run on this host.
///
/// Returned by capability probes. Not fatal: callers check it before
/// attempting to start and report it to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailableReason(String);

impl UnavailableReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UnavailableReason {}

/// Malformed intercept specification text.
///
/// Local to the call that parsed it; the previously active specification
/// stays in effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid intercept spec {input:?}: {reason}")]
pub struct InvalidSpecSyntax {
    /// The text that failed to parse
    pub input: String,

    /// What was wrong with it
    pub reason: String,
}

impl InvalidSpecSyntax {
    pub fn new(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Flow table consistency errors.
///
/// These are logged by the dispatcher and the offending frame is dropped;
/// they never reach the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowTableError {
    #[error("unknown flow: {0}")]
    UnknownFlow(FlowKey),

    #[error("duplicate flow: {0}")]
    DuplicateFlow(FlowKey),
}

/// Read/write failure on a stream handle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The stream was closed locally
    #[error("stream is closed")]
    Closed,

    /// The helper reported an error for this flow
    #[error("flow aborted: {0}")]
    Aborted(String),

    /// The tunnel went away underneath the stream
    #[error("tunnel channel closed: {0}")]
    ChannelClosed(String),

    /// A UDP datagram does not fit in one data frame
    #[error("datagram of {len} bytes exceeds maximum of {max}")]
    DatagramTooLarge { len: usize, max: usize },
}
