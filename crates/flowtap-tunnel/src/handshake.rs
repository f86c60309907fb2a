//! Tunnel handshake
//!
//! The helper speaks first with `hello`; the redirector answers with
//! `hello_ack` when the protocol version matches and `hello_nack`
//! otherwise. Versions must match exactly.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{FrameReceiver, TunnelError, TunnelSender};
use crate::frame::Frame;

/// Tunnel protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("protocol version {theirs} not supported, expected version {ours}")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("unexpected {0} frame during handshake")]
    UnexpectedFrame(&'static str),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the helper announced about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperHello {
    pub protocol_version: u32,
    pub helper_info: String,
}

fn is_compatible(version: u32) -> bool {
    version == PROTOCOL_VERSION
}

async fn recv_within(
    receiver: &mut FrameReceiver,
    timeout: Duration,
    waiting_for: &'static str,
) -> Result<Frame, HandshakeError> {
    match tokio::time::timeout(timeout, receiver.recv()).await {
        Ok(frame) => Ok(frame?),
        Err(_) => Err(HandshakeError::Timeout(waiting_for)),
    }
}

/// Redirector side: wait for the helper's hello and answer it.
pub async fn accept(
    sender: &TunnelSender,
    receiver: &mut FrameReceiver,
    redirector_info: &str,
    timeout: Duration,
) -> Result<HelperHello, HandshakeError> {
    match recv_within(receiver, timeout, "hello").await? {
        Frame::Hello {
            protocol_version,
            helper_info,
        } => {
            if !is_compatible(protocol_version) {
                warn!(
                    helper_version = protocol_version,
                    "Refusing helper with incompatible protocol version"
                );
                sender
                    .send(Frame::HelloNack {
                        reason: format!(
                            "protocol version {} not supported, redirector supports version {}",
                            protocol_version, PROTOCOL_VERSION
                        ),
                    })
                    .await?;
                return Err(HandshakeError::VersionMismatch {
                    ours: PROTOCOL_VERSION,
                    theirs: protocol_version,
                });
            }

            sender
                .send(Frame::HelloAck {
                    protocol_version: PROTOCOL_VERSION,
                    redirector_info: redirector_info.to_string(),
                })
                .await?;
            info!(helper = %helper_info, protocol_version, "Helper connected");
            Ok(HelperHello {
                protocol_version,
                helper_info,
            })
        }
        other => {
            let kind = other.kind();
            sender
                .send(Frame::HelloNack {
                    reason: format!("expected hello, got {}", kind),
                })
                .await?;
            Err(HandshakeError::UnexpectedFrame(kind))
        }
    }
}

/// Helper side: announce ourselves and wait for the verdict.
///
/// Returns the protocol version the redirector acknowledged.
pub async fn hello(
    sender: &TunnelSender,
    receiver: &mut FrameReceiver,
    helper_info: &str,
    timeout: Duration,
) -> Result<u32, HandshakeError> {
    sender
        .send(Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            helper_info: helper_info.to_string(),
        })
        .await?;

    match recv_within(receiver, timeout, "hello_ack").await? {
        Frame::HelloAck {
            protocol_version,
            redirector_info,
        } => {
            debug!(redirector = %redirector_info, protocol_version, "Handshake accepted");
            Ok(protocol_version)
        }
        Frame::HelloNack { reason } => Err(HandshakeError::Rejected(reason)),
        other => Err(HandshakeError::UnexpectedFrame(other.kind())),
    }
}

/// Redirector side: wait for the helper to report `ready`.
///
/// Flow frames that arrive before `ready` are returned in order so the
/// caller can replay them.
pub async fn wait_ready(
    receiver: &mut FrameReceiver,
    timeout: Duration,
) -> Result<Vec<Frame>, HandshakeError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut backlog = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match recv_within(receiver, remaining, "ready").await? {
            Frame::Ready => return Ok(backlog),
            frame if frame.flow_key().is_some() => backlog.push(frame),
            other => {
                warn!(kind = other.kind(), "Ignoring control frame while waiting for ready");
            }
        }
    }
}
