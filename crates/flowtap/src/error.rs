//! Redirector error types

use flowtap_core::{InvalidSpecSyntax, UnavailableReason};
use flowtap_tunnel::HandshakeError;
use thiserror::Error;

use crate::launcher::LaunchError;

/// Why [`LocalRedirector::start`](crate::LocalRedirector::start) failed.
///
/// The redirector stays unstarted after any of these.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("local redirect mode unavailable: {0}")]
    Unavailable(UnavailableReason),

    #[error("redirector is already started")]
    AlreadyStarted,

    #[error("failed to launch helper: {0}")]
    Launch(#[from] LaunchError),

    #[error("helper handshake failed: {0}")]
    Handshake(HandshakeError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("invalid initial intercept spec: {0}")]
    InvalidSpec(#[from] InvalidSpecSyntax),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HandshakeError> for StartupError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Timeout(waiting_for) => StartupError::Timeout(waiting_for),
            HandshakeError::Io(e) => StartupError::Io(e),
            other => StartupError::Handshake(other),
        }
    }
}

/// How a started session ended, when it did not end gracefully
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("tunnel channel closed: {reason}")]
    ChannelClosed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_timeout_maps_to_startup_timeout() {
        let err: StartupError = HandshakeError::Timeout("hello").into();
        assert!(matches!(err, StartupError::Timeout("hello")));

        let err: StartupError = HandshakeError::Rejected("nope".to_string()).into();
        assert!(matches!(err, StartupError::Handshake(_)));
    }

    #[test]
    fn test_error_messages() {
        let err = StartupError::Unavailable(UnavailableReason::new("no helper"));
        assert_eq!(err.to_string(), "local redirect mode unavailable: no helper");

        let err = SessionError::ChannelClosed {
            reason: "helper closed the tunnel".to_string(),
        };
        assert_eq!(err.to_string(), "tunnel channel closed: helper closed the tunnel");
    }
}
