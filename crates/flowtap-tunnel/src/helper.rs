//! Helper side of the tunnel
//!
//! [`HelperConnection`] is what a privileged helper uses to talk to the
//! redirector: it performs the handshake, keeps the intercept spec the
//! redirector pushes, and announces flows.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use flowtap_core::{ActiveIntercept, FlowKey, ProcessDescriptor};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::channel::{
    FrameReceiver, TunnelChannel, TunnelConfig, TunnelError, TunnelHandle, TunnelSender,
};
use crate::frame::Frame;
use crate::handshake::{self, HandshakeError};

/// Default time to wait for the redirector's handshake reply
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Connected, handshaken helper endpoint
pub struct HelperConnection {
    sender: TunnelSender,
    receiver: FrameReceiver,
    handle: TunnelHandle,
    protocol_version: u32,
    intercept: ActiveIntercept,
}

impl HelperConnection {
    /// Connect to the redirector's socket and run the handshake.
    #[cfg(unix)]
    pub async fn connect(
        socket_path: &Path,
        helper_info: &str,
        config: TunnelConfig,
    ) -> Result<Self, HandshakeError> {
        let stream = tokio::net::UnixStream::connect(socket_path).await?;
        debug!("Connected to redirector at {}", socket_path.display());
        Self::over(stream, helper_info, config).await
    }

    /// Run the handshake over an already connected transport.
    pub async fn over<T>(
        io: T,
        helper_info: &str,
        config: TunnelConfig,
    ) -> Result<Self, HandshakeError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sender, mut receiver, handle) = TunnelChannel::open(io, config);
        let protocol_version =
            match handshake::hello(&sender, &mut receiver, helper_info, DEFAULT_HELLO_TIMEOUT)
                .await
            {
                Ok(version) => version,
                Err(e) => {
                    handle.close();
                    return Err(e);
                }
            };

        Ok(Self {
            sender,
            receiver,
            handle,
            protocol_version,
            intercept: ActiveIntercept::default(),
        })
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Spec most recently pushed by the redirector
    pub fn intercept(&self) -> &ActiveIntercept {
        &self.intercept
    }

    /// Whether a process should be redirected under the current spec
    pub fn should_intercept(&self, process: &ProcessDescriptor) -> bool {
        self.intercept.matches(process)
    }

    pub fn sender(&self) -> TunnelSender {
        self.sender.clone()
    }

    pub fn handle(&self) -> &TunnelHandle {
        &self.handle
    }

    pub async fn ready(&self) -> Result<(), TunnelError> {
        self.sender.send(Frame::Ready).await
    }

    pub async fn new_flow(
        &self,
        key: FlowKey,
        process: ProcessDescriptor,
    ) -> Result<(), TunnelError> {
        self.sender.send(Frame::NewFlow { key, process }).await
    }

    pub async fn send_data(&self, key: FlowKey, data: impl Into<Bytes>) -> Result<(), TunnelError> {
        self.sender
            .send(Frame::Data {
                key,
                data: data.into(),
            })
            .await
    }

    pub async fn close_flow(&self, key: FlowKey) -> Result<(), TunnelError> {
        self.sender.send(Frame::Close { key }).await
    }

    pub async fn fail_flow(&self, key: FlowKey, reason: impl Into<String>) -> Result<(), TunnelError> {
        self.sender
            .send(Frame::Error {
                key,
                reason: reason.into(),
            })
            .await
    }

    /// Next frame from the redirector.
    ///
    /// `intercept_conf` frames update [`Self::intercept`] before they are
    /// returned.
    pub async fn next_frame(&mut self) -> Result<Frame, TunnelError> {
        let frame = self.receiver.recv().await?;
        if let Frame::InterceptConf { spec } = &frame {
            match self.intercept.replace_from_text(spec) {
                Ok(active) => info!(spec = %active, "Intercept spec updated"),
                Err(e) => warn!("Ignoring unparsable intercept spec: {}", e),
            }
        }
        Ok(frame)
    }

    /// Close the tunnel and wait for its tasks.
    pub async fn shutdown(self) {
        self.handle.close();
        self.handle.join().await;
    }
}
