//! Stream handles handed to flow handlers

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use flowtap_core::{
    FlowKey, FlowStage, FlowState, FlowTable, ProcessDescriptor, StreamError, Transport,
};
use flowtap_tunnel::{Frame, TunnelError, TunnelSender};
use tracing::{debug, trace};

/// One intercepted flow
///
/// Reads return bytes sent by the intercepted application; writes go back
/// to it through the helper. A TCP stream half-closes when the application
/// stops sending: reads then return an empty buffer while writes keep
/// working. Dropping the stream closes it.
pub struct Stream {
    state: Arc<FlowState>,
    table: Arc<FlowTable>,
    sender: TunnelSender,
    process: ProcessDescriptor,
}

impl Stream {
    pub(crate) fn new(
        state: Arc<FlowState>,
        table: Arc<FlowTable>,
        sender: TunnelSender,
        process: ProcessDescriptor,
    ) -> Self {
        Self {
            state,
            table,
            sender,
            process,
        }
    }

    /// Read up to `max` bytes.
    ///
    /// Waits until data arrives. An empty buffer means the application
    /// closed its side and everything it sent has been read.
    pub async fn read(&self, max: usize) -> Result<Bytes, StreamError> {
        self.state.read(max).await
    }

    /// Send bytes back to the application.
    ///
    /// On TCP, large buffers are split across several data frames. On UDP
    /// each write is one datagram and must fit in a single frame. Waits
    /// while the tunnel's outbound queue is full.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), StreamError> {
        self.state.check_writable()?;

        let mut data: Bytes = data.into();
        let chunk_len = self.sender.max_payload_len();
        if self.transport() == Transport::Udp && data.len() > chunk_len {
            return Err(StreamError::DatagramTooLarge {
                len: data.len(),
                max: chunk_len,
            });
        }
        while !data.is_empty() {
            let chunk = data.split_to(chunk_len.min(data.len()));
            trace!(flow = %self.key(), bytes = chunk.len(), "Stream write");
            self.sender
                .send(Frame::Data {
                    key: *self.key(),
                    data: chunk,
                })
                .await
                .map_err(channel_closed)?;
            // A concurrent abort wins over the rest of the buffer.
            self.state.check_writable()?;
        }
        Ok(())
    }

    /// Close the stream. Idempotent.
    ///
    /// Tells the helper unless the flow already ended on its side.
    pub async fn close(&self) {
        if self.state.local_close() {
            if let Err(e) = self.sender.send(Frame::Close { key: *self.key() }).await {
                debug!(flow = %self.key(), "Close frame not sent: {}", e);
            }
        }
        self.table.close_state(&self.state);
    }

    pub fn key(&self) -> &FlowKey {
        self.state.key()
    }

    pub fn transport(&self) -> Transport {
        self.key().transport
    }

    /// Address the application was talking to
    pub fn peer_endpoint(&self) -> SocketAddr {
        self.key().remote
    }

    /// Address of the application's socket
    pub fn local_endpoint(&self) -> SocketAddr {
        self.key().local
    }

    /// Process that opened the flow
    pub fn process(&self) -> &ProcessDescriptor {
        &self.process
    }

    pub fn stage(&self) -> FlowStage {
        self.state.stage()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.state.local_close() {
            if let Err(e) = self.sender.send_detached(Frame::Close { key: *self.key() }) {
                debug!(flow = %self.key(), "Close frame not sent on drop: {}", e);
            }
        }
        self.table.close_state(&self.state);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("key", self.key())
            .field("pid", &self.process.pid)
            .field("process", &self.process.display_name)
            .field("stage", &self.stage())
            .finish()
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}[{}])", self.key(), self.process.display_name, self.process.pid)
    }
}

fn channel_closed(err: TunnelError) -> StreamError {
    match err {
        TunnelError::ChannelClosed(reason) => StreamError::ChannelClosed(reason),
        other => StreamError::ChannelClosed(other.to_string()),
    }
}
