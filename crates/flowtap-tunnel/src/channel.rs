//! Tunnel channel
//!
//! A reader task and a writer task own the two halves of the transport.
//! Outbound frames pass through a bounded queue so senders suspend when the
//! helper stops reading. Once the channel closes, every pending and future
//! operation fails with [`TunnelError::ChannelClosed`].

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use flowtap_core::config::TunnelSettings;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{CodecError, FrameCodec, DEFAULT_MAX_FRAME_LEN};
use crate::frame::Frame;

/// Upper bound for flushing queued frames after a local close
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Room reserved for the JSON envelope around a data payload
const FRAME_OVERHEAD: usize = 512;

/// Tunnel errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    #[error("tunnel channel closed: {0}")]
    ChannelClosed(String),

    #[error("tunnel outbound queue is full")]
    QueueFull,
}

/// Channel tuning
#[derive(Debug, Clone, Copy)]
pub struct TunnelConfig {
    /// Frames queued in front of the writer before senders suspend
    pub outbound_capacity: usize,
    /// Decoded frames queued for the receiver before the reader stops
    /// pulling from the transport
    pub inbound_capacity: usize,
    pub max_frame_len: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            inbound_capacity: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl From<&TunnelSettings> for TunnelConfig {
    fn from(settings: &TunnelSettings) -> Self {
        Self {
            outbound_capacity: settings.outbound_capacity,
            inbound_capacity: settings.inbound_capacity,
            max_frame_len: settings.max_frame_len,
        }
    }
}

/// Statistics for a tunnel channel
pub struct TunnelStats {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    /// Data payload bytes written to the helper
    pub bytes_sent: AtomicU64,
    /// Data payload bytes read from the helper
    pub bytes_received: AtomicU64,
    pub malformed_frames: AtomicU64,
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
        }
    }
}

impl TunnelStats {
    pub fn snapshot(&self) -> TunnelStatsSnapshot {
        TunnelStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TunnelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TunnelStatsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub malformed_frames: u64,
}

struct Shared {
    token: CancellationToken,
    reason: Mutex<Option<String>>,
    stats: TunnelStats,
}

impl Shared {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            stats: TunnelStats::default(),
        }
    }

    /// Record the closing reason (first one wins) and stop both tasks.
    fn close(&self, reason: impl Into<String>) -> bool {
        let first = {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
                true
            } else {
                false
            }
        };
        self.token.cancel();
        first
    }

    fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    fn closed_error(&self) -> TunnelError {
        TunnelError::ChannelClosed(self.reason().unwrap_or_else(|| "tunnel closed".to_string()))
    }
}

/// Entry point for opening a channel over a connected transport
pub struct TunnelChannel;

impl TunnelChannel {
    /// Spawn the reader and writer tasks over `io`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<T>(io: T, config: TunnelConfig) -> (TunnelSender, FrameReceiver, TunnelHandle)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let frames_in = FramedRead::new(
            read_half,
            FrameCodec::with_max_frame_len(config.max_frame_len),
        );
        let frames_out = FramedWrite::new(
            write_half,
            FrameCodec::with_max_frame_len(config.max_frame_len),
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let shared = Arc::new(Shared::new());

        let reader = tokio::spawn(read_loop(frames_in, inbound_tx, shared.clone()));
        let writer = tokio::spawn(write_loop(frames_out, outbound_rx, shared.clone()));

        debug!(
            outbound_capacity = config.outbound_capacity,
            max_frame_len = config.max_frame_len,
            "Tunnel channel opened"
        );

        let sender = TunnelSender {
            tx: outbound_tx,
            shared: shared.clone(),
            max_payload_len: max_payload_len(config.max_frame_len),
        };
        let receiver = FrameReceiver {
            rx: inbound_rx,
            shared: shared.clone(),
        };
        let handle = TunnelHandle {
            shared,
            tasks: Arc::new(Mutex::new(vec![reader, writer])),
        };
        (sender, receiver, handle)
    }
}

/// Largest data payload that still fits a frame once base64 encoded
fn max_payload_len(max_frame_len: usize) -> usize {
    (max_frame_len.saturating_sub(FRAME_OVERHEAD) / 4 * 3).max(1)
}

async fn read_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    inbound: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let item = tokio::select! {
            _ = shared.token.cancelled() => break,
            item = frames.next() => item,
        };

        match item {
            Some(Ok(Ok(frame))) => {
                shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                shared
                    .stats
                    .bytes_received
                    .fetch_add(frame.payload_len() as u64, Ordering::Relaxed);
                trace!(kind = frame.kind(), "Frame received");

                // A full inbound queue stops us reading, which pushes back on the helper.
                let delivered = tokio::select! {
                    _ = shared.token.cancelled() => break,
                    res = inbound.send(frame) => res.is_ok(),
                };
                if !delivered {
                    shared.close("frame receiver dropped");
                    break;
                }
            }
            Some(Ok(Err(malformed))) => {
                shared.stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %malformed.error,
                    line = %malformed.excerpt,
                    "Skipping malformed tunnel frame"
                );
            }
            Some(Err(e)) => {
                error!("Tunnel read error: {}", e);
                shared.close(format!("read failed: {}", e));
                break;
            }
            None => {
                info!("Tunnel closed by helper");
                shared.close("helper closed the tunnel");
                break;
            }
        }
    }
    debug!("Tunnel reader stopped");
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else {
            debug!("All tunnel senders dropped");
            break;
        };

        let kind = frame.kind();
        let payload = frame.payload_len() as u64;
        let result = tokio::select! {
            _ = shared.token.cancelled() => break,
            res = sink.send(frame) => res,
        };
        match result {
            Ok(()) => {
                shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                shared.stats.bytes_sent.fetch_add(payload, Ordering::Relaxed);
                trace!(kind, "Frame sent");
            }
            Err(CodecError::Io(e)) => {
                error!("Tunnel write error: {}", e);
                shared.close(format!("write failed: {}", e));
                return;
            }
            Err(e) => {
                warn!(kind, "Dropping unencodable frame: {}", e);
            }
        }
    }

    // Flush what was queued before the close, e.g. close frames from dropped streams.
    outbound.close();
    let drain = async {
        while let Ok(frame) = outbound.try_recv() {
            sink.feed(frame).await?;
        }
        sink.close().await
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(Ok(())) => debug!("Tunnel writer stopped"),
        Ok(Err(e)) => debug!("Tunnel writer stopped, drain failed: {}", e),
        Err(_) => debug!("Tunnel writer stopped, drain timed out"),
    }
}

/// Cloneable sending half of a tunnel channel
#[derive(Clone)]
pub struct TunnelSender {
    tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
    max_payload_len: usize,
}

impl TunnelSender {
    /// Queue a frame, waiting for room when the queue is full.
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        if self.shared.token.is_cancelled() {
            return Err(self.shared.closed_error());
        }
        tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => Err(self.shared.closed_error()),
            res = self.tx.send(frame) => res.map_err(|_| self.shared.closed_error()),
        }
    }

    /// Queue a frame without waiting, failing with [`TunnelError::QueueFull`]
    /// when there is no room.
    pub fn try_send(&self, frame: Frame) -> Result<(), TunnelError> {
        if self.shared.token.is_cancelled() {
            return Err(self.shared.closed_error());
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TunnelError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => self.shared.closed_error(),
        })
    }

    /// Queue a frame without making the caller wait.
    ///
    /// When the queue is full the frame is handed to a background task that
    /// waits for room behind the senders already waiting. Outside a runtime
    /// a full queue fails with [`TunnelError::QueueFull`].
    pub fn send_detached(&self, frame: Frame) -> Result<(), TunnelError> {
        if self.shared.token.is_cancelled() {
            return Err(self.shared.closed_error());
        }
        let frame = match self.tx.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(self.shared.closed_error()),
            Err(mpsc::error::TrySendError::Full(frame)) => frame,
        };

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TunnelError::QueueFull)?;
        let sender = self.clone();
        runtime.spawn(async move {
            let kind = frame.kind();
            if let Err(e) = sender.send(frame).await {
                debug!(kind, "Deferred frame not sent: {}", e);
            }
        });
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Largest payload a single data frame may carry
    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }
}

/// Receiving half of a tunnel channel
///
/// Yields frames in arrival order. Frames decoded before the channel closed
/// are still delivered; after that every call fails.
pub struct FrameReceiver {
    rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
}

impl FrameReceiver {
    pub async fn recv(&mut self) -> Result<Frame, TunnelError> {
        match self.rx.recv().await {
            Some(frame) => Ok(frame),
            None => Err(self.shared.closed_error()),
        }
    }

    /// Reason the channel closed, if it has
    pub fn close_reason(&self) -> Option<String> {
        self.shared.reason()
    }
}

impl Stream for FrameReceiver {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

/// Control handle for a tunnel channel
#[derive(Clone)]
pub struct TunnelHandle {
    shared: Arc<Shared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TunnelHandle {
    /// Close the channel locally. Idempotent.
    pub fn close(&self) {
        if self.shared.close("closed locally") {
            debug!("Tunnel channel closing");
        }
    }

    /// Close the channel recording a failure reason.
    pub fn fail(&self, reason: impl Into<String>) {
        self.shared.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Resolves once the channel is closed for any reason.
    pub async fn closed(&self) {
        self.shared.token.cancelled().await
    }

    pub fn close_reason(&self) -> Option<String> {
        self.shared.reason()
    }

    pub fn stats(&self) -> TunnelStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Wait for the reader and writer tasks to finish.
    pub async fn join(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Tunnel task failed: {}", e);
            }
        }
    }
}
