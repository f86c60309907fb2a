//! Flow keys, per-flow state, and the flow table
//!
//! The flow table is the only flow bookkeeping shared between the frame
//! receive loop and the tasks running caller handlers. It is a sharded map
//! (one lock per shard) from [`FlowKey`] to an `Arc<FlowState>`, and every
//! [`FlowState`] guards its own fields with a per-entry mutex.

use crate::error::{FlowTableError, StreamError};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

/// Identifies one active flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    /// TCP or UDP
    pub transport: Transport,

    /// Endpoint on this host (the intercepted application's socket)
    pub local: SocketAddr,

    /// Endpoint the application was talking to
    pub remote: SocketAddr,
}

impl FlowKey {
    pub fn new(transport: Transport, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            transport,
            local,
            remote,
        }
    }

    pub fn tcp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(Transport::Tcp, local, remote)
    }

    pub fn udp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(Transport::Udp, local, remote)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.transport, self.local, self.remote)
    }
}

/// Lifecycle stage of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    /// NewFlow seen, handler not yet exchanging data
    Admitted,
    /// Data flowing in at least one direction
    Open,
    /// Remote side finished sending; local writes still allowed
    HalfClosed,
    /// Both directions finished, or the flow was aborted
    Closed,
}

struct FlowInner {
    stage: FlowStage,
    buffer: VecDeque<Bytes>,
    buffered: usize,
    remote_closed: bool,
    local_closed: bool,
    failure: Option<StreamError>,
}

/// State of one flow
///
/// Inbound bytes are queued here until the stream handle reads them, so a
/// slow reader only ever holds up its own flow.
pub struct FlowState {
    key: FlowKey,
    inner: Mutex<FlowInner>,
    readable: Notify,
}

impl FlowState {
    pub fn new(key: FlowKey) -> Self {
        Self {
            key,
            inner: Mutex::new(FlowInner {
                stage: FlowStage::Admitted,
                buffer: VecDeque::new(),
                buffered: 0,
                remote_closed: false,
                local_closed: false,
                failure: None,
            }),
            readable: Notify::new(),
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn stage(&self) -> FlowStage {
        self.inner.lock().stage
    }

    /// Bytes received from the remote side and not read yet
    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().buffered
    }

    pub fn is_closed(&self) -> bool {
        self.stage() == FlowStage::Closed
    }

    /// Queue bytes from the remote side.
    ///
    /// Returns false when the flow no longer accepts inbound data.
    pub fn push_inbound(&self, data: Bytes) -> bool {
        let mut inner = self.inner.lock();
        if inner.remote_closed || inner.stage == FlowStage::Closed {
            return false;
        }
        if inner.stage == FlowStage::Admitted {
            inner.stage = FlowStage::Open;
        }
        if !data.is_empty() {
            inner.buffered += data.len();
            inner.buffer.push_back(data);
        }
        drop(inner);

        self.readable.notify_one();
        true
    }

    /// The remote side finished sending. Returns the resulting stage.
    ///
    /// TCP flows half-close unless the local side is already done; UDP
    /// associations have no half-open state.
    pub fn remote_close(&self) -> FlowStage {
        let mut inner = self.inner.lock();
        if inner.stage != FlowStage::Closed {
            inner.remote_closed = true;
            inner.stage = if inner.local_closed || self.key.transport == Transport::Udp {
                FlowStage::Closed
            } else {
                FlowStage::HalfClosed
            };
            trace!(flow = %self.key, stage = ?inner.stage, "Remote close");
        }
        let stage = inner.stage;
        drop(inner);

        self.readable.notify_one();
        stage
    }

    /// Check that the local side may still write, marking the flow open.
    pub fn check_writable(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();
        if let Some(failure) = &inner.failure {
            return Err(failure.clone());
        }
        if inner.local_closed || inner.stage == FlowStage::Closed {
            return Err(StreamError::Closed);
        }
        if inner.stage == FlowStage::Admitted {
            inner.stage = FlowStage::Open;
        }
        Ok(())
    }

    /// Close the local side.
    ///
    /// Returns true when the other end still has to be told: the flow was
    /// neither aborted nor already fully closed by the remote side.
    pub fn local_close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.local_closed {
            return false;
        }
        inner.local_closed = true;
        let notify_remote = inner.failure.is_none() && inner.stage != FlowStage::Closed;
        inner.stage = FlowStage::Closed;
        inner.buffer.clear();
        inner.buffered = 0;
        drop(inner);

        self.readable.notify_one();
        notify_remote
    }

    /// Abort the flow: drop buffered bytes and fail every later read and write.
    ///
    /// Returns false if the flow had already been aborted or closed locally.
    pub fn abort(&self, error: StreamError) -> bool {
        let mut inner = self.inner.lock();
        if inner.failure.is_some() || inner.local_closed {
            return false;
        }
        debug!(flow = %self.key, error = %error, "Aborting flow");
        inner.failure = Some(error);
        inner.stage = FlowStage::Closed;
        inner.buffer.clear();
        inner.buffered = 0;
        drop(inner);

        self.readable.notify_one();
        true
    }

    /// Release buffers and mark closed without recording a failure
    fn release(&self) {
        let mut inner = self.inner.lock();
        inner.stage = FlowStage::Closed;
        inner.buffer.clear();
        inner.buffered = 0;
        drop(inner);

        self.readable.notify_one();
    }

    /// Read without waiting.
    ///
    /// `None` means nothing is available yet. `Some(Ok(empty))` means the
    /// remote side closed cleanly and every buffered byte has been read.
    pub fn try_read(&self, max: usize) -> Option<Result<Bytes, StreamError>> {
        let mut inner = self.inner.lock();
        if let Some(failure) = &inner.failure {
            return Some(Err(failure.clone()));
        }
        if inner.local_closed {
            return Some(Err(StreamError::Closed));
        }
        if max == 0 {
            return Some(Ok(Bytes::new()));
        }

        if let Some(mut chunk) = inner.buffer.pop_front() {
            if chunk.len() > max {
                let rest = chunk.split_off(max);
                inner.buffer.push_front(rest);
            }
            inner.buffered -= chunk.len();
            return Some(Ok(chunk));
        }

        if inner.remote_closed || inner.stage == FlowStage::Closed {
            return Some(Ok(Bytes::new()));
        }

        None
    }

    /// Read up to `max` bytes, waiting until data, end of stream, or failure.
    pub async fn read(&self, max: usize) -> Result<Bytes, StreamError> {
        loop {
            if let Some(result) = self.try_read(max) {
                return result;
            }
            self.readable.notified().await;
        }
    }
}

impl fmt::Debug for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FlowState")
            .field("key", &self.key)
            .field("stage", &inner.stage)
            .field("buffered", &inner.buffered)
            .finish()
    }
}

/// Concurrent map of active flows
#[derive(Default)]
pub struct FlowTable {
    flows: DashMap<FlowKey, Arc<FlowState>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create state for a new flow
    pub fn admit(&self, key: FlowKey) -> Result<Arc<FlowState>, FlowTableError> {
        match self.flows.entry(key) {
            Entry::Occupied(_) => Err(FlowTableError::DuplicateFlow(key)),
            Entry::Vacant(slot) => {
                let state = Arc::new(FlowState::new(key));
                slot.insert(state.clone());
                debug!(flow = %key, "Flow admitted");
                Ok(state)
            }
        }
    }

    pub fn lookup(&self, key: &FlowKey) -> Result<Arc<FlowState>, FlowTableError> {
        self.flows
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or(FlowTableError::UnknownFlow(*key))
    }

    /// Close a flow and release its buffers.
    ///
    /// Closing an unknown or already-closed flow is a no-op. Returns whether
    /// an entry was removed.
    pub fn close(&self, key: &FlowKey) -> bool {
        match self.flows.remove(key) {
            Some((_, state)) => {
                state.release();
                debug!(flow = %key, "Flow closed");
                true
            }
            None => false,
        }
    }

    /// Remove `state` from the table if it is still the entry for its key.
    ///
    /// Used by stream handles, whose key may have been reused by a newer flow.
    pub fn close_state(&self, state: &Arc<FlowState>) -> bool {
        let removed = self
            .flows
            .remove_if(state.key(), |_, current| Arc::ptr_eq(current, state))
            .is_some();
        if removed {
            debug!(flow = %state.key(), "Flow closed");
        }
        removed
    }

    /// Remove a cleanly finished flow, leaving already-buffered bytes
    /// readable through the stream handle.
    pub fn finish(&self, key: &FlowKey) -> Option<Arc<FlowState>> {
        self.flows.remove(key).map(|(_, state)| state)
    }

    /// Abort and remove every flow. Returns how many were aborted.
    pub fn abort_all(&self, error: StreamError) -> usize {
        let states: Vec<Arc<FlowState>> = self.flows.iter().map(|e| e.value().clone()).collect();
        self.flows.clear();

        let count = states.iter().filter(|s| s.abort(error.clone())).count();
        if count > 0 {
            debug!(count, error = %error, "Aborted all flows");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn keys(&self) -> Vec<FlowKey> {
        self.flows.iter().map(|e| *e.key()).collect()
    }
}
