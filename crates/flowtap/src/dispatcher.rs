//! Session dispatcher
//!
//! Consumes frames from the tunnel and turns them into flow state changes:
//! `new_flow` frames are matched against the active intercept spec and
//! either rejected or admitted with a handler task, data and close frames
//! are routed to the owning flow. One dispatcher runs per session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flowtap_core::{
    ActiveIntercept, FlowKey, FlowTable, ProcessDescriptor, ProcessSource, StreamError, Transport,
};
use flowtap_tunnel::{Frame, FrameReceiver, TunnelError, TunnelSender};
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::SessionError;
use crate::handler::FlowHandler;
use crate::stream::Stream;

/// How long handlers get to observe an aborted flow before they are cancelled
pub const DEFAULT_HANDLER_GRACE: Duration = Duration::from_millis(500);

/// Dispatcher counters
pub struct DispatcherStats {
    pub flows_admitted: AtomicU64,
    pub flows_rejected: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub handler_errors: AtomicU64,
}

impl Default for DispatcherStats {
    fn default() -> Self {
        Self {
            flows_admitted: AtomicU64::new(0),
            flows_rejected: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        }
    }
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            flows_admitted: self.flows_admitted.load(Ordering::Relaxed),
            flows_rejected: self.flows_rejected.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub flows_admitted: u64,
    pub flows_rejected: u64,
    pub frames_dropped: u64,
    pub handler_errors: u64,
}

/// Routes tunnel frames to flows for one session
pub struct SessionDispatcher {
    table: Arc<FlowTable>,
    intercept: Arc<ActiveIntercept>,
    processes: Arc<dyn ProcessSource>,
    handler: Arc<dyn FlowHandler>,
    sender: TunnelSender,
    stats: Arc<DispatcherStats>,
    handlers: JoinSet<()>,
    handler_grace: Duration,
}

impl SessionDispatcher {
    pub fn new(
        table: Arc<FlowTable>,
        intercept: Arc<ActiveIntercept>,
        processes: Arc<dyn ProcessSource>,
        handler: Arc<dyn FlowHandler>,
        sender: TunnelSender,
    ) -> Self {
        Self {
            table,
            intercept,
            processes,
            handler,
            sender,
            stats: Arc::new(DispatcherStats::default()),
            handlers: JoinSet::new(),
            handler_grace: DEFAULT_HANDLER_GRACE,
        }
    }

    pub fn with_handler_grace(mut self, grace: Duration) -> Self {
        self.handler_grace = grace;
        self
    }

    pub fn with_stats(mut self, stats: Arc<DispatcherStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.stats.clone()
    }

    /// Dispatch frames until `shutdown` fires or the channel closes.
    ///
    /// `backlog` holds frames that arrived before the dispatcher started;
    /// they are handled first, in order. On return every flow has been
    /// aborted and every handler task has finished.
    pub async fn run(
        mut self,
        mut receiver: FrameReceiver,
        backlog: Vec<Frame>,
        shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        for frame in backlog {
            self.dispatch(frame);
        }

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                frame = receiver.recv() => match frame {
                    Ok(frame) => self.dispatch(frame),
                    Err(TunnelError::ChannelClosed(reason)) => {
                        break Err(SessionError::ChannelClosed { reason })
                    }
                    Err(other) => {
                        break Err(SessionError::ChannelClosed {
                            reason: other.to_string(),
                        })
                    }
                },
                Some(joined) = self.handlers.join_next(), if !self.handlers.is_empty() => {
                    self.reap(joined);
                }
            }
        };

        self.teardown(&outcome).await;
        outcome
    }

    fn dispatch(&mut self, frame: Frame) {
        trace!(kind = frame.kind(), "Dispatching frame");
        match frame {
            Frame::NewFlow { key, process } => self.on_new_flow(key, process),
            Frame::Data { key, data } => self.on_data(key, data),
            Frame::Close { key } => self.on_close(key),
            Frame::Error { key, reason } => self.on_error(key, reason),
            Frame::Ready => info!("Helper reported ready"),
            other => {
                warn!(kind = other.kind(), "Unexpected frame from helper");
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_new_flow(&mut self, key: FlowKey, mut process: ProcessDescriptor) {
        if self.table.lookup(&key).is_ok() {
            warn!(flow = %key, "Duplicate flow announced, dropping frame");
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if process.is_unresolved() {
            if let Some(found) = self.processes.find(process.pid) {
                process.merge_from(&found);
            }
        }

        if !self.intercept.matches(&process) {
            debug!(
                flow = %key,
                pid = process.pid,
                process = %process.display_name,
                "Flow not intercepted"
            );
            self.stats.flows_rejected.fetch_add(1, Ordering::Relaxed);
            // A full outbound queue must not hold up frames for other flows.
            if let Err(e) = self.sender.send_detached(Frame::Reject { key }) {
                debug!(flow = %key, "Reject not sent: {}", e);
            }
            return;
        }

        let state = match self.table.admit(key) {
            Ok(state) => state,
            Err(e) => {
                warn!("{}, dropping frame", e);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.stats.flows_admitted.fetch_add(1, Ordering::Relaxed);
        info!(
            flow = %key,
            pid = process.pid,
            process = %process.display_name,
            "Flow admitted"
        );

        let stream = Stream::new(state, self.table.clone(), self.sender.clone(), process);
        let handler = self.handler.clone();
        let stats = self.stats.clone();
        self.handlers.spawn(async move {
            let result = match key.transport {
                Transport::Tcp => handler.handle_tcp(stream).await,
                Transport::Udp => handler.handle_udp(stream).await,
            };
            if let Err(e) = result {
                stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(flow = %key, "Flow handler failed: {}", e);
            }
        });
    }

    fn on_data(&self, key: FlowKey, data: Bytes) {
        match self.table.lookup(&key) {
            Ok(state) => {
                if !state.push_inbound(data) {
                    debug!(flow = %key, "Data after close, dropping frame");
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                warn!("{}, dropping data frame", e);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_close(&self, key: FlowKey) {
        let state = match self.table.lookup(&key) {
            Ok(state) => state,
            Err(e) => {
                // Usually the handler closed first and both closes crossed.
                debug!("{}, dropping close frame", e);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let stage = state.remote_close();
        debug!(flow = %key, ?stage, "Remote side closed");
        if key.transport == Transport::Udp {
            // Datagrams already queued stay readable through the stream.
            self.table.finish(&key);
        }
    }

    fn on_error(&self, key: FlowKey, reason: String) {
        match self.table.lookup(&key) {
            Ok(state) => {
                warn!(flow = %key, reason = %reason, "Helper reported flow error");
                state.abort(StreamError::Aborted(reason));
                self.table.close(&key);
            }
            Err(e) => {
                debug!("{}, dropping error frame", e);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!("Flow handler panicked: {}", e);
            }
        }
    }

    async fn teardown(&mut self, outcome: &Result<(), SessionError>) {
        let reason = match outcome {
            Ok(()) => "redirector closed".to_string(),
            Err(SessionError::ChannelClosed { reason }) => reason.clone(),
        };
        let aborted = self.table.abort_all(StreamError::ChannelClosed(reason));

        // Handlers blocked on a stream wake up with the abort error; give
        // them a moment to finish before cancelling the rest.
        let handlers = &mut self.handlers;
        let finished = tokio::time::timeout(self.handler_grace, async {
            while let Some(joined) = handlers.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Flow handler panicked: {}", e);
                    }
                }
            }
        })
        .await
        .is_ok();

        let cancelled = self.handlers.len();
        self.handlers.shutdown().await;
        info!(aborted, cancelled, finished, "Session dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, HandlerResult};
    use flowtap_core::{InterceptSpec, StaticProcessSource};
    use flowtap_tunnel::{TunnelChannel, TunnelConfig, TunnelHandle};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    fn tcp_key(port: u16) -> FlowKey {
        FlowKey::tcp(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
        )
    }

    fn udp_key(port: u16) -> FlowKey {
        FlowKey::udp(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
        )
    }

    fn curl() -> ProcessDescriptor {
        ProcessDescriptor::new(100, "/usr/bin/curl")
    }

    fn wget() -> ProcessDescriptor {
        ProcessDescriptor::new(200, "/usr/bin/wget")
    }

    /// Handler that reads each flow to the end and reports what it saw
    fn collecting_handler(
        tx: mpsc::UnboundedSender<(FlowKey, Result<Vec<u8>, StreamError>)>,
    ) -> Arc<dyn FlowHandler> {
        let tcp_tx = tx.clone();
        let udp_tx = tx;
        Arc::new(handler_fn(
            move |stream| {
                let tx = tcp_tx.clone();
                async move { drain(stream, tx).await }
            },
            move |stream| {
                let tx = udp_tx.clone();
                async move { drain(stream, tx).await }
            },
        ))
    }

    async fn drain(
        stream: Stream,
        tx: mpsc::UnboundedSender<(FlowKey, Result<Vec<u8>, StreamError>)>,
    ) -> HandlerResult {
        let mut seen = Vec::new();
        loop {
            match stream.read(4096).await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => seen.extend_from_slice(&chunk),
                Err(e) => {
                    let _ = tx.send((*stream.key(), Err(e)));
                    return Ok(());
                }
            }
        }
        let _ = tx.send((*stream.key(), Ok(seen)));
        Ok(())
    }

    struct Session {
        helper_tx: TunnelSender,
        helper_rx: FrameReceiver,
        helper_handle: TunnelHandle,
        table: Arc<FlowTable>,
        intercept: Arc<ActiveIntercept>,
        stats: Arc<DispatcherStats>,
        shutdown: CancellationToken,
        task: JoinHandle<Result<(), SessionError>>,
        _redirector_handle: TunnelHandle,
    }

    fn session(spec: &str, handler: Arc<dyn FlowHandler>, processes: StaticProcessSource) -> Session {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let (tx, rx, redirector_handle) = TunnelChannel::open(a, TunnelConfig::default());
        let (helper_tx, helper_rx, helper_handle) = TunnelChannel::open(b, TunnelConfig::default());

        let table = Arc::new(FlowTable::new());
        let intercept = Arc::new(ActiveIntercept::new(InterceptSpec::parse(spec).unwrap()));
        let dispatcher = SessionDispatcher::new(
            table.clone(),
            intercept.clone(),
            Arc::new(processes),
            handler,
            tx,
        );
        let stats = dispatcher.stats();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(rx, Vec::new(), shutdown.clone()));

        Session {
            helper_tx,
            helper_rx,
            helper_handle,
            table,
            intercept,
            stats,
            shutdown,
            task,
            _redirector_handle: redirector_handle,
        }
    }

    async fn send(s: &Session, frame: Frame) {
        s.helper_tx.send(frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_new_flow_data_and_close_arrive_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = session("all", collecting_handler(tx), StaticProcessSource::empty());
        let key = tcp_key(5000);

        send(&s, Frame::NewFlow { key, process: curl() }).await;
        for chunk in [&b"GET / "[..], b"HTTP/1.1\r\n", b"\r\n"] {
            send(&s, Frame::Data { key, data: Bytes::copy_from_slice(chunk) }).await;
        }
        send(&s, Frame::Close { key }).await;

        let (seen_key, seen) = rx.recv().await.unwrap();
        assert_eq!(seen_key, key);
        assert_eq!(seen.unwrap(), b"GET / HTTP/1.1\r\n\r\n".to_vec());
        assert_eq!(s.stats.snapshot().flows_admitted, 1);
    }

    #[tokio::test]
    async fn test_unmatched_flow_is_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = session("process:curl", collecting_handler(tx), StaticProcessSource::empty());
        let key = tcp_key(5001);

        send(&s, Frame::NewFlow { key, process: wget() }).await;
        assert_eq!(s.helper_rx.recv().await.unwrap(), Frame::Reject { key });
        assert!(s.table.is_empty());
        assert_eq!(s.stats.snapshot().flows_rejected, 1);

        s.shutdown.cancel();
        assert_eq!(s.task.await.unwrap(), Ok(()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spec_switch_only_affects_new_flows() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = session("all", collecting_handler(tx), StaticProcessSource::empty());
        let early = tcp_key(5002);
        let late = tcp_key(5003);

        send(&s, Frame::NewFlow { key: early, process: wget() }).await;
        send(&s, Frame::Data { key: early, data: Bytes::from_static(b"one") }).await;

        // Wait until the first flow is admitted before switching.
        while s.table.lookup(&early).is_err() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        s.intercept.replace_from_text("process:curl").unwrap();

        send(&s, Frame::NewFlow { key: late, process: wget() }).await;
        assert_eq!(s.helper_rx.recv().await.unwrap(), Frame::Reject { key: late });

        send(&s, Frame::Data { key: early, data: Bytes::from_static(b"two") }).await;
        send(&s, Frame::Close { key: early }).await;
        let (seen_key, seen) = rx.recv().await.unwrap();
        assert_eq!(seen_key, early);
        assert_eq!(seen.unwrap(), b"onetwo".to_vec());
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_frames_are_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = session("all", collecting_handler(tx), StaticProcessSource::empty());
        let key = tcp_key(5004);

        send(&s, Frame::NewFlow { key, process: curl() }).await;
        send(&s, Frame::NewFlow { key, process: curl() }).await;
        send(&s, Frame::Data { key: tcp_key(6000), data: Bytes::from_static(b"?") }).await;
        send(&s, Frame::Data { key, data: Bytes::from_static(b"ok") }).await;
        send(&s, Frame::Close { key }).await;

        let (_, seen) = rx.recv().await.unwrap();
        assert_eq!(seen.unwrap(), b"ok".to_vec());

        let stats = s.stats.snapshot();
        assert_eq!(stats.flows_admitted, 1);
        assert_eq!(stats.frames_dropped, 2);
    }

    #[tokio::test]
    async fn test_unresolved_process_is_looked_up() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let processes = StaticProcessSource::new(vec![ProcessDescriptor::new(4242, "/opt/bin/curl")]);
        let s = session("process:curl", collecting_handler(tx), processes);
        let key = tcp_key(5005);

        send(&s, Frame::NewFlow { key, process: ProcessDescriptor::unknown(4242) }).await;
        send(&s, Frame::Close { key }).await;

        let (seen_key, seen) = rx.recv().await.unwrap();
        assert_eq!(seen_key, key);
        assert_eq!(seen.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_udp_close_keeps_queued_datagrams() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = session("all", collecting_handler(tx), StaticProcessSource::empty());
        let key = udp_key(5353);

        send(&s, Frame::NewFlow { key, process: curl() }).await;
        send(&s, Frame::Data { key, data: Bytes::from_static(b"query") }).await;
        send(&s, Frame::Close { key }).await;

        let (_, seen) = rx.recv().await.unwrap();
        assert_eq!(seen.unwrap(), b"query".to_vec());
    }

    #[tokio::test]
    async fn test_error_frame_aborts_flow() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = session("all", collecting_handler(tx), StaticProcessSource::empty());
        let key = tcp_key(5006);

        send(&s, Frame::NewFlow { key, process: curl() }).await;
        send(&s, Frame::Error { key, reason: "connection reset".to_string() }).await;

        let (_, seen) = rx.recv().await.unwrap();
        assert_eq!(seen, Err(StreamError::Aborted("connection reset".to_string())));
        assert!(s.table.is_empty());
    }

    #[tokio::test]
    async fn test_channel_failure_aborts_flows() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = session("all", collecting_handler(tx), StaticProcessSource::empty());
        let key = tcp_key(5007);

        send(&s, Frame::NewFlow { key, process: curl() }).await;
        while s.table.lookup(&key).is_err() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Helper goes away.
        s.helper_handle.close();
        s.helper_handle.join().await;

        let outcome = s.task.await.unwrap();
        assert!(matches!(outcome, Err(SessionError::ChannelClosed { .. })));

        let (_, seen) = rx.recv().await.unwrap();
        assert!(matches!(seen, Err(StreamError::ChannelClosed(_))));
        assert!(s.table.is_empty());
    }

    #[tokio::test]
    async fn test_reject_with_full_queue_does_not_stall_other_flows() {
        // The helper end is written raw and never read, so the small pipe
        // fills and the one-slot outbound queue stays full.
        let (a, mut raw) = tokio::io::duplex(256);
        let config = TunnelConfig {
            outbound_capacity: 1,
            ..TunnelConfig::default()
        };
        let (tx, rx, _redirector_handle) = TunnelChannel::open(a, config);

        let other = tcp_key(6100);
        let filler = tx.clone();
        tokio::spawn(async move {
            for _ in 0..4 {
                let data = Bytes::from(vec![b'x'; 512]);
                if filler.send(Frame::Data { key: other, data }).await.is_err() {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tx.try_send(Frame::Ready), Err(TunnelError::QueueFull));

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn FlowHandler> = Arc::new(handler_fn(
            move |stream| {
                let seen_tx = seen_tx.clone();
                async move {
                    if let Ok(first) = stream.read(4096).await {
                        let _ = seen_tx.send((*stream.key(), first));
                    }
                    Ok(())
                }
            },
            |_stream| async move { Ok(()) },
        ));
        let dispatcher = SessionDispatcher::new(
            Arc::new(FlowTable::new()),
            Arc::new(ActiveIntercept::new(InterceptSpec::parse("process:curl").unwrap())),
            Arc::new(StaticProcessSource::empty()),
            handler,
            tx,
        );
        let stats = dispatcher.stats();
        let shutdown = CancellationToken::new();
        tokio::spawn(dispatcher.run(rx, Vec::new(), shutdown.clone()));

        let rejected = tcp_key(6101);
        let admitted = tcp_key(6102);
        for frame in [
            Frame::NewFlow { key: rejected, process: wget() },
            Frame::NewFlow { key: admitted, process: curl() },
            Frame::Data { key: admitted, data: Bytes::from_static(b"hello") },
        ] {
            let mut line = serde_json::to_string(&frame).unwrap();
            line.push('\n');
            raw.write_all(line.as_bytes()).await.unwrap();
        }

        let (seen_key, first) = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen_key, admitted);
        assert_eq!(first, "hello");
        assert_eq!(stats.snapshot().flows_rejected, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_blocked_handler_does_not_stall_other_flows() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn FlowHandler> = Arc::new(handler_fn(
            move |stream: Stream| {
                let tx = tx.clone();
                async move {
                    if stream.key().local.port() == 5010 {
                        let _held = stream;
                        std::future::pending::<HandlerResult>().await
                    } else {
                        drain(stream, tx).await
                    }
                }
            },
            |_stream| async move { Ok(()) },
        ));
        let s = session("all", handler, StaticProcessSource::empty());
        let stuck = tcp_key(5010);
        let live = tcp_key(5011);

        send(&s, Frame::NewFlow { key: stuck, process: curl() }).await;
        send(&s, Frame::Data { key: stuck, data: Bytes::from_static(b"ignored") }).await;
        send(&s, Frame::NewFlow { key: live, process: wget() }).await;
        send(&s, Frame::Data { key: live, data: Bytes::from_static(b"still flowing") }).await;
        send(&s, Frame::Close { key: live }).await;

        let (seen_key, seen) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen_key, live);
        assert_eq!(seen.unwrap(), b"still flowing".to_vec());
        assert!(s.table.lookup(&stuck).is_ok());
        assert_eq!(s.stats.snapshot().flows_admitted, 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_stuck_handlers() {
        let handler: Arc<dyn FlowHandler> = Arc::new(handler_fn(
            |stream| async move {
                let _held = stream;
                std::future::pending::<()>().await;
                Ok(())
            },
            |_stream| async move { Ok(()) },
        ));
        let s = session("all", handler, StaticProcessSource::empty());
        let key = tcp_key(5008);

        send(&s, Frame::NewFlow { key, process: curl() }).await;
        while s.table.lookup(&key).is_err() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        s.shutdown.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(2), s.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Ok(()));
        assert!(s.table.is_empty());
    }
}
