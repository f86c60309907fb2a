//! Lifecycle controller
//!
//! [`LocalRedirector`] brings a session up: it checks capability, binds a
//! private Unix socket, launches the helper, runs the handshake, pushes the
//! initial intercept spec and hands the tunnel to a [`SessionDispatcher`].
//! [`RedirectorHandle`] is the caller's grip on the running session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowtap_core::{
    describe_spec, ActiveIntercept, FlowKey, FlowTable, FlowtapConfig, InterceptSpec,
    InvalidSpecSyntax, ProcessSource, ProvisioningMode, UnavailableReason, FLOWTAP_VERSION,
};
use flowtap_tunnel::handshake::{self, HelperHello};
use flowtap_tunnel::{
    Frame, FrameReceiver, TunnelChannel, TunnelConfig, TunnelHandle, TunnelSender,
    TunnelStatsSnapshot,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::capability::{CapabilityProbe, PlatformProbe};
use crate::dispatcher::{DispatcherStats, DispatcherStatsSnapshot, SessionDispatcher};
use crate::error::{SessionError, StartupError};
use crate::handler::FlowHandler;
use crate::launcher::{
    AttachedLauncher, CommandLauncher, HelperEndpoint, HelperLauncher, HelperProcess, LaunchError,
};
use crate::procfs::ProcfsProcessSource;

/// File name of the tunnel socket inside the session directory
const SOCKET_NAME: &str = "tunnel.sock";

/// How often a launched helper is checked for an early exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runtime options for a redirector
#[derive(Debug, Clone)]
pub struct RedirectorOptions {
    /// Intercept spec active right after start
    pub intercept: String,
    /// Parent directory of the private session directory
    pub socket_dir: Option<PathBuf>,
    pub handshake_timeout: Duration,
    pub provisioning: ProvisioningMode,
    pub ready_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub tunnel: TunnelConfig,
}

impl Default for RedirectorOptions {
    fn default() -> Self {
        Self::from(&FlowtapConfig::default())
    }
}

impl From<&FlowtapConfig> for RedirectorOptions {
    fn from(config: &FlowtapConfig) -> Self {
        Self {
            intercept: config.redirector.intercept.clone(),
            socket_dir: config.helper.socket_dir.as_ref().map(PathBuf::from),
            handshake_timeout: config.helper.handshake_timeout(),
            provisioning: config.helper.provisioning,
            ready_timeout: config.helper.ready_timeout(),
            shutdown_timeout: config.helper.shutdown_timeout(),
            tunnel: TunnelConfig::from(&config.tunnel),
        }
    }
}

/// Entry point for local redirect mode
pub struct LocalRedirector {
    options: RedirectorOptions,
    probe: Arc<dyn CapabilityProbe>,
    launcher: Arc<dyn HelperLauncher>,
    processes: Arc<dyn ProcessSource>,
    active: Arc<AtomicBool>,
}

impl LocalRedirector {
    /// Redirector waiting for an externally started helper
    pub fn new(options: RedirectorOptions) -> Self {
        Self {
            options,
            probe: Arc::new(PlatformProbe::in_process()),
            launcher: Arc::new(AttachedLauncher),
            processes: Arc::new(ProcfsProcessSource::new()),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Redirector launching the helper program named in the configuration
    pub fn from_config(config: &FlowtapConfig) -> Self {
        let program = config.helper.program.as_ref().map(PathBuf::from);
        let mut redirector = Self::new(RedirectorOptions::from(config))
            .with_probe(PlatformProbe::new(program.clone()));
        if let Some(program) = program {
            redirector = redirector
                .with_launcher(CommandLauncher::new(program).with_args(config.helper.args.clone()));
        }
        redirector
    }

    pub fn with_probe(mut self, probe: impl CapabilityProbe + 'static) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    pub fn with_launcher(mut self, launcher: impl HelperLauncher + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    pub fn with_process_source(mut self, processes: impl ProcessSource + 'static) -> Self {
        self.processes = Arc::new(processes);
        self
    }

    pub fn options(&self) -> &RedirectorOptions {
        &self.options
    }

    /// `None` when local redirect mode can be used, otherwise why not
    pub fn capability_check(&self) -> Option<UnavailableReason> {
        self.probe.query()
    }

    /// Human readable description of an intercept spec
    pub fn describe_spec(text: &str) -> Result<String, InvalidSpecSyntax> {
        describe_spec(text)
    }

    /// Whether a session started by this redirector is still running
    pub fn is_started(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start a session, handing every admitted flow to `handler`.
    pub async fn start<H: FlowHandler>(&self, handler: H) -> Result<RedirectorHandle, StartupError> {
        if let Some(reason) = self.capability_check() {
            info!(reason = %reason, "Local redirect mode unavailable");
            return Err(StartupError::Unavailable(reason));
        }
        let initial = InterceptSpec::parse(&self.options.intercept)?;
        let guard = ActiveGuard::acquire(&self.active).ok_or(StartupError::AlreadyStarted)?;

        let session_id = Ulid::new().to_string();
        let socket = SessionSocket::bind(self.options.socket_dir.as_deref(), &session_id)?;
        let endpoint = HelperEndpoint {
            socket_path: socket.path().to_path_buf(),
            session_id: session_id.clone(),
        };
        info!(session = %session_id, socket = %endpoint.socket_path.display(), "Starting redirector");

        let mut helper = self.launcher.launch(&endpoint).await?;
        let established = match self.establish(&socket, &mut helper, &initial).await {
            Ok(established) => established,
            Err(e) => {
                warn!(session = %session_id, "Redirector failed to start: {}", e);
                helper.stop(Duration::ZERO).await;
                return Err(e);
            }
        };

        let Established {
            sender,
            receiver,
            tunnel,
            hello,
            backlog,
        } = established;

        let intercept = Arc::new(ActiveIntercept::new(initial));
        let table = Arc::new(FlowTable::new());
        let stats = Arc::new(DispatcherStats::default());
        let shutdown = CancellationToken::new();
        let (closed_tx, closed_rx) = watch::channel(None);

        let dispatcher = SessionDispatcher::new(
            table.clone(),
            intercept.clone(),
            self.processes.clone(),
            Arc::new(handler),
            sender.clone(),
        )
        .with_stats(stats.clone());

        let session = SessionTask {
            session_id: session_id.clone(),
            tunnel: tunnel.clone(),
            helper,
            shutdown_timeout: self.options.shutdown_timeout,
            socket,
            guard,
            closed: closed_tx,
        };
        tokio::spawn(session.run(dispatcher, receiver, backlog, shutdown.clone()));

        info!(
            session = %session_id,
            helper = %hello.helper_info,
            intercept = %intercept.load(),
            "Redirector started"
        );

        Ok(RedirectorHandle {
            inner: Arc::new(SessionInner {
                session_id,
                hello,
                intercept,
                table,
                sender,
                tunnel,
                stats,
                shutdown,
                closed: closed_rx,
            }),
        })
    }

    async fn establish(
        &self,
        socket: &SessionSocket,
        helper: &mut HelperProcess,
        initial: &InterceptSpec,
    ) -> Result<Established, StartupError> {
        let timeout = self.options.handshake_timeout;
        let stream = tokio::select! {
            accepted = socket.accept() => accepted?,
            _ = tokio::time::sleep(timeout) => return Err(StartupError::Timeout("helper connection")),
            status = wait_exit(helper) => {
                return Err(LaunchError::ExitedEarly(status).into());
            }
        };
        debug!("Helper connected to tunnel socket");

        let (sender, mut receiver, tunnel) = TunnelChannel::open(stream, self.options.tunnel);
        let result = async {
            let redirector_info = format!("flowtap/{}", FLOWTAP_VERSION);
            let hello = handshake::accept(&sender, &mut receiver, &redirector_info, timeout).await?;

            sender
                .send(Frame::InterceptConf {
                    spec: initial.to_string(),
                })
                .await
                .map_err(handshake::HandshakeError::from)?;

            let backlog = match self.options.provisioning {
                ProvisioningMode::Synchronous => {
                    let backlog = handshake::wait_ready(&mut receiver, self.options.ready_timeout).await?;
                    info!("Helper reported ready");
                    backlog
                }
                ProvisioningMode::Eventual => Vec::new(),
            };
            Ok::<_, StartupError>((hello, backlog))
        }
        .await;

        match result {
            Ok((hello, backlog)) => Ok(Established {
                sender,
                receiver,
                tunnel,
                hello,
                backlog,
            }),
            Err(e) => {
                tunnel.close();
                tunnel.join().await;
                Err(e)
            }
        }
    }
}

struct Established {
    sender: TunnelSender,
    receiver: FrameReceiver,
    tunnel: TunnelHandle,
    hello: HelperHello,
    backlog: Vec<Frame>,
}

/// Resolves with an exit description once the helper is gone
async fn wait_exit(helper: &mut HelperProcess) -> String {
    loop {
        if let Some(status) = helper.try_exited() {
            return status;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Marks the redirector started for as long as it lives
struct ActiveGuard(Arc<AtomicBool>);

impl ActiveGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the session after start: runs the dispatcher, then tears down
struct SessionTask {
    session_id: String,
    tunnel: TunnelHandle,
    helper: HelperProcess,
    shutdown_timeout: Duration,
    socket: SessionSocket,
    guard: ActiveGuard,
    closed: watch::Sender<Option<Result<(), SessionError>>>,
}

impl SessionTask {
    async fn run(
        mut self,
        dispatcher: SessionDispatcher,
        receiver: FrameReceiver,
        backlog: Vec<Frame>,
        shutdown: CancellationToken,
    ) {
        let outcome = dispatcher.run(receiver, backlog, shutdown).await;
        match &outcome {
            Ok(()) => info!(session = %self.session_id, "Redirector closed"),
            Err(e) => error!(session = %self.session_id, "Redirector session failed: {}", e),
        }

        self.tunnel.close();
        self.tunnel.join().await;
        self.helper.stop(self.shutdown_timeout).await;
        drop(self.socket);
        drop(self.guard);

        // Nobody waiting is fine.
        let _ = self.closed.send(Some(outcome));
    }
}

struct SessionInner {
    session_id: String,
    hello: HelperHello,
    intercept: Arc<ActiveIntercept>,
    table: Arc<FlowTable>,
    sender: TunnelSender,
    tunnel: TunnelHandle,
    stats: Arc<DispatcherStats>,
    shutdown: CancellationToken,
    closed: watch::Receiver<Option<Result<(), SessionError>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // Last handle gone: nobody can close the session any more.
        self.shutdown.cancel();
    }
}

/// Statistics for a running session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub active_flows: usize,
    pub tunnel: TunnelStatsSnapshot,
    pub dispatcher: DispatcherStatsSnapshot,
}

/// Handle to a started redirector session
///
/// Cheap to clone. The session closes when [`close`](Self::close) is called,
/// when the tunnel fails, or when the last handle is dropped.
#[derive(Clone)]
pub struct RedirectorHandle {
    inner: Arc<SessionInner>,
}

impl RedirectorHandle {
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Helper identification from the handshake
    pub fn helper_info(&self) -> &str {
        &self.inner.hello.helper_info
    }

    /// Switch the intercept spec.
    ///
    /// Flows already admitted are unaffected. Invalid text leaves the
    /// previous spec active.
    pub async fn set_intercept(&self, text: &str) -> Result<(), InvalidSpecSyntax> {
        let spec = self.inner.intercept.replace_from_text(text)?;
        info!(spec = %spec, "Intercept spec updated");

        if let Err(e) = self
            .inner
            .sender
            .send(Frame::InterceptConf {
                spec: spec.to_string(),
            })
            .await
        {
            warn!("Intercept spec not forwarded to helper: {}", e);
        }
        Ok(())
    }

    /// The active intercept spec
    pub fn intercept(&self) -> Arc<InterceptSpec> {
        self.inner.intercept.load()
    }

    /// Stop admitting flows and shut the session down. Idempotent.
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!(session = %self.inner.session_id, "Closing redirector");
            self.inner.shutdown.cancel();
        }
    }

    /// Wait for the session to end.
    ///
    /// `Ok(())` after a graceful [`close`](Self::close), otherwise the
    /// reason the tunnel went away. Can be called any number of times.
    pub async fn wait_closed(&self) -> Result<(), SessionError> {
        let mut closed = self.inner.closed.clone();
        let outcome = match closed.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => {
                return Err(SessionError::ChannelClosed {
                    reason: "session task ended unexpectedly".to_string(),
                })
            }
        };
        outcome.unwrap_or(Ok(()))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
            || self.inner.tunnel.is_closed()
            || self.inner.closed.borrow().is_some()
    }

    /// Keys of flows currently admitted
    pub fn active_flows(&self) -> Vec<FlowKey> {
        self.inner.table.keys()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.inner.session_id.clone(),
            active_flows: self.inner.table.len(),
            tunnel: self.inner.tunnel.stats(),
            dispatcher: self.inner.stats.snapshot(),
        }
    }
}

/// Private directory holding the tunnel socket for one session
struct SessionSocket {
    dir: PathBuf,
    path: PathBuf,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
}

impl SessionSocket {
    #[cfg(unix)]
    fn bind(parent: Option<&Path>, session_id: &str) -> std::io::Result<Self> {
        use std::os::unix::fs::DirBuilderExt;

        let parent = parent
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&parent)?;

        let dir = parent.join(format!("flowtap-{}", session_id));
        std::fs::DirBuilder::new().mode(0o700).create(&dir)?;

        let path = dir.join(SOCKET_NAME);
        let listener = match tokio::net::UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        };
        debug!("Tunnel socket bound at {}", path.display());
        Ok(Self {
            dir,
            path,
            listener,
        })
    }

    #[cfg(not(unix))]
    fn bind(_parent: Option<&Path>, _session_id: &str) -> std::io::Result<Self> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "local redirect mode requires Unix domain sockets",
        ))
    }

    fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    async fn accept(&self) -> std::io::Result<tokio::net::UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    #[cfg(not(unix))]
    async fn accept(&self) -> std::io::Result<tokio::io::DuplexStream> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "local redirect mode requires Unix domain sockets",
        ))
    }
}

impl Drop for SessionSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            debug!("Failed to remove {}: {}", self.dir.display(), e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::capability::StaticProbe;
    use crate::handler::{handler_fn, HandlerResult};
    use crate::launcher::TaskLauncher;
    use crate::stream::Stream;
    use bytes::Bytes;
    use flowtap_core::{ProcessDescriptor, StaticProcessSource, StreamError};
    use flowtap_tunnel::HelperConnection;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn tcp_key(port: u16) -> FlowKey {
        FlowKey::tcp(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
        )
    }

    fn curl() -> ProcessDescriptor {
        ProcessDescriptor::new(100, "/usr/bin/curl")
    }

    fn wget() -> ProcessDescriptor {
        ProcessDescriptor::new(200, "/usr/bin/wget")
    }

    fn options(dir: &Path, intercept: &str) -> RedirectorOptions {
        RedirectorOptions {
            intercept: intercept.to_string(),
            socket_dir: Some(dir.to_path_buf()),
            handshake_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_millis(200),
            ..RedirectorOptions::default()
        }
    }

    /// In-process helper that connects, acknowledges the first spec, reports
    /// ready and hands its connection to the test.
    fn fake_helper(
        connections: mpsc::UnboundedSender<HelperConnection>,
    ) -> impl HelperLauncher + 'static {
        TaskLauncher::new(move |endpoint: HelperEndpoint| {
            let connections = connections.clone();
            async move {
                let mut conn = HelperConnection::connect(
                    &endpoint.socket_path,
                    "fake-helper/1.0",
                    TunnelConfig::default(),
                )
                .await
                .expect("helper connects");
                let first = conn.next_frame().await.expect("initial spec");
                assert!(matches!(first, Frame::InterceptConf { .. }));
                conn.ready().await.expect("ready sent");
                let _ = connections.send(conn);
            }
        })
    }

    fn redirector(
        dir: &Path,
        intercept: &str,
    ) -> (LocalRedirector, mpsc::UnboundedReceiver<HelperConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let redirector = LocalRedirector::new(options(dir, intercept))
            .with_probe(StaticProbe::available())
            .with_launcher(fake_helper(tx))
            .with_process_source(StaticProcessSource::empty());
        (redirector, rx)
    }

    type Seen = mpsc::UnboundedSender<(FlowKey, Result<Vec<u8>, StreamError>)>;

    /// Reads each TCP flow to the end, replies "ok" and reports what it read.
    fn echo_handler(seen: Seen) -> impl FlowHandler {
        let udp_seen = seen.clone();
        handler_fn(
            move |stream| {
                let seen = seen.clone();
                async move { read_all_and_reply(stream, seen).await }
            },
            move |stream| {
                let seen = udp_seen.clone();
                async move { read_all_and_reply(stream, seen).await }
            },
        )
    }

    async fn read_all_and_reply(stream: Stream, seen: Seen) -> HandlerResult {
        let mut data = Vec::new();
        loop {
            match stream.read(1024).await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => {
                    let _ = seen.send((*stream.key(), Err(e)));
                    return Ok(());
                }
            }
        }
        stream.write(Bytes::from_static(b"ok")).await?;
        let _ = seen.send((*stream.key(), Ok(data)));
        stream.close().await;
        Ok(())
    }

    async fn next_conn(rx: &mut mpsc::UnboundedReceiver<HelperConnection>) -> HelperConnection {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_unavailable_capability_prevents_start() {
        let launches = Arc::new(AtomicUsize::new(0));
        let counter = launches.clone();
        let dir = tempfile::tempdir().unwrap();
        let redirector = LocalRedirector::new(options(dir.path(), "all"))
            .with_probe(StaticProbe::unavailable("network extension not activated"))
            .with_launcher(TaskLauncher::new(move |_endpoint: HelperEndpoint| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {}
            }));

        assert_eq!(
            redirector.capability_check().unwrap().as_str(),
            "network extension not activated"
        );
        let (seen, _rx) = mpsc::unbounded_channel();
        let err = redirector.start(echo_handler(seen)).await.err().unwrap();
        assert!(matches!(err, StartupError::Unavailable(_)));
        assert_eq!(launches.load(Ordering::SeqCst), 0);
        assert!(!redirector.is_started());
    }

    #[tokio::test]
    async fn test_flow_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (redirector, mut conns) = redirector(dir.path(), "all");
        let (seen, mut seen_rx) = mpsc::unbounded_channel();

        let handle = redirector.start(echo_handler(seen)).await.unwrap();
        assert_eq!(handle.helper_info(), "fake-helper/1.0");
        let mut helper = next_conn(&mut conns).await;

        let key = tcp_key(5000);
        helper.new_flow(key, curl()).await.unwrap();
        for chunk in ["GET /", " HTTP/1.1", "\r\n\r\n"] {
            helper.send_data(key, chunk.as_bytes().to_vec()).await.unwrap();
        }
        helper.close_flow(key).await.unwrap();

        let (seen_key, data) = seen_rx.recv().await.unwrap();
        assert_eq!(seen_key, key);
        assert_eq!(data.unwrap(), b"GET / HTTP/1.1\r\n\r\n".to_vec());

        assert_eq!(
            helper.next_frame().await.unwrap(),
            Frame::Data {
                key,
                data: Bytes::from_static(b"ok")
            }
        );
        assert_eq!(helper.next_frame().await.unwrap(), Frame::Close { key });

        let stats = handle.stats();
        assert_eq!(stats.dispatcher.flows_admitted, 1);
        handle.close();
        assert_eq!(handle.wait_closed().await, Ok(()));
    }

    #[tokio::test]
    async fn test_second_start_fails_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let (redirector, mut conns) = redirector(dir.path(), "none");
        let (seen, _seen_rx) = mpsc::unbounded_channel();

        let handle = redirector.start(echo_handler(seen.clone())).await.unwrap();
        let _helper = next_conn(&mut conns).await;
        assert!(redirector.is_started());

        let err = redirector.start(echo_handler(seen.clone())).await.err().unwrap();
        assert!(matches!(err, StartupError::AlreadyStarted));

        handle.close();
        handle.wait_closed().await.unwrap();
        assert!(!redirector.is_started());

        let again = redirector.start(echo_handler(seen)).await.unwrap();
        assert_ne!(again.session_id(), handle.session_id());
        again.close();
        again.wait_closed().await.unwrap();
    }

    #[tokio::test]
    async fn test_switching_spec_mid_session() {
        let dir = tempfile::tempdir().unwrap();
        let (redirector, mut conns) = redirector(dir.path(), "all");
        let (seen, mut seen_rx) = mpsc::unbounded_channel();

        let handle = redirector.start(echo_handler(seen)).await.unwrap();
        let mut helper = next_conn(&mut conns).await;

        let early = tcp_key(5001);
        helper.new_flow(early, wget()).await.unwrap();
        helper.send_data(early, &b"before"[..]).await.unwrap();
        while handle.active_flows().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.set_intercept("process:curl").await.unwrap();
        assert_eq!(
            helper.next_frame().await.unwrap(),
            Frame::InterceptConf {
                spec: "process:curl".to_string()
            }
        );
        assert!(helper.should_intercept(&curl()));
        assert!(!helper.should_intercept(&wget()));

        let late = tcp_key(5002);
        helper.new_flow(late, wget()).await.unwrap();
        assert_eq!(helper.next_frame().await.unwrap(), Frame::Reject { key: late });

        helper.send_data(early, &b" after"[..]).await.unwrap();
        helper.close_flow(early).await.unwrap();
        let (seen_key, data) = seen_rx.recv().await.unwrap();
        assert_eq!(seen_key, early);
        assert_eq!(data.unwrap(), b"before after".to_vec());

        handle.close();
        handle.wait_closed().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_spec_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let (redirector, mut conns) = redirector(dir.path(), "process:curl");
        let (seen, _seen_rx) = mpsc::unbounded_channel();

        let handle = redirector.start(echo_handler(seen)).await.unwrap();
        let _helper = next_conn(&mut conns).await;

        let err = handle.set_intercept("process:").await.unwrap_err();
        assert_eq!(err.input, "process:");
        assert_eq!(handle.intercept().to_string(), "process:curl");

        handle.close();
        handle.wait_closed().await.unwrap();
    }

    #[tokio::test]
    async fn test_helper_crash_fails_streams_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let (redirector, mut conns) = redirector(dir.path(), "all");
        let (seen, mut seen_rx) = mpsc::unbounded_channel();

        let handle = redirector.start(echo_handler(seen)).await.unwrap();
        let helper = next_conn(&mut conns).await;

        let key = tcp_key(5003);
        helper.new_flow(key, curl()).await.unwrap();
        while handle.active_flows().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        helper.shutdown().await;

        let (_, data) = seen_rx.recv().await.unwrap();
        assert!(matches!(data, Err(StreamError::ChannelClosed(_))));

        let outcome = handle.wait_closed().await;
        assert!(matches!(outcome, Err(SessionError::ChannelClosed { .. })));
        // Repeated waits see the same outcome.
        assert_eq!(handle.wait_closed().await, outcome);
        assert!(handle.is_closed());
        assert!(handle.active_flows().is_empty());
    }

    #[tokio::test]
    async fn test_socket_directory_is_removed_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let (redirector, mut conns) = redirector(dir.path(), "none");
        let (seen, _seen_rx) = mpsc::unbounded_channel();

        let handle = redirector.start(echo_handler(seen)).await.unwrap();
        let _helper = next_conn(&mut conns).await;
        let session_dir = dir.path().join(format!("flowtap-{}", handle.session_id()));
        assert!(session_dir.join(SOCKET_NAME).exists());

        handle.close();
        handle.wait_closed().await.unwrap();
        assert!(!session_dir.exists());
    }

    #[tokio::test]
    async fn test_handshake_timeout_when_helper_never_connects() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path(), "all");
        opts.handshake_timeout = Duration::from_millis(100);
        let redirector = LocalRedirector::new(opts).with_probe(StaticProbe::available());

        let (seen, _rx) = mpsc::unbounded_channel();
        let err = redirector.start(echo_handler(seen)).await.err().unwrap();
        assert!(matches!(err, StartupError::Timeout("helper connection")));
        assert!(!redirector.is_started());
    }

    #[tokio::test]
    async fn test_helper_exiting_early_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let redirector = LocalRedirector::new(options(dir.path(), "all"))
            .with_probe(StaticProbe::available())
            .with_launcher(TaskLauncher::new(|_endpoint: HelperEndpoint| async {}));

        let (seen, _rx) = mpsc::unbounded_channel();
        let err = redirector.start(echo_handler(seen)).await.err().unwrap();
        assert!(matches!(err, StartupError::Launch(LaunchError::ExitedEarly(_))));
    }

    #[tokio::test]
    async fn test_eventual_provisioning_returns_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path(), "all");
        opts.provisioning = ProvisioningMode::Eventual;

        let (tx, mut conns) = mpsc::unbounded_channel();
        let redirector = LocalRedirector::new(opts)
            .with_probe(StaticProbe::available())
            .with_launcher(TaskLauncher::new(move |endpoint: HelperEndpoint| {
                let tx = tx.clone();
                async move {
                    let conn = HelperConnection::connect(
                        &endpoint.socket_path,
                        "slow-helper",
                        TunnelConfig::default(),
                    )
                    .await
                    .expect("helper connects");
                    // Never reports ready.
                    let _ = tx.send(conn);
                    std::future::pending::<()>().await;
                }
            }));

        let (seen, _rx) = mpsc::unbounded_channel();
        let handle = tokio::time::timeout(WAIT, redirector.start(echo_handler(seen)))
            .await
            .unwrap()
            .unwrap();
        let _helper = next_conn(&mut conns).await;
        assert!(!handle.is_closed());

        handle.close();
        handle.wait_closed().await.unwrap();
    }
}
