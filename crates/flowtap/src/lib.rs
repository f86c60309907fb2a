//! flowtap - local traffic redirector
//!
//! Intercepts TCP and UDP flows from selected processes and hands them to
//! caller-supplied async handlers as byte streams. A privileged helper does
//! the actual interception and talks to this library over a private Unix
//! socket tunnel.
//!
//! # Example
//!
//! ```no_run
//! use flowtap::{handler_fn, HandlerResult, LocalRedirector, RedirectorOptions, Stream};
//!
//! async fn on_tcp(stream: Stream) -> HandlerResult {
//!     let request = stream.read(4096).await?;
//!     tracing::info!(flow = %stream.key(), bytes = request.len(), "tcp request");
//!     Ok(())
//! }
//!
//! async fn on_udp(_stream: Stream) -> HandlerResult {
//!     Ok(())
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let redirector = LocalRedirector::new(RedirectorOptions::default());
//! if let Some(reason) = redirector.capability_check() {
//!     eprintln!("local redirect mode unavailable: {reason}");
//!     return Ok(());
//! }
//!
//! let handler = handler_fn(on_tcp, on_udp);
//! let session = redirector.start(handler).await?;
//! session.set_intercept("process:curl").await?;
//! session.wait_closed().await?;
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod launcher;
pub mod procfs;
pub mod redirector;
pub mod stream;

pub use capability::{CapabilityProbe, PlatformProbe, StaticProbe};
pub use dispatcher::{DispatcherStats, DispatcherStatsSnapshot, SessionDispatcher};
pub use error::{SessionError, StartupError};
pub use handler::{handler_fn, FlowHandler, FnHandler, HandlerResult};
pub use launcher::{
    AttachedLauncher, CommandLauncher, HelperEndpoint, HelperLauncher, HelperProcess,
    LaunchError, TaskLauncher,
};
pub use procfs::ProcfsProcessSource;
pub use redirector::{LocalRedirector, RedirectorHandle, RedirectorOptions, SessionStats};
pub use stream::Stream;

pub use flowtap_core::{
    describe_spec, FlowKey, InterceptSpec, InvalidSpecSyntax, ProcessDescriptor, ProcessSource,
    ProvisioningMode, StreamError, Transport, UnavailableReason,
};
