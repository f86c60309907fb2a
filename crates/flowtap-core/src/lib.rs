//! flowtap core - intercept rules, flow bookkeeping, and configuration
//!
//! This crate holds the pieces of the local redirector that have no I/O of
//! their own:
//!
//! - **Intercept**: the specification language deciding which processes get redirected
//! - **Process**: process descriptors and the metadata source collaborator
//! - **Flow**: flow keys, per-flow state, and the concurrent flow table
//! - **Config**: TOML configuration with discovery and environment overrides

pub mod config;
pub mod error;
pub mod flow;
pub mod intercept;
pub mod process;

// Re-export commonly used types
pub use config::{ConfigLoader, FlowtapConfig, ProvisioningMode};
pub use error::{FlowTableError, InvalidSpecSyntax, StreamError, UnavailableReason};
pub use flow::{FlowKey, FlowStage, FlowState, FlowTable, Transport};
pub use intercept::{describe_spec, ActiveIntercept, InterceptSpec};
pub use process::{ProcessDescriptor, ProcessSource, StaticProcessSource};

/// Version string reported during the tunnel handshake
pub const FLOWTAP_VERSION: &str = env!("CARGO_PKG_VERSION");
