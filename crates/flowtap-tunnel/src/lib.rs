//! flowtap tunnel - the channel between the redirector and its privileged helper
//!
//! The helper connects to a Unix socket owned by the redirector and both
//! sides exchange newline-delimited JSON frames. Flow data travels base64
//! encoded inside `data` frames.
//!
//! ```text
//! Helper                                    Redirector
//!   |  -- hello { protocol_version } -->       |
//!   |  <-- hello_ack / hello_nack ------------ |
//!   |  <-- intercept_conf { spec } ----------- |
//!   |  -- ready -->                            |
//!   |  -- new_flow / data / close / error -->  |
//!   |  <-- data / close / reject ------------- |
//! ```

pub mod channel;
pub mod codec;
pub mod frame;
pub mod handshake;
pub mod helper;

pub use channel::{
    FrameReceiver, TunnelChannel, TunnelConfig, TunnelError, TunnelHandle, TunnelSender,
    TunnelStats, TunnelStatsSnapshot,
};
pub use codec::{CodecError, FrameCodec, MalformedFrame};
pub use frame::Frame;
pub use handshake::{HandshakeError, HelperHello, PROTOCOL_VERSION};
pub use helper::HelperConnection;
