//! Tunnel frames
//!
//! Every frame is one JSON object tagged by `type`. Flow frames carry the
//! flow key; control frames carry handshake and configuration data.

use bytes::Bytes;
use flowtap_core::{FlowKey, ProcessDescriptor};
use serde::{Deserialize, Serialize};

/// Message exchanged over the tunnel channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from the helper
    Hello {
        protocol_version: u32,
        helper_info: String,
    },

    /// Redirector accepted the helper
    HelloAck {
        protocol_version: u32,
        redirector_info: String,
    },

    /// Redirector refused the helper
    HelloNack { reason: String },

    /// Helper finished provisioning the tunnel
    Ready,

    /// Active intercept specification, in canonical text form
    InterceptConf { spec: String },

    /// Helper intercepted a new flow
    NewFlow {
        key: FlowKey,
        process: ProcessDescriptor,
    },

    /// Flow payload, either direction
    Data {
        key: FlowKey,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },

    /// Sender finished the flow
    Close { key: FlowKey },

    /// Flow failed on the sender's side
    Error { key: FlowKey, reason: String },

    /// Redirector declined a new flow; the helper lets it pass through
    Reject { key: FlowKey },
}

impl Frame {
    /// Flow key for flow frames
    pub fn flow_key(&self) -> Option<&FlowKey> {
        match self {
            Frame::NewFlow { key, .. }
            | Frame::Data { key, .. }
            | Frame::Close { key }
            | Frame::Error { key, .. }
            | Frame::Reject { key } => Some(key),
            _ => None,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::HelloAck { .. } => "hello_ack",
            Frame::HelloNack { .. } => "hello_nack",
            Frame::Ready => "ready",
            Frame::InterceptConf { .. } => "intercept_conf",
            Frame::NewFlow { .. } => "new_flow",
            Frame::Data { .. } => "data",
            Frame::Close { .. } => "close",
            Frame::Error { .. } => "error",
            Frame::Reject { .. } => "reject",
        }
    }

    /// Payload length for data frames
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Data { data, .. } => data.len(),
            _ => 0,
        }
    }
}

mod base64_bytes {
    use base64::prelude::*;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(|e| serde::de::Error::custom(format!("invalid base64 payload: {}", e)))
    }
}
