//! NDJSON frame codec
//!
//! One frame per line. Lines that are not valid frames are surfaced as
//! [`MalformedFrame`] items so the reader can count and skip them, including
//! lines that are not UTF-8. Only transport errors and oversized lines
//! terminate the stream.

use std::io;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::frame::Frame;

/// Default maximum length of one encoded frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Longest line excerpt kept for malformed frame reports
const EXCERPT_LEN: usize = 120;

/// Codec errors. All of them are fatal for the channel.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("frame exceeds maximum length of {max} bytes")]
    FrameTooLong { max: usize },

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A line that could not be decoded as a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFrame {
    pub error: String,
    pub excerpt: String,
}

/// Newline-delimited JSON codec for [`Frame`]
#[derive(Debug, Clone)]
pub struct FrameCodec {
    lines: LinesCodec,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_len),
            max_frame_len,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn map_lines_error(&self, err: LinesCodecError) -> CodecError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => CodecError::FrameTooLong {
                max: self.max_frame_len,
            },
            LinesCodecError::Io(e) => CodecError::Io(e),
        }
    }

    fn parse_line(line: &str) -> Result<Frame, MalformedFrame> {
        serde_json::from_str(line).map_err(|e| MalformedFrame {
            error: e.to_string(),
            excerpt: line.chars().take(EXCERPT_LEN).collect(),
        })
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, MalformedFrame>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = match self.lines.decode(src) {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                // The line has already been consumed, so the stream can go on
                Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    return Ok(Some(Err(MalformedFrame {
                        error: "line is not valid UTF-8".to_string(),
                        excerpt: String::new(),
                    })));
                }
                Err(e) => return Err(self.map_lines_error(e)),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(Self::parse_line(line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = match self.lines.decode_eof(src) {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                // The line has already been consumed, so the stream can go on
                Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    return Ok(Some(Err(MalformedFrame {
                        error: "line is not valid UTF-8".to_string(),
                        excerpt: String::new(),
                    })));
                }
                Err(e) => return Err(self.map_lines_error(e)),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(Self::parse_line(line)));
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&frame)?;
        if json.len() > self.max_frame_len {
            return Err(CodecError::FrameTooLong {
                max: self.max_frame_len,
            });
        }
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
