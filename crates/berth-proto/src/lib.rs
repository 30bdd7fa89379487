//! Protocol buffer definitions for the Berth control plane.
//!
//! Two surfaces share these types:
//!
//! - The gRPC `ResourceService` (list, port exposure, interactive exec),
//!   served over QUIC by `berth-server`.
//! - The broker event ingress: each delivery is one length-prefixed
//!   [`Event`] describing an instance lifecycle transition.
//!
//! The exec stream is a tagged sum in both directions: the client sends
//! `{Init, Input, Resize}` and the server answers with
//! `{Output, Error, Exit}`. Exactly one Exit frame terminates a session.

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

use prost::Message;
use thiserror::Error;

/// Generated protobuf types from berth.proto
pub mod berth {
    /// Version 1 of the Berth protocol
    pub mod v1 {
        tonic::include_proto!("berth.v1");
    }
}

pub use berth::v1::*;

/// Wire framing for broker event payloads: 4-byte big-endian length
/// followed by the protobuf-encoded [`Event`].
pub mod framing {
    use super::*;

    /// Frame header size in bytes
    pub const HEADER_SIZE: usize = 4;

    /// Maximum event payload size (1 MiB); anything larger is malformed
    pub const MAX_EVENT_SIZE: usize = 1024 * 1024;

    /// Errors that can occur decoding an event frame
    #[derive(Debug, Error)]
    pub enum FrameError {
        /// Frame shorter than its header
        #[error("truncated frame: {0} bytes")]
        Truncated(usize),

        /// Declared length exceeds the limit
        #[error("frame too large: {0} bytes (max: {MAX_EVENT_SIZE})")]
        TooLarge(usize),

        /// Declared length disagrees with the delivered body
        #[error("frame length mismatch: declared {declared}, got {actual}")]
        LengthMismatch {
            /// Length from the header
            declared: usize,
            /// Bytes actually present after the header
            actual: usize,
        },

        /// Payload is not a valid protobuf Event
        #[error("protobuf decode error: {0}")]
        Decode(#[from] prost::DecodeError),
    }

    /// Encode an event as a length-prefixed frame.
    pub fn encode_event(event: &Event) -> Vec<u8> {
        let payload = event.encode_to_vec();
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    /// Decode a length-prefixed event frame.
    pub fn decode_event(body: &[u8]) -> Result<Event, FrameError> {
        if body.len() < HEADER_SIZE {
            return Err(FrameError::Truncated(body.len()));
        }
        let declared = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        if declared > MAX_EVENT_SIZE {
            return Err(FrameError::TooLarge(declared));
        }
        let payload = &body[HEADER_SIZE..];
        if payload.len() != declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }
        Ok(Event::decode(payload)?)
    }
}
