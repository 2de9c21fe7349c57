//! Signaling protocol for mesh calls.
//!
//! This crate defines the envelope exchanged between room members over the
//! relay and the JSON codec that validates it on the way in and out. The
//! relay never interprets payloads; everything it carries is a
//! [`envelope::SignalingEnvelope`].

#![warn(clippy::pedantic)]

pub mod envelope;
pub mod codec;

pub use codec::{decode_envelope, decode_envelope_bytes, encode_envelope, CodecError};
pub use envelope::*;
