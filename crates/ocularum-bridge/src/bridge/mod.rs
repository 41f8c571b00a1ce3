//! Wire layer for host-worker communication.
//!
//! The worker speaks newline-delimited JSON on stdin/stdout.
//!
//! # Architecture
//!
//! - **framer**: splits the raw stdout byte stream into complete lines
//! - **protocol**: message types (Command, Response, Notification) and shape classification
//! - **codec**: Decoder/Encoder pairing the framer with JSON (de)serialization

pub mod codec;
pub mod framer;
pub mod protocol;
