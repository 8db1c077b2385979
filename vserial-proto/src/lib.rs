//! Shared wire protocol for the vserial transport.
//!
//! A virtio-serial channel is a single byte stream with no message
//! boundaries. This crate turns it into a request/response pipe:
//!
//! - **channel**: deadline-aware reads and writes over the raw stream
//! - **http**: the HTTP/1.1 subset used for framing (Content-Length only)
//! - **envelope**: the JSON request/response schema inside each body
//! - **error**: transport and protocol error taxonomy
//!
//! Both the guest agent and the host client depend on this crate; neither
//! side carries its own copy of the framing rules.

pub mod channel;
pub mod envelope;
pub mod error;
pub mod http;
