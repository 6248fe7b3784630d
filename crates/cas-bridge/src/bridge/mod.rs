//! Host-worker IPC bridge.
//!
//! # Architecture
//!
//! - **protocol**: request/response frames exchanged over the socket
//! - **commands**: typed start payloads and result values
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite
//! - **transport**: loopback listener and worker process monitor

pub mod codec;
pub mod commands;
pub mod protocol;
pub mod transport;
