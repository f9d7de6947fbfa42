//! Persistent socket transport.
//!
//! Implements [`Transport`](super::Transport) over a TCP stream, upgraded to
//! TLS when the endpoint asks for it and optionally tunneled through a
//! SOCKS4/SOCKS5/HTTP proxy. Frames are newline-terminated JSON objects.

mod client;
mod connection;
mod framing;

pub use client::TcpTransport;
