//! Wire codecs for the wasgate gateway.
//!
//! Pure parsing and encoding, no I/O: FastCGI records and PARAMS
//! ([`fcgi`]), WebSocket frames and the upgrade handshake ([`ws`]), minimal
//! HTTP request heads plus query/cookie helpers ([`http`]), and request
//! body parsing including multipart uploads ([`body`]).

pub mod body;
pub mod fcgi;
pub mod http;
pub mod ws;
