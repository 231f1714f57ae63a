//! Typed client commands and server responses.

pub mod client;
pub mod server;

pub use client::{ClientMessage, HandshakeResponse, SslRequest};
pub use server::{AuthSwitch, ColumnDefinition, InitialHandshake, PrepareOk};
