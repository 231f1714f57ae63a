//! Native MariaDB/MySQL client.
//!
//! marlin speaks the client/server wire protocol directly: framed packets
//! with rolling sequence numbers, the protocol-10 handshake with optional
//! TLS upgrade and zlib compression, pluggable authentication, text and
//! binary (prepared) command execution with multi-result streaming, a
//! ref-counted prepared-statement cache, optional transaction replay across
//! reconnects, and a bounded connection pool with a process-wide registry.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use marlin::{Configuration, Session};
//!
//! let conf = std::sync::Arc::new(
//!     Configuration::builder()
//!         .host("localhost")
//!         .user("app")
//!         .password("secret")
//!         .database("orders")
//!         .build(),
//! );
//!
//! let mut session = Session::connect(conf)?;
//! let rows = session.query_rows("SELECT id, name FROM customer")?;
//! for row in &rows {
//!     let id: i64 = row.get(0)?;
//!     let name: String = row.get_by_name("name")?;
//!     println!("{id} {name}");
//! }
//! # Ok::<(), marlin_core::Error>(())
//! ```
//!
//! # Pooling
//!
//! ```rust,ignore
//! let pool = marlin::pool::registry::get_pool(&conf);
//! let mut conn = pool.get_connection()?;
//! conn.execute("INSERT INTO audit (what) VALUES ('checked out')")?;
//! // drop returns the connection to the pool
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod message;
pub mod pool;
pub mod protocol;
#[cfg(feature = "tls")]
pub mod tls;

pub use client::{
    CompleteResult, KillHandle, OkInfo, QueryResult, Row, Session, Statement, StreamingResult,
};
pub use codec::{DataType, Decodable, ParamValue};
pub use config::{Configuration, HostAddress, HostKind, IsolationLevel, SslMode, TlsOptions};
pub use marlin_core::{Date, DateTime, Error, Geometry, Result, Time, Value};
pub use message::ClientMessage;
pub use pool::{Pool, PoolStatus, PooledConnection};
