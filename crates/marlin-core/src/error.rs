//! Error types for marlin operations.
//!
//! Every error kind maps to a stable SQLSTATE class so callers can branch on
//! `Error::sql_state()` without matching on variants:
//!
//! - connection/transport: `08xxx`
//! - authentication: `28000`
//! - protocol data (decode/encode): `22xxx`
//! - feature not supported: `0A000`
//! - server errors: SQLSTATE passed through from the ERR packet
//! - interrupted waiter: `70100`

use std::fmt;

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type for all marlin operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection and transport failures (socket, handshake, TLS, framing).
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Authentication exchange failures.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Data could not be decoded into or encoded from the requested type.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Error reported by the server in an ERR packet.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Connection pool failures.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A requested feature is not supported by this client.
    #[error("feature not supported: {0}")]
    Unsupported(String),

    /// Caller-side misuse (unknown column index or label), distinct from
    /// data decode failures.
    #[error("{0}")]
    Usage(String),

    /// A pipelined batch failed part-way; carries affected-row counts for
    /// the messages that completed before the failure.
    #[error("batch execution failed: {source}")]
    Batch {
        counts: Vec<u64>,
        #[source]
        source: Box<Error>,
    },

    /// A pool waiter was interrupted before a connection became available.
    #[error("thread was interrupted")]
    Interrupted,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    #[source]
    pub source: Option<std::io::Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the socket.
    Connect,
    /// Socket failed mid-exchange; the connection is unusable.
    Socket,
    /// Initial handshake could not be completed.
    Handshake,
    /// TLS negotiation failed.
    Tls,
    /// A command exceeded `max_allowed_packet`. When `must_reconnect` is set
    /// part of the command already reached the wire and the socket has been
    /// destroyed.
    MaxPacket { must_reconnect: bool },
    /// Operation attempted on a closed connection.
    Closed,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct AuthError {
    pub message: String,
    /// Plugin that produced the failure, when known.
    pub plugin: Option<String>,
}

/// Decode/encode failure. Carries the SQLSTATE subclass directly because the
/// codec layer distinguishes cast failures (`22018`), numeric overflow
/// (`22003`) and NULL-into-scalar (`22002`).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DecodeError {
    pub message: String,
    pub sqlstate: &'static str,
}

#[derive(Debug, Error)]
pub struct ServerError {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.code, self.message)
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// No connection became available before the acquire deadline.
    Timeout,
    /// Pool is closing or closed.
    Closed,
}

/// Server error codes after which the connection must be considered dead.
const FATAL_SERVER_CODES: [u16; 5] = [
    1927, // ER_CONNECTION_KILLED
    3032, // ER_SERVER_OFFLINE_MODE
    1161, // ER_NET_READ_INTERRUPTED
    1159, // ER_NET_READ_ERROR
    1160, // ER_NET_ERROR_ON_WRITE
];

impl Error {
    /// Stable SQLSTATE class for this error.
    pub fn sql_state(&self) -> &str {
        match self {
            Error::Connection(c) => match c.kind {
                ConnectionErrorKind::MaxPacket {
                    must_reconnect: false,
                } => "HZ000",
                _ => "08000",
            },
            Error::Auth(_) => "28000",
            Error::Decode(d) => d.sqlstate,
            Error::Server(s) => &s.sqlstate,
            Error::Pool(_) => "08000",
            Error::Unsupported(_) => "0A000",
            Error::Usage(_) => "HY000",
            Error::Batch { source, .. } => source.sql_state(),
            Error::Interrupted => "70100",
        }
    }

    /// Whether the session that produced this error is still usable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Connection(c) => !matches!(
                c.kind,
                ConnectionErrorKind::MaxPacket {
                    must_reconnect: false
                }
            ),
            Error::Auth(_) => true,
            Error::Server(s) => FATAL_SERVER_CODES.contains(&s.code),
            Error::Batch { source, .. } => source.is_fatal(),
            Error::Decode(_) => false,
            Error::Pool(_) | Error::Unsupported(_) | Error::Usage(_) | Error::Interrupted => false,
        }
    }

    /// Server error code, when this error came from an ERR packet.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(s) => Some(s.code),
            _ => None,
        }
    }

    pub(crate) fn connection(
        kind: ConnectionErrorKind,
        message: impl Into<String>,
        source: Option<std::io::Error>,
    ) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source,
        })
    }

    /// Socket-level failure: the connection is gone.
    pub fn socket(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::connection(ConnectionErrorKind::Socket, message, Some(source))
    }

    /// Failure to establish the initial connection.
    pub fn connect(message: impl Into<String>, source: Option<std::io::Error>) -> Self {
        Self::connection(ConnectionErrorKind::Connect, message, source)
    }

    /// Handshake-phase protocol failure.
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::connection(ConnectionErrorKind::Handshake, message, None)
    }

    /// TLS negotiation failure.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::connection(ConnectionErrorKind::Tls, message, None)
    }

    /// Command exceeded `max_allowed_packet`.
    pub fn max_packet(must_reconnect: bool) -> Self {
        Self::connection(
            ConnectionErrorKind::MaxPacket { must_reconnect },
            "packet too big for current server max_allowed_packet value",
            None,
        )
    }

    /// Operation on a closed connection.
    pub fn closed() -> Self {
        Self::connection(ConnectionErrorKind::Closed, "connection is closed", None)
    }

    pub fn auth(message: impl Into<String>, plugin: Option<&str>) -> Self {
        Error::Auth(AuthError {
            message: message.into(),
            plugin: plugin.map(str::to_owned),
        })
    }

    /// `"Data type X cannot be decoded as Y"` — the type tag itself is not
    /// convertible to the requested target.
    pub fn cannot_decode(source_type: &str, target: &str) -> Self {
        Error::Decode(DecodeError {
            message: format!("Data type {source_type} cannot be decoded as {target}"),
            sqlstate: "22018",
        })
    }

    /// `"value '…' cannot be decoded as Y"` — the type tag is fine but this
    /// particular value does not parse.
    pub fn bad_value(value: impl fmt::Display, target: &str) -> Self {
        Error::Decode(DecodeError {
            message: format!("value '{value}' cannot be decoded as {target}"),
            sqlstate: "22018",
        })
    }

    /// Numeric value does not fit the requested target type.
    pub fn numeric_overflow(value: impl fmt::Display, target: &str) -> Self {
        Error::Decode(DecodeError {
            message: format!("value '{value}' is out of range for {target}"),
            sqlstate: "22003",
        })
    }

    /// NULL decoded into a non-optional target.
    pub fn unexpected_null(target: &str) -> Self {
        Error::Decode(DecodeError {
            message: format!("NULL cannot be decoded as {target}; use an Option target"),
            sqlstate: "22002",
        })
    }

    pub fn pool_timeout(connect_timeout_ms: u64) -> Self {
        Error::Pool(PoolError {
            kind: PoolErrorKind::Timeout,
            message: format!(
                "No connection available within the specified time (option 'connect_timeout': {connect_timeout_ms} ms)"
            ),
        })
    }

    pub fn pool_closed() -> Self {
        Error::Pool(PoolError {
            kind: PoolErrorKind::Closed,
            message: "pool is closing".into(),
        })
    }
}
