//! Connection and pool configuration.
//!
//! A [`Configuration`] is built once and shared; sessions and pools read it
//! but never mutate it. Per-host learned values (`max_allowed_packet`,
//! `wait_timeout`) live on the shared [`HostAddress`] instead.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::auth::CredentialProvider;
use crate::protocol::{capabilities, charset};

/// SSL negotiation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Plaintext only.
    #[default]
    Disable,
    /// Require TLS but accept any server certificate.
    Trust,
    /// Require TLS and verify the certificate chain.
    VerifyCa,
    /// Require TLS, verify the chain and the hostname.
    VerifyFull,
}

impl SslMode {
    pub const fn use_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }
}

/// Transaction isolation levels settable at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub const fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ-UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ-COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE-READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Where the server lives: a TCP endpoint or a local stream socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostKind {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Socket(PathBuf),
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKind::Tcp { host, port } => write!(f, "{host}:{port}"),
            #[cfg(unix)]
            HostKind::Socket(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A host plus the per-host values learned from previous handshakes.
///
/// Shared between a pool and its sessions; the cache avoids re-querying
/// `@@max_allowed_packet` / `@@wait_timeout` on every connection to the same
/// host.
#[derive(Debug)]
pub struct HostAddress {
    pub kind: HostKind,
    /// Primary node (relevant for read-only and Galera validation).
    pub primary: bool,
    cache: Mutex<HostCache>,
}

#[derive(Debug, Default, Clone, Copy)]
struct HostCache {
    max_allowed_packet: u32,
    wait_timeout: u32,
}

impl HostAddress {
    pub fn new(kind: HostKind, primary: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            primary,
            cache: Mutex::new(HostCache::default()),
        })
    }

    pub fn cached_max_allowed_packet(&self) -> u32 {
        self.cache.lock().max_allowed_packet
    }

    pub fn cached_wait_timeout(&self) -> u32 {
        self.cache.lock().wait_timeout
    }

    pub fn set_cache(&self, max_allowed_packet: u32, wait_timeout: u32) {
        *self.cache.lock() = HostCache {
            max_allowed_packet,
            wait_timeout,
        };
    }

    pub fn has_cache(&self) -> bool {
        self.cache.lock().max_allowed_packet != 0
    }
}

/// TLS material locations.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM bundle to trust instead of the system roots.
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// Override the name checked against the certificate.
    pub server_name: Option<String>,
}

/// Complete connection configuration.
#[derive(Clone)]
pub struct Configuration {
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    pub host: Arc<HostAddress>,

    pub connect_timeout: Duration,
    pub socket_timeout: Option<Duration>,

    pub ssl_mode: SslMode,
    pub tls: TlsOptions,
    /// PEM file with the server RSA public key (caching_sha2 full auth
    /// without TLS).
    pub server_rsa_public_key_path: Option<PathBuf>,
    /// Allow fetching the RSA public key from the server over plaintext.
    pub allow_public_key_retrieval: bool,

    pub compression: bool,
    pub allow_local_infile: bool,

    pub autocommit: bool,
    pub isolation: IsolationLevel,
    /// `None`: leave the zone alone. `Some("disable")`: skip handling.
    /// Otherwise an IANA zone id forced onto the session.
    pub timezone: Option<String>,
    /// Extra `SET` assignments appended to the post-connect command.
    pub session_variables: BTreeMap<String, String>,
    pub connection_attributes: BTreeMap<String, String>,
    /// Set `read_only=1` on non-primary hosts.
    pub assure_read_only: bool,
    /// Accepted `wsrep_local_state` values; empty disables validation.
    pub galera_allowed_states: Vec<String>,

    pub prepare_cache_size: usize,
    /// Record redoable messages and replay the transaction on reconnect.
    pub transaction_replay: bool,
    /// Redo buffer cap before replay is abandoned for the transaction.
    pub transaction_replay_size: usize,
    pub default_fetch_size: usize,
    /// Use COM_RESET_CONNECTION when returning a session to the pool.
    pub use_reset_connection: bool,

    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub max_idle_time: Duration,
    pub pool_name: Option<String>,
    pub register_pool_metrics: bool,
    /// Idle age below which a pooled session skips validation on checkout.
    pub pool_valid_min_delay: Duration,

    pub credentials: Option<Arc<dyn CredentialProvider>>,
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("user", &self.user)
            .field("database", &self.database)
            .field("host", &self.host.kind)
            .field("ssl_mode", &self.ssl_mode)
            .field("compression", &self.compression)
            .field("pool", &(self.min_pool_size, self.max_pool_size))
            .finish_non_exhaustive()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: None,
            database: None,
            host: HostAddress::new(
                HostKind::Tcp {
                    host: "localhost".into(),
                    port: 3306,
                },
                true,
            ),
            connect_timeout: Duration::from_secs(30),
            socket_timeout: None,
            ssl_mode: SslMode::default(),
            tls: TlsOptions::default(),
            server_rsa_public_key_path: None,
            allow_public_key_retrieval: false,
            compression: false,
            allow_local_infile: false,
            autocommit: true,
            isolation: IsolationLevel::default(),
            timezone: None,
            session_variables: BTreeMap::new(),
            connection_attributes: BTreeMap::new(),
            assure_read_only: false,
            galera_allowed_states: Vec::new(),
            prepare_cache_size: 256,
            transaction_replay: false,
            transaction_replay_size: 64,
            default_fetch_size: 0,
            use_reset_connection: false,
            min_pool_size: 1,
            max_pool_size: 8,
            max_idle_time: Duration::from_secs(600),
            pool_name: None,
            register_pool_metrics: false,
            pool_valid_min_delay: Duration::from_millis(1000),
            credentials: None,
        }
    }
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder {
            conf: Configuration::default(),
        }
    }

    /// The capability set requested from the server. The effective set is
    /// `(requested ∩ advertised) ∪ mandatory`.
    pub fn requested_capabilities(&self) -> u64 {
        let mut caps = capabilities::DEFAULT_REQUESTED | capabilities::SESSION_TRACK;

        if self.database.is_some() {
            caps |= capabilities::CONNECT_WITH_DB;
        }
        if self.ssl_mode.use_ssl() {
            caps |= capabilities::SSL;
        }
        if self.compression {
            caps |= capabilities::COMPRESS;
        }
        if !self.connection_attributes.is_empty() {
            caps |= capabilities::CONNECT_ATTRS;
        }
        if self.allow_local_infile {
            caps |= capabilities::LOCAL_FILES;
        }
        caps
    }

    /// Exchange charset sent in the handshake response.
    pub fn exchange_charset(&self) -> u8 {
        charset::DEFAULT
    }

    /// Identity key for the pool registry: two configurations with the same
    /// key share a pool.
    pub fn pool_key(&self) -> String {
        format!(
            "{}|{}|{}|{:?}|{}",
            self.host.kind,
            self.user,
            self.database.as_deref().unwrap_or(""),
            self.ssl_mode,
            self.pool_name.as_deref().unwrap_or(""),
        )
    }

    /// Same credentials as configured?
    pub fn matches_credentials(&self, user: &str, password: Option<&str>) -> bool {
        self.user == user && self.password.as_deref() == password
    }

    /// Clone with different credentials (cross-credential pool acquire).
    pub fn with_credentials(&self, user: &str, password: Option<&str>) -> Self {
        let mut conf = self.clone();
        conf.user = user.to_owned();
        conf.password = password.map(str::to_owned);
        conf
    }
}

/// Builder mirroring the option names of the configuration surface.
pub struct ConfigurationBuilder {
    conf: Configuration,
}

impl ConfigurationBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        let port = match &self.conf.host.kind {
            HostKind::Tcp { port, .. } => *port,
            #[cfg(unix)]
            _ => 3306,
        };
        self.conf.host = HostAddress::new(HostKind::Tcp { host, port }, self.conf.host.primary);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        if let HostKind::Tcp { host, .. } = &self.conf.host.kind {
            self.conf.host = HostAddress::new(
                HostKind::Tcp {
                    host: host.clone(),
                    port,
                },
                self.conf.host.primary,
            );
        }
        self
    }

    #[cfg(unix)]
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.conf.host = HostAddress::new(HostKind::Socket(path.into()), self.conf.host.primary);
        self
    }

    pub fn primary(mut self, primary: bool) -> Self {
        self.conf.host = HostAddress::new(self.conf.host.kind.clone(), primary);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.conf.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.conf.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.conf.database = Some(database.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.conf.connect_timeout = timeout;
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.conf.socket_timeout = Some(timeout);
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.conf.ssl_mode = mode;
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.conf.tls = tls;
        self
    }

    pub fn server_rsa_public_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.conf.server_rsa_public_key_path = Some(path.into());
        self
    }

    pub fn allow_public_key_retrieval(mut self, allow: bool) -> Self {
        self.conf.allow_public_key_retrieval = allow;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.conf.compression = enabled;
        self
    }

    pub fn allow_local_infile(mut self, enabled: bool) -> Self {
        self.conf.allow_local_infile = enabled;
        self
    }

    pub fn autocommit(mut self, enabled: bool) -> Self {
        self.conf.autocommit = enabled;
        self
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.conf.isolation = level;
        self
    }

    pub fn timezone(mut self, zone: impl Into<String>) -> Self {
        self.conf.timezone = Some(zone.into());
        self
    }

    pub fn session_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.conf.session_variables.insert(name.into(), value.into());
        self
    }

    pub fn connection_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.conf
            .connection_attributes
            .insert(key.into(), value.into());
        self
    }

    pub fn assure_read_only(mut self, enabled: bool) -> Self {
        self.conf.assure_read_only = enabled;
        self
    }

    pub fn galera_allowed_states(mut self, states: impl IntoIterator<Item = String>) -> Self {
        self.conf.galera_allowed_states = states.into_iter().collect();
        self
    }

    pub fn prepare_cache_size(mut self, size: usize) -> Self {
        self.conf.prepare_cache_size = size;
        self
    }

    pub fn transaction_replay(mut self, enabled: bool) -> Self {
        self.conf.transaction_replay = enabled;
        self
    }

    pub fn transaction_replay_size(mut self, size: usize) -> Self {
        self.conf.transaction_replay_size = size;
        self
    }

    pub fn default_fetch_size(mut self, size: usize) -> Self {
        self.conf.default_fetch_size = size;
        self
    }

    pub fn use_reset_connection(mut self, enabled: bool) -> Self {
        self.conf.use_reset_connection = enabled;
        self
    }

    pub fn min_pool_size(mut self, size: usize) -> Self {
        self.conf.min_pool_size = size;
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.conf.max_pool_size = size;
        self
    }

    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.conf.max_idle_time = idle;
        self
    }

    pub fn pool_name(mut self, name: impl Into<String>) -> Self {
        self.conf.pool_name = Some(name.into());
        self
    }

    pub fn register_pool_metrics(mut self, enabled: bool) -> Self {
        self.conf.register_pool_metrics = enabled;
        self
    }

    pub fn pool_valid_min_delay(mut self, delay: Duration) -> Self {
        self.conf.pool_valid_min_delay = delay;
        self
    }

    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.conf.credentials = Some(provider);
        self
    }

    pub fn build(self) -> Configuration {
        self.conf
    }
}
