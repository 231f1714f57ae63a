//! Pluggable authentication.
//!
//! The server names a plugin in the initial handshake; the client embeds
//! that plugin's scramble in the handshake response and then drives the auth
//! sub-protocol: the server may answer OK, ERR, an AuthSwitchRequest (0xFE,
//! new plugin and seed) or AuthMoreData (0x01) that the current plugin
//! consumes.

pub mod caching_sha2;
pub mod clear;
pub mod ed25519;
pub mod native;

use std::fmt;
use std::io::{Read, Write};

use marlin_core::{Error, Result};

use crate::config::Configuration;
use crate::message::AuthSwitch;
use crate::protocol::{OkPacket, PacketChannel, PacketReader};

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
pub const CLIENT_ED25519: &str = "client_ed25519";
pub const CLEAR_PASSWORD: &str = "mysql_clear_password";

/// Resolved credentials for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: Option<String>,
}

impl Credential {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }

    pub fn password_or_empty(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

/// Source of credentials; implementations may block (token services, vaults).
pub trait CredentialProvider: Send + Sync {
    fn credential(&self, conf: &Configuration) -> Result<Credential>;

    /// Override the auth plugin advertised by the server (some providers
    /// mint tokens that only work with a specific plugin).
    fn default_plugin(&self) -> Option<&str> {
        None
    }
}

impl fmt::Debug for dyn CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialProvider")
    }
}

/// Reads credentials from environment variables, the simplest provider shape
/// used by container deployments.
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    pub user_var: String,
    pub password_var: String,
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self {
            user_var: "MARLIN_USER".into(),
            password_var: "MARLIN_PASSWORD".into(),
        }
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn credential(&self, conf: &Configuration) -> Result<Credential> {
        let user = std::env::var(&self.user_var).unwrap_or_else(|_| conf.user.clone());
        let password = std::env::var(&self.password_var)
            .ok()
            .or_else(|| conf.password.clone());
        Ok(Credential { user, password })
    }
}

/// I/O and negotiation state handed to a plugin during the exchange.
pub struct AuthContext<'a, S> {
    pub channel: &'a mut PacketChannel<S>,
    pub conf: &'a Configuration,
    pub credential: &'a Credential,
    /// Seed the current exchange round is based on.
    pub seed: &'a [u8],
    /// The stream is TLS-protected.
    pub encrypted: bool,
}

/// One authentication plugin.
pub trait AuthenticationPlugin {
    /// Wire name, e.g. `mysql_native_password`.
    fn kind(&self) -> &'static str;

    /// Initial auth data: embedded in the handshake response, or sent as its
    /// own packet after an AuthSwitchRequest.
    fn scramble(
        &self,
        credential: &Credential,
        seed: &[u8],
        conf: &Configuration,
        encrypted: bool,
    ) -> Result<Vec<u8>>;

    /// Consume an AuthMoreData payload (without its 0x01 marker), writing
    /// whatever follow-up the sub-protocol requires.
    fn more_data<S: Read + Write>(&self, ctx: &mut AuthContext<'_, S>, data: &[u8]) -> Result<()> {
        let _ = (ctx, data);
        Err(Error::auth(
            "unexpected extra authentication data from server",
            Some(self.kind()),
        ))
    }
}

/// Statically-known plugin set, routed by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plugin {
    Native(native::NativePassword),
    CachingSha2(caching_sha2::CachingSha2),
    Ed25519(ed25519::Ed25519),
    Clear(clear::ClearPassword),
}

impl Plugin {
    pub fn lookup(name: &str) -> Result<Self> {
        match name {
            NATIVE_PASSWORD => Ok(Plugin::Native(native::NativePassword)),
            CACHING_SHA2_PASSWORD => Ok(Plugin::CachingSha2(caching_sha2::CachingSha2)),
            CLIENT_ED25519 => Ok(Plugin::Ed25519(ed25519::Ed25519)),
            CLEAR_PASSWORD => Ok(Plugin::Clear(clear::ClearPassword)),
            other => Err(Error::auth(
                format!("client does not support authentication plugin '{other}' requested by server"),
                Some(other),
            )),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Plugin::Native(p) => p.kind(),
            Plugin::CachingSha2(p) => p.kind(),
            Plugin::Ed25519(p) => p.kind(),
            Plugin::Clear(p) => p.kind(),
        }
    }

    pub fn scramble(
        &self,
        credential: &Credential,
        seed: &[u8],
        conf: &Configuration,
        encrypted: bool,
    ) -> Result<Vec<u8>> {
        match self {
            Plugin::Native(p) => p.scramble(credential, seed, conf, encrypted),
            Plugin::CachingSha2(p) => p.scramble(credential, seed, conf, encrypted),
            Plugin::Ed25519(p) => p.scramble(credential, seed, conf, encrypted),
            Plugin::Clear(p) => p.scramble(credential, seed, conf, encrypted),
        }
    }

    pub fn more_data<S: Read + Write>(
        &self,
        ctx: &mut AuthContext<'_, S>,
        data: &[u8],
    ) -> Result<()> {
        match self {
            Plugin::Native(p) => p.more_data(ctx, data),
            Plugin::CachingSha2(p) => p.more_data(ctx, data),
            Plugin::Ed25519(p) => p.more_data(ctx, data),
            Plugin::Clear(p) => p.more_data(ctx, data),
        }
    }
}

/// Drive the post-handshake-response authentication exchange to OK or error.
pub fn handle_exchange<S: Read + Write>(
    channel: &mut PacketChannel<S>,
    conf: &Configuration,
    credential: &Credential,
    initial_plugin: Plugin,
    initial_seed: &[u8],
    encrypted: bool,
    session_track: bool,
) -> Result<OkPacket> {
    let mut plugin = initial_plugin;
    let mut seed = initial_seed.to_vec();

    loop {
        let packet = channel.read_packet()?;
        match packet.first() {
            Some(0x00) => {
                return PacketReader::new(&packet)
                    .parse_ok_packet(session_track)
                    .ok_or_else(|| Error::handshake("malformed OK packet after authentication"));
            }
            Some(0xFF) => {
                let err = PacketReader::new(&packet)
                    .parse_err_packet()
                    .ok_or_else(|| Error::handshake("malformed ERR packet"))?;
                return Err(Error::auth(err.message, Some(plugin.kind())));
            }
            Some(0xFE) => {
                let switch = AuthSwitch::decode(&packet)?;
                plugin = Plugin::lookup(&switch.plugin)?;
                seed = switch.seed;
                let response = plugin.scramble(credential, &seed, conf, encrypted)?;
                channel.write_packet(&response)?;
            }
            Some(0x01) => {
                let mut ctx = AuthContext {
                    channel,
                    conf,
                    credential,
                    seed: &seed,
                    encrypted,
                };
                plugin.more_data(&mut ctx, &packet[1..])?;
            }
            _ => {
                return Err(Error::handshake(
                    "unexpected packet during authentication exchange",
                ));
            }
        }
    }
}
