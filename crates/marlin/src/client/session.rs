//! The session: socket ownership and the command/result engine.
//!
//! A session is single-owner; exclusive `&mut` access replaces the
//! per-connection lock of classic drivers, and a streaming result keeps that
//! borrow for as long as it holds the socket. Cancellation runs through a
//! [`KillHandle`], which opens a parallel session to the same host.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use marlin_core::{Error, Result};
use tracing::{debug, trace, warn};

use crate::auth::{self, Credential, Plugin};
use crate::client::prepare_cache::{PrepareCache, PrepareResult};
use crate::client::redo::TransactionSaver;
use crate::client::result::{CompleteResult, OkInfo, QueryResult};
use crate::client::row::Row;
use crate::codec::ParamValue;
use crate::config::{Configuration, HostKind};
use crate::context::{state_flags, Context, ServerVersion};
use crate::message::client::{HandshakeResponse, SslRequest};
use crate::message::server::ColumnDefinition;
use crate::message::{ClientMessage, InitialHandshake};
use crate::protocol::framer::{ShutdownHandle, Stream, Transport};
use crate::protocol::{
    capabilities, server_status, PacketChannel, PacketReader, PacketType, MAX_PACKET_SIZE,
};

/// Validation ping timeout used by the pool.
pub(crate) const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A handle on a server-prepared statement.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) prepare: Arc<PrepareResult>,
    pub(crate) sql: String,
}

impl Statement {
    pub fn parameter_count(&self) -> usize {
        usize::from(self.prepare.num_params)
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.prepare.columns
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// One connection to the server.
pub struct Session {
    conf: Arc<Configuration>,
    channel: PacketChannel<Transport>,
    shutdown: Option<ShutdownHandle>,
    context: Context,
    prepare_cache: PrepareCache,
    redo: Option<TransactionSaver>,
    closed: bool,
    last_used: Instant,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("thread_id", &self.context.thread_id)
            .field("host", &self.conf.host.kind)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open a connection: socket, handshake, optional TLS and compression,
    /// authentication, post-connect session setup.
    pub fn connect(conf: Arc<Configuration>) -> Result<Self> {
        Self::connect_internal(conf, false)
    }

    fn connect_internal(conf: Arc<Configuration>, skip_post_commands: bool) -> Result<Self> {
        let stream = match &conf.host.kind {
            HostKind::Tcp { host, port } => Stream::connect_tcp(host, *port, conf.connect_timeout)?,
            #[cfg(unix)]
            HostKind::Socket(path) => Stream::connect_unix(path)?,
        };
        // Handshake reads are bounded by the connect timeout; the configured
        // socket timeout takes over afterwards.
        stream.set_read_timeout(Some(conf.connect_timeout)).ok();

        let shutdown = stream.shutdown_handle();
        let channel = PacketChannel::new(Transport::Plain(stream));
        let mut session = Self::establish(channel, shutdown, conf, skip_post_commands)?;
        session
            .channel
            .stream()
            .stream()
            .set_read_timeout(session.conf.socket_timeout)
            .ok();
        Ok(session)
    }

    /// Run the handshake over an already-open channel.
    fn establish(
        mut channel: PacketChannel<Transport>,
        shutdown: Option<ShutdownHandle>,
        conf: Arc<Configuration>,
        skip_post_commands: bool,
    ) -> Result<Self> {
        let first = channel.read_packet()?;
        if first.first() == Some(&0xFF) {
            let err = PacketReader::new(&first)
                .parse_err_packet()
                .ok_or_else(|| Error::handshake("malformed ERR packet"))?;
            return Err(Error::Server(marlin_core::error::ServerError {
                code: err.code,
                sqlstate: err.sql_state,
                message: err.message,
            }));
        }
        let handshake = InitialHandshake::decode(&first)?;
        debug!(
            server = %handshake.server_version,
            thread_id = handshake.thread_id,
            "server handshake received"
        );

        let effective = (conf.requested_capabilities() & handshake.capabilities)
            | capabilities::MANDATORY;

        let use_ssl = conf.ssl_mode.use_ssl();
        if use_ssl && handshake.capabilities & capabilities::SSL == 0 {
            return Err(Error::tls("server does not support TLS"));
        }

        let credential = match &conf.credentials {
            Some(provider) => provider.credential(&conf)?,
            None => Credential::new(conf.user.clone(), conf.password.clone()),
        };
        let plugin_name = conf
            .credentials
            .as_ref()
            .and_then(|p| p.default_plugin().map(str::to_owned))
            .unwrap_or_else(|| handshake.auth_plugin.clone());

        let collation = conf.exchange_charset();

        #[cfg(feature = "tls")]
        if use_ssl {
            let request = SslRequest {
                capabilities: effective,
                collation,
            };
            channel.write_packet(&request.payload())?;

            let HostKind::Tcp { host, .. } = &conf.host.kind else {
                return Err(Error::tls("TLS is only supported over TCP"));
            };
            let host = host.clone();
            let conf_ref = conf.clone();
            channel = channel.map_stream(move |transport| match transport {
                Transport::Plain(Stream::Tcp(tcp)) => {
                    let tls = crate::tls::TlsStream::upgrade(tcp, &conf_ref, &host)?;
                    Ok(Transport::Plain(Stream::Tls(Box::new(tls))))
                }
                _ => Err(Error::tls("TLS upgrade over a non-TCP stream")),
            })?;
        }
        #[cfg(not(feature = "tls"))]
        if use_ssl {
            let _ = SslRequest {
                capabilities: effective,
                collation,
            };
            return Err(Error::tls("TLS support is not compiled in"));
        }

        let plugin = Plugin::lookup(&plugin_name)?;
        let auth_response = plugin.scramble(&credential, &handshake.seed, &conf, use_ssl)?;

        let response = HandshakeResponse {
            capabilities: effective,
            collation,
            user: &credential.user,
            auth_response,
            database: conf.database.as_deref(),
            auth_plugin: plugin.kind(),
            connection_attributes: &conf.connection_attributes,
        };
        channel.write_packet(&response.payload())?;

        let session_track = effective & capabilities::SESSION_TRACK != 0;
        let ok = auth::handle_exchange(
            &mut channel,
            &conf,
            &credential,
            plugin,
            &handshake.seed,
            use_ssl,
            session_track,
        )?;

        if effective & capabilities::COMPRESS != 0 {
            channel = channel.map_stream(|transport| match transport {
                Transport::Plain(stream) => Ok(Transport::Compressed(
                    crate::protocol::compress::CompressedStream::new(stream),
                )),
                Transport::Compressed(_) => {
                    Err(Error::handshake("compression negotiated twice"))
                }
            })?;
        }

        let version = ServerVersion::parse(
            &handshake.server_version,
            handshake.capabilities & capabilities::CLIENT_MYSQL == 0,
        );
        let context = Context::new(
            handshake.thread_id,
            effective,
            handshake.capabilities,
            version,
            ok.status_flags,
            conf.database.clone(),
            conf.isolation,
            handshake.seed.clone(),
        );

        let mut session = Session {
            prepare_cache: PrepareCache::new(conf.prepare_cache_size),
            redo: conf
                .transaction_replay
                .then(|| TransactionSaver::new(conf.transaction_replay_size)),
            conf,
            channel,
            shutdown,
            context,
            closed: false,
            last_used: Instant::now(),
        };

        if !skip_post_commands {
            session.post_connect()?;
        }
        Ok(session)
    }

    // ------------------------------------------------------------------
    // post-connect setup
    // ------------------------------------------------------------------

    fn post_connect(&mut self) -> Result<()> {
        let server_tz = self.resolve_server_timezone()?;
        let set_command = self.session_variable_command(server_tz.as_deref());
        if let Err(e) = self.run_for_ok(&ClientMessage::Query { sql: set_command }) {
            if let Some(tz) = &self.conf.timezone {
                if !tz.eq_ignore_ascii_case("disable") {
                    return Err(Error::handshake(format!(
                        "setting configured timezone '{tz}' failed on server; load tz data on the server or set timezone=disable ({e})"
                    )));
                }
            }
            return Err(e);
        }

        self.validate_galera_state()?;
        self.load_host_limits()?;
        Ok(())
    }

    /// `SELECT @@time_zone`, falling back to `SHOW VARIABLES` for Galera
    /// non-primary nodes that refuse plain SELECTs outside the quorum.
    fn resolve_server_timezone(&mut self) -> Result<Option<String>> {
        let Some(tz) = &self.conf.timezone else {
            return Ok(None);
        };
        if tz.eq_ignore_ascii_case("disable") {
            return Ok(None);
        }

        match self.query_rows("SELECT @@time_zone, @@system_time_zone") {
            Ok(rs) => {
                let Some(row) = rs.first() else {
                    return Ok(None);
                };
                let mut zone: String = row.get(0)?;
                if zone == "SYSTEM" {
                    zone = row.get(1)?;
                }
                Ok(Some(zone))
            }
            Err(e) if !e.is_fatal() => {
                let rs = self.query_rows(
                    "SHOW VARIABLES WHERE Variable_name in ('system_time_zone','time_zone')",
                )?;
                let mut zone = None;
                let mut system_zone = None;
                for row in &rs {
                    let name: String = row.get(0)?;
                    let value: String = row.get(1)?;
                    if name == "system_time_zone" {
                        system_zone = Some(value);
                    } else {
                        zone = Some(value);
                    }
                }
                if zone.as_deref() == Some("SYSTEM") {
                    zone = system_zone;
                }
                Ok(zone)
            }
            Err(e) => Err(e),
        }
    }

    /// One `SET` covering everything the session diverges from server
    /// defaults on.
    fn session_variable_command(&self, server_tz: Option<&str>) -> String {
        let conf = &self.conf;
        let mut sql = String::from("set autocommit=");
        sql.push(if conf.autocommit { '1' } else { '0' });
        sql.push_str(", sql_mode = concat(@@sql_mode,',STRICT_TRANS_TABLES')");

        if self.context.session_track() {
            sql.push_str(", session_track_schema=1");
        }

        for (name, value) in &conf.session_variables {
            sql.push_str(", ");
            sql.push_str(name);
            sql.push('=');
            sql.push_str(value);
        }

        if let (Some(wanted), Some(server)) = (conf.timezone.as_deref(), server_tz) {
            if !wanted.eq_ignore_ascii_case("disable") && wanted != server {
                sql.push_str(", time_zone='");
                sql.push_str(wanted);
                sql.push('\'');
            }
        }

        if conf.assure_read_only
            && !conf.host.primary
            && self.context.version.at_least(5, 6, 5)
        {
            sql.push_str(", read_only=1");
        }

        let version = &self.context.version;
        let isolation_var = if !version.is_mariadb
            && (version.at_least(8, 0, 3) || (version.major < 8 && version.at_least(5, 7, 20)))
        {
            "transaction_isolation"
        } else {
            "tx_isolation"
        };
        sql.push_str(", ");
        sql.push_str(isolation_var);
        sql.push_str("='");
        sql.push_str(conf.isolation.as_sql());
        sql.push('\'');

        sql
    }

    fn validate_galera_state(&mut self) -> Result<()> {
        if self.conf.galera_allowed_states.is_empty() || !self.conf.host.primary {
            return Ok(());
        }
        let rs = self.query_rows("show status like 'wsrep_local_state'")?;
        let Some(row) = rs.first() else {
            return Err(Error::handshake("failed to validate Galera state"));
        };
        let state: String = row.get(1)?;
        if !self.conf.galera_allowed_states.iter().any(|s| s == &state) {
            return Err(Error::handshake(format!(
                "failed to validate Galera state (state is {state})"
            )));
        }
        Ok(())
    }

    /// Learn `max_allowed_packet` / `wait_timeout`, cached per host so a pool
    /// only pays for this once.
    fn load_host_limits(&mut self) -> Result<()> {
        if !self.conf.host.has_cache() {
            let fetched = match self.query_rows("SELECT @@max_allowed_packet, @@wait_timeout") {
                Ok(rs) => rs.first().map(|row| {
                    Ok::<_, Error>((row.get::<u32>(0)?, row.get::<u32>(1)?))
                }),
                Err(e) if !e.is_fatal() => {
                    // Galera non-primary nodes may only allow SHOW.
                    let rs = self.query_rows(
                        "SHOW VARIABLES WHERE Variable_name = 'max_allowed_packet' OR Variable_name = 'wait_timeout'",
                    )?;
                    let mut max_packet = 0u32;
                    let mut wait_timeout = 0u32;
                    for row in &rs {
                        let name: String = row.get(0)?;
                        let value: u32 = row.get(1)?;
                        if name == "wait_timeout" {
                            wait_timeout = value;
                        } else {
                            max_packet = value;
                        }
                    }
                    Some(Ok((max_packet, wait_timeout)))
                }
                Err(e) => return Err(e),
            };
            if let Some(limits) = fetched {
                let (max_packet, wait_timeout) = limits?;
                self.conf.host.set_cache(max_packet, wait_timeout);
            }
        }

        let cached = self.conf.host.cached_max_allowed_packet();
        if cached != 0 {
            self.channel.set_max_allowed_packet(cached as usize);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // command cycle
    // ------------------------------------------------------------------

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::closed())
        } else {
            Ok(())
        }
    }

    fn destroy(&mut self) {
        self.closed = true;
        if let Some(handle) = &self.shutdown {
            handle.shutdown();
        }
    }

    fn begin_command(&mut self) {
        self.channel.reset_sequence();
        self.channel.stream_mut().reset_compression_sequence();
    }

    fn send_message(&mut self, message: &ClientMessage) -> Result<()> {
        self.check_open()?;
        self.begin_command();
        trace!(command = %message.description(), "sending");
        match self.channel.write_packet(&message.payload()) {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_fatal() {
                    self.destroy();
                }
                Err(e)
            }
        }
    }

    fn read_packet(&mut self) -> Result<Vec<u8>> {
        match self.channel.read_packet() {
            Ok(p) => Ok(p),
            Err(e) => {
                self.destroy();
                Err(e)
            }
        }
    }

    fn server_error(&mut self, packet: &[u8]) -> Error {
        match PacketReader::new(packet).parse_err_packet() {
            Some(err) => {
                let error = Error::Server(marlin_core::error::ServerError {
                    code: err.code,
                    sqlstate: err.sql_state,
                    message: err.message,
                });
                if error.is_fatal() {
                    self.destroy();
                }
                error
            }
            None => {
                self.destroy();
                Error::handshake("malformed ERR packet")
            }
        }
    }

    fn apply_ok(&mut self, ok: &crate::protocol::OkPacket) {
        self.context.status = ok.status_flags;
        self.context.warnings = ok.warnings;
        if let Some(state) = &ok.session_state {
            self.apply_session_state(state);
        }
    }

    /// SESSION_TRACK payload: pick up schema changes so `database()` stays
    /// accurate without a round trip.
    fn apply_session_state(&mut self, raw: &[u8]) {
        let mut buf = PacketReader::new(raw);
        while let Some(kind) = buf.read_u8() {
            let Some(data) = buf.read_lenenc_bytes() else {
                return;
            };
            // type 1 = SESSION_TRACK_SCHEMA
            if kind == 1 {
                let mut sub = PacketReader::new(data);
                if let Some(schema) = sub.read_lenenc_string() {
                    self.context.database = Some(schema);
                }
            }
        }
    }

    /// Read one complete server response (OK, ERR, LOCAL INFILE dance, or a
    /// full result set).
    fn read_response(&mut self, binary_rows: bool, max_rows: usize) -> Result<QueryResult> {
        let packet = self.read_packet()?;
        let first = *packet
            .first()
            .ok_or_else(|| Error::handshake("empty response packet"))?;

        match PacketType::classify(first, packet.len(), self.context.eof_deprecated()) {
            PacketType::Ok => {
                let ok = PacketReader::new(&packet)
                    .parse_ok_packet(self.context.session_track())
                    .ok_or_else(|| Error::handshake("malformed OK packet"))?;
                self.apply_ok(&ok);
                Ok(QueryResult::Ok(OkInfo::from(&ok)))
            }
            PacketType::Error => Err(self.server_error(&packet)),
            PacketType::LocalInfile => {
                let filename = String::from_utf8_lossy(&packet[1..]).into_owned();
                self.send_local_infile(&filename)?;
                self.read_response(binary_rows, max_rows)
            }
            // Direct EOF responses (SET_OPTION on older servers, OK-EOF when
            // DEPRECATE_EOF is on).
            PacketType::Eof => {
                let (status, warnings) = if self.context.eof_deprecated() {
                    let ok = PacketReader::new(&packet)
                        .parse_ok_packet(self.context.session_track())
                        .ok_or_else(|| Error::handshake("malformed OK-EOF packet"))?;
                    self.apply_ok(&ok);
                    (ok.status_flags, ok.warnings)
                } else {
                    let eof = PacketReader::new(&packet)
                        .parse_eof_packet()
                        .ok_or_else(|| Error::handshake("malformed EOF packet"))?;
                    self.context.status = eof.status_flags;
                    self.context.warnings = eof.warnings;
                    (eof.status_flags, eof.warnings)
                };
                Ok(QueryResult::Ok(OkInfo {
                    affected_rows: 0,
                    last_insert_id: 0,
                    status,
                    warnings,
                }))
            }
            PacketType::Data => self.read_result_set(&packet, binary_rows, max_rows),
        }
    }

    fn read_result_set(
        &mut self,
        header: &[u8],
        binary_rows: bool,
        max_rows: usize,
    ) -> Result<QueryResult> {
        let column_count = PacketReader::new(header)
            .read_lenenc_int()
            .ok_or_else(|| Error::handshake("malformed result set header"))?
            as usize;

        let columns = self.read_column_definitions(column_count)?;

        let mut rows = Vec::new();
        loop {
            match self.read_row_packet(&columns, binary_rows)? {
                RowOrEnd::Row(row) => {
                    if max_rows == 0 || rows.len() < max_rows {
                        rows.push(row);
                    }
                }
                RowOrEnd::End { status, warnings } => {
                    return Ok(QueryResult::ResultSet(CompleteResult::new(
                        columns, rows, status, warnings,
                    )));
                }
            }
        }
    }

    fn read_column_definitions(&mut self, count: usize) -> Result<Arc<[ColumnDefinition]>> {
        let extended = self
            .context
            .has_capability(capabilities::MARIADB_EXTENDED_METADATA);
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.read_packet()?;
            columns.push(ColumnDefinition::decode(payload, extended)?);
        }
        if !self.context.eof_deprecated() {
            // Column phase terminator.
            let eof = self.read_packet()?;
            if eof.first() != Some(&0xFE) {
                self.destroy();
                return Err(Error::handshake("expected EOF after column definitions"));
            }
        }
        Ok(Arc::from(columns))
    }

    fn read_row_packet(
        &mut self,
        columns: &Arc<[ColumnDefinition]>,
        binary_rows: bool,
    ) -> Result<RowOrEnd> {
        let packet = self.read_packet()?;
        match packet.first() {
            Some(&0xFF) => Err(self.server_error(&packet)),
            Some(&0xFE)
                if packet.len() < 9
                    || (self.context.eof_deprecated() && packet.len() < MAX_PACKET_SIZE) =>
            {
                let (status, warnings) = if self.context.eof_deprecated() {
                    let ok = PacketReader::new(&packet)
                        .parse_ok_packet(self.context.session_track())
                        .ok_or_else(|| Error::handshake("malformed OK-EOF packet"))?;
                    self.apply_ok(&ok);
                    (ok.status_flags, ok.warnings)
                } else {
                    let eof = PacketReader::new(&packet)
                        .parse_eof_packet()
                        .ok_or_else(|| Error::handshake("malformed EOF packet"))?;
                    self.context.status = eof.status_flags;
                    self.context.warnings = eof.warnings;
                    (eof.status_flags, eof.warnings)
                };
                Ok(RowOrEnd::End { status, warnings })
            }
            Some(_) => {
                let row = if binary_rows {
                    Row::parse_binary(columns.clone(), packet)?
                } else {
                    Row::parse_text(columns.clone(), packet)?
                };
                Ok(RowOrEnd::Row(row))
            }
            None => {
                self.destroy();
                Err(Error::handshake("empty row packet"))
            }
        }
    }

    /// LOCAL INFILE: stream the named file in packets, then the empty
    /// terminator. A disabled configuration answers with just the
    /// terminator and lets the server report the failure.
    fn send_local_infile(&mut self, filename: &str) -> Result<()> {
        if self.conf.allow_local_infile {
            let data = std::fs::read(filename).unwrap_or_default();
            for chunk in data.chunks(0x20_0000) {
                self.channel.write_packet(chunk)?;
            }
        } else {
            warn!(filename, "LOCAL INFILE request refused (allow_local_infile is off)");
        }
        self.channel.write_empty_packet()
    }

    /// Send one message and read all of its results (multi-result streams
    /// are drained into the vector).
    fn run_message(&mut self, message: &ClientMessage, max_rows: usize) -> Result<Vec<QueryResult>> {
        self.send_message(message)?;
        let binary = matches!(message, ClientMessage::Execute { .. });
        let mut results = Vec::new();
        if message.expected_responses() == 0 {
            return Ok(results);
        }
        loop {
            let result = self
                .read_response(binary, max_rows)
                .map_err(|e| attach_description(e, message))?;
            results.push(result);
            if !self.context.more_results() {
                break;
            }
        }
        Ok(results)
    }

    fn run_for_ok(&mut self, message: &ClientMessage) -> Result<OkInfo> {
        let results = self.execute_message(message.clone(), 0)?;
        match results.into_iter().next() {
            Some(QueryResult::Ok(ok)) => Ok(ok),
            Some(QueryResult::ResultSet(_)) => Err(Error::Usage(format!(
                "statement produced a result set: {}",
                message.description()
            ))),
            None => Err(Error::handshake("missing server response")),
        }
    }

    // ------------------------------------------------------------------
    // transaction replay
    // ------------------------------------------------------------------

    /// Execute with redo bookkeeping and, when enabled, transparent replay
    /// of the current transaction on a fresh connection.
    pub(crate) fn execute_message(
        &mut self,
        message: ClientMessage,
        max_rows: usize,
    ) -> Result<Vec<QueryResult>> {
        match self.run_message(&message, max_rows) {
            Ok(results) => {
                self.record_redo(&message);
                Ok(results)
            }
            Err(error) if error.is_fatal() && self.replay_possible() => {
                debug!(%error, "connection lost, replaying transaction");
                self.replay_and_retry(message, max_rows, error)
            }
            Err(error) => Err(error),
        }
    }

    fn record_redo(&mut self, message: &ClientMessage) {
        let in_transaction = self.context.in_transaction();
        if let Some(saver) = &mut self.redo {
            if !in_transaction {
                saver.clear();
            } else if message.redoable() {
                saver.record(message.clone());
            }
        }
    }

    fn replay_possible(&self) -> bool {
        self.conf.transaction_replay && self.redo.as_ref().is_some_and(|s| !s.is_dirty())
    }

    fn replay_and_retry(
        &mut self,
        message: ClientMessage,
        max_rows: usize,
        original: Error,
    ) -> Result<Vec<QueryResult>> {
        let saved: Vec<ClientMessage> = self
            .redo
            .as_ref()
            .map(|s| s.messages().to_vec())
            .unwrap_or_default();

        let mut fresh = match Session::connect_internal(self.conf.clone(), false) {
            Ok(s) => s,
            Err(_) => return Err(original),
        };

        let mut replayed = Vec::with_capacity(saved.len());
        for msg in saved {
            let fixed = match fresh.reprepare_for_replay(&msg) {
                Ok(m) => m,
                Err(_) => return Err(original),
            };
            if fresh.run_message(&fixed, 0).is_err() {
                return Err(original);
            }
            replayed.push(fixed);
        }

        let final_message = match fresh.reprepare_for_replay(&message) {
            Ok(m) => m,
            Err(_) => return Err(original),
        };
        let results = fresh.run_message(&final_message, max_rows)?;

        // Adopt the replacement connection; the redo buffer keeps the
        // transaction so a second failure can replay again.
        let mut saver = self
            .redo
            .take()
            .unwrap_or_else(|| TransactionSaver::new(self.conf.transaction_replay_size));
        saver.clear();
        for msg in replayed {
            saver.record(msg);
        }
        fresh.redo = Some(saver);
        *self = fresh;
        self.record_redo(&final_message);
        Ok(results)
    }

    /// Statement ids do not survive the old connection; re-prepare and
    /// substitute before replaying.
    fn reprepare_for_replay(&mut self, message: &ClientMessage) -> Result<ClientMessage> {
        match message.prepared_sql() {
            Some(sql) => {
                let sql = sql.to_owned();
                let statement = self.prepare(&sql)?;
                Ok(message.with_statement_id(statement.prepare.statement_id))
            }
            None => Ok(message.clone()),
        }
    }

    // ------------------------------------------------------------------
    // public command surface
    // ------------------------------------------------------------------

    /// Text-protocol query; returns every result of a multi-result stream.
    pub fn query(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        self.execute_message(
            ClientMessage::Query {
                sql: sql.to_owned(),
            },
            0,
        )
    }

    /// Text-protocol query expecting a single result set.
    pub fn query_rows(&mut self, sql: &str) -> Result<CompleteResult> {
        let results = self.query(sql)?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| Error::handshake("missing server response"))?
            .into_result_set()
    }

    /// Statement that must not return rows.
    pub fn execute(&mut self, sql: &str) -> Result<OkInfo> {
        self.run_for_ok(&ClientMessage::Query {
            sql: sql.to_owned(),
        })
    }

    /// Prepare a statement, going through the per-session cache.
    pub fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.check_open()?;
        if let Some(prepare) = self.prepare_cache.get(sql) {
            return Ok(Statement {
                prepare,
                sql: sql.to_owned(),
            });
        }

        let message = ClientMessage::Prepare {
            sql: sql.to_owned(),
        };
        self.send_message(&message)?;

        let packet = self.read_packet()?;
        if packet.first() == Some(&0xFF) {
            return Err(attach_description(self.server_error(&packet), &message));
        }
        let ok = crate::message::PrepareOk::decode(&packet)?;

        // Parameter definitions carry no information we keep.
        for _ in 0..ok.num_params {
            self.read_packet()?;
        }
        if ok.num_params > 0 && !self.context.eof_deprecated() {
            self.read_packet()?;
        }
        let columns = if ok.num_columns > 0 {
            self.read_column_definitions(usize::from(ok.num_columns))?
        } else {
            Arc::from(Vec::new())
        };

        let prepare = PrepareResult::new(ok.statement_id, ok.num_params, columns.to_vec());
        let (winner, to_close) = self.prepare_cache.put(sql, prepare);
        for statement_id in to_close {
            self.send_message(&ClientMessage::CloseStatement { statement_id })?;
        }

        Ok(Statement {
            prepare: winner,
            sql: sql.to_owned(),
        })
    }

    /// Execute a prepared statement with binary parameters.
    pub fn execute_statement(
        &mut self,
        statement: &Statement,
        params: Vec<ParamValue>,
    ) -> Result<Vec<QueryResult>> {
        if params.len() != statement.parameter_count() {
            return Err(Error::Usage(format!(
                "statement expects {} parameters, got {}",
                statement.parameter_count(),
                params.len()
            )));
        }
        self.execute_message(
            ClientMessage::Execute {
                statement_id: statement.prepare.statement_id,
                sql: statement.sql.clone(),
                params,
            },
            0,
        )
    }

    /// Stream an oversized parameter ahead of execute.
    pub fn send_long_data(
        &mut self,
        statement: &Statement,
        param_index: u16,
        data: &[u8],
    ) -> Result<()> {
        self.send_message(&ClientMessage::LongData {
            statement_id: statement.prepare.statement_id,
            param_index,
            data: data.to_vec(),
        })
    }

    /// Reset accumulated long data and cursors for a prepared statement.
    pub fn reset_statement(&mut self, statement: &Statement) -> Result<OkInfo> {
        self.run_for_ok(&ClientMessage::ResetStatement {
            statement_id: statement.prepare.statement_id,
        })
    }

    /// Drop a statement handle, closing it server-side when it was the last
    /// one and the cache no longer holds it.
    pub fn close_statement(&mut self, statement: Statement) -> Result<()> {
        if statement.prepare.decrement_use() {
            self.send_message(&ClientMessage::CloseStatement {
                statement_id: statement.prepare.statement_id,
            })?;
        }
        Ok(())
    }

    /// Pipeline several commands: write them all, then read responses
    /// strictly in order. On failure the remaining responses are drained and
    /// the error carries the affected-row counts collected so far.
    pub fn execute_pipeline(&mut self, messages: &[ClientMessage]) -> Result<Vec<QueryResult>> {
        self.check_open()?;

        // The server numbers each command's responses after that command's
        // own request frames; remember where each request left off.
        let mut response_starts = Vec::with_capacity(messages.len());
        for message in messages {
            self.send_message(message)?;
            response_starts.push(self.channel.sequence());
        }

        let mut results = Vec::new();
        let mut failure: Option<Error> = None;
        for (i, message) in messages.iter().enumerate() {
            if i > 0 {
                self.channel.set_sequence(response_starts[i]);
                self.channel
                    .stream_mut()
                    .set_compression_sequence(response_starts[i]);
            }
            let binary = matches!(message, ClientMessage::Execute { .. });
            for _ in 0..message.expected_responses() {
                if self.closed {
                    break;
                }
                loop {
                    match self.read_response(binary, 0) {
                        Ok(result) => {
                            results.push(result);
                        }
                        Err(e) => {
                            if failure.is_none() {
                                failure = Some(attach_description(e, message));
                            }
                            break;
                        }
                    }
                    if !self.context.more_results() {
                        break;
                    }
                }
            }
        }

        match failure {
            None => {
                for message in messages {
                    self.record_redo(message);
                }
                Ok(results)
            }
            Some(source) => {
                let counts = results
                    .iter()
                    .filter_map(|r| r.as_ok().map(|ok| ok.affected_rows))
                    .collect();
                Err(Error::Batch {
                    counts,
                    source: Box::new(source),
                })
            }
        }
    }

    /// Start a streaming query: rows are pulled from the socket on demand
    /// and the session stays borrowed until the stream is closed.
    pub fn query_streaming(&mut self, sql: &str, fetch_size: usize) -> Result<StreamingResult<'_>> {
        let message = ClientMessage::Query {
            sql: sql.to_owned(),
        };
        self.send_message(&message)?;

        let packet = self.read_packet()?;
        let first = *packet
            .first()
            .ok_or_else(|| Error::handshake("empty response packet"))?;
        match PacketType::classify(first, packet.len(), false) {
            PacketType::Ok => {
                let ok = PacketReader::new(&packet)
                    .parse_ok_packet(self.context.session_track())
                    .ok_or_else(|| Error::handshake("malformed OK packet"))?;
                self.apply_ok(&ok);
                Ok(StreamingResult::finished(self, OkInfo::from(&ok)))
            }
            PacketType::Error => Err(attach_description(self.server_error(&packet), &message)),
            _ => {
                let column_count = PacketReader::new(&packet)
                    .read_lenenc_int()
                    .ok_or_else(|| Error::handshake("malformed result set header"))?
                    as usize;
                let columns = self.read_column_definitions(column_count)?;
                Ok(StreamingResult::open(self, columns, fetch_size))
            }
        }
    }

    // ------------------------------------------------------------------
    // maintenance surface
    // ------------------------------------------------------------------

    pub fn ping(&mut self) -> Result<()> {
        self.run_for_ok(&ClientMessage::Ping).map(drop)
    }

    /// Pool validation: ping with a bounded read timeout.
    pub fn is_valid(&mut self, timeout: Duration) -> bool {
        if self.closed {
            return false;
        }
        let previous = self.conf.socket_timeout;
        self.set_read_timeout(Some(timeout)).ok();
        let alive = self.ping().is_ok();
        self.set_read_timeout(previous).ok();
        alive
    }

    pub fn change_database(&mut self, database: &str) -> Result<()> {
        self.run_for_ok(&ClientMessage::ChangeDb {
            database: database.to_owned(),
        })?;
        self.context.database = Some(database.to_owned());
        self.context.mark_changed(state_flags::DATABASE);
        Ok(())
    }

    /// Enable or disable multi-statement parsing (COM_SET_OPTION).
    pub fn set_multi_statements(&mut self, enabled: bool) -> Result<()> {
        let option = if enabled { 0 } else { 1 };
        match self.run_for_ok(&ClientMessage::SetOption { option }) {
            Ok(_) => Ok(()),
            // Servers answer SET_OPTION with an EOF; treat a lone EOF as OK.
            Err(Error::Usage(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Return the session to its pooled baseline.
    pub fn reset(&mut self) -> Result<()> {
        self.check_open()?;

        if self.context.in_transaction() {
            self.execute("ROLLBACK")?;
        }
        if let Some(saver) = &mut self.redo {
            saver.clear();
        }

        let server_supports_reset = if self.context.version.is_mariadb {
            self.context.version.at_least(10, 2, 4)
        } else {
            self.context.version.at_least(5, 7, 3)
        };

        if self.conf.use_reset_connection && server_supports_reset {
            self.run_for_ok(&ClientMessage::ResetConnection)?;
            // RESET CONNECTION deallocates prepared statements server-side.
            self.prepare_cache.reset();
            self.context.reset_state_changes();
            return Ok(());
        }

        let changes = self.context.state_changes;
        if changes & state_flags::DATABASE != 0 {
            if let Some(db) = self.conf.database.clone() {
                self.run_for_ok(&ClientMessage::ChangeDb { database: db })?;
            }
            self.context.database = self.conf.database.clone();
        }
        if changes & state_flags::ISOLATION != 0 || changes & state_flags::AUTOCOMMIT != 0 {
            let sql = format!(
                "set autocommit={}, tx_isolation='{}'",
                u8::from(self.conf.autocommit),
                self.conf.isolation.as_sql()
            );
            self.run_for_ok(&ClientMessage::Query { sql })?;
            self.context.isolation = self.conf.isolation;
        }
        for statement_id in self.prepare_cache.reset() {
            self.send_message(&ClientMessage::CloseStatement { statement_id })?;
        }
        self.context.reset_state_changes();
        Ok(())
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.channel
            .stream()
            .stream()
            .set_read_timeout(timeout)
            .map_err(|e| Error::socket("cannot set socket timeout", e))
    }

    /// Cancellation handle usable from other threads.
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            conf: self.conf.clone(),
            thread_id: self.context.thread_id,
            shutdown: self
                .channel
                .stream()
                .stream()
                .shutdown_handle(),
        }
    }

    /// Graceful close: best-effort QUIT, then socket teardown.
    pub fn close(mut self) {
        self.close_in_place();
    }

    pub(crate) fn close_in_place(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.send_message(&ClientMessage::Quit);
        self.destroy();
    }

    /// Hard close without QUIT.
    pub fn abort(mut self) {
        self.destroy();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn thread_id(&self) -> u32 {
        self.context.thread_id
    }

    pub fn server_version(&self) -> &ServerVersion {
        &self.context.version
    }

    pub fn database(&self) -> Option<&str> {
        self.context.database.as_deref()
    }

    pub fn in_transaction(&self) -> bool {
        self.context.in_transaction()
    }

    pub fn warnings(&self) -> u16 {
        self.context.warnings
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            self.close_in_place();
        }
    }
}

enum RowOrEnd {
    Row(Row),
    End { status: u16, warnings: u16 },
}

fn attach_description(error: Error, message: &ClientMessage) -> Error {
    match error {
        Error::Server(mut server) => {
            server.message = format!("{} (command: {})", server.message, message.description());
            Error::Server(server)
        }
        other => other,
    }
}

/// A result set whose rows are read from the socket on demand. Holds the
/// session borrow (and therefore the socket) until dropped; dropping
/// mid-stream skips the remaining rows so the connection is command-ready
/// again.
pub struct StreamingResult<'a> {
    session: &'a mut Session,
    columns: Arc<[ColumnDefinition]>,
    fetch_size: usize,
    buffered: std::collections::VecDeque<Row>,
    finished: bool,
    ok: Option<OkInfo>,
}

impl<'a> StreamingResult<'a> {
    fn open(session: &'a mut Session, columns: Arc<[ColumnDefinition]>, fetch_size: usize) -> Self {
        Self {
            session,
            columns,
            fetch_size: fetch_size.max(1),
            buffered: std::collections::VecDeque::new(),
            finished: false,
            ok: None,
        }
    }

    fn finished(session: &'a mut Session, ok: OkInfo) -> Self {
        Self {
            session,
            columns: Arc::from(Vec::new()),
            fetch_size: 1,
            buffered: std::collections::VecDeque::new(),
            finished: true,
            ok: Some(ok),
        }
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// The OK summary, once the stream is exhausted.
    pub fn ok_info(&self) -> Option<&OkInfo> {
        self.ok.as_ref()
    }

    fn fetch_batch(&mut self) -> Result<()> {
        for _ in 0..self.fetch_size {
            if self.finished {
                break;
            }
            match self.session.read_row_packet(&self.columns, false)? {
                RowOrEnd::Row(row) => self.buffered.push_back(row),
                RowOrEnd::End { status, warnings } => {
                    self.finished = true;
                    self.ok = Some(OkInfo {
                        affected_rows: 0,
                        last_insert_id: 0,
                        status,
                        warnings,
                    });
                }
            }
        }
        Ok(())
    }

    /// Next row, fetching another batch from the socket when the buffer
    /// runs dry.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if self.buffered.is_empty() && !self.finished {
            self.fetch_batch()?;
        }
        Ok(self.buffered.pop_front())
    }

    /// Drain the socket to the result terminator, discarding rows.
    pub fn skip_remaining(&mut self) -> Result<()> {
        while !self.finished {
            match self.session.read_row_packet(&self.columns, false)? {
                RowOrEnd::Row(_) => {}
                RowOrEnd::End { status, warnings } => {
                    self.finished = true;
                    self.ok = Some(OkInfo {
                        affected_rows: 0,
                        last_insert_id: 0,
                        status,
                        warnings,
                    });
                }
            }
        }
        // Any follow-up results of a multi-result stream are discarded too;
        // the session must come back command-ready.
        while self.session.context.more_results() {
            self.session.read_response(false, 0)?;
        }
        Ok(())
    }

    /// Buffer everything that remains into a complete result.
    pub fn fetch_remaining(mut self) -> Result<CompleteResult> {
        while !self.finished {
            self.fetch_size = usize::MAX;
            self.fetch_batch()?;
        }
        let ok = self.ok.clone();
        let rows: Vec<Row> = std::mem::take(&mut self.buffered).into();
        Ok(CompleteResult::new(
            self.columns.clone(),
            rows,
            ok.as_ref().map_or(0, |o| o.status),
            ok.as_ref().map_or(0, |o| o.warnings),
        ))
    }
}

impl Drop for StreamingResult<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.session.is_closed() {
            // The socket must be positioned after the terminator before the
            // session can run another command.
            if self.skip_remaining().is_err() {
                self.session.destroy();
            }
        }
    }
}

/// Cross-thread cancellation for a session.
///
/// Cancel and abort are idempotent; both open a short-lived parallel session
/// to the same host.
#[derive(Debug)]
pub struct KillHandle {
    conf: Arc<Configuration>,
    thread_id: u32,
    shutdown: Option<ShutdownHandle>,
}

impl KillHandle {
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Cancel the statement currently running on the target session.
    pub fn kill_query(&self) -> Result<()> {
        self.run_kill(&format!("KILL QUERY {}", self.thread_id))
    }

    /// Terminate the target connection server-side.
    pub fn kill_connection(&self) -> Result<()> {
        self.run_kill(&format!("KILL {}", self.thread_id))
    }

    fn run_kill(&self, sql: &str) -> Result<()> {
        let mut side = Session::connect_internal(self.conf.clone(), true)?;
        let result = side.execute(sql).map(drop);
        side.close_in_place();
        result
    }

    /// Force termination: server-side KILL (best effort), then tear the
    /// socket down so any blocked read returns.
    pub fn abort(&self) {
        if let Err(error) = self.kill_connection() {
            debug!(%error, "KILL dispatch failed during abort");
        }
        if let Some(handle) = &self.shutdown {
            handle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::config::IsolationLevel;
    use crate::message::server::tests::column_payload;
    use crate::protocol::framer::tests::{frame, Duplex};
    use crate::protocol::PacketWriter;

    /// A connected session over a scripted in-memory stream, past the
    /// handshake, with DEPRECATE_EOF negotiated.
    fn test_session(input: Vec<u8>) -> Session {
        test_session_with(input, Configuration::default())
    }

    fn test_session_with(input: Vec<u8>, conf: Configuration) -> Session {
        let conf = Arc::new(conf);
        let stream = Stream::Memory(Duplex::with_input(input));
        let caps = capabilities::MANDATORY
            | capabilities::DEPRECATE_EOF
            | capabilities::SESSION_TRACK;
        let context = Context::new(
            99,
            caps,
            caps,
            ServerVersion::parse("10.6.12-MariaDB", true),
            server_status::AUTOCOMMIT,
            None,
            IsolationLevel::RepeatableRead,
            vec![0; 20],
        );
        Session {
            prepare_cache: PrepareCache::new(conf.prepare_cache_size),
            redo: conf
                .transaction_replay
                .then(|| TransactionSaver::new(conf.transaction_replay_size)),
            conf,
            channel: PacketChannel::new(Transport::Plain(stream)),
            shutdown: None,
            context,
            closed: false,
            last_used: Instant::now(),
        }
    }

    fn ok_packet_payload(affected: u64, status: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_lenenc_int(affected);
        w.write_lenenc_int(0); // last insert id
        w.write_u16_le(status);
        w.write_u16_le(0); // warnings
        w.into_bytes()
    }

    fn eof_ok_payload(status: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(0xFE);
        w.write_lenenc_int(0);
        w.write_lenenc_int(0);
        w.write_u16_le(status);
        w.write_u16_le(0);
        w.into_bytes()
    }

    fn err_packet_payload(code: u16, state: &str, msg: &str) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(code);
        w.write_u8(b'#');
        w.write_bytes(state.as_bytes());
        w.write_bytes(msg.as_bytes());
        w.into_bytes()
    }

    fn text_row_payload(cells: &[&[u8]]) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for cell in cells {
            w.write_lenenc_bytes(cell);
        }
        w.into_bytes()
    }

    /// Server script for a one-column text result set with the given rows.
    fn result_set_script(name: &str, rows: &[&[u8]], status: u16) -> Vec<u8> {
        let mut input = frame(1, &[1]); // column count
        input.extend_from_slice(&frame(
            2,
            &column_payload("test", "t", name, DataType::VarString, 0, 0),
        ));
        let mut seq = 3;
        for row in rows {
            input.extend_from_slice(&frame(seq, &text_row_payload(&[row])));
            seq += 1;
        }
        input.extend_from_slice(&frame(seq, &eof_ok_payload(status)));
        input
    }

    #[test]
    fn execute_parses_ok() {
        let input = frame(1, &ok_packet_payload(3, server_status::AUTOCOMMIT));
        let mut session = test_session(input);
        let ok = session.execute("DELETE FROM t").unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert!(!session.in_transaction());
        // The command went out framed with sequence 0.
        match session.channel.stream() {
            Transport::Plain(Stream::Memory(mem)) => {
                assert_eq!(mem.output[3], 0);
                assert_eq!(mem.output[4], 0x03); // COM_QUERY
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn query_parses_result_set() {
        let mut session = test_session(result_set_script("name", &[b"alpha", b"beta"], 0));
        let rs = session.query_rows("SELECT name FROM t").unwrap();
        assert_eq!(rs.row_count(), 2);
        assert_eq!(rs.rows()[0].get::<String>(0).unwrap(), "alpha");
        assert_eq!(rs.rows()[1].get_by_name::<String>("NAME").unwrap(), "beta");
    }

    #[test]
    fn server_error_carries_description() {
        let input = frame(1, &err_packet_payload(1064, "42000", "syntax error"));
        let mut session = test_session(input);
        let err = session.query("SELEC 1").unwrap_err();
        assert_eq!(err.sql_state(), "42000");
        assert!(err.to_string().contains("SELEC 1"));
        // Non-fatal server error: session stays usable.
        assert!(!session.is_closed());
    }

    #[test]
    fn fatal_server_error_destroys_session() {
        let input = frame(1, &err_packet_payload(1927, "70100", "Connection was killed"));
        let mut session = test_session(input);
        let err = session.query("SELECT 1").unwrap_err();
        assert!(err.is_fatal());
        assert!(session.is_closed());
        assert!(matches!(session.query("SELECT 1"), Err(e) if e.sql_state() == "08000"));
    }

    #[test]
    fn multi_result_stream() {
        let mut input = frame(
            1,
            &ok_packet_payload(1, server_status::MORE_RESULTS_EXISTS),
        );
        input.extend_from_slice(&result_set_script("x", &[b"1"], 0));
        // The whole multi-result stream shares one command cycle.
        let mut session = test_session(relabel_sequences(input));
        let results = session.query("INSERT ...; SELECT 1").unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].as_ok().is_some());
        assert_eq!(results[1].as_result_set().unwrap().row_count(), 1);
    }

    /// Rewrite frame sequence numbers to be contiguous from 1, the way the
    /// server numbers a multi-result response stream.
    fn relabel_sequences(mut raw: Vec<u8>) -> Vec<u8> {
        let mut seq = 1u8;
        let mut pos = 0;
        while pos + 4 <= raw.len() {
            let len = usize::from(raw[pos])
                | (usize::from(raw[pos + 1]) << 8)
                | (usize::from(raw[pos + 2]) << 16);
            raw[pos + 3] = seq;
            seq = seq.wrapping_add(1);
            pos += 4 + len;
        }
        raw
    }

    #[test]
    fn streaming_rows_on_demand() {
        let mut session = test_session(result_set_script("n", &[b"1", b"2", b"3"], 0));
        let mut stream = session.query_streaming("SELECT n FROM t", 1).unwrap();
        assert_eq!(stream.next_row().unwrap().unwrap().get::<i32>(0).unwrap(), 1);
        assert_eq!(stream.next_row().unwrap().unwrap().get::<i32>(0).unwrap(), 2);
        assert_eq!(stream.next_row().unwrap().unwrap().get::<i32>(0).unwrap(), 3);
        assert!(stream.next_row().unwrap().is_none());
        drop(stream);
        assert!(!session.is_closed());
    }

    #[test]
    fn streaming_drop_drains_socket() {
        let mut input = result_set_script("n", &[b"1", b"2"], 0);
        input.extend_from_slice(&frame(1, &ok_packet_payload(0, 0)));
        let mut session = test_session(input);
        {
            let mut stream = session.query_streaming("SELECT n FROM t", 1).unwrap();
            let _ = stream.next_row().unwrap();
            // Dropped mid-stream: rows 2 and the terminator must be skipped.
        }
        let ok = session.execute("DELETE FROM t").unwrap();
        assert_eq!(ok.affected_rows, 0);
    }

    #[test]
    fn streaming_fetch_remaining() {
        let mut session = test_session(result_set_script("n", &[b"5", b"6"], 0));
        let stream = session.query_streaming("SELECT n FROM t", 1).unwrap();
        let rs = stream.fetch_remaining().unwrap();
        assert_eq!(rs.row_count(), 2);
        assert_eq!(rs.rows()[1].get::<i32>(0).unwrap(), 6);
    }

    #[test]
    fn prepare_and_execute_binary() {
        // PREPARE response: prepare-ok (1 param, 1 column), param def,
        // column def. DEPRECATE_EOF: no EOF separators.
        let mut prepare_ok = PacketWriter::new();
        prepare_ok.write_u8(0x00);
        prepare_ok.write_u32_le(4); // statement id
        prepare_ok.write_u16_le(1); // columns
        prepare_ok.write_u16_le(1); // params
        prepare_ok.write_u8(0);
        prepare_ok.write_u16_le(0);

        let mut input = frame(1, prepare_ok.as_bytes());
        input.extend_from_slice(&frame(
            2,
            &column_payload("test", "t", "?", DataType::BigInt, 0, 0),
        ));
        input.extend_from_slice(&frame(
            3,
            &column_payload("test", "t", "n", DataType::Int, 0, 0),
        ));

        // EXECUTE response: result set with one binary row (n = 7).
        input.extend_from_slice(&frame(1, &[1]));
        input.extend_from_slice(&frame(
            2,
            &column_payload("test", "t", "n", DataType::Int, 0, 0),
        ));
        let mut row = PacketWriter::new();
        row.write_u8(0x00);
        row.write_u8(0x00); // null bitmap
        row.write_u32_le(7);
        input.extend_from_slice(&frame(3, row.as_bytes()));
        input.extend_from_slice(&frame(4, &eof_ok_payload(0)));

        let mut session = test_session(input);
        let statement = session.prepare("SELECT n FROM t WHERE id = ?").unwrap();
        assert_eq!(statement.parameter_count(), 1);

        let results = session
            .execute_statement(&statement, vec![ParamValue::of(1_i64)])
            .unwrap();
        let rs = results[0].as_result_set().unwrap();
        assert_eq!(rs.rows()[0].get::<i32>(0).unwrap(), 7);

        // Cached: preparing again is socket-free.
        let again = session.prepare("SELECT n FROM t WHERE id = ?").unwrap();
        assert_eq!(again.prepare.statement_id, 4);
        assert_eq!(again.prepare.use_count(), 2);
    }

    #[test]
    fn execute_statement_checks_parameter_count() {
        let mut session = test_session(Vec::new());
        let statement = Statement {
            prepare: PrepareResult::new(1, 2, Vec::new()),
            sql: "UPDATE t SET a=? WHERE id=?".into(),
        };
        let err = session
            .execute_statement(&statement, vec![ParamValue::of(1_i32)])
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn pipeline_reads_in_order() {
        let mut input = frame(1, &ok_packet_payload(1, 0));
        input.extend_from_slice(&frame(1, &ok_packet_payload(2, 0)));
        let mut session = test_session(input);
        let messages = vec![
            ClientMessage::Query { sql: "INSERT 1".into() },
            ClientMessage::Query { sql: "INSERT 2".into() },
        ];
        let results = session.execute_pipeline(&messages).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ok().unwrap().affected_rows, 1);
        assert_eq!(results[1].as_ok().unwrap().affected_rows, 2);
    }

    #[test]
    fn pipeline_failure_preserves_counts() {
        let mut input = frame(1, &ok_packet_payload(1, 0));
        input.extend_from_slice(&frame(1, &err_packet_payload(1062, "23000", "Duplicate")));
        input.extend_from_slice(&frame(1, &ok_packet_payload(1, 0)));
        let mut session = test_session(input);
        let messages = vec![
            ClientMessage::Query { sql: "INSERT 1".into() },
            ClientMessage::Query { sql: "INSERT dup".into() },
            ClientMessage::Query { sql: "INSERT 3".into() },
        ];
        let err = session.execute_pipeline(&messages).unwrap_err();
        match err {
            Error::Batch { counts, source } => {
                assert_eq!(counts, vec![1, 1]);
                assert_eq!(source.sql_state(), "23000");
            }
            other => panic!("expected batch error, got {other:?}"),
        }
        // Remaining responses were drained; the session is reusable.
        assert!(!session.is_closed());
    }

    #[test]
    fn redo_records_only_inside_transaction() {
        let conf = Configuration::builder().transaction_replay(true).build();
        let mut input = frame(
            1,
            &ok_packet_payload(0, server_status::IN_TRANSACTION),
        );
        input.extend_from_slice(&frame(
            1,
            &ok_packet_payload(1, server_status::IN_TRANSACTION),
        ));
        input.extend_from_slice(&frame(1, &ok_packet_payload(0, 0))); // COMMIT
        let mut session = test_session_with(input, conf);

        session.execute("BEGIN").unwrap();
        assert_eq!(session.redo.as_ref().unwrap().len(), 1);
        session.execute("INSERT INTO t VALUES (1)").unwrap();
        assert_eq!(session.redo.as_ref().unwrap().len(), 2);
        session.execute("COMMIT").unwrap();
        assert!(session.redo.as_ref().unwrap().is_empty());
    }

    #[test]
    fn session_track_schema_updates_context() {
        // OK with SESSION_STATE_CHANGED carrying a schema change.
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_lenenc_int(0);
        w.write_lenenc_int(0);
        w.write_u16_le(server_status::SESSION_STATE_CHANGED);
        w.write_u16_le(0);
        w.write_lenenc_str(""); // info
        let mut state = PacketWriter::new();
        state.write_u8(1); // SESSION_TRACK_SCHEMA
        let mut inner = PacketWriter::new();
        inner.write_lenenc_str("orders");
        state.write_lenenc_bytes(inner.as_bytes());
        w.write_lenenc_bytes(state.as_bytes());

        let mut session = test_session(frame(1, &w.into_bytes()));
        session.execute("USE orders").unwrap();
        assert_eq!(session.database(), Some("orders"));
    }

    #[test]
    fn local_infile_disabled_sends_empty_and_surfaces_error() {
        let mut input = frame(1, &{
            let mut w = PacketWriter::new();
            w.write_u8(0xFB);
            w.write_bytes(b"/etc/passwd");
            w.into_bytes()
        });
        input.extend_from_slice(&frame(3, &err_packet_payload(1148, "42000", "not allowed")));
        let mut session = test_session(input);
        let err = session.query("LOAD DATA LOCAL INFILE ...").unwrap_err();
        assert_eq!(err.sql_state(), "42000");
        // The empty terminator packet went out (header of length 0, seq 2).
        match session.channel.stream() {
            Transport::Plain(Stream::Memory(mem)) => {
                let tail = &mem.output[mem.output.len() - 4..];
                assert_eq!(tail, &[0, 0, 0, 2]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn quit_has_no_response() {
        let mut session = test_session(Vec::new());
        session.close_in_place();
        assert!(session.is_closed());
    }
}
