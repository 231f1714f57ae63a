//! TLS upgrade for the session stream.
//!
//! After the server handshake advertises SSL and the client sends the short
//! SSL-request packet, the TCP stream is wrapped in a rustls client
//! connection and the remainder of the handshake continues encrypted.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use marlin_core::Error;

use crate::config::{Configuration, SslMode};

/// Synchronous TLS stream over the session socket.
pub struct TlsStream {
    conn: rustls::ClientConnection,
    stream: TcpStream,
}

impl std::fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .field("is_handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}

impl TlsStream {
    /// Wrap `stream` and run the TLS handshake to completion.
    pub fn upgrade(
        mut stream: TcpStream,
        conf: &Configuration,
        default_server_name: &str,
    ) -> Result<Self, Error> {
        let config = build_client_config(conf)?;

        let sni = conf
            .tls
            .server_name
            .as_deref()
            .unwrap_or(default_server_name);
        let server_name: rustls::pki_types::ServerName<'static> = sni
            .to_owned()
            .try_into()
            .map_err(|e| Error::tls(format!("invalid TLS server name '{sni}': {e}")))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| Error::tls(format!("could not create TLS session: {e}")))?;

        while conn.is_handshaking() {
            while conn.wants_write() {
                conn.write_tls(&mut stream)
                    .map_err(|e| Error::tls(format!("TLS handshake write failed: {e}")))?;
            }
            if conn.wants_read() {
                conn.read_tls(&mut stream)
                    .map_err(|e| Error::tls(format!("TLS handshake read failed: {e}")))?;
                conn.process_new_packets()
                    .map_err(|e| Error::tls(format!("TLS handshake failed: {e}")))?;
            }
        }

        Ok(TlsStream { conn, stream })
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if self.conn.wants_read() {
                if self.conn.read_tls(&mut self.stream)? == 0 {
                    return Ok(0);
                }
                self.conn
                    .process_new_packets()
                    .map_err(|e| std::io::Error::other(format!("TLS error: {e}")))?;
            } else {
                return Ok(0);
            }
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.conn.writer().flush()?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        self.stream.flush()
    }
}

fn build_client_config(conf: &Configuration) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    match conf.ssl_mode {
        SslMode::Disable => Err(Error::tls("TLS upgrade attempted with ssl_mode=disable")),
        SslMode::Trust => build_no_verify_config(&provider),
        SslMode::VerifyCa | SslMode::VerifyFull => {
            if let Some(ca_path) = &conf.tls.ca_cert_path {
                build_custom_ca_config(conf, &provider, ca_path)
            } else {
                build_webpki_config(conf, &provider)
            }
        }
    }
}

/// Trust mode: encrypt without authenticating the server. Self-signed server
/// certificates are the norm for MariaDB deployments.
fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ClientConfig, Error> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::tls(format!("could not set TLS versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    Ok(config)
}

fn build_webpki_config(
    conf: &Configuration,
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ClientConfig, Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::tls(format!("could not set TLS versions: {e}")))?
        .with_root_certificates(roots);
    add_client_auth(conf, builder)
}

fn build_custom_ca_config(
    conf: &Configuration,
    provider: &Arc<rustls::crypto::CryptoProvider>,
    ca_path: &std::path::Path,
) -> Result<rustls::ClientConfig, Error> {
    use std::io::BufReader;

    let file = std::fs::File::open(ca_path)
        .map_err(|e| Error::tls(format!("could not open CA bundle '{}': {e}", ca_path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| Error::tls(format!("could not parse CA bundle: {e}")))?;
    if certs.is_empty() {
        return Err(Error::tls(format!(
            "no certificates found in '{}'",
            ca_path.display()
        )));
    }

    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| Error::tls(format!("rejected CA certificate: {e}")))?;
    }

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::tls(format!("could not set TLS versions: {e}")))?
        .with_root_certificates(roots);
    add_client_auth(conf, builder)
}

fn add_client_auth(
    conf: &Configuration,
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
) -> Result<rustls::ClientConfig, Error> {
    use std::io::BufReader;

    let (Some(cert_path), Some(key_path)) = (&conf.tls.client_cert_path, &conf.tls.client_key_path)
    else {
        return Ok(builder.with_no_client_auth());
    };

    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        Error::tls(format!(
            "could not open client certificate '{}': {e}",
            cert_path.display()
        ))
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| Error::tls(format!("could not parse client certificate: {e}")))?;

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        Error::tls(format!(
            "could not open client key '{}': {e}",
            key_path.display()
        ))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::tls(format!("could not parse client key: {e}")))?
        .ok_or_else(|| Error::tls(format!("no private key in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::tls(format!("client auth configuration rejected: {e}")))
}
