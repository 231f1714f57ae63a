//! Stream framing: packets in and out of a byte stream.
//!
//! The channel owns the sequence counter shared by both directions of a
//! command cycle: the client writes frames `0..n`, the server answers with
//! frame `n+1`, and any gap means the session is desynchronized beyond
//! recovery.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use marlin_core::Error;

use crate::protocol::compress::CompressedStream;
use crate::protocol::{PacketHeader, MAX_PACKET_SIZE};

/// Read-ahead buffer size; one read syscall usually yields several small
/// packets' worth of row data.
const READ_AHEAD: usize = 16 * 1024;

/// The underlying byte stream of a session.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<crate::tls::TlsStream>),
    #[cfg(test)]
    Memory(tests::Duplex),
}

impl Stream {
    /// Open a TCP stream with a connect timeout, resolving the host first.
    pub fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<Self, Error> {
        use std::net::ToSocketAddrs;

        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::connect(format!("could not resolve {host}:{port}: {e}"), Some(e)))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(Stream::Tcp(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::connect(
            format!(
                "could not connect to {host}:{port}: {}",
                last_err
                    .as_ref()
                    .map_or_else(|| "no address resolved".to_owned(), ToString::to_string)
            ),
            last_err,
        ))
    }

    /// Open a local stream socket.
    #[cfg(unix)]
    pub fn connect_unix(path: &std::path::Path) -> Result<Self, Error> {
        let stream = UnixStream::connect(path).map_err(|e| {
            Error::connect(
                format!("could not connect to socket {}: {e}", path.display()),
                Some(e),
            )
        })?;
        Ok(Stream::Unix(stream))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_read_timeout(timeout),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.get_ref().set_read_timeout(timeout),
            #[cfg(test)]
            Stream::Memory(_) => Ok(()),
        }
    }

    /// A handle that can tear the socket down from another thread while a
    /// read is blocked on it.
    pub fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        match self {
            Stream::Tcp(s) => s.try_clone().ok().map(ShutdownHandle::Tcp),
            #[cfg(unix)]
            Stream::Unix(s) => s.try_clone().ok().map(ShutdownHandle::Unix),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.get_ref().try_clone().ok().map(ShutdownHandle::Tcp),
            #[cfg(test)]
            Stream::Memory(_) => None,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read(buf),
            #[cfg(test)]
            Stream::Memory(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write(buf),
            #[cfg(test)]
            Stream::Memory(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.flush(),
            #[cfg(test)]
            Stream::Memory(s) => s.flush(),
        }
    }
}

/// Cloned socket handle used by abort to close the stream out from under a
/// blocked read. Idempotent.
#[derive(Debug)]
pub enum ShutdownHandle {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        match self {
            ShutdownHandle::Tcp(s) => {
                s.shutdown(std::net::Shutdown::Both).ok();
            }
            #[cfg(unix)]
            ShutdownHandle::Unix(s) => {
                s.shutdown(std::net::Shutdown::Both).ok();
            }
        }
    }
}

/// Session transport: the plain stream, or the zlib wrapper installed after
/// a handshake that negotiated COMPRESS.
#[derive(Debug)]
pub enum Transport {
    Plain(Stream),
    Compressed(CompressedStream<Stream>),
}

impl Transport {
    pub fn reset_compression_sequence(&mut self) {
        if let Transport::Compressed(c) = self {
            c.reset_sequence();
        }
    }

    pub fn set_compression_sequence(&mut self, sequence: u8) {
        if let Transport::Compressed(c) = self {
            c.set_sequence(sequence);
        }
    }

    pub fn stream(&self) -> &Stream {
        match self {
            Transport::Plain(s) => s,
            Transport::Compressed(c) => c.get_ref(),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Compressed(c) => c.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Compressed(c) => c.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Compressed(c) => c.flush(),
        }
    }
}

/// Framed packet channel over a byte stream.
///
/// Reads reassemble payloads that span continuation packets and enforce the
/// sequence law; writes split payloads at the 2^24 - 1 boundary and append
/// the empty trailing packet on exact multiples.
#[derive(Debug)]
pub struct PacketChannel<S> {
    stream: S,
    sequence: u8,
    /// Read-ahead buffer; `buf[pos..len]` holds bytes already read from the
    /// stream but not yet consumed.
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    /// Logical command cap; 0 means not yet known (no cap).
    max_allowed_packet: usize,
    /// Frames already flushed since the last sequence reset; decides the
    /// `must_reconnect` flavor of the packet-too-big error.
    flushed_this_cycle: bool,
}

impl<S: Read + Write> PacketChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sequence: 0,
            buf: vec![0; READ_AHEAD],
            pos: 0,
            len: 0,
            max_allowed_packet: 0,
            flushed_this_cycle: false,
        }
    }

    pub fn set_max_allowed_packet(&mut self, max: usize) {
        self.max_allowed_packet = max;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Start a new command cycle.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
        self.flushed_this_cycle = false;
    }

    /// Position the expected sequence explicitly; pipelined reads rewind to
    /// the first response frame of each command.
    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Swap the underlying stream (TLS upgrade, compression install). Any
    /// read-ahead bytes would belong to the old framing, so pending input is
    /// rejected.
    pub fn map_stream<T: Read + Write>(
        self,
        f: impl FnOnce(S) -> Result<T, Error>,
    ) -> Result<PacketChannel<T>, Error> {
        if self.pos != self.len {
            return Err(Error::handshake(
                "cannot change transport with unread packet data pending",
            ));
        }
        Ok(PacketChannel {
            stream: f(self.stream)?,
            sequence: self.sequence,
            buf: self.buf,
            pos: 0,
            len: 0,
            max_allowed_packet: self.max_allowed_packet,
            flushed_this_cycle: self.flushed_this_cycle,
        })
    }

    fn fill(&mut self) -> std::io::Result<()> {
        debug_assert_eq!(self.pos, self.len);
        self.pos = 0;
        self.len = self.stream.read(&mut self.buf)?;
        if self.len == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ));
        }
        Ok(())
    }

    fn read_exact_buffered(&mut self, out: &mut [u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < out.len() {
            if self.pos == self.len {
                // Large payloads skip the copy through the read-ahead buffer.
                if out.len() - written >= self.buf.len() {
                    self.stream.read_exact(&mut out[written..])?;
                    return Ok(());
                }
                self.fill()?;
            }
            let n = (self.len - self.pos).min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
        }
        Ok(())
    }

    fn read_header(&mut self) -> Result<PacketHeader, Error> {
        let mut bytes = [0u8; PacketHeader::SIZE];
        self.read_exact_buffered(&mut bytes)
            .map_err(|e| Error::socket("failed to read packet header", e))?;
        Ok(PacketHeader::from_bytes(&bytes))
    }

    fn check_sequence(&mut self, header: PacketHeader) -> Result<(), Error> {
        if header.sequence_id != self.sequence {
            return Err(Error::handshake(format!(
                "sequence mismatch: expected {} got {}, connection state is unknown",
                self.sequence, header.sequence_id
            )));
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// Read one logical packet, reassembling continuations.
    pub fn read_packet(&mut self) -> Result<Vec<u8>, Error> {
        let header = self.read_header()?;
        self.check_sequence(header)?;

        let mut payload = vec![0u8; header.payload_length as usize];
        self.read_exact_buffered(&mut payload)
            .map_err(|e| Error::socket("failed to read packet payload", e))?;

        if header.payload_length as usize == MAX_PACKET_SIZE {
            loop {
                let cont = self.read_header()?;
                self.check_sequence(cont)?;
                let start = payload.len();
                payload.resize(start + cont.payload_length as usize, 0);
                self.read_exact_buffered(&mut payload[start..])
                    .map_err(|e| Error::socket("failed to read continuation payload", e))?;
                if (cont.payload_length as usize) < MAX_PACKET_SIZE {
                    break;
                }
            }
        }

        tracing::trace!(len = payload.len(), seq = header.sequence_id, "packet read");
        Ok(payload)
    }

    /// Frame and send one logical payload, splitting at the 2^24 - 1
    /// boundary.
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<(), Error> {
        if self.max_allowed_packet != 0 && payload.len() > self.max_allowed_packet {
            // Nothing of this payload hit the wire, but earlier frames of the
            // same cycle may have: then the server still expects their
            // continuation and the socket cannot be reused.
            let must_reconnect = self.flushed_this_cycle;
            return Err(Error::max_packet(must_reconnect));
        }

        let mut out = Vec::with_capacity(payload.len() + 4 * (payload.len() / MAX_PACKET_SIZE + 1));
        let mut offset = 0;
        loop {
            let chunk = (payload.len() - offset).min(MAX_PACKET_SIZE);
            let header = PacketHeader {
                payload_length: chunk as u32,
                sequence_id: self.sequence,
            };
            self.sequence = self.sequence.wrapping_add(1);
            out.extend_from_slice(&header.to_bytes());
            out.extend_from_slice(&payload[offset..offset + chunk]);
            offset += chunk;
            if offset >= payload.len() {
                // An exact multiple of the max frame size needs an empty
                // terminating frame.
                if chunk == MAX_PACKET_SIZE {
                    let header = PacketHeader {
                        payload_length: 0,
                        sequence_id: self.sequence,
                    };
                    self.sequence = self.sequence.wrapping_add(1);
                    out.extend_from_slice(&header.to_bytes());
                }
                break;
            }
        }

        self.stream
            .write_all(&out)
            .and_then(|()| self.stream.flush())
            .map_err(|e| Error::socket("failed to write packet", e))?;
        self.flushed_this_cycle = true;
        tracing::trace!(len = payload.len(), "packet written");
        Ok(())
    }

    /// Send an empty packet (LOCAL INFILE terminator, empty auth response).
    pub fn write_empty_packet(&mut self) -> Result<(), Error> {
        self.write_packet(&[])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory duplex stream: reads from a scripted input, captures writes.
    #[derive(Debug, Default)]
    pub(crate) struct Duplex {
        pub input: std::io::Cursor<Vec<u8>>,
        pub output: Vec<u8>,
    }

    impl Duplex {
        pub fn with_input(input: Vec<u8>) -> Self {
            Self {
                input: std::io::Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = PacketHeader {
            payload_length: payload.len() as u32,
            sequence_id: seq,
        }
        .to_bytes()
        .to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn read_single_packet() {
        let mut chan = PacketChannel::new(Duplex::with_input(frame(0, b"hello")));
        assert_eq!(chan.read_packet().unwrap(), b"hello");
        assert_eq!(chan.sequence(), 1);
    }

    #[test]
    fn read_reassembles_continuation() {
        let first = vec![0xAA; MAX_PACKET_SIZE];
        let mut input = frame(0, &first);
        input.extend_from_slice(&frame(1, b"tail"));
        let mut chan = PacketChannel::new(Duplex::with_input(input));
        let payload = chan.read_packet().unwrap();
        assert_eq!(payload.len(), MAX_PACKET_SIZE + 4);
        assert_eq!(&payload[MAX_PACKET_SIZE..], b"tail");
    }

    #[test]
    fn read_reassembles_exact_multiple() {
        // A sender of exactly MAX_PACKET_SIZE bytes appends an empty frame.
        let body = vec![0x55; MAX_PACKET_SIZE];
        let mut input = frame(0, &body);
        input.extend_from_slice(&frame(1, b""));
        let mut chan = PacketChannel::new(Duplex::with_input(input));
        assert_eq!(chan.read_packet().unwrap().len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn sequence_mismatch_is_fatal() {
        let mut chan = PacketChannel::new(Duplex::with_input(frame(3, b"oops")));
        let err = chan.read_packet().unwrap_err();
        assert_eq!(err.sql_state(), "08000");
        assert!(err.to_string().contains("sequence mismatch"));
    }

    #[test]
    fn sequence_increments_across_packets() {
        let mut input = frame(0, b"a");
        input.extend_from_slice(&frame(1, b"b"));
        input.extend_from_slice(&frame(2, b"c"));
        let mut chan = PacketChannel::new(Duplex::with_input(input));
        assert_eq!(chan.read_packet().unwrap(), b"a");
        assert_eq!(chan.read_packet().unwrap(), b"b");
        assert_eq!(chan.read_packet().unwrap(), b"c");
        assert_eq!(chan.sequence(), 3);
    }

    #[test]
    fn write_small_packet() {
        let mut chan = PacketChannel::new(Duplex::default());
        chan.write_packet(b"SELECT 1").unwrap();
        let out = &chan.stream().output;
        assert_eq!(&out[..4], &[8, 0, 0, 0]);
        assert_eq!(&out[4..], b"SELECT 1");
        assert_eq!(chan.sequence(), 1);
    }

    #[test]
    fn write_splits_large_payload() {
        let payload = vec![0x11; MAX_PACKET_SIZE + 10];
        let mut chan = PacketChannel::new(Duplex::default());
        chan.write_packet(&payload).unwrap();
        let out = &chan.stream().output;

        let h1 = PacketHeader::from_bytes(&[out[0], out[1], out[2], out[3]]);
        assert_eq!(h1.payload_length as usize, MAX_PACKET_SIZE);
        assert_eq!(h1.sequence_id, 0);

        let second = 4 + MAX_PACKET_SIZE;
        let h2 = PacketHeader::from_bytes(&[
            out[second],
            out[second + 1],
            out[second + 2],
            out[second + 3],
        ]);
        assert_eq!(h2.payload_length, 10);
        assert_eq!(h2.sequence_id, 1);
        assert_eq!(chan.sequence(), 2);
    }

    #[test]
    fn write_exact_multiple_appends_empty_frame() {
        let payload = vec![0x22; MAX_PACKET_SIZE];
        let mut chan = PacketChannel::new(Duplex::default());
        chan.write_packet(&payload).unwrap();
        let out = &chan.stream().output;
        assert_eq!(out.len(), 4 + MAX_PACKET_SIZE + 4);
        let tail = &out[4 + MAX_PACKET_SIZE..];
        assert_eq!(tail, &[0, 0, 0, 1]);
    }

    #[test]
    fn max_allowed_packet_soft_failure() {
        let mut chan = PacketChannel::new(Duplex::default());
        chan.set_max_allowed_packet(16);
        let err = chan.write_packet(&[0u8; 17]).unwrap_err();
        assert_eq!(err.sql_state(), "HZ000");
        assert!(!err.is_fatal());
        assert!(chan.stream().output.is_empty());
    }

    #[test]
    fn max_allowed_packet_after_flush_requires_reconnect() {
        let mut chan = PacketChannel::new(Duplex::default());
        chan.set_max_allowed_packet(16);
        chan.write_packet(b"ok").unwrap();
        let err = chan.write_packet(&[0u8; 17]).unwrap_err();
        assert_eq!(err.sql_state(), "08000");
        assert!(err.is_fatal());
    }

    #[test]
    fn reset_sequence_starts_new_cycle() {
        let mut chan = PacketChannel::new(Duplex::with_input(frame(0, b"pong")));
        chan.write_packet(b"ping1").unwrap();
        chan.write_packet(b"ping2").unwrap();
        chan.reset_sequence();
        chan.write_packet(b"ping3").unwrap();
        // Third write framed with sequence 0 again.
        let out = chan.stream().output.clone();
        assert_eq!(out[3], 0);
        assert_eq!(out[9 + 3], 1);
        assert_eq!(out[18 + 3], 0);
        assert_eq!(chan.read_packet().unwrap(), b"pong");
    }

    #[test]
    fn eof_surfaces_as_socket_error() {
        let mut chan = PacketChannel::new(Duplex::default());
        let err = chan.read_packet().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.sql_state(), "08000");
    }
}
