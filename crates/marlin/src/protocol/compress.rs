//! Compressed-protocol wrapper.
//!
//! When COMPRESS is negotiated, every protocol packet travels inside a
//! compression envelope: `[comp_len:3 LE][comp_seq:1][uncomp_len:3 LE]`
//! followed by a zlib-deflated body, or the raw body with `uncomp_len == 0`
//! when compression would not pay off. The envelope carries its own sequence
//! counter, independent of the protocol sequence inside it.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::protocol::MAX_PACKET_SIZE;

/// Bodies smaller than this are sent stored; the zlib header would eat the
/// savings.
const MIN_COMPRESS_SIZE: usize = 1536;

#[derive(Debug)]
pub struct CompressedStream<S> {
    inner: S,
    sequence: u8,
    /// Plaintext staged by `write`, enveloped on `flush`.
    wbuf: Vec<u8>,
    /// Inflated bytes not yet consumed by `read`.
    rbuf: Vec<u8>,
    rpos: usize,
}

impl<S: Read + Write> CompressedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            sequence: 0,
            wbuf: Vec::with_capacity(8 * 1024),
            rbuf: Vec::new(),
            rpos: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// New command cycle: the envelope sequence restarts with the protocol
    /// sequence.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.sequence = sequence;
    }

    fn write_envelope(&mut self, body: &[u8]) -> std::io::Result<()> {
        let (payload, uncompressed_len): (Vec<u8>, usize) = if body.len() >= MIN_COMPRESS_SIZE {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            let compressed = encoder.finish()?;
            if compressed.len() < body.len() {
                (compressed, body.len())
            } else {
                (body.to_vec(), 0)
            }
        } else {
            (body.to_vec(), 0)
        };

        let mut header = [0u8; 7];
        header[0] = payload.len() as u8;
        header[1] = (payload.len() >> 8) as u8;
        header[2] = (payload.len() >> 16) as u8;
        header[3] = self.sequence;
        header[4] = uncompressed_len as u8;
        header[5] = (uncompressed_len >> 8) as u8;
        header[6] = (uncompressed_len >> 16) as u8;
        self.sequence = self.sequence.wrapping_add(1);

        self.inner.write_all(&header)?;
        self.inner.write_all(&payload)
    }

    fn fill(&mut self) -> std::io::Result<()> {
        let mut header = [0u8; 7];
        self.inner.read_exact(&mut header)?;
        let comp_len =
            usize::from(header[0]) | (usize::from(header[1]) << 8) | (usize::from(header[2]) << 16);
        let seq = header[3];
        let uncomp_len =
            usize::from(header[4]) | (usize::from(header[5]) << 8) | (usize::from(header[6]) << 16);

        if seq != self.sequence {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "compression sequence mismatch: expected {} got {seq}",
                    self.sequence
                ),
            ));
        }
        self.sequence = seq.wrapping_add(1);

        let mut body = vec![0u8; comp_len];
        self.inner.read_exact(&mut body)?;

        self.rpos = 0;
        if uncomp_len == 0 {
            self.rbuf = body;
        } else {
            let mut inflated = Vec::with_capacity(uncomp_len);
            ZlibDecoder::new(body.as_slice()).read_to_end(&mut inflated)?;
            if inflated.len() != uncomp_len {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "compressed packet inflated to unexpected length",
                ));
            }
            self.rbuf = inflated;
        }
        Ok(())
    }
}

impl<S: Read + Write> Read for CompressedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.rpos == self.rbuf.len() {
            self.fill()?;
        }
        let n = (self.rbuf.len() - self.rpos).min(buf.len());
        buf[..n].copy_from_slice(&self.rbuf[self.rpos..self.rpos + n]);
        self.rpos += n;
        Ok(n)
    }
}

impl<S: Read + Write> Write for CompressedStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.wbuf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.wbuf);
        for chunk in staged.chunks(MAX_PACKET_SIZE) {
            self.write_envelope(chunk)?;
        }
        self.inner.flush()
    }
}
