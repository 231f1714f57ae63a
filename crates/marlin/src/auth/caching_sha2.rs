//! `caching_sha2_password`: SHA256 fast path with RSA full authentication.
//!
//! Fast path sends `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + seed)`. When
//! the server cache misses it answers AuthMoreData `0x04` (full auth): over
//! TLS the plaintext password is sent; over plaintext the client obtains the
//! server RSA public key (from a local file or by requesting it with `0x02`),
//! XORs the password with the repeating seed and sends it RSA-OAEP encrypted.

use std::io::{Read, Write};

use marlin_core::{Error, Result};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::auth::{AuthContext, AuthenticationPlugin, Credential, CACHING_SHA2_PASSWORD};
use crate::config::Configuration;

/// Server answers after the fast-path scramble.
const FAST_AUTH_OK: u8 = 0x03;
const PERFORM_FULL_AUTH: u8 = 0x04;
/// Client request for the server RSA public key.
const REQUEST_PUBLIC_KEY: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachingSha2;

pub fn fast_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    // Some servers send the 20-byte seed with a trailing NUL.
    let seed = if seed.len() == 21 && seed.last() == Some(&0) {
        &seed[..20]
    } else {
        seed
    };

    let hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let hash_hash: [u8; 32] = Sha256::digest(hash).into();

    let mut hasher = Sha256::new();
    hasher.update(hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    hash.iter().zip(scramble.iter()).map(|(a, b)| a ^ b).collect()
}

/// XOR the NUL-terminated password with the repeating seed and encrypt it
/// under the server public key (PEM, pkcs8 or pkcs1) with OAEP-SHA1.
pub fn encrypt_password(password: &str, seed: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    if seed.is_empty() {
        return Err(Error::auth(
            "empty seed for RSA password exchange",
            Some(CACHING_SHA2_PASSWORD),
        ));
    }

    let mut pw = password.as_bytes().to_vec();
    pw.push(0);
    for (i, b) in pw.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| Error::auth(format!("server public key is not valid PEM: {e}"), Some(CACHING_SHA2_PASSWORD)))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::auth(format!("could not parse server RSA public key: {e}"), Some(CACHING_SHA2_PASSWORD)))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &pw)
        .map_err(|e| Error::auth(format!("RSA encryption failed: {e}"), Some(CACHING_SHA2_PASSWORD)))
}

impl CachingSha2 {
    fn full_auth<S: Read + Write>(&self, ctx: &mut AuthContext<'_, S>) -> Result<()> {
        let password = ctx.credential.password_or_empty();

        if ctx.encrypted {
            // The channel is TLS-protected: plaintext password plus NUL.
            let mut pw = password.as_bytes().to_vec();
            pw.push(0);
            ctx.channel.write_packet(&pw)?;
            return Ok(());
        }

        let key_pem: Vec<u8> = if let Some(path) = &ctx.conf.server_rsa_public_key_path {
            std::fs::read(path).map_err(|e| {
                Error::auth(
                    format!("could not read server RSA public key file '{}': {e}", path.display()),
                    Some(CACHING_SHA2_PASSWORD),
                )
            })?
        } else if ctx.conf.allow_public_key_retrieval {
            ctx.channel.write_packet(&[REQUEST_PUBLIC_KEY])?;
            let packet = ctx.channel.read_packet()?;
            match packet.split_first() {
                Some((0x01, pem)) => pem.to_vec(),
                _ => {
                    return Err(Error::auth(
                        "server did not return its RSA public key",
                        Some(CACHING_SHA2_PASSWORD),
                    ))
                }
            }
        } else {
            return Err(Error::auth(
                "RSA public key is not available client side (option serverRsaPublicKeyFile not set)",
                Some(CACHING_SHA2_PASSWORD),
            ));
        };

        let encrypted = encrypt_password(password, ctx.seed, &key_pem)?;
        ctx.channel.write_packet(&encrypted)
    }
}

impl AuthenticationPlugin for CachingSha2 {
    fn kind(&self) -> &'static str {
        CACHING_SHA2_PASSWORD
    }

    fn scramble(
        &self,
        credential: &Credential,
        seed: &[u8],
        _conf: &Configuration,
        _encrypted: bool,
    ) -> Result<Vec<u8>> {
        Ok(fast_scramble(credential.password_or_empty(), seed))
    }

    fn more_data<S: Read + Write>(&self, ctx: &mut AuthContext<'_, S>, data: &[u8]) -> Result<()> {
        match data.first() {
            Some(&FAST_AUTH_OK) => Ok(()),
            Some(&PERFORM_FULL_AUTH) => self.full_auth(ctx),
            _ => Err(Error::auth(
                "unexpected caching_sha2_password state",
                Some(CACHING_SHA2_PASSWORD),
            )),
        }
    }
}
