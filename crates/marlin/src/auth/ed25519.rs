//! `client_ed25519`: MariaDB's Ed25519 signature authentication.
//!
//! The private scalar is derived from the password: `az = SHA-512(pw)` with
//! the usual Ed25519 clamping. The server seed is the signed message:
//!
//! ```text
//! nonce = SHA-512(az[32..64] || seed)        reduced mod L
//! R = nonce * B       A = az * B
//! h = SHA-512(R || A || seed)                reduced mod L
//! S = h * az + nonce                         mod L
//! ```
//!
//! The response is `R || S` (64 bytes).

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use marlin_core::Result;
use sha2::{Digest, Sha512};

use crate::auth::{AuthenticationPlugin, Credential, CLIENT_ED25519};
use crate::config::Configuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ed25519;

pub fn sign_with_password(password: &str, seed: &[u8]) -> [u8; 64] {
    let az: [u8; 64] = Sha512::digest(password.as_bytes()).into();

    let mut scalar_bytes = [0u8; 32];
    scalar_bytes.copy_from_slice(&az[..32]);
    scalar_bytes[0] &= 248;
    scalar_bytes[31] &= 63;
    scalar_bytes[31] |= 64;
    // Reduction mod L preserves the derived public point and signature
    // arithmetic, which are defined mod the group order.
    let a = Scalar::from_bytes_mod_order(scalar_bytes);

    let mut hasher = Sha512::new();
    hasher.update(&az[32..64]);
    hasher.update(seed);
    let nonce_hash: [u8; 64] = hasher.finalize().into();
    let nonce = Scalar::from_bytes_mod_order_wide(&nonce_hash);

    let big_r = EdwardsPoint::mul_base(&nonce).compress();
    let big_a = EdwardsPoint::mul_base(&a).compress();

    let mut hasher = Sha512::new();
    hasher.update(big_r.as_bytes());
    hasher.update(big_a.as_bytes());
    hasher.update(seed);
    let hram_hash: [u8; 64] = hasher.finalize().into();
    let hram = Scalar::from_bytes_mod_order_wide(&hram_hash);

    let s = hram * a + nonce;

    let mut signature = [0u8; 64];
    signature[..32].copy_from_slice(big_r.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    signature
}

impl AuthenticationPlugin for Ed25519 {
    fn kind(&self) -> &'static str {
        CLIENT_ED25519
    }

    fn scramble(
        &self,
        credential: &Credential,
        seed: &[u8],
        _conf: &Configuration,
        _encrypted: bool,
    ) -> Result<Vec<u8>> {
        match credential.password.as_deref() {
            None | Some("") => Ok(Vec::new()),
            Some(password) => Ok(sign_with_password(password, seed).to_vec()),
        }
    }
}
