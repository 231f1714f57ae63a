//! `mysql_clear_password`: plaintext password, TLS-only.
//!
//! Used by server-side plugins that need the real password (PAM, LDAP). The
//! client refuses to send it over an unencrypted stream.

use marlin_core::{Error, Result};

use crate::auth::{AuthenticationPlugin, Credential, CLEAR_PASSWORD};
use crate::config::Configuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearPassword;

impl AuthenticationPlugin for ClearPassword {
    fn kind(&self) -> &'static str {
        CLEAR_PASSWORD
    }

    fn scramble(
        &self,
        credential: &Credential,
        _seed: &[u8],
        _conf: &Configuration,
        encrypted: bool,
    ) -> Result<Vec<u8>> {
        if !encrypted {
            return Err(Error::auth(
                "mysql_clear_password requires an SSL-protected connection",
                Some(CLEAR_PASSWORD),
            ));
        }
        let mut response = credential.password_or_empty().as_bytes().to_vec();
        response.push(0);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_plaintext_stream() {
        let cred = Credential::new("u", Some("pw".into()));
        let conf = Configuration::default();
        let err = ClearPassword
            .scramble(&cred, &[], &conf, false)
            .unwrap_err();
        assert_eq!(err.sql_state(), "28000");
    }

    #[test]
    fn sends_nul_terminated_password_over_tls() {
        let cred = Credential::new("u", Some("pw".into()));
        let conf = Configuration::default();
        let out = ClearPassword.scramble(&cred, &[], &conf, true).unwrap();
        assert_eq!(out, b"pw\0");
    }
}
