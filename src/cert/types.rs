// cert/types.rs
use std::fmt;

use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private};
use serde::{Deserialize, Serialize};

use crate::error::{AccessError, Result};
use crate::types::Identity;

/// Asymmetric key algorithm used for client and CA keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum KeySpec {
    Rsa { bits: u32 },
    EcP256,
    EcP384,
}

pub const MIN_RSA_BITS: u32 = 2048;

impl Default for KeySpec {
    fn default() -> Self {
        KeySpec::Rsa { bits: 2048 }
    }
}

impl KeySpec {
    /// Reject key sizes below the configured minimum strength
    pub fn validate(&self) -> Result<()> {
        match self {
            KeySpec::Rsa { bits } if *bits < MIN_RSA_BITS => Err(AccessError::validation(format!(
                "RSA keys must be at least {} bits, got {}",
                MIN_RSA_BITS, bits
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Rsa { bits } => write!(f, "RSA-{}", bits),
            KeySpec::EcP256 => f.write_str("EC-P256"),
            KeySpec::EcP384 => f.write_str("EC-P384"),
        }
    }
}

/// Private/public key pair. Not `Clone`: exactly one owner at a time.
pub struct KeyPair {
    pub(crate) pkey: PKey<Private>,
    spec: KeySpec,
}

impl KeyPair {
    pub(crate) fn new(pkey: PKey<Private>, spec: KeySpec) -> Self {
        Self { pkey, spec }
    }

    pub fn spec(&self) -> KeySpec {
        self.spec
    }

    /// PKCS#8 PEM of the private key. Callers own where this ends up.
    pub fn private_key_pem(&self) -> Result<String> {
        let pem = self.pkey.private_key_to_pem_pkcs8()?;
        String::from_utf8(pem).map_err(|e| AccessError::signing(e.to_string()))
    }

    pub fn public_key_pem(&self) -> Result<String> {
        let pem = self.pkey.public_key_to_pem()?;
        String::from_utf8(pem).map_err(|e| AccessError::signing(e.to_string()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("spec", &self.spec)
            .field("private", &"<redacted>")
            .finish()
    }
}

/// Unsigned request pairing a public key with the claimed identity
#[derive(Debug)]
pub struct CertificateSigningRequest {
    pub identity: Identity,
    pub pem: String,
}

/// A client certificate issued by the CA
#[derive(Debug, Clone, Serialize)]
pub struct SignedCertificate {
    pub identity: Identity,
    pub serial: u64,
    pub pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// SHA-256 fingerprint of the issuing CA certificate
    pub ca_fingerprint: String,
}

impl SignedCertificate {
    pub fn serial_hex(&self) -> String {
        format_serial(self.serial)
    }
}

/// Serial rendered the way `openssl x509 -serial` prints it
pub fn format_serial(serial: u64) -> String {
    let bytes = serial.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    hex::encode_upper(&bytes[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_rsa_rejected() {
        assert!(KeySpec::Rsa { bits: 1024 }.validate().is_err());
        assert!(KeySpec::Rsa { bits: 2048 }.validate().is_ok());
        assert!(KeySpec::EcP256.validate().is_ok());
    }

    #[test]
    fn key_spec_config_form() {
        let spec: KeySpec = serde_json::from_str(r#"{"algorithm":"rsa","bits":4096}"#).unwrap();
        assert_eq!(spec, KeySpec::Rsa { bits: 4096 });
        let spec: KeySpec = serde_json::from_str(r#"{"algorithm":"ec-p256"}"#).unwrap();
        assert_eq!(spec, KeySpec::EcP256);
    }

    #[test]
    fn serial_formatting_strips_leading_zeros() {
        assert_eq!(format_serial(1), "01");
        assert_eq!(format_serial(0x1234), "1234");
        assert_eq!(format_serial(0), "00");
    }
}
