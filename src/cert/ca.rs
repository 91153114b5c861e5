use std::{fs, path::Path};

use chrono::{DateTime, Utc};
use openssl::{
    asn1::{Asn1Time, Asn1TimeRef},
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    x509::{
        extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier},
        X509NameBuilder, X509,
    },
};
use tracing::{debug, info};

use super::openssl::generate_private_key;
use super::types::KeySpec;
use crate::error::{AccessError, Result};
use crate::utils::files::{write_atomic, write_private};

/// CA certificate and private key, loaded once and shared read-only.
pub struct CaKeyMaterial {
    cert: X509,
    key: PKey<Private>,
    cert_pem: String,
}

impl std::fmt::Debug for CaKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaKeyMaterial")
            .field("common_name", &self.common_name())
            .field("fingerprint", &self.fingerprint().unwrap_or_default())
            .finish()
    }
}

impl CaKeyMaterial {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let cert = X509::from_pem(cert_pem.as_bytes())
            .map_err(|e| AccessError::ca_unavailable(format!("failed to parse CA certificate: {}", e)))?;
        let key = PKey::private_key_from_pem(key_pem.as_bytes())
            .map_err(|e| AccessError::ca_unavailable(format!("failed to parse CA key: {}", e)))?;

        let public = cert
            .public_key()
            .map_err(|e| AccessError::ca_unavailable(format!("CA certificate has no usable key: {}", e)))?;
        if !public.public_eq(&key) {
            return Err(AccessError::ca_unavailable(
                "CA key does not match CA certificate",
            ));
        }

        Ok(Self {
            cert,
            key,
            cert_pem: cert_pem.to_string(),
        })
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        debug!(cert = %cert_path.display(), key = %key_path.display(), "Loading CA material");
        let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
            AccessError::ca_unavailable(format!(
                "CA certificate not readable at {}: {}",
                cert_path.display(),
                e
            ))
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|e| {
            AccessError::ca_unavailable(format!(
                "CA key not readable at {}: {}",
                key_path.display(),
                e
            ))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Self-signed CA suitable for issuing client certificates and CRLs.
    pub fn generate(common_name: &str, validity_days: u32, spec: KeySpec) -> Result<Self> {
        if validity_days == 0 {
            return Err(AccessError::validation("CA validity must be at least one day"));
        }
        info!(common_name = %common_name, spec = %spec, "Generating CA certificate");

        let key = generate_private_key(spec)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)
            .map_err(|e| AccessError::validation(format!("invalid CA common name: {}", e)))?;
        let name = name.build();

        let mut serial = BigNum::new()?;
        serial.rand(127, MsbOption::MAYBE_ZERO, false)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*serial.to_asn1_integer()?)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&*Asn1Time::days_from_now(validity_days)?)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .digital_signature()
                .build()?,
        )?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;
        builder.sign(&key, MessageDigest::sha256())?;

        let cert = builder.build();
        let cert_pem =
            String::from_utf8(cert.to_pem()?).map_err(|e| AccessError::signing(e.to_string()))?;

        Ok(Self {
            cert,
            key,
            cert_pem,
        })
    }

    /// Write certificate and key; the key file is readable by the owner only.
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        write_private(key_path, self.key.private_key_to_pem_pkcs8()?)?;
        write_atomic(cert_path, &self.cert_pem)?;

        info!(cert = %cert_path.display(), "CA material written");
        Ok(())
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub(crate) fn key_pem_pkcs8(&self) -> Result<String> {
        String::from_utf8(self.key.private_key_to_pem_pkcs8()?)
            .map_err(|e| AccessError::signing(e.to_string()))
    }

    pub(crate) fn cert(&self) -> &X509 {
        &self.cert
    }

    pub(crate) fn key(&self) -> &PKey<Private> {
        &self.key
    }

    /// SHA-256 over the DER certificate, lowercase hex
    pub fn fingerprint(&self) -> Result<String> {
        Ok(hex::encode(self.cert.digest(MessageDigest::sha256())?))
    }

    pub fn common_name(&self) -> Option<String> {
        self.cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|s| s.to_string())
    }

    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        asn1_to_chrono(self.cert.not_after())
    }
}

pub(crate) fn asn1_to_chrono(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AccessError::signing(format!("timestamp {} out of range", secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_and_reload() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("ca/ca.crt");
        let key_path = dir.path().join("ca/ca.key");

        let ca = CaKeyMaterial::generate("kubernetes-ca", 3650, KeySpec::EcP256).unwrap();
        ca.save(&cert_path, &key_path).unwrap();

        let loaded = CaKeyMaterial::load(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.fingerprint().unwrap(), ca.fingerprint().unwrap());
        assert_eq!(loaded.common_name().as_deref(), Some("kubernetes-ca"));

        let days_left = (loaded.not_after().unwrap() - Utc::now()).num_days();
        assert!((3648..=3650).contains(&days_left));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_files_are_ca_unavailable() {
        let dir = TempDir::new().unwrap();
        let err = CaKeyMaterial::load(&dir.path().join("ca.crt"), &dir.path().join("ca.key"))
            .unwrap_err();
        assert!(matches!(err, AccessError::CaUnavailable(_)));
    }

    #[test]
    fn test_mismatched_key_is_rejected() {
        let a = CaKeyMaterial::generate("a", 30, KeySpec::EcP256).unwrap();
        let b = CaKeyMaterial::generate("b", 30, KeySpec::EcP256).unwrap();
        let err = CaKeyMaterial::from_pem(a.cert_pem(), &b.key_pem_pkcs8().unwrap()).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
