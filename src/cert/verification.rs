// src/cert/verification.rs
use chrono::{DateTime, Utc};
use openssl::x509::X509;
use serde::Serialize;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::X509Certificate;

use super::ca::CaKeyMaterial;
use super::ledger::IssuanceLedger;
use super::types::format_serial;
use crate::error::{AccessError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateStatus {
    Valid,
    NotYetValid,
    Expired,
    Revoked,
    UntrustedIssuer,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateReport {
    pub subject: String,
    pub groups: Vec<String>,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub status: CertificateStatus,
}

/// Check a client certificate against the CA and, when given, the
/// revocation ledger. Only unparsable input is an error; every other
/// outcome is reported through [`CertificateStatus`].
pub fn verify_certificate(
    cert_pem: &str,
    ca: &CaKeyMaterial,
    ledger: Option<&IssuanceLedger>,
) -> Result<CertificateReport> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| AccessError::validation(format!("not a PEM certificate: {}", e)))?;
    let parsed = pem
        .parse_x509()
        .map_err(|e| AccessError::validation(format!("unparsable certificate: {}", e)))?;

    let subject = attribute_values(&parsed, true)
        .into_iter()
        .next()
        .unwrap_or_default();
    let groups = attribute_values(&parsed, false);
    let serial_bytes = parsed.raw_serial();
    let not_before = timestamp(parsed.validity().not_before.timestamp())?;
    let not_after = timestamp(parsed.validity().not_after.timestamp())?;

    let x509 = X509::from_pem(cert_pem.as_bytes())?;
    let trusted = x509.verify(&*ca.cert().public_key()?).unwrap_or(false);

    let now = Utc::now();
    let status = if !trusted {
        CertificateStatus::UntrustedIssuer
    } else if serial_as_u64(serial_bytes)
        .map(|serial| ledger.map_or(Ok(false), |l| l.is_revoked(serial)))
        .transpose()?
        .unwrap_or(false)
    {
        CertificateStatus::Revoked
    } else if now < not_before {
        CertificateStatus::NotYetValid
    } else if now > not_after {
        CertificateStatus::Expired
    } else {
        CertificateStatus::Valid
    };

    Ok(CertificateReport {
        subject,
        groups,
        serial: serial_as_u64(serial_bytes)
            .map(format_serial)
            .unwrap_or_else(|| hex::encode_upper(serial_bytes)),
        not_before,
        not_after,
        status,
    })
}

fn attribute_values(cert: &X509Certificate<'_>, common_name: bool) -> Vec<String> {
    let subject = cert.subject();
    let values: Vec<_> = if common_name {
        subject.iter_common_name().collect()
    } else {
        subject.iter_organization().collect()
    };
    values
        .into_iter()
        .filter_map(|attr| attr.as_str().ok().map(str::to_string))
        .collect()
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AccessError::validation(format!("timestamp {} out of range", secs)))
}

fn serial_as_u64(raw: &[u8]) -> Option<u64> {
    let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
    let significant = &raw[start..];
    if significant.len() > 8 {
        return None;
    }
    Some(significant.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{
        CertificateAuthoritySigner, KeyMaterialGenerator, KeySpec, SigningPolicy,
    };
    use crate::types::Identity;
    use std::sync::Arc;

    fn issue(signer: &CertificateAuthoritySigner, ca: &CaKeyMaterial) -> String {
        let keys = KeyMaterialGenerator::new(KeySpec::EcP256).unwrap();
        let identity = Identity::with_group("alice", "team-group").unwrap();
        let key = keys.generate_key_pair().unwrap();
        let csr = keys.create_csr(&identity, &key).unwrap();
        signer.sign(csr, ca, 30).unwrap().pem
    }

    #[test]
    fn test_verify_reports_subject_and_status() {
        let ledger = Arc::new(IssuanceLedger::in_memory());
        let signer = CertificateAuthoritySigner::new(ledger.clone(), SigningPolicy::default());
        let ca = CaKeyMaterial::generate("kubernetes-ca", 365, KeySpec::EcP256).unwrap();
        let pem = issue(&signer, &ca);

        let report = verify_certificate(&pem, &ca, Some(&ledger)).unwrap();
        assert_eq!(report.subject, "alice");
        assert_eq!(report.groups, vec!["team-group"]);
        assert_eq!(report.status, CertificateStatus::Valid);

        signer.revoke_subject("alice", "offboarded").unwrap();
        let report = verify_certificate(&pem, &ca, Some(&ledger)).unwrap();
        assert_eq!(report.status, CertificateStatus::Revoked);
    }

    #[test]
    fn test_other_ca_is_untrusted() {
        let signer = CertificateAuthoritySigner::new(
            Arc::new(IssuanceLedger::in_memory()),
            SigningPolicy::default(),
        );
        let ca = CaKeyMaterial::generate("kubernetes-ca", 365, KeySpec::EcP256).unwrap();
        let other = CaKeyMaterial::generate("other-ca", 365, KeySpec::EcP256).unwrap();
        let pem = issue(&signer, &ca);

        let report = verify_certificate(&pem, &other, None).unwrap();
        assert_eq!(report.status, CertificateStatus::UntrustedIssuer);
    }

    #[test]
    fn test_garbage_is_an_error() {
        let ca = CaKeyMaterial::generate("kubernetes-ca", 365, KeySpec::EcP256).unwrap();
        assert!(verify_certificate("not a certificate", &ca, None).is_err());
    }

    #[test]
    fn test_serial_conversion() {
        assert_eq!(serial_as_u64(&[0x00, 0x12, 0x34]), Some(0x1234));
        assert_eq!(serial_as_u64(&[0x01; 9]), None);
    }
}
