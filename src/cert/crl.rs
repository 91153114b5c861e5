// src/cert/crl.rs
use rcgen::{
    CertificateParams, CertificateRevocationListParams, KeyIdMethod, KeyPair, RevocationReason,
    RevokedCertParams, SerialNumber,
};
use time::OffsetDateTime;

use super::ca::CaKeyMaterial;
use super::ledger::RevocationRecord;
use crate::error::{AccessError, Result};

/// Sign a CRL listing `revocations` with the CA key.
pub(crate) fn render(
    ca: &CaKeyMaterial,
    revocations: &[RevocationRecord],
    crl_number: u64,
    next_update_days: u32,
) -> Result<String> {
    if next_update_days == 0 {
        return Err(AccessError::validation("CRL next update must be at least one day out"));
    }

    let issuer_key = KeyPair::from_pem(&ca.key_pem_pkcs8()?)
        .map_err(|e| AccessError::ca_unavailable(format!("CA key unusable for CRL signing: {}", e)))?;
    let issuer = CertificateParams::from_ca_cert_pem(ca.cert_pem())
        .and_then(|params| params.self_signed(&issuer_key))
        .map_err(|e| AccessError::ca_unavailable(format!("CA certificate unusable for CRL signing: {}", e)))?;

    let revoked_certs = revocations
        .iter()
        .map(|r| {
            Ok(RevokedCertParams {
                serial_number: serial_number(r.serial),
                revocation_time: OffsetDateTime::from_unix_timestamp(r.revoked_at.timestamp())
                    .map_err(|e| AccessError::signing(e.to_string()))?,
                reason_code: Some(RevocationReason::CessationOfOperation),
                invalidity_date: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // Verifiers match the CRL's AKI against the CA's SKI
    let key_identifier_method = match ca.cert().subject_key_id() {
        Some(ski) => KeyIdMethod::PreSpecified(ski.as_slice().to_vec()),
        None => KeyIdMethod::Sha256,
    };

    let this_update = OffsetDateTime::now_utc();
    let params = CertificateRevocationListParams {
        this_update,
        next_update: this_update + time::Duration::days(i64::from(next_update_days)),
        crl_number: serial_number(crl_number),
        issuing_distribution_point: None,
        revoked_certs,
        key_identifier_method,
    };

    let crl = params
        .signed_by(&issuer, &issuer_key)
        .map_err(|e| AccessError::signing(format!("failed to sign CRL: {}", e)))?;
    crl.pem()
        .map_err(|e| AccessError::signing(format!("failed to encode CRL: {}", e)))
}

/// Minimal big-endian encoding, as DER integers require
fn serial_number(value: u64) -> SerialNumber {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    SerialNumber::from_slice(&bytes[start..])
}
