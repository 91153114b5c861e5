// src/cert/signer.rs
use std::{collections::BTreeSet, path::Path, sync::Arc};

use chrono::Utc;
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    nid::Nid,
    pkey::Id,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectKeyIdentifier,
        },
        X509NameRef, X509Req, X509,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ca::{asn1_to_chrono, CaKeyMaterial};
use super::crl;
use super::ledger::{CaRotation, IssuanceLedger, IssuedCertificate, RevocationRecord};
use super::openssl::subject_name;
use super::types::{CertificateSigningRequest, KeySpec, SignedCertificate};
use crate::error::{AccessError, Result};
use crate::types::Identity;
use crate::utils::files::write_atomic;

pub const DEFAULT_VALIDITY_DAYS: u32 = 90;

/// Constraints every issued client certificate must satisfy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningPolicy {
    pub max_validity_days: u32,
    /// Groups no client certificate may carry, e.g. `system:masters`,
    /// membership in which bypasses RBAC entirely
    pub forbidden_groups: Vec<String>,
}

impl Default for SigningPolicy {
    fn default() -> Self {
        Self {
            max_validity_days: 365,
            forbidden_groups: vec!["system:masters".to_string()],
        }
    }
}

/// Signs client CSRs and owns the CA's issuance ledger.
pub struct CertificateAuthoritySigner {
    ledger: Arc<IssuanceLedger>,
    policy: SigningPolicy,
}

impl CertificateAuthoritySigner {
    pub fn new(ledger: Arc<IssuanceLedger>, policy: SigningPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn ledger(&self) -> &IssuanceLedger {
        &self.ledger
    }

    pub fn policy(&self) -> &SigningPolicy {
        &self.policy
    }

    pub fn sign(
        &self,
        csr: CertificateSigningRequest,
        ca: &CaKeyMaterial,
        validity_days: u32,
    ) -> Result<SignedCertificate> {
        self.check_validity(ca, validity_days)?;
        let identity = csr.identity;

        if let Some(group) = identity
            .groups()
            .iter()
            .find(|g| self.policy.forbidden_groups.contains(g))
        {
            return Err(AccessError::invalid_identity(format!(
                "group '{}' may not be granted through client certificates",
                group
            )));
        }

        self.check_groups_unchanged(&identity)?;

        let req = X509Req::from_pem(csr.pem.as_bytes())
            .map_err(|e| AccessError::signing(format!("unparsable CSR: {}", e)))?;
        let public_key = req.public_key()?;
        if !req.verify(&public_key)? {
            return Err(AccessError::signing("CSR signature does not verify"));
        }
        if name_entries(req.subject_name(), Nid::COMMONNAME) != [identity.name()]
            || name_entries(req.subject_name(), Nid::ORGANIZATIONNAME) != identity.groups()
        {
            return Err(AccessError::invalid_identity(format!(
                "CSR subject does not match identity '{}'",
                identity.name()
            )));
        }

        let ca_fingerprint = ca.fingerprint()?;
        let serial = self.ledger.allocate_serial()?;

        let cert = build_client_certificate(&req, ca, serial, validity_days, &identity)?;
        let pem =
            String::from_utf8(cert.to_pem()?).map_err(|e| AccessError::signing(e.to_string()))?;
        let not_before = asn1_to_chrono(cert.not_before())?;
        let not_after = asn1_to_chrono(cert.not_after())?;

        self.ledger.record_issued(IssuedCertificate {
            serial,
            subject: identity.name().to_string(),
            groups: identity.groups().to_vec(),
            ca_fingerprint: ca_fingerprint.clone(),
            not_before,
            not_after,
        })?;

        info!(
            user = %identity.name(),
            serial = serial,
            not_after = %not_after,
            "Issued client certificate"
        );

        Ok(SignedCertificate {
            identity,
            serial,
            pem,
            not_before,
            not_after,
            ca_fingerprint,
        })
    }

    fn check_validity(&self, ca: &CaKeyMaterial, validity_days: u32) -> Result<()> {
        if validity_days == 0 {
            return Err(AccessError::validation("validity must be at least one day"));
        }
        if validity_days > self.policy.max_validity_days {
            return Err(AccessError::validation(format!(
                "validity of {} days exceeds the {} day maximum",
                validity_days, self.policy.max_validity_days
            )));
        }
        let expires = Utc::now() + chrono::Duration::days(i64::from(validity_days));
        if expires > ca.not_after()? {
            return Err(AccessError::validation(format!(
                "a {} day certificate would outlive the CA",
                validity_days
            )));
        }
        Ok(())
    }

    /// A subject keeps the groups of its live certificates until those
    /// are revoked or expire.
    fn check_groups_unchanged(&self, identity: &Identity) -> Result<()> {
        let requested: BTreeSet<&String> = identity.groups().iter().collect();
        let now = Utc::now();
        for issued in self.ledger.issued_to(identity.name())? {
            if issued.not_after <= now || self.ledger.is_revoked(issued.serial)? {
                continue;
            }
            if issued.groups.iter().collect::<BTreeSet<_>>() != requested {
                return Err(AccessError::invalid_identity(format!(
                    "'{}' holds certificate {} for groups [{}]; revoke it before issuing for [{}]",
                    identity.name(),
                    issued.serial,
                    issued.groups.join(", "),
                    identity.groups().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Append a revocation record for `serial`; `None` if it already was.
    pub fn revoke(&self, serial: u64, reason: &str) -> Result<Option<RevocationRecord>> {
        let record = self.ledger.revoke(serial, reason)?;
        if let Some(record) = &record {
            info!(serial = record.serial, user = %record.subject, "Revoked certificate");
        }
        Ok(record)
    }

    /// Revoke every still-valid serial issued to `subject`.
    pub fn revoke_subject(&self, subject: &str, reason: &str) -> Result<Vec<RevocationRecord>> {
        let mut records = Vec::new();
        for cert in self.ledger.issued_to(subject)? {
            if let Some(record) = self.revoke(cert.serial, reason)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn is_revoked(&self, serial: u64) -> Result<bool> {
        self.ledger.is_revoked(serial)
    }

    /// PEM CRL over the whole revocation list, signed by `ca`
    pub fn render_crl(&self, ca: &CaKeyMaterial, next_update_days: u32) -> Result<String> {
        let revocations = self.ledger.snapshot()?.revocations;
        let number = self.ledger.next_crl_number()?;
        crl::render(ca, &revocations, number, next_update_days)
    }

    /// Render the CRL and atomically replace the file at `path`. Needs only
    /// the CA and this signer's ledger.
    pub fn publish_crl(
        &self,
        ca: &CaKeyMaterial,
        path: &Path,
        next_update_days: u32,
    ) -> Result<()> {
        let pem = self.render_crl(ca, next_update_days)?;
        write_atomic(path, pem)?;
        info!(path = %path.display(), "Published CRL");
        Ok(())
    }

    /// Replace `current` with a fresh CA of the same name. Certificates
    /// issued under the old CA stop being trusted once the cluster's
    /// client CA bundle is swapped.
    pub fn rotate_ca(
        &self,
        current: &CaKeyMaterial,
        validity_days: u32,
        spec: KeySpec,
    ) -> Result<CaKeyMaterial> {
        let common_name = current
            .common_name()
            .unwrap_or_else(|| "kubernetes-ca".to_string());
        let replacement = CaKeyMaterial::generate(&common_name, validity_days, spec)?;
        let rotation = CaRotation {
            previous_fingerprint: current.fingerprint()?,
            new_fingerprint: replacement.fingerprint()?,
            rotated_at: Utc::now(),
        };
        warn!(
            previous = %rotation.previous_fingerprint,
            new = %rotation.new_fingerprint,
            "Rotated CA; distribute the new trust anchor and reissue remaining users"
        );
        self.ledger.record_rotation(rotation)?;
        Ok(replacement)
    }
}

fn name_entries(name: &X509NameRef, nid: Nid) -> Vec<String> {
    name.entries_by_nid(nid)
        .filter_map(|e| e.data().as_utf8().ok().map(|s| s.to_string()))
        .collect()
}

fn build_client_certificate(
    req: &X509Req,
    ca: &CaKeyMaterial,
    serial: u64,
    validity_days: u32,
    identity: &Identity,
) -> Result<X509> {
    let serial = BigNum::from_slice(&serial.to_be_bytes())?;
    let public_key = req.public_key()?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&*serial.to_asn1_integer()?)?;
    builder.set_subject_name(&*subject_name(identity)?)?;
    builder.set_issuer_name(ca.cert().subject_name())?;
    builder.set_pubkey(&public_key)?;
    builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
    builder.set_not_after(&*Asn1Time::days_from_now(validity_days)?)?;

    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    let mut usage = KeyUsage::new();
    usage.critical().digital_signature();
    if public_key.id() == Id::RSA {
        usage.key_encipherment();
    }
    builder.append_extension(usage.build()?)?;
    builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;

    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(ca.cert()), None))?;
    let aki = AuthorityKeyIdentifier::new()
        .keyid(false)
        .build(&builder.x509v3_context(Some(ca.cert()), None))?;
    builder.append_extension(ski)?;
    builder.append_extension(aki)?;

    builder
        .sign(ca.key(), MessageDigest::sha256())
        .map_err(|e| AccessError::signing(format!("failed to sign certificate: {}", e)))?;
    Ok(builder.build())
}
