// src/cert/openssl.rs
use openssl::{
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509Name, X509NameBuilder, X509ReqBuilder},
};
use tracing::debug;

use super::types::{CertificateSigningRequest, KeyPair, KeySpec};
use crate::error::{AccessError, Result};
use crate::types::Identity;

/// Produces client key pairs and PKCS#10 requests in-process.
#[derive(Debug, Clone)]
pub struct KeyMaterialGenerator {
    spec: KeySpec,
}

impl KeyMaterialGenerator {
    pub fn new(spec: KeySpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self { spec })
    }

    pub fn spec(&self) -> KeySpec {
        self.spec
    }

    pub fn generate_key_pair(&self) -> Result<KeyPair> {
        debug!(spec = %self.spec, "Generating private key");
        let pkey = generate_private_key(self.spec)?;
        Ok(KeyPair::new(pkey, self.spec))
    }

    pub fn create_csr(
        &self,
        identity: &Identity,
        key_pair: &KeyPair,
    ) -> Result<CertificateSigningRequest> {
        debug!(user = %identity.name(), "Generating CSR");

        let name = subject_name(identity)?;
        let mut builder = X509ReqBuilder::new()?;
        builder.set_version(0)?;
        builder.set_subject_name(&name)?;
        builder.set_pubkey(&key_pair.pkey)?;
        builder.sign(&key_pair.pkey, MessageDigest::sha256())?;

        let pem = String::from_utf8(builder.build().to_pem()?)
            .map_err(|e| AccessError::signing(e.to_string()))?;

        Ok(CertificateSigningRequest {
            identity: identity.clone(),
            pem,
        })
    }
}

pub(crate) fn generate_private_key(spec: KeySpec) -> Result<PKey<Private>> {
    spec.validate()?;
    let pkey = match spec {
        KeySpec::Rsa { bits } => PKey::from_rsa(Rsa::generate(bits)?)?,
        KeySpec::EcP256 => {
            let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
            PKey::from_ec_key(EcKey::generate(&group)?)?
        }
        KeySpec::EcP384 => {
            let group = EcGroup::from_curve_name(Nid::SECP384R1)?;
            PKey::from_ec_key(EcKey::generate(&group)?)?
        }
    };
    Ok(pkey)
}

/// `CN=<user>, O=<group>...`
pub(crate) fn subject_name(identity: &Identity) -> Result<X509Name> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, identity.name())
        .map_err(|e| AccessError::invalid_identity(format!("{}: {}", identity.name(), e)))?;
    for group in identity.groups() {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, group)
            .map_err(|e| AccessError::invalid_identity(format!("{}: {}", group, e)))?;
    }
    Ok(name.build())
}
