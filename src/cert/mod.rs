// src/cert/mod.rs
mod ca;
mod crl;
pub mod ledger;
mod openssl;
mod signer;
mod types;
pub mod verification;

pub use ca::CaKeyMaterial;
pub use ledger::{IssuanceLedger, RevocationRecord};
pub use self::openssl::KeyMaterialGenerator;
pub use signer::{CertificateAuthoritySigner, SigningPolicy, DEFAULT_VALIDITY_DAYS};
pub use types::{format_serial, CertificateSigningRequest, KeyPair, KeySpec, SignedCertificate};
pub use verification::{verify_certificate, CertificateReport, CertificateStatus};
