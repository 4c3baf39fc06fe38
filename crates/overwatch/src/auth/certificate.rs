//! Agent certificate parsing.

use chrono::{DateTime, Utc};
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use sha2::{Digest, Sha256};

use gslb_common::GslbError;
use gslb_common::constants::FINGERPRINT_LOG_PREFIX_LEN;

/// The parts of an agent certificate that admission decisions need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    /// Lowercase hex SHA-256 over the DER encoding
    pub fingerprint: String,
    pub common_name: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl ParsedCertificate {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && now <= self.not_after
    }
}

/// Parse the first certificate in a PEM document
pub fn parse_pem(pem: &str) -> Result<ParsedCertificate, GslbError> {
    let der = CertificateDer::from_pem_slice(pem.as_bytes())
        .map_err(|e| GslbError::InvalidCertificate(format!("failed to decode PEM: {e}")))?;

    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| GslbError::InvalidCertificate(format!("failed to parse X.509: {e}")))?;

    let validity = cert.validity();
    let not_before = timestamp(validity.not_before.timestamp())?;
    let not_after = timestamp(validity.not_after.timestamp())?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    Ok(ParsedCertificate {
        fingerprint: fingerprint(der.as_ref()),
        common_name,
        not_before,
        not_after,
    })
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, GslbError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| GslbError::InvalidCertificate(format!("validity out of range: {secs}")))
}

pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Region from a `{prefix}-{region}` CommonName; empty when it doesn't match
pub fn region_from_common_name(common_name: &str, prefix: &str) -> String {
    common_name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|region| !region.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Loggable fingerprint prefix; full fingerprints never reach the logs
pub fn fingerprint_prefix(fingerprint: &str) -> &str {
    match fingerprint.char_indices().nth(FINGERPRINT_LOG_PREFIX_LEN) {
        Some((end, _)) => &fingerprint[..end],
        None => fingerprint,
    }
}
