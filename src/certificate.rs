//! Certificate handling for the TLS listener
//! Loads the user's certificate authority from a PKCS#12 archive and mints
//! the leaf certificate the listener presents

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Months, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use thiserror::Error;
use tracing::{debug, info};

/// Key size of every issued leaf certificate
const LEAF_KEY_BITS: u32 = 2048;

/// Serial number stamped on issued leaf certificates.
/// Only one leaf is live per process, so it never has to be unique.
const LEAF_SERIAL: u32 = 1;

/// Fixed subject attributes carried next to the common name
const LEAF_SUBJECT: [(Nid, &str); 5] = [
    (Nid::COUNTRYNAME, "CN"),
    (Nid::STATEORPROVINCENAME, "Beijing"),
    (Nid::LOCALITYNAME, "Beijing"),
    (Nid::ORGANIZATIONNAME, "YASD"),
    (Nid::ORGANIZATIONALUNITNAME, "IT"),
];

/// Failure to turn the configured archive into a usable authority
#[derive(Debug, Error)]
pub enum CertificateAuthorityError {
    #[error("certificate archive is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("certificate archive is not a PKCS#12 container: {0}")]
    Archive(#[source] ErrorStack),

    #[error("failed to decrypt certificate archive, check the passphrase: {0}")]
    Decrypt(#[source] ErrorStack),

    #[error("certificate archive contains no certificate")]
    MissingCertificate,

    #[error("certificate archive contains no private key")]
    MissingPrivateKey,

    #[error("certificate and private key in the archive do not belong together")]
    KeyMismatch,
}

/// Failure while minting the leaf certificate
#[derive(Debug, Error)]
pub enum CertificateIssuanceError {
    #[error("failed to generate leaf key pair: {0}")]
    KeyGeneration(#[source] ErrorStack),

    #[error("failed to build leaf certificate: {0}")]
    Build(#[source] ErrorStack),

    #[error("failed to sign leaf certificate with the authority key: {0}")]
    Sign(#[source] ErrorStack),

    #[error("failed to encode leaf certificate: {0}")]
    Encode(#[source] ErrorStack),

    #[error("validity window for the leaf certificate is out of range")]
    Validity,
}

/// A certificate authority: its certificate and the matching private key
#[derive(Clone)]
pub struct CertificateAuthority {
    certificate: X509,
    private_key: PKey<Private>,
}

impl CertificateAuthority {
    /// Decode a base64 PKCS#12 archive and decrypt it with `passphrase`
    pub fn from_pkcs12_base64(
        archive: &str,
        passphrase: &str,
    ) -> Result<Self, CertificateAuthorityError> {
        // Profiles sometimes wrap long values, so whitespace is not significant
        let compact: String = archive.split_whitespace().collect();
        let der = STANDARD.decode(compact.as_bytes())?;

        Self::from_pkcs12_der(&der, passphrase)
    }

    /// Decrypt a binary PKCS#12 archive with `passphrase`
    pub fn from_pkcs12_der(der: &[u8], passphrase: &str) -> Result<Self, CertificateAuthorityError> {
        let pkcs12 = Pkcs12::from_der(der).map_err(CertificateAuthorityError::Archive)?;
        let parsed = pkcs12
            .parse2(passphrase)
            .map_err(CertificateAuthorityError::Decrypt)?;

        // A certificate bag without a matching key id lands in the chain
        let certificate = match parsed.cert {
            Some(cert) => cert,
            None => parsed
                .ca
                .and_then(|chain| chain.into_iter().next())
                .ok_or(CertificateAuthorityError::MissingCertificate)?,
        };
        let private_key = parsed
            .pkey
            .ok_or(CertificateAuthorityError::MissingPrivateKey)?;

        let public_key = certificate
            .public_key()
            .map_err(CertificateAuthorityError::Archive)?;
        if !public_key.public_eq(&private_key) {
            return Err(CertificateAuthorityError::KeyMismatch);
        }

        debug!(
            "Loaded certificate authority {}",
            common_name(&certificate).unwrap_or_else(|| "<unnamed>".to_string())
        );

        Ok(Self {
            certificate,
            private_key,
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }
}

/// A leaf certificate issued by a [`CertificateAuthority`] for one domain
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub domain: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Mint a leaf certificate for `domain`, signed by `authority`, valid for one year
pub fn issue_cert_for_domain(
    authority: &CertificateAuthority,
    domain: &str,
) -> Result<IssuedCertificate, CertificateIssuanceError> {
    use CertificateIssuanceError::{Build, Encode, KeyGeneration, Sign};

    let rsa = Rsa::generate(LEAF_KEY_BITS).map_err(KeyGeneration)?;
    let leaf_key = PKey::from_rsa(rsa).map_err(KeyGeneration)?;

    let mut subject = X509NameBuilder::new().map_err(Build)?;
    subject
        .append_entry_by_nid(Nid::COMMONNAME, domain)
        .map_err(Build)?;
    for (nid, value) in LEAF_SUBJECT {
        subject.append_entry_by_nid(nid, value).map_err(Build)?;
    }
    let subject = subject.build();

    let (not_before, not_after) = validity_window(Utc::now())?;
    let serial = BigNum::from_u32(LEAF_SERIAL)
        .and_then(|bn| bn.to_asn1_integer())
        .map_err(Build)?;

    let mut builder = X509::builder().map_err(Build)?;
    builder.set_version(2).map_err(Build)?;
    builder.set_serial_number(&serial).map_err(Build)?;
    builder.set_subject_name(&subject).map_err(Build)?;
    builder
        .set_issuer_name(authority.certificate.subject_name())
        .map_err(Build)?;
    builder.set_pubkey(&leaf_key).map_err(Build)?;
    let valid_from = Asn1Time::from_unix(not_before.timestamp()).map_err(Build)?;
    let valid_until = Asn1Time::from_unix(not_after.timestamp()).map_err(Build)?;
    builder.set_not_before(&valid_from).map_err(Build)?;
    builder.set_not_after(&valid_until).map_err(Build)?;

    let key_usage = KeyUsage::new()
        .key_cert_sign()
        .digital_signature()
        .non_repudiation()
        .key_encipherment()
        .data_encipherment()
        .build()
        .map_err(Build)?;
    builder.append_extension(key_usage).map_err(Build)?;

    let extended_key_usage = ExtendedKeyUsage::new()
        .server_auth()
        .client_auth()
        .code_signing()
        .email_protection()
        .time_stamping()
        .build()
        .map_err(Build)?;
    builder.append_extension(extended_key_usage).map_err(Build)?;

    let subject_alt_name = SubjectAlternativeName::new()
        .dns(domain)
        .build(&builder.x509v3_context(Some(authority.certificate.as_ref()), None))
        .map_err(Build)?;
    builder.append_extension(subject_alt_name).map_err(Build)?;

    builder
        .sign(&authority.private_key, MessageDigest::sha256())
        .map_err(Sign)?;
    let certificate = builder.build();

    let certificate_pem = pem_string(certificate.to_pem().map_err(Encode)?);
    let private_key_pem = pem_string(leaf_key.private_key_to_pem_pkcs8().map_err(Encode)?);

    info!(
        "Issued certificate for {} (valid until {})",
        domain,
        not_after.format("%Y-%m-%d")
    );

    Ok(IssuedCertificate {
        domain: domain.to_string(),
        certificate_pem,
        private_key_pem,
        not_before,
        not_after,
    })
}

/// One calendar year starting at `now`, truncated to whole seconds
fn validity_window(
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), CertificateIssuanceError> {
    let not_before = DateTime::from_timestamp(now.timestamp(), 0)
        .ok_or(CertificateIssuanceError::Validity)?;
    let not_after = not_before
        .checked_add_months(Months::new(12))
        .ok_or(CertificateIssuanceError::Validity)?;
    Ok((not_before, not_after))
}

fn pem_string(bytes: Vec<u8>) -> String {
    // PEM output from openssl is always ASCII
    String::from_utf8_lossy(&bytes).into_owned()
}

fn common_name(certificate: &X509) -> Option<String> {
    certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).into_owned())
}
