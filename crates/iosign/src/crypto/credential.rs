//! Signing credential ingestion.
//!
//! A CI job receives its signing identity either as a PKCS#12 container with
//! a password, or as a certificate plus RSA private key. Both end up as a
//! [`ValidatedP12`]: a container that is known to decrypt, whose key matches
//! its certificate, and that macOS `security import` will accept.
//!
//! PKCS#12 files exported by older Keychain Access versions use RC2/3DES
//! encryption that OpenSSL 3 refuses without its legacy provider, so parsing
//! tries the modern OpenSSL path first and then a pure-Rust parser that
//! still understands the legacy algorithms.
//!
//! # Examples
//!
//! ```no_run
//! use iosign::crypto::{ingest, CredentialInput};
//! use secrecy::SecretString;
//!
//! let bytes = std::fs::read("dist.p12")?;
//! let p12 = ingest(CredentialInput::P12 {
//!     label: "dist.p12".into(),
//!     bytes,
//!     password: SecretString::new("secret".into()),
//! })?;
//! println!("{} ({:?})", p12.credential().common_name, p12.credential().team_id);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::CredentialError;
use crate::Result;
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretString};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;
use tracing::{debug, warn};

/// Length in bytes of the random password protecting a synthesized container.
const GENERATED_PASSWORD_BYTES: usize = 24;

/// How the credential was supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    /// A PKCS#12 container with its password.
    P12,
    /// A separate certificate and private key.
    CerKey,
}

/// Which parser accepted a PKCS#12 container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum P12Encryption {
    /// OpenSSL's PKCS#12 implementation (PBES2/AES or anything the default
    /// provider supports).
    Modern,
    /// The pure-Rust parser (RC2-40 / 3DES PBE).
    Legacy,
    /// Built here from a certificate and key.
    Synthesized,
}

/// Raw credential input.
pub enum CredentialInput {
    /// PKCS#12 bytes and password.
    P12 {
        /// Name of the input used in errors and logs.
        label: String,
        bytes: Vec<u8>,
        password: SecretString,
    },
    /// Certificate (DER or PEM) and RSA private key (PEM or DER).
    CerKey {
        label: String,
        certificate: Vec<u8>,
        private_key: Vec<u8>,
    },
}

/// Immutable facts about a validated signing identity.
///
/// The original input bytes are retained untouched in `cert_bytes` and
/// `key_bytes`; a CER+KEY pair is only ever wrapped, never rewritten.
#[derive(Clone)]
pub struct SigningCredential {
    pub kind: CredentialKind,
    /// PKCS#12 bytes for [`CredentialKind::P12`], certificate bytes otherwise.
    pub cert_bytes: Vec<u8>,
    /// Private key bytes for [`CredentialKind::CerKey`].
    pub key_bytes: Option<Vec<u8>>,
    password: SecretString,
    /// Certificate subject common name, e.g. `Apple Distribution: Acme Inc (ABCDE12345)`.
    pub common_name: String,
    /// Apple team id from the certificate's organizational unit.
    pub team_id: Option<String>,
    /// Upper-case hex SHA-1 of the certificate DER; `codesign` accepts it as
    /// an identity.
    pub sha1_fingerprint: String,
    /// Certificate expiry as printed by OpenSSL.
    pub not_after: String,
}

impl SigningCredential {
    /// Password protecting the container handed to the keychain.
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("kind", &self.kind)
            .field("common_name", &self.common_name)
            .field("team_id", &self.team_id)
            .field("sha1_fingerprint", &self.sha1_fingerprint)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// A PKCS#12 container that decrypts with its password and holds a matching
/// certificate and private key.
pub struct ValidatedP12 {
    der: Vec<u8>,
    credential: SigningCredential,
    certificate: X509,
    private_key: PKey<Private>,
    encryption: P12Encryption,
}

impl ValidatedP12 {
    /// DER bytes of the container to import.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn credential(&self) -> &SigningCredential {
        &self.credential
    }

    pub fn encryption(&self) -> P12Encryption {
        self.encryption
    }

    /// Certificate as PEM, for importing the certificate on its own.
    pub fn certificate_pem(&self) -> Result<Vec<u8>> {
        self.certificate
            .to_pem()
            .map_err(|e| unreadable("certificate", format!("Failed to encode certificate: {}", e)))
    }

    /// Unencrypted PKCS#8 private key as PEM, for importing the key on its
    /// own. Callers write it to a private temp file and delete it afterwards.
    pub fn private_key_pem(&self) -> Result<SecretString> {
        let pem = self
            .private_key
            .private_key_to_pem_pkcs8()
            .map_err(|e| unreadable("private key", format!("Failed to encode private key: {}", e)))?;
        let pem = String::from_utf8(pem)
            .map_err(|e| unreadable("private key", format!("Invalid PEM encoding: {}", e)))?;
        Ok(SecretString::new(pem))
    }
}

impl fmt::Debug for ValidatedP12 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedP12")
            .field("credential", &self.credential)
            .field("encryption", &self.encryption)
            .field("len", &self.der.len())
            .finish()
    }
}

/// Validate a credential and produce an importable PKCS#12 container.
///
/// # Errors
///
/// - [`CredentialError::PasswordMismatch`] if the container's MAC does not
///   verify with the password.
/// - [`CredentialError::Unreadable`] for anything else: malformed DER/PEM, a
///   non-RSA key, a key that does not match the certificate, or a container
///   missing either half.
pub fn ingest(input: CredentialInput) -> Result<ValidatedP12> {
    match input {
        CredentialInput::P12 {
            label,
            bytes,
            password,
        } => ingest_p12(&label, bytes, password),
        CredentialInput::CerKey {
            label,
            certificate,
            private_key,
        } => ingest_cer_key(&label, certificate, private_key),
    }
}

fn ingest_p12(label: &str, bytes: Vec<u8>, password: SecretString) -> Result<ValidatedP12> {
    let (certificate, private_key, encryption) =
        settle(label, parse_modern(&bytes, &password), || parse_legacy(label, &bytes, &password))?;

    validate_key_pair(label, &certificate, &private_key)?;
    let credential = describe(
        label,
        CredentialKind::P12,
        bytes.clone(),
        None,
        password,
        &certificate,
    )?;

    Ok(ValidatedP12 {
        der: bytes,
        credential,
        certificate,
        private_key,
        encryption,
    })
}

/// Why OpenSSL rejected a container.
enum ModernFailure {
    MacMismatch,
    Other(String),
}

/// What the pure-Rust parser made of a container.
enum LegacyParse {
    Parsed(X509, PKey<Private>),
    MacMismatch,
    NotPfx,
}

/// Combine both parsers. The password is only reported wrong when neither
/// parser accepts its MAC.
fn settle(
    label: &str,
    modern: std::result::Result<(X509, PKey<Private>), ModernFailure>,
    legacy: impl FnOnce() -> Result<LegacyParse>,
) -> Result<(X509, PKey<Private>, P12Encryption)> {
    let modern_reason = match modern {
        Ok((cert, key)) => return Ok((cert, key, P12Encryption::Modern)),
        Err(ModernFailure::MacMismatch) => None,
        Err(ModernFailure::Other(reason)) => Some(reason),
    };
    debug!(
        input = label,
        reason = modern_reason.as_deref().unwrap_or("mac verify failure"),
        "modern PKCS#12 parse failed, trying legacy"
    );

    match (legacy()?, modern_reason) {
        (LegacyParse::Parsed(cert, key), _) => Ok((cert, key, P12Encryption::Legacy)),
        (LegacyParse::MacMismatch | LegacyParse::NotPfx, None) => Err(CredentialError::PasswordMismatch {
            input: label.to_string(),
        }
        .into()),
        (_, Some(reason)) => Err(unreadable(label, reason)),
    }
}

fn parse_modern(
    bytes: &[u8],
    password: &SecretString,
) -> std::result::Result<(X509, PKey<Private>), ModernFailure> {
    let pkcs12 = Pkcs12::from_der(bytes)
        .map_err(|e| ModernFailure::Other(format!("Invalid PKCS#12: {}", e)))?;
    let parsed = pkcs12.parse2(password.expose_secret()).map_err(|stack| {
        let mac_failure = stack
            .errors()
            .iter()
            .any(|e| e.reason().is_some_and(|r| r.contains("mac verify failure")));
        if mac_failure {
            ModernFailure::MacMismatch
        } else {
            ModernFailure::Other(format!("Failed to parse PKCS#12: {}", stack))
        }
    })?;
    let cert = parsed
        .cert
        .ok_or_else(|| ModernFailure::Other("No certificate in PKCS#12".into()))?;
    let key = parsed
        .pkey
        .ok_or_else(|| ModernFailure::Other("No private key in PKCS#12".into()))?;
    Ok((cert, key))
}

/// Parse with the pure-Rust PKCS#12 implementation, which handles the
/// RC2/3DES encryption and BMPString password encoding on its own.
///
/// Once the MAC verifies, a decryption failure means an algorithm or
/// structure problem rather than a bad password.
fn parse_legacy(label: &str, bytes: &[u8], password: &SecretString) -> Result<LegacyParse> {
    let pfx = match p12::PFX::parse(bytes) {
        Ok(pfx) => pfx,
        Err(e) => {
            debug!(input = label, reason = ?e, "legacy PKCS#12 parse failed");
            return Ok(LegacyParse::NotPfx);
        }
    };

    let pass = password.expose_secret();
    if !pfx.verify_mac(pass) {
        debug!(input = label, "legacy PKCS#12 MAC did not verify");
        return Ok(LegacyParse::MacMismatch);
    }
    let keys = pfx
        .key_bags(pass)
        .map_err(|e| unreadable(label, format!("Failed to extract keys from PKCS#12: {:?}", e)))?;
    let certs = pfx
        .cert_x509_bags(pass)
        .map_err(|e| unreadable(label, format!("Failed to extract certs from PKCS#12: {:?}", e)))?;

    let key_der = keys
        .first()
        .ok_or_else(|| unreadable(label, "No private key in PKCS#12"))?;
    let private_key = PKey::private_key_from_pkcs8(key_der)
        .map_err(|e| unreadable(label, format!("Failed to parse private key: {}", e)))?;

    // The leaf is the certificate whose public key matches the private key;
    // containers do not always list it first.
    let certificate = certs
        .iter()
        .filter_map(|der| X509::from_der(der).ok())
        .find(|cert| {
            cert.public_key()
                .map(|pk| private_key.public_eq(&pk))
                .unwrap_or(false)
        })
        .ok_or_else(|| unreadable(label, "No certificate matching the private key in PKCS#12"))?;

    Ok(LegacyParse::Parsed(certificate, private_key))
}

fn ingest_cer_key(label: &str, cert_bytes: Vec<u8>, key_bytes: Vec<u8>) -> Result<ValidatedP12> {
    let parsed = X509::from_pem(&cert_bytes)
        .or_else(|_| X509::from_der(&cert_bytes))
        .map_err(|e| unreadable(label, format!("Failed to load certificate: {}", e)))?;

    // Normalize through PEM and re-parse so a certificate that only decodes
    // leniently is rejected here rather than by `security import`.
    let cert_pem = parsed
        .to_pem()
        .map_err(|e| unreadable(label, format!("Failed to convert certificate to PEM: {}", e)))?;
    let certificate = X509::from_pem(&cert_pem)
        .map_err(|e| unreadable(label, format!("Certificate is not well-formed X.509: {}", e)))?;

    let private_key = PKey::private_key_from_pem(&key_bytes)
        .or_else(|_| PKey::private_key_from_der(&key_bytes))
        .map_err(|e| unreadable(label, format!("Failed to load private key: {}", e)))?;

    let rsa = private_key
        .rsa()
        .map_err(|_| unreadable(label, "Private key is not an RSA key"))?;
    if !rsa.check_key().unwrap_or(false) {
        return Err(unreadable(label, "RSA private key failed consistency check"));
    }

    validate_key_pair(label, &certificate, &private_key)?;

    let password = generate_password(label)?;
    let common_name = common_name(&certificate).unwrap_or_else(|| "iosign".to_string());

    let mut builder = Pkcs12::builder();
    builder
        .name(&common_name)
        .pkey(&private_key)
        .cert(&certificate)
        .key_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
        .cert_algorithm(Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC)
        .mac_md(MessageDigest::sha1());
    let der = builder
        .build2(password.expose_secret())
        .and_then(|p12| p12.to_der())
        .map_err(|e| unreadable(label, format!("Failed to build PKCS#12: {}", e)))?;

    if parse_modern(&der, &password).is_err() {
        return Err(unreadable(label, "Synthesized PKCS#12 does not parse"));
    }

    let credential = describe(
        label,
        CredentialKind::CerKey,
        cert_bytes,
        Some(key_bytes),
        password,
        &certificate,
    )?;

    Ok(ValidatedP12 {
        der,
        credential,
        certificate,
        private_key,
        encryption: P12Encryption::Synthesized,
    })
}

fn describe(
    label: &str,
    kind: CredentialKind,
    cert_bytes: Vec<u8>,
    key_bytes: Option<Vec<u8>>,
    password: SecretString,
    certificate: &X509,
) -> Result<SigningCredential> {
    let der = certificate
        .to_der()
        .map_err(|e| unreadable(label, format!("Failed to encode certificate: {}", e)))?;
    let sha1_fingerprint = hex::encode_upper(Sha1::digest(&der));

    let common_name = common_name(certificate)
        .ok_or_else(|| unreadable(label, "Certificate has no common name"))?;
    let team_id = extract_team_id(certificate);

    if let Ok(now) = Asn1Time::days_from_now(0) {
        if certificate.not_after().compare(&now).ok() == Some(Ordering::Less) {
            warn!(input = label, common_name = %common_name, not_after = %certificate.not_after(), "signing certificate has expired");
        }
    }

    Ok(SigningCredential {
        kind,
        cert_bytes,
        key_bytes,
        password,
        common_name,
        team_id,
        sha1_fingerprint,
        not_after: certificate.not_after().to_string(),
    })
}

/// Validate that the private key matches the certificate's public key.
fn validate_key_pair(label: &str, cert: &X509, private_key: &PKey<Private>) -> Result<()> {
    let cert_public_key = cert.public_key().map_err(|e| {
        unreadable(
            label,
            format!("Failed to extract public key from certificate: {}", e),
        )
    })?;

    if !private_key.public_eq(&cert_public_key) {
        return Err(unreadable(
            label,
            "Private key does not match certificate public key",
        ));
    }

    Ok(())
}

fn common_name(cert: &X509) -> Option<String> {
    subject_entry(cert, Nid::COMMONNAME)
}

/// Team ID lives in the subject's Organizational Unit.
fn extract_team_id(cert: &X509) -> Option<String> {
    subject_entry(cert, Nid::ORGANIZATIONALUNITNAME)
}

fn subject_entry(cert: &X509, nid: Nid) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(nid)
        .next()
        .and_then(|entry| String::from_utf8(entry.data().as_slice().to_vec()).ok())
}

fn generate_password(label: &str) -> Result<SecretString> {
    let mut buf = [0u8; GENERATED_PASSWORD_BYTES];
    openssl::rand::rand_bytes(&mut buf)
        .map_err(|e| unreadable(label, format!("Failed to generate password: {}", e)))?;
    Ok(SecretString::new(hex::encode(buf)))
}

fn unreadable(input: impl Into<String>, reason: impl Into<String>) -> crate::Error {
    CredentialError::Unreadable {
        input: input.into(),
        reason: reason.into(),
    }
    .into()
}
