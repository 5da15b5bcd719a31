//! Error types for iosign operations.
//!
//! This module defines the [`enum@Error`] enum returned by every public
//! operation, together with one enum per component so callers can match on
//! the exact failure without string inspection.
//!
//! Credential and profile errors are fatal: there is no safe default for a
//! missing identity. Namespace errors only surface once the repair engine has
//! exhausted its forced retry. Export configuration errors are recoverable and
//! normally only appear in log output.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a successful run.
pub const EXIT_OK: u8 = 0;
/// Exit code for a bad credential, profile, input or configuration.
pub const EXIT_VALIDATION: u8 = 1;
/// Exit code for a collision that survived every repair pass.
pub const EXIT_RESIDUAL_COLLISION: u8 = 2;

/// Error type for iosign operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses this error type.
///
/// # Examples
///
/// ```no_run
/// use iosign::{Error, NamespaceError};
///
/// fn report(err: &Error) {
///     match err {
///         Error::Namespace(NamespaceError::ResidualCollision { .. }) => eprintln!("still colliding"),
///         Error::Credential(e) => eprintln!("bad credential: {e}"),
///         other => eprintln!("{other}"),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// Signing credential could not be read, decrypted or installed.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Provisioning profile could not be parsed, is expired, or does not
    /// cover the requested bundle id.
    #[error(transparent)]
    Profile(#[from] ProfileError),

    /// Bundle identifier assignment failed.
    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    /// Export configuration could not be generated as requested.
    ///
    /// Only returned by the strict parsing helpers; the builder itself
    /// recovers with app-store defaults.
    #[error(transparent)]
    ExportConfig(#[from] ExportConfigError),

    /// The package on disk could not be read or rewritten.
    #[error(transparent)]
    RepairIo(#[from] RepairIoError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Property list parsing or serialization failed.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// ZIP archive operation failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Invalid configuration value or combination of values.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A remote or inline source could not be loaded.
    #[error("Failed to fetch {source_name} after {attempts} attempt(s): {reason}")]
    Fetch {
        source_name: String,
        attempts: u32,
        reason: String,
    },
}

impl Error {
    /// Process exit code for this error.
    ///
    /// Only a residual collision maps to `2`; every other failure is a
    /// validation failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Namespace(NamespaceError::ResidualCollision { .. }) => EXIT_RESIDUAL_COLLISION,
            _ => EXIT_VALIDATION,
        }
    }
}

/// Failures while ingesting or installing a signing credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The certificate, key or container bytes are not usable.
    #[error("Unreadable credential {input}: {reason}")]
    Unreadable { input: String, reason: String },

    /// The PKCS#12 MAC did not verify with the supplied password.
    #[error("Password does not match PKCS#12 container {input}")]
    PasswordMismatch { input: String },

    /// Every keychain import strategy failed.
    ///
    /// `attempts` lists `strategy: reason` for each attempt in order.
    #[error("All keychain import strategies failed for {keychain}: {}", attempts.join("; "))]
    ImportExhausted {
        keychain: PathBuf,
        attempts: Vec<String>,
    },

    /// A keychain command other than import failed.
    #[error("Keychain operation `{operation}` failed on {keychain}: {reason}")]
    Keychain {
        operation: String,
        keychain: PathBuf,
        reason: String,
    },
}

/// Failures while resolving or reconciling a provisioning profile.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// CMS envelope or embedded plist could not be parsed or verified.
    #[error("Unparseable provisioning profile {input}: {reason}")]
    Unparseable { input: String, reason: String },

    /// The profile expired before the build.
    #[error("Provisioning profile {uuid} ({name}) expired at {expired_at}")]
    Expired {
        uuid: String,
        name: String,
        expired_at: String,
    },

    /// The profile entitlement does not cover the requested bundle id.
    #[error("Provisioning profile {uuid} entitles `{entitled}`, which does not cover `{requested}`")]
    TeamMismatch {
        uuid: String,
        entitled: String,
        requested: String,
    },
}

/// Failures while assigning bundle identifiers.
#[derive(Debug, Error)]
pub enum NamespaceError {
    /// Colliding identifiers remain after the forced pass.
    #[error("Residual bundle id collision(s) after {passes} pass(es): {}", describe_residual(residual))]
    ResidualCollision {
        passes: u32,
        residual: Vec<ResidualCollision>,
    },

    /// An identifier is not a valid reverse-DNS bundle id.
    #[error("Invalid bundle identifier `{id}` for {node}")]
    SyntaxInvalid { node: PathBuf, id: String },
}

/// One identifier shared by more than one node after verification.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResidualCollision {
    /// The shared bundle identifier.
    pub bundle_id: String,
    /// Every node path carrying it.
    pub nodes: Vec<PathBuf>,
}

fn describe_residual(residual: &[ResidualCollision]) -> String {
    residual
        .iter()
        .map(|r| {
            let nodes: Vec<String> = r.nodes.iter().map(|p| p.display().to_string()).collect();
            format!("{} shared by [{}]", r.bundle_id, nodes.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Export configuration problems. Recoverable by design.
#[derive(Debug, Error)]
pub enum ExportConfigError {
    /// Distribution method is not one Apple's exporter understands.
    #[error("Unknown export method `{0}`")]
    UnknownMethod(String),
}

/// Failures reading or rewriting a package on disk.
#[derive(Debug, Error)]
pub enum RepairIoError {
    /// The archive is not a readable zip, lacks `Payload/`, or failed the
    /// post-repack integrity check.
    #[error("Corrupt package {path}: {reason}")]
    ZipCorrupt { path: PathBuf, reason: String },

    /// A file that has to be rewritten is not writable.
    #[error("Permission denied writing {path}")]
    PermissionDenied { path: PathBuf },

    /// The repair target is neither an IPA, an archive, an app bundle nor a
    /// Pods directory.
    #[error("Unsupported repair target {path}: {reason}")]
    UnsupportedTarget { path: PathBuf, reason: String },
}

impl RepairIoError {
    /// Classify an I/O failure on `path`, keeping permission problems distinct.
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Error {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Error::RepairIo(RepairIoError::PermissionDenied { path })
        } else {
            Error::Io(std::io::Error::new(
                err.kind(),
                format!("{}: {}", path.display(), err),
            ))
        }
    }
}
