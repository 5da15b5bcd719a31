//! Build configuration.
//!
//! [`BuildConfig`] gathers every input the signing subsystem needs in one
//! immutable value: where the credential and profile come from, which
//! keychain to use, how the export manifest should look and how hard to
//! retry network fetches. It is loaded once (TOML file, then CLI overrides)
//! and passed by reference into each component.
//!
//! # Examples
//!
//! ```
//! use iosign::config::BuildConfig;
//!
//! let config = BuildConfig::from_toml_str(r#"
//!     bundle_id = "com.acme.app"
//!
//!     [credential]
//!     p12 = "certs/dist.p12"
//!     password = "hunter2"
//!
//!     [export]
//!     method = "ad-hoc"
//!     install_url = "https://cdn.acme.com/app/manifest.plist"
//! "#)?;
//! assert_eq!(config.bundle_id.as_deref(), Some("com.acme.app"));
//! # Ok::<(), iosign::Error>(())
//! ```

use crate::fetch::{RetryPolicy, Source};
use crate::ipa::CompressionLevel;
use crate::{Error, Result};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Immutable configuration for one build.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Requested main bundle identifier.
    pub bundle_id: Option<String>,
    /// Expected Apple team id; cross-checked against the certificate when set.
    pub team_id: Option<String>,
    #[serde(default)]
    pub credential: CredentialConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub keychain: KeychainConfig,
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub repair: RepairSettings,
}

/// Where the signing identity comes from.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    /// PKCS#12 container.
    pub p12: Option<Source>,
    /// Certificate (DER `.cer` or PEM), paired with `private_key`.
    pub certificate: Option<Source>,
    /// RSA private key (PEM or DER), paired with `certificate`.
    pub private_key: Option<Source>,
    /// Password of the PKCS#12 container.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
}

/// Provisioning profile location and reconciliation policy.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub source: Option<Source>,
    #[serde(default)]
    pub reconcile_policy: ReconcilePolicy,
}

/// What to do when a literal profile entitlement disagrees with the
/// requested bundle id.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcilePolicy {
    /// The profile's identifier replaces the requested one.
    #[default]
    ProfileWins,
    /// The mismatch is an error.
    Strict,
}

/// Keychain that receives the imported identity.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeychainConfig {
    /// Keychain file. Defaults to `iosign-build.keychain-db` in the temp dir.
    pub path: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    /// Tools granted access to the private key during import.
    #[serde(default = "default_trusted_tools")]
    pub trusted_tools: Vec<PathBuf>,
}

impl Default for KeychainConfig {
    fn default() -> Self {
        Self {
            path: None,
            password: None,
            trusted_tools: default_trusted_tools(),
        }
    }
}

fn default_trusted_tools() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/bin/codesign"),
        PathBuf::from("/usr/bin/xcodebuild"),
    ]
}

impl KeychainConfig {
    /// Keychain path, falling back to a file in the system temp directory.
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("iosign-build.keychain-db"))
    }
}

/// Inputs for the export manifest.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportSettings {
    /// Distribution method as written by the user; unknown values fall back
    /// to app-store with a warning.
    pub method: Option<String>,
    pub install_url: Option<String>,
    pub display_image_url: Option<String>,
    pub full_size_image_url: Option<String>,
    /// Overrides the method's `uploadSymbols` default.
    pub upload_symbols: Option<bool>,
    /// Additional bundle id to profile UUID (or name) entries.
    #[serde(default)]
    pub extra_profiles: BTreeMap<String, String>,
}

/// Package repair knobs.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepairSettings {
    /// Deflate level for entries rewritten during IPA repack.
    #[serde(default)]
    pub compression_level: CompressionLevel,
    /// Fail the repair if the main executable changes across a repack.
    #[serde(default = "default_true")]
    pub verify_executable: bool,
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self {
            compression_level: CompressionLevel::default(),
            verify_executable: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::new))
}

impl BuildConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BuildConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file. Relative paths in `Source` values stay
    /// relative to the working directory, not the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let c = &self.credential;
        if c.p12.is_some() && (c.certificate.is_some() || c.private_key.is_some()) {
            return Err(Error::Config(
                "credential.p12 cannot be combined with credential.certificate/private_key".into(),
            ));
        }
        if c.certificate.is_some() != c.private_key.is_some() {
            return Err(Error::Config(
                "credential.certificate and credential.private_key must be given together".into(),
            ));
        }
        if let Some(id) = &self.bundle_id {
            if !crate::namespace::is_valid_bundle_id(id) {
                return Err(Error::Config(format!("bundle_id `{}` is not a valid bundle identifier", id)));
            }
        }
        Ok(())
    }
}
