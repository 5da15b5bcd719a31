//! `ExportOptions.plist` generation.
//!
//! [`ExportConfigBuilder::build`] turns a distribution method, the resolved
//! credential and profile into the manifest `xcodebuild -exportArchive`
//! reads. It never fails: an unrecognized method is logged and replaced by
//! app-store defaults, and a missing OTA URL only drops the manifest block.
//!
//! | Method | `uploadSymbols` | `manifest` |
//! |--------|-----------------|------------|
//! | app-store | true | - |
//! | ad-hoc | false | when an install URL is given |
//! | enterprise | true | - |
//! | development | false | - |

use crate::bundle::info_plist::write_atomic;
use crate::config::ExportSettings;
use crate::crypto::SigningCredential;
use crate::error::ExportConfigError;
use crate::profile::ProvisioningProfile;
use crate::Result;
use plist::{Dictionary, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub const SIGNING_STYLE_MANUAL: &str = "manual";
pub const THINNING_NONE: &str = "<none>";
pub const DESTINATION_EXPORT: &str = "export";

/// Apple distribution channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionMethod {
    #[default]
    AppStore,
    AdHoc,
    Enterprise,
    Development,
}

impl DistributionMethod {
    /// Value of the `method` key.
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionMethod::AppStore => "app-store",
            DistributionMethod::AdHoc => "ad-hoc",
            DistributionMethod::Enterprise => "enterprise",
            DistributionMethod::Development => "development",
        }
    }

    /// Default for `uploadSymbols`.
    pub fn uploads_symbols(&self) -> bool {
        matches!(self, DistributionMethod::AppStore | DistributionMethod::Enterprise)
    }

    /// Certificate name used when no credential is known.
    pub fn default_certificate(&self) -> &'static str {
        match self {
            DistributionMethod::Development => "Apple Development",
            _ => "Apple Distribution",
        }
    }

    /// Parse a method name, falling back to app-store with a warning.
    pub fn parse_or_default(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|e: ExportConfigError| {
            warn!(error = %e, fallback = "app-store", "using app-store export defaults");
            DistributionMethod::AppStore
        })
    }
}

impl FromStr for DistributionMethod {
    type Err = ExportConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app-store" | "app-store-connect" | "appstore" => Ok(DistributionMethod::AppStore),
            "ad-hoc" | "release-testing" | "adhoc" => Ok(DistributionMethod::AdHoc),
            "enterprise" => Ok(DistributionMethod::Enterprise),
            "development" | "debugging" => Ok(DistributionMethod::Development),
            _ => Err(ExportConfigError::UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for DistributionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional inputs to [`ExportConfigBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// OTA install manifest URL (`appURL`).
    pub install_url: Option<String>,
    pub display_image_url: Option<String>,
    pub full_size_image_url: Option<String>,
    /// Overrides the method's `uploadSymbols` default.
    pub upload_symbols: Option<bool>,
    /// Explicit bundle id to profile entries.
    pub extra_profiles: BTreeMap<String, String>,
    /// Further ids (for example repaired extension ids) mapped to the
    /// profile when its pattern covers them.
    pub additional_bundle_ids: Vec<String>,
}

impl From<&ExportSettings> for ExportOptions {
    fn from(settings: &ExportSettings) -> Self {
        Self {
            install_url: settings.install_url.clone(),
            display_image_url: settings.display_image_url.clone(),
            full_size_image_url: settings.full_size_image_url.clone(),
            upload_symbols: settings.upload_symbols,
            extra_profiles: settings.extra_profiles.clone(),
            additional_bundle_ids: Vec::new(),
        }
    }
}

/// OTA install block of an ad-hoc export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestBlock {
    pub app_url: String,
    pub display_image_url: Option<String>,
    pub full_size_image_url: Option<String>,
}

/// Contents of `ExportOptions.plist`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportManifest {
    pub method: DistributionMethod,
    pub team_id: String,
    pub signing_style: String,
    pub certificate_name: String,
    pub profile_mapping: BTreeMap<String, String>,
    pub upload_symbols: bool,
    pub upload_bitcode: bool,
    pub compile_bitcode: bool,
    pub thinning: String,
    pub strip_swift_symbols: bool,
    pub destination: String,
    pub manifest: Option<ManifestBlock>,
}

impl ExportManifest {
    pub fn to_plist(&self) -> Value {
        let mut root = Dictionary::new();
        root.insert("method".into(), self.method.as_str().into());
        root.insert("teamID".into(), self.team_id.clone().into());
        root.insert("signingStyle".into(), self.signing_style.clone().into());
        root.insert("signingCertificate".into(), self.certificate_name.clone().into());

        let mut profiles = Dictionary::new();
        for (bundle_id, profile) in &self.profile_mapping {
            profiles.insert(bundle_id.clone(), profile.clone().into());
        }
        root.insert("provisioningProfiles".into(), Value::Dictionary(profiles));

        root.insert("uploadSymbols".into(), self.upload_symbols.into());
        root.insert("uploadBitcode".into(), self.upload_bitcode.into());
        root.insert("compileBitcode".into(), self.compile_bitcode.into());
        root.insert("thinning".into(), self.thinning.clone().into());
        root.insert("stripSwiftSymbols".into(), self.strip_swift_symbols.into());
        root.insert("destination".into(), self.destination.clone().into());

        if let Some(block) = &self.manifest {
            let mut manifest = Dictionary::new();
            manifest.insert("appURL".into(), block.app_url.clone().into());
            if let Some(url) = &block.display_image_url {
                manifest.insert("displayImageURL".into(), url.clone().into());
            }
            if let Some(url) = &block.full_size_image_url {
                manifest.insert("fullSizeImageURL".into(), url.clone().into());
            }
            root.insert("manifest".into(), Value::Dictionary(manifest));
        }
        Value::Dictionary(root)
    }

    /// Serialize as an XML property list.
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &self.to_plist())?;
        Ok(buf)
    }

    /// Write the XML plist to `path` atomically.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_atomic(path, &self.to_xml()?)?;
        info!(path = %path.display(), method = %self.method, "wrote export options");
        Ok(())
    }
}

/// Builds [`ExportManifest`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportConfigBuilder;

impl ExportConfigBuilder {
    /// Build the export manifest for `method`.
    ///
    /// `method` may be any spelling Xcode accepts, including the Xcode 15.3
    /// names (`app-store-connect`, `release-testing`, `debugging`).
    pub fn build(
        method: &str,
        credential: Option<&SigningCredential>,
        profile: &ProvisioningProfile,
        bundle_id: &str,
        options: &ExportOptions,
    ) -> ExportManifest {
        let method = DistributionMethod::parse_or_default(method);

        if method != profile.distribution_method {
            warn!(
                method = %method,
                profile_method = %profile.distribution_method,
                uuid = %profile.uuid,
                "export method differs from what the provisioning profile allows"
            );
        }
        if let Some(cred_team) = credential.and_then(|c| c.team_id.as_deref()) {
            if cred_team != profile.team_id {
                warn!(
                    certificate_team = cred_team,
                    profile_team = %profile.team_id,
                    "certificate and provisioning profile belong to different teams"
                );
            }
        }

        let certificate_name = credential
            .map(|c| c.common_name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| method.default_certificate().to_string());

        let mut profile_mapping = BTreeMap::new();
        profile_mapping.insert(bundle_id.to_string(), profile.uuid.clone());
        for id in &options.additional_bundle_ids {
            if profile.covers(id) {
                profile_mapping.insert(id.clone(), profile.uuid.clone());
            } else {
                debug!(bundle_id = %id, pattern = %profile.entitled_pattern, "profile does not cover bundle id, not mapped");
            }
        }
        for (id, extra) in &options.extra_profiles {
            profile_mapping.insert(id.clone(), extra.clone());
        }

        let manifest = manifest_block(method, options);

        ExportManifest {
            method,
            team_id: profile.team_id.clone(),
            signing_style: SIGNING_STYLE_MANUAL.to_string(),
            certificate_name,
            profile_mapping,
            upload_symbols: options.upload_symbols.unwrap_or(method.uploads_symbols()),
            upload_bitcode: false,
            compile_bitcode: false,
            thinning: THINNING_NONE.to_string(),
            strip_swift_symbols: true,
            destination: DESTINATION_EXPORT.to_string(),
            manifest,
        }
    }
}

fn manifest_block(method: DistributionMethod, options: &ExportOptions) -> Option<ManifestBlock> {
    let wants_ota = options.install_url.is_some()
        || options.display_image_url.is_some()
        || options.full_size_image_url.is_some();
    if !wants_ota {
        return None;
    }
    if method != DistributionMethod::AdHoc {
        warn!(method = %method, "OTA install URLs only apply to ad-hoc exports, ignoring them");
        return None;
    }
    match &options.install_url {
        Some(app_url) => Some(ManifestBlock {
            app_url: app_url.clone(),
            display_image_url: options.display_image_url.clone(),
            full_size_image_url: options.full_size_image_url.clone(),
        }),
        None => {
            warn!("OTA install requested without an install URL, omitting manifest block");
            None
        }
    }
}
