//! IPA handling module.
//!
//! Provides extraction of an IPA into a scratch directory, order-preserving
//! repacking after patches and archive integrity checks.

pub mod archive;
pub mod extract;

pub use archive::{entry_sha256, repack_ipa, verify_archive, CompressionLevel, RepackSummary};
pub use extract::{extract_ipa, validate_ipa};

use crate::bundle::info_plist;
use crate::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// An IPA unpacked into a temporary directory for repair.
///
/// The directory is removed when the workspace is dropped.
pub struct IpaWorkspace {
    ipa: PathBuf,
    dir: TempDir,
    app: PathBuf,
    compression_level: CompressionLevel,
}

impl IpaWorkspace {
    /// Validate and extract `ipa`.
    pub fn open(ipa: impl AsRef<Path>) -> Result<Self> {
        let ipa = ipa.as_ref();
        validate_ipa(ipa)?;
        let dir = tempfile::Builder::new().prefix("iosign-ipa-").tempdir()?;
        let app = extract_ipa(ipa, dir.path())?;
        Ok(Self {
            ipa: ipa.to_path_buf(),
            dir,
            app,
            compression_level: CompressionLevel::DEFAULT,
        })
    }

    /// Set the compression level for rewritten entries.
    pub fn compression_level(mut self, level: CompressionLevel) -> Self {
        self.compression_level = level;
        self
    }

    /// The original IPA.
    pub fn ipa(&self) -> &Path {
        &self.ipa
    }

    /// Extraction root (the directory holding `Payload/`).
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// The extracted main `.app` bundle.
    pub fn app(&self) -> &Path {
        &self.app
    }

    /// Archive entry name of the main executable, from `CFBundleExecutable`.
    pub fn executable_entry(&self) -> Result<Option<String>> {
        let Some(plist) = info_plist::locate(&self.app) else {
            return Ok(None);
        };
        let Some(executable) = info_plist::read_executable(&plist)? else {
            return Ok(None);
        };
        Ok(archive::entry_name(self.root(), &self.app.join(executable)))
    }

    /// Write a new IPA at `output` with the `changed` files replaced.
    pub fn repack(&self, changed: &[PathBuf], output: &Path) -> Result<RepackSummary> {
        repack_ipa(&self.ipa, self.root(), changed, output, self.compression_level)
    }
}
