//! IPA repacking and integrity checks.
//!
//! [`repack_ipa`] rebuilds an IPA after some extracted files were patched.
//! The output keeps the original central-directory order. Untouched entries
//! are raw-copied, so their compressed bytes, CRCs, permissions and
//! timestamps are identical; patched entries are recompressed with their
//! original method, mode and timestamp.
//!
//! For the reverse operation, see the [`extract`](super::extract) module.

use crate::ipa::extract::zip_corrupt;
use crate::error::RepairIoError;
use crate::Result;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// ZIP compression level for entries rewritten during repack.
///
/// # Examples
///
/// ```
/// use iosign::ipa::CompressionLevel;
///
/// let fast = CompressionLevel::NONE;
/// let balanced = CompressionLevel::DEFAULT;
/// let custom = CompressionLevel::new(15);
/// assert_eq!(custom.level(), 9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "u32")]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    /// No compression (level 0).
    pub const NONE: CompressionLevel = CompressionLevel(0);

    /// Default compression (level 6).
    pub const DEFAULT: CompressionLevel = CompressionLevel(6);

    /// Maximum compression (level 9).
    pub const MAX: CompressionLevel = CompressionLevel(9);

    /// Creates a compression level from 0-9. Values greater than 9 are
    /// clamped to 9.
    #[must_use]
    pub fn new(level: u32) -> Self {
        CompressionLevel(level.min(9))
    }

    /// Returns the compression level value (0-9).
    #[must_use]
    pub fn level(&self) -> u32 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for CompressionLevel {
    fn from(level: u32) -> Self {
        CompressionLevel::new(level)
    }
}

/// Counts from a [`repack_ipa`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RepackSummary {
    pub entries: usize,
    pub raw_copied: usize,
    pub rewritten: usize,
}

/// Archive entry name (`/`-separated) of `path` relative to `root`.
pub fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Rebuild `original` into `output`, taking the contents of `changed` files
/// from `extracted_root`.
///
/// The new archive is written next to `output`, passes [`verify_archive`]
/// and is then renamed into place; `output` may be the same path as
/// `original`.
pub fn repack_ipa(
    original: &Path,
    extracted_root: &Path,
    changed: &[PathBuf],
    output: &Path,
    level: CompressionLevel,
) -> Result<RepackSummary> {
    let mut pending: BTreeSet<String> = changed
        .iter()
        .filter_map(|p| entry_name(extracted_root, p))
        .collect();

    let source = File::open(original).map_err(|e| RepairIoError::from_io(original, e))?;
    let mut archive =
        ZipArchive::new(BufReader::new(source)).map_err(|e| zip_corrupt(original, e))?;

    let out_dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".iosign-")
        .suffix(".ipa")
        .tempfile_in(out_dir)
        .map_err(|e| RepairIoError::from_io(out_dir, e))?;

    let mut summary = RepackSummary::default();
    {
        let mut writer = ZipWriter::new(tmp.as_file_mut());
        for i in 0..archive.len() {
            let name = archive
                .by_index_raw(i)
                .map_err(|e| zip_corrupt(original, e))?
                .name()
                .to_string();

            if pending.remove(&name) {
                let options = {
                    let entry = archive.by_index_raw(i).map_err(|e| zip_corrupt(original, e))?;
                    rewrite_options(entry.compression(), entry.unix_mode(), entry.last_modified(), level)
                };
                let data = fs::read(extracted_root.join(&name))
                    .map_err(|e| RepairIoError::from_io(extracted_root.join(&name), e))?;
                writer.start_file(name.as_str(), options)?;
                writer.write_all(&data)?;
                summary.rewritten += 1;
                debug!(entry = %name, "rewrote archive entry");
            } else {
                let entry = archive.by_index_raw(i).map_err(|e| zip_corrupt(original, e))?;
                writer.raw_copy_file(entry)?;
                summary.raw_copied += 1;
            }
            summary.entries += 1;
        }
        writer.finish()?;
    }

    if let Some(name) = pending.iter().next() {
        for entry in &pending {
            warn!(entry = %entry, "patched file has no entry in the original archive");
        }
        return Err(RepairIoError::ZipCorrupt {
            path: original.to_path_buf(),
            reason: format!("patched file {name} has no entry in the archive"),
        }
        .into());
    }

    tmp.as_file()
        .sync_all()
        .map_err(|e| RepairIoError::from_io(tmp.path(), e))?;
    verify_archive(tmp.path())?;
    tmp.persist(output)
        .map_err(|e| RepairIoError::from_io(output, e.error))?;

    debug!(
        output = %output.display(),
        entries = summary.entries,
        rewritten = summary.rewritten,
        "repacked IPA"
    );
    Ok(summary)
}

fn rewrite_options(
    method: CompressionMethod,
    unix_mode: Option<u32>,
    modified: Option<zip::DateTime>,
    level: CompressionLevel,
) -> SimpleFileOptions {
    let mut options = SimpleFileOptions::default().compression_method(method);
    if method == CompressionMethod::Deflated {
        options = options.compression_level(Some(level.level() as i64));
    }
    if let Some(mode) = unix_mode {
        options = options.unix_permissions(mode);
    }
    if let Some(modified) = modified {
        options = options.last_modified_time(modified);
    }
    options
}

/// Read every entry through CRC validation.
///
/// Returns the number of entries. Fails with [`RepairIoError::ZipCorrupt`]
/// if the archive cannot be opened, an entry does not decompress to its
/// recorded CRC, or there is no `Payload/` entry.
pub fn verify_archive(path: &Path) -> Result<usize> {
    let file = File::open(path).map_err(|e| RepairIoError::from_io(path, e))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| zip_corrupt(path, e))?;

    let mut has_payload = false;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| zip_corrupt(path, e))?;
        has_payload |= entry.name().starts_with("Payload/");
        io::copy(&mut entry, &mut io::sink())
            .map_err(|e| zip_corrupt(path, format!("{}: {}", entry.name(), e)))?;
    }
    if !has_payload {
        return Err(zip_corrupt(path, "no Payload/ entries"));
    }
    Ok(archive.len())
}

/// SHA-256 (hex) of the decompressed entry `name`, if present.
pub fn entry_sha256(path: &Path, name: &str) -> Result<Option<String>> {
    let file = File::open(path).map_err(|e| RepairIoError::from_io(path, e))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| zip_corrupt(path, e))?;
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(zip_corrupt(path, e)),
    };

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = entry
            .read(&mut buf)
            .map_err(|e| zip_corrupt(path, format!("{}: {}", name, e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(hex::encode(hasher.finalize())))
}
