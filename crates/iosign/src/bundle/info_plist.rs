//! Info.plist access.
//!
//! Reads are lenient about layout (`Info.plist` at the bundle root or under
//! `Resources/`). Writes replace the file atomically and keep its original
//! serialization format and permissions, so an untouched binary plist stays
//! binary.

use crate::error::RepairIoError;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const BUNDLE_IDENTIFIER_KEY: &str = "CFBundleIdentifier";
pub const BUNDLE_EXECUTABLE_KEY: &str = "CFBundleExecutable";

const BINARY_MAGIC: &[u8] = b"bplist00";

/// On-disk encoding of a property list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlistFormat {
    Xml,
    Binary,
}

impl PlistFormat {
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(BINARY_MAGIC) {
            PlistFormat::Binary
        } else {
            PlistFormat::Xml
        }
    }
}

/// Locate the Info.plist of a bundle directory.
pub fn locate(bundle: &Path) -> Option<PathBuf> {
    [bundle.join("Info.plist"), bundle.join("Resources").join("Info.plist")]
        .into_iter()
        .find(|p| p.is_file())
}

/// Read the top-level dictionary of an Info.plist.
pub fn read_dictionary(path: &Path) -> Result<Dictionary> {
    let data = fs::read(path).map_err(|e| RepairIoError::from_io(path, e))?;
    let value: Value = plist::from_bytes(&data)?;
    value.into_dictionary().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} is not a dictionary plist", path.display()),
        ))
    })
}

/// Read `CFBundleIdentifier`, if present.
pub fn read_bundle_id(path: &Path) -> Result<Option<String>> {
    Ok(read_dictionary(path)?
        .get(BUNDLE_IDENTIFIER_KEY)
        .and_then(Value::as_string)
        .map(str::to_string))
}

/// Read `CFBundleExecutable`, if present.
pub fn read_executable(path: &Path) -> Result<Option<String>> {
    Ok(read_dictionary(path)?
        .get(BUNDLE_EXECUTABLE_KEY)
        .and_then(Value::as_string)
        .map(str::to_string))
}

/// Set `CFBundleIdentifier` to `bundle_id`, preserving format and mode.
pub fn write_bundle_id(path: &Path, bundle_id: &str) -> Result<()> {
    let data = fs::read(path).map_err(|e| RepairIoError::from_io(path, e))?;
    let format = PlistFormat::detect(&data);
    let mut dict = plist::from_bytes::<Value>(&data)?
        .into_dictionary()
        .unwrap_or_default();
    dict.insert(BUNDLE_IDENTIFIER_KEY.to_string(), Value::String(bundle_id.to_string()));

    let mut out = Vec::with_capacity(data.len() + 64);
    match format {
        PlistFormat::Xml => plist::to_writer_xml(&mut out, &Value::Dictionary(dict))?,
        PlistFormat::Binary => plist::to_writer_binary(&mut out, &Value::Dictionary(dict))?,
    }
    write_atomic(path, &out)
}

/// Replace `path` with `data` via a temp file in the same directory.
///
/// Permissions of an existing file are carried over to the replacement.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let permissions = fs::metadata(path).ok().map(|m| m.permissions());

    let mut tmp = tempfile::Builder::new()
        .prefix(".iosign-")
        .tempfile_in(dir)
        .map_err(|e| RepairIoError::from_io(dir, e))?;
    tmp.write_all(data).map_err(|e| RepairIoError::from_io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| RepairIoError::from_io(tmp.path(), e))?;
    if let Some(permissions) = permissions {
        fs::set_permissions(tmp.path(), permissions).map_err(|e| RepairIoError::from_io(path, e))?;
    }
    tmp.persist(path)
        .map_err(|e| RepairIoError::from_io(path, e.error))?;
    Ok(())
}
