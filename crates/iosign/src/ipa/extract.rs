//! IPA extraction.
//!
//! Unpacks an IPA into a working directory and locates the `.app` bundle
//! under `Payload/`. Entries are written in archive order; symlinks and Unix
//! permissions are restored so that a later repack sees the same tree.

use crate::error::RepairIoError;
use crate::{Error, Result};
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

pub(crate) fn zip_corrupt(path: &Path, reason: impl std::fmt::Display) -> Error {
    RepairIoError::ZipCorrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
    .into()
}

/// Extract an IPA file to a destination directory.
///
/// Returns the path to the extracted `.app` bundle inside `Payload/`.
///
/// # Errors
///
/// Returns [`RepairIoError::ZipCorrupt`] if the file is not a readable zip
/// or has no `Payload/<Name>.app`, and an I/O error if extraction fails.
pub fn extract_ipa(ipa_path: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let ipa_path = ipa_path.as_ref();
    let dest_dir = dest_dir.as_ref();

    if !ipa_path.exists() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("IPA file not found: {}", ipa_path.display()),
        )));
    }

    let file = File::open(ipa_path)?;
    // SAFETY: the archive is opened read-only and not modified while mapped.
    let mmap = unsafe { Mmap::map(&file)? };
    let mut archive =
        ZipArchive::new(Cursor::new(&mmap[..])).map_err(|e| zip_corrupt(ipa_path, e))?;

    fs::create_dir_all(dest_dir)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| zip_corrupt(ipa_path, e))?;
        let Some(relative) = entry.enclosed_name() else {
            debug!(entry = entry.name(), "skipping entry outside the extraction root");
            continue;
        };
        let outpath = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }

        let unix_mode = entry.unix_mode();
        let is_symlink = unix_mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK);

        #[cfg(unix)]
        if is_symlink {
            let mut target = String::new();
            entry.read_to_string(&mut target)?;
            if outpath.symlink_metadata().is_ok() {
                fs::remove_file(&outpath)?;
            }
            std::os::unix::fs::symlink(&target, &outpath)?;
            continue;
        }
        #[cfg(not(unix))]
        let _ = is_symlink;

        let mut outfile = File::create(&outpath)?;
        io::copy(&mut entry, &mut outfile).map_err(|e| zip_corrupt(ipa_path, format!("{}: {}", entry.name(), e)))?;

        #[cfg(unix)]
        if let Some(mode) = unix_mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }

    debug!(ipa = %ipa_path.display(), entries = archive.len(), "extracted IPA");
    find_app_bundle(ipa_path, dest_dir)
}

/// Find the `.app` bundle inside `<dest_dir>/Payload/`.
fn find_app_bundle(ipa_path: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let payload_dir = dest_dir.join("Payload");
    if !payload_dir.is_dir() {
        return Err(zip_corrupt(ipa_path, "no Payload directory"));
    }

    let mut apps: Vec<PathBuf> = fs::read_dir(&payload_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.extension().is_some_and(|ext| ext == "app"))
        .collect();
    apps.sort();

    apps.into_iter()
        .next()
        .ok_or_else(|| zip_corrupt(ipa_path, "no .app bundle in Payload/"))
}

/// Check that a path exists and starts with a ZIP signature.
pub fn validate_ipa(ipa_path: impl AsRef<Path>) -> Result<()> {
    let ipa_path = ipa_path.as_ref();

    if !ipa_path.exists() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("IPA file not found: {}", ipa_path.display()),
        )));
    }

    let mut file = File::open(ipa_path)?;
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() || &magic[0..2] != b"PK" {
        return Err(zip_corrupt(ipa_path, "not a ZIP/IPA file"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn create_test_ipa(dir: &Path) -> PathBuf {
        let ipa_path = dir.join("test.ipa");
        let file = File::create(&ipa_path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        zip.add_directory("Payload/", options).unwrap();
        zip.add_directory("Payload/Test.app/", options).unwrap();
        zip.start_file("Payload/Test.app/Info.plist", options).unwrap();
        zip.write_all(b"<?xml version=\"1.0\"?><plist><dict></dict></plist>")
            .unwrap();
        zip.start_file("Payload/Test.app/Test", options.unix_permissions(0o755))
            .unwrap();
        zip.write_all(b"MACHO_PLACEHOLDER").unwrap();
        zip.finish().unwrap();

        ipa_path
    }

    #[test]
    fn test_validate_ipa() {
        let temp_dir = TempDir::new().unwrap();
        assert!(validate_ipa(create_test_ipa(temp_dir.path())).is_ok());
        assert!(validate_ipa("/nonexistent/file.ipa").is_err());

        let invalid = temp_dir.path().join("invalid.ipa");
        fs::write(&invalid, b"not a zip file").unwrap();
        assert!(matches!(
            validate_ipa(&invalid),
            Err(Error::RepairIo(RepairIoError::ZipCorrupt { .. }))
        ));
    }

    #[test]
    fn test_extract_ipa() {
        let temp_dir = TempDir::new().unwrap();
        let ipa_path = create_test_ipa(temp_dir.path());

        let app_path = extract_ipa(&ipa_path, temp_dir.path().join("extracted")).unwrap();
        assert!(app_path.ends_with("Test.app"));
        assert!(app_path.join("Info.plist").exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_extract_restores_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let ipa_path = create_test_ipa(temp_dir.path());
        let app_path = extract_ipa(&ipa_path, temp_dir.path().join("extracted")).unwrap();
        let mode = fs::metadata(app_path.join("Test")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_extract_rejects_non_zip() {
        let temp_dir = TempDir::new().unwrap();
        let bogus = temp_dir.path().join("bogus.ipa");
        fs::write(&bogus, b"PK but not really").unwrap();
        let err = extract_ipa(&bogus, temp_dir.path().join("out")).unwrap_err();
        assert!(matches!(err, Error::RepairIo(RepairIoError::ZipCorrupt { .. })));
    }

    #[test]
    fn test_extract_requires_payload() {
        let temp_dir = TempDir::new().unwrap();
        let ipa_path = temp_dir.path().join("nopayload.ipa");
        let mut zip = ZipWriter::new(File::create(&ipa_path).unwrap());
        zip.start_file("README", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"hello").unwrap();
        zip.finish().unwrap();

        let err = extract_ipa(&ipa_path, temp_dir.path().join("out")).unwrap_err();
        assert!(matches!(err, Error::RepairIo(RepairIoError::ZipCorrupt { ref reason, .. }) if reason.contains("Payload")));
    }

    #[test]
    #[cfg(unix)]
    fn test_extract_ipa_with_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        let ipa_path = temp_dir.path().join("symlink_test.ipa");

        let mut zip = ZipWriter::new(File::create(&ipa_path).unwrap());
        let options = SimpleFileOptions::default();
        zip.add_directory("Payload/Test.app/Frameworks/Test.framework/Versions/A/", options)
            .unwrap();
        zip.start_file("Payload/Test.app/Frameworks/Test.framework/Versions/A/Test", options)
            .unwrap();
        zip.write_all(b"binary content").unwrap();
        zip.add_symlink(
            "Payload/Test.app/Frameworks/Test.framework/Versions/Current",
            "A",
            options,
        )
        .unwrap();
        zip.start_file("Payload/Test.app/Info.plist", options).unwrap();
        zip.write_all(b"<?xml version=\"1.0\"?><plist><dict></dict></plist>")
            .unwrap();
        zip.finish().unwrap();

        let extract_dir = temp_dir.path().join("extracted");
        extract_ipa(&ipa_path, &extract_dir).unwrap();

        let link = extract_dir.join("Payload/Test.app/Frameworks/Test.framework/Versions/Current");
        let meta = fs::symlink_metadata(&link).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("A"));
    }
}
