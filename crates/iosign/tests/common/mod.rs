//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use plist::{Dictionary, Value};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MAIN: &str = "com.acme.app";

/// Create `<path>/Info.plist` with the given identifier.
pub fn make_bundle(path: &Path, id: Option<&str>) -> PathBuf {
    fs::create_dir_all(path).unwrap();
    plist::to_file_xml(path.join("Info.plist"), &Value::Dictionary(info_dict(path, id))).unwrap();
    path.to_path_buf()
}

pub fn info_dict(path: &Path, id: Option<&str>) -> Dictionary {
    let name = path.file_stem().unwrap().to_string_lossy().into_owned();
    let mut dict = Dictionary::new();
    dict.insert("CFBundleName".into(), name.clone().into());
    dict.insert("CFBundleExecutable".into(), name.into());
    if let Some(id) = id {
        dict.insert("CFBundleIdentifier".into(), id.into());
    }
    dict
}

pub fn info_plist_xml(name: &str, id: &str) -> Vec<u8> {
    let mut dict = Dictionary::new();
    dict.insert("CFBundleName".into(), name.into());
    dict.insert("CFBundleExecutable".into(), name.into());
    dict.insert("CFBundleIdentifier".into(), id.into());
    let mut out = Vec::new();
    plist::to_writer_xml(&mut out, &Value::Dictionary(dict)).unwrap();
    out
}

pub fn bundle_id(bundle: &Path) -> Option<String> {
    let value = Value::from_file(bundle.join("Info.plist")).unwrap();
    value
        .as_dictionary()
        .and_then(|d| d.get("CFBundleIdentifier"))
        .and_then(Value::as_string)
        .map(str::to_string)
}

/// Fake Mach-O bytes for the main executable.
pub fn executable_bytes() -> Vec<u8> {
    let mut bytes = vec![0xcf, 0xfa, 0xed, 0xfe, 0x0c, 0x00, 0x00, 0x01];
    bytes.extend((0..4096u32).map(|i| (i * 31 % 251) as u8));
    bytes
}

/// An IPA whose framework, extension and test bundle all reuse the main id.
///
/// Entries are written in a deliberately non-alphabetical order, with a
/// stored (uncompressed) executable and a framework version symlink.
pub fn colliding_ipa(path: &Path) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let stored = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(0o755);

    zip.add_directory("Payload/", deflated).unwrap();
    zip.add_directory("Payload/Acme.app/", deflated).unwrap();
    zip.start_file("Payload/Acme.app/Acme", stored).unwrap();
    zip.write_all(&executable_bytes()).unwrap();
    zip.start_file("Payload/Acme.app/Info.plist", deflated).unwrap();
    zip.write_all(&info_plist_xml("Acme", MAIN)).unwrap();

    zip.add_directory("Payload/Acme.app/PlugIns/Share.appex/", deflated)
        .unwrap();
    zip.start_file("Payload/Acme.app/PlugIns/Share.appex/Info.plist", deflated)
        .unwrap();
    zip.write_all(&info_plist_xml("Share", MAIN)).unwrap();

    zip.add_directory("Payload/Acme.app/Frameworks/Core.framework/Versions/A/", deflated)
        .unwrap();
    zip.start_file("Payload/Acme.app/Frameworks/Core.framework/Versions/A/Core", deflated)
        .unwrap();
    zip.write_all(b"framework binary").unwrap();
    zip.add_symlink(
        "Payload/Acme.app/Frameworks/Core.framework/Versions/Current",
        "A",
        deflated,
    )
    .unwrap();
    zip.start_file("Payload/Acme.app/Frameworks/Core.framework/Info.plist", deflated)
        .unwrap();
    zip.write_all(&info_plist_xml("Core", MAIN)).unwrap();

    zip.add_directory("Payload/Acme.app/PlugIns/AcmeTests.xctest/", deflated)
        .unwrap();
    zip.start_file("Payload/Acme.app/PlugIns/AcmeTests.xctest/Info.plist", deflated)
        .unwrap();
    zip.write_all(&info_plist_xml("AcmeTests", MAIN)).unwrap();

    zip.start_file("Payload/Acme.app/Assets.car", deflated).unwrap();
    zip.write_all(&[7u8; 2048]).unwrap();
    zip.finish().unwrap();
}

/// Entry names in central directory order.
pub fn entry_names(path: &Path) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index_raw(i).unwrap().name().to_string())
        .collect()
}

/// Raw bytes of one entry, decompressed.
pub fn entry_bytes(path: &Path, name: &str) -> Vec<u8> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut out = Vec::new();
    std::io::copy(&mut entry, &mut out).unwrap();
    out
}
