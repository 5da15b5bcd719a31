use assert_cmd::Command;
use chrono::{Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::cms::{CMSOptions, CmsContentInfo};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use plist::{Dictionary, Value};
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;

const MAIN: &str = "com.acme.app";

fn iosign() -> Command {
    let mut cmd = Command::cargo_bin("iosign").unwrap();
    for var in [
        "IOSIGN_CONFIG",
        "IOSIGN_BUNDLE_ID",
        "IOSIGN_PROFILE",
        "IOSIGN_P12",
        "IOSIGN_P12_PASSWORD",
        "IOSIGN_CERTIFICATE",
        "IOSIGN_PRIVATE_KEY",
        "IOSIGN_KEYCHAIN",
        "IOSIGN_KEYCHAIN_PASSWORD",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn make_bundle(path: &Path, id: &str) -> PathBuf {
    fs::create_dir_all(path).unwrap();
    let mut dict = Dictionary::new();
    dict.insert("CFBundleIdentifier".into(), id.into());
    plist::to_file_xml(path.join("Info.plist"), &Value::Dictionary(dict)).unwrap();
    path.to_path_buf()
}

fn bundle_id(bundle: &Path) -> String {
    Value::from_file(bundle.join("Info.plist"))
        .unwrap()
        .as_dictionary()
        .and_then(|d| d.get("CFBundleIdentifier"))
        .and_then(Value::as_string)
        .unwrap()
        .to_string()
}

fn key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

fn cert(key: &PKey<Private>, cn: &str, ou: &str) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    name.append_entry_by_text("OU", ou).unwrap();
    let name = name.build();
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&BigNum::from_u32(3).unwrap().to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

fn write_p12(dir: &Path, password: &str) -> PathBuf {
    let key = key();
    let cert = cert(&key, "Apple Distribution: Acme Inc (ABCDE12345)", "ABCDE12345");
    let mut builder = Pkcs12::builder();
    builder.name("dist").pkey(&key).cert(&cert);
    let path = dir.join("dist.p12");
    fs::write(&path, builder.build2(password).unwrap().to_der().unwrap()).unwrap();
    path
}

fn write_profile(dir: &Path) -> PathBuf {
    write_profile_for(dir, "ABCDE12345.com.acme.*")
}

fn write_profile_for(dir: &Path, app_identifier: &str) -> PathBuf {
    let mut entitlements = Dictionary::new();
    entitlements.insert("application-identifier".into(), app_identifier.into());
    let mut root = Dictionary::new();
    root.insert("UUID".into(), "0F0E0D0C-1111-4222-8333-444455556666".into());
    root.insert("Name".into(), "Acme Ad Hoc".into());
    root.insert("TeamIdentifier".into(), Value::Array(vec!["ABCDE12345".into()]));
    root.insert(
        "ExpirationDate".into(),
        Value::Date(SystemTime::from(Utc::now() + Duration::days(30)).into()),
    );
    root.insert("ProvisionedDevices".into(), Value::Array(vec!["00008030-001".into()]));
    root.insert("Entitlements".into(), Value::Dictionary(entitlements));
    let mut content = Vec::new();
    plist::to_writer_xml(&mut content, &Value::Dictionary(root)).unwrap();

    let signer_key = key();
    let signer = cert(&signer_key, "Apple iPhone OS Provisioning Profile Signing", "Apple");
    let der = CmsContentInfo::sign(Some(&signer), Some(&signer_key), None, Some(&content), CMSOptions::BINARY)
        .unwrap()
        .to_der()
        .unwrap();
    let path = dir.join("adhoc.mobileprovision");
    fs::write(&path, der).unwrap();
    path
}

#[test]
fn test_repair_namespace_app_bundle() {
    let dir = TempDir::new().unwrap();
    let app = make_bundle(&dir.path().join("Acme.app"), MAIN);
    let framework = make_bundle(&app.join("Frameworks/Core.framework"), MAIN);
    let report = dir.path().join("report.json");

    iosign()
        .arg("repair-namespace")
        .arg(&app)
        .arg("--report")
        .arg(&report)
        .assert()
        .success()
        .stdout(predicate::str::contains("com.acme.app.framework.core"))
        .stdout(predicate::str::contains("DONE"));

    assert_eq!(bundle_id(&framework), "com.acme.app.framework.core");
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(json["outcome"]["status"], "done");
    assert_eq!(json["collisions_fixed"], 1);
}

#[test]
fn test_repair_namespace_rejects_unknown_target() {
    let dir = TempDir::new().unwrap();
    let notes = dir.path().join("notes.txt");
    fs::write(&notes, "hello").unwrap();

    iosign()
        .arg("repair-namespace")
        .arg(&notes)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unsupported repair target"));
}

#[test]
fn test_repair_pods_needs_bundle_id() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("Pods/Target Support Files/GoogleMaps");
    fs::create_dir_all(&target).unwrap();
    let xcconfig = target.join("GoogleMaps.release.xcconfig");
    fs::write(&xcconfig, "PRODUCT_BUNDLE_IDENTIFIER = com.acme.app\n").unwrap();

    iosign()
        .arg("repair-namespace")
        .arg(dir.path())
        .assert()
        .code(1);

    iosign()
        .args(["repair-namespace", "--bundle-id", MAIN])
        .arg(dir.path())
        .assert()
        .success();
    assert!(fs::read_to_string(&xcconfig)
        .unwrap()
        .contains("com.acme.app.pod.googlemaps"));
}

#[test]
fn test_build_export_options_ad_hoc() {
    let dir = TempDir::new().unwrap();
    let profile = write_profile(dir.path());
    let out = dir.path().join("ExportOptions.plist");

    iosign()
        .args(["build-export-options", "--method", "ad-hoc", "--bundle-id", MAIN])
        .arg("--profile")
        .arg(&profile)
        .args(["--install-url", "https://x/y"])
        .arg("--out")
        .arg(&out)
        .assert()
        .success();

    let written = Value::from_file(&out).unwrap();
    let dict = written.as_dictionary().unwrap();
    assert_eq!(dict.get("method").and_then(Value::as_string), Some("ad-hoc"));
    let manifest = dict.get("manifest").and_then(Value::as_dictionary).unwrap();
    assert_eq!(manifest.get("appURL").and_then(Value::as_string), Some("https://x/y"));
}

#[test]
fn test_build_export_options_unknown_method_falls_back() {
    let dir = TempDir::new().unwrap();
    let profile = write_profile(dir.path());
    let out = dir.path().join("ExportOptions.plist");

    iosign()
        .args(["build-export-options", "--method", "sideload", "--bundle-id", MAIN])
        .arg("--profile")
        .arg(&profile)
        .arg("--out")
        .arg(&out)
        .assert()
        .success();

    let written = Value::from_file(&out).unwrap();
    assert_eq!(
        written.as_dictionary().and_then(|d| d.get("method")).and_then(Value::as_string),
        Some("app-store")
    );
}

#[test]
fn test_resolve_credentials_without_install() {
    let dir = TempDir::new().unwrap();
    let p12 = write_p12(dir.path(), "secret");
    let profile = write_profile(dir.path());

    let output = iosign()
        .args(["resolve-credentials", "--no-install", "--password", "secret", "--bundle-id", MAIN])
        .arg("--p12")
        .arg(&p12)
        .arg("--profile")
        .arg(&profile)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["bundle_id"], MAIN);
    assert_eq!(json["reconciliation"], "NoCorrection");
    assert_eq!(json["credential"]["team_id"], "ABCDE12345");
    assert_eq!(json["profile"]["method"], "ad-hoc");
    assert!(json["install"].is_null());
}

#[test]
fn test_resolve_credentials_wrong_password() {
    let dir = TempDir::new().unwrap();
    let p12 = write_p12(dir.path(), "secret");
    let profile = write_profile(dir.path());

    iosign()
        .args(["resolve-credentials", "--no-install", "--password", "nope", "--bundle-id", MAIN])
        .arg("--p12")
        .arg(&p12)
        .arg("--profile")
        .arg(&profile)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Password does not match"));
}

#[test]
fn test_resolve_credentials_requires_a_credential() {
    iosign()
        .args(["resolve-credentials", "--no-install", "--bundle-id", MAIN])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no signing credential"));
}

#[test]
fn test_build_export_options_maps_the_profile_bundle_id() {
    let dir = TempDir::new().unwrap();
    let profile = write_profile_for(dir.path(), "ABCDE12345.com.acme.app");
    let out = dir.path().join("ExportOptions.plist");

    iosign()
        .args(["build-export-options", "--bundle-id", "com.acme.other"])
        .arg("--profile")
        .arg(&profile)
        .arg("--out")
        .arg(&out)
        .assert()
        .success();

    let written = Value::from_file(&out).unwrap();
    let profiles = written
        .as_dictionary()
        .and_then(|d| d.get("provisioningProfiles"))
        .and_then(Value::as_dictionary)
        .unwrap();
    assert!(profiles.contains_key(MAIN));
    assert!(!profiles.contains_key("com.acme.other"));
}

#[test]
fn test_build_export_options_strict_policy_rejects_mismatch() {
    let dir = TempDir::new().unwrap();
    let profile = write_profile_for(dir.path(), "ABCDE12345.com.acme.app");
    let config = dir.path().join("iosign.toml");
    fs::write(&config, "[profile]\nreconcile_policy = \"strict\"\n").unwrap();
    let out = dir.path().join("ExportOptions.plist");

    iosign()
        .arg("--config")
        .arg(&config)
        .args(["build-export-options", "--bundle-id", "com.acme.other"])
        .arg("--profile")
        .arg(&profile)
        .arg("--out")
        .arg(&out)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not cover"));
    assert!(!out.exists());
}
