//! `PRODUCT_BUNDLE_IDENTIFIER` in CocoaPods `.xcconfig` files.
//!
//! Each pod target gets one xcconfig per build configuration under
//! `Pods/Target Support Files/<Target>/`. The identity of the target is the
//! first `PRODUCT_BUNDLE_IDENTIFIER` assignment; rewriting replaces the value
//! on every such line and leaves the rest of the file byte for byte.

use crate::bundle::info_plist::write_atomic;
use crate::error::RepairIoError;
use crate::Result;
use std::fs;
use std::path::Path;

pub const BUNDLE_ID_SETTING: &str = "PRODUCT_BUNDLE_IDENTIFIER";

/// Byte range of the value in a `PRODUCT_BUNDLE_IDENTIFIER = value` line.
fn value_span(line: &str) -> Option<(usize, usize)> {
    let trimmed = line.trim_start();
    let indent = line.len() - trimmed.len();
    let rest = trimmed.strip_prefix(BUNDLE_ID_SETTING)?;

    // allow conditional settings such as `PRODUCT_BUNDLE_IDENTIFIER[sdk=iphoneos*]`
    let rest_offset = if rest.starts_with('[') {
        rest.find(']')? + 1
    } else {
        0
    };
    let after_key = &rest[rest_offset..];
    let eq = after_key.find('=')?;
    if !after_key[..eq].trim().is_empty() {
        return None;
    }

    let value_region_start = indent + BUNDLE_ID_SETTING.len() + rest_offset + eq + 1;
    let value_region = &line[value_region_start..];
    let value_region = match value_region.find("//") {
        Some(comment) => &value_region[..comment],
        None => value_region,
    };
    let leading = value_region.len() - value_region.trim_start().len();
    let value = value_region.trim();
    if value.is_empty() {
        return None;
    }
    let start = value_region_start + leading;
    Some((start, start + value.len()))
}

/// First bundle id assigned in `text`.
pub fn parse_bundle_id(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| value_span(line).map(|(s, e)| line[s..e].to_string()))
}

/// Read the bundle id setting of one xcconfig file.
pub fn read_bundle_id(path: &Path) -> Result<Option<String>> {
    let text = fs::read_to_string(path).map_err(|e| RepairIoError::from_io(path, e))?;
    Ok(parse_bundle_id(&text))
}

/// Replace every bundle id value in `text`. Returns `None` if nothing changed.
pub fn replace_bundle_id(text: &str, bundle_id: &str) -> Option<String> {
    let mut changed = false;
    let mut out = String::with_capacity(text.len() + bundle_id.len());
    for line in text.split_inclusive('\n') {
        match value_span(line) {
            Some((start, end)) if &line[start..end] != bundle_id => {
                out.push_str(&line[..start]);
                out.push_str(bundle_id);
                out.push_str(&line[end..]);
                changed = true;
            }
            _ => out.push_str(line),
        }
    }
    changed.then_some(out)
}

/// Rewrite the bundle id setting of one xcconfig file. Returns whether the
/// file was written.
pub fn write_bundle_id(path: &Path, bundle_id: &str) -> Result<bool> {
    let text = fs::read_to_string(path).map_err(|e| RepairIoError::from_io(path, e))?;
    match replace_bundle_id(&text, bundle_id) {
        Some(updated) => {
            write_atomic(path, updated.as_bytes())?;
            Ok(true)
        }
        None => Ok(false),
    }
}
