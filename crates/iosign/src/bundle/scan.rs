//! Building [`PackageNode`] trees from disk.

use crate::bundle::{info_plist, xcconfig, IdentityLocation, NodeKind, PackageNode};
use crate::error::RepairIoError;
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Directory name CocoaPods uses for per-target build settings.
pub const TARGET_SUPPORT_FILES: &str = "Target Support Files";

/// Scan an `.app` bundle and every bundle nested inside it.
///
/// Only directories with a bundle extension and an Info.plist become nodes.
/// Symlinks are not followed, so versioned framework layouts are seen once.
pub fn scan_bundle(root: &Path) -> Result<PackageNode> {
    if !root.is_dir() {
        return Err(RepairIoError::UnsupportedTarget {
            path: root.to_path_buf(),
            reason: "bundle is not a directory".into(),
        }
        .into());
    }
    let plist = info_plist::locate(root).ok_or_else(|| RepairIoError::UnsupportedTarget {
        path: root.to_path_buf(),
        reason: "bundle has no Info.plist".into(),
    })?;

    let mut node = bundle_node(root, NodeKind::App, plist)?;
    node.children = scan_children(root)?;
    debug!(root = %root.display(), nodes = node.node_count(), "scanned bundle tree");
    Ok(node)
}

fn scan_children(dir: &Path) -> Result<Vec<PackageNode>> {
    let mut children = Vec::new();
    let mut entries = WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = entries.next() {
        let entry = entry.map_err(|e| walk_error(dir, e))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(kind) = NodeKind::from_bundle_path(entry.path()) else {
            continue;
        };
        let Some(plist) = info_plist::locate(entry.path()) else {
            // no identity of its own; nested bundles still belong to the parent
            continue;
        };

        let mut node = bundle_node(entry.path(), kind, plist)?;
        node.children = scan_children(entry.path())?;
        children.push(node);
        entries.skip_current_dir();
    }
    Ok(children)
}

fn bundle_node(path: &Path, kind: NodeKind, plist: PathBuf) -> Result<PackageNode> {
    let current_bundle_id = info_plist::read_bundle_id(&plist)?;
    Ok(PackageNode {
        path: path.to_path_buf(),
        name: bundle_name(path),
        kind,
        current_bundle_id,
        location: IdentityLocation::InfoPlist(plist),
        children: Vec::new(),
    })
}

fn bundle_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Locate the `Target Support Files` directory for a Pods input.
///
/// Accepts the `Target Support Files` directory itself, a `Pods` directory,
/// or a project directory containing `Pods/`.
pub fn find_target_support(dir: &Path) -> Option<PathBuf> {
    if dir.file_name().is_some_and(|n| n == TARGET_SUPPORT_FILES) && dir.is_dir() {
        return Some(dir.to_path_buf());
    }
    [dir.join(TARGET_SUPPORT_FILES), dir.join("Pods").join(TARGET_SUPPORT_FILES)]
        .into_iter()
        .find(|p| p.is_dir())
}

/// Build a tree of pod targets under a synthetic root carrying `main_id`.
///
/// Each `Target Support Files/<Target>/` directory whose xcconfig files set
/// `PRODUCT_BUNDLE_IDENTIFIER` becomes one [`NodeKind::Pod`] node; all of
/// its xcconfig files form the node's identity location.
pub fn scan_pods(dir: &Path, main_id: &str) -> Result<PackageNode> {
    let support = find_target_support(dir).ok_or_else(|| RepairIoError::UnsupportedTarget {
        path: dir.to_path_buf(),
        reason: format!("no `{}` directory found", TARGET_SUPPORT_FILES),
    })?;

    let mut targets: Vec<PathBuf> = fs::read_dir(&support)
        .map_err(|e| RepairIoError::from_io(&support, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    targets.sort();

    let mut children = Vec::new();
    for target in targets {
        let mut configs: Vec<PathBuf> = fs::read_dir(&target)
            .map_err(|e| RepairIoError::from_io(&target, e))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "xcconfig"))
            .collect();
        configs.sort();

        let mut current = None;
        let mut carrying = Vec::new();
        for config in configs {
            if let Some(id) = xcconfig::read_bundle_id(&config)? {
                current.get_or_insert(id);
                carrying.push(config);
            }
        }
        if carrying.is_empty() {
            continue;
        }

        children.push(PackageNode {
            name: bundle_name(&target),
            path: target,
            kind: NodeKind::Pod,
            current_bundle_id: current,
            location: IdentityLocation::BuildSettings(carrying),
            children: Vec::new(),
        });
    }

    debug!(pods = %support.display(), targets = children.len(), "scanned pod build settings");
    Ok(PackageNode {
        path: support,
        name: "Pods".to_string(),
        kind: NodeKind::App,
        current_bundle_id: Some(main_id.to_string()),
        location: IdentityLocation::BuildSettings(Vec::new()),
        children,
    })
}

fn walk_error(dir: &Path, err: walkdir::Error) -> Error {
    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
    match err.into_io_error() {
        Some(io) => RepairIoError::from_io(path, io),
        None => Error::Io(std::io::Error::other(format!(
            "failed to walk {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use plist::{Dictionary, Value};
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Create a bundle directory with an Info.plist carrying `id`.
    pub fn make_bundle(path: &Path, id: Option<&str>) -> PathBuf {
        fs::create_dir_all(path).unwrap();
        let mut dict = Dictionary::new();
        let name = path.file_stem().unwrap().to_string_lossy().into_owned();
        dict.insert("CFBundleName".into(), name.clone().into());
        dict.insert("CFBundleExecutable".into(), name.into());
        if let Some(id) = id {
            dict.insert("CFBundleIdentifier".into(), id.into());
        }
        plist::to_file_xml(path.join("Info.plist"), &Value::Dictionary(dict)).unwrap();
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::make_bundle;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_nested_tree() {
        let dir = TempDir::new().unwrap();
        let app = make_bundle(&dir.path().join("Acme.app"), Some("com.acme.app"));
        make_bundle(&app.join("Frameworks/Core.framework"), Some("com.acme.app"));
        let share = make_bundle(&app.join("PlugIns/Share.appex"), Some("com.acme.app.share"));
        make_bundle(&share.join("Frameworks/Inner.framework"), None);
        make_bundle(&app.join("PlugIns/UnitTests.xctest"), Some("com.acme.app"));
        make_bundle(&app.join("Assets.bundle"), Some("com.acme.app"));
        // directory with a bundle extension but no Info.plist is not a node
        fs::create_dir_all(app.join("Frameworks/Empty.framework")).unwrap();

        let tree = scan_bundle(&app).unwrap();
        assert_eq!(tree.kind, NodeKind::App);
        assert_eq!(tree.current_bundle_id.as_deref(), Some("com.acme.app"));
        assert_eq!(tree.node_count(), 6);

        let share_node = tree.find(&share).unwrap();
        assert_eq!(share_node.kind, NodeKind::Extension);
        assert_eq!(share_node.children.len(), 1);
        assert_eq!(share_node.children[0].current_bundle_id, None);

        let kinds: Vec<NodeKind> = tree.descendants().iter().map(|n| n.kind).collect();
        assert!(kinds.contains(&NodeKind::TestBundle));
        assert!(kinds.contains(&NodeKind::ResourceBundle));
    }

    #[test]
    fn test_resources_info_plist_layout() {
        let dir = TempDir::new().unwrap();
        let app = make_bundle(&dir.path().join("Acme.app"), Some("com.acme.app"));
        let fw = app.join("Frameworks/Legacy.framework");
        make_bundle(&fw.join("Resources"), Some("com.vendor.legacy"));

        let tree = scan_bundle(&app).unwrap();
        let node = tree.find(&fw).unwrap();
        assert_eq!(node.info_plist_path().unwrap(), fw.join("Resources/Info.plist"));
        assert_eq!(node.current_bundle_id.as_deref(), Some("com.vendor.legacy"));
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinked_bundles_are_not_followed() {
        let dir = TempDir::new().unwrap();
        let app = make_bundle(&dir.path().join("Acme.app"), Some("com.acme.app"));
        let real = make_bundle(&app.join("Frameworks/Core.framework"), Some("com.acme.core"));
        std::os::unix::fs::symlink(&real, app.join("Frameworks/Alias.framework")).unwrap();

        let tree = scan_bundle(&app).unwrap();
        assert_eq!(tree.node_count(), 2);
    }

    #[test]
    fn test_scan_requires_info_plist() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("Bare.app")).unwrap();
        let err = scan_bundle(&dir.path().join("Bare.app")).unwrap_err();
        assert!(matches!(err, Error::RepairIo(RepairIoError::UnsupportedTarget { .. })));
    }

    #[test]
    fn test_scan_pods() {
        let dir = TempDir::new().unwrap();
        let support = dir.path().join("Pods").join(TARGET_SUPPORT_FILES);
        let maps = support.join("GoogleMaps");
        fs::create_dir_all(&maps).unwrap();
        fs::write(maps.join("GoogleMaps.debug.xcconfig"), "PRODUCT_BUNDLE_IDENTIFIER = com.acme.app\n").unwrap();
        fs::write(maps.join("GoogleMaps.release.xcconfig"), "PRODUCT_BUNDLE_IDENTIFIER = com.acme.app\n").unwrap();
        let plain = support.join("Pods-Runner");
        fs::create_dir_all(&plain).unwrap();
        fs::write(plain.join("Pods-Runner.release.xcconfig"), "PODS_ROOT = x\n").unwrap();

        let tree = scan_pods(dir.path(), "com.acme.app").unwrap();
        assert_eq!(tree.current_bundle_id.as_deref(), Some("com.acme.app"));
        assert_eq!(tree.children.len(), 1);

        let pod = &tree.children[0];
        assert_eq!(pod.kind, NodeKind::Pod);
        assert_eq!(pod.name, "GoogleMaps");
        match &pod.location {
            IdentityLocation::BuildSettings(files) => assert_eq!(files.len(), 2),
            other => panic!("unexpected location {other:?}"),
        }
    }

    #[test]
    fn test_find_target_support() {
        let dir = TempDir::new().unwrap();
        assert!(find_target_support(dir.path()).is_none());
        let support = dir.path().join(TARGET_SUPPORT_FILES);
        fs::create_dir_all(&support).unwrap();
        assert_eq!(find_target_support(dir.path()).unwrap(), support);
        assert_eq!(find_target_support(&support).unwrap(), support);
    }
}
