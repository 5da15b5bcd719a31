//! Package trees.
//!
//! A built iOS app is a tree of bundles: the main `.app`, its embedded
//! frameworks, app extensions, test bundles and resource bundles, each with
//! its own Info.plist and `CFBundleIdentifier`. Before a build, CocoaPods
//! targets carry the same identity as a `PRODUCT_BUNDLE_IDENTIFIER` build
//! setting. [`PackageNode`] models both shapes so one enforcer can assign
//! identifiers at every repair point.
//!
//! # Node kinds
//!
//! | Directory | Kind | Category tag |
//! |-----------|------|--------------|
//! | root `.app` | [`NodeKind::App`] | - |
//! | `.framework` | [`NodeKind::Framework`] | `framework` |
//! | `.appex` | [`NodeKind::Extension`] | `plugin` |
//! | `.xctest` | [`NodeKind::TestBundle`] | - (uses `.tests`) |
//! | `.bundle` | [`NodeKind::ResourceBundle`] | `bundle` |
//! | pod target | [`NodeKind::Pod`] | `pod` |
//! | nested `.app`, `.xpc` | [`NodeKind::Component`] | `component` |

pub mod info_plist;
pub mod scan;
pub mod xcconfig;

pub use scan::{scan_bundle, scan_pods};

use std::fmt;
use std::path::{Path, PathBuf};

/// What a node in the package tree is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    App,
    Framework,
    Extension,
    TestBundle,
    ResourceBundle,
    Pod,
    Component,
}

impl NodeKind {
    /// Kind of a nested bundle directory, from its extension.
    pub fn from_bundle_path(path: &Path) -> Option<NodeKind> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "framework" => Some(NodeKind::Framework),
            "appex" => Some(NodeKind::Extension),
            "xctest" => Some(NodeKind::TestBundle),
            "bundle" => Some(NodeKind::ResourceBundle),
            "app" | "xpc" => Some(NodeKind::Component),
            _ => None,
        }
    }

    /// Segment inserted between the main id and the node name.
    pub fn category_tag(&self) -> &'static str {
        match self {
            NodeKind::App | NodeKind::Component => "component",
            NodeKind::Framework => "framework",
            NodeKind::Extension => "plugin",
            NodeKind::TestBundle => "tests",
            NodeKind::ResourceBundle => "bundle",
            NodeKind::Pod => "pod",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::App => "app",
            NodeKind::Framework => "framework",
            NodeKind::Extension => "extension",
            NodeKind::TestBundle => "test-bundle",
            NodeKind::ResourceBundle => "resource-bundle",
            NodeKind::Pod => "pod",
            NodeKind::Component => "component",
        };
        f.write_str(name)
    }
}

/// Where a node's bundle identifier is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityLocation {
    /// `CFBundleIdentifier` in this Info.plist.
    InfoPlist(PathBuf),
    /// `PRODUCT_BUNDLE_IDENTIFIER` in each of these xcconfig files.
    BuildSettings(Vec<PathBuf>),
}

/// One bundle (or pod target) and the bundles nested inside it.
#[derive(Debug, Clone)]
pub struct PackageNode {
    pub path: PathBuf,
    /// Bundle name without extension, or the pod target name.
    pub name: String,
    pub kind: NodeKind,
    pub current_bundle_id: Option<String>,
    pub location: IdentityLocation,
    pub children: Vec<PackageNode>,
}

impl PackageNode {
    /// Info.plist backing this node, if its identity lives in one.
    pub fn info_plist_path(&self) -> Option<&Path> {
        match &self.location {
            IdentityLocation::InfoPlist(p) => Some(p),
            IdentityLocation::BuildSettings(_) => None,
        }
    }

    /// Every node below the root in depth-first order, children sorted by path.
    pub fn descendants(&self) -> Vec<&PackageNode> {
        let mut out = Vec::new();
        collect_sorted(self, &mut out);
        out
    }

    /// Total number of nodes, including this one.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(PackageNode::node_count).sum::<usize>()
    }

    /// Find a node by path.
    pub fn find(&self, path: &Path) -> Option<&PackageNode> {
        if self.path == path {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(path))
    }
}

fn collect_sorted<'a>(node: &'a PackageNode, out: &mut Vec<&'a PackageNode>) {
    let mut children: Vec<&PackageNode> = node.children.iter().collect();
    children.sort_by(|a, b| a.path.cmp(&b.path));
    for child in children {
        out.push(child);
        collect_sorted(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(path: &str, kind: NodeKind, children: Vec<PackageNode>) -> PackageNode {
        PackageNode {
            path: PathBuf::from(path),
            name: Path::new(path)
                .file_stem()
                .unwrap()
                .to_string_lossy()
                .into_owned(),
            kind,
            current_bundle_id: None,
            location: IdentityLocation::InfoPlist(PathBuf::from(path).join("Info.plist")),
            children,
        }
    }

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(NodeKind::from_bundle_path(Path::new("A.app/Frameworks/Core.framework")), Some(NodeKind::Framework));
        assert_eq!(NodeKind::from_bundle_path(Path::new("Share.appex")), Some(NodeKind::Extension));
        assert_eq!(NodeKind::from_bundle_path(Path::new("UnitTests.XCTEST")), Some(NodeKind::TestBundle));
        assert_eq!(NodeKind::from_bundle_path(Path::new("Assets.bundle")), Some(NodeKind::ResourceBundle));
        assert_eq!(NodeKind::from_bundle_path(Path::new("Watch.app")), Some(NodeKind::Component));
        assert_eq!(NodeKind::from_bundle_path(Path::new("Helper.xpc")), Some(NodeKind::Component));
        assert_eq!(NodeKind::from_bundle_path(Path::new("Base.lproj")), None);
        assert_eq!(NodeKind::from_bundle_path(Path::new("Frameworks")), None);
    }

    #[test]
    fn test_descendants_sorted_depth_first() {
        let tree = node(
            "A.app",
            NodeKind::App,
            vec![
                node("A.app/PlugIns/Share.appex", NodeKind::Extension, vec![node(
                    "A.app/PlugIns/Share.appex/Frameworks/Inner.framework",
                    NodeKind::Framework,
                    vec![],
                )]),
                node("A.app/Frameworks/Core.framework", NodeKind::Framework, vec![]),
            ],
        );

        let order: Vec<&str> = tree
            .descendants()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(order, ["Core", "Share", "Inner"]);
        assert_eq!(tree.node_count(), 4);
        assert!(tree.find(Path::new("A.app/PlugIns/Share.appex/Frameworks/Inner.framework")).is_some());
    }
}
