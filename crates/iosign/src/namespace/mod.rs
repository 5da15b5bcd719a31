//! Collision-free bundle identifier assignment.
//!
//! [`NamespaceEnforcer`] walks a [`PackageNode`] tree and gives every nested
//! bundle an identifier that is unique across the tree, without touching the
//! main app's id and without rewriting nodes that are already fine.
//!
//! The walk is depth-first with children sorted by path, starting from
//! `used = {main_id}`:
//!
//! - a test bundle gets `<main>.tests`, then `<main>.tests.2`, `.3`, ...
//! - any other node whose current id is valid and not yet used keeps it
//! - everything else gets `<main>.<tag>.<name>`, with `.2`, `.3`, ... on
//!   collision (a millisecond timestamp first under [`Aggressiveness::Forced`])
//!
//! Because the rules only depend on the walk order and ids seen so far, a
//! second run over the result assigns the same ids and writes nothing.
//!
//! # Examples
//!
//! ```no_run
//! use iosign::bundle::scan_bundle;
//! use iosign::namespace::{Aggressiveness, FsWriter, NamespaceEnforcer};
//! use std::path::Path;
//!
//! let tree = scan_bundle(Path::new("Runner.app"))?;
//! let mut writer = FsWriter::default();
//! let outcome = NamespaceEnforcer::new().apply(&tree, "com.acme.app", Aggressiveness::Standard, &mut writer)?;
//! println!("fixed {} collision(s)", outcome.collisions_fixed);
//! # Ok::<(), iosign::Error>(())
//! ```

use crate::bundle::{info_plist, xcconfig, IdentityLocation, NodeKind, PackageNode};
use crate::error::{NamespaceError, ResidualCollision};
use crate::Result;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Longest bundle identifier accepted.
pub const MAX_BUNDLE_ID_LEN: usize = 255;

const TESTS_SUFFIX: &str = "tests";
const FALLBACK_NAME: &str = "component";

/// How hard to try for uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggressiveness {
    /// Numeric suffixes only; fully deterministic.
    #[default]
    Standard,
    /// Colliding candidates get a timestamp suffix. Used once, after a
    /// verified residual collision.
    Forced,
}

/// Why a node received its identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AssignmentReason {
    Unchanged,
    CollisionWithMain,
    CollisionWithSibling,
    TestSuffix,
    Missing,
    Invalid,
}

impl fmt::Display for AssignmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssignmentReason::Unchanged => "unchanged",
            AssignmentReason::CollisionWithMain => "collision-with-main",
            AssignmentReason::CollisionWithSibling => "collision-with-sibling",
            AssignmentReason::TestSuffix => "test-suffix",
            AssignmentReason::Missing => "missing",
            AssignmentReason::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Identifier decided for one non-root node.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct NamespaceAssignment {
    pub node_path: PathBuf,
    pub kind: NodeKind,
    pub old_id: Option<String>,
    pub new_id: String,
    pub reason: AssignmentReason,
}

impl NamespaceAssignment {
    /// Whether applying this assignment writes to disk.
    pub fn changed(&self) -> bool {
        self.old_id.as_deref() != Some(self.new_id.as_str())
    }

    fn is_collision(&self) -> bool {
        matches!(
            self.reason,
            AssignmentReason::CollisionWithMain | AssignmentReason::CollisionWithSibling
        )
    }
}

/// Pure result of [`NamespaceEnforcer::plan`].
#[derive(Debug, Clone)]
pub struct Plan {
    pub main_id: String,
    pub aggressiveness: Aggressiveness,
    pub assignments: Vec<NamespaceAssignment>,
}

impl Plan {
    pub fn collisions_found(&self) -> usize {
        self.assignments.iter().filter(|a| a.is_collision()).count()
    }

    /// Assignments that require a write.
    pub fn changes(&self) -> impl Iterator<Item = &NamespaceAssignment> {
        self.assignments.iter().filter(|a| a.changed())
    }
}

/// Result of [`NamespaceEnforcer::apply`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EnforcementOutcome {
    pub assignments: Vec<NamespaceAssignment>,
    pub collisions_found: usize,
    pub collisions_fixed: usize,
    /// Nodes whose identity was rewritten.
    pub writes: usize,
}

/// Persists a node's new identifier.
pub trait IdentityWriter {
    fn write(&mut self, node: &PackageNode, bundle_id: &str) -> Result<()>;

    /// Files rewritten so far, in write order. Writers that do not touch
    /// the filesystem report nothing.
    fn written(&self) -> &[PathBuf] {
        &[]
    }
}

/// Writes identities to Info.plist and xcconfig files on disk.
#[derive(Debug, Default)]
pub struct FsWriter {
    written: Vec<PathBuf>,
}

impl IdentityWriter for FsWriter {
    fn write(&mut self, node: &PackageNode, bundle_id: &str) -> Result<()> {
        match &node.location {
            IdentityLocation::InfoPlist(path) => {
                info_plist::write_bundle_id(path, bundle_id)?;
                self.written.push(path.clone());
            }
            IdentityLocation::BuildSettings(files) => {
                for file in files {
                    if xcconfig::write_bundle_id(file, bundle_id)? {
                        self.written.push(file.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

/// Assigns bundle identifiers across a package tree.
#[derive(Debug, Clone, Copy)]
pub struct NamespaceEnforcer {
    now_millis: fn() -> u128,
}

impl Default for NamespaceEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceEnforcer {
    pub fn new() -> Self {
        Self {
            now_millis: system_millis,
        }
    }

    /// Enforcer with a fixed clock for [`Aggressiveness::Forced`] suffixes.
    pub fn with_clock(now_millis: fn() -> u128) -> Self {
        Self { now_millis }
    }

    /// Decide every node's identifier without touching the disk.
    pub fn plan(&self, tree: &PackageNode, main_id: &str, aggressiveness: Aggressiveness) -> Result<Plan> {
        if !is_valid_bundle_id(main_id) {
            return Err(NamespaceError::SyntaxInvalid {
                node: tree.path.clone(),
                id: main_id.to_string(),
            }
            .into());
        }
        if let Some(root_id) = &tree.current_bundle_id {
            if !root_id.eq_ignore_ascii_case(main_id) {
                warn!(
                    node = %tree.path.display(),
                    current = %root_id,
                    main = main_id,
                    "main bundle id differs from the root bundle, root is left as is"
                );
            }
        }

        let main_key = main_id.to_ascii_lowercase();
        let root_key = tree.current_bundle_id.as_deref().map(str::to_ascii_lowercase);
        let mut used: HashSet<String> = HashSet::new();
        used.insert(main_key.clone());
        used.extend(root_key.clone());

        // `.tests`, `.tests.2`, ... belong to test bundles only.
        let tests_base = format!("{}.{}", main_id, TESTS_SUFFIX);
        let test_count = tree
            .descendants()
            .iter()
            .filter(|n| n.kind == NodeKind::TestBundle)
            .count();
        let reserved: HashSet<String> = (1..=test_count)
            .map(|n| numbered(&tests_base, n).to_ascii_lowercase())
            .collect();
        let stamp = match aggressiveness {
            Aggressiveness::Standard => None,
            Aggressiveness::Forced => Some((self.now_millis)()),
        };

        let mut assignments = Vec::new();
        for node in tree.descendants() {
            let current = node.current_bundle_id.as_deref();
            let (new_id, reason) = if node.kind == NodeKind::TestBundle {
                let candidate = first_free(&tests_base, |key| used.contains(key));
                match current {
                    Some(cur) if cur.eq_ignore_ascii_case(&candidate) => {
                        (cur.to_string(), AssignmentReason::Unchanged)
                    }
                    _ => (candidate, AssignmentReason::TestSuffix),
                }
            } else {
                let taken = |key: &str| used.contains(key) || reserved.contains(key);
                let reason = match current.map(|cur| (cur, cur.to_ascii_lowercase())) {
                    None => Some(AssignmentReason::Missing),
                    Some((cur, _)) if !is_valid_bundle_id(cur) => Some(AssignmentReason::Invalid),
                    Some((_, key)) if key == main_key || root_key.as_deref() == Some(key.as_str()) => {
                        Some(AssignmentReason::CollisionWithMain)
                    }
                    Some((_, key)) if taken(&key) => Some(AssignmentReason::CollisionWithSibling),
                    Some(_) => None,
                };
                match (reason, current) {
                    (None, Some(cur)) => (cur.to_string(), AssignmentReason::Unchanged),
                    (reason, _) => {
                        let base = format!(
                            "{}.{}.{}",
                            main_id,
                            node.kind.category_tag(),
                            sanitize(&node.name)
                        );
                        let base = match stamp {
                            Some(stamp) if taken(&base.to_ascii_lowercase()) => {
                                format!("{}.{}", base, stamp)
                            }
                            _ => base,
                        };
                        (
                            first_free(&base, taken),
                            reason.unwrap_or(AssignmentReason::Missing),
                        )
                    }
                }
            };

            if !is_valid_bundle_id(&new_id) {
                return Err(NamespaceError::SyntaxInvalid {
                    node: node.path.clone(),
                    id: new_id,
                }
                .into());
            }

            used.insert(new_id.to_ascii_lowercase());
            let assignment = NamespaceAssignment {
                node_path: node.path.clone(),
                kind: node.kind,
                old_id: node.current_bundle_id.clone(),
                new_id,
                reason,
            };
            if assignment.changed() {
                debug!(
                    node = %assignment.node_path.display(),
                    old = assignment.old_id.as_deref().unwrap_or("<none>"),
                    new = %assignment.new_id,
                    reason = %assignment.reason,
                    "planned bundle id"
                );
            }
            assignments.push(assignment);
        }

        Ok(Plan {
            main_id: main_id.to_string(),
            aggressiveness,
            assignments,
        })
    }

    /// Plan and write through `writer`. Unchanged nodes are never written.
    pub fn apply(
        &self,
        tree: &PackageNode,
        main_id: &str,
        aggressiveness: Aggressiveness,
        writer: &mut dyn IdentityWriter,
    ) -> Result<EnforcementOutcome> {
        let plan = self.plan(tree, main_id, aggressiveness)?;
        self.write(tree, plan, writer)
    }

    /// Write the changed assignments of `plan`, which must come from `tree`.
    pub fn write(
        &self,
        tree: &PackageNode,
        plan: Plan,
        writer: &mut dyn IdentityWriter,
    ) -> Result<EnforcementOutcome> {
        let collisions_found = plan.collisions_found();
        let mut collisions_fixed = 0;
        let mut writes = 0;

        for assignment in plan.changes() {
            let Some(node) = tree.find(&assignment.node_path) else {
                continue;
            };
            writer.write(node, &assignment.new_id)?;
            writes += 1;
            if assignment.is_collision() {
                collisions_fixed += 1;
            }
            info!(
                node = %assignment.node_path.display(),
                old = assignment.old_id.as_deref().unwrap_or("<none>"),
                new = %assignment.new_id,
                reason = %assignment.reason,
                "rewrote bundle id"
            );
        }

        info!(
            main = %plan.main_id,
            nodes = plan.assignments.len() + 1,
            collisions_found,
            collisions_fixed,
            writes,
            aggressiveness = ?plan.aggressiveness,
            "namespace enforced"
        );
        Ok(EnforcementOutcome {
            assignments: plan.assignments,
            collisions_found,
            collisions_fixed,
            writes,
        })
    }
}

fn system_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// `base`, or `base.2`, `base.3`, ... whichever is first not in `used`.
/// `base` for `n == 1`, `base.n` otherwise.
fn numbered(base: &str, n: usize) -> String {
    if n <= 1 {
        base.to_string()
    } else {
        format!("{}.{}", base, n)
    }
}

/// First of `base`, `base.2`, `base.3`, ... whose lower-cased form is not `taken`.
fn first_free(base: &str, taken: impl Fn(&str) -> bool) -> String {
    (1usize..)
        .map(|n| numbered(base, n))
        .find(|c| !taken(&c.to_ascii_lowercase()))
        .unwrap_or_else(|| base.to_string())
}

/// Lower-case `name` and keep only `[a-z0-9]`.
pub fn sanitize(name: &str) -> String {
    let out: String = name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if out.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        out
    }
}

/// Whether `id` is a syntactically valid reverse-DNS bundle identifier.
pub fn is_valid_bundle_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_BUNDLE_ID_LEN {
        return false;
    }
    let mut components = 0;
    for component in id.split('.') {
        if component.is_empty()
            || !component
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return false;
        }
        components += 1;
    }
    components >= 2
}

/// Identifiers carried by more than one node, compared case-insensitively.
///
/// Nodes without an identifier are ignored.
pub fn find_collisions(tree: &PackageNode) -> Vec<ResidualCollision> {
    let mut groups: BTreeMap<String, (String, Vec<PathBuf>)> = BTreeMap::new();
    let mut visit = |node: &PackageNode| {
        if let Some(id) = &node.current_bundle_id {
            groups
                .entry(id.to_ascii_lowercase())
                .or_insert_with(|| (id.clone(), Vec::new()))
                .1
                .push(node.path.clone());
        }
    };
    visit(tree);
    for node in tree.descendants() {
        visit(node);
    }

    groups
        .into_values()
        .filter(|(_, nodes)| nodes.len() > 1)
        .map(|(bundle_id, mut nodes)| {
            nodes.sort();
            ResidualCollision { bundle_id, nodes }
        })
        .collect()
}

/// Copy of `tree` with the plan's identifiers applied in memory.
pub fn with_assignments(tree: &PackageNode, assignments: &[NamespaceAssignment]) -> PackageNode {
    let mut updated = tree.clone();
    for assignment in assignments {
        if let Some(node) = find_mut(&mut updated, &assignment.node_path) {
            node.current_bundle_id = Some(assignment.new_id.clone());
        }
    }
    updated
}

fn find_mut<'a>(node: &'a mut PackageNode, path: &Path) -> Option<&'a mut PackageNode> {
    if node.path == path {
        return Some(node);
    }
    node.children.iter_mut().find_map(|c| find_mut(c, path))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;

    pub fn node(path: &str, kind: NodeKind, id: Option<&str>, children: Vec<PackageNode>) -> PackageNode {
        let path = PathBuf::from(path);
        PackageNode {
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            location: IdentityLocation::InfoPlist(path.join("Info.plist")),
            path,
            kind,
            current_bundle_id: id.map(str::to_string),
            children,
        }
    }

    /// Records writes; optionally drops every write while `drop_writes` is set.
    #[derive(Default)]
    pub struct MemoryWriter {
        pub writes: HashMap<PathBuf, String>,
        pub drop_writes: bool,
        pub calls: usize,
    }

    impl IdentityWriter for MemoryWriter {
        fn write(&mut self, node: &PackageNode, bundle_id: &str) -> Result<()> {
            self.calls += 1;
            if !self.drop_writes {
                self.writes.insert(node.path.clone(), bundle_id.to_string());
            }
            Ok(())
        }
    }
}
