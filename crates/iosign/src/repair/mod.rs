//! Package repair.
//!
//! [`PackageRepairEngine`] runs the namespace enforcer over whatever the
//! pipeline hands it: CocoaPods build settings before the build, an
//! `.xcarchive` or `.app` after archiving, or an exported IPA. Each run is a
//! small state machine:
//!
//! ```text
//! SCANNING -> DIFFING -> PATCHING -> VERIFYING -> DONE
//!                                        |
//!                                        +-> (forced pass) -> DONE | FAILED
//! ```
//!
//! Verification rescans the target from disk. If collisions remain, one more
//! pass runs with [`Aggressiveness::Forced`]; only after that is the outcome
//! [`RepairOutcome::Failed`].
//!
//! # Examples
//!
//! ```no_run
//! use iosign::repair::PackageRepairEngine;
//!
//! let report = PackageRepairEngine::new().repair("build/Runner.ipa")?;
//! println!("{report}");
//! report.into_result()?;
//! # Ok::<(), iosign::Error>(())
//! ```

mod report;

pub use report::{RepairOutcome, RepairPhase, RepairReport};

use crate::bundle::scan::find_target_support;
use crate::bundle::{scan_bundle, scan_pods, PackageNode};
use crate::config::BuildConfig;
use crate::error::{NamespaceError, RepairIoError, ResidualCollision};
use crate::ipa::{entry_sha256, CompressionLevel, IpaWorkspace};
use crate::namespace::{
    find_collisions, Aggressiveness, FsWriter, IdentityWriter, NamespaceAssignment, NamespaceEnforcer,
};
use crate::{Error, Result};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Shape of a repair target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputKind {
    Ipa,
    XcArchive,
    AppBundle,
    PodSettings,
}

impl InputKind {
    /// Classify `path` by extension and layout.
    pub fn detect(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        if path.is_file() {
            if ext == "ipa" {
                return Ok(InputKind::Ipa);
            }
            return Err(unsupported(path, "not an .ipa file"));
        }
        if !path.is_dir() {
            return Err(unsupported(path, "path does not exist"));
        }
        match ext.as_str() {
            "xcarchive" => Ok(InputKind::XcArchive),
            "app" => Ok(InputKind::AppBundle),
            _ if find_target_support(path).is_some() => Ok(InputKind::PodSettings),
            _ => Err(unsupported(
                path,
                "expected an .ipa, .xcarchive, .app or a Pods directory",
            )),
        }
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputKind::Ipa => "ipa",
            InputKind::XcArchive => "xcarchive",
            InputKind::AppBundle => "app",
            InputKind::PodSettings => "pods",
        };
        f.write_str(s)
    }
}

fn unsupported(path: &Path, reason: &str) -> Error {
    RepairIoError::UnsupportedTarget {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
    .into()
}

/// Locate `Products/Applications/<Name>.app` inside an archive.
pub fn archived_app(xcarchive: &Path) -> Result<PathBuf> {
    let applications = xcarchive.join("Products").join("Applications");
    let entries = fs::read_dir(&applications).map_err(|_| unsupported(xcarchive, "no Products/Applications"))?;
    let mut apps: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.extension().is_some_and(|ext| ext == "app"))
        .collect();
    apps.sort();
    apps.into_iter()
        .next()
        .ok_or_else(|| unsupported(xcarchive, "no .app under Products/Applications"))
}

/// Repairs bundle identifier collisions in a built or half-built package.
#[derive(Debug, Clone)]
pub struct PackageRepairEngine {
    main_bundle_id: Option<String>,
    output: Option<PathBuf>,
    compression_level: CompressionLevel,
    verify_executable: bool,
    enforcer: NamespaceEnforcer,
}

impl Default for PackageRepairEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageRepairEngine {
    pub fn new() -> Self {
        Self {
            main_bundle_id: None,
            output: None,
            compression_level: CompressionLevel::DEFAULT,
            verify_executable: true,
            enforcer: NamespaceEnforcer::new(),
        }
    }

    /// Engine configured from the `bundle_id` and `[repair]` settings.
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            main_bundle_id: config.bundle_id.clone(),
            compression_level: config.repair.compression_level,
            verify_executable: config.repair.verify_executable,
            ..Self::new()
        }
    }

    /// Main bundle id for Pods inputs, and an override for bundle inputs.
    ///
    /// For bundle inputs the root keeps whatever id it has on disk; the
    /// override only changes what nested nodes are checked against.
    pub fn main_bundle_id(mut self, id: impl Into<String>) -> Self {
        self.main_bundle_id = Some(id.into());
        self
    }

    /// Destination of the repaired IPA. Defaults to rewriting it in place.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn compression_level(mut self, level: CompressionLevel) -> Self {
        self.compression_level = level;
        self
    }

    /// Whether the main executable hash is compared across a repack.
    pub fn verify_executable(mut self, verify: bool) -> Self {
        self.verify_executable = verify;
        self
    }

    pub fn enforcer(mut self, enforcer: NamespaceEnforcer) -> Self {
        self.enforcer = enforcer;
        self
    }

    /// Repair `target` on disk.
    ///
    /// A residual collision is reported in [`RepairReport::outcome`], not as
    /// an error; use [`RepairReport::into_result`] to make it fatal.
    pub fn repair(&self, target: impl AsRef<Path>) -> Result<RepairReport> {
        let mut writer = FsWriter::default();
        self.repair_with(target.as_ref(), &mut writer)
    }

    /// Repair `target`, persisting identities through `writer`.
    pub fn repair_with(&self, target: &Path, writer: &mut dyn IdentityWriter) -> Result<RepairReport> {
        let kind = InputKind::detect(target)?;
        info!(target = %target.display(), kind = %kind, "starting repair");

        match kind {
            InputKind::Ipa => self.repair_ipa(target, writer),
            InputKind::XcArchive => {
                let app = archived_app(target)?;
                self.run(target, kind, target, writer, || scan_bundle(&app))
            }
            InputKind::AppBundle => {
                let base = target.parent().unwrap_or(target);
                self.run(target, kind, base, writer, || scan_bundle(target))
            }
            InputKind::PodSettings => {
                let main_id = self.main_bundle_id.as_deref().ok_or_else(|| {
                    Error::Config("a main bundle id is required to repair Pods build settings".into())
                })?;
                self.run(target, kind, target, writer, || scan_pods(target, main_id))
            }
        }
    }

    fn repair_ipa(&self, ipa: &Path, writer: &mut dyn IdentityWriter) -> Result<RepairReport> {
        let workspace = IpaWorkspace::open(ipa)?.compression_level(self.compression_level);
        let executable = workspace.executable_entry()?;
        let before = match &executable {
            Some(name) => entry_sha256(ipa, name)?,
            None => None,
        };

        let app = workspace.app().to_path_buf();
        let mut report = self.run(ipa, InputKind::Ipa, workspace.root(), writer, || scan_bundle(&app))?;
        report.main_executable_sha256 = before.clone();

        let output = self.output.clone().unwrap_or_else(|| ipa.to_path_buf());
        let changed = writer.written().to_vec();
        if changed.is_empty() {
            if output != ipa {
                fs::copy(ipa, &output).map_err(|e| RepairIoError::from_io(&output, e))?;
            }
            report.output = Some(output);
            return Ok(report);
        }

        let summary = workspace.repack(&changed, &output)?;
        info!(
            output = %output.display(),
            entries = summary.entries,
            rewritten = summary.rewritten,
            "repacked IPA"
        );

        if self.verify_executable {
            if let Some(name) = &executable {
                let after = entry_sha256(&output, name)?;
                if after != before {
                    return Err(RepairIoError::ZipCorrupt {
                        path: output,
                        reason: format!("main executable {name} changed during repack"),
                    }
                    .into());
                }
            }
        }

        report.output = Some(output);
        report.repack = Some(summary);
        Ok(report)
    }

    /// Standard pass, then at most one forced pass.
    fn run<F>(
        &self,
        target: &Path,
        kind: InputKind,
        base: &Path,
        writer: &mut dyn IdentityWriter,
        scan: F,
    ) -> Result<RepairReport>
    where
        F: Fn() -> Result<PackageNode>,
    {
        let mut phases = Vec::new();
        let mut collisions_found = 0;
        let mut collisions_fixed = 0;
        let mut writes = 0;
        let mut forced = false;
        let mut main_bundle_id = String::new();
        let mut assignments = Vec::new();
        let mut residual = Vec::new();

        for aggressiveness in [Aggressiveness::Standard, Aggressiveness::Forced] {
            forced = aggressiveness == Aggressiveness::Forced;

            enter(&mut phases, RepairPhase::Scanning, target);
            let tree = scan()?;
            main_bundle_id = self.main_id_for(&tree)?;

            enter(&mut phases, RepairPhase::Diffing, target);
            let plan = self.enforcer.plan(&tree, &main_bundle_id, aggressiveness)?;

            enter(&mut phases, RepairPhase::Patching, target);
            let outcome = self.enforcer.write(&tree, plan, writer)?;
            collisions_found += outcome.collisions_found;
            collisions_fixed += outcome.collisions_fixed;
            writes += outcome.writes;
            assignments = outcome.assignments;

            enter(&mut phases, RepairPhase::Verifying, target);
            residual = find_collisions(&scan()?);
            if residual.is_empty() {
                break;
            }
            for r in &residual {
                warn!(
                    bundle_id = %r.bundle_id,
                    nodes = r.nodes.len(),
                    ?aggressiveness,
                    "collision survived repair pass"
                );
            }
        }

        let outcome = if residual.is_empty() {
            enter(&mut phases, RepairPhase::Done, target);
            RepairOutcome::Done
        } else {
            enter(&mut phases, RepairPhase::Failed, target);
            RepairOutcome::Failed {
                residual: relative_residual(residual, base),
            }
        };

        Ok(RepairReport {
            target: target.to_path_buf(),
            output: None,
            input_kind: kind,
            main_bundle_id,
            phases,
            assignments: relative_assignments(assignments, base),
            collisions_found,
            collisions_fixed,
            writes,
            forced,
            outcome,
            main_executable_sha256: None,
            repack: None,
        })
    }

    fn main_id_for(&self, tree: &PackageNode) -> Result<String> {
        if let Some(id) = &self.main_bundle_id {
            return Ok(id.clone());
        }
        tree.current_bundle_id.clone().ok_or_else(|| {
            NamespaceError::SyntaxInvalid {
                node: tree.path.clone(),
                id: String::new(),
            }
            .into()
        })
    }
}

fn enter(phases: &mut Vec<RepairPhase>, phase: RepairPhase, target: &Path) {
    match phase {
        RepairPhase::Failed => warn!(phase = %phase, target = %target.display(), "repair phase"),
        _ => info!(phase = %phase, target = %target.display(), "repair phase"),
    }
    phases.push(phase);
}

fn relative(path: &Path, base: &Path) -> PathBuf {
    path.strip_prefix(base).map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf())
}

fn relative_assignments(assignments: Vec<NamespaceAssignment>, base: &Path) -> Vec<NamespaceAssignment> {
    assignments
        .into_iter()
        .map(|mut a| {
            a.node_path = relative(&a.node_path, base);
            a
        })
        .collect()
}

fn relative_residual(residual: Vec<ResidualCollision>, base: &Path) -> Vec<ResidualCollision> {
    residual
        .into_iter()
        .map(|mut r| {
            r.nodes = r.nodes.iter().map(|p| relative(p, base)).collect();
            r
        })
        .collect()
}
