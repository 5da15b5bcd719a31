//! Repair reports for CI logs.

use super::InputKind;
use crate::bundle::info_plist::write_atomic;
use crate::error::{NamespaceError, ResidualCollision};
use crate::ipa::RepackSummary;
use crate::namespace::NamespaceAssignment;
use crate::{Error, Result};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// State machine step of one repair pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairPhase {
    Scanning,
    Diffing,
    Patching,
    Verifying,
    Done,
    Failed,
}

impl fmt::Display for RepairPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepairPhase::Scanning => "SCANNING",
            RepairPhase::Diffing => "DIFFING",
            RepairPhase::Patching => "PATCHING",
            RepairPhase::Verifying => "VERIFYING",
            RepairPhase::Done => "DONE",
            RepairPhase::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Final state of a repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RepairOutcome {
    Done,
    /// Collisions survived the forced pass.
    Failed { residual: Vec<ResidualCollision> },
}

/// What a repair found, changed and verified.
///
/// Node paths are relative to the repaired target so reports from a
/// temporary IPA extraction still read as `Payload/<Name>.app/...`.
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub target: PathBuf,
    /// Where the repaired IPA was written, if the input was an IPA.
    pub output: Option<PathBuf>,
    pub input_kind: InputKind,
    pub main_bundle_id: String,
    pub phases: Vec<RepairPhase>,
    /// Assignments of the last pass.
    pub assignments: Vec<NamespaceAssignment>,
    pub collisions_found: usize,
    pub collisions_fixed: usize,
    pub writes: usize,
    /// Whether the forced pass ran.
    pub forced: bool,
    pub outcome: RepairOutcome,
    pub main_executable_sha256: Option<String>,
    pub repack: Option<RepackSummary>,
}

impl RepairReport {
    pub fn is_done(&self) -> bool {
        self.outcome == RepairOutcome::Done
    }

    /// Number of enforcement passes that ran.
    pub fn passes(&self) -> u32 {
        if self.forced {
            2
        } else {
            1
        }
    }

    /// Turn a failed outcome into [`NamespaceError::ResidualCollision`].
    pub fn into_result(self) -> Result<Self> {
        if let RepairOutcome::Failed { residual } = &self.outcome {
            return Err(NamespaceError::ResidualCollision {
                passes: self.passes(),
                residual: residual.clone(),
            }
            .into());
        }
        Ok(self)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Io(e.into()))
    }

    /// Write the JSON report atomically.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut json = self.to_json()?;
        json.push('\n');
        write_atomic(path.as_ref(), json.as_bytes())
    }

    /// Per-node assignment table.
    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Node", "Kind", "Old id", "New id", "Reason"]);
        for a in &self.assignments {
            table.add_row(vec![
                a.node_path.display().to_string(),
                a.kind.to_string(),
                a.old_id.clone().unwrap_or_else(|| "-".to_string()),
                a.new_id.clone(),
                a.reason.to_string(),
            ]);
        }
        table
    }
}

impl fmt::Display for RepairReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({}) main={} found={} fixed={} writes={}{}",
            self.target.display(),
            self.input_kind,
            self.main_bundle_id,
            self.collisions_found,
            self.collisions_fixed,
            self.writes,
            if self.forced { " forced" } else { "" }
        )?;
        if !self.assignments.is_empty() {
            writeln!(f, "{}", self.table())?;
        }
        match &self.outcome {
            RepairOutcome::Done => write!(f, "{}", RepairPhase::Done),
            RepairOutcome::Failed { residual } => {
                write!(f, "{}", RepairPhase::Failed)?;
                for r in residual {
                    let nodes: Vec<String> = r.nodes.iter().map(|p| p.display().to_string()).collect();
                    write!(f, "\n  {} shared by {}", r.bundle_id, nodes.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::NodeKind;
    use crate::namespace::AssignmentReason;

    fn report(outcome: RepairOutcome, forced: bool) -> RepairReport {
        RepairReport {
            target: PathBuf::from("Acme.app"),
            output: None,
            input_kind: InputKind::AppBundle,
            main_bundle_id: "com.acme.app".into(),
            phases: vec![RepairPhase::Scanning, RepairPhase::Diffing],
            assignments: vec![NamespaceAssignment {
                node_path: PathBuf::from("Acme.app/Frameworks/Core.framework"),
                kind: NodeKind::Framework,
                old_id: Some("com.acme.app".into()),
                new_id: "com.acme.app.framework.core".into(),
                reason: AssignmentReason::CollisionWithMain,
            }],
            collisions_found: 1,
            collisions_fixed: 1,
            writes: 1,
            forced,
            outcome,
            main_executable_sha256: None,
            repack: None,
        }
    }

    #[test]
    fn test_display_lists_assignments() {
        let text = report(RepairOutcome::Done, false).to_string();
        assert!(text.contains("com.acme.app.framework.core"));
        assert!(text.contains("collision-with-main"));
        assert!(text.ends_with("DONE"));
    }

    #[test]
    fn test_json_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&report(RepairOutcome::Done, false).to_json().unwrap()).unwrap();
        assert_eq!(json["outcome"]["status"], "done");
        assert_eq!(json["input_kind"], "app-bundle");
        assert_eq!(json["phases"][0], "SCANNING");
        assert_eq!(json["assignments"][0]["reason"], "CollisionWithMain");
    }

    #[test]
    fn test_failed_report_maps_to_residual_collision() {
        let residual = vec![ResidualCollision {
            bundle_id: "com.acme.app".into(),
            nodes: vec![PathBuf::from("Acme.app"), PathBuf::from("Acme.app/Frameworks/Core.framework")],
        }];
        let failed = report(RepairOutcome::Failed { residual }, true);
        assert!(failed.to_string().contains("Core.framework"));

        let err = failed.into_result().unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_RESIDUAL_COLLISION);
        assert!(matches!(
            err,
            Error::Namespace(NamespaceError::ResidualCollision { passes: 2, .. })
        ));
    }

    #[test]
    fn test_done_report_passes_through() {
        assert!(report(RepairOutcome::Done, false).into_result().is_ok());
    }
}
