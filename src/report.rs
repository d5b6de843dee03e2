//! Run summary (`report/report.json`) and validation findings
//! (`validation/findings.csv`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{DropKind, Dropped};
use crate::files::FileKind;
use crate::packet::walker::LayerCounters;
use crate::packet::Phase;
use crate::store::{Kind, StoreStats};

// ─── Per-file summary ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub path: String,
    pub kind: FileKind,
    /// Packets or lines read.
    pub records: u64,
    pub written: u64,
    pub quarantined: u64,
    pub explicit_drop: u64,
    pub implicit_drop: u64,
    pub error: u64,
    pub residuals: u64,
}

impl FileSummary {
    pub fn new(path: &Path, kind: FileKind) -> Self {
        Self {
            path: path.display().to_string(),
            kind,
            records: 0,
            written: 0,
            quarantined: 0,
            explicit_drop: 0,
            implicit_drop: 0,
            error: 0,
            residuals: 0,
        }
    }

    pub fn count_drop(&mut self, d: &Dropped) {
        match d.kind {
            DropKind::Explicit => self.explicit_drop += 1,
            DropKind::Implicit => self.implicit_drop += 1,
            DropKind::Error => self.error += 1,
        }
    }

    pub fn drops(&self) -> u64 {
        self.explicit_drop + self.implicit_drop + self.error
    }
}

// ─── Validation findings ──────────────────────────────────────────────────────

/// Where a residual original value was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The anonymized output itself.
    Output,
    /// The clean-mode rendering written for review.
    Rendering,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub file: String,
    /// `packet N` or `line N`.
    pub location: String,
    pub store: Kind,
    pub value: String,
    pub source: Source,
}

pub fn write_findings_csv(findings: &[Finding], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Cannot create {:?}", parent))?;
    }
    let mut w = csv::Writer::from_path(path).with_context(|| format!("Cannot create {:?}", path))?;
    if findings.is_empty() {
        w.write_record(["file", "location", "store", "value", "source"])?;
    }
    for f in findings {
        w.serialize(f)?;
    }
    w.flush()?;
    Ok(())
}

// ─── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub files: Vec<FileSummary>,
    pub layers: BTreeMap<String, LayerCounters>,
}

impl PhaseReport {
    pub fn records(&self) -> u64 {
        self.files.iter().map(|f| f.records).sum()
    }

    pub fn written(&self) -> u64 {
        self.files.iter().map(|f| f.written).sum()
    }

    pub fn quarantined(&self) -> u64 {
        self.files.iter().map(|f| f.quarantined).sum()
    }

    pub fn drops(&self) -> u64 {
        self.files.iter().map(FileSummary::drops).sum()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub seed: Option<u64>,
    pub phases: Vec<PhaseReport>,
    pub stores: BTreeMap<Kind, StoreStats>,
    pub findings: Vec<Finding>,
}

impl Report {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Cannot create {:?}", parent))?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?).with_context(|| format!("Cannot write {:?}", path))
    }
}
