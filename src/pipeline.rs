//! The four phases over a project: Discover, Generate, Anonymize, Validate.
//!
//! Stores are loaded from `data/` when the pipeline opens and saved after
//! every phase that changes them, so phases can run in separate processes.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::files::{self, pcap, text, FileKind};
use crate::packet::{Phase, Walker};
use crate::project::Project;
use crate::report::{write_findings_csv, FileSummary, PhaseReport, Report};
use crate::store::StoreRegistry;

pub struct Pipeline {
    project: Project,
    config: Config,
    stores: StoreRegistry,
    walker: Walker,
    seed: Option<u64>,
    report: Report,
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        debug!("Clearing {:?}", dir);
        fs::remove_dir_all(dir).with_context(|| format!("Cannot remove {:?}", dir))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("Cannot create {:?}", dir))
}

impl Pipeline {
    pub fn open(project: Project, seed: Option<u64>) -> Result<Self> {
        let config = project.load_config()?;
        let stores = project.load_stores(&config)?;
        let walker = Walker::new(&config.packet).context("Invalid packet configuration")?;
        Ok(Self { project, config, stores, walker, seed, report: Report { seed, ..Report::default() } })
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    fn finish_phase(&mut self, phase: Phase, files: Vec<FileSummary>) -> Result<()> {
        let layers = self.walker.take_counters();
        self.report.phases.push(PhaseReport { phase, files, layers });
        self.report.stores = self.stores.stats();
        self.report.write_json(&self.project.report_path())
    }

    pub fn discover(&mut self) -> Result<()> {
        info!("Discover: scanning {:?}", self.project.input());
        self.walker.take_counters();
        let mut summaries = Vec::new();
        for file in files::collect(&self.project.input(), &self.config.file)? {
            let path = self.project.input().join(&file.path);
            let mut summary = FileSummary::new(&file.path, file.kind);
            match file.kind {
                FileKind::Pcap => pcap::discover(&path, &mut self.walker, &mut self.stores, &mut summary)?,
                FileKind::Text => text::discover(&path, &mut self.stores, &mut summary)?,
            }
            info!("{:?}: {} records scanned", file.path, summary.records);
            summaries.push(summary);
        }
        self.project.save_stores(&self.stores)?;
        self.finish_phase(Phase::Discover, summaries)
    }

    /// Resolves every unresolved store entry. Existing replacements are kept.
    pub fn generate(&mut self) -> Result<()> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        info!("Generate: resolving replacements");
        self.stores.generate_all(&mut rng).context("Replacement generation failed")?;
        self.project.save_stores(&self.stores)?;
        self.report.stores = self.stores.stats();
        for (kind, stats) in &self.report.stores {
            info!("{}: {} values, {} resolved", kind, stats.values, stats.resolved);
        }
        self.report.write_json(&self.project.report_path())
    }

    pub fn anonymize(&mut self) -> Result<()> {
        let (input, output, trash) = (self.project.input(), self.project.output(), self.project.trash());
        info!("Anonymize: {:?} → {:?}", input, output);
        reset_dir(&output)?;
        reset_dir(&trash)?;
        self.walker.take_counters();
        let mut summaries = Vec::new();
        for file in files::collect(&input, &self.config.file)? {
            let path = input.join(&file.path);
            let mut summary = FileSummary::new(&file.path, file.kind);
            match file.kind {
                FileKind::Pcap => pcap::anonymize(
                    &path,
                    &file.path,
                    &output,
                    &trash,
                    &mut self.walker,
                    &mut self.stores,
                    &mut summary,
                )?,
                FileKind::Text => text::anonymize(&path, &file.path, &output, &trash, &self.stores, &mut summary)?,
            }
            summaries.push(summary);
        }
        self.finish_phase(Phase::Anonymize, summaries)
    }

    /// Checks every anonymized file for original values and writes
    /// `validation/findings.csv`.
    pub fn validate(&mut self) -> Result<()> {
        let (output, validation) = (self.project.output(), self.project.validation());
        info!("Validate: checking {:?}", output);
        reset_dir(&validation)?;
        self.walker.take_counters();
        let mut summaries = Vec::new();
        let mut findings = Vec::new();
        for file in files::collect(&output, &self.config.file)? {
            let mut summary = FileSummary::new(&file.path, file.kind);
            match file.kind {
                FileKind::Pcap => pcap::validate(
                    &file.path,
                    &output,
                    &validation,
                    &mut self.walker,
                    &mut self.stores,
                    &mut summary,
                    &mut findings,
                )?,
                FileKind::Text => {
                    text::validate(&file.path, &output, &validation, &mut self.stores, &mut summary, &mut findings)?
                }
            }
            summaries.push(summary);
        }
        for f in &findings {
            warn!("Validation failure: {}, {}, store = '{}', value = '{}'", f.file, f.location, f.store, f.value);
        }
        write_findings_csv(&findings, &self.project.findings_path())?;
        info!("{} residual values found", findings.len());
        self.report.findings = findings;
        self.finish_phase(Phase::Validate, summaries)
    }

    pub fn run(&mut self) -> Result<()> {
        self.discover()?;
        self.generate()?;
        self.anonymize()?;
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Kind;

    fn project(log: &str) -> (tempfile::TempDir, Project) {
        let dir = tempfile::tempdir().unwrap();
        let project = Project::new(dir.path());
        project.init().unwrap();
        fs::write(project.input().join("call.log"), log).unwrap();
        (dir, project)
    }

    #[test]
    fn seeded_runs_agree() {
        let log = "REGISTER from 192.168.1.20 at pbx.example.com\n";
        let (_a, first) = project(log);
        let (_b, second) = project(log);
        for p in [&first, &second] {
            Pipeline::open(p.clone(), Some(42)).unwrap().run().unwrap();
        }
        let one = fs::read_to_string(first.output().join("call.log")).unwrap();
        let two = fs::read_to_string(second.output().join("call.log")).unwrap();
        assert_eq!(one, two);
        assert!(!one.contains("192.168.1.20"));
    }

    #[test]
    fn stores_persist_between_invocations() {
        let (_dir, p) = project("peer 172.16.67.128 up\n");
        let mut first = Pipeline::open(p.clone(), Some(1)).unwrap();
        first.discover().unwrap();
        first.generate().unwrap();
        let fake = first.stores().get_replacement(Kind::Ip, "172.16.67.128").unwrap();
        assert!(fake.starts_with("10."));

        let mut second = Pipeline::open(p.clone(), None).unwrap();
        second.anonymize().unwrap();
        second.validate().unwrap();
        assert_eq!(fs::read_to_string(p.output().join("call.log")).unwrap(), format!("peer {} up\n", fake));
        assert!(second.report().findings.is_empty());
        assert_eq!(second.report().phases.len(), 2);
        assert!(p.findings_path().exists());
        assert!(p.report_path().exists());
    }
}
