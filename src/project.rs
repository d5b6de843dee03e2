//! On-disk layout of a project directory.
//!
//! ```text
//! data/        config.yml and the persisted stores
//! in/          captures and logs to anonymize
//! out/         anonymized copies, same relative paths
//! trash/       quarantined packets and lines
//! validation/  clean renderings and findings.csv
//! report/      report.json
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{Config, DEFAULT_CONFIG};
use crate::store::StoreRegistry;

#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn input(&self) -> PathBuf {
        self.root.join("in")
    }

    pub fn output(&self) -> PathBuf {
        self.root.join("out")
    }

    pub fn trash(&self) -> PathBuf {
        self.root.join("trash")
    }

    pub fn validation(&self) -> PathBuf {
        self.root.join("validation")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.root.join("report")
    }

    pub fn config_path(&self) -> PathBuf {
        self.data().join("config.yml")
    }

    pub fn findings_path(&self) -> PathBuf {
        self.validation().join("findings.csv")
    }

    pub fn report_path(&self) -> PathBuf {
        self.report_dir().join("report.json")
    }

    /// Creates the layout; an existing configuration is left untouched.
    pub fn init(&self) -> Result<()> {
        for dir in [self.data(), self.input(), self.output(), self.trash(), self.validation(), self.report_dir()] {
            fs::create_dir_all(&dir).with_context(|| format!("Cannot create {:?}", dir))?;
        }
        let config = self.config_path();
        if config.exists() {
            info!("Keeping existing configuration {:?}", config);
        } else {
            fs::write(&config, DEFAULT_CONFIG).with_context(|| format!("Cannot write {:?}", config))?;
            info!("Wrote default configuration {:?}", config);
        }
        Ok(())
    }

    /// Removes everything the phases produce. `data/` and `in/` survive.
    pub fn clean(&self) -> Result<()> {
        for dir in [self.output(), self.trash(), self.validation(), self.report_dir()] {
            if dir.exists() {
                fs::remove_dir_all(&dir).with_context(|| format!("Cannot remove {:?}", dir))?;
                info!("Removed {:?}", dir);
            }
        }
        Ok(())
    }

    /// The project configuration, or the built-in default when none was written.
    pub fn load_config(&self) -> Result<Config> {
        let path = self.config_path();
        if path.exists() {
            Config::load(&path)
        } else {
            info!("No {:?}, using the default configuration", path);
            Config::from_yaml(DEFAULT_CONFIG)
        }
    }

    pub fn load_stores(&self, config: &Config) -> Result<StoreRegistry> {
        let mut stores = StoreRegistry::new(&config.data).context("Invalid store configuration")?;
        stores.load_dir(&self.data())?;
        Ok(stores)
    }

    pub fn save_stores(&self, stores: &StoreRegistry) -> Result<()> {
        stores.save_dir(&self.data())
    }
}
