//! The set of identifier stores used by one session.

use anyhow::Context;
use rand::RngCore;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::domain::DomainStore;
use super::ip::IpStore;
use super::mac::MacStore;
use super::name::NameStore;
use super::phone::PhoneStore;
use super::{Kind, Store, StoreStats};
use crate::config::DataConfig;
use crate::error::{Error, Result};

pub struct StoreRegistry {
    pub ip: IpStore,
    pub domain: DomainStore,
    pub phone: PhoneStore,
    pub mac: MacStore,
    pub name: NameStore,
    find_exclusion: Vec<Regex>,
    clean: bool,
}

impl StoreRegistry {
    pub fn new(conf: &DataConfig) -> Result<Self> {
        let find_exclusion = conf
            .global
            .find_exclusion
            .iter()
            .map(|r| Regex::new(r).map_err(|e| Error::Config(format!("find-exclusion '{}': {}", r, e))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ip: IpStore::new(&conf.ip)?,
            domain: DomainStore::new(&conf.domain)?,
            phone: PhoneStore::new(&conf.phone)?,
            mac: MacStore::new(&conf.mac)?,
            name: NameStore::new(&conf.name),
            find_exclusion,
            clean: false,
        })
    }

    pub fn store(&self, kind: Kind) -> &dyn Store {
        match kind {
            Kind::Ip => &self.ip,
            Kind::Domain => &self.domain,
            Kind::Phone => &self.phone,
            Kind::Mac => &self.mac,
            Kind::Name => &self.name,
        }
    }

    pub fn store_mut(&mut self, kind: Kind) -> &mut dyn Store {
        match kind {
            Kind::Ip => &mut self.ip,
            Kind::Domain => &mut self.domain,
            Kind::Phone => &mut self.phone,
            Kind::Mac => &mut self.mac,
            Kind::Name => &mut self.name,
        }
    }

    /// Names are the catch-all: a token valid for any other store is not a name.
    pub fn is_valid(&self, kind: Kind, value: &str) -> bool {
        match kind {
            Kind::Name => {
                self.name.is_valid(value)
                    && !Kind::ALL.iter().filter(|k| **k != Kind::Name).any(|k| self.store(*k).is_valid(value))
            }
            k => self.store(k).is_valid(value),
        }
    }

    pub fn add_value(&mut self, kind: Kind, value: &str) -> Result<()> {
        if !self.is_valid(kind, value) {
            return Err(Error::InvalidValue { store: kind.as_str(), value: value.to_string() });
        }
        self.store_mut(kind).add_value(value)
    }

    /// In clean mode every lookup yields the empty string.
    pub fn get_replacement(&self, kind: Kind, value: &str) -> Result<String> {
        if self.clean {
            return Ok(String::new());
        }
        self.store(kind).get_replacement(value)
    }

    pub fn has_value(&self, kind: Kind, value: &str) -> bool {
        self.store(kind).has_value(value)
    }

    pub fn has_replacement(&self, kind: Kind, value: &str) -> bool {
        self.store(kind).has_replacement(value)
    }

    /// The single store a raw token belongs to.
    pub fn guess(&self, value: &str) -> Result<Kind> {
        let candidates: Vec<Kind> = Kind::ALL.iter().copied().filter(|k| self.is_valid(*k, value)).collect();
        match candidates.as_slice() {
            [] => Err(Error::InvalidValue { store: "any", value: value.to_string() }),
            [k] => Ok(*k),
            _ => Err(Error::Ambiguous { value: value.to_string(), candidates }),
        }
    }

    pub fn add_guessed(&mut self, value: &str) -> Result<Kind> {
        let kind = self.guess(value)?;
        self.store_mut(kind).add_value(value)?;
        Ok(kind)
    }

    /// Every identifier found in `text`, after removing the globally
    /// excluded fragments. Duplicates are reported once.
    pub fn find_values(&self, text: &str) -> Vec<(Kind, String)> {
        let mut text = text.to_string();
        for re in &self.find_exclusion {
            text = re.replace_all(&text, " ").into_owned();
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for kind in Kind::ALL {
            for v in self.store(kind).find_values(&text) {
                if seen.insert((kind, v.clone())) {
                    out.push((kind, v));
                }
            }
        }
        out
    }

    /// Known originals still present in `text`. A value that is also some
    /// entry's replacement is not counted.
    pub fn residuals(&self, text: &str) -> Vec<(Kind, String)> {
        self.find_values(text)
            .into_iter()
            .filter(|(k, v)| self.has_value(*k, v) && !self.has_replacement(*k, v))
            .collect()
    }

    /// Generates in dependency-free order, one store at a time.
    pub fn generate_all(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        for kind in Kind::ALL {
            debug!("Generating replacements, store = '{}'", kind);
            self.store_mut(kind).generate(rng)?;
        }
        Ok(())
    }

    pub fn set_clean_mode(&mut self, clean: bool) {
        self.clean = clean;
    }

    pub fn is_clean(&self) -> bool {
        self.clean
    }

    pub fn stats(&self) -> BTreeMap<Kind, StoreStats> {
        Kind::ALL.iter().map(|k| (*k, self.store(*k).stats())).collect()
    }

    /// Loads `<kind>.yml` from `dir`; missing files are empty stores.
    pub fn load_dir(&mut self, dir: &Path) -> anyhow::Result<()> {
        for kind in Kind::ALL {
            let path = dir.join(format!("{}.yml", kind));
            if !path.exists() {
                continue;
            }
            let text = fs::read_to_string(&path).with_context(|| format!("Cannot read {:?}", path))?;
            self.store_mut(kind).load(&text).with_context(|| format!("Invalid store file {:?}", path))?;
            info!("Loaded {} {} values from {:?}", self.store(kind).stats().values, kind, path);
        }
        Ok(())
    }

    pub fn save_dir(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Cannot create {:?}", dir))?;
        for kind in Kind::ALL {
            let path = dir.join(format!("{}.yml", kind));
            let text = self.store(kind).save()?;
            fs::write(&path, text).with_context(|| format!("Cannot write {:?}", path))?;
        }
        Ok(())
    }
}
