//! Identifier stores: consistent original → replacement tables.
//!
//! Each store owns one identifier type. Discover inserts unresolved keys,
//! Generate fills their replacements, Anonymize and Validate only read.
//! A resolved replacement never changes for the lifetime of the persisted
//! table, so re-running against the same `data/` directory only adds
//! entries.

pub mod domain;
pub mod ip;
pub mod mac;
pub mod name;
pub mod phone;
pub mod registry;
pub mod words;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::Result;

pub use registry::StoreRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Ip,
    Domain,
    Phone,
    Mac,
    Name,
}

impl Kind {
    /// Disambiguation order used when guessing the type of a raw token.
    pub const ALL: [Kind; 5] = [Kind::Ip, Kind::Domain, Kind::Phone, Kind::Mac, Kind::Name];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Ip => "ip",
            Kind::Domain => "domain",
            Kind::Phone => "phone",
            Kind::Mac => "mac",
            Kind::Name => "name",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub values: usize,
    pub resolved: usize,
}

/// Common operations of every identifier store.
pub trait Store {
    fn kind(&self) -> Kind;

    fn is_valid(&self, value: &str) -> bool;

    /// Inserts `value` unresolved if it is new. Idempotent.
    fn add_value(&mut self, value: &str) -> Result<()>;

    /// Candidate tokens of this type found in free text.
    fn find_values(&self, text: &str) -> Vec<String>;

    fn has_value(&self, value: &str) -> bool;

    /// True when `value` is the replacement of some entry.
    fn has_replacement(&self, value: &str) -> bool;

    fn get_replacement(&self, value: &str) -> Result<String>;

    /// Resolves every unresolved entry.
    fn generate(&mut self, rng: &mut dyn RngCore) -> Result<()>;

    fn stats(&self) -> StoreStats;

    fn load(&mut self, yaml: &str) -> anyhow::Result<()>;

    fn save(&self) -> anyhow::Result<String>;
}

// ─── Table ────────────────────────────────────────────────────────────────────

/// Ordered value → replacement map with a reverse index of replacements.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: BTreeMap<String, Option<String>>,
    replacements: HashSet<String>,
}

impl Table {
    pub fn from_map(map: BTreeMap<String, Option<String>>) -> Self {
        let replacements = map.values().flatten().cloned().collect();
        Self { entries: map, replacements }
    }

    pub fn to_map(&self) -> BTreeMap<String, Option<String>> {
        self.entries.clone()
    }

    /// Returns true when the key was new.
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, None);
        true
    }

    /// Sets the replacement of `key` unless it is already resolved.
    pub fn resolve(&mut self, key: &str, replacement: String) {
        let slot = self.entries.entry(key.to_string()).or_insert(None);
        if slot.is_none() {
            self.replacements.insert(replacement.clone());
            *slot = Some(replacement);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|r| r.as_deref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_replacement(&self, value: &str) -> bool {
        self.replacements.contains(value)
    }

    pub fn unresolved(&self) -> Vec<String> {
        self.entries.iter().filter(|(_, r)| r.is_none()).map(|(k, _)| k.clone()).collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, Option<&String>)> {
        self.entries.iter().map(|(k, v)| (k, v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats { values: self.entries.len(), resolved: self.replacements_count() }
    }

    fn replacements_count(&self) -> usize {
        self.entries.values().filter(|r| r.is_some()).count()
    }
}

/// Parses a persisted `original: replacement` map.
pub fn load_map(yaml: &str) -> anyhow::Result<BTreeMap<String, Option<String>>> {
    if yaml.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let map: Option<BTreeMap<String, Option<String>>> = serde_yaml::from_str(yaml)?;
    Ok(map.unwrap_or_default())
}
