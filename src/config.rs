//! Project configuration (`data/config.yml`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Configuration written by `tracemask init`.
pub const DEFAULT_CONFIG: &str = include_str!("default_config.yml");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub data: DataConfig,
    pub file: FileConfig,
    pub packet: PacketConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Cannot read configuration {:?}", path))?;
        Self::from_yaml(&text).with_context(|| format!("Invalid configuration {:?}", path))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let conf: Config = serde_yaml::from_str(text).context("Failed to parse YAML configuration")?;
        Ok(conf)
    }
}

// ─── Stores ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DataConfig {
    pub global: GlobalDataConfig,
    pub ip: IpConfig,
    pub domain: DomainConfig,
    pub phone: PhoneConfig,
    pub mac: MacConfig,
    pub name: NameConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GlobalDataConfig {
    /// Regexes removed from free text before searching for values.
    pub find_exclusion: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IpConfig {
    /// Address blocks synthetic subnets are drawn from.
    pub blocks: Vec<String>,
    pub exclusion: Vec<String>,
}

impl Default for IpConfig {
    fn default() -> Self {
        Self { blocks: vec!["10.0.0.0/8".into()], exclusion: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DomainConfig {
    pub tlds: Vec<String>,
    pub special_char: Vec<String>,
    pub exclusion: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PhoneConfig {
    pub formats: Vec<String>,
    pub digit_preserved: usize,
    pub exclusion: Vec<String>,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            formats: vec![r"^\+?[0-9]{5,15}$".into()],
            digit_preserved: 3,
            exclusion: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MacConfig {
    pub exclusion: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NameConfig {
    pub special_char: Vec<String>,
    pub exclusion: Vec<String>,
}

impl Default for NameConfig {
    fn default() -> Self {
        Self {
            special_char: vec![" ".into(), ".".into(), "-".into(), "_".into()],
            exclusion: Vec::new(),
        }
    }
}

// ─── Files ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
    pub pcap: FileKindConfig,
    pub text: FileKindConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self { pcap: FileKindConfig { priority: 1 }, text: FileKindConfig { priority: 2 } }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileKindConfig {
    /// Lower numbers are processed first.
    pub priority: u32,
}

// ─── Layers ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PacketConfig {
    pub layers: BTreeMap<String, LayerConfig>,
}

/// `pass`, `drop`, or a field → action table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerConfig {
    Keyword(String),
    Fields(FieldsConfig),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FieldsConfig {
    pub fields: BTreeMap<String, String>,
    pub other_fields: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let conf = Config::from_yaml(DEFAULT_CONFIG).unwrap();
        assert_eq!(conf.data.phone.digit_preserved, 3);
        assert!(conf.data.ip.blocks.iter().any(|b| b == "10.0.0.0/8"));
        assert!(matches!(conf.packet.layers.get("Padding"), Some(LayerConfig::Keyword(k)) if k == "pass"));
        assert!(matches!(conf.packet.layers.get("ICMP"), Some(LayerConfig::Fields(_))));
    }

    #[test]
    fn missing_sections_use_defaults() {
        let conf = Config::from_yaml("data:\n  domain:\n    tlds: [lan]\n").unwrap();
        assert_eq!(conf.data.domain.tlds, vec!["lan"]);
        assert_eq!(conf.data.phone.digit_preserved, 3);
        assert_eq!(conf.file.pcap.priority, 1);
        assert!(conf.packet.layers.is_empty());
    }

    #[test]
    fn layer_policy_shapes() {
        let yaml = "packet:\n  layers:\n    Raw: drop\n    UDP:\n      fields: {sport: pass}\n      other-fields: pass\n";
        let conf = Config::from_yaml(yaml).unwrap();
        match conf.packet.layers.get("UDP") {
            Some(LayerConfig::Fields(f)) => {
                assert_eq!(f.fields.get("sport").map(String::as_str), Some("pass"));
                assert_eq!(f.other_fields.as_deref(), Some("pass"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
