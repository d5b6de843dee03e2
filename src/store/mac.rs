//! MAC store: vendor-preserving address replacement.

use rand::{Rng, RngCore};
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, error};

use super::{load_map, Kind, Store, StoreStats, Table};
use crate::config::MacConfig;
use crate::error::{Error, Result};

const MAX_ATTEMPTS: usize = 1000;

/// How an address was written, so the replacement can be written the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacStyle {
    sep: Option<char>,
    /// Hex digits per group: 2 (`aa:bb:..`), 4 (`aabb.ccdd.eeff`) or 12 (bare).
    group: usize,
    upper: bool,
}

impl Default for MacStyle {
    fn default() -> Self {
        Self { sep: Some(':'), group: 2, upper: false }
    }
}

pub fn parse_mac(s: &str) -> Option<([u8; 6], MacStyle)> {
    let upper = s.bytes().any(|b| b.is_ascii_uppercase());
    let (sep, group) = match s.len() {
        17 => {
            let sep = s.chars().nth(2)?;
            if !matches!(sep, ':' | '-' | '.') {
                return None;
            }
            (Some(sep), 2)
        }
        14 => (Some('.'), 4),
        12 => (None, 12),
        _ => return None,
    };
    let hex: String = match sep {
        Some(c) => {
            let parts: Vec<&str> = s.split(c).collect();
            if parts.len() != 12 / group || parts.iter().any(|p| p.len() != group) {
                return None;
            }
            parts.concat()
        }
        None => s.to_string(),
    };
    if hex.len() != 12 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut out = [0u8; 6];
    for (i, o) in out.iter_mut().enumerate() {
        *o = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some((out, MacStyle { sep, group, upper }))
}

pub fn fmt_mac(b: &[u8; 6], style: MacStyle) -> String {
    let hex: String = b.iter().map(|x| format!("{:02x}", x)).collect();
    let hex = if style.upper { hex.to_uppercase() } else { hex };
    match style.sep {
        Some(sep) => {
            let groups: Vec<&str> = (0..12 / style.group).map(|i| &hex[i * style.group..(i + 1) * style.group]).collect();
            groups.join(&sep.to_string())
        }
        None => hex,
    }
}

fn canonical(b: &[u8; 6]) -> String {
    fmt_mac(b, MacStyle::default())
}

pub struct MacStore {
    macs: Table,
    exclusion: HashSet<String>,
    find_re: Regex,
}

impl MacStore {
    pub fn new(conf: &MacConfig) -> Result<Self> {
        let mut exclusion = HashSet::new();
        for e in &conf.exclusion {
            let (b, _) = parse_mac(e).ok_or_else(|| Error::Config(format!("invalid MAC exclusion '{}'", e)))?;
            exclusion.insert(canonical(&b));
        }
        exclusion.insert(canonical(&[0xff; 6]));
        exclusion.insert(canonical(&[0x00; 6]));
        let find_re = Regex::new(
            r"\b(?:(?:[0-9A-Fa-f]{2}[:.-]){5}[0-9A-Fa-f]{2}|[0-9A-Fa-f]{4}\.[0-9A-Fa-f]{4}\.[0-9A-Fa-f]{4})\b",
        )
        .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self { macs: Table::default(), exclusion, find_re })
    }

    fn key(value: &str) -> Option<String> {
        parse_mac(value).map(|(b, _)| canonical(&b))
    }

    pub fn generate_mac(&self, mac: &[u8; 6], rng: &mut dyn RngCore) -> Result<String> {
        for _ in 0..MAX_ATTEMPTS {
            let mut b = *mac;
            b[3] = rng.gen_range(0..0x80);
            b[4] = rng.gen();
            b[5] = rng.gen();
            let c = canonical(&b);
            if !self.macs.contains(&c) && !self.macs.is_replacement(&c) {
                return Ok(c);
            }
        }
        Err(Error::GenerationExhausted { store: Kind::Mac.as_str(), value: canonical(mac) })
    }
}

impl Store for MacStore {
    fn kind(&self) -> Kind {
        Kind::Mac
    }

    fn is_valid(&self, value: &str) -> bool {
        parse_mac(value).is_some()
    }

    fn add_value(&mut self, value: &str) -> Result<()> {
        let key = Self::key(value).ok_or_else(|| Error::InvalidValue { store: Kind::Mac.as_str(), value: value.to_string() })?;
        self.macs.insert(key);
        Ok(())
    }

    fn find_values(&self, text: &str) -> Vec<String> {
        self.find_re.find_iter(text).map(|m| m.as_str().to_string()).filter(|v| self.is_valid(v)).collect()
    }

    fn has_value(&self, value: &str) -> bool {
        Self::key(value).map(|k| self.macs.contains(&k)).unwrap_or(false)
    }

    fn has_replacement(&self, value: &str) -> bool {
        Self::key(value).map(|k| self.macs.is_replacement(&k)).unwrap_or(false)
    }

    /// The replacement is written in the separator style and case of `value`.
    fn get_replacement(&self, value: &str) -> Result<String> {
        let not_found = || Error::NotFound { store: Kind::Mac.as_str(), value: value.to_string() };
        let (b, style) = parse_mac(value).ok_or_else(not_found)?;
        let repl = self.macs.get(&canonical(&b)).ok_or_else(not_found)?;
        let (rb, _) = parse_mac(repl).ok_or_else(not_found)?;
        Ok(fmt_mac(&rb, style))
    }

    fn generate(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        for key in self.macs.unresolved() {
            let Some((b, _)) = parse_mac(&key) else { continue };
            let repl = if self.exclusion.contains(&key) { key.clone() } else { self.generate_mac(&b, rng)? };
            debug!("mac {} → {}", key, repl);
            self.macs.resolve(&key, repl);
        }
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.macs.stats()
    }

    fn load(&mut self, yaml: &str) -> anyhow::Result<()> {
        let mut map = std::collections::BTreeMap::new();
        for (k, v) in load_map(yaml)? {
            let Some(key) = Self::key(&k) else {
                error!("Invalid key in mac.yml, skipped: '{}'", k);
                continue;
            };
            let value = match v {
                Some(v) => match Self::key(&v) {
                    Some(v) => Some(v),
                    None => {
                        error!("Invalid value in mac.yml, skipped: '{}'", k);
                        continue;
                    }
                },
                None => None,
            };
            map.insert(key, value);
        }
        self.macs = Table::from_map(map);
        Ok(())
    }

    fn save(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(&self.macs.to_map())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn store() -> MacStore {
        MacStore::new(&MacConfig::default()).unwrap()
    }

    #[test]
    fn formats() {
        let s = store();
        for v in ["00:1a:2b:aa:bb:cc", "00-1A-2B-AA-BB-CC", "001a.2baa.bbcc", "001A2BAABBCC", "00.1a.2b.aa.bb.cc"] {
            assert!(s.is_valid(v), "{}", v);
        }
        assert!(!s.is_valid("00:1a:2b:aa:bb"));
        assert!(!s.is_valid("00:1a-2b:aa:bb:cc"));
        assert!(!s.is_valid("00:1a:2b:aa:bb:cg"));
    }

    #[test]
    fn oui_and_style_kept() {
        let mut s = store();
        s.add_value("00:1A:2B:AA:BB:CC").unwrap();
        s.generate(&mut StdRng::seed_from_u64(1)).unwrap();
        let r = s.get_replacement("00:1A:2B:AA:BB:CC").unwrap();
        assert!(r.starts_with("00:1A:2B:"), "{}", r);
        assert_ne!(r, "00:1A:2B:AA:BB:CC");
        let (b, _) = parse_mac(&r).unwrap();
        assert!(b[3] < 0x80);
        let dashed = s.get_replacement("00-1a-2b-aa-bb-cc").unwrap();
        assert_eq!(dashed, r.to_lowercase().replace(':', "-"));
        assert!(s.has_replacement(&dashed));
    }

    #[test]
    fn broadcast_is_identity() {
        let mut s = store();
        s.add_value("ff:ff:ff:ff:ff:ff").unwrap();
        s.generate(&mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(s.get_replacement("FF:FF:FF:FF:FF:FF").unwrap(), "FF:FF:FF:FF:FF:FF");
    }

    #[test]
    fn find_in_text() {
        let s = store();
        let v = s.find_values("arp who-has 10.0.0.1 tell 00:1a:2b:aa:bb:cc (cisco 001a.2baa.bbcc)");
        assert_eq!(v, vec!["00:1a:2b:aa:bb:cc".to_string(), "001a.2baa.bbcc".to_string()]);
    }
}
