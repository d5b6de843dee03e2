//! Name store: display names, user parts and other free-form identifiers.

use rand::RngCore;
use regex::Regex;
use std::collections::HashSet;
use tracing::debug;

use super::{load_map, words, Kind, Store, StoreStats, Table};
use crate::config::NameConfig;
use crate::error::{Error, Result};

const MAX_ATTEMPTS: usize = 1000;

pub struct NameStore {
    names: Table,
    special_char: Vec<char>,
    exclusion: HashSet<String>,
}

impl NameStore {
    pub fn new(conf: &NameConfig) -> Self {
        Self {
            names: Table::default(),
            special_char: conf.special_char.iter().flat_map(|s| s.chars()).collect(),
            exclusion: conf.exclusion.iter().map(|n| n.to_lowercase()).collect(),
        }
    }

    pub fn generate_name(&self, name: &str, rng: &mut dyn RngCore) -> Result<String> {
        let specials = &self.special_char;
        for _ in 0..MAX_ATTEMPTS {
            let c = words::shape_like_with(rng, name, &|c| specials.contains(&c)).to_lowercase();
            if !self.names.contains(&c) && !self.names.is_replacement(&c) {
                return Ok(c);
            }
        }
        Err(Error::GenerationExhausted { store: Kind::Name.as_str(), value: name.to_string() })
    }

    /// Known names, longest first, as one case-insensitive alternation.
    fn known_regex(&self) -> Option<Regex> {
        let mut keys: Vec<&String> = self.names.keys().collect();
        if keys.is_empty() {
            return None;
        }
        keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
        let alt: Vec<String> = keys.iter().map(|k| regex::escape(k)).collect();
        Regex::new(&format!(r"(?i)\b(?:{})\b", alt.join("|"))).ok()
    }
}

impl Store for NameStore {
    fn kind(&self) -> Kind {
        Kind::Name
    }

    /// Own grammar only. The registry also rules out the other identifier types.
    fn is_valid(&self, value: &str) -> bool {
        !value.trim().is_empty() && value.chars().any(char::is_alphabetic) && !value.chars().any(char::is_control)
    }

    fn add_value(&mut self, value: &str) -> Result<()> {
        if !self.is_valid(value) {
            return Err(Error::InvalidValue { store: Kind::Name.as_str(), value: value.to_string() });
        }
        self.names.insert(value.to_lowercase());
        Ok(())
    }

    /// Names are never guessed from free text, only known ones are found.
    fn find_values(&self, text: &str) -> Vec<String> {
        match self.known_regex() {
            Some(re) => re.find_iter(text).map(|m| m.as_str().to_string()).collect(),
            None => Vec::new(),
        }
    }

    fn has_value(&self, value: &str) -> bool {
        self.names.contains(&value.to_lowercase())
    }

    fn has_replacement(&self, value: &str) -> bool {
        self.names.is_replacement(&value.to_lowercase())
    }

    fn get_replacement(&self, value: &str) -> Result<String> {
        self.names
            .get(&value.to_lowercase())
            .map(|r| words::apply_case(value, r))
            .ok_or_else(|| Error::NotFound { store: Kind::Name.as_str(), value: value.to_string() })
    }

    fn generate(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        for name in self.names.unresolved() {
            let repl = if self.exclusion.contains(&name) { name.clone() } else { self.generate_name(&name, rng)? };
            debug!("name {} → {}", name, repl);
            self.names.resolve(&name, repl);
        }
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.names.stats()
    }

    fn load(&mut self, yaml: &str) -> anyhow::Result<()> {
        let map = load_map(yaml)?.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect();
        self.names = Table::from_map(map);
        Ok(())
    }

    fn save(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(&self.names.to_map())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn store() -> NameStore {
        NameStore::new(&NameConfig { exclusion: vec!["anonymous".into()], ..NameConfig::default() })
    }

    #[test]
    fn same_shape_and_case() {
        let mut s = store();
        s.add_value("Alice Smith").unwrap();
        s.generate(&mut StdRng::seed_from_u64(1)).unwrap();
        let r = s.get_replacement("Alice Smith").unwrap();
        assert_eq!(r.len(), 11);
        assert_eq!(&r[5..6], " ");
        assert!(r.as_bytes()[0].is_ascii_uppercase());
        assert!(r.as_bytes()[6].is_ascii_uppercase());
        assert!(r.as_bytes()[1].is_ascii_lowercase());
        assert_eq!(s.get_replacement("alice smith").unwrap(), r.to_lowercase());
        assert!(s.has_replacement(&r));
    }

    #[test]
    fn validity() {
        let s = store();
        assert!(s.is_valid("bob"));
        assert!(s.is_valid("Zoë"));
        assert!(!s.is_valid("12345"));
        assert!(!s.is_valid("   "));
        assert!(!s.is_valid("bob\n"));
    }

    #[test]
    fn finds_only_known_names() {
        let mut s = store();
        assert!(s.find_values("Call from Alice to Bob").is_empty());
        s.add_value("alice").unwrap();
        s.add_value("bob.jones").unwrap();
        let v = s.find_values("Call from ALICE to bob.jones (not alicex)");
        assert_eq!(v, vec!["ALICE".to_string(), "bob.jones".to_string()]);
    }

    #[test]
    fn excluded_name_is_identity() {
        let mut s = store();
        s.add_value("Anonymous").unwrap();
        s.generate(&mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(s.get_replacement("Anonymous").unwrap(), "Anonymous");
    }
}
