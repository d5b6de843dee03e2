//! Phone store: numbers grouped by code, codes share replacement prefixes.
//!
//! A code is a literal prefix followed by a run of wildcards, persisted as
//! `+41261234xxx`. Numbers covered by the same code get the same replaced
//! prefix and keep their own trailing characters.

use rand::{Rng, RngCore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, error};

use super::{Kind, Store, StoreStats, Table};
use crate::config::PhoneConfig;
use crate::error::{Error, Result};

const MAX_ATTEMPTS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Code {
    pub literal: String,
    pub wildcards: usize,
}

impl Code {
    pub fn parse(s: &str) -> Option<Self> {
        let literal = s.trim_end_matches('x');
        let wildcards = s.len() - literal.len();
        if literal.is_empty() || !literal.chars().all(phone_char) {
            return None;
        }
        Some(Self { literal: literal.to_string(), wildcards })
    }

    pub fn covers(&self, number: &str) -> bool {
        number.starts_with(&self.literal) && number.len() == self.literal.len() + self.wildcards
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.literal, "x".repeat(self.wildcards))
    }
}

fn phone_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '+' | '#' | '*')
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PhoneFile {
    #[serde(default)]
    numbers: BTreeMap<String, Option<String>>,
    #[serde(default)]
    codes: BTreeMap<String, Option<String>>,
}

pub struct PhoneStore {
    numbers: Table,
    codes: BTreeMap<Code, Option<String>>,
    formats: Vec<Regex>,
    digit_preserved: usize,
    exclusion: HashSet<String>,
    find_re: Regex,
}

impl PhoneStore {
    pub fn new(conf: &PhoneConfig) -> Result<Self> {
        let formats = conf
            .formats
            .iter()
            .map(|f| Regex::new(f).map_err(|e| Error::Config(format!("phone format '{}': {}", f, e))))
            .collect::<Result<Vec<_>>>()?;
        let find_re = Regex::new(r"\+?[0-9][0-9#*]*").map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            numbers: Table::default(),
            codes: BTreeMap::new(),
            formats,
            digit_preserved: conf.digit_preserved,
            exclusion: conf.exclusion.iter().cloned().collect(),
            find_re,
        })
    }

    pub fn add_code(&mut self, code: Code) {
        self.codes.entry(code).or_insert(None);
    }

    pub fn code_replacement(&self, code: &Code) -> Option<&str> {
        self.codes.get(code).and_then(|r| r.as_deref())
    }

    /// Creates a code for every number not covered by an existing one.
    pub fn discover_codes(&mut self) {
        let mut found = Vec::new();
        for number in self.numbers.keys() {
            if self.exclusion.contains(number) || self.codes.keys().any(|c| c.covers(number)) {
                continue;
            }
            let wildcards = self.digit_preserved.min(number.len().saturating_sub(1));
            let literal = number[..number.len() - wildcards].to_string();
            found.push(Code { literal, wildcards });
        }
        for code in found {
            debug!("Discovered phone code {}", code);
            self.add_code(code);
        }
    }

    fn resolved_supercode(&self, code: &Code) -> Option<(&Code, &str)> {
        self.codes
            .iter()
            .filter_map(|(c, r)| r.as_deref().map(|r| (c, r)))
            .filter(|(c, _)| c.literal.len() < code.literal.len() && code.literal.starts_with(&c.literal))
            .max_by_key(|(c, _)| c.literal.len())
    }

    pub fn generate_code_replacement(&self, code: &Code, rng: &mut dyn RngCore) -> Result<String> {
        let (head, gap) = match self.resolved_supercode(code) {
            Some((sup, repl)) => (repl.to_string(), &code.literal[sup.literal.len()..]),
            None => (String::new(), code.literal.as_str()),
        };
        let taken: HashSet<&str> = self
            .codes
            .iter()
            .filter(|(c, _)| c.wildcards == code.wildcards)
            .filter_map(|(_, r)| r.as_deref())
            .collect();
        for _ in 0..MAX_ATTEMPTS {
            let mut candidate = head.clone();
            for c in gap.chars() {
                if c.is_ascii_digit() {
                    candidate.push(char::from(b'0' + rng.gen_range(0..10u8)));
                } else {
                    candidate.push(c);
                }
            }
            if !taken.contains(candidate.as_str()) {
                return Ok(candidate);
            }
        }
        Err(Error::GenerationExhausted { store: Kind::Phone.as_str(), value: code.to_string() })
    }

    pub fn generate_number_replacement(&self, number: &str) -> Result<String> {
        let (code, repl) = self
            .codes
            .iter()
            .filter_map(|(c, r)| r.as_deref().map(|r| (c, r)))
            .filter(|(c, _)| c.covers(number))
            .max_by_key(|(c, _)| c.literal.len())
            .ok_or_else(|| Error::NotFound { store: Kind::Phone.as_str(), value: number.to_string() })?;
        Ok(format!("{}{}", repl, &number[code.literal.len()..]))
    }

    /// Isolated numeric run: not glued to letters, dots or other digits.
    fn isolated(text: &str, start: usize, end: usize) -> bool {
        let before = text[..start].chars().next_back();
        let mut after = text[end..].chars();
        let next = after.next();
        let glued_before = before.map(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | '+')).unwrap_or(false);
        let glued_after = match next {
            Some('.') => after.next().map(|c| c.is_ascii_digit()).unwrap_or(false),
            Some(c) => c.is_alphanumeric() || c == '_',
            None => false,
        };
        !glued_before && !glued_after
    }
}

impl Store for PhoneStore {
    fn kind(&self) -> Kind {
        Kind::Phone
    }

    fn is_valid(&self, value: &str) -> bool {
        !value.is_empty()
            && value.chars().all(phone_char)
            && value.chars().any(|c| c.is_ascii_digit())
            && self.formats.iter().any(|f| f.is_match(value))
    }

    fn add_value(&mut self, value: &str) -> Result<()> {
        if !self.is_valid(value) {
            return Err(Error::InvalidValue { store: Kind::Phone.as_str(), value: value.to_string() });
        }
        self.numbers.insert(value);
        Ok(())
    }

    fn find_values(&self, text: &str) -> Vec<String> {
        self.find_re
            .find_iter(text)
            .filter(|m| Self::isolated(text, m.start(), m.end()))
            .map(|m| m.as_str())
            .filter(|v| self.is_valid(v))
            .map(str::to_string)
            .collect()
    }

    fn has_value(&self, value: &str) -> bool {
        self.numbers.contains(value)
    }

    fn has_replacement(&self, value: &str) -> bool {
        self.numbers.is_replacement(value)
    }

    fn get_replacement(&self, value: &str) -> Result<String> {
        self.numbers
            .get(value)
            .map(str::to_string)
            .ok_or_else(|| Error::NotFound { store: Kind::Phone.as_str(), value: value.to_string() })
    }

    fn generate(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        self.discover_codes();

        // Shorter literals first so longer codes find their supercode resolved.
        let mut pending: Vec<Code> = self.codes.iter().filter(|(_, r)| r.is_none()).map(|(c, _)| c.clone()).collect();
        pending.sort_by_key(|c| c.literal.len());
        for code in pending {
            let repl = self.generate_code_replacement(&code, rng).map_err(|e| {
                error!("Failed to generate a replacement, code = '{}': {}", code, e);
                e
            })?;
            debug!("code {} → {}", code, repl);
            self.codes.insert(code, Some(repl));
        }

        for number in self.numbers.unresolved() {
            let repl = if self.exclusion.contains(&number) {
                number.clone()
            } else {
                self.generate_number_replacement(&number)?
            };
            self.numbers.resolve(&number, repl);
        }
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.numbers.stats()
    }

    fn load(&mut self, yaml: &str) -> anyhow::Result<()> {
        let file: PhoneFile =
            if yaml.trim().is_empty() { PhoneFile::default() } else { serde_yaml::from_str::<Option<PhoneFile>>(yaml)?.unwrap_or_default() };
        let numbers = file
            .numbers
            .into_iter()
            .filter(|(n, _)| {
                let ok = n.chars().all(phone_char);
                if !ok {
                    error!("Invalid number in phone.yml, skipped: '{}'", n);
                }
                ok
            })
            .collect();
        self.numbers = Table::from_map(numbers);
        self.codes.clear();
        for (c, r) in file.codes {
            let Some(code) = Code::parse(&c) else {
                error!("Invalid code in phone.yml, skipped: '{}'", c);
                continue;
            };
            // Replacements are persisted in the same wildcard form as keys.
            let repl = r.map(|r| r.trim_end_matches('x').to_string());
            self.codes.insert(code, repl);
        }
        Ok(())
    }

    fn save(&self) -> anyhow::Result<String> {
        let file = PhoneFile {
            numbers: self.numbers.to_map(),
            codes: self
                .codes
                .iter()
                .map(|(c, r)| (c.to_string(), r.as_ref().map(|r| format!("{}{}", r, "x".repeat(c.wildcards)))))
                .collect(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn store() -> PhoneStore {
        PhoneStore::new(&PhoneConfig::default()).unwrap()
    }

    #[test]
    fn validity() {
        let s = store();
        assert!(s.is_valid("+41261234567"));
        assert!(s.is_valid("0261234567"));
        assert!(!s.is_valid("1234"));
        assert!(!s.is_valid("+41-26-123"));
        assert!(!s.is_valid("abc"));
        assert!(!s.is_valid("+"));
    }

    #[test]
    fn code_form() {
        let c = Code::parse("+41261234xxx").unwrap();
        assert_eq!(c.literal, "+41261234");
        assert_eq!(c.wildcards, 3);
        assert!(c.covers("+41261234567"));
        assert!(!c.covers("+4126123456"));
        assert_eq!(c.to_string(), "+41261234xxx");
    }

    #[test]
    fn numbers_sharing_a_code_share_prefix() {
        let mut s = store();
        s.add_value("+41261234567").unwrap();
        s.add_value("+41261234999").unwrap();
        s.generate(&mut StdRng::seed_from_u64(4)).unwrap();
        let a = s.get_replacement("+41261234567").unwrap();
        let b = s.get_replacement("+41261234999").unwrap();
        assert_eq!(a.len(), 12);
        assert_eq!(a[..9], b[..9]);
        assert!(a.ends_with("567"));
        assert!(b.ends_with("999"));
        assert!(a.starts_with('+'));
        assert_eq!(s.codes.len(), 1);
    }

    #[test]
    fn supercode_prefix_is_inherited() {
        let mut s = store();
        s.add_code(Code::parse("+4126xxxxxxx").unwrap());
        s.add_code(Code::parse("+41261234xxx").unwrap());
        s.add_value("+41261234567").unwrap();
        s.generate(&mut StdRng::seed_from_u64(8)).unwrap();
        let sup = s.code_replacement(&Code::parse("+4126xxxxxxx").unwrap()).unwrap().to_string();
        let sub = s.code_replacement(&Code::parse("+41261234xxx").unwrap()).unwrap();
        assert!(sub.starts_with(&sup));
        assert!(s.get_replacement("+41261234567").unwrap().starts_with(sub));
    }

    #[test]
    fn find_isolated_numbers() {
        let s = store();
        let v = s.find_values("From: <sip:+41261234567@10.0.0.1> tel 0791112233; ip 192.168.10.20 port 50600");
        assert_eq!(v, vec!["+41261234567".to_string(), "0791112233".to_string(), "50600".to_string()]);
    }

    #[test]
    fn excluded_number_is_identity() {
        let mut s = PhoneStore::new(&PhoneConfig { exclusion: vec!["112233".into()], ..PhoneConfig::default() }).unwrap();
        s.add_value("112233").unwrap();
        s.generate(&mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(s.get_replacement("112233").unwrap(), "112233");
        assert!(s.codes.is_empty());
    }

    #[test]
    fn persistence_round_trips_codes() {
        let mut s = store();
        s.add_value("0261234567").unwrap();
        s.generate(&mut StdRng::seed_from_u64(2)).unwrap();
        let yaml = s.save().unwrap();
        assert!(yaml.contains("0261234xxx"));
        let mut t = store();
        t.load(&yaml).unwrap();
        t.add_value("0261234000").unwrap();
        t.generate(&mut StdRng::seed_from_u64(3)).unwrap();
        let a = t.get_replacement("0261234567").unwrap();
        let b = t.get_replacement("0261234000").unwrap();
        assert_eq!(a[..7], b[..7]);
    }
}
