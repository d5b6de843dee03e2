//! Domain store: hierarchy-preserving domain replacement.
//!
//! Replacements are built level by level from the TLD towards the leaf, so
//! `a.sub.example.com` and `b.sub.example.com` share the replacement of
//! `sub.example.com`. Every level is an entry of the same table.

use rand::RngCore;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, error};

use super::{load_map, words, Kind, Store, StoreStats, Table};
use crate::config::DomainConfig;
use crate::error::{Error, Result};
use crate::store::ip::parse_ipv4;

const MAX_ATTEMPTS: usize = 1000;

/// Generic and country-code top level domains.
const TLDS: &str = "\
    com net org edu gov mil int arpa info biz name pro aero coop museum mobi asia tel travel jobs cat post xxx \
    app dev io cloud online site tech store shop blog local lan localdomain home corp internal \
    ac ad ae af ag ai al am ao aq ar as at au aw ax az ba bb bd be bf bg bh bi bj bm bn bo br bs bt bw by bz \
    ca cc cd cf cg ch ci ck cl cm cn co cr cu cv cw cx cy cz de dj dk dm do dz ec ee eg er es et eu fi fj fk \
    fm fo fr ga gd ge gf gg gh gi gl gm gn gp gq gr gs gt gu gw gy hk hm hn hr ht hu id ie il im in iq ir is \
    it je jm jo jp ke kg kh ki km kn kp kr kw ky kz la lb lc li lk lr ls lt lu lv ly ma mc md me mg mh mk ml \
    mm mn mo mp mq mr ms mt mu mv mw mx my mz na nc ne nf ng ni nl no np nr nu nz om pa pe pf pg ph pk pl pm \
    pn pr ps pt pw py qa re ro rs ru rw sa sb sc sd se sg sh si sk sl sm sn so sr ss st su sv sx sy sz tc td \
    tf tg th tj tk tl tm tn to tr tt tv tw tz ua ug uk us uy uz va vc ve vg vi vn vu wf ws ye yt za zm zw";

pub struct DomainStore {
    domains: Table,
    tlds: HashSet<&'static str>,
    /// Configured suffixes, longest first.
    extra_tlds: Vec<String>,
    special_char: Vec<char>,
    exclusion: HashSet<String>,
    find_re: Regex,
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

impl DomainStore {
    pub fn new(conf: &DomainConfig) -> Result<Self> {
        let mut extra_tlds: Vec<String> =
            conf.tlds.iter().map(|t| t.trim_matches('.').to_lowercase()).filter(|t| !t.is_empty()).collect();
        extra_tlds.sort_by_key(|t| std::cmp::Reverse(t.len()));
        let find_re = Regex::new(r"[A-Za-z0-9_](?:[A-Za-z0-9_-]*[A-Za-z0-9_])?(?:\.[A-Za-z0-9_](?:[A-Za-z0-9_-]*[A-Za-z0-9_])?)+")
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            domains: Table::default(),
            tlds: TLDS.split_whitespace().collect(),
            extra_tlds,
            special_char: conf.special_char.iter().flat_map(|s| s.chars()).collect(),
            exclusion: conf.exclusion.iter().map(|d| d.to_lowercase()).collect(),
            find_re,
        })
    }

    /// The known TLD suffix of a lowercase domain.
    pub fn tld_of(&self, domain: &str) -> Option<String> {
        for t in &self.extra_tlds {
            if domain.ends_with(&format!(".{}", t)) {
                return Some(t.clone());
            }
        }
        let last = domain.rsplit('.').next()?;
        self.tlds.contains(last).then(|| last.to_string())
    }

    fn new_label(&self, label: &str, rng: &mut dyn RngCore) -> String {
        let specials = &self.special_char;
        words::shape_like_with(rng, label, &|c| specials.contains(&c))
    }

    /// Resolves `domain` and every level between it and its TLD.
    pub fn generate_domain(&mut self, domain: &str, rng: &mut dyn RngCore) -> Result<()> {
        let tld = self.tld_of(domain).ok_or_else(|| Error::InvalidValue { store: Kind::Domain.as_str(), value: domain.to_string() })?;
        if domain.len() <= tld.len() {
            self.domains.resolve(domain, domain.to_string());
            return Ok(());
        }
        let head = &domain[..domain.len() - tld.len() - 1];
        let mut level = tld.clone();
        let mut repl = tld;
        for label in head.rsplit('.') {
            level = format!("{}.{}", label, level);
            if let Some(r) = self.domains.get(&level) {
                repl = r.to_string();
                continue;
            }
            let candidate = if self.exclusion.contains(&level) {
                level.clone()
            } else {
                let mut found = None;
                for _ in 0..MAX_ATTEMPTS {
                    let c = format!("{}.{}", self.new_label(label, rng), repl);
                    if !self.domains.contains(&c) && !self.domains.is_replacement(&c) {
                        found = Some(c);
                        break;
                    }
                }
                found.ok_or_else(|| Error::GenerationExhausted { store: Kind::Domain.as_str(), value: level.clone() })?
            };
            debug!("domain {} → {}", level, candidate);
            self.domains.resolve(&level, candidate.clone());
            repl = candidate;
        }
        Ok(())
    }
}

impl Store for DomainStore {
    fn kind(&self) -> Kind {
        Kind::Domain
    }

    fn is_valid(&self, value: &str) -> bool {
        if parse_ipv4(value).is_some() || value.len() > 253 {
            return false;
        }
        let labels: Vec<&str> = value.split('.').collect();
        if labels.len() < 2 || !labels.iter().all(|l| valid_label(l)) {
            return false;
        }
        let last = labels[labels.len() - 1];
        if !last.bytes().all(|b| b.is_ascii_alphabetic()) {
            return false;
        }
        let lower = value.to_lowercase();
        match self.tld_of(&lower) {
            Some(t) => t.len() < lower.len(),
            None => false,
        }
    }

    fn add_value(&mut self, value: &str) -> Result<()> {
        if !self.is_valid(value) {
            return Err(Error::InvalidValue { store: Kind::Domain.as_str(), value: value.to_string() });
        }
        self.domains.insert(value.to_lowercase());
        Ok(())
    }

    fn find_values(&self, text: &str) -> Vec<String> {
        self.find_re
            .find_iter(text)
            .filter(|m| {
                // Part of a longer token such as an address literal.
                let before = text[..m.start()].chars().next_back();
                !matches!(before, Some(c) if c.is_alphanumeric() || c == '.' || c == '-')
            })
            .map(|m| m.as_str())
            .filter(|v| self.is_valid(v))
            .map(str::to_string)
            .collect()
    }

    fn has_value(&self, value: &str) -> bool {
        self.domains.contains(&value.to_lowercase())
    }

    fn has_replacement(&self, value: &str) -> bool {
        self.domains.is_replacement(&value.to_lowercase())
    }

    /// The replacement follows the letter case of `value`.
    fn get_replacement(&self, value: &str) -> Result<String> {
        self.domains
            .get(&value.to_lowercase())
            .map(|r| words::apply_case(value, r))
            .ok_or_else(|| Error::NotFound { store: Kind::Domain.as_str(), value: value.to_string() })
    }

    fn generate(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        for domain in self.domains.unresolved() {
            if self.exclusion.contains(&domain) {
                self.domains.resolve(&domain, domain.clone());
                continue;
            }
            self.generate_domain(&domain, rng).map_err(|e| {
                error!("Failed to generate a replacement, domain = '{}': {}", domain, e);
                e
            })?;
        }
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.domains.stats()
    }

    fn load(&mut self, yaml: &str) -> anyhow::Result<()> {
        let map = load_map(yaml)?
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .filter(|(k, _)| {
                let ok = self.tld_of(k).is_some();
                if !ok {
                    error!("Invalid domain in domain.yml, skipped: '{}'", k);
                }
                ok
            })
            .collect();
        self.domains = Table::from_map(map);
        Ok(())
    }

    fn save(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(&self.domains.to_map())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn store(tlds: &[&str]) -> DomainStore {
        DomainStore::new(&DomainConfig {
            tlds: tlds.iter().map(|s| s.to_string()).collect(),
            special_char: vec!["-".into(), "_".into()],
            exclusion: vec!["example.org".into()],
        })
        .unwrap()
    }

    #[test]
    fn validity() {
        let s = store(&["voip.lab"]);
        assert!(s.is_valid("example.com"));
        assert!(s.is_valid("Sub.Example.COM"));
        assert!(s.is_valid("pbx-01.voip.lab"));
        assert!(!s.is_valid("voip.lab"));
        assert!(!s.is_valid("example.notatld"));
        assert!(!s.is_valid("com"));
        assert!(!s.is_valid("10.0.0.1"));
        assert!(!s.is_valid("-bad.example.com"));
        assert!(!s.is_valid("a..example.com"));
    }

    #[test]
    fn siblings_share_parent_replacement() {
        let mut s = store(&[]);
        s.add_value("a.sub.example.com").unwrap();
        s.add_value("b.sub.example.com").unwrap();
        s.generate(&mut StdRng::seed_from_u64(1)).unwrap();
        let a = s.get_replacement("a.sub.example.com").unwrap();
        let b = s.get_replacement("b.sub.example.com").unwrap();
        let parent = s.get_replacement("sub.example.com").unwrap();
        assert!(a.ends_with(&format!(".{}", parent)), "{} {}", a, parent);
        assert!(b.ends_with(&format!(".{}", parent)));
        assert!(parent.ends_with(".com"));
        assert_eq!(parent.len(), "sub.example.com".len());
        assert_ne!(a, b);
    }

    #[test]
    fn keeps_special_chars_and_digits() {
        let mut s = store(&["voip.lab"]);
        s.add_value("pbx-01.voip.lab").unwrap();
        s.generate(&mut StdRng::seed_from_u64(2)).unwrap();
        let r = s.get_replacement("pbx-01.voip.lab").unwrap();
        assert!(r.ends_with(".voip.lab"));
        assert_eq!(&r[3..4], "-");
        assert!(r[4..6].bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn case_insensitive_lookup() {
        let mut s = store(&[]);
        s.add_value("WWW.Example.com").unwrap();
        s.generate(&mut StdRng::seed_from_u64(3)).unwrap();
        assert!(s.has_value("www.example.COM"));
        let r = s.get_replacement("WWW.Example.com").unwrap();
        assert!(r[..3].bytes().all(|b| b.is_ascii_uppercase()));
        assert_eq!(r.to_lowercase(), s.get_replacement("www.example.com").unwrap());
    }

    #[test]
    fn excluded_levels_are_identity() {
        let mut s = store(&[]);
        s.add_value("www.example.org").unwrap();
        s.generate(&mut StdRng::seed_from_u64(4)).unwrap();
        assert_eq!(s.get_replacement("example.org").unwrap(), "example.org");
        let r = s.get_replacement("www.example.org").unwrap();
        assert!(r.ends_with(".example.org"));
        assert_ne!(r, "www.example.org");
    }

    #[test]
    fn find_in_text() {
        let s = store(&[]);
        let v = s.find_values("INVITE sip:alice@pbx.example.com SIP/2.0 via 10.1.1.1 host.bogus");
        assert_eq!(v, vec!["pbx.example.com".to_string()]);
    }
}
