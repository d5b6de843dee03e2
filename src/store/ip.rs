//! IPv4 store: subnet-preserving host replacement.
//!
//! Hosts are grouped into subnets (discovered /24s or pre-seeded entries).
//! Subnets are resolved from the shortest prefix to the longest so every
//! subnet can inherit the bytes of its already-resolved supernet, and hosts
//! take the leading bytes of the most specific resolved subnet.

use rand::seq::SliceRandom;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, error, warn};

use super::{Kind, Store, StoreStats, Table};
use crate::config::IpConfig;
use crate::error::{Error, Result};

const MAX_ATTEMPTS: usize = 1_000_000;

// ─── Addresses ────────────────────────────────────────────────────────────────

/// Strict dotted quad: four decimal octets 0–255, one to three digits each.
pub fn parse_ipv4(s: &str) -> Option<[u8; 4]> {
    let mut out = [0u8; 4];
    let mut parts = s.split('.');
    for o in out.iter_mut() {
        let p = parts.next()?;
        if p.is_empty() || p.len() > 3 || !p.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *o = p.parse::<u16>().ok().filter(|v| *v <= 255)? as u8;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

pub fn fmt_ipv4(b: &[u8; 4]) -> String {
    format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix as u32) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subnet {
    addr: u32,
    prefix: u8,
}

impl Subnet {
    pub fn new(addr: [u8; 4], prefix: u8) -> Self {
        let prefix = prefix.min(32);
        Self { addr: u32::from_be_bytes(addr) & mask(prefix), prefix }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a, p.parse::<u8>().ok().filter(|p| *p <= 32)?),
            None => (s, 32),
        };
        Some(Self::new(parse_ipv4(addr)?, prefix))
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn first(&self) -> [u8; 4] {
        self.addr.to_be_bytes()
    }

    pub fn last(&self) -> [u8; 4] {
        (self.addr | !mask(self.prefix)).to_be_bytes()
    }

    pub fn contains_addr(&self, addr: [u8; 4]) -> bool {
        u32::from_be_bytes(addr) & mask(self.prefix) == self.addr
    }

    /// True when `other` lies inside this subnet (equal subnets included).
    pub fn contains(&self, other: &Subnet) -> bool {
        other.prefix >= self.prefix && self.contains_addr(other.first())
    }

    /// Prefix rounded down to a byte boundary.
    fn rounded(&self) -> Subnet {
        Subnet::new(self.first(), self.prefix / 8 * 8)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", fmt_ipv4(&self.first()), self.prefix)
    }
}

/// Bytes a replacement keeps from a subnet of this prefix.
fn preserved_bytes(prefix: u8, what: &str, value: &str, subnet: &Subnet) -> usize {
    match prefix {
        0..=7 => {
            error!("Prefix too short to anonymize, {} = '{}', subnet = '{}'", what, value, subnet);
            0
        }
        8..=15 => {
            warn!("Weak anonymization, prefix is short, {} = '{}', subnet = '{}'", what, value, subnet);
            1
        }
        16..=23 => 2,
        24..=31 => 3,
        _ => 4,
    }
}

/// Values between `lo` and `hi` written with `width` decimal digits, or the
/// plain range when none exist.
fn same_width_range(lo: u8, hi: u8, width: usize) -> Vec<u8> {
    let (wlo, whi) = match width {
        1 => (0u16, 9u16),
        2 => (10, 99),
        _ => (100, 255),
    };
    let lo_w = (lo as u16).max(wlo);
    let hi_w = (hi as u16).min(whi);
    if lo_w <= hi_w {
        (lo_w..=hi_w).map(|v| v as u8).collect()
    } else {
        (lo..=hi).collect()
    }
}

// ─── Store ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct IpFile {
    #[serde(default)]
    hosts: BTreeMap<String, Option<String>>,
    #[serde(default)]
    subnets: BTreeMap<String, Option<String>>,
}

pub struct IpStore {
    hosts: Table,
    subnets: BTreeMap<Subnet, Option<Subnet>>,
    blocks: Vec<Subnet>,
    exclusion: Vec<Subnet>,
    find_re: Regex,
}

impl IpStore {
    pub fn new(conf: &IpConfig) -> Result<Self> {
        let parse = |s: &String| {
            Subnet::parse(s.trim()).ok_or_else(|| Error::Config(format!("invalid IPv4 network '{}'", s)))
        };
        let mut blocks = conf.blocks.iter().map(parse).collect::<Result<Vec<_>>>()?;
        // Longest prefix first; ties keep configuration order.
        blocks.sort_by(|a, b| b.prefix.cmp(&a.prefix));
        let exclusion = conf.exclusion.iter().map(parse).collect::<Result<Vec<_>>>()?;
        let find_re = Regex::new(r"\b(?:(?:\d{1,3}\.){3}\d{1,3}\.in-addr\.arpa|((?:\d{1,3}\.){3}\d{1,3}))\b")
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self { hosts: Table::default(), subnets: BTreeMap::new(), blocks, exclusion, find_re })
    }

    pub fn is_excluded(&self, addr: [u8; 4]) -> bool {
        self.exclusion.iter().any(|s| s.contains_addr(addr))
    }

    /// Adds a subnet entry, unresolved unless it already exists.
    pub fn add_subnet(&mut self, subnet: Subnet) {
        self.subnets.entry(subnet).or_insert(None);
    }

    pub fn subnet_replacement(&self, subnet: &Subnet) -> Option<Subnet> {
        self.subnets.get(subnet).copied().flatten()
    }

    /// Inserts the implicit /24 of every host without a covering subnet.
    pub fn discover_subnets(&mut self) {
        let mut found = Vec::new();
        for host in self.hosts.keys() {
            let Some(addr) = parse_ipv4(host) else { continue };
            if self.is_excluded(addr) || self.subnets.keys().any(|s| s.contains_addr(addr)) {
                continue;
            }
            found.push(Subnet::new(addr, 24));
        }
        for s in found {
            debug!("Discovered subnet {}", s);
            self.add_subnet(s);
        }
    }

    /// Most specific resolved subnet containing `target`, strictly wider.
    fn resolved_supernet(&self, target: &Subnet) -> Option<Subnet> {
        self.subnets
            .iter()
            .filter(|(s, r)| r.is_some() && s.prefix < target.prefix && s.contains(target))
            .max_by_key(|(s, _)| s.prefix)
            .and_then(|(_, r)| *r)
    }

    fn block_for(&self, target: &Subnet) -> Option<Subnet> {
        if let Some(block) = self.blocks.iter().find(|b| b.contains(target)) {
            return Some(*block);
        }
        let block = self.blocks.first().copied()?;
        warn!("No configured block contains subnet '{}', using '{}'", target, block);
        Some(block)
    }

    /// Address of `addr` under a subnet replacement.
    fn host_image(addr: [u8; 4], repl: &Subnet) -> [u8; 4] {
        let keep = (repl.prefix / 8).min(4) as usize;
        let mut bytes = addr;
        bytes[..keep].copy_from_slice(&repl.first()[..keep]);
        bytes
    }

    /// Candidate subnets that would merge hosts of `subnet` with hosts mapped
    /// through another entry.
    fn is_taken(&self, subnet: &Subnet, candidate: &Subnet) -> bool {
        self.subnets.iter().any(|(s, r)| match r {
            Some(r) if !s.contains(subnet) => r.contains(candidate) || candidate.contains(r),
            _ => false,
        })
    }

    /// Images of hosts mapped through a resolved supernet of `subnet` but
    /// lying outside it, cut to the prefix of `subnet`.
    fn supernet_images(&self, subnet: &Subnet) -> HashSet<Subnet> {
        let mut images = HashSet::new();
        for host in self.hosts.keys() {
            let Some(addr) = parse_ipv4(host) else { continue };
            if subnet.contains_addr(addr) || self.is_excluded(addr) {
                continue;
            }
            let owner = self.subnets.iter().filter(|(s, _)| s.contains_addr(addr)).max_by_key(|(s, _)| s.prefix);
            if let Some((s, Some(r))) = owner {
                if s.contains(subnet) {
                    images.insert(Subnet::new(Self::host_image(addr, r), subnet.prefix));
                }
            }
        }
        images
    }

    pub fn generate_subnet_replacement(&self, subnet: &Subnet, rng: &mut dyn RngCore) -> Result<Subnet> {
        let not_found = || Error::NotFound { store: Kind::Ip.as_str(), value: subnet.to_string() };
        let supernet = match self.resolved_supernet(subnet) {
            Some(s) => s.rounded(),
            None => self.block_for(subnet).ok_or_else(not_found)?,
        };
        let keep = preserved_bytes(supernet.prefix, "subnet", &subnet.to_string(), &supernet);

        let original = subnet.first();
        let count = (subnet.prefix / 8) as usize;
        let (lo, hi) = (supernet.first(), supernet.last());
        let mut candidates: Vec<Vec<u8>> = (0..count)
            .map(|i| if i < keep { vec![lo[i]] } else { same_width_range(lo[i], hi[i], original[i].to_string().len()) })
            .collect();
        for c in candidates.iter_mut() {
            c.shuffle(rng);
        }

        let images = self.supernet_images(subnet);
        let mut index = vec![0usize; count];
        for _ in 0..MAX_ATTEMPTS {
            let mut bytes = original;
            for i in 0..count {
                bytes[i] = candidates[i][index[i]];
            }
            let candidate = Subnet::new(bytes, subnet.prefix);
            if !images.contains(&candidate) && !self.is_taken(subnet, &candidate) {
                return Ok(candidate);
            }
            // Odometer: advance the last position, carrying leftwards.
            let mut pos = count;
            loop {
                if pos == 0 {
                    return Err(Error::GenerationExhausted { store: Kind::Ip.as_str(), value: subnet.to_string() });
                }
                pos -= 1;
                index[pos] += 1;
                if index[pos] < candidates[pos].len() {
                    break;
                }
                index[pos] = 0;
            }
        }
        Err(Error::GenerationExhausted { store: Kind::Ip.as_str(), value: subnet.to_string() })
    }

    pub fn generate_host_replacement(&self, host: &str) -> Result<String> {
        let not_found = || Error::NotFound { store: Kind::Ip.as_str(), value: host.to_string() };
        let addr = parse_ipv4(host).ok_or_else(|| Error::InvalidValue { store: Kind::Ip.as_str(), value: host.to_string() })?;
        let (_, repl) = self
            .subnets
            .iter()
            .filter_map(|(s, r)| r.map(|r| (s, r)))
            .filter(|(s, _)| s.contains_addr(addr))
            .max_by_key(|(s, _)| s.prefix)
            .ok_or_else(not_found)?;
        let keep = preserved_bytes(repl.prefix, "host", host, &repl);
        let mut bytes = addr;
        bytes[..keep].copy_from_slice(&repl.first()[..keep]);
        Ok(fmt_ipv4(&bytes))
    }
}

impl Store for IpStore {
    fn kind(&self) -> Kind {
        Kind::Ip
    }

    fn is_valid(&self, value: &str) -> bool {
        parse_ipv4(value).is_some()
    }

    fn add_value(&mut self, value: &str) -> Result<()> {
        if !self.is_valid(value) {
            return Err(Error::InvalidValue { store: Kind::Ip.as_str(), value: value.to_string() });
        }
        self.hosts.insert(value);
        Ok(())
    }

    fn find_values(&self, text: &str) -> Vec<String> {
        self.find_re
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .filter(|v| self.is_valid(v))
            .map(str::to_string)
            .collect()
    }

    fn has_value(&self, value: &str) -> bool {
        self.hosts.contains(value)
    }

    fn has_replacement(&self, value: &str) -> bool {
        self.hosts.is_replacement(value)
    }

    fn get_replacement(&self, value: &str) -> Result<String> {
        self.hosts
            .get(value)
            .map(str::to_string)
            .ok_or_else(|| Error::NotFound { store: Kind::Ip.as_str(), value: value.to_string() })
    }

    fn generate(&mut self, rng: &mut dyn RngCore) -> Result<()> {
        self.discover_subnets();

        let mut pending: Vec<Subnet> = self.subnets.iter().filter(|(_, r)| r.is_none()).map(|(s, _)| *s).collect();
        pending.sort_by_key(|s| s.prefix);
        for subnet in pending {
            if self.subnets.iter().any(|(s, r)| r.is_some() && s.prefix > subnet.prefix && subnet.contains(s)) {
                warn!("A subnet of '{}' is already resolved, consistency with it is lost", subnet);
            }
            let repl = self.generate_subnet_replacement(&subnet, rng).map_err(|e| {
                error!("Failed to generate a replacement, subnet = '{}': {}", subnet, e);
                e
            })?;
            debug!("subnet {} → {}", subnet, repl);
            self.subnets.insert(subnet, Some(repl));
        }

        for host in self.hosts.unresolved() {
            let excluded = parse_ipv4(&host).map(|a| self.is_excluded(a)).unwrap_or(false);
            let repl = if excluded { host.clone() } else { self.generate_host_replacement(&host)? };
            self.hosts.resolve(&host, repl);
        }
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.hosts.stats()
    }

    fn load(&mut self, yaml: &str) -> anyhow::Result<()> {
        let file: IpFile = if yaml.trim().is_empty() { IpFile::default() } else { serde_yaml::from_str::<Option<IpFile>>(yaml)?.unwrap_or_default() };
        let hosts = file
            .hosts
            .into_iter()
            .filter(|(h, r)| {
                let ok = self.is_valid(h) && r.as_deref().map(|r| self.is_valid(r)).unwrap_or(true);
                if !ok {
                    error!("Invalid host entry in ip.yml, skipped: '{}'", h);
                }
                ok
            })
            .collect();
        self.hosts = Table::from_map(hosts);
        self.subnets.clear();
        for (s, r) in file.subnets {
            let Some(subnet) = Subnet::parse(&s) else {
                error!("Invalid subnet in ip.yml, skipped: '{}'", s);
                continue;
            };
            let repl = match r.as_deref().map(Subnet::parse) {
                Some(Some(r)) => Some(Subnet::new(r.first(), subnet.prefix)),
                Some(None) => {
                    error!("Invalid subnet replacement in ip.yml, skipped: '{}'", s);
                    continue;
                }
                None => None,
            };
            self.subnets.insert(subnet, repl);
        }
        Ok(())
    }

    fn save(&self) -> anyhow::Result<String> {
        let file = IpFile {
            hosts: self.hosts.to_map(),
            subnets: self.subnets.iter().map(|(s, r)| (s.to_string(), r.map(|r| r.to_string()))).collect(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }
}
