//! Layer traversal: applies the configured policy to every layer of a
//! packet and turns any failure into a drop outcome carrying its path.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use super::{FieldValue, Layer, Packet};
use crate::actions::Action;
use crate::config::{LayerConfig, PacketConfig};
use crate::error::{DropKind, Dropped, Error, Result};
use crate::store::StoreRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Discover,
    Anonymize,
    Validate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerPolicy {
    Pass,
    ExplicitDrop,
    /// Also the policy of every layer missing from the configuration.
    ImplicitDrop,
    Anonymize { fields: HashMap<String, Action>, other: Action },
}

static UNCONFIGURED: LayerPolicy = LayerPolicy::ImplicitDrop;

impl LayerPolicy {
    pub fn from_config(conf: &LayerConfig) -> Result<Self> {
        match conf {
            LayerConfig::Keyword(k) => match k.trim().to_ascii_lowercase().as_str() {
                "pass" => Ok(LayerPolicy::Pass),
                "drop" | "explicit-drop" => Ok(LayerPolicy::ExplicitDrop),
                "implicit-drop" => Ok(LayerPolicy::ImplicitDrop),
                other => Err(Error::Config(format!("unknown layer policy '{}'", other))),
            },
            LayerConfig::Fields(f) => {
                let fields = f
                    .fields
                    .iter()
                    .map(|(name, action)| Ok((name.to_ascii_lowercase(), Action::from_name(action)?)))
                    .collect::<Result<HashMap<_, _>>>()?;
                let other = match &f.other_fields {
                    Some(a) => Action::from_name(a)?,
                    None => Action::ImplicitDrop,
                };
                Ok(LayerPolicy::Anonymize { fields, other })
            }
        }
    }
}

/// Per-layer outcome counts for one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerCounters {
    pub pass: u64,
    pub anonymized: u64,
    pub explicit_drop: u64,
    pub implicit_drop: u64,
    pub error: u64,
}

pub struct Walker {
    policies: HashMap<String, LayerPolicy>,
    counters: BTreeMap<String, LayerCounters>,
}

impl Walker {
    pub fn new(conf: &PacketConfig) -> Result<Self> {
        let policies = conf
            .layers
            .iter()
            .map(|(name, layer)| {
                let policy = LayerPolicy::from_config(layer)
                    .map_err(|e| Error::Config(format!("layer '{}': {}", name, e)))?;
                Ok((name.to_ascii_lowercase(), policy))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { policies, counters: BTreeMap::new() })
    }

    pub fn policy(&self, layer: &str) -> &LayerPolicy {
        self.policies.get(&layer.to_ascii_lowercase()).unwrap_or(&UNCONFIGURED)
    }

    /// Runs one phase over `packet`. Anonymize and validate rewrite fields in
    /// place; validate forces clean mode on the stores for the duration.
    pub fn walk(
        &mut self,
        phase: Phase,
        id: u64,
        packet: &mut Packet,
        stores: &mut StoreRegistry,
    ) -> Result<(), Dropped> {
        let was_clean = stores.is_clean();
        if phase == Phase::Validate {
            stores.set_clean_mode(true);
        }
        let result = {
            let mut t = Traversal { policies: &self.policies, counters: &mut self.counters, stores: &mut *stores, phase };
            t.packet(packet)
        };
        stores.set_clean_mode(was_clean);
        result.map_err(|d| d.within(format!("packet = {}", id)))
    }

    /// Text of every layer that is not passed through unchanged.
    pub fn render(&self, packet: &Packet) -> String {
        packet
            .layers
            .iter()
            .filter(|l| self.policy(&l.name) != &LayerPolicy::Pass)
            .map(Layer::to_string)
            .collect()
    }

    /// Counters accumulated since the last call.
    pub fn take_counters(&mut self) -> BTreeMap<String, LayerCounters> {
        std::mem::take(&mut self.counters)
    }
}

// ─── Traversal ────────────────────────────────────────────────────────────────

struct Traversal<'a> {
    policies: &'a HashMap<String, LayerPolicy>,
    counters: &'a mut BTreeMap<String, LayerCounters>,
    stores: &'a mut StoreRegistry,
    phase: Phase,
}

fn preview(value: &FieldValue) -> String {
    const MAX: usize = 48;
    let text = match value {
        FieldValue::Int(v) => return v.to_string(),
        FieldValue::Str(s) => s.clone(),
        FieldValue::Bytes(b) => String::from_utf8_lossy(b).escape_debug().to_string(),
        FieldValue::List(_) | FieldValue::Packet(_) => return "[..]".into(),
    };
    if text.chars().count() > MAX {
        format!("'{}..'", text.chars().take(MAX).collect::<String>())
    } else {
        format!("'{}'", text)
    }
}

impl Traversal<'_> {
    fn packet(&mut self, packet: &mut Packet) -> Result<(), Dropped> {
        for layer in &mut packet.layers {
            self.layer(layer)?;
        }
        Ok(())
    }

    fn layer(&mut self, layer: &mut Layer) -> Result<(), Dropped> {
        let policies = self.policies;
        let policy = policies.get(&layer.name.to_ascii_lowercase()).unwrap_or(&UNCONFIGURED);
        let outcome = match policy {
            LayerPolicy::Pass => Ok(()),
            LayerPolicy::ExplicitDrop => Err(Dropped::explicit("layer is excluded")),
            LayerPolicy::ImplicitDrop => Err(Dropped::implicit("layer has no anonymization policy")),
            LayerPolicy::Anonymize { fields, other } => self.fields(layer, fields, *other),
        };
        let counter = self.counters.entry(layer.name.clone()).or_default();
        match (&outcome, policy) {
            (Ok(()), LayerPolicy::Pass) => counter.pass += 1,
            (Ok(()), _) => counter.anonymized += 1,
            (Err(d), _) => match d.kind {
                DropKind::Explicit => counter.explicit_drop += 1,
                DropKind::Implicit => counter.implicit_drop += 1,
                DropKind::Error => counter.error += 1,
            },
        }
        outcome.map_err(|d| d.within(format!("layer = '{}'", layer.name)))
    }

    fn fields(&mut self, layer: &mut Layer, actions: &HashMap<String, Action>, other: Action) -> Result<(), Dropped> {
        for field in &mut layer.fields {
            let action = actions.get(&field.name.to_ascii_lowercase()).copied().unwrap_or(other);
            self.value(action, &mut field.value).map_err(|d| d.within(format!("field = '{}'", field.name)))?;
        }
        Ok(())
    }

    fn value(&mut self, action: Action, value: &mut FieldValue) -> Result<(), Dropped> {
        let is_drop = matches!(action, Action::ExplicitDrop | Action::ImplicitDrop);
        match value {
            FieldValue::List(items) if !is_drop => {
                for item in items {
                    self.value(action, item)?;
                }
                Ok(())
            }
            FieldValue::Packet(inner) if !is_drop => self.packet(inner),
            _ => {
                let shown = preview(value);
                let result = match self.phase {
                    Phase::Discover => action.discover(value, self.stores),
                    Phase::Anonymize | Phase::Validate => action.anonymize(value, self.stores),
                };
                if result.is_ok() && action != Action::Pass {
                    debug!("{} {} ← {}", action, preview(value), shown);
                }
                result.map_err(|e| Dropped::from(e).within(format!("action = '{}', value = {}", action, shown)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Kind;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const LAYERS: &str = r#"
packet:
  layers:
    Ethernet: pass
    Padding: drop
    IP:
      fields: {src: ip-address, dst: ip-address}
      other-fields: pass
    ICMP:
      fields: {type: icmp-filter-type}
      other-fields: pass
    DNS:
      fields: {qd: pass, an: pass}
      other-fields: pass
    DNSQR:
      fields: {qname: domain-name}
      other-fields: pass
    Raw:
      fields: {load: auto}
"#;

    fn walker() -> Walker {
        Walker::new(&Config::from_yaml(LAYERS).unwrap().packet).unwrap()
    }

    fn stores() -> StoreRegistry {
        StoreRegistry::new(&Default::default()).unwrap()
    }

    fn icmp_packet(kind: u64) -> Packet {
        Packet::new(vec![
            Layer::new("Ethernet").str("dst", "00:1a:2b:aa:bb:cc").str("src", "00:1a:2b:aa:bb:cd"),
            Layer::new("IP").int("ttl", 64).str("src", "192.168.1.10").str("dst", "192.168.1.20"),
            Layer::new("ICMP").int("type", kind).int("code", 0),
        ])
    }

    fn dns_packet() -> Packet {
        let q = Packet::new(vec![Layer::new("DNSQR").str("qname", "www.example.com.").int("qtype", 1)]);
        Packet::new(vec![
            Layer::new("IP").str("src", "192.168.1.10").str("dst", "192.168.1.1"),
            Layer::new("DNS").int("id", 7).with("qd", FieldValue::List(vec![FieldValue::Packet(q)])),
        ])
    }

    #[test]
    fn policies_from_config() {
        let w = walker();
        assert_eq!(w.policy("ethernet"), &LayerPolicy::Pass);
        assert_eq!(w.policy("Padding"), &LayerPolicy::ExplicitDrop);
        assert_eq!(w.policy("ARP"), &LayerPolicy::ImplicitDrop);
        match w.policy("Raw") {
            LayerPolicy::Anonymize { other, .. } => assert_eq!(*other, Action::ImplicitDrop),
            p => panic!("unexpected {:?}", p),
        }
        let bad = Config::from_yaml("packet:\n  layers:\n    UDP:\n      fields: {sport: shuffle}\n").unwrap();
        assert!(matches!(Walker::new(&bad.packet), Err(Error::Config(_))));
    }

    #[test]
    fn unconfigured_layer_is_implicit_drop() {
        let mut w = walker();
        let mut p = Packet::new(vec![Layer::new("Ethernet"), Layer::new("ARP").str("psrc", "10.0.0.1")]);
        let d = w.walk(Phase::Discover, 3, &mut p, &mut stores()).unwrap_err();
        assert_eq!(d.kind, DropKind::Implicit);
        assert_eq!(d.context, vec!["packet = 3".to_string(), "layer = 'ARP'".to_string()]);
        let c = w.take_counters();
        assert_eq!(c["Ethernet"].pass, 1);
        assert_eq!(c["ARP"].implicit_drop, 1);
        assert!(w.take_counters().is_empty());
    }

    #[test]
    fn icmp_type_five_is_explicit_drop() {
        let mut w = walker();
        let mut s = stores();
        let mut p = icmp_packet(5);
        let d = w.walk(Phase::Discover, 1, &mut p, &mut s).unwrap_err();
        assert_eq!(d.kind, DropKind::Explicit);
        assert_eq!(
            d.context,
            vec!["packet = 1", "layer = 'ICMP'", "field = 'type'", "action = 'icmp-filter-type', value = 5"]
        );
        assert_eq!(w.take_counters()["ICMP"].explicit_drop, 1);
        assert_eq!(p, icmp_packet(5));
    }

    #[test]
    fn discover_then_anonymize_rewrites_fields() {
        let mut w = walker();
        let mut s = stores();
        let mut p = icmp_packet(8);
        w.walk(Phase::Discover, 1, &mut p, &mut s).unwrap();
        assert!(s.has_value(Kind::Ip, "192.168.1.20"));
        s.generate_all(&mut StdRng::seed_from_u64(4)).unwrap();
        w.walk(Phase::Anonymize, 1, &mut p, &mut s).unwrap();
        let ip = p.layer("IP").unwrap();
        assert_eq!(ip.get_str("src").unwrap(), s.get_replacement(Kind::Ip, "192.168.1.10").unwrap());
        assert_eq!(ip.get_int("ttl"), Some(64));
        assert_eq!(p.layer("Ethernet").unwrap().get_str("src"), Some("00:1a:2b:aa:bb:cd"));
    }

    #[test]
    fn nested_packets_follow_their_own_policy() {
        let mut w = walker();
        let mut s = stores();
        let mut p = dns_packet();
        w.walk(Phase::Discover, 1, &mut p, &mut s).unwrap();
        assert!(s.has_value(Kind::Domain, "www.example.com"));
        s.generate_all(&mut StdRng::seed_from_u64(4)).unwrap();
        w.walk(Phase::Anonymize, 1, &mut p, &mut s).unwrap();
        let Some(FieldValue::List(qd)) = p.layer("DNS").unwrap().get("qd") else { panic!("qd") };
        let FieldValue::Packet(q) = &qd[0] else { panic!("question") };
        let qname = q.layer("DNSQR").unwrap().get_str("qname").unwrap();
        assert_eq!(qname, format!("{}.", s.get_replacement(Kind::Domain, "www.example.com").unwrap()));
        assert_eq!(w.take_counters()["DNSQR"].anonymized, 2);
    }

    #[test]
    fn validate_blanks_identifiers_and_restores_mode() {
        let mut w = walker();
        let mut s = stores();
        let mut p = icmp_packet(0);
        w.walk(Phase::Discover, 1, &mut p, &mut s).unwrap();
        s.generate_all(&mut StdRng::seed_from_u64(4)).unwrap();
        w.walk(Phase::Validate, 1, &mut p, &mut s).unwrap();
        assert!(!s.is_clean());
        let text = w.render(&p);
        assert!(!text.contains("Ethernet"));
        assert!(text.contains("IP:\n  ttl: 64\n  src: \n  dst: \n"), "{}", text);
    }

    #[test]
    fn undecodable_payload_is_an_error_drop() {
        let mut w = walker();
        let mut p = Packet::new(vec![Layer::new("Raw").bytes("load", &[0xff, 0x00, 0xfe])]);
        let d = w.walk(Phase::Discover, 9, &mut p, &mut stores()).unwrap_err();
        assert_eq!(d.kind, DropKind::Error);
        assert!(matches!(d.source, Some(Error::UnsupportedFormat(_))));
        assert!(!d.is_fatal());
        assert_eq!(w.take_counters()["Raw"].error, 1);
    }
}
