//! Single-value actions: addresses, numbers, DNS names, names, e-mail,
//! ICMP filtering and payload masking.

use super::{discover_tokens, replacement, rewrite, Token};
use crate::error::{Error, Result};
use crate::packet::FieldValue;
use crate::store::ip::{fmt_ipv4, parse_ipv4};
use crate::store::{Kind, StoreRegistry};

/// ICMP types forwarded to the output: echo reply, destination unreachable,
/// echo request and time exceeded.
const ICMP_ALLOWED: [u64; 4] = [0, 3, 8, 11];

const MARKER: &str = "ANONYMIZED BY TRACEMASK ";

// ─── ICMP / payload ───────────────────────────────────────────────────────────

pub fn icmp_filter_type(value: &FieldValue) -> Result<()> {
    let kind = match value {
        FieldValue::Int(v) => *v,
        FieldValue::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| Error::UnsupportedFormat(format!("ICMP type '{}' is not a number", s)))?,
        _ => return Err(Error::UnsupportedFormat("ICMP type must be an integer".into())),
    };
    if ICMP_ALLOWED.contains(&kind) {
        Ok(())
    } else {
        Err(Error::ExplicitDrop(format!("ICMP type {} is not allowed", kind)))
    }
}

/// `len` bytes of the repeated marker text.
pub fn marker(len: usize) -> String {
    MARKER.bytes().cycle().take(len).map(char::from).collect()
}

pub fn raw_payload(value: &mut FieldValue) -> Result<()> {
    match value {
        FieldValue::Bytes(b) => *b = marker(b.len()).into_bytes(),
        FieldValue::Str(s) => *s = marker(s.len()),
        _ => return Err(Error::UnsupportedFormat("payload must be text or bytes".into())),
    }
    Ok(())
}

pub fn opaque_rdata() -> Error {
    Error::ExplicitDrop("resource record type is not supported".into())
}

// ─── Phone numbers ────────────────────────────────────────────────────────────

/// The space-separated tokens of `text` that are valid numbers.
fn phone_tokens(text: &str, stores: &StoreRegistry) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start = 0;
    for part in text.split(' ') {
        if stores.is_valid(Kind::Phone, part) {
            tokens.push((start..start + part.len(), Some(Kind::Phone)));
        }
        start += part.len() + 1;
    }
    tokens
}

pub fn discover_phone_number(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    let tokens = phone_tokens(text, stores);
    discover_tokens(text, &tokens, stores)
}

pub fn anonymize_phone_number(text: &str, stores: &StoreRegistry) -> Result<String> {
    rewrite(text, phone_tokens(text, stores), stores)
}

// ─── DNS names ────────────────────────────────────────────────────────────────

/// How a DNS name is interpreted.
enum DnsName<'a> {
    Root,
    /// `d.c.b.a.in-addr.arpa`, or a bare address.
    Ptr { ip: String, suffix: Option<&'a str> },
    /// `4.3.2.1.e164.arpa`: the digits of a number, reversed.
    Enum { number: String, suffix: &'a str },
    Domain(&'a str),
    Host(&'a str),
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> Option<(&'a str, &'a str)> {
    if s.len() < suffix.len() || !s.is_char_boundary(s.len() - suffix.len()) {
        return None;
    }
    let (head, tail) = s.split_at(s.len() - suffix.len());
    tail.eq_ignore_ascii_case(suffix).then_some((head, tail))
}

fn reversed_ip(labels: &str) -> Option<String> {
    let mut b = parse_ipv4(labels)?;
    b.reverse();
    Some(fmt_ipv4(&b))
}

fn classify<'a>(name: &'a str, stores: &StoreRegistry) -> Result<DnsName<'a>> {
    if name.is_empty() {
        return Ok(DnsName::Root);
    }
    if let Some((head, suffix)) = strip_suffix_ignore_case(name, ".in-addr.arpa") {
        if let Some(ip) = reversed_ip(head) {
            return Ok(DnsName::Ptr { ip, suffix: Some(suffix) });
        }
    }
    if parse_ipv4(name).is_some() {
        return Ok(DnsName::Ptr { ip: name.to_string(), suffix: None });
    }
    if let Some((head, suffix)) = strip_suffix_ignore_case(name, ".e164.arpa") {
        let digits: Vec<&str> = head.split('.').collect();
        if (1..=15).contains(&digits.len()) && digits.iter().all(|d| d.len() == 1 && d.as_bytes()[0].is_ascii_digit()) {
            return Ok(DnsName::Enum { number: digits.iter().rev().copied().collect(), suffix });
        }
    }
    if stores.is_valid(Kind::Domain, name) {
        return Ok(DnsName::Domain(name));
    }
    if !name.contains('.') && stores.is_valid(Kind::Name, name) {
        return Ok(DnsName::Host(name));
    }
    Err(Error::ImplicitDrop(format!("not a usable DNS name: '{}'", name)))
}

fn split_dot(text: &str) -> (&str, &str) {
    match text.strip_suffix('.') {
        Some(name) => (name, "."),
        None => (text, ""),
    }
}

pub fn discover_domain_name(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    let (name, _) = split_dot(text);
    match classify(name, stores)? {
        DnsName::Root => Ok(()),
        DnsName::Ptr { ip, .. } => stores.add_value(Kind::Ip, &ip),
        DnsName::Enum { number, .. } => stores.add_value(Kind::Phone, &number),
        DnsName::Domain(d) => stores.add_value(Kind::Domain, d),
        DnsName::Host(h) => stores.add_value(Kind::Name, h),
    }
}

/// The replacement keeps the reverse-lookup suffix and the trailing dot.
pub fn anonymize_domain_name(text: &str, stores: &StoreRegistry) -> Result<String> {
    let (name, dot) = split_dot(text);
    let repl = match classify(name, stores)? {
        DnsName::Root => return Ok(text.to_string()),
        DnsName::Ptr { ip, suffix: Some(suffix) } => {
            let r = replacement(stores, Kind::Ip, &ip)?;
            let mut bytes: Vec<&str> = r.split('.').collect();
            bytes.reverse();
            format!("{}{}", bytes.join("."), suffix)
        }
        DnsName::Ptr { ip, suffix: None } => replacement(stores, Kind::Ip, &ip)?,
        DnsName::Enum { number, suffix } => {
            let r = replacement(stores, Kind::Phone, &number)?;
            let digits: Vec<String> = r.chars().filter(char::is_ascii_digit).rev().map(String::from).collect();
            format!("{}{}", digits.join("."), suffix)
        }
        DnsName::Domain(d) => replacement(stores, Kind::Domain, d)?,
        DnsName::Host(h) => replacement(stores, Kind::Name, h)?,
    };
    Ok(format!("{}{}", repl, dot))
}

/// Record data rendered as text: an address for A records, a name otherwise.
pub fn discover_dns_rdata(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    if parse_ipv4(text).is_some() {
        stores.add_value(Kind::Ip, text)
    } else {
        discover_domain_name(text, stores)
    }
}

pub fn anonymize_dns_rdata(text: &str, stores: &StoreRegistry) -> Result<String> {
    if parse_ipv4(text).is_some() {
        replacement(stores, Kind::Ip, text)
    } else {
        anonymize_domain_name(text, stores)
    }
}

// ─── Names / e-mail ───────────────────────────────────────────────────────────

pub fn discover_name(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    if text.trim().is_empty() {
        return Ok(());
    }
    stores.add_value(Kind::Name, text)
}

pub fn anonymize_name(text: &str, stores: &StoreRegistry) -> Result<String> {
    if text.trim().is_empty() {
        return Ok(text.to_string());
    }
    replacement(stores, Kind::Name, text)
}

fn email_tokens(text: &str) -> Result<Vec<Token>> {
    let at = text
        .find('@')
        .filter(|at| *at > 0 && *at + 1 < text.len())
        .ok_or_else(|| Error::UnsupportedFormat(format!("not an e-mail address: '{}'", text)))?;
    Ok(vec![(0..at, Some(Kind::Name)), (at + 1..text.len(), Some(Kind::Domain))])
}

pub fn discover_email(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    discover_tokens(text, &email_tokens(text)?, stores)
}

pub fn anonymize_email(text: &str, stores: &StoreRegistry) -> Result<String> {
    rewrite(text, email_tokens(text)?, stores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn registry() -> StoreRegistry {
        StoreRegistry::new(&DataConfig::default()).unwrap()
    }

    fn generated(mut r: StoreRegistry) -> StoreRegistry {
        r.generate_all(&mut StdRng::seed_from_u64(3)).unwrap();
        r
    }

    #[test]
    fn icmp_types() {
        for t in [0, 3, 8, 11] {
            assert!(icmp_filter_type(&FieldValue::Int(t)).is_ok());
        }
        assert!(matches!(icmp_filter_type(&FieldValue::Int(5)), Err(Error::ExplicitDrop(_))));
        assert!(matches!(icmp_filter_type(&FieldValue::Str("x".into())), Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn payload_marker_keeps_length() {
        let mut v = FieldValue::Bytes(vec![0u8; 30]);
        raw_payload(&mut v).unwrap();
        assert_eq!(v, FieldValue::Bytes(b"ANONYMIZED BY TRACEMASK ANONYM".to_vec()));
    }

    #[test]
    fn reverse_lookup_names() {
        let mut r = registry();
        discover_domain_name("4.3.2.10.in-addr.arpa.", &mut r).unwrap();
        discover_domain_name("3.2.1.6.2.1.4.e164.arpa", &mut r).unwrap();
        assert!(r.has_value(Kind::Ip, "10.2.3.4"));
        assert!(r.has_value(Kind::Phone, "4126123"));
        let r = generated(r);

        let ip = r.get_replacement(Kind::Ip, "10.2.3.4").unwrap();
        let mut b = parse_ipv4(&ip).unwrap();
        b.reverse();
        assert_eq!(
            anonymize_domain_name("4.3.2.10.IN-ADDR.ARPA.", &r).unwrap(),
            format!("{}.IN-ADDR.ARPA.", fmt_ipv4(&b))
        );

        let out = anonymize_domain_name("3.2.1.6.2.1.4.e164.arpa", &r).unwrap();
        assert!(out.starts_with("3.2.1."), "{}", out);
        assert!(out.ends_with(".e164.arpa"));
    }

    #[test]
    fn domain_and_host_names() {
        let mut r = registry();
        discover_domain_name(".", &mut r).unwrap();
        discover_domain_name("www.example.com.", &mut r).unwrap();
        discover_domain_name("printer", &mut r).unwrap();
        assert!(matches!(discover_domain_name("a..b", &mut r), Err(Error::ImplicitDrop(_))));
        let r = generated(r);
        assert_eq!(anonymize_domain_name(".", &r).unwrap(), ".");
        let out = anonymize_domain_name("www.example.com.", &r).unwrap();
        assert!(out.ends_with(".com."), "{}", out);
        assert_ne!(out, "www.example.com.");
        assert_eq!(anonymize_domain_name("printer", &r).unwrap().len(), 7);
    }

    #[test]
    fn phone_tokens_are_replaced_in_place() {
        let mut r = registry();
        discover_phone_number("+41261234567 ext 12", &mut r).unwrap();
        assert!(!r.has_value(Kind::Phone, "12"));
        let r = generated(r);
        let out = anonymize_phone_number("+41261234567 ext 12", &r).unwrap();
        assert!(out.ends_with("567 ext 12"), "{}", out);
        assert_ne!(out, "+41261234567 ext 12");
    }

    #[test]
    fn email_parts() {
        let mut r = registry();
        discover_email("john.doe@example.org", &mut r).unwrap();
        assert!(discover_email("nobody", &mut r).is_err());
        let r = generated(r);
        let out = anonymize_email("john.doe@example.org", &r).unwrap();
        let (user, domain) = out.split_once('@').unwrap();
        assert_eq!(user.len(), 8);
        assert_eq!(&user[4..5], ".");
        assert!(domain.ends_with(".org"));
    }

    #[test]
    fn malformed_address_is_not_a_lookup_failure() {
        let r = generated(registry());
        assert!(matches!(replacement(&r, Kind::Ip, "10.0.0.999"), Err(Error::InvalidValue { .. })));
    }
}
