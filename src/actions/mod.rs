//! Field actions: the named operations a layer policy applies to a field.
//!
//! Every action has a discover half, which feeds candidate identifiers to
//! the stores, and an anonymize half, which rewrites the value from the
//! replacements. Validation reuses the anonymize half with the stores in
//! clean mode.

pub mod auto;
pub mod basic;
pub mod sip;

use regex::Regex;
use std::fmt;
use std::ops::Range;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::packet::FieldValue;
use crate::store::{Kind, StoreRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Pass,
    ImplicitDrop,
    ExplicitDrop,
    IpAddress,
    MacAddress,
    PhoneNumber,
    DomainName,
    DnsRdata,
    Name,
    Email,
    Auto,
    IcmpFilterType,
    RawPayload,
    SipIdentity,
    SipVia,
    SipCallId,
    SipPChargingVector,
    SdpOrigin,
    SdpConnection,
}

const ACTIONS: &[(&str, Action)] = &[
    ("pass", Action::Pass),
    ("implicit-drop", Action::ImplicitDrop),
    ("explicit-drop", Action::ExplicitDrop),
    ("ip-address", Action::IpAddress),
    ("mac-address", Action::MacAddress),
    ("phone-number", Action::PhoneNumber),
    ("domain-name", Action::DomainName),
    ("dns-rdata", Action::DnsRdata),
    ("name", Action::Name),
    ("email", Action::Email),
    ("auto", Action::Auto),
    ("icmp-filter-type", Action::IcmpFilterType),
    ("raw-payload", Action::RawPayload),
    ("sip-identity", Action::SipIdentity),
    ("sip-via", Action::SipVia),
    ("sip-call-id", Action::SipCallId),
    ("sip-p-charging-vector", Action::SipPChargingVector),
    ("sdp-origin", Action::SdpOrigin),
    ("sdp-connection", Action::SdpConnection),
];

impl Action {
    pub fn from_name(name: &str) -> Result<Action> {
        ACTIONS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
            .map(|(_, a)| *a)
            .ok_or_else(|| Error::Config(format!("unknown action '{}'", name)))
    }

    pub fn name(self) -> &'static str {
        ACTIONS.iter().find(|(_, a)| *a == self).map(|(n, _)| *n).unwrap_or("?")
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        ACTIONS.iter().map(|(n, _)| *n)
    }

    /// Feeds the identifiers found in `value` to the stores.
    pub fn discover(self, value: &FieldValue, stores: &mut StoreRegistry) -> Result<()> {
        match self {
            Action::IcmpFilterType => basic::icmp_filter_type(value),
            Action::DnsRdata if matches!(value, FieldValue::Bytes(_)) => Err(basic::opaque_rdata()),
            Action::Pass | Action::RawPayload | Action::ImplicitDrop | Action::ExplicitDrop => {
                self.discover_text("", stores)
            }
            _ => self.discover_text(&text_of(value)?, stores),
        }
    }

    /// Rewrites `value` in place from the resolved replacements.
    pub fn anonymize(self, value: &mut FieldValue, stores: &StoreRegistry) -> Result<()> {
        match self {
            Action::IcmpFilterType => basic::icmp_filter_type(value),
            Action::RawPayload => basic::raw_payload(value),
            Action::DnsRdata if matches!(value, FieldValue::Bytes(_)) => Err(basic::opaque_rdata()),
            Action::Pass => Ok(()),
            Action::ImplicitDrop | Action::ExplicitDrop => self.anonymize_text("", stores).map(|_| ()),
            _ => replace_text(value, |text| self.anonymize_text(text, stores)),
        }
    }

    pub fn discover_text(self, text: &str, stores: &mut StoreRegistry) -> Result<()> {
        match self {
            Action::Pass | Action::RawPayload => Ok(()),
            Action::ImplicitDrop => Err(Error::ImplicitDrop("field is not allowed".into())),
            Action::ExplicitDrop => Err(Error::ExplicitDrop("field is excluded".into())),
            Action::IpAddress => stores.add_value(Kind::Ip, text),
            Action::MacAddress => stores.add_value(Kind::Mac, text),
            Action::PhoneNumber => basic::discover_phone_number(text, stores),
            Action::DomainName => basic::discover_domain_name(text, stores),
            Action::DnsRdata => basic::discover_dns_rdata(text, stores),
            Action::Name => basic::discover_name(text, stores),
            Action::Email => basic::discover_email(text, stores),
            Action::Auto => auto::discover(text, stores),
            Action::IcmpFilterType => basic::icmp_filter_type(&FieldValue::Str(text.to_string())),
            Action::SipIdentity => sip::discover_identity(text, stores),
            Action::SipVia => sip::discover_via(text, stores),
            Action::SipCallId => sip::discover_call_id(text, stores),
            Action::SipPChargingVector => sip::discover_charging_vector(text, stores),
            Action::SdpOrigin => sip::discover_origin(text, stores),
            Action::SdpConnection => sip::discover_connection(text, stores),
        }
    }

    pub fn anonymize_text(self, text: &str, stores: &StoreRegistry) -> Result<String> {
        match self {
            Action::Pass => Ok(text.to_string()),
            Action::ImplicitDrop => Err(Error::ImplicitDrop("field is not allowed".into())),
            Action::ExplicitDrop => Err(Error::ExplicitDrop("field is excluded".into())),
            Action::IpAddress => replacement(stores, Kind::Ip, text),
            Action::MacAddress => replacement(stores, Kind::Mac, text),
            Action::PhoneNumber => basic::anonymize_phone_number(text, stores),
            Action::DomainName => basic::anonymize_domain_name(text, stores),
            Action::DnsRdata => basic::anonymize_dns_rdata(text, stores),
            Action::Name => basic::anonymize_name(text, stores),
            Action::Email => basic::anonymize_email(text, stores),
            Action::Auto => auto::anonymize(text, stores),
            Action::IcmpFilterType => {
                basic::icmp_filter_type(&FieldValue::Str(text.to_string()))?;
                Ok(text.to_string())
            }
            Action::RawPayload => Ok(basic::marker(text.len())),
            Action::SipIdentity => sip::anonymize_identity(text, stores),
            Action::SipVia => sip::anonymize_via(text, stores),
            Action::SipCallId => sip::anonymize_call_id(text, stores),
            Action::SipPChargingVector => sip::anonymize_charging_vector(text, stores),
            Action::SdpOrigin => sip::anonymize_origin(text, stores),
            Action::SdpConnection => sip::anonymize_connection(text, stores),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Helpers shared by the actions ────────────────────────────────────────────

/// The textual form of a scalar field.
pub fn text_of(value: &FieldValue) -> Result<String> {
    match value {
        FieldValue::Str(s) => Ok(s.clone()),
        FieldValue::Bytes(b) => String::from_utf8(b.clone())
            .map_err(|_| Error::UnsupportedFormat("field bytes are not valid UTF-8".into())),
        FieldValue::Int(v) => Ok(v.to_string()),
        FieldValue::List(_) | FieldValue::Packet(_) => {
            Err(Error::UnsupportedFormat("structured value where a scalar is expected".into()))
        }
    }
}

/// Applies `f` to the text of a string or byte field, keeping its representation.
fn replace_text(value: &mut FieldValue, f: impl FnOnce(&str) -> Result<String>) -> Result<()> {
    match value {
        FieldValue::Str(s) => {
            *s = f(s)?;
            Ok(())
        }
        FieldValue::Bytes(b) => {
            let text = std::str::from_utf8(b)
                .map_err(|_| Error::UnsupportedFormat("field bytes are not valid UTF-8".into()))?;
            *b = f(text)?.into_bytes();
            Ok(())
        }
        FieldValue::Int(v) => Err(Error::UnsupportedFormat(format!("integer field {} cannot hold text", v))),
        FieldValue::List(_) | FieldValue::Packet(_) => {
            Err(Error::UnsupportedFormat("structured value where a scalar is expected".into()))
        }
    }
}

/// The replacement for a token of a known type. The token is validated first
/// so a malformed value becomes a drop rather than a missing replacement.
pub fn replacement(stores: &StoreRegistry, kind: Kind, value: &str) -> Result<String> {
    if stores.is_clean() {
        return Ok(String::new());
    }
    if !stores.is_valid(kind, value) {
        return Err(Error::InvalidValue { store: kind.as_str(), value: value.to_string() });
    }
    stores.get_replacement(kind, value)
}

/// The replacement for a token whose type is guessed.
pub fn guessed_replacement(stores: &StoreRegistry, value: &str) -> Result<String> {
    if stores.is_clean() {
        return Ok(String::new());
    }
    let kind = stores.guess(value)?;
    stores.get_replacement(kind, value)
}

/// A slice of a field value holding one identifier, with its store when the
/// field format fixes it (`None`: guessed from the token itself).
pub type Token = (Range<usize>, Option<Kind>);

pub fn discover_tokens(text: &str, tokens: &[Token], stores: &mut StoreRegistry) -> Result<()> {
    for (range, kind) in tokens {
        let value = &text[range.clone()];
        match kind {
            Some(k) => stores.add_value(*k, value)?,
            None => {
                stores.add_guessed(value)?;
            }
        }
    }
    Ok(())
}

/// Substitutes every token in one pass. Overlapping tokens keep the first.
pub fn rewrite(text: &str, mut tokens: Vec<Token>, stores: &StoreRegistry) -> Result<String> {
    tokens.sort_by_key(|(r, _)| (r.start, std::cmp::Reverse(r.end)));
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (range, kind) in tokens {
        if range.start < last {
            continue;
        }
        let value = &text[range.clone()];
        out.push_str(&text[last..range.start]);
        out.push_str(&match kind {
            Some(k) => replacement(stores, k, value)?,
            None => guessed_replacement(stores, value)?,
        });
        last = range.end;
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// A compiled pattern shared by every call. An invalid pattern is a
/// configuration error rather than a panic.
pub fn pattern(cell: &'static OnceLock<Option<Regex>>, src: &str) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(src).ok())
        .as_ref()
        .ok_or_else(|| Error::Config(format!("invalid built-in pattern '{}'", src)))
}
