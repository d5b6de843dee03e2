//! SIP header and SDP line actions.
//!
//! Each action locates the identifier-bearing parts of its field and hands
//! them to [`discover_tokens`] / [`rewrite`], so only those spans change.

use regex::{Captures, Regex};
use std::sync::OnceLock;

use super::{discover_tokens, pattern, rewrite, Token};
use crate::error::{Error, Result};
use crate::store::{Kind, StoreRegistry};

const IDENTITY: &str = concat!(
    r#"(?i)^"?(?P<display>.+?)??"?\s*<?sips?:(?:(?P<user>[^@<>]+)@)?(?P<host>[^;?:>]+)(?::\d{1,6})?>?\s*"#,
    r#"(?:;(?:tag|epid|expires|transport|user|lr|ob|gr|rinstance|line|\+av-dse-enh|[^;?]*instance|[^;?]*model|[^;?=]*devicename|video|audio|ms-opaque|privacy|screen|reason|counter)[^;?]*"#,
    r#"|;maddr=(?P<maddr>[\d.]+)|;[^;?=]*="(?P<devicename>[^;?"]*)"|>)*$"#,
);
const VIA: &str = r"(?i)^SIP/\d\.\d/(?:UDP|TCP|TLS|SCTP|WSS?)\s+(?P<host>[^:;\s]+)(?::\d+)?\s*(?P<params>[;?].*)?$";
const VIA_PARAM: &str = r"(?i);\s*(?:received|maddr)=(?P<value>[^;\s]+)";
const CALL_ID: &str = r"^[^@]*(?:@(?P<host>.+))?$";
const ORIGIN: &str = r"^(?P<username>\S+)\s+\S+\s+\S+\s+IN\s+IP4\s+(?P<address>\S+)$";
const CONNECTION: &str = r"^IN\s+IP4\s+(?P<address>[^/\s]+)(?:/\d+){0,2}$";

static IDENTITY_RE: OnceLock<Option<Regex>> = OnceLock::new();
static VIA_RE: OnceLock<Option<Regex>> = OnceLock::new();
static VIA_PARAM_RE: OnceLock<Option<Regex>> = OnceLock::new();
static CALL_ID_RE: OnceLock<Option<Regex>> = OnceLock::new();
static ORIGIN_RE: OnceLock<Option<Regex>> = OnceLock::new();
static CONNECTION_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn unsupported(what: &str, value: &str) -> Error {
    Error::UnsupportedFormat(format!("not a {}: '{}'", what, value))
}

fn token(caps: &Captures<'_>, group: &str, kind: Option<Kind>) -> Option<Token> {
    caps.name(group).filter(|m| !m.as_str().is_empty()).map(|m| (m.range(), kind))
}

// ─── Identity headers (From, To, Contact, Request-URI, ...) ──────────────────

fn identity_tokens(text: &str) -> Result<Vec<Token>> {
    let caps = pattern(&IDENTITY_RE, IDENTITY)?.captures(text).ok_or_else(|| unsupported("SIP identity", text))?;
    Ok([
        token(&caps, "devicename", Some(Kind::Name)),
        token(&caps, "display", None),
        token(&caps, "user", None),
        token(&caps, "host", None),
        token(&caps, "maddr", Some(Kind::Ip)),
    ]
    .into_iter()
    .flatten()
    .collect())
}

pub fn discover_identity(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    discover_tokens(text, &identity_tokens(text)?, stores)
}

pub fn anonymize_identity(text: &str, stores: &StoreRegistry) -> Result<String> {
    rewrite(text, identity_tokens(text)?, stores)
}

// ─── Via ──────────────────────────────────────────────────────────────────────

fn via_tokens(text: &str) -> Result<Vec<Token>> {
    let caps = pattern(&VIA_RE, VIA)?.captures(text).ok_or_else(|| unsupported("Via header", text))?;
    let mut tokens: Vec<Token> = token(&caps, "host", None).into_iter().collect();
    if let Some(params) = caps.name("params") {
        for p in pattern(&VIA_PARAM_RE, VIA_PARAM)?.captures_iter(params.as_str()) {
            if let Some(v) = p.name("value") {
                tokens.push((params.start() + v.start()..params.start() + v.end(), None));
            }
        }
    }
    Ok(tokens)
}

pub fn discover_via(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    discover_tokens(text, &via_tokens(text)?, stores)
}

pub fn anonymize_via(text: &str, stores: &StoreRegistry) -> Result<String> {
    rewrite(text, via_tokens(text)?, stores)
}

// ─── Call-ID ──────────────────────────────────────────────────────────────────

fn call_id_tokens(text: &str) -> Result<Vec<Token>> {
    let caps = pattern(&CALL_ID_RE, CALL_ID)?.captures(text).ok_or_else(|| unsupported("Call-ID", text))?;
    Ok(token(&caps, "host", None).into_iter().collect())
}

pub fn discover_call_id(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    discover_tokens(text, &call_id_tokens(text)?, stores)
}

pub fn anonymize_call_id(text: &str, stores: &StoreRegistry) -> Result<String> {
    rewrite(text, call_id_tokens(text)?, stores)
}

// ─── P-Charging-Vector ────────────────────────────────────────────────────────

/// `icid-value=..;icid-generated-at=<ip>;orig-ioi=<domain>;term-ioi=<domain>`
fn charging_vector_tokens(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut offset = 0;
    for (i, param) in text.split(';').enumerate() {
        let start = offset + (param.len() - param.trim_start().len());
        offset += param.len() + 1;
        let Some((key, value)) = param.trim().split_once('=') else {
            return Err(unsupported("P-Charging-Vector", text));
        };
        let key = key.trim().to_ascii_lowercase();
        if i == 0 && key != "icid-value" {
            return Err(unsupported("P-Charging-Vector", text));
        }
        if !matches!(key.as_str(), "icid-generated-at" | "orig-ioi" | "term-ioi") {
            continue;
        }
        let value_start = start + param.trim().len() - value.len();
        let quoted = value.len() >= 2 && value.starts_with('"') && value.ends_with('"');
        let range = if quoted { value_start + 1..value_start + value.len() - 1 } else { value_start..value_start + value.len() };
        if !range.is_empty() {
            tokens.push((range, None));
        }
    }
    Ok(tokens)
}

pub fn discover_charging_vector(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    discover_tokens(text, &charging_vector_tokens(text)?, stores)
}

pub fn anonymize_charging_vector(text: &str, stores: &StoreRegistry) -> Result<String> {
    rewrite(text, charging_vector_tokens(text)?, stores)
}

// ─── SDP o= / c= ──────────────────────────────────────────────────────────────

/// `o=<username> <sess-id> <version> IN IP4 <address>`; a `-` username is absent.
fn origin_tokens(text: &str) -> Result<Vec<Token>> {
    let caps = pattern(&ORIGIN_RE, ORIGIN)?.captures(text).ok_or_else(|| unsupported("SDP origin", text))?;
    let mut tokens = Vec::new();
    if caps.name("username").map(|m| m.as_str() != "-").unwrap_or(false) {
        tokens.extend(token(&caps, "username", None));
    }
    tokens.extend(token(&caps, "address", None));
    Ok(tokens)
}

pub fn discover_origin(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    discover_tokens(text, &origin_tokens(text)?, stores)
}

pub fn anonymize_origin(text: &str, stores: &StoreRegistry) -> Result<String> {
    rewrite(text, origin_tokens(text)?, stores)
}

/// `c=IN IP4 <address>[/<ttl>[/<count>]]`
fn connection_tokens(text: &str) -> Result<Vec<Token>> {
    let caps = pattern(&CONNECTION_RE, CONNECTION)?.captures(text).ok_or_else(|| unsupported("SDP connection", text))?;
    Ok(token(&caps, "address", Some(Kind::Ip)).into_iter().collect())
}

pub fn discover_connection(text: &str, stores: &mut StoreRegistry) -> Result<()> {
    discover_tokens(text, &connection_tokens(text)?, stores)
}

pub fn anonymize_connection(text: &str, stores: &StoreRegistry) -> Result<String> {
    rewrite(text, connection_tokens(text)?, stores)
}
