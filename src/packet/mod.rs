//! Dissected packets: an ordered chain of named layers, each an ordered
//! list of named fields.

pub mod dissect;
pub mod walker;

use std::fmt;

pub use dissect::{build, parse};
pub use walker::{LayerPolicy, Phase, Walker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(u64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<FieldValue>),
    Packet(Packet),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fields: Vec::new() }
    }

    pub fn push(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.push(Field { name: name.into(), value });
    }

    pub fn with(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.push(name, value);
        self
    }

    pub fn int(self, name: &str, v: u64) -> Self {
        self.with(name, FieldValue::Int(v))
    }

    pub fn str(self, name: &str, v: impl Into<String>) -> Self {
        self.with(name, FieldValue::Str(v.into()))
    }

    pub fn bytes(self, name: &str, v: &[u8]) -> Self {
        self.with(name, FieldValue::Bytes(v.to_vec()))
    }

    /// First field called `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name)).map(|f| &f.value)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut FieldValue> {
        self.fields.iter_mut().find(|f| f.name.eq_ignore_ascii_case(name)).map(|f| &mut f.value)
    }

    pub fn get_int(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.get(name)? {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        writeln!(f, "{}{}:", pad, self.name)?;
        for field in &self.fields {
            write!(f, "{}  {}: ", pad, field.name)?;
            field.value.render(f, indent + 2)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

impl FieldValue {
    fn render(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Str(s) => write!(f, "{}", s),
            FieldValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b).escape_debug()),
            FieldValue::List(items) => {
                for item in items {
                    writeln!(f)?;
                    match item {
                        FieldValue::Packet(p) => p.render(f, indent)?,
                        other => {
                            write!(f, "{}- ", "  ".repeat(indent))?;
                            other.render(f, indent + 1)?;
                        }
                    }
                }
                Ok(())
            }
            FieldValue::Packet(p) => {
                writeln!(f)?;
                p.render(f, indent)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub layers: Vec<Layer>,
}

impl Packet {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name.eq_ignore_ascii_case(name))
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.name.eq_ignore_ascii_case(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        for layer in &self.layers {
            layer.render(f, indent)?;
        }
        Ok(())
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_access() {
        let l = Layer::new("SIP").str("Call-ID", "abc@host").int("Content-Length", 0);
        assert_eq!(l.get_str("call-id"), Some("abc@host"));
        assert_eq!(l.get_int("CONTENT-LENGTH"), Some(0));
        assert!(l.get("To").is_none());
    }

    #[test]
    fn render_nested() {
        let qr = Packet::new(vec![Layer::new("DNSQR").str("qname", "www.example.com.").int("qtype", 1)]);
        let p = Packet::new(vec![
            Layer::new("UDP").int("sport", 53),
            Layer::new("DNS").with("qd", FieldValue::List(vec![FieldValue::Packet(qr)])),
        ]);
        let text = p.to_string();
        assert!(text.starts_with("UDP:\n  sport: 53\nDNS:\n  qd: \n"));
        assert!(text.contains("    DNSQR:\n      qname: www.example.com.\n"));
    }
}
