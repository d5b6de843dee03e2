//! Consistent, structure-preserving anonymization of network traces.
//!
//! Identifiers (IP addresses, domain names, phone numbers, MAC addresses
//! and names) are collected from pcap captures and text logs, mapped to
//! synthetic replacements that keep their structure, and rewritten in
//! place. The same original always maps to the same replacement.

pub mod actions;
pub mod config;
pub mod error;
pub mod files;
pub mod packet;
pub mod pipeline;
pub mod project;
pub mod report;
pub mod store;

pub use error::{DropKind, Dropped, Error, Result};
pub use pipeline::Pipeline;
pub use project::Project;
