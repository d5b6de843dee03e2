//! Error taxonomy and the drop outcome returned by the layer walker.

use std::fmt;
use thiserror::Error;

use crate::store::Kind;

/// Errors raised by the stores, actions and the dissector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The token does not match the grammar of the store.
    #[error("invalid value: store = '{store}', value = '{value}'")]
    InvalidValue { store: &'static str, value: String },

    /// The token is valid for more than one store.
    #[error("ambiguous value '{value}', candidates = {candidates:?}")]
    Ambiguous { value: String, candidates: Vec<Kind> },

    /// A resolved type without a generated replacement.
    #[error("replacement not found: store = '{store}', value = '{value}'")]
    NotFound { store: &'static str, value: String },

    /// Deliberate, configured exclusion.
    #[error("explicit drop: {0}")]
    ExplicitDrop(String),

    /// Unconfigured layer or a field no action can process.
    #[error("implicit drop: {0}")]
    ImplicitDrop(String),

    /// A structured action could not parse its input.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The search for a unique replacement gave up.
    #[error("generation exhausted: store = '{store}', value = '{value}'")]
    GenerationExhausted { store: &'static str, value: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// The edited packet cannot be serialized back to bytes.
    #[error("packet build error: {0}")]
    Build(String),
}

impl Error {
    /// Errors that indicate a violated ordering invariant rather than bad input.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::GenerationExhausted { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ─── Drop outcome ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropKind {
    Explicit,
    Implicit,
    /// Any other failure, handled like an implicit drop.
    Error,
}

impl fmt::Display for DropKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropKind::Explicit => write!(f, "explicit_drop"),
            DropKind::Implicit => write!(f, "implicit_drop"),
            DropKind::Error => write!(f, "error"),
        }
    }
}

/// A packet (or layer, or field) that must be excluded from the output.
///
/// Each traversal level prepends its own context, so the final value names
/// the full path `packet → layer → field → action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    pub kind: DropKind,
    pub reason: String,
    pub context: Vec<String>,
    pub source: Option<Error>,
}

impl Dropped {
    pub fn explicit(reason: impl Into<String>) -> Self {
        Self { kind: DropKind::Explicit, reason: reason.into(), context: Vec::new(), source: None }
    }

    pub fn implicit(reason: impl Into<String>) -> Self {
        Self { kind: DropKind::Implicit, reason: reason.into(), context: Vec::new(), source: None }
    }

    pub fn within(mut self, context: impl Into<String>) -> Self {
        self.context.insert(0, context.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.source.as_ref().map(Error::is_fatal).unwrap_or(false)
    }
}

impl From<Error> for Dropped {
    fn from(err: Error) -> Self {
        match err {
            Error::ExplicitDrop(reason) => Dropped::explicit(reason),
            Error::ImplicitDrop(reason) => Dropped::implicit(reason),
            other => Dropped {
                kind: DropKind::Error,
                reason: other.to_string(),
                context: Vec::new(),
                source: Some(other),
            },
        }
    }
}

impl fmt::Display for Dropped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for ctx in &self.context {
            write!(f, ", {ctx}")?;
        }
        write!(f, ", reason = '{}'", self.reason)
    }
}

impl std::error::Error for Dropped {}
