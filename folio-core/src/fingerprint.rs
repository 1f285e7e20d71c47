//! Canonical query fingerprints.
//!
//! A [`Fingerprint`] is the identity of a cached query: a resource name plus a
//! parameter object. The private inner struct means a fingerprint can only be
//! built through the validating constructors, so every fingerprint that reaches
//! the cache already carries its canonical parameter encoding.
//!
//! # Canonical Form
//!
//! Parameters are ordered by key (recursively, for nested objects) and encoded
//! as compact JSON. Two fingerprints are equal iff their resource names match
//! and their canonical encodings match, regardless of the order in which the
//! parameters were supplied.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::ValidationError;

/// Identity of a cached query.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    /// Private inner data - cannot be constructed externally
    inner: FingerprintInner,
}

/// Private inner struct - prevents construction without validation.
#[derive(Debug, Clone)]
struct FingerprintInner {
    resource: String,
    params: BTreeMap<String, Value>,
    canonical: String,
}

impl Fingerprint {
    /// Create a fingerprint from a resource name and a list of parameters.
    ///
    /// Fails fast with a [`ValidationError`] when the resource name is empty or
    /// contains characters outside `[a-z0-9_.-]`, when a parameter name is
    /// empty, or when the same parameter name appears twice.
    pub fn new<K, I>(resource: impl Into<String>, params: I) -> Result<Self, ValidationError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let resource = resource.into();
        validate_resource_name(&resource)?;

        let mut map = BTreeMap::new();
        for (key, value) in params {
            let key = key.into();
            if key.trim().is_empty() {
                return Err(ValidationError::InvalidParam {
                    resource,
                    key,
                    reason: "parameter name must not be empty".to_string(),
                });
            }
            if map.contains_key(&key) {
                return Err(ValidationError::DuplicateParam { resource, key });
            }
            map.insert(key, value);
        }

        let canonical = canonical_params(&map);
        Ok(Self {
            inner: FingerprintInner {
                resource,
                params: map,
                canonical,
            },
        })
    }

    /// Create a fingerprint with no parameters.
    pub fn bare(resource: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(resource, std::iter::empty::<(String, Value)>())
    }

    /// Create a fingerprint from any serializable parameter struct.
    ///
    /// The value must serialize to a JSON object (or `null`, meaning no
    /// parameters). `None` fields serialize as `null` and are kept, so callers
    /// that want absent filters to disappear should use
    /// `#[serde(skip_serializing_if = "Option::is_none")]`.
    pub fn from_serialize<P: Serialize>(
        resource: impl Into<String>,
        params: &P,
    ) -> Result<Self, ValidationError> {
        let resource = resource.into();
        let value = serde_json::to_value(params).map_err(|e| ValidationError::InvalidParams {
            resource: resource.clone(),
            reason: e.to_string(),
        })?;
        match value {
            Value::Null => Self::bare(resource),
            Value::Object(map) => Self::new(resource, map),
            other => Err(ValidationError::InvalidParams {
                resource,
                reason: format!("expected an object, got {}", json_type_name(&other)),
            }),
        }
    }

    /// Start building a fingerprint parameter by parameter.
    pub fn builder(resource: impl Into<String>) -> FingerprintBuilder {
        FingerprintBuilder {
            resource: resource.into(),
            params: Vec::new(),
        }
    }

    /// Get the resource name.
    pub fn resource_name(&self) -> &str {
        &self.inner.resource
    }

    /// Get the parameters, ordered by key.
    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.inner.params
    }

    /// Get a single parameter value.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.inner.params.get(key)
    }

    /// Get the canonical encoding of the parameters.
    pub fn canonical_params(&self) -> &str {
        &self.inner.canonical
    }

    /// Encode the whole fingerprint as `resource{canonical-params}`.
    pub fn encode(&self) -> String {
        format!("{}{}", self.inner.resource, self.inner.canonical)
    }

    /// Check whether this fingerprint belongs to the given resource.
    pub fn is_resource(&self, resource: &str) -> bool {
        self.inner.resource == resource
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.inner.resource == other.inner.resource
            && self.inner.canonical == other.inner.canonical
    }
}

impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.resource.hash(state);
        self.inner.canonical.hash(state);
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.inner.resource, self.inner.canonical)
    }
}

/// Incremental fingerprint construction.
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    resource: String,
    params: Vec<(String, Value)>,
}

impl FingerprintBuilder {
    /// Add a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Add a parameter only when a value is present.
    pub fn param_opt<V: Into<Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    /// Validate and build the fingerprint.
    pub fn build(self) -> Result<Fingerprint, ValidationError> {
        Fingerprint::new(self.resource, self.params)
    }
}

/// Selects a set of fingerprints for subscription or invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Exactly one fingerprint.
    Exact(Fingerprint),
    /// Every fingerprint of a resource, whatever its parameters.
    Resource(String),
    /// Every fingerprint.
    All,
}

impl Pattern {
    /// Match exactly one fingerprint.
    pub fn exact(fingerprint: Fingerprint) -> Self {
        Self::Exact(fingerprint)
    }

    /// Match every fingerprint of a resource.
    pub fn resource(resource: impl Into<String>) -> Self {
        Self::Resource(resource.into())
    }

    /// Check whether a fingerprint is selected by this pattern.
    pub fn matches(&self, fingerprint: &Fingerprint) -> bool {
        match self {
            Self::Exact(expected) => expected == fingerprint,
            Self::Resource(resource) => fingerprint.is_resource(resource),
            Self::All => true,
        }
    }

    /// The resource this pattern is restricted to, if any.
    pub fn resource_name(&self) -> Option<&str> {
        match self {
            Self::Exact(fingerprint) => Some(fingerprint.resource_name()),
            Self::Resource(resource) => Some(resource),
            Self::All => None,
        }
    }
}

impl From<Fingerprint> for Pattern {
    fn from(fingerprint: Fingerprint) -> Self {
        Self::Exact(fingerprint)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(fingerprint) => write!(f, "{}", fingerprint),
            Self::Resource(resource) => write!(f, "{}*", resource),
            Self::All => write!(f, "*"),
        }
    }
}

fn validate_resource_name(resource: &str) -> Result<(), ValidationError> {
    if resource.is_empty() {
        return Err(ValidationError::InvalidResource {
            resource: resource.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    let valid = resource
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(ValidationError::InvalidResource {
            resource: resource.to_string(),
            reason: "only [a-z0-9_.-] are allowed".to_string(),
        });
    }
    Ok(())
}

fn canonical_params(params: &BTreeMap<String, Value>) -> String {
    let mut out = String::from("{");
    for (i, (key, value)) in params.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_json_string(&mut out, key);
        out.push(':');
        push_canonical(&mut out, value);
    }
    out.push('}');
    out
}

/// Write a value with object keys sorted at every depth. Does not rely on
/// `serde_json::Map` ordering, which changes under the `preserve_order` feature.
fn push_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => push_json_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in pairs.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_json_string(out, key);
                out.push(':');
                push_canonical(out, item);
            }
            out.push('}');
        }
    }
}

fn push_json_string(out: &mut String, s: &str) {
    // Serializing a str cannot fail.
    out.push_str(&Value::String(s.to_string()).to_string());
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
