//! The `(namespace, name)` resource key.

use std::fmt;
use std::str::FromStr;

use crate::IdError;

/// Maximum length of a namespace (DNS-1123 label).
const MAX_NAMESPACE_LEN: usize = 63;

/// Maximum length of an object name (DNS-1123 subdomain).
const MAX_NAME_LEN: usize = 253;

/// Identity of one namespaced custom resource.
///
/// Ordering is by namespace, then name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    namespace: String,
    name: String,
}

impl ResourceKey {
    /// Creates a key after validating both parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let namespace = namespace.into();
        let name = name.into();

        validate_namespace(&namespace)?;
        validate_name(&name)?;

        Ok(Self { namespace, name })
    }

    /// Parses a key from its canonical `namespace/name` form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((namespace, name)) = s.split_once('/') else {
            return Err(IdError::MissingSeparator(s.to_string()));
        };

        Self::new(namespace, name)
    }

    /// Returns the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the object name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ResourceKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn validate_namespace(value: &str) -> Result<(), IdError> {
    let invalid = |reason| IdError::InvalidNamespace {
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > MAX_NAMESPACE_LEN {
        return Err(invalid("must be at most 63 characters"));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid("must consist of lowercase alphanumerics or '-'"));
    }
    if !starts_and_ends_alphanumeric(value) {
        return Err(invalid("must start and end with an alphanumeric character"));
    }

    Ok(())
}

fn validate_name(value: &str) -> Result<(), IdError> {
    let invalid = |reason| IdError::InvalidName {
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(invalid("must be at most 253 characters"));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
    {
        return Err(invalid("must consist of lowercase alphanumerics, '-' or '.'"));
    }
    if !starts_and_ends_alphanumeric(value) {
        return Err(invalid("must start and end with an alphanumeric character"));
    }

    Ok(())
}

fn starts_and_ends_alphanumeric(value: &str) -> bool {
    let bytes = value.as_bytes();
    let ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    match (bytes.first(), bytes.last()) {
        (Some(&first), Some(&last)) => ok(first) && ok(last),
        _ => false,
    }
}
