//! Validated resource paths.

use std::fmt;
use std::str::FromStr;

use super::error::CoapError;

/// A gateway resource path such as `/15001/65537`.
///
/// Stored in canonical form: a leading `/`, no trailing `/`, no empty
/// segments. Query strings and fragments are not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourcePath(String);

impl ResourcePath {
    /// Parse and canonicalize a path. The leading `/` is optional.
    pub fn parse(input: &str) -> Result<Self, CoapError> {
        let trimmed = input.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(CoapError::InvalidPath);
        }

        let mut canonical = String::with_capacity(trimmed.len() + 1);
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment.chars().any(is_forbidden) {
                return Err(CoapError::InvalidPath);
            }
            canonical.push('/');
            canonical.push_str(segment);
        }

        Ok(Self(canonical))
    }

    /// The canonical path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }
}

fn is_forbidden(c: char) -> bool {
    c.is_whitespace() || c.is_control() || c == '?' || c == '#'
}

impl FromStr for ResourcePath {
    type Err = CoapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for ResourcePath {
    type Error = CoapError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = CoapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&String> for ResourcePath {
    type Error = CoapError;

    fn try_from(value: &String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&ResourcePath> for ResourcePath {
    type Error = CoapError;

    fn try_from(value: &ResourcePath) -> Result<Self, Self::Error> {
        Ok(value.clone())
    }
}

impl AsRef<str> for ResourcePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
