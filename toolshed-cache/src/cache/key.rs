//! Canonical cache keys and wildcard patterns.
//!
//! `CacheKey::encode` turns a namespace plus a parameter set into a
//! deterministic string, so that equivalent requests land on the same slot no
//! matter how their filters were assembled.

use std::borrow::Borrow;
use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;
use toolshed_core::constants::{KEY_NAMESPACE_SEPARATOR, KEY_WILDCARD};
use toolshed_core::{ToolshedError, ToolshedResult};

/// A canonical cache key.
///
/// # Format
///
/// `<namespace>:<canonical-json>`, for example
/// `tools:{"category":"ai","page":2}`. Object members are sorted by name at
/// every depth and `null` members are dropped, so an omitted filter and an
/// explicitly null filter produce the same key. Array order is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Encode a namespace and parameter value into a canonical key.
    pub fn encode(namespace: &str, params: &Value) -> Self {
        let mut out = String::with_capacity(namespace.len() + 32);
        out.push_str(namespace);
        out.push(KEY_NAMESPACE_SEPARATOR);
        match params {
            Value::Null => out.push_str("{}"),
            other => write_canonical(other, &mut out),
        }
        Self(out)
    }

    /// Serialize `params` and encode it.
    ///
    /// Fails only if `params` cannot be represented as JSON (for example a
    /// map with non-string keys).
    pub fn encode_params<P: Serialize + ?Sized>(namespace: &str, params: &P) -> ToolshedResult<Self> {
        let value = serde_json::to_value(params).map_err(|e| ToolshedError::InvalidKey {
            reason: e.to_string(),
        })?;
        Ok(Self::encode(namespace, &value))
    }

    /// Key for a namespace with no parameters.
    pub fn namespace_only(namespace: &str) -> Self {
        Self::encode(namespace, &Value::Null)
    }

    /// Wrap an already-canonical key string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace portion, up to the first separator.
    pub fn namespace(&self) -> &str {
        self.0
            .split_once(KEY_NAMESPACE_SEPARATOR)
            .map(|(ns, _)| ns)
            .unwrap_or(&self.0)
    }

    /// Consume the key into its string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&CacheKey> for CacheKey {
    fn from(key: &CacheKey) -> Self {
        key.clone()
    }
}

/// Write the canonical JSON form of `value` into `out`.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut members: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            members.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (name, member)) in members.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Display on a string Value yields a quoted, escaped literal.
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(member, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// A compiled wildcard pattern over cache keys.
///
/// `*` matches any run of characters (including none); every other
/// character is literal. `tools:*` matches every key in the `tools`
/// namespace and nothing in `categories`.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    regex: Regex,
}

impl KeyPattern {
    /// Compile a wildcard pattern.
    pub fn new(pattern: &str) -> ToolshedResult<Self> {
        let body = pattern
            .split(KEY_WILDCARD)
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        let regex = RegexBuilder::new(&format!("^{}$", body))
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| ToolshedError::InvalidKey {
                reason: format!("invalid pattern {}: {}", pattern, e),
            })?;

        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    /// Check a key against the pattern.
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// What an invalidation removes.
///
/// An exact key is matched literally, so a key whose parameters contain `*`
/// removes only itself. Patterns are compiled up front and never mistaken for
/// keys.
#[derive(Debug, Clone)]
pub enum Invalidation {
    Key(CacheKey),
    Pattern(KeyPattern),
}

impl Invalidation {
    /// Compile a wildcard pattern target.
    pub fn pattern(pattern: &str) -> ToolshedResult<Self> {
        KeyPattern::new(pattern).map(Self::Pattern)
    }

    /// Whether this invalidation removes `key`.
    pub fn covers(&self, key: &CacheKey) -> bool {
        match self {
            Self::Key(target) => target == key,
            Self::Pattern(pattern) => pattern.matches(key.as_str()),
        }
    }
}

impl From<CacheKey> for Invalidation {
    fn from(key: CacheKey) -> Self {
        Self::Key(key)
    }
}

impl From<&CacheKey> for Invalidation {
    fn from(key: &CacheKey) -> Self {
        Self::Key(key.clone())
    }
}

impl From<KeyPattern> for Invalidation {
    fn from(pattern: KeyPattern) -> Self {
        Self::Pattern(pattern)
    }
}


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
