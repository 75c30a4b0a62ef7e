//! Request key derivation.
//!
//! Every unit of cacheable work is named by a [`RequestKey`]: a plain string
//! built from escaped components joined with [`KEY_DELIMITER`]. Components are
//! percent-encoded, so the delimiter never appears inside one and two different
//! component lists can never produce the same key.
//!
//! # Key shapes
//!
//! ```text
//! src|<locator>|<mode>                     decoded source image
//! src|<locator>|still|xform|<signature>    transformed image
//! <base>|tile|<level>|<x>|<y>              deep-zoom tile of <base>
//! ```

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::decode::DecodeMode;
use crate::fetch::Locator;
use crate::transform::TransformChain;

/// Separator between key components.
pub const KEY_DELIMITER: char = '|';

/// Deterministic identifier for a unit of work.
///
/// Two requests are the same work if and only if their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(Arc<str>);

impl RequestKey {
    /// Wrap an already-composed key string without escaping.
    pub fn from_raw(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    /// Compose a key from raw components, escaping each one.
    pub fn from_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = String::new();
        push_parts(&mut out, parts);
        Self(out.into())
    }

    /// Key of the decoded (untransformed) source image.
    pub fn source(locator: &Locator, mode: DecodeMode) -> Self {
        Self::from_parts(["src", locator.as_str(), mode.tag()])
    }

    /// Key of this image after `chain` is applied.
    ///
    /// An empty chain leaves the key unchanged.
    pub fn with_transforms(&self, chain: &TransformChain) -> Self {
        if chain.is_empty() {
            return self.clone();
        }
        let signature = chain.signature();
        self.append(["xform", signature.as_str()])
    }

    /// Key of the deep-zoom tile `(level, x, y)` of this image.
    pub fn tile(&self, level: u32, x: u32, y: u32) -> Self {
        let (level, x, y) = (level.to_string(), x.to_string(), y.to_string());
        self.append(["tile", level.as_str(), x.as_str(), y.as_str()])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Content fingerprint used to name persisted entries.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.as_str())
    }

    fn append<'a>(&self, parts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = String::from(self.as_str());
        push_parts(&mut out, parts);
        Self(out.into())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RequestKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Percent-encode a single key component.
pub fn escape_component(component: &str) -> Cow<'_, str> {
    urlencoding::encode(component)
}

/// Hex SHA-256 of a key string.
pub fn fingerprint(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn push_parts<'a>(out: &mut String, parts: impl IntoIterator<Item = &'a str>) {
    for part in parts {
        if !out.is_empty() {
            out.push(KEY_DELIMITER);
        }
        out.push_str(&escape_component(part));
    }
}
