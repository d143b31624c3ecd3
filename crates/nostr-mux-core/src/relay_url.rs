//! Relay identity.
//!
//! Relays are keyed by a normalized URL so that cosmetic variations of the
//! same endpoint collide in every map.
//!
//! # Normalization Rules
//!
//! - Scheme must be `ws` or `wss`
//! - Scheme and host are lowercased
//! - Default ports (80 for ws, 443 for wss) are dropped
//! - Trailing slashes are removed, the rest of the path is kept as is
//! - Query, fragment and credentials are discarded

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A normalized relay URL.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Parse and normalize a relay URL.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidRelayUrl {
            url: input.to_string(),
            reason: reason.to_string(),
        };

        let parsed = url::Url::parse(input.trim()).map_err(|e| invalid(&e.to_string()))?;

        let scheme = parsed.scheme();
        if scheme != "ws" && scheme != "wss" {
            return Err(invalid("scheme must be ws or wss"));
        }

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;

        let mut normalized = format!("{}://{}", scheme, host.to_ascii_lowercase());
        // `port()` is None when the port is the scheme default.
        if let Some(port) = parsed.port() {
            normalized.push(':');
            normalized.push_str(&port.to_string());
        }
        normalized.push_str(parsed.path().trim_end_matches('/'));

        Ok(Self(normalized))
    }

    /// Borrow the normalized string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for `wss://` relays.
    pub fn is_secure(&self) -> bool {
        self.0.starts_with("wss://")
    }
}

impl FromStr for RelayUrl {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayUrl({})", self.0)
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RelayUrl::parse(&s).map_err(serde::de::Error::custom)
    }
}
