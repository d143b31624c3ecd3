//! Subscription filters (NIP-01).
//!
//! A [`Filter`] is an immutable query descriptor. Relays OR the filters of
//! one subscription together; fields within a filter are ANDed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A NIP-01 filter.
///
/// Tag filters are keyed by their wire name (`#e`, `#p`, ...). A `BTreeMap`
/// keeps serialization and equality independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event ids (hex).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Author pubkeys (hex).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Tag value filters, `#<letter>` to accepted values.
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,

    /// Lower time bound (unix seconds), inclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Upper time bound (unix seconds), inclusive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of stored events to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Full-text search (NIP-50).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Filter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Filter on a single-letter tag, e.g. `tag('e', [id])` becomes `"#e": [id]`.
    pub fn tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .insert(format!("#{}", letter), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    /// Structural equality on every field except `since`.
    pub fn eq_ignoring_since(&self, other: &Filter) -> bool {
        self.ids == other.ids
            && self.authors == other.authors
            && self.kinds == other.kinds
            && self.tags == other.tags
            && self.until == other.until
            && self.limit == other.limit
            && self.search == other.search
    }
}
