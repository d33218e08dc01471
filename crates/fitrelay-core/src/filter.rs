//! Subscription filters and event matching.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A single filter: every populated field narrows the match; an entirely
/// empty filter matches nothing (a deliberate guard against accidental
/// fleet queries), and a present-but-empty list (e.g. `kinds: []`) is a
/// narrowing filter that matches nothing, not an absent one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,

    /// Dynamic per-tag-letter inclusion sets, e.g. `"#t": ["chest"]`.
    ///
    /// Not `Option`: serde's flatten deserializer always calls `visit_some`
    /// for a flattened field, so an `Option` here would deserialize to
    /// `Some(<empty map>)` whenever no `#x` key is present on the wire,
    /// never `None`. A plain map with `#[serde(default)]` distinguishes
    /// "no tag constraint" (empty map) correctly.
    #[serde(flatten)]
    #[serde(default)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.tags.is_empty()
            && self.since.is_none()
            && self.until.is_none()
    }

    /// Does this event satisfy every populated constraint?
    pub fn matches(&self, event: &Event) -> bool {
        if self.is_empty() {
            return false;
        }

        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }

        for (tag_name, tag_values) in &self.tags {
            let tag_key = tag_name.trim_start_matches('#');
            let has_match = event.tags.iter().any(|tag| {
                tag.first().map(String::as_str) == Some(tag_key)
                    && tag.get(1).is_some_and(|v| tag_values.iter().any(|fv| fv == v))
            });
            if !has_match {
                return false;
            }
        }

        true
    }

    /// The effective limit for this filter per the Query Engine contract:
    /// `limit = 0` yields no results, a missing limit defers to the caller's
    /// implementation maximum.
    pub fn effective_limit(&self, implementation_max: usize) -> usize {
        self.limit.unwrap_or(implementation_max)
    }
}

/// Does an event match at least one filter in the set?
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}
