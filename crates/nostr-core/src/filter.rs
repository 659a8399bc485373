//! Subscription filters: the match predicate sent in REQ envelopes.
//!
//! All clauses are optional and an empty filter matches every event.
//! `ids` and `authors` use prefix matching; tag values match exactly.
//! `limit_zero` disambiguates an explicit `limit: 0` from an unset limit,
//! which the wire format alone cannot express.

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::event::{Event, Timestamp};

/// A match predicate over events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Event id prefixes
    pub ids: Option<Vec<String>>,
    /// Author pubkey prefixes
    pub authors: Option<Vec<String>>,
    /// Exact kinds
    pub kinds: Option<Vec<u64>>,
    /// Tag clauses keyed by single letter (serialized as `#x`)
    pub tags: BTreeMap<String, Vec<String>>,
    /// Inclusive lower bound on created_at
    pub since: Option<Timestamp>,
    /// Inclusive upper bound on created_at
    pub until: Option<Timestamp>,
    /// Relay-side result cap; `None` means unset
    pub limit: Option<u64>,
    /// Emit `limit: 0` explicitly instead of treating zero as unset
    pub limit_zero: bool,
    /// Free-text search clause (NIP-50)
    pub search: Option<String>,
}

impl Filter {
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

    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Append values to the `#letter` tag clause.
    pub fn tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(letter.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Shorthand for `#e` event references.
    pub fn event_refs<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag('e', ids)
    }

    /// Shorthand for `#p` pubkey references.
    pub fn pubkey_refs<I, S>(self, pubkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag('p', pubkeys)
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self.limit_zero = limit == 0;
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// True when no clause is populated.
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.tags.is_empty()
            && self.since.is_none()
            && self.until.is_none()
            && self.limit.is_none()
            && !self.limit_zero
            && self.search.is_none()
    }

    fn matches_inner(&self, event: &Event, check_timestamps: bool) -> bool {
        if let Some(ref ids) = self.ids
            && !ids.iter().any(|id| event.id.starts_with(id.as_str()))
        {
            return false;
        }

        if let Some(ref authors) = self.authors
            && !authors.iter().any(|a| event.pubkey.starts_with(a.as_str()))
        {
            return false;
        }

        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if check_timestamps {
            if let Some(since) = self.since
                && event.created_at < since
            {
                return false;
            }
            if let Some(until) = self.until
                && event.created_at > until
            {
                return false;
            }
        }

        for (letter, values) in &self.tags {
            let hit = event.tags.iter().any(|tag| {
                tag.key() == Some(letter.as_str())
                    && tag.value().is_some_and(|v| values.iter().any(|w| w == v))
            });
            if !hit {
                return false;
            }
        }

        if let Some(ref query) = self.search {
            let q = query.to_lowercase();
            if !event.content.to_lowercase().contains(&q) {
                return false;
            }
        }

        true
    }

    /// Every populated clause must match; an empty filter matches all.
    pub fn matches(&self, event: &Event) -> bool {
        self.matches_inner(event, true)
    }

    /// Like [`Filter::matches`] but ignores `since`/`until`, so live
    /// subscriptions accept events whose `created_at` drifts ahead of the
    /// wall clock.
    pub fn matches_ignoring_timestamp(&self, event: &Event) -> bool {
        self.matches_inner(event, false)
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ref ids) = self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(ref authors) = self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(ref kinds) = self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        for (letter, values) in &self.tags {
            map.serialize_entry(&format!("#{letter}"), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        match self.limit {
            Some(0) if !self.limit_zero => {}
            Some(limit) => map.serialize_entry("limit", &limit)?,
            None if self.limit_zero => map.serialize_entry("limit", &0u64)?,
            None => {}
        }
        if let Some(ref search) = self.search {
            map.serialize_entry("search", search)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            ids: Option<Vec<String>>,
            authors: Option<Vec<String>>,
            kinds: Option<Vec<u64>>,
            since: Option<i64>,
            until: Option<i64>,
            limit: Option<u64>,
            search: Option<String>,
            #[serde(flatten)]
            extra: BTreeMap<String, serde_json::Value>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let mut tags = BTreeMap::new();
        for (key, value) in raw.extra {
            let Some(letter) = key.strip_prefix('#') else {
                continue;
            };
            if letter.chars().count() != 1 {
                continue;
            }
            let values: Vec<String> = serde_json::from_value(value)
                .map_err(|e| de::Error::custom(format!("bad tag filter {key}: {e}")))?;
            tags.insert(letter.to_string(), values);
        }

        Ok(Filter {
            ids: raw.ids,
            authors: raw.authors,
            kinds: raw.kinds,
            tags,
            since: raw.since,
            until: raw.until,
            limit_zero: raw.limit == Some(0),
            limit: raw.limit,
            search: raw.search,
        })
    }
}
