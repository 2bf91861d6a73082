//! Tags and tag sets.
//!
//! A tag is a `key:value` pair. Keys starting with [`SYSTEM_TAG_PREFIX`] are
//! system tags, reserved for facts the engine derives (identity, timestamp,
//! transient state); everything else is a user tag.

use crate::ids::KnitId;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SYSTEM_TAG_PREFIX: &str = "knit#";
pub const KEY_KNIT_ID: &str = "knit#id";
pub const KEY_KNIT_TIMESTAMP: &str = "knit#timestamp";
pub const KEY_KNIT_TRANSIENT: &str = "knit#transient";
pub const VALUE_TRANSIENT_PROCESSING: &str = "processing";
pub const VALUE_TRANSIENT_FAILED: &str = "failed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("not a tag (no ':' found): {0}")]
    Malformed(String),

    #[error("bad format knit#timestamp: {0}")]
    BadTimestamp(String),

    #[error("knit#transient should be one of \"processing\" or \"failed\": {0}")]
    BadTransient(String),
}

/// A single `key:value` tag.
///
/// Key and value are trimmed on construction. `knit#timestamp` values are
/// stored in a canonical UTC form, so two tags naming the same instant in
/// different offsets are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTag", into = "RawTag")]
pub struct Tag {
    key: String,
    value: String,
}

#[derive(Serialize, Deserialize)]
struct RawTag {
    key: String,
    value: String,
}

impl TryFrom<RawTag> for Tag {
    type Error = TagError;

    fn try_from(raw: RawTag) -> Result<Self, Self::Error> {
        Tag::new(raw.key, raw.value)
    }
}

impl From<Tag> for RawTag {
    fn from(tag: Tag) -> Self {
        RawTag {
            key: tag.key,
            value: tag.value,
        }
    }
}

impl Tag {
    pub fn new(key: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self, TagError> {
        let key = key.as_ref().trim();
        let value = value.as_ref().trim();

        let value = match key {
            KEY_KNIT_TIMESTAMP => canonical_timestamp(value)?,
            KEY_KNIT_TRANSIENT => match value {
                VALUE_TRANSIENT_PROCESSING | VALUE_TRANSIENT_FAILED => value.to_string(),
                other => return Err(TagError::BadTransient(other.to_string())),
            },
            _ => value.to_string(),
        };

        Ok(Self {
            key: key.to_string(),
            value,
        })
    }

    /// `knit#id:<id>`
    pub fn knit_id(id: &KnitId) -> Self {
        Self {
            key: KEY_KNIT_ID.to_string(),
            value: id.as_str().to_string(),
        }
    }

    /// `knit#timestamp:<instant>`
    pub fn timestamp(at: DateTime<Utc>) -> Self {
        Self {
            key: KEY_KNIT_TIMESTAMP.to_string(),
            value: format_timestamp(at),
        }
    }

    /// `knit#transient:processing`
    pub fn transient_processing() -> Self {
        Self {
            key: KEY_KNIT_TRANSIENT.to_string(),
            value: VALUE_TRANSIENT_PROCESSING.to_string(),
        }
    }

    /// `knit#transient:failed`
    pub fn transient_failed() -> Self {
        Self {
            key: KEY_KNIT_TRANSIENT.to_string(),
            value: VALUE_TRANSIENT_FAILED.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_system_tag(&self) -> bool {
        self.key.starts_with(SYSTEM_TAG_PREFIX)
    }

    pub fn is_user_tag(&self) -> bool {
        !self.is_system_tag()
    }

    /// The instant of a `knit#timestamp` tag; `None` for any other tag.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        if self.key != KEY_KNIT_TIMESTAMP {
            return None;
        }
        DateTime::parse_from_rfc3339(&self.value)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

impl FromStr for Tag {
    type Err = TagError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let (key, value) = expression
            .split_once(':')
            .ok_or_else(|| TagError::Malformed(expression.to_string()))?;
        Tag::new(key, value)
    }
}

/// Render an instant the way `knit#timestamp` values are stored.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn canonical_timestamp(value: &str) -> Result<String, TagError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| format_timestamp(t.with_timezone(&Utc)))
        .map_err(|_| TagError::BadTimestamp(value.to_string()))
}

/// A normalized set of tags.
///
/// Duplicates collapse on insertion and iteration is ordered by
/// `(key, value)`, so two tag sets built from the same tags in any order are
/// equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    pub fn new(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self(tags.into_iter().collect())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a tag set from `key:value` expressions.
    pub fn parse<I, S>(expressions: I) -> Result<Self, TagError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        expressions
            .into_iter()
            .map(|e| e.as_ref().parse::<Tag>())
            .collect()
    }

    pub fn insert(&mut self, tag: Tag) -> bool {
        self.0.insert(tag)
    }

    pub fn remove(&mut self, tag: &Tag) -> bool {
        self.0.remove(tag)
    }

    pub fn contains(&self, tag: &Tag) -> bool {
        self.0.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    /// The user-tag subset.
    pub fn user_tags(&self) -> TagSet {
        self.0.iter().filter(|t| t.is_user_tag()).cloned().collect()
    }

    /// The system-tag subset.
    pub fn system_tags(&self) -> TagSet {
        self.0.iter().filter(|t| t.is_system_tag()).cloned().collect()
    }

    /// All tags with the given key, in value order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.0.iter().filter(move |t| t.key == key)
    }

    pub fn is_subset(&self, other: &TagSet) -> bool {
        self.0.is_subset(&other.0)
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<T: IntoIterator<Item = Tag>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Tag> for TagSet {
    fn extend<T: IntoIterator<Item = Tag>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

impl IntoIterator for TagSet {
    type Item = Tag;
    type IntoIter = std::collections::btree_set::IntoIter<Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::collections::btree_set::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "TagSet[(empty)]");
        }
        write!(f, "TagSet[")?;
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", tag)?;
        }
        write!(f, "]")
    }
}
