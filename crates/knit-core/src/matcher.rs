//! The tag matching rule.
//!
//! One rule decides both whether a Data item is nominated to a plan input and
//! whether a plan output feeds a plan input (the edges checked for cycles).

use crate::ids::KnitId;
use crate::tags::{KEY_KNIT_ID, KEY_KNIT_TIMESTAMP, TagSet};
use chrono::{DateTime, Utc};

/// What a Data item or an Output puts up for matching.
#[derive(Debug, Clone, Copy)]
pub struct Offer<'a> {
    user_tags: &'a TagSet,
    knit_id: Option<&'a KnitId>,
    timestamp: Option<DateTime<Utc>>,
}

impl<'a> Offer<'a> {
    pub fn data(
        user_tags: &'a TagSet,
        knit_id: &'a KnitId,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_tags,
            knit_id: Some(knit_id),
            timestamp,
        }
    }

    /// Outputs offer neither identity nor timestamp.
    pub fn output(tags: &'a TagSet) -> Self {
        Self {
            user_tags: tags,
            knit_id: None,
            timestamp: None,
        }
    }
}

/// What an Input asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub user_tags: TagSet,
    pub knit_id: Option<KnitId>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Requirement {
    /// Split an input's tag set into user tags and system constraints.
    ///
    /// Inputs are validated to carry at most one distinct `knit#id` and one
    /// distinct `knit#timestamp`; if more slipped in, the first one wins.
    pub fn from_tags(tags: &TagSet) -> Self {
        Self {
            user_tags: tags.user_tags(),
            knit_id: tags
                .get_all(KEY_KNIT_ID)
                .next()
                .map(|t| KnitId::new(t.value())),
            timestamp: tags
                .get_all(KEY_KNIT_TIMESTAMP)
                .next()
                .and_then(|t| t.as_timestamp()),
        }
    }

    pub fn has_system_constraints(&self) -> bool {
        self.knit_id.is_some() || self.timestamp.is_some()
    }

    /// Inputs without `knit#id` or `knit#timestamp` are fed automatically by
    /// upstream outputs; only these take part in dependency edges.
    pub fn is_automatic(&self) -> bool {
        !self.has_system_constraints()
    }

    /// Whether this requirement can never match anything on its own.
    pub fn is_unsatisfiable(&self) -> bool {
        self.user_tags.is_empty() && !self.has_system_constraints()
    }
}

/// Whether `offer` satisfies `requirement`.
pub fn matches(offer: &Offer<'_>, requirement: &Requirement) -> bool {
    // Empty inputs are only ever fed by manual assignment.
    if requirement.is_unsatisfiable() {
        return false;
    }

    let present = requirement
        .user_tags
        .iter()
        .filter(|t| offer.user_tags.contains(t))
        .count();
    if present != requirement.user_tags.len() {
        return false;
    }

    if let Some(wanted) = &requirement.knit_id {
        if offer.knit_id != Some(wanted) {
            return false;
        }
    }

    if let Some(wanted) = requirement.timestamp {
        if offer.timestamp != Some(wanted) {
            return false;
        }
    }

    true
}
