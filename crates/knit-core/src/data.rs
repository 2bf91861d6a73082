//! Data items ("knits") as the matcher sees them.

use crate::ids::{KnitId, RunId};
use crate::matcher::Offer;
use crate::run::RunStatus;
use crate::tags::{Tag, TagSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A data item with its user tags and the facts its system tags derive from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnitData {
    pub knit_id: KnitId,
    /// Run which produced this data.
    pub run_id: RunId,
    pub run_status: RunStatus,
    /// User tags explicitly attached to the data.
    pub user_tags: TagSet,
    pub timestamp: Option<DateTime<Utc>>,
}

impl KnitData {
    /// Whether this data takes part in nomination at all.
    pub fn is_eligible(&self) -> bool {
        self.run_status.is_done()
    }

    /// Full tag set: user tags plus the derived `knit#id`, `knit#timestamp`
    /// and `knit#transient` system tags.
    pub fn tags(&self) -> TagSet {
        let mut tags = self.user_tags.user_tags();
        tags.insert(Tag::knit_id(&self.knit_id));
        if let Some(at) = self.timestamp {
            tags.insert(Tag::timestamp(at));
        }
        if self.run_status.is_unterminated() {
            tags.insert(Tag::transient_processing());
        } else if self.run_status.is_failed() {
            tags.insert(Tag::transient_failed());
        }
        tags
    }

    /// What this data offers to plan inputs.
    pub fn offer(&self) -> Offer<'_> {
        Offer::data(&self.user_tags, &self.knit_id, self.timestamp)
    }
}
