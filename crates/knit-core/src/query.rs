//! Plan search.

use crate::ids::KnitId;
use crate::plan::Plan;
use crate::tags::{KEY_KNIT_ID, KEY_KNIT_TIMESTAMP, TagSet};
use chrono::{DateTime, Utc};

/// Filter for registered plans.
///
/// Every criterion left unset matches any plan. Tag criteria are supersets:
/// a plan matches when one of its inputs carries all `input_tags`, and one
/// of its outputs (the log included) carries all `output_tags`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanQuery {
    /// `None` matches both active and inactive plans.
    pub active: Option<bool>,
    pub image: Option<String>,
    pub version: Option<String>,
    pub input_tags: TagSet,
    pub output_tags: TagSet,
}

impl PlanQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    /// Restrict to `image`, and to `version` unless it is empty.
    pub fn with_image(mut self, image: impl Into<String>, version: impl Into<String>) -> Self {
        let version = version.into();
        self.image = Some(image.into());
        self.version = (!version.is_empty()).then_some(version);
        self
    }

    pub fn with_input_tags(mut self, tags: TagSet) -> Self {
        self.input_tags = tags;
        self
    }

    pub fn with_output_tags(mut self, tags: TagSet) -> Self {
        self.output_tags = tags;
        self
    }

    /// Whether no plan can ever match.
    ///
    /// Outputs never carry system tags, inputs never ask for transient data,
    /// and one input cannot be pinned to two identities or two instants.
    pub fn is_unsatisfiable(&self) -> bool {
        if self.output_tags.iter().any(|t| t.is_system_tag()) {
            return true;
        }

        let system = self.input_tags.system_tags();
        if system
            .iter()
            .any(|t| t.key() != KEY_KNIT_ID && t.key() != KEY_KNIT_TIMESTAMP)
        {
            return true;
        }

        system.get_all(KEY_KNIT_ID).count() > 1 || system.get_all(KEY_KNIT_TIMESTAMP).count() > 1
    }

    fn knit_id(&self) -> Option<KnitId> {
        self.input_tags
            .get_all(KEY_KNIT_ID)
            .next()
            .map(|t| KnitId::new(t.value()))
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.input_tags
            .get_all(KEY_KNIT_TIMESTAMP)
            .next()
            .and_then(|t| t.as_timestamp())
    }

    pub fn matches(&self, plan: &Plan) -> bool {
        if self.is_unsatisfiable() {
            return false;
        }

        if self.active.is_some_and(|active| active != plan.body.active) {
            return false;
        }
        if self.image.as_ref().is_some_and(|image| *image != plan.body.image) {
            return false;
        }
        if self
            .version
            .as_ref()
            .is_some_and(|version| *version != plan.body.version)
        {
            return false;
        }

        if !self.output_tags.is_empty()
            && !plan
                .feeding_outputs()
                .iter()
                .any(|o| self.output_tags.is_subset(&o.tags))
        {
            return false;
        }

        let user_tags = self.input_tags.user_tags();
        if !user_tags.is_empty()
            && !plan.inputs.iter().any(|i| user_tags.is_subset(&i.tags))
        {
            return false;
        }

        let knit_id = self.knit_id();
        let timestamp = self.timestamp();
        if knit_id.is_none() && timestamp.is_none() {
            return true;
        }
        plan.inputs.iter().any(|i| {
            let requirement = i.requirement();
            knit_id.as_ref().is_none_or(|id| requirement.knit_id.as_ref() == Some(id))
                && timestamp.is_none_or(|at| requirement.timestamp == Some(at))
        })
    }

    /// Matching plans ordered by id.
    pub fn filter<'a>(&self, plans: impl IntoIterator<Item = &'a Plan>) -> Vec<Plan> {
        if self.is_unsatisfiable() {
            return Vec::new();
        }
        let mut found: Vec<Plan> = plans
            .into_iter()
            .filter(|p| self.matches(p))
            .cloned()
            .collect();
        found.sort_by_key(|p| p.id());
        found
    }
}
