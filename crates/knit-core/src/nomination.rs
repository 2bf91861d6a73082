//! The Nomination relation: which Data currently satisfy which plan Inputs.
//!
//! Rows are derived; re-running the matcher over the same catalog reproduces
//! them. The relation is maintained per scope: a scope names the Data (or the
//! Inputs) whose rows are recomputed, and nothing outside it is touched.

use crate::ids::{InputId, KnitId, PlanId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity of a nomination row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NominationKey {
    pub knit_id: KnitId,
    pub input_id: InputId,
}

impl NominationKey {
    pub fn new(knit_id: KnitId, input_id: InputId) -> Self {
        Self { knit_id, input_id }
    }
}

/// A stored nomination row, with the plan owning the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nomination {
    pub knit_id: KnitId,
    pub input_id: InputId,
    pub plan_id: PlanId,
    /// Set when the row is first inserted; consumers clear it once they have
    /// acted on the new nomination.
    pub updated: bool,
}

impl Nomination {
    pub fn key(&self) -> NominationKey {
        NominationKey::new(self.knit_id.clone(), self.input_id)
    }
}

/// The part of the relation a maintenance call recomputes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NominationScope {
    /// Every row whose Data is in the set.
    Data(BTreeSet<KnitId>),
    /// Every row whose Input is in the set.
    Inputs(BTreeSet<InputId>),
}

impl NominationScope {
    pub fn data(ids: impl IntoIterator<Item = KnitId>) -> Self {
        NominationScope::Data(ids.into_iter().collect())
    }

    pub fn inputs(ids: impl IntoIterator<Item = InputId>) -> Self {
        NominationScope::Inputs(ids.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            NominationScope::Data(ids) => ids.is_empty(),
            NominationScope::Inputs(ids) => ids.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            NominationScope::Data(ids) => ids.len(),
            NominationScope::Inputs(ids) => ids.len(),
        }
    }

    pub fn contains(&self, key: &NominationKey) -> bool {
        match self {
            NominationScope::Data(ids) => ids.contains(&key.knit_id),
            NominationScope::Inputs(ids) => ids.contains(&key.input_id),
        }
    }
}

/// Changes that turn the stored rows of a scope into the desired rows.
///
/// Rows present on both sides appear in neither list, so their `updated`
/// flag survives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NominationDiff {
    pub stale: Vec<NominationKey>,
    pub fresh: Vec<NominationKey>,
}

impl NominationDiff {
    pub fn between(
        current: impl IntoIterator<Item = NominationKey>,
        desired: &BTreeSet<NominationKey>,
    ) -> Self {
        let current: BTreeSet<NominationKey> = current.into_iter().collect();
        Self {
            stale: current.difference(desired).cloned().collect(),
            fresh: desired.difference(&current).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.fresh.is_empty()
    }
}
