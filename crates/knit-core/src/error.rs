//! Error types for the knit engine.

use crate::ids::PlanId;
use crate::plan::ValidationError;
use crate::tags::TagError;
use thiserror::Error;

/// Boxed error from a store or transport, kept intact for callers to inspect.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    // Validation errors
    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] ValidationError),

    #[error("Unacceptable tag: {0}")]
    InvalidTag(#[from] TagError),

    // Conflicts with the registered catalog
    #[error("Equivalent plan already exists: {0}")]
    EquivalentPlanExists(PlanId),

    #[error("Plan dependency makes a cycle (through {plan_id})")]
    CyclicDependency { plan_id: PlanId },

    // Lookups
    #[error("{entity} not found: {id}")]
    Missing { entity: &'static str, id: String },

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(#[source] BoxError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a store error, preserving it as the source.
    pub fn database(err: impl Into<BoxError>) -> Self {
        Error::Database(err.into())
    }

    pub fn missing(entity: &'static str, id: impl ToString) -> Self {
        Error::Missing {
            entity,
            id: id.to_string(),
        }
    }

    /// The request itself was malformed; retrying it unchanged cannot succeed.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::InvalidPlan(_) | Error::InvalidTag(_))
    }

    /// The request conflicts with plans already registered.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::EquivalentPlanExists(_) | Error::CyclicDependency { .. }
        )
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Error::Missing { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinguishable() {
        let equiv = Error::EquivalentPlanExists(PlanId::new());
        assert!(equiv.is_conflict());
        assert!(!equiv.is_validation());

        let cyclic = Error::CyclicDependency {
            plan_id: PlanId::new(),
        };
        assert!(cyclic.is_conflict());

        let invalid = Error::InvalidPlan(ValidationError::NoInputs);
        assert!(invalid.is_validation());
        assert!(!invalid.is_conflict());

        assert!(Error::missing("plan", "plan_x").is_missing());
    }

    #[test]
    fn test_database_error_keeps_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::database(io);
        let source = err.source().expect("source");
        assert!(source.downcast_ref::<std::io::Error>().is_some());
    }
}
