use crate::{Kind, Phase, ResourceId, Version};

/// Errors returned by state operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("resource {0} doesn't exist")]
    NotFound(ResourceId),
    #[error("resource {0} already exists")]
    AlreadyExists(ResourceId),
    #[error("resource {id} update conflict: expected version {expected}, current version {current}")]
    ConflictingVersion { id: ResourceId, expected: Version, current: Version },
    #[error("resource {id} has pending finalizers {finalizers:?}")]
    HasFinalizers { id: ResourceId, finalizers: Vec<String> },
    #[error("resource {id} is owned by {owner:?}, attempted mutation as {actor:?}")]
    OwnershipViolation { id: ResourceId, owner: String, actor: String },
    #[error("resource {id} is in phase {phase}")]
    PhaseConflict { id: ResourceId, phase: Phase },
    #[error("kind {0} is not registered")]
    UnknownKind(Kind),
    #[error("resource {id} holds kind {actual}, expected {expected}")]
    TypeMismatch { id: ResourceId, expected: Kind, actual: Kind },
    #[error("invalid resource: {0}")]
    Invalid(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("watch buffer overflowed, re-subscribe required")]
    WatchOverflow,
}

impl StateError {
    pub fn is_not_found(&self) -> bool { matches!(self, StateError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StateError::ConflictingVersion { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StateError::AlreadyExists(_)) }
    pub fn is_cancelled(&self) -> bool { matches!(self, StateError::Cancelled) }
}

pub type StateResult<T> = Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        let id = ResourceId::new("ns", Kind("K"), "a");
        assert!(StateError::NotFound(id.clone()).is_not_found());
        assert!(StateError::ConflictingVersion { id, expected: 1, current: 2 }.is_conflict());
        assert!(!StateError::Cancelled.is_not_found());
    }
}
