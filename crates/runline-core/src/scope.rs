//! Access scopes for store operations.

use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// The set of records an operation is allowed to see.
///
/// Workers run with the global scope; operations issued on behalf of a
/// project are restricted to that project's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "project_id", rename_all = "snake_case")]
pub enum Scope {
    Global,
    Project(ResourceId),
}

impl Scope {
    pub fn project(project_id: ResourceId) -> Self {
        Scope::Project(project_id)
    }

    /// Project restriction, `None` for the global scope.
    ///
    /// SQL queries bind this as `($n::uuid IS NULL OR project_id = $n)`.
    pub fn project_id(&self) -> Option<ResourceId> {
        match self {
            Scope::Global => None,
            Scope::Project(id) => Some(*id),
        }
    }

    pub fn contains(&self, project_id: ResourceId) -> bool {
        match self {
            Scope::Global => true,
            Scope::Project(id) => *id == project_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_scope_contains_everything() {
        assert!(Scope::Global.contains(ResourceId::new()));
        assert_eq!(Scope::Global.project_id(), None);
    }

    #[test]
    fn test_project_scope_is_restricted() {
        let project = ResourceId::new();
        let scope = Scope::project(project);
        assert!(scope.contains(project));
        assert!(!scope.contains(ResourceId::new()));
        assert_eq!(scope.project_id(), Some(project));
    }
}
