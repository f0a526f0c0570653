//! Projects and their settings.

use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Header prepended to inline code that does not start with a shebang.
pub const DEFAULT_CODE_HEADER: &str = "#!/bin/sh\n\nset -eu\n\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ResourceId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub id: ResourceId,
    pub code_header: String,
}

impl ProjectSettings {
    pub fn new(project_id: ResourceId) -> Self {
        Self {
            id: project_id,
            code_header: DEFAULT_CODE_HEADER.to_string(),
        }
    }
}
