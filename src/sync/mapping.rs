//! Resolves a watched path to its file mapping.

use std::path::Path;

use crate::config::FileMapping;

/// Immutable lookup over the configured mappings.
#[derive(Debug, Clone, Default)]
pub struct MappingResolver {
    mappings: Vec<FileMapping>,
}

impl MappingResolver {
    pub fn new(mappings: Vec<FileMapping>) -> Self {
        Self { mappings }
    }

    /// First enabled mapping whose `file_path` equals `path` exactly.
    /// Unmapped and disabled paths both resolve to `None`.
    pub fn resolve(&self, path: &Path) -> Option<&FileMapping> {
        self.mappings
            .iter()
            .find(|m| m.enabled && m.file_path.as_path() == path)
    }
}
