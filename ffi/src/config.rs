//! Facade configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Extra library directories, in platform path-list syntax
pub const LIBRARY_PATH_ENV: &str = "CFFI_LIBRARY_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FfiConfig {
    /// Directories searched before the environment and system defaults
    pub search_paths: Vec<PathBuf>,
    /// Declare `size_t`, `int32_t`, ... at construction
    pub bootstrap_integer_types: bool,
}

impl Default for FfiConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            bootstrap_integer_types: true,
        }
    }
}

impl FfiConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults plus any directories listed in `CFFI_LIBRARY_PATH`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(paths) = std::env::var_os(LIBRARY_PATH_ENV) {
            config.search_paths = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        config
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    pub fn with_bootstrap(mut self, enabled: bool) -> Self {
        self.bootstrap_integer_types = enabled;
        self
    }
}
