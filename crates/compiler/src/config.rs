//! Compiler configuration.
//!
//! Loadable from TOML so build scripts and the playground can share
//! settings with the command line driver.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationOptions {
    /// Rewrite self tail calls into jumps.
    pub tail_call_opt: bool,
    /// Chain blocks for fallthrough before emission.
    pub reorder_blocks: bool,
    /// Drop jumps to the immediately following block.
    pub elide_jumps: bool,
}

impl Default for OptimizationOptions {
    fn default() -> Self {
        OptimizationOptions { tail_call_opt: true, reorder_blocks: true, elide_jumps: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    /// 64-bit slots in the register file.
    pub register_count: usize,
    /// Stack region size in bytes.
    pub stack_size: usize,
}

impl Default for VmSettings {
    fn default() -> Self {
        VmSettings { register_count: 1 << 20, stack_size: 1 << 20 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Directories searched for `<name>.scibin` native libraries.
    pub library_search_paths: Vec<PathBuf>,
    pub optimize: OptimizationOptions,
    pub vm: VmSettings,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_search_paths.push(path.into());
        self
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("invalid config: {}", e))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {}", path.display(), e))?;
        Self::from_toml(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert!(config.library_search_paths.is_empty());
        assert!(config.optimize.elide_jumps);
        assert_eq!(config.vm.register_count, 1 << 20);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = CompilerConfig::from_toml(
            "library_search_paths = [\"/opt/scatha/lib\"]\n\
             [optimize]\n\
             tail_call_opt = false\n",
        )
        .unwrap();
        assert_eq!(config.library_search_paths.len(), 1);
        assert!(!config.optimize.tail_call_opt);
        // Unspecified sections keep their defaults.
        assert!(config.optimize.reorder_blocks);
        assert_eq!(config.vm.stack_size, 1 << 20);
    }

    #[test]
    fn test_invalid_toml_reports() {
        assert!(CompilerConfig::from_toml("optimize = 3").is_err());
    }
}
