//! Pipeline configuration: external tools, discovery patterns and timeouts.
//!
//! Loaded from TOML. Every section is optional and falls back to defaults that
//! fetch with Homebrew, build with `configure && make`, split debug symbols
//! with `dsymutil` and export `.bntl` type libraries.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, HarvestResult};
use crate::stage::{CommandTemplate, PLACEHOLDERS};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarvestConfig {
    pub tools: ToolsConfig,
    pub discovery: DiscoveryConfig,
    pub timeouts: TimeoutConfig,
}

/// Command templates for each external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    pub fetch: CommandTemplate,
    pub build: CommandTemplate,
    pub debug_symbols: CommandTemplate,
    pub extract_types: CommandTemplate,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fetch: CommandTemplate::new(
                "brew",
                ["unpack", "--destdir", "{build_dir}", "{package}"],
            ),
            build: CommandTemplate::new("sh", ["-c", "./configure && make"]),
            debug_symbols: CommandTemplate::new("dsymutil", ["{file}"]),
            extract_types: CommandTemplate::new(
                "binja-import-dwarf",
                [
                    "{file}",
                    "--dwarf-file",
                    "{dwarf_file}",
                    "--type-library",
                    "{type_library}",
                ],
            ),
        }
    }
}

/// Which files the post-processing and collecting stages operate on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Base-name glob for build artifacts.
    pub artifact_glob: String,

    /// Paths containing this substring are ignored. Empty disables it.
    pub exclude_substring: String,

    /// Base-name glob for generated type libraries.
    pub output_glob: String,

    /// Fail a file's type extraction up front when its DWARF file is missing.
    pub require_debug_symbols: bool,

    /// Extension given to type-library paths, without the dot.
    pub type_library_extension: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            artifact_glob: "*.dylib".to_string(),
            exclude_substring: ".dSYM".to_string(),
            output_glob: "*.bntl".to_string(),
            require_debug_symbols: true,
            type_library_extension: "bntl".to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn exclude(&self) -> Option<&str> {
        Some(self.exclude_substring.as_str()).filter(|s| !s.is_empty())
    }
}

/// Timeouts in seconds. Zero disables the timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Applies to the fetch and build commands.
    pub stage_secs: u64,

    /// Applies to each per-file command.
    pub file_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stage_secs: 7200,
            file_secs: 1800,
        }
    }
}

impl TimeoutConfig {
    pub fn stage(&self) -> Option<Duration> {
        (self.stage_secs > 0).then(|| Duration::from_secs(self.stage_secs))
    }

    pub fn file(&self) -> Option<Duration> {
        (self.file_secs > 0).then(|| Duration::from_secs(self.file_secs))
    }
}

impl HarvestConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(input: &str) -> HarvestResult<Self> {
        let config: HarvestConfig =
            toml::from_str(input).map_err(|e| HarvestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> HarvestResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> HarvestResult<()> {
        let tools = [
            ("fetch", &self.tools.fetch),
            ("build", &self.tools.build),
            ("debug_symbols", &self.tools.debug_symbols),
            ("extract_types", &self.tools.extract_types),
        ];
        for (name, template) in tools {
            if template.program.trim().is_empty() {
                return Err(HarvestError::Config(format!("tools.{} has an empty program", name)));
            }
            let placeholders = template
                .placeholders()
                .map_err(|e| HarvestError::Config(format!("tools.{}: {}", name, e)))?;
            let unknown = placeholders
                .iter()
                .find(|p| !PLACEHOLDERS.contains(&p.as_str()));
            if let Some(unknown) = unknown {
                return Err(HarvestError::Config(format!(
                    "tools.{} uses unknown placeholder {{{}}}",
                    name, unknown
                )));
            }
        }

        for (name, pattern) in [
            ("artifact_glob", &self.discovery.artifact_glob),
            ("output_glob", &self.discovery.output_glob),
        ] {
            glob::Pattern::new(pattern).map_err(|e| {
                HarvestError::Config(format!("discovery.{} '{}': {}", name, pattern, e))
            })?;
        }

        let ext = self.discovery.type_library_extension.trim_start_matches('.');
        if ext.is_empty() {
            return Err(HarvestError::Config(
                "discovery.type_library_extension must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
