//! Configuration for sourcebind
//!
//! One TOML file, `configs/core.toml`, holds the framework settings and the
//! engine layout values the rule managers need (virtual table indices,
//! structure offsets). Missing files are created with defaults.
//!
//! # Example
//!
//! ```ignore
//! use sourcebind_core::config::CoreConfig;
//!
//! let config = CoreConfig::load().unwrap_or_default();
//! println!("ShouldHitEntity is vtable slot {}", config.collision.should_hit_entity_index);
//! ```

mod loader;

use std::path::Path;

use serde::{Deserialize, Serialize};
use sourcebind_sdk::MASK_SOLID_CONTENTS;

pub use loader::{base_dir, configs_dir, core_config_path, gamedata_dir, HOME_ENV};

/// Configuration system errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write config file
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config to TOML
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Could not determine config directory
    #[error("Config directory not available - set SOURCEBIND_HOME or load from the plugin directory")]
    NoConfigDirectory,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Layout values for the collision manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionConfig {
    /// Virtual table slot of `ShouldHitEntity` on trace filters
    pub should_hit_entity_index: usize,

    /// Offset of the pass entity pointer in `CTraceFilterSimple`
    pub pass_entity_offset: isize,

    /// Class a filter must derive from to be intercepted
    pub filter_class: String,

    /// Contents that make a trace solid for solid-only rules
    pub solid_mask: u32,

    /// Trace entry points to hook, resolved through gamedata
    pub traces: Vec<TraceHookConfig>,
}

/// A gamedata function that runs a trace with a filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceHookConfig {
    /// Gamedata `functions` entry name
    pub function: String,
    /// Argument index of the trace filter
    pub filter_arg: usize,
    /// Argument index of the contents mask
    pub mask_arg: usize,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            should_hit_entity_index: 0,
            pass_entity_offset: 8,
            filter_class: "CTraceFilterSimple".to_string(),
            solid_mask: MASK_SOLID_CONTENTS,
            traces: Vec::new(),
        }
    }
}

/// Layout values for the transmit manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitConfig {
    /// Argument index of `CCheckTransmitInfo*` in `CheckTransmit`
    pub check_transmit_info_arg: usize,

    /// Offset of the transmit bit vector pointer in `CCheckTransmitInfo`
    pub transmit_bits_offset: isize,

    /// Offset of the client edict pointer in `CCheckTransmitInfo`
    pub client_offset: isize,

    /// Gamedata `functions` entry name of `CheckTransmit`
    pub check_transmit: String,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            check_transmit_info_arg: 1,
            transmit_bits_offset: 8,
            client_offset: 0,
            check_transmit: "CheckTransmit".to_string(),
        }
    }
}

/// Core framework configuration.
///
/// Loaded from `configs/core.toml` under the sourcebind base directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Config version for future migration support
    pub version: u32,

    /// Enable debug logging
    pub debug: bool,

    /// Log filter used when `RUST_LOG` is not set
    pub log_level: String,

    /// Gamedata directory, relative to the base directory
    pub gamedata_path: String,

    pub collision: CollisionConfig,

    pub transmit: TransmitConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            version: 1,
            debug: false,
            log_level: "info".to_string(),
            gamedata_path: "gamedata".to_string(),
            collision: CollisionConfig::default(),
            transmit: TransmitConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load core config from file, creating default if missing.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&core_config_path()?)
    }

    /// Load from an explicit path, creating default if missing.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            tracing::debug!("Loaded core config from {:?}", path);
            Ok(config)
        } else {
            let default = Self::default();
            default.save_to(path)?;
            tracing::info!("Created default core config at {:?}", path);
            Ok(default)
        }
    }

    /// Save core config to file.
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&core_config_path()?)
    }

    /// Save to an explicit path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!("Saved core config to {:?}", path);
        Ok(())
    }

    /// Reload core config from file.
    pub fn reload(&mut self) -> ConfigResult<()> {
        let path = core_config_path()?;
        let content = std::fs::read_to_string(&path)?;
        *self = toml::from_str(&content)?;
        tracing::debug!("Reloaded core config from {:?}", path);
        Ok(())
    }

    /// Log filter: `debug` overrides `log_level`
    pub fn log_filter(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_config_default() {
        let config = CoreConfig::default();
        assert_eq!(config.version, 1);
        assert!(!config.debug);
        assert_eq!(config.log_filter(), "info");
        assert_eq!(config.collision.filter_class, "CTraceFilterSimple");
        assert_eq!(config.collision.solid_mask, MASK_SOLID_CONTENTS);
    }

    #[test]
    fn test_core_config_serialize() {
        let mut config = CoreConfig {
            version: 2,
            debug: true,
            ..Default::default()
        };
        config.transmit.client_offset = 16;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("version = 2"));
        assert!(toml_str.contains("debug = true"));
        assert!(toml_str.contains("[transmit]"));
        assert!(toml_str.contains("client_offset = 16"));
        assert_eq!(config.log_filter(), "debug");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: CoreConfig = toml::from_str(
            r#"
            log_level = "warn"

            [collision]
            should_hit_entity_index = 3

            [[collision.traces]]
            function = "TraceRay"
            filter_arg = 3
            mask_arg = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "warn");
        assert_eq!(config.collision.should_hit_entity_index, 3);
        assert_eq!(config.collision.pass_entity_offset, 8);
        assert_eq!(
            config.collision.traces,
            vec![TraceHookConfig {
                function: "TraceRay".to_string(),
                filter_arg: 3,
                mask_arg: 1,
            }]
        );
        assert_eq!(config.transmit, TransmitConfig::default());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = std::env::temp_dir().join(format!("sourcebind-config-{}", std::process::id()));
        let path = dir.join("configs").join("core.toml");
        let _ = std::fs::remove_dir_all(&dir);

        let created = CoreConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, CoreConfig::default());

        let mut changed = created.clone();
        changed.collision.should_hit_entity_index = 2;
        changed.save_to(&path).unwrap();
        assert_eq!(CoreConfig::load_from(&path).unwrap(), changed);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
