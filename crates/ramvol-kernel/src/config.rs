//! Volume configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//!
//! ```toml
//! name = "scratch"
//! capacity_blocks = 65536
//! root_mode = 0o700
//! ```

use std::path::Path;

use ramvol_types::MAX_NAME_LENGTH;
use serde::{Deserialize, Serialize};

use crate::error::{VolError, VolResult};

/// Name a fresh volume reports until renamed.
pub const DEFAULT_VOLUME_NAME: &str = "RAMFS";

/// Default permission bits of the root directory: `rwxr-xr-x`.
pub const DEFAULT_ROOT_MODE: u32 = 0o755;

/// A volume name must be non-empty and at most [`MAX_NAME_LENGTH`] bytes.
pub fn check_volume_name(name: &str) -> VolResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(VolError::bad_value(format!("invalid volume name {name:?}")));
    }
    Ok(())
}

/// Volume settings applied at construction and on every mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Volume name.
    pub name: String,
    /// Reported block size in bytes.
    pub block_size: u32,
    /// Blocks the volume advertises as its capacity.
    pub capacity_blocks: u64,
    /// Slots reserved up front in the node identity table.
    pub node_table_capacity: usize,
    /// Slots reserved up front in the directory entry table.
    pub entry_table_capacity: usize,
    /// Permission bits of the root directory.
    pub root_mode: u32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_VOLUME_NAME.to_string(),
            block_size: 4096,
            capacity_blocks: 256 * 1024, // 1 GiB at 4K blocks
            node_table_capacity: 64,
            entry_table_capacity: 64,
            root_mode: DEFAULT_ROOT_MODE,
        }
    }
}

impl VolumeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> VolResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| VolError::bad_value(format!("volume config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> VolResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| VolError::bad_value(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Set the volume name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the root directory permission bits.
    pub fn with_root_mode(mut self, mode: u32) -> Self {
        self.root_mode = mode;
        self
    }

    /// Check the settings a parsed document could get wrong.
    pub fn validate(&self) -> VolResult<()> {
        check_volume_name(&self.name)?;
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(VolError::bad_value(format!(
                "block_size must be a power of two, got {}",
                self.block_size
            )));
        }
        if self.root_mode & !0o7777 != 0 {
            return Err(VolError::bad_value(format!(
                "root_mode has non-permission bits: {:o}",
                self.root_mode
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config = VolumeConfig::from_toml_str("").unwrap();
        assert_eq!(config, VolumeConfig::default());
        assert_eq!(config.name, "RAMFS");
        assert_eq!(config.root_mode, 0o755);
    }

    #[test]
    fn test_partial_override() {
        let config = VolumeConfig::from_toml_str(
            r#"
            name = "scratch"
            capacity_blocks = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "scratch");
        assert_eq!(config.capacity_blocks, 1024);
        assert_eq!(config.block_size, 4096);
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let err = VolumeConfig::from_toml_str("block_size = 1000").unwrap_err();
        assert!(matches!(err, VolError::BadValue(_)));
    }

    #[test]
    fn test_rejects_bad_name() {
        let err = VolumeConfig::from_toml_str("name = \"\"").unwrap_err();
        assert!(matches!(err, VolError::BadValue(_)));
        let long = format!("name = \"{}\"", "n".repeat(MAX_NAME_LENGTH + 1));
        assert!(VolumeConfig::from_toml_str(&long).is_err());
        assert!(VolumeConfig::default().with_name("").validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(VolumeConfig::from_toml_str("name = ").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"from-disk\"").unwrap();
        let config = VolumeConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "from-disk");
    }

    #[test]
    fn test_load_missing_file() {
        let err = VolumeConfig::load("/nonexistent/ramvol.toml").unwrap_err();
        assert!(matches!(err, VolError::BadValue(_)));
    }
}
