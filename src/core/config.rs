//! Cache configuration
//!
//! Settings shared by every cache created through one registry. Can be built in
//! code or loaded from a TOML file:
//!
//! ```toml
//! build_version = "1.4.0"
//! build_date = "2024-05-01"
//! check_dependencies = true
//! create_directories = true
//! ```

use crate::error::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Stamped into the directory file header
    pub build_version: String,

    /// Stamped into the directory file header
    pub build_date: String,

    /// When false, cached objects are always considered up to date
    pub check_dependencies: bool,

    /// Create missing parent directories when archive files are first written
    pub create_directories: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            build_version: env!("CARGO_PKG_VERSION").to_string(),
            build_date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            check_dependencies: true,
            create_directories: true,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ArchiveError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| ArchiveError::Config(e.to_string()))
    }

    pub fn build_version<S: Into<String>>(mut self, version: S) -> Self {
        self.build_version = version.into();
        self
    }

    pub fn build_date<S: Into<String>>(mut self, date: S) -> Self {
        self.build_date = date.into();
        self
    }

    pub fn check_dependencies(mut self, check: bool) -> Self {
        self.check_dependencies = check;
        self
    }

    pub fn create_directories(mut self, create: bool) -> Self {
        self.create_directories = create;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert!(config.check_dependencies);
        assert!(config.create_directories);
        assert_eq!(config.build_date.len(), 10);
    }

    #[test]
    fn test_partial_toml() {
        let config = CacheConfig::from_toml_str(
            r#"
            build_version = "9.9.9"
            check_dependencies = false
            "#,
        )
        .unwrap();
        assert_eq!(config.build_version, "9.9.9");
        assert!(!config.check_dependencies);
        assert!(config.create_directories);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = CacheConfig::new().build_version("2.0").build_date("2020-01-01");
        let text = config.to_toml_string().unwrap();
        assert_eq!(CacheConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_bad_toml() {
        let result = CacheConfig::from_toml_str("check_dependencies = \"maybe\"");
        assert!(matches!(result, Err(ArchiveError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.toml");
        std::fs::write(&path, "build_date = \"1999-12-31\"\n").unwrap();
        let config = CacheConfig::from_file(&path).unwrap();
        assert_eq!(config.build_date, "1999-12-31");
    }
}
