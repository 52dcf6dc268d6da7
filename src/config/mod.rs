//! Gadget layout and remote mapping configuration
//!
//! Both files are YAML. A missing gadget config falls back to
//! [`GadgetConfig::default`], the reference 24-button gamepad.

mod schema;

pub use schema::*;

use std::path::Path;

use tracing::debug;

use crate::error::{AppError, Result};

impl GadgetConfig {
    /// Load a gadget layout from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: GadgetConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a gadget layout from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| AppError::from_io(path, e))?;
        let config: GadgetConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        debug!(path = %path.display(), gadget = %config.name, "Loaded gadget config");
        Ok(config)
    }

    /// Load from `path` when given, otherwise the default layout
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_yaml_file(path),
            None => Ok(Self::default()),
        }
    }
}

impl MappingDefinition {
    /// Load a mapping from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mapping: MappingDefinition = serde_yaml::from_str(content)?;
        Ok(mapping)
    }

    /// Load a mapping from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| AppError::from_io(path, e))?;
        let mapping: MappingDefinition = serde_yaml::from_reader(file)?;
        debug!(
            path = %path.display(),
            name = %mapping.name,
            entries = mapping.mappings.len(),
            "Loaded mapping"
        );
        Ok(mapping)
    }
}
