//! USB Gadget Function trait definition

use std::path::Path;

use tracing::debug;

use super::configfs::{NodeKind, ResourceTree};
use crate::error::{AppError, Result};

/// Function metadata
#[derive(Debug, Clone)]
pub struct FunctionMeta {
    /// Function name (e.g., "hid.usb0")
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Bytes per report written to the endpoint
    pub report_length: u32,
}

/// USB Gadget Function trait
///
/// `gadget_path` and `config_path` are relative to the resource tree base.
pub trait GadgetFunction: Send + Sync {
    /// Get function name (e.g., "hid.usb0")
    fn name(&self) -> &str;

    /// Get function metadata
    fn meta(&self) -> FunctionMeta;

    /// Create function directory and attributes
    fn create(&self, tree: &dyn ResourceTree, gadget_path: &Path) -> Result<()>;

    /// Link function to configuration
    ///
    /// A link that already points at this function is left alone; anything
    /// else at the link path is a conflict.
    fn link(&self, tree: &dyn ResourceTree, config_path: &Path, gadget_path: &Path) -> Result<()> {
        let target = gadget_path.join("functions").join(self.name());
        let link = config_path.join(self.name());

        match tree.kind(&link) {
            NodeKind::Missing | NodeKind::Inaccessible => {
                tree.link(&target, &link)?;
                debug!("Linked function {} to {}", self.name(), config_path.display());
                Ok(())
            }
            NodeKind::Link => match tree.link_target(&link)? {
                Some(existing) if existing == target => {
                    debug!("Function {} already linked", self.name());
                    Ok(())
                }
                existing => Err(AppError::LinkConflict {
                    link: link.display().to_string(),
                    existing: existing
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<unresolved>".to_string()),
                    wanted: target.display().to_string(),
                }),
            },
            kind => Err(AppError::LinkConflict {
                link: link.display().to_string(),
                existing: format!("{:?}", kind).to_lowercase(),
                wanted: target.display().to_string(),
            }),
        }
    }

    /// Unlink function from configuration
    fn unlink(&self, tree: &dyn ResourceTree, config_path: &Path) -> Result<()> {
        let link = config_path.join(self.name());
        if tree.kind(&link) == NodeKind::Link {
            tree.unlink(&link)?;
            debug!("Unlinked function {} from {}", self.name(), config_path.display());
        }
        Ok(())
    }

    /// Cleanup function directory
    fn cleanup(&self, tree: &dyn ResourceTree, gadget_path: &Path) -> Result<()> {
        let path = gadget_path.join("functions").join(self.name());
        tree.remove_dir(&path)?;
        debug!("Removed function {}", self.name());
        Ok(())
    }
}
