//! HID Function implementation for USB Gadget

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::configfs::ResourceTree;
use super::function::{FunctionMeta, GadgetFunction};
use super::report_desc::{CompiledDescriptor, DescriptorProgram, DesktopUsage};
use crate::error::{AppError, Result};

/// HID interface subclass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HidSubclass {
    #[default]
    None,
    BootInterface,
}

impl HidSubclass {
    pub fn value(self) -> u8 {
        match self {
            HidSubclass::None => 0,
            HidSubclass::BootInterface => 1,
        }
    }
}

/// HID interface protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HidProtocol {
    #[default]
    None,
    Keyboard,
    Mouse,
}

impl HidProtocol {
    pub fn value(self) -> u8 {
        match self {
            HidProtocol::None => 0,
            HidProtocol::Keyboard => 1,
            HidProtocol::Mouse => 2,
        }
    }
}

/// HID Function for USB Gadget
#[derive(Debug, Clone)]
pub struct HidFunction {
    /// Position among the gadget's HID functions, used for /dev/hidgN
    index: u8,
    /// Function name (e.g., "hid.usb0")
    name: String,
    usage: DesktopUsage,
    subclass: HidSubclass,
    protocol: HidProtocol,
    descriptor: CompiledDescriptor,
}

impl HidFunction {
    /// Create a HID function from a compiled descriptor
    ///
    /// `instance` is the configfs instance name ("usb0"), `index` the
    /// function's position in creation order.
    pub fn new(
        index: u8,
        instance: &str,
        usage: DesktopUsage,
        subclass: HidSubclass,
        protocol: HidProtocol,
        descriptor: CompiledDescriptor,
    ) -> Self {
        Self {
            index,
            name: format!("hid.{}", instance),
            usage,
            subclass,
            protocol,
            descriptor,
        }
    }

    pub fn descriptor(&self) -> &CompiledDescriptor {
        &self.descriptor
    }

    /// Bytes per report, as written to `report_length`
    pub fn report_length(&self) -> u32 {
        self.descriptor.geometry.total_bytes
    }

    /// Get function path in gadget
    fn function_path(&self, gadget_path: &Path) -> PathBuf {
        gadget_path.join("functions").join(self.name())
    }

    /// Get expected device path (e.g., /dev/hidg0)
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/hidg{}", self.index))
    }

    fn attributes(&self) -> [(&'static str, String); 3] {
        [
            ("protocol", self.protocol.value().to_string()),
            ("subclass", self.subclass.value().to_string()),
            ("report_length", self.report_length().to_string()),
        ]
    }

    /// Whether the function directory already holds exactly this function
    ///
    /// The stored `report_desc` is decoded and compared item by item, so an
    /// unreadable or foreign descriptor counts as stale.
    pub fn is_current(&self, tree: &dyn ResourceTree, gadget_path: &Path) -> Result<bool> {
        let func_path = self.function_path(gadget_path);

        for (attr, expected) in self.attributes() {
            match tree.read_attribute(&func_path.join(attr)) {
                Ok(value) if value == expected => {}
                Ok(_) | Err(AppError::NotFound { .. }) => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        let stored = match tree.read_bytes(&func_path.join("report_desc")) {
            Ok(bytes) => bytes,
            Err(AppError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        match DescriptorProgram::parse(&stored) {
            Ok(program) => Ok(program == self.descriptor.program),
            Err(e) => {
                warn!(function = self.name(), "Existing report descriptor unreadable: {}", e);
                Ok(false)
            }
        }
    }
}

impl GadgetFunction for HidFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> FunctionMeta {
        FunctionMeta {
            name: self.name.clone(),
            description: format!(
                "{:?} with {} buttons",
                self.usage, self.descriptor.geometry.total_bits
            ),
            report_length: self.report_length(),
        }
    }

    fn create(&self, tree: &dyn ResourceTree, gadget_path: &Path) -> Result<()> {
        let func_path = self.function_path(gadget_path);
        tree.create_dir(&func_path)?;

        for (attr, value) in self.attributes() {
            let path = func_path.join(attr);
            tree.write_attribute(&path, &value).map_err(|e| {
                error!(path = %path.display(), %value, code = e.code(), "Failed to write HID attribute: {}", e);
                e
            })?;
        }

        // The kernel expects the whole descriptor in one write
        let desc_path = func_path.join("report_desc");
        tree.write_bytes(&desc_path, &self.descriptor.bytes)
            .map_err(|e| {
                error!(
                    path = %desc_path.display(),
                    length = self.descriptor.bytes.len(),
                    code = e.code(),
                    "Failed to write report descriptor: {}",
                    e
                );
                e
            })?;

        debug!(
            "Created HID function: {} ({} bytes/report, {} byte descriptor)",
            self.name(),
            self.report_length(),
            self.descriptor.bytes.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otg::memory::MemoryTree;
    use crate::otg::report_desc::gamepad_descriptor;

    fn function() -> HidFunction {
        HidFunction::new(
            0,
            "usb0",
            DesktopUsage::Gamepad,
            HidSubclass::None,
            HidProtocol::None,
            gamepad_descriptor(24).unwrap(),
        )
    }

    #[test]
    fn test_hid_function_names() {
        let func = function();
        assert_eq!(func.name(), "hid.usb0");
        assert_eq!(func.device_path(), PathBuf::from("/dev/hidg0"));
        assert_eq!(func.meta().report_length, 3);
    }

    #[test]
    fn test_create_writes_attributes() {
        let tree = MemoryTree::new();
        tree.create_dir(Path::new("pad")).unwrap();
        let func = function();
        func.create(&tree, Path::new("pad")).unwrap();

        let base = Path::new("pad/functions/hid.usb0");
        assert_eq!(tree.attr(base.join("protocol")).as_deref(), Some("0"));
        assert_eq!(tree.attr(base.join("subclass")).as_deref(), Some("0"));
        assert_eq!(tree.attr(base.join("report_length")).as_deref(), Some("3"));
        assert_eq!(
            tree.bytes(base.join("report_desc")).unwrap(),
            func.descriptor().bytes
        );
        assert_eq!(tree.writes_to(base.join("report_desc")), 1);
    }

    #[test]
    fn test_is_current() {
        let tree = MemoryTree::new();
        let gadget = Path::new("pad");
        tree.create_dir(gadget).unwrap();
        let func = function();
        assert!(!func.is_current(&tree, gadget).unwrap());

        func.create(&tree, gadget).unwrap();
        assert!(func.is_current(&tree, gadget).unwrap());

        // Same attributes, different buttons
        let desc_path = Path::new("pad/functions/hid.usb0/report_desc");
        let mut other = gamepad_descriptor(20).unwrap().bytes;
        tree.write_bytes(desc_path, &other).unwrap();
        assert!(!func.is_current(&tree, gadget).unwrap());

        other.truncate(3);
        tree.write_bytes(desc_path, &other).unwrap();
        assert!(!func.is_current(&tree, gadget).unwrap());

        func.create(&tree, gadget).unwrap();
        tree.write_attribute(Path::new("pad/functions/hid.usb0/protocol"), "2")
            .unwrap();
        assert!(!func.is_current(&tree, gadget).unwrap());
    }

    #[test]
    fn test_boot_mouse_values() {
        assert_eq!(HidSubclass::BootInterface.value(), 1);
        assert_eq!(HidProtocol::Mouse.value(), 2);
        assert_eq!(HidProtocol::Keyboard.value(), 1);
    }
}
