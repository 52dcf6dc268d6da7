//! OTG USB Gadget management
//!
//! Compiles HID report descriptors and stands up the configfs gadget that
//! exposes them to a USB host.
//!
//! Architecture:
//! ```text
//! OtgGadgetManager (gadget lifecycle, GadgetState)
//!     ├── ResourceTree (ConfigFs, or MemoryTree in tests)
//!     └── HidFunction (compiled descriptor + geometry)
//! ```

pub mod configfs;
pub mod function;
pub mod hid;
pub mod manager;
#[cfg(test)]
pub(crate) mod memory;
pub mod report_desc;

pub use configfs::{ConfigFs, NodeKind, NodeState, ResourceTree};
pub use function::{FunctionMeta, GadgetFunction};
pub use hid::{HidFunction, HidProtocol, HidSubclass};
pub use manager::{wait_for_hid_devices, DeviceConfiguration, GadgetState, OtgGadgetManager};
pub use report_desc::{
    compile_buttons, compute_geometry, gamepad_descriptor, CompiledDescriptor, DescriptorBuilder,
    DescriptorProgram, DesktopUsage, ReportGeometry,
};
