//! Virtual gamepad backend (uinput)
//!
//! Creates a local input device exposing the mapped keys. Each press and
//! release is emitted with its own SYN_REPORT.

use async_trait::async_trait;
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::backend::HidBackend;
use super::keymap::KEY_MAX;
use super::types::OutputMode;
use crate::error::{AppError, Result};

/// Default name of the virtual device
pub const VIRTUAL_DEVICE_NAME: &str = "VirtualGamepad";

/// uinput virtual gamepad
pub struct UinputBackend {
    name: String,
    device: Mutex<Option<VirtualDevice>>,
}

impl UinputBackend {
    /// Create the virtual device with `keys` as its key capabilities
    pub fn create(name: &str, keys: &[u16]) -> Result<Self> {
        if let Some(code) = keys.iter().find(|code| **code > KEY_MAX) {
            return Err(AppError::Config(format!(
                "key code {} is above KEY_MAX (0x{:x})",
                code, KEY_MAX
            )));
        }

        let mut capabilities = AttributeSet::<Key>::new();
        for code in keys {
            capabilities.insert(Key::new(*code));
        }

        let device = VirtualDeviceBuilder::new()?
            .name(name)
            .with_keys(&capabilities)?
            .build()?;

        info!(name, keys = keys.len(), "Virtual gamepad created");
        Ok(Self {
            name: name.to_string(),
            device: Mutex::new(Some(device)),
        })
    }

    fn emit(&self, code: u16, value: i32) -> Result<()> {
        let mut device = self.device.lock();
        let device = device.as_mut().ok_or_else(|| {
            AppError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("virtual device {} is closed", self.name),
            ))
        })?;

        let event = InputEvent::new(EventType::KEY, code, value);
        device.emit(&[event]).map_err(|e| {
            warn!(code, value, "Failed to emit key event: {}", e);
            AppError::Io(e)
        })?;
        debug!(code, value, "Emitted key event");
        Ok(())
    }
}

#[async_trait]
impl HidBackend for UinputBackend {
    fn name(&self) -> &'static str {
        "uinput virtual gamepad"
    }

    fn mode(&self) -> OutputMode {
        OutputMode::Virtual
    }

    async fn press(&self, code: u16) -> Result<()> {
        self.emit(code, 1)
    }

    async fn release(&self, code: u16) -> Result<()> {
        self.emit(code, 0)
    }

    async fn shutdown(&self) -> Result<()> {
        if self.device.lock().take().is_some() {
            info!("Virtual gamepad closed");
        }
        Ok(())
    }
}
