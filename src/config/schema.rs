use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::otg::configfs::DEFAULT_GADGET_NAME;
use crate::otg::hid::{HidProtocol, HidSubclass};
use crate::otg::report_desc::{DesktopUsage, MAX_BUTTONS, MIN_BUTTONS};

/// Default USB vendor ID (Linux Foundation)
pub const DEFAULT_USB_VENDOR_ID: u16 = 0x1d6b;

/// Default USB product ID (Multifunction Composite Gadget)
pub const DEFAULT_USB_PRODUCT_ID: u16 = 0x0104;

/// Default USB device version
pub const DEFAULT_USB_BCD_DEVICE: u16 = 0x0100;

/// USB specification version (USB 2.0)
pub const USB_BCD_USB: u16 = 0x0200;

/// Default button count of the reference gamepad
pub const DEFAULT_BUTTON_COUNT: u32 = 24;

/// USB gadget layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GadgetConfig {
    /// Gadget directory name under usb_gadget/
    pub name: String,
    /// Device descriptor attributes
    pub device: DeviceAttributes,
    /// Localised strings
    pub strings: Vec<LocaleStrings>,
    /// HID functions
    pub functions: Vec<HidFunctionConfig>,
    /// Configuration groups
    pub configs: Vec<ConfigurationGroup>,
    /// Preferred UDC, used when it is present
    pub udc: Option<String>,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_GADGET_NAME.to_string(),
            device: DeviceAttributes::default(),
            strings: vec![LocaleStrings::default()],
            functions: vec![HidFunctionConfig::default()],
            configs: vec![ConfigurationGroup::default()],
            udc: None,
        }
    }
}

impl GadgetConfig {
    /// Validate structure before anything touches the resource tree
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(AppError::Config(format!(
                "invalid gadget name '{}'",
                self.name
            )));
        }
        if self.functions.is_empty() {
            return Err(AppError::Config("at least one HID function is required".into()));
        }
        if self.strings.is_empty() {
            return Err(AppError::Config("at least one locale is required".into()));
        }
        if self.configs.is_empty() {
            return Err(AppError::Config("at least one configuration is required".into()));
        }

        let mut names = HashSet::new();
        for func in &self.functions {
            if func.name.is_empty() || func.name.contains('/') {
                return Err(AppError::Config(format!(
                    "invalid function name '{}'",
                    func.name
                )));
            }
            if !names.insert(func.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate function name '{}'",
                    func.name
                )));
            }
            if !(MIN_BUTTONS..=MAX_BUTTONS).contains(&func.buttons) {
                return Err(AppError::InvalidButtonCount(func.buttons));
            }
        }

        let mut config_names = HashSet::new();
        for config in &self.configs {
            if !config_names.insert(config.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate configuration '{}'",
                    config.name
                )));
            }
            if let Some(missing) = config.functions.iter().find(|f| !names.contains(f.as_str())) {
                return Err(AppError::Config(format!(
                    "configuration '{}' links unknown function '{}'",
                    config.name, missing
                )));
            }
        }

        let mut languages = HashSet::new();
        for locale in &self.strings {
            if !languages.insert(locale.language.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate locale '{}'",
                    locale.language
                )));
            }
        }
        Ok(())
    }
}

/// Root attributes of the gadget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceAttributes {
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: Option<u16>,
    pub bcd_usb: Option<u16>,
    pub device_class: Option<u8>,
    pub device_subclass: Option<u8>,
    pub device_protocol: Option<u8>,
    pub max_packet_size0: Option<u8>,
}

impl Default for DeviceAttributes {
    fn default() -> Self {
        Self {
            id_vendor: DEFAULT_USB_VENDOR_ID,
            id_product: DEFAULT_USB_PRODUCT_ID,
            bcd_device: Some(DEFAULT_USB_BCD_DEVICE),
            bcd_usb: Some(USB_BCD_USB),
            device_class: Some(0),
            device_subclass: Some(0),
            device_protocol: Some(0),
            max_packet_size0: None,
        }
    }
}

impl DeviceAttributes {
    /// Attribute file names and values, skipping unset ones
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut entries = vec![
            ("idVendor", format!("0x{:04x}", self.id_vendor)),
            ("idProduct", format!("0x{:04x}", self.id_product)),
        ];
        let optional = [
            ("bcdDevice", self.bcd_device.map(|v| format!("0x{:04x}", v))),
            ("bcdUSB", self.bcd_usb.map(|v| format!("0x{:04x}", v))),
            ("bDeviceClass", self.device_class.map(|v| format!("0x{:02x}", v))),
            ("bDeviceSubClass", self.device_subclass.map(|v| format!("0x{:02x}", v))),
            ("bDeviceProtocol", self.device_protocol.map(|v| format!("0x{:02x}", v))),
            ("bMaxPacketSize0", self.max_packet_size0.map(|v| v.to_string())),
        ];
        entries.extend(
            optional
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| (name, v))),
        );
        entries
    }
}

/// Strings for one language
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocaleStrings {
    /// Language ID, 0x409 is en-US
    pub language: String,
    pub serialnumber: String,
    pub manufacturer: String,
    pub product: String,
}

impl Default for LocaleStrings {
    fn default() -> Self {
        Self {
            language: "0x409".to_string(),
            serialnumber: "0123456789".to_string(),
            manufacturer: "remote-gamepad".to_string(),
            product: "Remote Gamepad".to_string(),
        }
    }
}

impl LocaleStrings {
    pub fn entries(&self) -> [(&'static str, &str); 3] {
        [
            ("serialnumber", self.serialnumber.as_str()),
            ("manufacturer", self.manufacturer.as_str()),
            ("product", self.product.as_str()),
        ]
    }
}

/// HID function definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HidFunctionConfig {
    /// Instance name; the function directory is hid.<name>
    pub name: String,
    pub subclass: HidSubclass,
    pub protocol: HidProtocol,
    pub usage: DesktopUsage,
    /// Number of digital buttons (1-255)
    pub buttons: u32,
    pub report_id: Option<u8>,
}

impl Default for HidFunctionConfig {
    fn default() -> Self {
        Self {
            name: "usb0".to_string(),
            subclass: HidSubclass::None,
            protocol: HidProtocol::None,
            usage: DesktopUsage::Gamepad,
            buttons: DEFAULT_BUTTON_COUNT,
            report_id: None,
        }
    }
}

/// Configuration group (configs/<name>)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigurationGroup {
    pub name: String,
    pub bm_attributes: u8,
    /// Maximum power in configfs MaxPower units
    pub max_power: u16,
    /// Optional configuration string
    pub configuration: Option<String>,
    /// Function instance names to link
    pub functions: Vec<String>,
}

impl Default for ConfigurationGroup {
    fn default() -> Self {
        Self {
            name: "c.1".to_string(),
            bm_attributes: 0x80,
            max_power: 100,
            configuration: None,
            functions: vec!["usb0".to_string()],
        }
    }
}

/// Remote to input event mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub event: EventSelector,
    pub mappings: Vec<Mapping>,
}

/// Which events of the source device carry remote values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSelector {
    /// Event type name (EV_MSC) or number
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event code name (MSC_SCAN) or number
    #[serde(default)]
    pub code: Option<String>,
}

/// One remote value and what it becomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    /// Key/button name for the virtual device (BTN_A, KEY_UP, ...)
    #[serde(default)]
    pub event_code: Option<String>,
    /// Button index for the gadget report
    #[serde(default)]
    pub button: Option<u16>,
    pub remote_value: i32,
    #[serde(default)]
    pub description: String,
}

/// Dispatcher timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Minimum spacing between accepted events
    pub debounce_ms: u64,
    /// Delay between press and release frames on the gadget endpoint
    pub settle_ms: u64,
    /// Poll interval while the source device is gone
    pub reconnect_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            settle_ms: 200,
            reconnect_interval_ms: 10_000,
        }
    }
}

impl DispatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}
