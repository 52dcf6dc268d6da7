//! Remote value translation
//!
//! Maps the value carried by a remote's scan events to an output code: a
//! Linux key code for the virtual device, or a button index for the gadget
//! report.

use std::collections::HashMap;

use evdev::{EventType, Key};
use tracing::debug;

use super::types::{OutputMode, RawEvent};
use crate::config::{EventSelector, MappingDefinition};
use crate::error::{AppError, Result};

/// Highest key code (KEY_MAX in input-event-codes.h)
pub const KEY_MAX: u16 = 0x2ff;

/// Linux names that evdev only knows under their canonical alias
const KEY_ALIASES: &[(&str, &str)] = &[
    ("BTN_A", "BTN_SOUTH"),
    ("BTN_B", "BTN_EAST"),
    ("BTN_X", "BTN_NORTH"),
    ("BTN_Y", "BTN_WEST"),
    ("BTN_GAMEPAD", "BTN_SOUTH"),
    ("BTN_MISC", "BTN_0"),
    ("BTN_MOUSE", "BTN_LEFT"),
    ("BTN_JOYSTICK", "BTN_TRIGGER"),
    ("BTN_DIGI", "BTN_TOOL_PEN"),
    ("BTN_WHEEL", "BTN_GEAR_DOWN"),
];

const EVENT_TYPES: &[(&str, EventType)] = &[
    ("EV_SYN", EventType::SYNCHRONIZATION),
    ("EV_KEY", EventType::KEY),
    ("EV_REL", EventType::RELATIVE),
    ("EV_ABS", EventType::ABSOLUTE),
    ("EV_MSC", EventType::MISC),
    ("EV_SW", EventType::SWITCH),
    ("EV_LED", EventType::LED),
    ("EV_SND", EventType::SOUND),
    ("EV_REP", EventType::REPEAT),
    ("EV_FF", EventType::FORCEFEEDBACK),
    ("EV_PWR", EventType::POWER),
    ("EV_FF_STATUS", EventType::FORCEFEEDBACKSTATUS),
];

const MISC_CODES: &[(&str, u16)] = &[
    ("MSC_SERIAL", 0x00),
    ("MSC_PULSELED", 0x01),
    ("MSC_GESTURE", 0x02),
    ("MSC_RAW", 0x03),
    ("MSC_SCAN", 0x04),
    ("MSC_TIMESTAMP", 0x05),
];

fn parse_number(name: &str) -> Option<u16> {
    match name.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => name.parse().ok(),
    }
}

/// Resolve a key or button name (`BTN_A`, `KEY_UP`) or number to a key code
pub fn parse_key(name: &str) -> Result<u16> {
    if let Some(code) = parse_number(name) {
        if code > KEY_MAX {
            return Err(AppError::Config(format!(
                "key code {} is above KEY_MAX (0x{:x})",
                name, KEY_MAX
            )));
        }
        return Ok(code);
    }
    if !(name.starts_with("BTN_") || name.starts_with("KEY_")) {
        return Err(AppError::Config(format!(
            "'{}' is not a key or button name",
            name
        )));
    }

    let canonical = KEY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name);

    (0..=KEY_MAX)
        .map(Key::new)
        .find(|key| format!("{:?}", key) == canonical)
        .map(|key| key.code())
        .ok_or_else(|| AppError::Config(format!("unknown key name '{}'", name)))
}

/// Resolve an event type name (`EV_MSC`) or number
pub fn parse_event_type(name: &str) -> Result<u16> {
    if let Some(code) = parse_number(name) {
        return Ok(code);
    }
    EVENT_TYPES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, t)| t.0)
        .ok_or_else(|| AppError::Config(format!("unknown event type '{}'", name)))
}

/// Resolve an event code name within `event_type`
pub fn parse_event_code(event_type: u16, name: &str) -> Result<u16> {
    if let Some(code) = parse_number(name) {
        return Ok(code);
    }
    match EventType(event_type) {
        EventType::KEY => parse_key(name),
        EventType::MISC => MISC_CODES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| *c)
            .ok_or_else(|| AppError::Config(format!("unknown misc code '{}'", name))),
        other => Err(AppError::Config(format!(
            "event code '{}' must be numeric for event type {:?}",
            name, other
        ))),
    }
}

/// Which source events carry remote values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    pub event_type: u16,
    pub code: Option<u16>,
}

impl EventFilter {
    pub fn from_selector(selector: &EventSelector) -> Result<Self> {
        let event_type = parse_event_type(&selector.event_type)?;
        let code = selector
            .code
            .as_deref()
            .map(|c| parse_event_code(event_type, c))
            .transpose()?;
        Ok(Self { event_type, code })
    }

    pub fn matches(&self, event: &RawEvent) -> bool {
        event.event_type == self.event_type && self.code.map_or(true, |c| c == event.code)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    code: u16,
    description: String,
}

/// Remote value to output code table
#[derive(Debug, Clone)]
pub struct TranslationTable {
    mode: OutputMode,
    entries: HashMap<i32, Entry>,
}

impl TranslationTable {
    fn build(
        mode: OutputMode,
        definition: &MappingDefinition,
        mut resolve: impl FnMut(usize, &crate::config::Mapping) -> Result<u16>,
    ) -> Result<Self> {
        let mut entries = HashMap::with_capacity(definition.mappings.len());
        for (position, mapping) in definition.mappings.iter().enumerate() {
            let code = resolve(position, mapping)?;
            let entry = Entry {
                code,
                description: mapping.description.clone(),
            };
            if entries.insert(mapping.remote_value, entry).is_some() {
                return Err(AppError::Config(format!(
                    "remote value {} mapped twice in '{}'",
                    mapping.remote_value, definition.name
                )));
            }
        }
        debug!(
            mapping = %definition.name,
            mode = mode.as_str(),
            entries = entries.len(),
            "Built translation table"
        );
        Ok(Self { mode, entries })
    }

    /// Table for the virtual device: remote value to key code
    pub fn virtual_keys(definition: &MappingDefinition) -> Result<Self> {
        Self::build(OutputMode::Virtual, definition, |_, mapping| {
            let name = mapping.event_code.as_deref().ok_or_else(|| {
                AppError::Config(format!(
                    "mapping for remote value {} has no event_code",
                    mapping.remote_value
                ))
            })?;
            parse_key(name)
        })
    }

    /// Table for the gadget: remote value to button index
    ///
    /// Entries without an explicit `button` take their position in the list.
    pub fn gadget_buttons(definition: &MappingDefinition, button_count: u16) -> Result<Self> {
        Self::build(OutputMode::Gadget, definition, |position, mapping| {
            let index = match mapping.button {
                Some(index) => index,
                None => u16::try_from(position).unwrap_or(u16::MAX),
            };
            if index >= button_count {
                return Err(AppError::InvalidButton {
                    index,
                    count: button_count,
                });
            }
            Ok(index)
        })
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Output code for a remote value, `None` if unmapped
    pub fn translate(&self, value: i32) -> Option<u16> {
        self.entries.get(&value).map(|e| e.code)
    }

    pub fn description(&self, value: i32) -> Option<&str> {
        self.entries.get(&value).map(|e| e.description.as_str())
    }

    /// Distinct output codes, sorted
    pub fn codes(&self) -> Vec<u16> {
        let mut codes: Vec<u16> = self.entries.values().map(|e| e.code).collect();
        codes.sort_unstable();
        codes.dedup();
        codes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
