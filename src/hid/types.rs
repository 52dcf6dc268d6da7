//! HID event types and the gadget report frame layout

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::otg::report_desc::ReportGeometry;

/// Report id used when the descriptor declares none
pub const DEFAULT_REPORT_ID: u8 = 0x01;

/// A single input event as read from the source device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
}

impl RawEvent {
    pub fn new(event_type: u16, code: u16, value: i32) -> Self {
        Self {
            event_type,
            code,
            value,
        }
    }
}

impl From<evdev::InputEvent> for RawEvent {
    fn from(event: evdev::InputEvent) -> Self {
        Self::new(event.event_type().0, event.code(), event.value())
    }
}

/// Where translated button presses go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Local uinput device; output codes are Linux key codes
    Virtual,
    /// USB HID gadget endpoint; output codes are button indices
    Gadget,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Virtual => "virtual",
            OutputMode::Gadget => "gadget",
        }
    }
}

/// Fixed-size gadget report frame
///
/// Byte 0 is the report id, followed by the button bitmap with bit `i % 8`
/// of byte `i / 8` for button `i`. The size comes from the descriptor
/// geometry, never from a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportLayout {
    report_id: u8,
    button_count: u16,
    data_len: usize,
}

impl ReportLayout {
    pub fn from_geometry(geometry: &ReportGeometry) -> Self {
        Self {
            report_id: geometry.report_id.unwrap_or(DEFAULT_REPORT_ID),
            button_count: geometry.total_bits.min(u32::from(u16::MAX)) as u16,
            data_len: geometry.data_bytes(),
        }
    }

    pub fn report_id(&self) -> u8 {
        self.report_id
    }

    pub fn button_count(&self) -> u16 {
        self.button_count
    }

    /// Total frame length, id byte included
    pub fn frame_len(&self) -> usize {
        1 + self.data_len
    }

    /// Frame with only `button` held
    pub fn pressed(&self, button: u16) -> Result<Vec<u8>> {
        if button >= self.button_count {
            return Err(AppError::InvalidButton {
                index: button,
                count: self.button_count,
            });
        }
        let mut frame = self.released();
        let index = usize::from(button);
        frame[1 + index / 8] |= 1 << (index % 8);
        Ok(frame)
    }

    /// Frame with every button released
    pub fn released(&self) -> Vec<u8> {
        let mut frame = vec![0u8; self.frame_len()];
        frame[0] = self.report_id;
        frame
    }

    /// Buttons held in `frame`, or `None` if it does not fit this layout
    pub fn decode(&self, frame: &[u8]) -> Option<Vec<u16>> {
        if frame.len() != self.frame_len() || frame[0] != self.report_id {
            return None;
        }
        let held = (0..self.button_count)
            .filter(|&i| {
                let i = usize::from(i);
                frame[1 + i / 8] & (1 << (i % 8)) != 0
            })
            .collect();
        Some(held)
    }
}
