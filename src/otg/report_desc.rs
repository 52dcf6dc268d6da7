//! HID Report Descriptor compiler
//!
//! Descriptors are built as a sequence of short items ([`Tag`]) and encoded
//! byte-exact per HID 1.11 section 6.2.2. The compiled program is written
//! verbatim into the gadget's `report_desc` attribute, so the encoding must
//! not change between releases.
//!
//! Reference layout for 24 buttons:
//! ```text
//! 05 01        Usage Page (Generic Desktop)
//! 09 05        Usage (Gamepad)
//! A1 01        Collection (Application)
//! 05 09          Usage Page (Button)
//! 19 01          Usage Minimum (1)
//! 29 18          Usage Maximum (24)
//! 15 00          Logical Minimum (0)
//! 25 01          Logical Maximum (1)
//! 35 00          Physical Minimum (0)
//! 45 01          Physical Maximum (1)
//! 65 00          Unit (None)
//! 55 00          Unit Exponent (0)
//! 75 01          Report Size (1)
//! 95 18          Report Count (24)
//! 81 02          Input (Data, Variable, Absolute)
//! C0           End Collection
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// Smallest and largest number of buttons a button range can describe
pub const MIN_BUTTONS: u32 = 1;
pub const MAX_BUTTONS: u32 = 255;

/// Item kind, taken from bits 2-3 of the item prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Main,
    Global,
    Local,
}

/// Short item tags with the size bits cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ItemTag {
    // Main items
    Input = 0x80,
    Output = 0x90,
    Feature = 0xB0,
    Collection = 0xA0,
    EndCollection = 0xC0,

    // Global items
    UsagePage = 0x04,
    LogicalMinimum = 0x14,
    LogicalMaximum = 0x24,
    PhysicalMinimum = 0x34,
    PhysicalMaximum = 0x44,
    UnitExponent = 0x54,
    Unit = 0x64,
    ReportSize = 0x74,
    ReportId = 0x84,
    ReportCount = 0x94,
    Push = 0xA4,
    Pop = 0xB4,

    // Local items
    Usage = 0x08,
    UsageMinimum = 0x18,
    UsageMaximum = 0x28,
    DesignatorIndex = 0x38,
    DesignatorMinimum = 0x48,
    DesignatorMaximum = 0x58,
    StringIndex = 0x78,
    StringMinimum = 0x88,
    StringMaximum = 0x98,
    Delimiter = 0xA8,
}

impl ItemTag {
    const ALL: [ItemTag; 27] = [
        ItemTag::Input,
        ItemTag::Output,
        ItemTag::Feature,
        ItemTag::Collection,
        ItemTag::EndCollection,
        ItemTag::UsagePage,
        ItemTag::LogicalMinimum,
        ItemTag::LogicalMaximum,
        ItemTag::PhysicalMinimum,
        ItemTag::PhysicalMaximum,
        ItemTag::UnitExponent,
        ItemTag::Unit,
        ItemTag::ReportSize,
        ItemTag::ReportId,
        ItemTag::ReportCount,
        ItemTag::Push,
        ItemTag::Pop,
        ItemTag::Usage,
        ItemTag::UsageMinimum,
        ItemTag::UsageMaximum,
        ItemTag::DesignatorIndex,
        ItemTag::DesignatorMinimum,
        ItemTag::DesignatorMaximum,
        ItemTag::StringIndex,
        ItemTag::StringMinimum,
        ItemTag::StringMaximum,
        ItemTag::Delimiter,
    ];

    /// Look up the tag for an item prefix byte (size bits ignored)
    pub fn from_prefix(prefix: u8) -> Option<Self> {
        let tag = prefix & 0xFC;
        Self::ALL.iter().copied().find(|t| *t as u8 == tag)
    }

    pub fn kind(self) -> ItemKind {
        match ((self as u8) >> 2) & 0x03 {
            0 => ItemKind::Main,
            1 => ItemKind::Global,
            _ => ItemKind::Local,
        }
    }

    /// Main items that define a report field
    pub fn is_data_field(self) -> bool {
        matches!(self, ItemTag::Input | ItemTag::Output | ItemTag::Feature)
    }
}

/// Usage pages (HID Usage Tables section 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UsagePage {
    GenericDesktop = 0x01,
    SimulationControls = 0x02,
    VrControls = 0x03,
    SportControls = 0x04,
    GameControls = 0x05,
    GenericDevice = 0x06,
    KeyboardKeypad = 0x07,
    Led = 0x08,
    Button = 0x09,
}

/// Generic Desktop page usages used for the top-level collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DesktopUsage {
    Joystick = 0x04,
    #[default]
    Gamepad = 0x05,
}

/// Collection types (HID 1.11 section 6.2.2.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionKind {
    Physical = 0x00,
    Application = 0x01,
    Logical = 0x02,
    Report = 0x03,
    NamedArray = 0x04,
    UsageSwitch = 0x05,
    UsageModifier = 0x06,
}

/// Input item flags
pub mod input_flags {
    pub const CONSTANT: u32 = 0x01;
    pub const VARIABLE: u32 = 0x02;
    pub const RELATIVE: u32 = 0x04;
    pub const DATA_VARIABLE_ABSOLUTE: u32 = VARIABLE;
}

/// One descriptor instruction: an item tag and its little-endian payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    item: ItemTag,
    payload: Vec<u8>,
}

impl Tag {
    /// Item without data (e.g. End Collection)
    pub fn bare(item: ItemTag) -> Self {
        Self {
            item,
            payload: Vec::new(),
        }
    }

    /// Item with an unsigned value, using the smallest payload that holds it
    pub fn unsigned(item: ItemTag, value: u32) -> Self {
        let payload = match value {
            0..=0xFF => vec![value as u8],
            0x100..=0xFFFF => (value as u16).to_le_bytes().to_vec(),
            _ => value.to_le_bytes().to_vec(),
        };
        Self { item, payload }
    }

    /// Item with a signed value (logical/physical extents)
    pub fn signed(item: ItemTag, value: i32) -> Self {
        let payload = if i8::try_from(value).is_ok() {
            vec![value as i8 as u8]
        } else if i16::try_from(value).is_ok() {
            (value as i16).to_le_bytes().to_vec()
        } else {
            value.to_le_bytes().to_vec()
        };
        Self { item, payload }
    }

    pub fn item(&self) -> ItemTag {
        self.item
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as an unsigned little-endian value
    pub fn value(&self) -> u32 {
        self.payload
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
    }

    /// Item prefix byte: tag plus size code
    pub fn prefix(&self) -> u8 {
        let size_code = match self.payload.len() {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 3,
        };
        self.item as u8 | size_code
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.prefix());
        out.extend_from_slice(&self.payload);
    }
}

/// A closed, balanced sequence of descriptor items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorProgram {
    tags: Vec<Tag>,
}

impl DescriptorProgram {
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Encode to the wire format expected by the host driver
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.tags.len() * 2);
        for tag in &self.tags {
            tag.encode_into(&mut out);
        }
        out
    }

    /// Decode raw descriptor bytes (short items only)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut builder = DescriptorBuilder::new();
        let mut pos = 0;

        while pos < bytes.len() {
            let prefix = bytes[pos];
            if prefix == 0xFE {
                return Err(AppError::MalformedDescriptor(format!(
                    "long item at offset {} is not supported",
                    pos
                )));
            }

            let item = ItemTag::from_prefix(prefix).ok_or_else(|| {
                AppError::MalformedDescriptor(format!(
                    "unknown item prefix 0x{:02X} at offset {}",
                    prefix, pos
                ))
            })?;
            let len = match prefix & 0x03 {
                3 => 4,
                n => n as usize,
            };

            let start = pos + 1;
            let end = start + len;
            if end > bytes.len() {
                return Err(AppError::MalformedDescriptor(format!(
                    "item at offset {} truncated: needs {} bytes",
                    pos, len
                )));
            }

            builder.emit(Tag {
                item,
                payload: bytes[start..end].to_vec(),
            })?;
            pos = end;
        }

        builder.close()
    }

    pub fn geometry(&self) -> Result<ReportGeometry> {
        compute_geometry(self)
    }
}

/// Incremental descriptor builder tracking collection nesting
#[derive(Debug, Default)]
pub struct DescriptorBuilder {
    tags: Vec<Tag>,
    depth: u32,
}

impl DescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one item
    pub fn emit(&mut self, tag: Tag) -> Result<&mut Self> {
        match tag.item {
            ItemTag::Collection => self.depth += 1,
            ItemTag::EndCollection => {
                self.depth = self.depth.checked_sub(1).ok_or_else(|| {
                    AppError::MalformedDescriptor(format!(
                        "End Collection without open collection at item {}",
                        self.tags.len()
                    ))
                })?;
            }
            _ => {}
        }
        self.tags.push(tag);
        Ok(self)
    }

    /// Usage Page + Usage pair
    pub fn usage(&mut self, page: UsagePage, usage: u32) -> Result<&mut Self> {
        self.emit(Tag::unsigned(ItemTag::UsagePage, page as u32))?
            .emit(Tag::unsigned(ItemTag::Usage, usage))
    }

    pub fn begin_collection(&mut self, kind: CollectionKind) -> Result<&mut Self> {
        self.emit(Tag::unsigned(ItemTag::Collection, kind as u32))
    }

    pub fn end_collection(&mut self) -> Result<&mut Self> {
        self.emit(Tag::bare(ItemTag::EndCollection))
    }

    /// Report id item; id 0 is reserved
    pub fn report_id(&mut self, id: u8) -> Result<&mut Self> {
        if id == 0 {
            return Err(AppError::MalformedDescriptor(
                "report id 0 is reserved".to_string(),
            ));
        }
        self.emit(Tag::unsigned(ItemTag::ReportId, u32::from(id)))
    }

    /// `count` single-bit buttons numbered from 1
    pub fn define_button_range(&mut self, count: u32) -> Result<&mut Self> {
        if !(MIN_BUTTONS..=MAX_BUTTONS).contains(&count) {
            return Err(AppError::InvalidButtonCount(count));
        }

        self.emit(Tag::unsigned(ItemTag::UsagePage, UsagePage::Button as u32))?
            .emit(Tag::unsigned(ItemTag::UsageMinimum, 1))?
            .emit(Tag::unsigned(ItemTag::UsageMaximum, count))?
            .emit(Tag::signed(ItemTag::LogicalMinimum, 0))?
            .emit(Tag::signed(ItemTag::LogicalMaximum, 1))?
            .emit(Tag::signed(ItemTag::PhysicalMinimum, 0))?
            .emit(Tag::signed(ItemTag::PhysicalMaximum, 1))?
            .emit(Tag::unsigned(ItemTag::Unit, 0))?
            .emit(Tag::unsigned(ItemTag::UnitExponent, 0))?
            .emit(Tag::unsigned(ItemTag::ReportSize, 1))?
            .emit(Tag::unsigned(ItemTag::ReportCount, count))?
            .emit(Tag::unsigned(
                ItemTag::Input,
                input_flags::DATA_VARIABLE_ABSOLUTE,
            ))
    }

    /// Finish the program; all collections must be closed
    pub fn close(self) -> Result<DescriptorProgram> {
        if self.depth != 0 {
            return Err(AppError::MalformedDescriptor(format!(
                "{} collection(s) left open",
                self.depth
            )));
        }
        Ok(DescriptorProgram { tags: self.tags })
    }
}

/// Derived report size of a compiled descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportGeometry {
    pub report_id: Option<u8>,
    pub total_bits: u32,
    /// Bytes per report, including the leading report-id byte when present
    pub total_bytes: u32,
}

impl ReportGeometry {
    /// Size of the button bitmap following the report-id byte
    pub fn data_bytes(&self) -> usize {
        self.total_bits.div_ceil(8) as usize
    }
}

/// Replay state for geometry computation
#[derive(Debug, Clone, Copy, Default)]
struct Registers {
    size: u32,
    count: u32,
}

#[derive(Debug, Default)]
struct GeometryState {
    regs: Registers,
    stack: Vec<Registers>,
    report_id: Option<u8>,
    total_bits: u32,
}

impl GeometryState {
    fn step(mut self, tag: &Tag) -> Result<Self> {
        match tag.item {
            ItemTag::ReportSize => self.regs.size = tag.value(),
            ItemTag::ReportCount => self.regs.count = tag.value(),
            ItemTag::Push => self.stack.push(self.regs),
            ItemTag::Pop => {
                if let Some(regs) = self.stack.pop() {
                    self.regs = regs;
                } else {
                    warn!("Pop without matching Push in report descriptor, ignoring");
                }
            }
            ItemTag::ReportId => {
                let id = match u8::try_from(tag.value()) {
                    Ok(id) if id != 0 => id,
                    _ => {
                        return Err(AppError::MalformedDescriptor(format!(
                            "report id {} outside 1..=255",
                            tag.value()
                        )))
                    }
                };
                if let Some(prev) = self.report_id.filter(|prev| *prev != id) {
                    warn!(
                        previous = prev,
                        report_id = id,
                        "Multiple report IDs are not supported; bits are summed across reports"
                    );
                }
                self.report_id = Some(id);
            }
            item if item.is_data_field() => {
                self.total_bits = self
                    .regs
                    .size
                    .checked_mul(self.regs.count)
                    .and_then(|bits| self.total_bits.checked_add(bits))
                    .ok_or_else(|| {
                        AppError::MalformedDescriptor(format!(
                            "report length overflows at {:?} (size {}, count {})",
                            item, self.regs.size, self.regs.count
                        ))
                    })?;
            }
            _ => {}
        }
        Ok(self)
    }
}

/// Compute the report geometry of a program
///
/// Fails with [`AppError::MalformedDescriptor`] when the report length does
/// not fit in 32 bits or a report id is outside 1..=255.
pub fn compute_geometry(program: &DescriptorProgram) -> Result<ReportGeometry> {
    let state = program
        .tags
        .iter()
        .try_fold(GeometryState::default(), GeometryState::step)?;

    // At most 2^29 data bytes, so the id byte cannot overflow
    let id_byte = u32::from(state.report_id.is_some());
    Ok(ReportGeometry {
        report_id: state.report_id,
        total_bits: state.total_bits,
        total_bytes: state.total_bits.div_ceil(8) + id_byte,
    })
}

/// A compiled descriptor together with its geometry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledDescriptor {
    pub program: DescriptorProgram,
    pub bytes: Vec<u8>,
    pub geometry: ReportGeometry,
}

/// Compile a button-only controller descriptor
pub fn compile_buttons(
    usage: DesktopUsage,
    button_count: u32,
    report_id: Option<u8>,
) -> Result<CompiledDescriptor> {
    let mut builder = DescriptorBuilder::new();
    builder
        .usage(UsagePage::GenericDesktop, usage as u32)?
        .begin_collection(CollectionKind::Application)?;
    if let Some(id) = report_id {
        builder.report_id(id)?;
    }
    builder.define_button_range(button_count)?.end_collection()?;

    let program = builder.close()?;
    let bytes = program.to_bytes();
    let geometry = program.geometry()?;

    debug!(
        ?usage,
        buttons = button_count,
        length = bytes.len(),
        report_bytes = geometry.total_bytes,
        "Compiled report descriptor"
    );

    Ok(CompiledDescriptor {
        program,
        bytes,
        geometry,
    })
}

/// Gamepad descriptor without a report ID
pub fn gamepad_descriptor(button_count: u32) -> Result<CompiledDescriptor> {
    compile_buttons(DesktopUsage::Gamepad, button_count, None)
}
