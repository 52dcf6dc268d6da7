//! Remote event dispatch
//!
//! Reads scan events from an input device and turns them into button
//! presses on one of two outputs:
//! - a uinput virtual gamepad on the local machine
//! - the HID endpoint of a USB gadget (/dev/hidgN)
//!
//! ```text
//! evdev source --> filter --> translation --> debounce --> Backend
//!                                                            |
//!                                                    [uinput | hidg]
//! ```

pub mod backend;
pub mod dispatcher;
pub mod keymap;
pub mod otg;
pub mod source;
pub mod types;
pub mod uinput;

pub use backend::HidBackend;
pub use dispatcher::{Debouncer, DispatchStats, Dispatcher};
pub use keymap::{EventFilter, TranslationTable};
pub use otg::OtgBackend;
pub use source::{EvdevSource, EventSource};
pub use types::{OutputMode, RawEvent, ReportLayout, DEFAULT_REPORT_ID};
pub use uinput::{UinputBackend, VIRTUAL_DEVICE_NAME};
