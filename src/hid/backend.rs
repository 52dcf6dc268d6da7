//! HID backend trait definition

use async_trait::async_trait;

use super::types::OutputMode;
use crate::error::Result;

/// Output side of a dispatch session
///
/// `code` is a Linux key code for [`OutputMode::Virtual`] backends and a
/// button index for [`OutputMode::Gadget`] backends.
#[async_trait]
pub trait HidBackend: Send + Sync {
    /// Get backend name
    fn name(&self) -> &'static str;

    /// Which kind of output codes this backend takes
    fn mode(&self) -> OutputMode;

    /// Press `code`, flushing it to the consumer
    async fn press(&self, code: u16) -> Result<()>;

    /// Release `code`, flushing it to the consumer
    async fn release(&self, code: u16) -> Result<()>;

    /// Close the output handle
    async fn shutdown(&self) -> Result<()>;
}
