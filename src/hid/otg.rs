//! OTG HID gadget endpoint backend
//!
//! Writes fixed-size button reports to /dev/hidgN. The endpoint is opened
//! lazily and reopened after the host or the gadget went away.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::backend::HidBackend;
use super::types::{OutputMode, ReportLayout};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Short name for the errno of a failed endpoint write
fn errno_code(e: &io::Error) -> &'static str {
    match e.raw_os_error() {
        Some(libc::EPIPE) => "epipe",
        Some(libc::ESHUTDOWN) => "eshutdown",
        Some(libc::EAGAIN) => "eagain",
        Some(libc::ENXIO) => "enxio",
        Some(libc::ENODEV) => "enodev",
        Some(libc::EIO) => "eio",
        Some(libc::ENOENT) => "enoent",
        Some(libc::EACCES) => "eacces",
        _ => "io_error",
    }
}

/// Errors after which the handle is useless and must be reopened
fn needs_reopen(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ESHUTDOWN) | Some(libc::EPIPE) | Some(libc::ENODEV) | Some(libc::ENXIO)
    )
}

/// Gadget endpoint backend
pub struct OtgBackend {
    path: PathBuf,
    layout: ReportLayout,
    dev: Mutex<Option<File>>,
    throttler: LogThrottler,
}

impl OtgBackend {
    pub fn new(path: impl Into<PathBuf>, layout: ReportLayout) -> Self {
        Self {
            path: path.into(),
            layout,
            dev: Mutex::new(None),
            throttler: LogThrottler::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &ReportLayout {
        &self.layout
    }

    /// Open a HID endpoint for non-blocking writes
    fn open_device(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
    }

    /// Make sure the handle is open, dropping it if the endpoint vanished
    fn ensure_device(&self, dev: &mut Option<File>) -> Result<()> {
        if !self.path.exists() {
            if dev.take().is_some() {
                debug!("Endpoint {} no longer exists, closing handle", self.path.display());
            }
            return Err(AppError::NotFound {
                path: self.path.display().to_string(),
            });
        }

        if dev.is_none() {
            let file = Self::open_device(&self.path).map_err(|e| AppError::from_io(&self.path, e))?;
            info!("Opened HID endpoint: {}", self.path.display());
            *dev = Some(file);
        }
        Ok(())
    }

    /// Write one frame; failures are logged with the frame and returned
    fn send_report(&self, frame: &[u8]) -> Result<()> {
        let key = self.path.to_string_lossy();
        let mut dev = self.dev.lock();

        if let Err(e) = self.ensure_device(&mut dev) {
            warn_throttled!(
                self.throttler,
                &key,
                path = %self.path.display(),
                frame = ?frame,
                code = e.code(),
                "HID endpoint unavailable: {}",
                e
            );
            return Err(e);
        }

        let Some(file) = dev.as_mut() else {
            return Err(AppError::NotFound {
                path: self.path.display().to_string(),
            });
        };

        match file.write_all(frame) {
            Ok(()) => {
                self.throttler.clear(&key);
                trace!(path = %self.path.display(), "Sent report: {:02X?}", frame);
                Ok(())
            }
            Err(e) => {
                if needs_reopen(&e) {
                    debug!("Endpoint {} shut down, closing for recovery", self.path.display());
                    *dev = None;
                }
                warn_throttled!(
                    self.throttler,
                    &key,
                    path = %self.path.display(),
                    frame = ?frame,
                    errno = errno_code(&e),
                    "Failed to write HID report: {}",
                    e
                );
                Err(AppError::from_io(&self.path, e))
            }
        }
    }
}

#[async_trait]
impl HidBackend for OtgBackend {
    fn name(&self) -> &'static str {
        "OTG USB Gadget"
    }

    fn mode(&self) -> OutputMode {
        OutputMode::Gadget
    }

    async fn press(&self, code: u16) -> Result<()> {
        let frame = self.layout.pressed(code)?;
        self.send_report(&frame)
    }

    async fn release(&self, _code: u16) -> Result<()> {
        self.send_report(&self.layout.released())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.dev.lock().take().is_some() {
            info!("Closed HID endpoint: {}", self.path.display());
        }
        Ok(())
    }
}
