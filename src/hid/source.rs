//! Input event sources

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use evdev::{Device, EventStream};
use tracing::{debug, info, warn};

use super::types::RawEvent;

/// Restartable stream of input events
#[async_trait]
pub trait EventSource: Send {
    /// Next event; an error means the device is gone
    async fn next_event(&mut self) -> io::Result<RawEvent>;

    /// Try to open the device again after a read failure
    async fn reconnect(&mut self) -> io::Result<()>;

    /// Human-readable identity for logs
    fn describe(&self) -> String;
}

/// evdev character device (/dev/input/eventN)
pub struct EvdevSource {
    path: PathBuf,
    grab: bool,
    stream: Option<EventStream>,
}

impl EvdevSource {
    /// Open `path`, optionally grabbing it so other readers see nothing
    pub fn open(path: impl Into<PathBuf>, grab: bool) -> io::Result<Self> {
        let mut source = Self {
            path: path.into(),
            grab,
            stream: None,
        };
        source.connect()?;
        Ok(source)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&mut self) -> io::Result<()> {
        let mut device = Device::open(&self.path)?;
        let name = device.name().unwrap_or("unknown").to_string();

        if self.grab {
            if let Err(e) = device.grab() {
                warn!(path = %self.path.display(), "Failed to grab input device: {}", e);
            }
        }

        self.stream = Some(device.into_event_stream()?);
        info!(path = %self.path.display(), name = %name, "Input device opened");
        Ok(())
    }
}

#[async_trait]
impl EventSource for EvdevSource {
    async fn next_event(&mut self) -> io::Result<RawEvent> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "input device is not open")
        })?;

        match stream.next_event().await {
            Ok(event) => Ok(RawEvent::from(event)),
            Err(e) => {
                debug!(path = %self.path.display(), "Read failed, dropping stream: {}", e);
                self.stream = None;
                Err(e)
            }
        }
    }

    async fn reconnect(&mut self) -> io::Result<()> {
        self.stream = None;
        self.connect()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
