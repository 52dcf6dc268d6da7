use std::io;
use std::path::Path;

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Invalid button count {0}: must be between 1 and 255")]
    InvalidButtonCount(u32),

    #[error("Button index {index} outside report layout of {count} buttons")]
    InvalidButton { index: u16, count: u16 },

    #[error("Resource conflict at {path}: {reason}")]
    ResourceConflict { path: String, reason: String },

    #[error("Link conflict at {link}: points to {existing}, wanted {wanted}")]
    LinkConflict {
        link: String,
        existing: String,
        wanted: String,
    },

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Device or resource busy: {path}")]
    Busy { path: String },

    #[error("I/O error at {path}: {source}")]
    Other {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("No USB Device Controller (UDC) available")]
    NoControllerAvailable,

    #[error("Event value {0} is not mapped")]
    UnmappedEvent(i32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl AppError {
    /// Classify an I/O failure against the resource it touched
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        let path = path.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => AppError::NotFound { path },
            io::ErrorKind::PermissionDenied => AppError::PermissionDenied { path },
            _ if err.raw_os_error() == Some(libc::EBUSY) => AppError::Busy { path },
            _ => AppError::Other { path, source: err },
        }
    }

    /// Short machine-readable code, used in log fields
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MalformedDescriptor(_) => "malformed_descriptor",
            AppError::InvalidButtonCount(_) => "invalid_button_count",
            AppError::InvalidButton { .. } => "invalid_button",
            AppError::ResourceConflict { .. } => "resource_conflict",
            AppError::LinkConflict { .. } => "link_conflict",
            AppError::ResourceBusy(_) => "resource_busy",
            AppError::NotFound { .. } => "enoent",
            AppError::PermissionDenied { .. } => "eacces",
            AppError::Busy { .. } => "ebusy",
            AppError::Other { .. } => "io_error",
            AppError::NoControllerAvailable => "no_udc",
            AppError::UnmappedEvent(_) => "unmapped",
            AppError::Config(_) => "config",
            AppError::Yaml(_) => "yaml",
            AppError::Io(_) => "io",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let path = Path::new("/sys/kernel/config/usb_gadget/pad/UDC");

        let err = AppError::from_io(path, io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, AppError::NotFound { .. }));

        let err = AppError::from_io(path, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, AppError::PermissionDenied { .. }));

        let err = AppError::from_io(path, io::Error::from_raw_os_error(libc::EBUSY));
        assert!(matches!(err, AppError::Busy { .. }));
        assert_eq!(err.code(), "ebusy");

        let err = AppError::from_io(path, io::Error::from_raw_os_error(libc::EIO));
        assert!(matches!(err, AppError::Other { .. }));
        assert!(err.to_string().contains("UDC"));
    }
}
