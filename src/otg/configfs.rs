//! ConfigFS resource tree for USB Gadget
//!
//! The orchestrator talks to the gadget hierarchy through [`ResourceTree`],
//! with paths relative to the gadget base directory. [`ConfigFs`] maps them
//! onto `/sys/kernel/config/usb_gadget`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::error::{AppError, Result};

/// ConfigFS base path for USB gadgets
pub const CONFIGFS_PATH: &str = "/sys/kernel/config/usb_gadget";

/// Directory listing the USB Device Controllers
pub const UDC_CLASS_PATH: &str = "/sys/class/udc";

/// Default gadget name
pub const DEFAULT_GADGET_NAME: &str = "remote_gamepad";

/// Kernel modules the configfs HID gadget depends on
pub const REQUIRED_MODULES: &[&str] = &["libcomposite", "usb_f_hid"];

/// Outcome of a directory creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Existed,
}

/// What occupies a path in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Missing,
    Directory,
    Attribute,
    Link,
    /// Present or not, its metadata could not be read
    Inaccessible,
}

/// Hierarchical resource tree (configfs or an equivalent)
///
/// All paths are relative to the tree base.
pub trait ResourceTree: Send + Sync {
    /// Kind of the entry at `path`
    fn kind(&self, path: &Path) -> NodeKind;

    /// Names of the entries directly under `path`
    fn list(&self, path: &Path) -> Result<Vec<String>>;

    /// Create a directory node and any missing parents
    fn create_dir(&self, path: &Path) -> Result<NodeState>;

    /// Write a text attribute in a single write
    fn write_attribute(&self, path: &Path, value: &str) -> Result<()>;

    /// Write a binary attribute in a single write
    fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Read an attribute, trimmed of trailing whitespace
    fn read_attribute(&self, path: &Path) -> Result<String>;

    /// Read a binary attribute verbatim
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>>;

    /// Target of the symlink at `link`, relative to the tree base
    fn link_target(&self, link: &Path) -> Result<Option<PathBuf>>;

    /// Create a symlink at `link` pointing to `target`
    fn link(&self, target: &Path, link: &Path) -> Result<()>;

    /// Remove a symlink; missing links are ignored
    fn unlink(&self, link: &Path) -> Result<()>;

    /// Remove a directory node; missing nodes are ignored
    fn remove_dir(&self, path: &Path) -> Result<()>;

    /// Controllers that a gadget can be bound to
    fn list_controllers(&self) -> Result<Vec<String>>;
}

/// ConfigFS backed resource tree
#[derive(Debug, Clone)]
pub struct ConfigFs {
    base: PathBuf,
    udc_path: PathBuf,
    /// Create missing attribute files (regular directories, not configfs)
    plain_files: bool,
}

impl ConfigFs {
    pub fn new() -> Self {
        Self::with_paths(CONFIGFS_PATH, UDC_CLASS_PATH)
    }

    pub fn with_paths(base: impl Into<PathBuf>, udc_path: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            udc_path: udc_path.into(),
            plain_files: false,
        }
    }

    /// Treat the base as a regular directory tree, where attribute files
    /// are created on first write instead of being provided by the kernel
    pub fn with_plain_files(mut self) -> Self {
        self.plain_files = true;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.base.join(path)
    }

    /// Open an attribute for writing
    ///
    /// configfs attributes exist as soon as their group does; a missing one
    /// stays `NotFound` rather than turning into a failed create.
    fn open_attribute(&self, full: &Path, truncate: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        options.write(true);
        if self.plain_files {
            options.create(true).truncate(true);
        } else {
            options.truncate(truncate);
        }
        options.open(full).map_err(|e| AppError::from_io(full, e))
    }
}

impl Default for ConfigFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTree for ConfigFs {
    fn kind(&self, path: &Path) -> NodeKind {
        match fs::symlink_metadata(self.resolve(path)) {
            Ok(meta) if meta.file_type().is_symlink() => NodeKind::Link,
            Ok(meta) if meta.is_dir() => NodeKind::Directory,
            Ok(_) => NodeKind::Attribute,
            Err(e) if e.kind() == io::ErrorKind::NotFound => NodeKind::Missing,
            Err(e) => {
                debug!(path = %path.display(), "Cannot inspect node: {}", e);
                NodeKind::Inaccessible
            }
        }
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        let full = self.resolve(path);
        let entries = fs::read_dir(&full).map_err(|e| AppError::from_io(&full, e))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    fn create_dir(&self, path: &Path) -> Result<NodeState> {
        match self.kind(path) {
            NodeKind::Directory => return Ok(NodeState::Existed),
            // Creating reports why the path could not be inspected
            NodeKind::Missing | NodeKind::Inaccessible => {}
            _ => {
                return Err(AppError::ResourceConflict {
                    path: path.display().to_string(),
                    reason: "exists and is not a directory".to_string(),
                })
            }
        }

        let full = self.resolve(path);
        fs::create_dir_all(&full).map_err(|e| AppError::from_io(&full, e))?;
        trace!("Created directory {}", full.display());
        Ok(NodeState::Created)
    }

    /// sysfs attributes require a single write() syscall, so the buffer
    /// (including the trailing newline) is built before writing.
    fn write_attribute(&self, path: &Path, value: &str) -> Result<()> {
        let full = self.resolve(path);
        let mut file = self.open_attribute(&full, false)?;

        let mut data = value.as_bytes().to_vec();
        if !value.ends_with('\n') {
            data.push(b'\n');
        }

        file.write_all(&data)
            .and_then(|_| file.flush())
            .map_err(|e| AppError::from_io(&full, e))
    }

    fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        let mut file = self.open_attribute(&full, true)?;

        let written = file.write(data).map_err(|e| AppError::from_io(&full, e))?;
        if written != data.len() {
            return Err(AppError::Other {
                path: full.display().to_string(),
                source: io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {} of {} bytes", written, data.len()),
                ),
            });
        }
        Ok(())
    }

    fn read_attribute(&self, path: &Path) -> Result<String> {
        let full = self.resolve(path);
        fs::read_to_string(&full)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| AppError::from_io(&full, e))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        fs::read(&full).map_err(|e| AppError::from_io(&full, e))
    }

    fn link_target(&self, link: &Path) -> Result<Option<PathBuf>> {
        if self.kind(link) != NodeKind::Link {
            return Ok(None);
        }

        let full = self.resolve(link);
        let target = fs::canonicalize(&full).map_err(|e| AppError::from_io(&full, e))?;
        let base = fs::canonicalize(&self.base).map_err(|e| AppError::from_io(&self.base, e))?;
        Ok(Some(
            target
                .strip_prefix(&base)
                .map(Path::to_path_buf)
                .unwrap_or(target),
        ))
    }

    fn link(&self, target: &Path, link: &Path) -> Result<()> {
        let src = self.resolve(target);
        let dest = self.resolve(link);
        std::os::unix::fs::symlink(&src, &dest).map_err(|e| {
            warn!(
                "Failed to create symlink {} -> {}: {}",
                dest.display(),
                src.display(),
                e
            );
            AppError::from_io(&dest, e)
        })
    }

    fn unlink(&self, link: &Path) -> Result<()> {
        let full = self.resolve(link);
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::from_io(&full, e)),
        }
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        match fs::remove_dir(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EBUSY) | Some(libc::ENOTEMPTY)) => {
                Err(AppError::ResourceBusy(format!("{}: {}", full.display(), e)))
            }
            Err(e) => Err(AppError::from_io(&full, e)),
        }
    }

    fn list_controllers(&self) -> Result<Vec<String>> {
        if !self.udc_path.exists() {
            debug!("UDC class directory {} missing", self.udc_path.display());
            return Ok(Vec::new());
        }

        let entries =
            fs::read_dir(&self.udc_path).map_err(|e| AppError::from_io(&self.udc_path, e))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Check if ConfigFS is available
pub fn is_configfs_available() -> bool {
    Path::new(CONFIGFS_PATH).exists()
}

/// Required kernel modules missing from `/proc/modules`
///
/// Built-in modules do not show up there, so a non-empty result is only a
/// hint that gadget mode may not work.
pub fn missing_kernel_modules() -> Result<Vec<&'static str>> {
    let proc_modules = Path::new("/proc/modules");
    let loaded = fs::read_to_string(proc_modules).map_err(|e| AppError::from_io(proc_modules, e))?;
    Ok(missing_modules_in(&loaded))
}

fn missing_modules_in(loaded: &str) -> Vec<&'static str> {
    REQUIRED_MODULES
        .iter()
        .copied()
        .filter(|module| {
            !loaded
                .lines()
                .any(|line| line.split_whitespace().next() == Some(*module))
        })
        .collect()
}

/// Whether the current user may write to `/dev/uinput`
pub fn can_write_uinput() -> bool {
    nix::unistd::access("/dev/uinput", nix::unistd::AccessFlags::W_OK).is_ok()
}
