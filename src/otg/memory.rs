//! In-memory resource tree with configfs-like rules, for tests

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::configfs::{NodeKind, NodeState, ResourceTree};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    Attr(Vec<u8>),
    Link(PathBuf),
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<PathBuf, Node>,
    controllers: Vec<String>,
    writes: Vec<(PathBuf, Vec<u8>)>,
    denied: Vec<PathBuf>,
}

impl Inner {
    fn children(&self, path: &Path) -> impl Iterator<Item = (&PathBuf, &Node)> {
        let path = path.to_path_buf();
        self.nodes
            .iter()
            .filter(move |(p, _)| p.parent() == Some(path.as_path()))
    }

    fn check_parent(&self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) if parent.as_os_str().is_empty() => Ok(()),
            Some(parent) if self.nodes.get(parent) == Some(&Node::Dir) => Ok(()),
            _ => Err(AppError::NotFound {
                path: path.display().to_string(),
            }),
        }
    }

    fn check_denied(&self, path: &Path) -> Result<()> {
        if self.denied.iter().any(|d| d == path) {
            return Err(AppError::PermissionDenied {
                path: path.display().to_string(),
            });
        }
        Ok(())
    }
}

/// Resource tree kept entirely in memory
///
/// Mirrors the configfs behaviour the orchestrator relies on. A directory
/// holding links or populated sub-directories cannot be removed. Neither can
/// a link target, nor a gadget whose `UDC` attribute is non-empty. Attributes
/// below a link target reject writes with `Busy`.
#[derive(Debug, Default)]
pub struct MemoryTree {
    inner: Mutex<Inner>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_controllers(controllers: &[&str]) -> Self {
        let tree = Self::new();
        tree.inner.lock().controllers = controllers.iter().map(|c| c.to_string()).collect();
        tree
    }

    /// Make writes to `path` fail with permission denied
    pub fn deny(&self, path: impl Into<PathBuf>) {
        self.inner.lock().denied.push(path.into());
    }

    pub fn node(&self, path: impl AsRef<Path>) -> Option<Node> {
        self.inner.lock().nodes.get(path.as_ref()).cloned()
    }

    pub fn attr(&self, path: impl AsRef<Path>) -> Option<String> {
        match self.node(path) {
            Some(Node::Attr(data)) => Some(String::from_utf8_lossy(&data).trim_end().to_string()),
            _ => None,
        }
    }

    pub fn bytes(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        match self.node(path) {
            Some(Node::Attr(data)) => Some(data),
            _ => None,
        }
    }

    /// Every write issued so far, in order
    pub fn writes(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.inner.lock().writes.clone()
    }

    pub fn writes_to(&self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        self.inner.lock().writes.iter().filter(|(p, _)| p == path).count()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.inner.lock().nodes.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }

    fn write(&self, path: &Path, data: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_denied(path)?;
        inner.check_parent(path)?;
        // A linked function holds a reference that locks its attributes
        if inner
            .nodes
            .values()
            .any(|n| matches!(n, Node::Link(t) if path.starts_with(t)))
        {
            return Err(AppError::Busy {
                path: path.display().to_string(),
            });
        }
        if matches!(inner.nodes.get(path), Some(Node::Dir) | Some(Node::Link(_))) {
            return Err(AppError::ResourceConflict {
                path: path.display().to_string(),
                reason: "not an attribute".to_string(),
            });
        }
        inner.writes.push((path.to_path_buf(), data.clone()));
        inner.nodes.insert(path.to_path_buf(), Node::Attr(data));
        Ok(())
    }
}

impl ResourceTree for MemoryTree {
    fn kind(&self, path: &Path) -> NodeKind {
        match self.inner.lock().nodes.get(path) {
            None => NodeKind::Missing,
            Some(Node::Dir) => NodeKind::Directory,
            Some(Node::Attr(_)) => NodeKind::Attribute,
            Some(Node::Link(_)) => NodeKind::Link,
        }
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        if inner.nodes.get(path) != Some(&Node::Dir) {
            return Err(AppError::NotFound {
                path: path.display().to_string(),
            });
        }
        Ok(inner
            .children(path)
            .filter_map(|(p, _)| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .collect())
    }

    fn create_dir(&self, path: &Path) -> Result<NodeState> {
        let mut inner = self.inner.lock();
        match inner.nodes.get(path) {
            Some(Node::Dir) => return Ok(NodeState::Existed),
            Some(_) => {
                return Err(AppError::ResourceConflict {
                    path: path.display().to_string(),
                    reason: "exists and is not a directory".to_string(),
                })
            }
            None => {}
        }
        inner.check_denied(path)?;
        for ancestor in path.ancestors().filter(|a| !a.as_os_str().is_empty()) {
            inner
                .nodes
                .entry(ancestor.to_path_buf())
                .or_insert(Node::Dir);
        }
        Ok(NodeState::Created)
    }

    fn write_attribute(&self, path: &Path, value: &str) -> Result<()> {
        let mut data = value.as_bytes().to_vec();
        if !value.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(path, data)
    }

    fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.write(path, data.to_vec())
    }

    fn read_attribute(&self, path: &Path) -> Result<String> {
        self.attr(path).ok_or_else(|| AppError::NotFound {
            path: path.display().to_string(),
        })
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        self.bytes(path).ok_or_else(|| AppError::NotFound {
            path: path.display().to_string(),
        })
    }

    fn link_target(&self, link: &Path) -> Result<Option<PathBuf>> {
        match self.node(link) {
            Some(Node::Link(target)) => Ok(Some(target)),
            _ => Ok(None),
        }
    }

    fn link(&self, target: &Path, link: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_parent(link)?;
        if inner.nodes.get(target) != Some(&Node::Dir) {
            return Err(AppError::NotFound {
                path: target.display().to_string(),
            });
        }
        if inner.nodes.contains_key(link) {
            return Err(AppError::ResourceConflict {
                path: link.display().to_string(),
                reason: "already exists".to_string(),
            });
        }
        inner
            .nodes
            .insert(link.to_path_buf(), Node::Link(target.to_path_buf()));
        Ok(())
    }

    fn unlink(&self, link: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.nodes.get(link) {
            Some(Node::Link(_)) => {
                inner.nodes.remove(link);
                Ok(())
            }
            None => Ok(()),
            Some(_) => Err(AppError::ResourceConflict {
                path: link.display().to_string(),
                reason: "not a link".to_string(),
            }),
        }
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.nodes.get(path) {
            None => return Ok(()),
            Some(Node::Dir) => {}
            Some(_) => {
                return Err(AppError::ResourceConflict {
                    path: path.display().to_string(),
                    reason: "not a directory".to_string(),
                })
            }
        }

        // Empty sub-directories behave like configfs default groups and go
        // with their parent; anything else below the direct attributes blocks
        let blocking = inner.nodes.iter().any(|(p, n)| {
            p.starts_with(path)
                && p.as_path() != path
                && !(p.parent() == Some(path) && matches!(n, Node::Attr(_)))
                && !matches!(n, Node::Dir)
        });
        if blocking {
            return Err(AppError::ResourceBusy(format!(
                "{} has child nodes",
                path.display()
            )));
        }

        if inner
            .nodes
            .values()
            .any(|n| matches!(n, Node::Link(t) if t.starts_with(path)))
        {
            return Err(AppError::ResourceBusy(format!(
                "{} is still linked",
                path.display()
            )));
        }

        let udc = path.join("UDC");
        if matches!(inner.nodes.get(&udc), Some(Node::Attr(v)) if !v.trim_ascii().is_empty()) {
            return Err(AppError::ResourceBusy(format!(
                "{} is bound to a controller",
                path.display()
            )));
        }

        let doomed: Vec<PathBuf> = inner
            .nodes
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        for p in doomed {
            inner.nodes.remove(&p);
        }
        Ok(())
    }

    fn list_controllers(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().controllers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_rules() {
        let tree = MemoryTree::new();
        tree.create_dir(Path::new("g/functions/hid.usb0")).unwrap();
        tree.create_dir(Path::new("g/configs/c.1")).unwrap();
        tree.link(
            Path::new("g/functions/hid.usb0"),
            Path::new("g/configs/c.1/hid.usb0"),
        )
        .unwrap();

        assert!(matches!(
            tree.remove_dir(Path::new("g/functions/hid.usb0")),
            Err(AppError::ResourceBusy(_))
        ));

        tree.unlink(Path::new("g/configs/c.1/hid.usb0")).unwrap();
        tree.remove_dir(Path::new("g/functions/hid.usb0")).unwrap();
        assert_eq!(tree.kind(Path::new("g/functions/hid.usb0")), NodeKind::Missing);
    }

    #[test]
    fn test_linked_function_attributes_are_locked() {
        let tree = MemoryTree::new();
        tree.create_dir(Path::new("g/functions/hid.usb0")).unwrap();
        tree.create_dir(Path::new("g/configs/c.1")).unwrap();
        tree.write_attribute(Path::new("g/functions/hid.usb0/protocol"), "0")
            .unwrap();
        tree.link(
            Path::new("g/functions/hid.usb0"),
            Path::new("g/configs/c.1/hid.usb0"),
        )
        .unwrap();

        assert!(matches!(
            tree.write_attribute(Path::new("g/functions/hid.usb0/protocol"), "1"),
            Err(AppError::Busy { .. })
        ));
        assert!(matches!(
            tree.write_bytes(Path::new("g/functions/hid.usb0/report_desc"), &[0xC0]),
            Err(AppError::Busy { .. })
        ));
        // Siblings are not affected
        tree.write_attribute(Path::new("g/configs/c.1/MaxPower"), "100")
            .unwrap();

        tree.unlink(Path::new("g/configs/c.1/hid.usb0")).unwrap();
        tree.write_attribute(Path::new("g/functions/hid.usb0/protocol"), "1")
            .unwrap();
        assert_eq!(tree.attr("g/functions/hid.usb0/protocol").as_deref(), Some("1"));
    }

    #[test]
    fn test_bound_root_is_busy() {
        let tree = MemoryTree::new();
        tree.create_dir(Path::new("g")).unwrap();
        tree.write_attribute(Path::new("g/UDC"), "dummy_udc.0").unwrap();
        assert!(matches!(
            tree.remove_dir(Path::new("g")),
            Err(AppError::ResourceBusy(_))
        ));

        tree.write_attribute(Path::new("g/UDC"), "").unwrap();
        tree.remove_dir(Path::new("g")).unwrap();
        assert!(tree.is_empty());
    }
}
