//! OTG Gadget Manager - builds and removes the configfs gadget tree

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::configfs::{NodeKind, NodeState, ResourceTree};
use super::function::GadgetFunction;
use super::hid::HidFunction;
use super::report_desc::compile_buttons;
use crate::config::{ConfigurationGroup, GadgetConfig, LocaleStrings};
use crate::error::{AppError, Result};

/// Compiled, validated gadget layout
#[derive(Debug, Clone)]
pub struct DeviceConfiguration {
    pub name: String,
    /// Root attribute files and values, in write order
    pub attributes: Vec<(&'static str, String)>,
    pub locales: Vec<LocaleStrings>,
    pub functions: Vec<HidFunction>,
    pub configs: Vec<ConfigurationGroup>,
    /// Preferred UDC
    pub udc: Option<String>,
}

impl DeviceConfiguration {
    /// Validate a gadget config and compile every HID descriptor
    pub fn compile(config: &GadgetConfig) -> Result<Self> {
        config.validate()?;

        let mut functions = Vec::with_capacity(config.functions.len());
        for (index, func) in config.functions.iter().enumerate() {
            let descriptor = compile_buttons(func.usage, func.buttons, func.report_id)?;
            functions.push(HidFunction::new(
                index as u8,
                &func.name,
                func.usage,
                func.subclass,
                func.protocol,
                descriptor,
            ));
        }

        Ok(Self {
            name: config.name.clone(),
            attributes: config.device.entries(),
            locales: config.strings.clone(),
            functions,
            configs: config.configs.clone(),
            udc: config.udc.clone(),
        })
    }

    /// Functions linked by a configuration group
    fn linked_functions<'a>(
        &'a self,
        group: &'a ConfigurationGroup,
    ) -> impl Iterator<Item = &'a HidFunction> + 'a {
        self.functions.iter().filter(move |f| {
            group
                .functions
                .iter()
                .any(|name| f.name().strip_prefix("hid.") == Some(name.as_str()))
        })
    }
}

/// Progress of the gadget tree; each state implies all earlier ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GadgetState {
    Unconfigured,
    RootCreated,
    AttributesWritten,
    StringsWritten,
    FunctionsWritten,
    ConfigurationsWritten,
    Linked,
    Activated,
}

/// Pick the controller to bind: the preferred one when listed, else the first
pub fn choose_controller<'a>(controllers: &'a [String], preferred: Option<&str>) -> Option<&'a str> {
    if let Some(wanted) = preferred {
        if let Some(found) = controllers.iter().find(|c| c.as_str() == wanted) {
            return Some(found.as_str());
        }
        warn!(
            preferred = wanted,
            "Preferred UDC not present, falling back to first controller"
        );
    }
    controllers.first().map(String::as_str)
}

/// OTG Gadget Manager
///
/// Walks the gadget tree forward through [`GadgetState`] on setup and
/// removes it in reverse dependency order on teardown. Failed steps are
/// not rolled back; the tree is left as it was for inspection.
pub struct OtgGadgetManager {
    tree: Arc<dyn ResourceTree>,
    /// Gadget path relative to the tree base
    gadget_path: PathBuf,
    config: DeviceConfiguration,
    state: GadgetState,
    /// Bound UDC name
    bound_udc: Option<String>,
}

impl OtgGadgetManager {
    pub fn new(tree: Arc<dyn ResourceTree>, config: DeviceConfiguration) -> Self {
        Self {
            tree,
            gadget_path: PathBuf::from(&config.name),
            config,
            state: GadgetState::Unconfigured,
            bound_udc: None,
        }
    }

    pub fn state(&self) -> GadgetState {
        self.state
    }

    pub fn bound_udc(&self) -> Option<&str> {
        self.bound_udc.as_deref()
    }

    /// Get gadget path
    pub fn gadget_path(&self) -> &Path {
        &self.gadget_path
    }

    pub fn configuration(&self) -> &DeviceConfiguration {
        &self.config
    }

    /// Expected HID endpoint paths (e.g. /dev/hidg0)
    pub fn device_paths(&self) -> Vec<PathBuf> {
        self.config.functions.iter().map(|f| f.device_path()).collect()
    }

    /// Check if gadget exists
    pub fn gadget_exists(&self) -> bool {
        self.tree.kind(&self.gadget_path) == NodeKind::Directory
    }

    /// Controller the gadget is bound to, if any
    fn read_udc(&self) -> Option<String> {
        self.tree
            .read_attribute(&self.gadget_path.join("UDC"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Check if gadget is bound to UDC
    pub fn is_bound(&self) -> bool {
        self.read_udc().is_some()
    }

    fn config_path(&self, group: &ConfigurationGroup) -> PathBuf {
        self.gadget_path.join("configs").join(&group.name)
    }

    fn advance(&mut self, state: GadgetState) {
        debug!(from = ?self.state, to = ?state, "Gadget state");
        self.state = state;
    }

    fn write_attr(&self, path: &Path, value: &str) -> Result<()> {
        self.tree.write_attribute(path, value).map_err(|e| {
            error!(
                path = %path.display(),
                value,
                code = e.code(),
                "Failed to write gadget attribute: {}",
                e
            );
            e
        })
    }

    fn create_dir(&self, path: &Path) -> Result<NodeState> {
        self.tree.create_dir(path).map_err(|e| {
            error!(path = %path.display(), code = e.code(), "Failed to create directory: {}", e);
            e
        })
    }

    /// Build the gadget tree up to [`GadgetState::Linked`]
    ///
    /// Safe to re-run over a tree this manager created earlier. A gadget
    /// that is already bound is left untouched.
    pub fn setup(&mut self) -> Result<()> {
        info!("Setting up USB gadget: {}", self.config.name);

        if self.gadget_exists() {
            if let Some(udc) = self.read_udc() {
                info!(udc = %udc, "Gadget already exists and is bound, skipping setup");
                self.bound_udc = Some(udc);
                self.advance(GadgetState::Activated);
                return Ok(());
            }
        }

        self.create_root()?;
        self.write_attributes()?;
        self.write_strings()?;
        self.write_functions()?;
        self.write_configurations()?;
        self.link_functions()?;

        info!("USB gadget setup complete");
        Ok(())
    }

    fn create_root(&mut self) -> Result<()> {
        match self.tree.kind(&self.gadget_path) {
            NodeKind::Missing | NodeKind::Inaccessible => {
                self.create_dir(&self.gadget_path)?;
            }
            NodeKind::Directory => {
                let populated = !self.tree.list(&self.gadget_path)?.is_empty();
                if populated {
                    let conflict = AppError::ResourceConflict {
                        path: self.gadget_path.display().to_string(),
                        reason: "gadget already exists, reconfiguring in place".to_string(),
                    };
                    warn!(code = conflict.code(), "{}", conflict);
                }
            }
            _ => {
                let err = AppError::ResourceConflict {
                    path: self.gadget_path.display().to_string(),
                    reason: "path exists and is not a directory".to_string(),
                };
                error!(code = err.code(), "{}", err);
                return Err(err);
            }
        }
        self.advance(GadgetState::RootCreated);
        Ok(())
    }

    /// Set USB device descriptors
    fn write_attributes(&mut self) -> Result<()> {
        for (attr, value) in &self.config.attributes {
            self.write_attr(&self.gadget_path.join(attr), value)?;
        }
        debug!("Set device descriptors");
        self.advance(GadgetState::AttributesWritten);
        Ok(())
    }

    /// Create USB strings
    fn write_strings(&mut self) -> Result<()> {
        for locale in &self.config.locales {
            let strings_path = self.gadget_path.join("strings").join(&locale.language);
            self.create_dir(&strings_path)?;
            for (attr, value) in locale.entries() {
                self.write_attr(&strings_path.join(attr), value)?;
            }
        }
        debug!("Created USB strings");
        self.advance(GadgetState::StringsWritten);
        Ok(())
    }

    /// Write every function that differs from what the tree holds
    ///
    /// A linked function's attributes are locked by the kernel, so a stale
    /// function is unlinked from every configuration first; `link_functions`
    /// links it again.
    fn write_functions(&mut self) -> Result<()> {
        let tree = self.tree.as_ref();
        for func in &self.config.functions {
            let meta = func.meta();
            if func.is_current(tree, &self.gadget_path)? {
                debug!(function = %meta.name, "Function already up to date");
                continue;
            }

            for link in self.links_to(func)? {
                tree.unlink(&link)?;
                debug!(link = %link.display(), "Unlinked stale function");
            }
            func.create(tree, &self.gadget_path)?;
            info!(
                function = %meta.name,
                description = %meta.description,
                report_length = meta.report_length,
                "Wrote HID function"
            );
        }
        self.advance(GadgetState::FunctionsWritten);
        Ok(())
    }

    /// Create configuration groups
    fn write_configurations(&mut self) -> Result<()> {
        for group in &self.config.configs {
            let config_path = self.config_path(group);
            self.create_dir(&config_path)?;

            self.write_attr(
                &config_path.join("bmAttributes"),
                &format!("0x{:02x}", group.bm_attributes),
            )?;
            self.write_attr(&config_path.join("MaxPower"), &group.max_power.to_string())?;

            if let Some(configuration) = &group.configuration {
                for locale in &self.config.locales {
                    let strings_path = config_path.join("strings").join(&locale.language);
                    self.create_dir(&strings_path)?;
                    self.write_attr(&strings_path.join("configuration"), configuration)?;
                }
            }
            debug!("Created configuration {}", group.name);
        }
        self.advance(GadgetState::ConfigurationsWritten);
        Ok(())
    }

    fn link_functions(&mut self) -> Result<()> {
        for group in &self.config.configs {
            let config_path = self.config_path(group);
            for func in self.config.linked_functions(group) {
                func.link(self.tree.as_ref(), &config_path, &self.gadget_path)
                    .map_err(|e| {
                        error!(
                            function = func.name(),
                            config = %config_path.display(),
                            code = e.code(),
                            "Failed to link function: {}",
                            e
                        );
                        e
                    })?;
            }
        }
        self.advance(GadgetState::Linked);
        Ok(())
    }

    /// Bind gadget to a UDC
    ///
    /// With no controller listed the tree stays intact and
    /// [`AppError::NoControllerAvailable`] is returned.
    pub fn activate(&mut self) -> Result<String> {
        if let Some(udc) = self.read_udc() {
            info!(udc = %udc, "Gadget already bound");
            self.bound_udc = Some(udc.clone());
            self.advance(GadgetState::Activated);
            return Ok(udc);
        }

        if self.state < GadgetState::Linked {
            return Err(AppError::ResourceConflict {
                path: self.gadget_path.display().to_string(),
                reason: format!("cannot activate gadget in state {:?}", self.state),
            });
        }

        let controllers = self.tree.list_controllers()?;
        let udc = choose_controller(&controllers, self.config.udc.as_deref())
            .map(str::to_string)
            .ok_or_else(|| {
                error!("No USB Device Controller (UDC) found, gadget left unbound");
                AppError::NoControllerAvailable
            })?;

        info!("Binding gadget to UDC: {}", udc);
        self.write_attr(&self.gadget_path.join("UDC"), &udc)?;
        self.bound_udc = Some(udc.clone());
        self.advance(GadgetState::Activated);
        Ok(udc)
    }

    /// Unbind gadget from UDC
    pub fn unbind(&mut self) -> Result<()> {
        if self.is_bound() {
            self.write_attr(&self.gadget_path.join("UDC"), "")?;
            self.bound_udc = None;
            self.advance(GadgetState::Linked);
            info!("Unbound gadget from UDC");
        }
        Ok(())
    }

    /// Configuration links that point at `func`
    fn links_to(&self, func: &HidFunction) -> Result<Vec<PathBuf>> {
        let target = self.gadget_path.join("functions").join(func.name());
        let mut links = Vec::new();
        for group in &self.config.configs {
            let link = self.config_path(group).join(func.name());
            if self.tree.link_target(&link)?.as_deref() == Some(target.as_path()) {
                links.push(link);
            }
        }
        Ok(links)
    }

    /// Remove one function directory, refusing while a configuration links it
    pub fn remove_function(&self, func: &HidFunction) -> Result<()> {
        if let Some(link) = self.links_to(func)?.first() {
            return Err(AppError::ResourceBusy(format!(
                "function {} is still linked from {}",
                func.name(),
                link.display()
            )));
        }
        func.cleanup(self.tree.as_ref(), &self.gadget_path)
    }

    /// Remove the gadget root, refusing while bound
    pub fn remove_root(&self) -> Result<()> {
        if let Some(udc) = self.read_udc() {
            return Err(AppError::ResourceBusy(format!(
                "gadget {} is bound to {}",
                self.gadget_path.display(),
                udc
            )));
        }
        self.tree.remove_dir(&self.gadget_path)
    }

    /// Remove the whole gadget tree in reverse dependency order
    pub fn teardown(&mut self) -> Result<()> {
        if self.tree.kind(&self.gadget_path) == NodeKind::Missing {
            self.advance(GadgetState::Unconfigured);
            return Ok(());
        }

        info!("Tearing down USB gadget: {}", self.config.name);

        self.unbind()?;

        for group in &self.config.configs {
            let config_path = self.config_path(group);
            for func in self.config.functions.iter().rev() {
                func.unlink(self.tree.as_ref(), &config_path)?;
            }
        }

        for group in &self.config.configs {
            let config_path = self.config_path(group);
            for locale in &self.config.locales {
                self.tree
                    .remove_dir(&config_path.join("strings").join(&locale.language))?;
            }
            self.tree.remove_dir(&config_path)?;
        }

        for func in self.config.functions.iter().rev() {
            self.remove_function(func)?;
        }

        for locale in &self.config.locales {
            self.tree
                .remove_dir(&self.gadget_path.join("strings").join(&locale.language))?;
        }

        self.remove_root().map_err(|e| {
            warn!(code = e.code(), "Could not remove gadget directory: {}", e);
            e
        })?;

        self.advance(GadgetState::Unconfigured);
        info!("USB gadget teardown complete");
        Ok(())
    }
}

/// Wait for HID devices to become available
///
/// Uses exponential backoff starting from 10ms, capped at 100ms,
/// to reduce CPU usage while still providing fast response.
pub async fn wait_for_hid_devices(device_paths: &[PathBuf], timeout_ms: u64) -> bool {
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_millis(timeout_ms);

    let mut delay_ms = 10u64;
    const MAX_DELAY_MS: u64 = 100;

    while start.elapsed() < timeout {
        if device_paths.iter().all(|p| p.exists()) {
            return true;
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        let sleep_duration = std::time::Duration::from_millis(delay_ms).min(remaining);

        if sleep_duration.is_zero() {
            break;
        }

        tokio::time::sleep(sleep_duration).await;

        delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
    }

    false
}
