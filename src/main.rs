use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remote_gamepad::config::{DispatcherConfig, GadgetConfig, MappingDefinition};
use remote_gamepad::hid::{
    DispatchStats, Dispatcher, EvdevSource, EventFilter, HidBackend, OtgBackend, ReportLayout,
    TranslationTable, UinputBackend, VIRTUAL_DEVICE_NAME,
};
use remote_gamepad::otg::configfs::{self, ConfigFs};
use remote_gamepad::otg::report_desc::{compile_buttons, DesktopUsage};
use remote_gamepad::otg::{wait_for_hid_devices, DeviceConfiguration, OtgGadgetManager};
use remote_gamepad::utils::TokioScheduler;

/// How long to wait for /dev/hidgN after binding
const HID_DEVICE_WAIT_MS: u64 = 2000;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Top-level collection usage
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum UsageArg {
    #[default]
    Gamepad,
    Joystick,
}

impl From<UsageArg> for DesktopUsage {
    fn from(usage: UsageArg) -> Self {
        match usage {
            UsageArg::Gamepad => DesktopUsage::Gamepad,
            UsageArg::Joystick => DesktopUsage::Joystick,
        }
    }
}

/// remote-gamepad command line arguments
#[derive(Parser, Debug)]
#[command(name = "remote-gamepad")]
#[command(version, about = "Use an IR/RF remote as a gamepad", long_about = None)]
struct CliArgs {
    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Input device to read remote events from (/dev/input/eventN)
    #[arg(short = 'd', long, value_name = "PATH")]
    device: PathBuf,

    /// Mapping definition (YAML)
    #[arg(short = 'm', long, value_name = "FILE")]
    mapping: PathBuf,

    /// Grab the input device so no other reader sees its events
    #[arg(long)]
    grab: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive a local uinput virtual gamepad
    Virtual {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Drive a USB HID gadget endpoint
    Gadget {
        #[command(flatten)]
        source: SourceArgs,

        /// Gadget configuration (YAML); built-in layout when omitted
        #[arg(short = 'c', long, value_name = "FILE")]
        gadget_config: Option<PathBuf>,

        /// HID endpoint (default: endpoint of the first function)
        #[arg(long, value_name = "PATH")]
        endpoint: Option<PathBuf>,

        /// Use an existing gadget instead of provisioning one
        #[arg(long)]
        skip_setup: bool,

        /// Remove the gadget when the dispatcher stops
        #[arg(long)]
        teardown_on_exit: bool,
    },
    /// Provision and bind the USB gadget
    Setup {
        #[arg(short = 'c', long, value_name = "FILE")]
        gadget_config: Option<PathBuf>,
    },
    /// Unbind and remove the USB gadget
    Teardown {
        #[arg(short = 'c', long, value_name = "FILE")]
        gadget_config: Option<PathBuf>,
    },
    /// Print a compiled report descriptor and its geometry as JSON
    Descriptor {
        #[arg(short = 'b', long, default_value_t = 24)]
        buttons: u32,

        #[arg(short = 'u', long, value_enum, default_value = "gamepad")]
        usage: UsageArg,

        #[arg(long, value_name = "ID")]
        report_id: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting remote-gamepad v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Virtual { source } => run_virtual(source).await,
        Command::Gadget {
            source,
            gadget_config,
            endpoint,
            skip_setup,
            teardown_on_exit,
        } => {
            run_gadget(
                source,
                gadget_config.as_deref(),
                endpoint,
                skip_setup,
                teardown_on_exit,
            )
            .await
        }
        Command::Setup { gadget_config } => {
            check_gadget_support()?;
            let mut manager = gadget_manager(gadget_config.as_deref())?;
            manager.setup()?;
            let udc = manager.activate()?;
            tracing::info!(udc = %udc, gadget = %manager.gadget_path().display(), "Gadget ready");
            for path in manager.device_paths() {
                println!("{}", path.display());
            }
            Ok(())
        }
        Command::Teardown { gadget_config } => {
            let mut manager = gadget_manager(gadget_config.as_deref())?;
            manager.teardown()?;
            Ok(())
        }
        Command::Descriptor {
            buttons,
            usage,
            report_id,
        } => print_descriptor(buttons, usage, report_id),
    }
}

async fn run_virtual(source: SourceArgs) -> anyhow::Result<()> {
    if !configfs::can_write_uinput() {
        tracing::warn!("/dev/uinput is not writable, virtual device creation will likely fail");
    }

    let mapping = MappingDefinition::from_yaml_file(&source.mapping)?;
    let table = TranslationTable::virtual_keys(&mapping)?;
    let filter = EventFilter::from_selector(&mapping.event)?;
    let backend = UinputBackend::create(VIRTUAL_DEVICE_NAME, &table.codes())?;

    let stats = dispatch(&source, backend, table, filter).await?;
    tracing::info!(?stats, "Virtual session finished");
    Ok(())
}

async fn run_gadget(
    source: SourceArgs,
    gadget_config: Option<&Path>,
    endpoint: Option<PathBuf>,
    skip_setup: bool,
    teardown_on_exit: bool,
) -> anyhow::Result<()> {
    let mut manager = gadget_manager(gadget_config)?;

    if !skip_setup {
        check_gadget_support()?;
        manager.setup()?;
        manager.activate()?;
    }

    let functions = &manager.configuration().functions;
    let function = functions
        .first()
        .context("gadget configuration has no HID function")?;
    if functions.len() > 1 {
        tracing::warn!(
            functions = functions.len(),
            "Only the first HID function is driven by the dispatcher"
        );
    }
    let layout = ReportLayout::from_geometry(&function.descriptor().geometry);
    let endpoint = endpoint.unwrap_or_else(|| function.device_path());

    if !wait_for_hid_devices(std::slice::from_ref(&endpoint), HID_DEVICE_WAIT_MS).await {
        tracing::warn!(
            endpoint = %endpoint.display(),
            "HID endpoint did not appear, reports will fail until the host enumerates the gadget"
        );
    }

    let mapping = MappingDefinition::from_yaml_file(&source.mapping)?;
    let table = TranslationTable::gadget_buttons(&mapping, layout.button_count())?;
    let filter = EventFilter::from_selector(&mapping.event)?;
    let backend = OtgBackend::new(endpoint, layout);

    let result = dispatch(&source, backend, table, filter).await;

    if teardown_on_exit {
        if let Err(e) = manager.teardown() {
            tracing::error!(code = e.code(), "Gadget teardown failed: {}", e);
        }
    }

    let stats = result?;
    tracing::info!(?stats, "Gadget session finished");
    Ok(())
}

/// Run one dispatcher until Ctrl-C
async fn dispatch<B: HidBackend>(
    source: &SourceArgs,
    backend: B,
    table: TranslationTable,
    filter: EventFilter,
) -> anyhow::Result<DispatchStats> {
    let events = EvdevSource::open(&source.device, source.grab)
        .with_context(|| format!("failed to open input device {}", source.device.display()))?;

    let dispatcher = Dispatcher::new(
        events,
        backend,
        table,
        filter,
        Arc::new(TokioScheduler),
        DispatcherConfig::default(),
    )?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    Ok(dispatcher.run(cancel).await?)
}

fn gadget_manager(path: Option<&Path>) -> anyhow::Result<OtgGadgetManager> {
    let config = GadgetConfig::load(path)?;
    let config = DeviceConfiguration::compile(&config)?;
    Ok(OtgGadgetManager::new(Arc::new(ConfigFs::new()), config))
}

/// Refuse gadget mode without configfs; missing modules are only a warning
fn check_gadget_support() -> anyhow::Result<()> {
    if !configfs::is_configfs_available() {
        anyhow::bail!(
            "configfs not mounted at {}, mount it and load libcomposite",
            configfs::CONFIGFS_PATH
        );
    }
    match configfs::missing_kernel_modules() {
        Ok(missing) if !missing.is_empty() => {
            tracing::warn!(?missing, "Kernel modules not loaded (fine if built in)");
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("Could not read loaded modules: {}", e),
    }
    Ok(())
}

fn print_descriptor(buttons: u32, usage: UsageArg, report_id: Option<u8>) -> anyhow::Result<()> {
    let compiled = compile_buttons(usage.into(), buttons, report_id)?;
    let hex: Vec<String> = compiled.bytes.iter().map(|b| format!("{:02x}", b)).collect();
    let output = serde_json::json!({
        "usage": DesktopUsage::from(usage),
        "descriptor": hex.join(" "),
        "length": compiled.bytes.len(),
        "geometry": compiled.geometry,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "remote_gamepad=error",
        LogLevel::Warn => "remote_gamepad=warn",
        LogLevel::Info => "remote_gamepad=info",
        LogLevel::Verbose => "remote_gamepad=debug,warn",
        LogLevel::Debug => "remote_gamepad=debug,info",
        LogLevel::Trace => "remote_gamepad=trace,info",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
