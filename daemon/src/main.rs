use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::*;

use scsitarget_core::bus::{BusMode, ScsiBus};
use scsitarget_core::bus::factory::BusFactory;
use scsitarget_core::config::{DeviceDefinition, TargetConfig};
use scsitarget_core::scsi::ShutdownMode;
use scsitarget_core::scsi::manager::ControllerManager;

#[derive(Parser)]
#[command(about = "SCSI target emulator", long_about = None)]
struct Args {
    /// JSON device definitions, defaults to scsitarget/devices.json in the
    /// user configuration directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device to attach as ID[:LUN]=TYPE[@PARAMS], e.g. 0=SCHD@disk.hda
    #[arg(short, long)]
    attach: Vec<DeviceDefinition>,

    /// Log level
    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,

    /// Selection polling timeout
    #[arg(long, default_value_t = 100)]
    poll_timeout_ms: u64,
}

fn default_config_path() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join("scsitarget").join("devices.json"))
}

fn load_config(args: &Args) -> Result<TargetConfig> {
    let mut config = match &args.config {
        Some(path) => TargetConfig::load(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => {
                info!("Loading device definitions from {}", path.display());
                TargetConfig::load(&path)?
            }
            _ => TargetConfig::default(),
        },
    };
    config.devices.extend(args.attach.iter().cloned());
    Ok(config)
}

/// Switches the host to `runlevel`
fn run_init(runlevel: &str) -> Result<()> {
    let status = Command::new("init")
        .arg(runlevel)
        .status()
        .context("Failed to run init")?;
    if !status.success() {
        bail!("init {} failed: {}", runlevel, status);
    }
    Ok(())
}

/// Runs the host command for a shutdown of the host
fn shutdown_host(mode: ShutdownMode, init: impl FnOnce(&str) -> Result<()>) -> Result<()> {
    let runlevel = match mode {
        ShutdownMode::StopEmulator => return Ok(()),
        ShutdownMode::StopHost => "0",
        ShutdownMode::RestartHost => "6",
    };
    info!("{}: running init {}", mode, runlevel);
    init(runlevel)
}

/// Handles selections until an initiator requests a shutdown
fn serve(bus: &dyn ScsiBus, manager: &mut ControllerManager, timeout: Duration) -> ShutdownMode {
    loop {
        if !bus.poll_select_event(timeout) {
            continue;
        }

        // Another target responded or the initiator gave up
        if bus.get_bsy() || !bus.get_sel() {
            continue;
        }

        let id_data = bus.get_dat();
        trace!("Selection, data bus {:02X}", id_data);
        if let Some(mode) = manager.process_on_controller(id_data) {
            return mode;
        }
    }
}

/// Releases all devices and the bus, then performs the host part of `mode`
fn shutdown(
    bus: &dyn ScsiBus,
    mut manager: ControllerManager,
    mode: ShutdownMode,
    init: impl FnOnce(&str) -> Result<()>,
) -> Result<()> {
    info!("Shutting down: {}", mode);
    let flushed = manager.flush_all();
    manager.delete_all_controllers();
    bus.reset();
    flushed?;

    shutdown_host(mode, init)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::builder().filter_level(args.log_level).init();

    let config = load_config(&args)?;

    let Some(bus) = BusFactory::new().create(BusMode::Target) else {
        bail!("Cannot initialize bus");
    };

    let mut manager = ControllerManager::new(bus.clone());
    config.attach_all(&mut manager)?;
    if manager.get_controller_count() == 0 {
        warn!("No devices attached");
    } else {
        info!("Devices: {}", manager.device_list());
    }

    let timeout = Duration::from_millis(args.poll_timeout_ms);
    let mode = serve(&*bus, &mut manager, timeout);
    shutdown(&*bus, manager, mode, run_init)
}
