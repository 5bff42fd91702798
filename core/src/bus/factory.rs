//! Bus selection at startup

use std::rc::Rc;

use anyhow::{Context, Result, bail};
use log::*;

use super::virtualbus::VirtualBus;
use super::{BusMode, ScsiBus};

const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";

/// Single-board computer the emulator runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum SbcVersion {
    RaspberryPi,
    BananaM2p,
    /// Anything else, served by the virtual bus
    Unknown,
}

impl SbcVersion {
    /// Classifies a device tree model string
    pub fn from_model(model: &str) -> Self {
        let model = model.trim_end_matches('\0').trim();
        if model.starts_with("Raspberry Pi") {
            Self::RaspberryPi
        } else if model.starts_with("Banana Pi BPI-M2") || model.contains("BananaPi M2 Plus") {
            Self::BananaM2p
        } else {
            Self::Unknown
        }
    }

    /// Probes the host. Hardware registers on a recognized board are only
    /// accessible to root.
    pub fn detect() -> Result<Self> {
        let model = match std::fs::read_to_string(DEVICE_TREE_MODEL) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::Unknown),
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", DEVICE_TREE_MODEL));
            }
        };

        let version = Self::from_model(&model);
        if version != Self::Unknown && !is_root() {
            bail!("No permission to access GPIO registers on {}", version);
        }
        Ok(version)
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

pub type ProbeFn = Box<dyn Fn() -> Result<SbcVersion>>;
pub type HardwareBuilder = Box<dyn Fn(SbcVersion) -> Result<Rc<dyn ScsiBus>>>;

/// Creates the bus matching the host platform
pub struct BusFactory {
    probe: ProbeFn,
    hardware: Option<HardwareBuilder>,
}

impl Default for BusFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BusFactory {
    pub fn new() -> Self {
        Self {
            probe: Box::new(SbcVersion::detect),
            hardware: None,
        }
    }

    /// Replaces the platform probe
    pub fn with_probe(mut self, probe: impl Fn() -> Result<SbcVersion> + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Registers the builder for GPIO backed buses on supported boards
    pub fn with_hardware(
        mut self,
        builder: impl Fn(SbcVersion) -> Result<Rc<dyn ScsiBus>> + 'static,
    ) -> Self {
        self.hardware = Some(Box::new(builder));
        self
    }

    /// Creates, initializes and resets the bus. Failures are logged and
    /// reported as `None`.
    pub fn create(&self, mode: BusMode) -> Option<Rc<dyn ScsiBus>> {
        let version = match (self.probe)() {
            Ok(v) => v,
            Err(e) => {
                error!(
                    "Exception while trying to initialize bus: {:#}. Are you running as root?",
                    e
                );
                return None;
            }
        };

        let bus: Rc<dyn ScsiBus> = match version {
            SbcVersion::Unknown => {
                info!("Creating virtual bus");
                Rc::new(VirtualBus::new())
            }
            _ => {
                trace!("Creating bus for {}", version);
                let Some(builder) = self.hardware.as_ref() else {
                    error!("No bus driver available for {}", version);
                    return None;
                };
                match builder(version) {
                    Ok(b) => b,
                    Err(e) => {
                        error!("Cannot create bus for {}: {:#}", version, e);
                        return None;
                    }
                }
            }
        };

        if let Err(e) = bus.init(mode) {
            error!("Bus initialization failed: {:#}", e);
            return None;
        }
        bus.reset();
        Some(bus)
    }
}
