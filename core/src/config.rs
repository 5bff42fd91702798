//! Device definitions, from a JSON file or `ID[:LUN]=TYPE[@PARAMS]` attach
//! specifications

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::scsi::ScsiTargetType;
use crate::scsi::device::PrimaryDevice;
use crate::scsi::disk::{DISK_BLOCKSIZE, ScsiTargetDisk};
use crate::scsi::host_services::HostServices;
use crate::scsi::manager::{ControllerManager, MAX_LUNS, MAX_TARGETS};

const COMPONENT_SEPARATOR: char = ':';
const KEY_VALUE_SEPARATOR: char = '=';

/// Parameter naming the image file of a device
pub const PARAM_FILE: &str = "file";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    pub id: u8,
    #[serde(default)]
    pub lun: u8,
    #[serde(rename = "type")]
    pub target_type: ScsiTargetType,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<usize>,
    #[serde(default)]
    pub protected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl DeviceDefinition {
    pub fn new(id: u8, lun: u8, target_type: ScsiTargetType) -> Self {
        Self {
            id,
            lun,
            target_type,
            params: HashMap::new(),
            block_size: None,
            protected: false,
            vendor: None,
            product: None,
            revision: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id >= MAX_TARGETS {
            bail!("Invalid device ID {} (0-{})", self.id, MAX_TARGETS - 1);
        }
        if self.lun >= MAX_LUNS {
            bail!("Invalid LUN {} (0-{})", self.lun, MAX_LUNS - 1);
        }
        Ok(())
    }

    /// Instantiates the emulated device
    pub fn create_device(&self) -> Result<Box<dyn PrimaryDevice>> {
        self.validate()?;

        let mut device: Box<dyn PrimaryDevice> = match self.target_type {
            ScsiTargetType::Disk => {
                let Some(file) = self.params.get(PARAM_FILE) else {
                    bail!("Missing image file for {}:{}", self.id, self.lun);
                };
                let blocksize = self.block_size.unwrap_or(DISK_BLOCKSIZE);
                Box::new(
                    ScsiTargetDisk::load_disk(self.id, self.lun, &PathBuf::from(file), blocksize)
                        .with_context(|| {
                            format!("Cannot attach disk {}:{}", self.id, self.lun)
                        })?,
                )
            }
            ScsiTargetType::HostServices => Box::new(HostServices::new(self.id, self.lun)?),
        };

        let d = device.device_mut();
        if let Some(vendor) = &self.vendor {
            d.set_vendor(vendor)?;
        }
        if let Some(product) = &self.product {
            d.set_product(product)?;
        }
        if let Some(revision) = &self.revision {
            d.set_revision(revision)?;
        }
        if self.protected {
            if !d.is_protectable() {
                bail!("{} {}:{} cannot be write protected", self.target_type, self.id, self.lun);
            }
            d.set_protected(true);
        }
        d.set_params(self.params.clone());

        Ok(device)
    }
}

impl FromStr for DeviceDefinition {
    type Err = anyhow::Error;

    /// Parses `ID[:LUN]=TYPE[@PARAMS]`
    fn from_str(s: &str) -> Result<Self> {
        let Some((address, device)) = s.split_once('=') else {
            bail!("Invalid attach specification '{}', expected ID[:LUN]=TYPE[@PARAMS]", s);
        };

        let (id, lun) = match address.split_once(':') {
            Some((id, lun)) => (id, Some(lun)),
            None => (address, None),
        };
        let id = id
            .trim()
            .parse::<u8>()
            .with_context(|| format!("Invalid device ID '{}'", id))?;
        let lun = match lun {
            Some(lun) => lun
                .trim()
                .parse::<u8>()
                .with_context(|| format!("Invalid LUN '{}'", lun))?,
            None => 0,
        };

        let (target_type, params) = match device.split_once('@') {
            Some((t, params)) => (t, params),
            None => (device, ""),
        };
        let target_type = ScsiTargetType::from_str(target_type.trim())
            .map_err(|_| anyhow::anyhow!("Unknown device type '{}'", target_type))?;

        let mut definition = Self::new(id, lun, target_type);
        definition.params = parse_parameters(params);
        definition.validate()?;
        Ok(definition)
    }
}

/// Parses `key=value:key=value` parameters. A value without any key is the
/// image file.
pub fn parse_parameters(params: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    if params.is_empty() {
        return result;
    }

    if !params.contains(KEY_VALUE_SEPARATOR) {
        result.insert(PARAM_FILE.to_string(), params.to_string());
        return result;
    }

    for component in params.split(COMPONENT_SEPARATOR) {
        if let Some((key, value)) = component.split_once(KEY_VALUE_SEPARATOR)
            && !key.is_empty()
            && !value.is_empty()
        {
            result.insert(key.to_string(), value.to_string());
        }
    }
    result
}

/// Devices to attach at startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

impl TargetConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid device configuration")?;
        for d in &config.devices {
            d.validate()?;
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to load {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Creates all devices and attaches them to `manager`
    pub fn attach_all(&self, manager: &mut ControllerManager) -> Result<()> {
        for definition in &self.devices {
            let device = definition.create_device()?;
            manager.attach_to_controller(definition.id, device)?;
        }
        Ok(())
    }
}
