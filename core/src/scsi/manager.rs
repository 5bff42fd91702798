//! Registry of controllers, one per target ID

use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use itertools::Itertools;
use log::*;

use crate::bus::{BusPhase, ScsiBus};
use crate::scsi::ShutdownMode;
use crate::scsi::controller::ScsiController;
use crate::scsi::device::PrimaryDevice;

pub const MAX_TARGETS: u8 = 8;
pub const MAX_LUNS: u8 = 32;

pub struct ControllerManager {
    bus: Rc<dyn ScsiBus>,
    controllers: BTreeMap<u8, ScsiController>,
}

impl ControllerManager {
    pub fn new(bus: Rc<dyn ScsiBus>) -> Self {
        Self {
            bus,
            controllers: BTreeMap::new(),
        }
    }

    pub fn get_bus(&self) -> &Rc<dyn ScsiBus> {
        &self.bus
    }

    /// Attaches a device at target `id`, creating the controller if needed.
    /// LUN 0 has to be attached before any other LUN.
    pub fn attach_to_controller(&mut self, id: u8, device: Box<dyn PrimaryDevice>) -> Result<()> {
        let lun = device.device().get_lun();
        if id >= MAX_TARGETS {
            bail!("Invalid ID {} (0-{})", id, MAX_TARGETS - 1);
        }
        if lun >= MAX_LUNS {
            bail!("Invalid LUN {} (0-{})", lun, MAX_LUNS - 1);
        }

        match self.controllers.get(&id) {
            Some(c) if c.has_device_for_lun(lun) => {
                bail!("Duplicate ID {}:{}", id, lun);
            }
            Some(c) if lun != 0 && !c.has_device_for_lun(0) => {
                bail!("LUN 0 is missing for ID {}", id);
            }
            None if lun != 0 => {
                bail!("LUN 0 is missing for ID {}", id);
            }
            _ => (),
        }

        info!(
            "Attaching {} ({}) at {}:{}",
            device.device().get_type(),
            device.device().get_padded_name().trim_end(),
            id,
            lun
        );
        let controller = self
            .controllers
            .entry(id)
            .or_insert_with(|| ScsiController::new(Rc::clone(&self.bus), id));
        controller.add_device(device);
        Ok(())
    }

    /// Detaches a device, deleting the controller once it has no devices left
    pub fn detach(&mut self, id: u8, lun: u8) -> Result<()> {
        let Some(controller) = self.controllers.get_mut(&id) else {
            bail!("No device at ID {}", id);
        };
        if !controller.has_device_for_lun(lun) {
            bail!("No device at {}:{}", id, lun);
        }
        if lun == 0 && controller.lun_count() > 1 {
            bail!("LUN 0 cannot be detached as long as there is still another LUN");
        }

        if let Some(mut device) = controller.remove_device(lun) {
            device
                .flush()
                .with_context(|| format!("Cannot flush device {}:{}", id, lun))?;
        }
        if controller.lun_count() == 0 {
            self.controllers.remove(&id);
        }
        info!("Detached {}:{}", id, lun);
        Ok(())
    }

    pub fn has_controller(&self, id: u8) -> bool {
        self.controllers.contains_key(&id)
    }

    pub fn get_controller_count(&self) -> usize {
        self.controllers.len()
    }

    pub fn find_controller(&self, id: u8) -> Option<&ScsiController> {
        self.controllers.get(&id)
    }

    pub fn find_controller_mut(&mut self, id: u8) -> Option<&mut ScsiController> {
        self.controllers.get_mut(&id)
    }

    /// Controller whose ID bit is set in the data bus value
    pub fn identify_controller(&self, id_data: u8) -> Option<&ScsiController> {
        self.controllers
            .iter()
            .find(|&(&id, _)| id_data & (1 << id) != 0)
            .map(|(_, c)| c)
    }

    pub fn get_device_by_id_and_lun(&self, id: u8, lun: u8) -> Option<&dyn PrimaryDevice> {
        self.controllers.get(&id)?.device_for_lun(lun)
    }

    /// Attached devices as (ID, LUN) pairs
    pub fn get_devices(&self) -> Vec<(u8, u8)> {
        self.controllers
            .iter()
            .flat_map(|(&id, c)| c.luns().map(move |lun| (id, lun)))
            .collect()
    }

    /// Human readable summary of all attached devices
    pub fn device_list(&self) -> String {
        self.controllers
            .iter()
            .flat_map(|(&id, c)| {
                c.luns().filter_map(move |lun| {
                    let d = c.device_for_lun(lun)?.device();
                    Some(format!("{}:{} {}", id, lun, d.get_type()))
                })
            })
            .join(", ")
    }

    pub fn reset_all_controllers(&mut self) {
        for controller in self.controllers.values_mut() {
            controller.reset();
        }
    }

    pub fn delete_all_controllers(&mut self) {
        if let Err(e) = self.flush_all() {
            error!("{:#}", e);
        }
        self.controllers.clear();
    }

    /// Writes back all device caches
    pub fn flush_all(&mut self) -> Result<()> {
        for (&id, controller) in &mut self.controllers {
            for device in controller.devices_mut() {
                let lun = device.device().get_lun();
                device
                    .flush()
                    .with_context(|| format!("Cannot flush device {}:{}", id, lun))?;
            }
        }
        Ok(())
    }

    /// Runs the controller selected by `id_data` until the bus is free again.
    ///
    /// The initiator ID is the remaining bit on the data bus, if any. Returns
    /// the shutdown the executed commands requested.
    pub fn process_on_controller(&mut self, id_data: u8) -> Option<ShutdownMode> {
        let target_id = self.identify_controller(id_data)?.get_target_id();

        let remaining = id_data & !(1 << target_id);
        let initiator_id = (remaining != 0).then(|| remaining.trailing_zeros() as u8);

        let controller = self.controllers.get_mut(&target_id)?;
        if controller.process(initiator_id) == BusPhase::Selection {
            // Run the command until the target releases the bus
            while controller.process(initiator_id) != BusPhase::BusFree {}
        }

        controller.take_shutdown_request()
    }
}
