//! Logical unit state and the commands common to all device types

use std::collections::HashMap;

use anyhow::{Result, bail};
use num_traits::FromPrimitive;

use crate::scsi::mode_page::ModePageDevice;
use crate::scsi::{
    Asc, ScsiCmdResult, ScsiCommand, ScsiError, ScsiResult, ScsiStatus, ScsiTargetEvent,
    ScsiTargetType, SenseKey,
};

pub const DEFAULT_VENDOR: &str = "SCSITGT";
pub const DEFAULT_REVISION: &str = "0100";

/// Peripheral qualifier/device type for a LUN that is not present
const PERIPHERAL_NOT_PRESENT: u8 = 0x7F;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Reservation {
    #[default]
    NotReserved,
    /// Reserved by the given initiator, or by an initiator that did not
    /// identify itself
    ReservedBy(Option<u8>),
}

/// Everything the device sees of the command being executed
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub cdb: &'a [u8],
    /// Data received in the data out phase
    pub outdata: Option<&'a [u8]>,
    /// LUN the command is addressed to. May not exist, INQUIRY and
    /// REQUEST SENSE are then executed by LUN 0.
    pub lun: u8,
    /// LUNs present on the controller
    pub luns: &'a [u8],
    pub initiator_id: Option<u8>,
}

impl CommandContext<'_> {
    fn lun_exists(&self) -> bool {
        self.luns.contains(&self.lun)
    }
}

/// Common state of a logical unit
#[derive(Debug)]
pub struct Device {
    target_type: ScsiTargetType,
    id: u8,
    lun: u8,

    ready: bool,
    reset: bool,
    attn: bool,
    removable: bool,
    protectable: bool,
    protected: bool,
    stoppable: bool,
    stopped: bool,
    lockable: bool,
    locked: bool,

    vendor: String,
    product: String,
    revision: String,

    params: HashMap<String, String>,

    sense_key: SenseKey,
    asc: Asc,

    reservation: Reservation,
}

impl Device {
    pub fn new(target_type: ScsiTargetType, id: u8, lun: u8) -> Self {
        Self {
            target_type,
            id,
            lun,
            ready: false,
            reset: false,
            attn: false,
            removable: false,
            protectable: false,
            protected: false,
            stoppable: false,
            stopped: false,
            lockable: false,
            locked: false,
            vendor: DEFAULT_VENDOR.to_string(),
            product: String::new(),
            revision: DEFAULT_REVISION.to_string(),
            params: HashMap::new(),
            sense_key: SenseKey::NoSense,
            asc: Asc::NoAdditionalSenseInformation,
            reservation: Reservation::NotReserved,
        }
    }

    pub fn get_type(&self) -> ScsiTargetType {
        self.target_type
    }

    pub fn get_id(&self) -> u8 {
        self.id
    }

    pub fn get_lun(&self) -> u8 {
        self.lun
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    pub fn set_reset(&mut self, reset: bool) {
        self.reset = reset;
    }

    pub fn is_attn(&self) -> bool {
        self.attn
    }

    pub fn set_attn(&mut self, attn: bool) {
        self.attn = attn;
    }

    pub fn is_removable(&self) -> bool {
        self.removable
    }

    pub fn set_removable(&mut self, removable: bool) {
        self.removable = removable;
    }

    pub fn is_protectable(&self) -> bool {
        self.protectable
    }

    pub fn set_protectable(&mut self, protectable: bool) {
        self.protectable = protectable;
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Write protection, only honored for protectable devices
    pub fn set_protected(&mut self, protected: bool) {
        if self.protectable {
            self.protected = protected;
        }
    }

    pub fn is_stoppable(&self) -> bool {
        self.stoppable
    }

    pub fn set_stoppable(&mut self, stoppable: bool) {
        self.stoppable = stoppable;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        self.stopped = stopped;
    }

    pub fn is_lockable(&self) -> bool {
        self.lockable
    }

    pub fn set_lockable(&mut self, lockable: bool) {
        self.lockable = lockable;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn get_vendor(&self) -> &str {
        &self.vendor
    }

    pub fn set_vendor(&mut self, vendor: &str) -> Result<()> {
        if vendor.is_empty() || vendor.len() > 8 {
            bail!("Vendor '{}' must have between 1 and 8 characters", vendor);
        }
        self.vendor = vendor.to_string();
        Ok(())
    }

    pub fn get_product(&self) -> &str {
        &self.product
    }

    pub fn set_product(&mut self, product: &str) -> Result<()> {
        if product.is_empty() || product.len() > 16 {
            bail!("Product '{}' must have between 1 and 16 characters", product);
        }
        self.product = product.to_string();
        Ok(())
    }

    pub fn get_revision(&self) -> &str {
        &self.revision
    }

    pub fn set_revision(&mut self, revision: &str) -> Result<()> {
        if revision.is_empty() || revision.len() > 4 {
            bail!("Revision '{}' must have between 1 and 4 characters", revision);
        }
        self.revision = revision.to_string();
        Ok(())
    }

    /// Vendor, product and revision padded to their INQUIRY field widths
    pub fn get_padded_name(&self) -> String {
        format!(
            "{:<8}{:<16}{:<4}",
            self.vendor, self.product, self.revision
        )
    }

    pub fn get_params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    pub fn get_sense_key(&self) -> SenseKey {
        self.sense_key
    }

    pub fn get_asc(&self) -> Asc {
        self.asc
    }

    pub fn set_sense(&mut self, sense_key: SenseKey, asc: Asc) {
        self.sense_key = sense_key;
        self.asc = asc;
    }

    pub fn clear_sense(&mut self) {
        self.set_sense(SenseKey::NoSense, Asc::NoAdditionalSenseInformation);
    }

    pub fn get_reservation(&self) -> Reservation {
        self.reservation
    }

    pub fn reserve(&mut self, initiator_id: Option<u8>) {
        self.reservation = Reservation::ReservedBy(initiator_id);
    }

    pub fn release(&mut self) {
        self.reservation = Reservation::NotReserved;
    }

    /// Returns false if the command must be rejected with RESERVATION CONFLICT
    pub fn check_reservation(&self, initiator_id: Option<u8>, cdb: &[u8]) -> bool {
        let Reservation::ReservedBy(owner) = self.reservation else {
            return true;
        };
        if owner == initiator_id {
            return true;
        }

        match ScsiCommand::from_u8(cdb[0]) {
            Some(ScsiCommand::Inquiry | ScsiCommand::RequestSense | ScsiCommand::Release6) => true,
            // Allowed unless it prevents medium removal
            Some(ScsiCommand::PreventAllow) => cdb.get(4).is_some_and(|b| b & 0x01 == 0),
            _ => false,
        }
    }

    /// Unit attention and readiness. Pending unit attentions are reported once.
    pub fn check_ready(&mut self) -> ScsiResult<()> {
        if self.reset {
            self.reset = false;
            log::trace!("Device {}:{} reports power on/reset", self.id, self.lun);
            return Err(ScsiError::new(SenseKey::UnitAttention, Asc::PowerOnOrReset));
        }
        if self.attn {
            self.attn = false;
            log::trace!("Device {}:{} reports medium change", self.id, self.lun);
            return Err(ScsiError::new(
                SenseKey::UnitAttention,
                Asc::NotReadyToReadyChange,
            ));
        }
        if !self.ready {
            return Err(ScsiError::new(SenseKey::NotReady, Asc::MediumNotPresent));
        }
        Ok(())
    }

    /// Standard INQUIRY data
    pub fn inquiry_data(&self, device_type: u8, scsi_level: u8, removable: bool) -> Vec<u8> {
        let mut result = vec![0; 36];
        result[0] = device_type;
        result[1] = if removable { 0x80 } else { 0 };
        result[2] = scsi_level;
        // Response data format
        result[3] = if scsi_level >= 2 { 2 } else { 1 };
        // Additional length
        result[4] = 0x1F;
        result[8..36].copy_from_slice(self.get_padded_name().as_bytes());
        result
    }

    /// Called on bus or controller reset
    pub fn reset(&mut self) {
        self.locked = false;
        self.attn = false;
        self.reset = false;
        self.release();
    }
}

/// A logical unit attached to a controller
pub trait PrimaryDevice {
    fn device(&self) -> &Device;
    fn device_mut(&mut self) -> &mut Device;

    /// Standard INQUIRY data of this device type
    fn inquiry(&self) -> Vec<u8>;

    /// Mode page support, for devices implementing MODE SENSE/SELECT
    fn mode_pages(&self) -> Option<&dyn ModePageDevice> {
        None
    }

    /// Device type specific commands
    fn specific_cmd(&mut self, ctx: &CommandContext) -> ScsiResult<ScsiCmdResult> {
        log::warn!(
            "Unsupported command {:02X} for {}",
            ctx.cdb[0],
            self.device().get_type()
        );
        Err(ScsiError::new(
            SenseKey::IllegalRequest,
            Asc::InvalidCommandOperationCode,
        ))
    }

    fn take_event(&mut self) -> Option<ScsiTargetEvent> {
        None
    }

    /// Writes pending changes to backing storage
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, ctx: &CommandContext) -> ScsiResult<ScsiCmdResult> {
        let cdb = ctx.cdb;
        match ScsiCommand::from_u8(cdb[0]) {
            Some(ScsiCommand::TestUnitReady) => {
                self.device_mut().check_ready()?;
                Ok(ScsiCmdResult::Status(ScsiStatus::Good))
            }
            Some(ScsiCommand::Inquiry) => {
                // EVPD
                if cdb[1] & 0x01 != 0 {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::InvalidFieldInCdb,
                    ));
                }
                let mut result = self.inquiry();
                if !ctx.lun_exists() {
                    log::trace!("INQUIRY for non-existing LUN {}", ctx.lun);
                    result[0] = PERIPHERAL_NOT_PRESENT;
                }
                result.truncate(cdb[4] as usize);
                Ok(ScsiCmdResult::DataIn(result))
            }
            Some(ScsiCommand::RequestSense) => {
                let device = self.device_mut();
                if !ctx.lun_exists() {
                    device.set_sense(SenseKey::IllegalRequest, Asc::InvalidLun);
                } else if device.get_sense_key() == SenseKey::NoSense && !device.is_ready() {
                    device.set_sense(SenseKey::NotReady, Asc::MediumNotPresent);
                }

                let mut result = vec![0; 18];
                // Current error, fixed format
                result[0] = 0x70;
                result[2] = device.get_sense_key() as u8;
                // Additional sense length
                result[7] = 10;
                result[12] = device.get_asc() as u8;
                result.truncate(cdb[4] as usize);
                Ok(ScsiCmdResult::DataIn(result))
            }
            Some(ScsiCommand::ReportLuns) => {
                // Only SELECT REPORT 0 is supported
                if cdb[2] != 0 {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::InvalidFieldInCdb,
                    ));
                }
                let allocation = u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]]) as usize;

                let mut result = vec![0; 8];
                result[0..4].copy_from_slice(&((ctx.luns.len() * 8) as u32).to_be_bytes());
                for &lun in ctx.luns {
                    result.extend_from_slice(&[0, lun, 0, 0, 0, 0, 0, 0]);
                }
                result.truncate(allocation);
                Ok(ScsiCmdResult::DataIn(result))
            }
            Some(ScsiCommand::Reserve6) => {
                self.device_mut().reserve(ctx.initiator_id);
                Ok(ScsiCmdResult::Status(ScsiStatus::Good))
            }
            Some(ScsiCommand::Release6) => {
                self.device_mut().release();
                Ok(ScsiCmdResult::Status(ScsiStatus::Good))
            }
            Some(ScsiCommand::SendDiagnostic) => {
                // Page format and parameter lists are not supported
                if cdb[1] & 0x10 != 0 || cdb[3] != 0 || cdb[4] != 0 {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::InvalidFieldInCdb,
                    ));
                }
                Ok(ScsiCmdResult::Status(ScsiStatus::Good))
            }
            Some(
                op @ (ScsiCommand::ModeSense6
                | ScsiCommand::ModeSense10
                | ScsiCommand::ModeSelect6
                | ScsiCommand::ModeSelect10),
            ) => match self.mode_pages() {
                Some(pages) => pages.mode_command(op, ctx),
                None => Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::InvalidCommandOperationCode,
                )),
            },
            _ => self.specific_cmd(ctx),
        }
    }
}

impl core::fmt::Debug for dyn PrimaryDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let d = self.device();
        write!(f, "{} {}:{}", d.get_type(), d.get_id(), d.get_lun())
    }
}
