//! Host services pseudo device
//!
//! Lets the initiator shut down the emulator or the host it runs on, and
//! provides the host's real time clock as a vendor mode page.

use anyhow::Result;
use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use num_traits::FromPrimitive;

use crate::scsi::device::{CommandContext, Device, PrimaryDevice};
use crate::scsi::mode_page::{ModePageDevice, ModePageMap, PAGE_ALL};
use crate::scsi::{
    Asc, ScsiCmdResult, ScsiCommand, ScsiError, ScsiResult, ScsiStatus, ScsiTargetEvent,
    ScsiTargetType, SenseKey, ShutdownMode,
};

const PRODUCT: &str = "Host Services";

/// Real time clock page
const PAGE_REALTIME_CLOCK: u8 = 0x20;

pub struct HostServices {
    device: Device,
    event: Option<ScsiTargetEvent>,
}

impl HostServices {
    pub fn new(id: u8, lun: u8) -> Result<Self> {
        let mut device = Device::new(ScsiTargetType::HostServices, id, lun);
        device.set_ready(true);
        device.set_product(PRODUCT)?;
        Ok(Self {
            device,
            event: None,
        })
    }

    fn start_stop(&mut self, cdb: &[u8]) -> ScsiResult<ScsiCmdResult> {
        let start = cdb[4] & 0x01 != 0;
        let load = cdb[4] & 0x02 != 0;

        let mode = match (start, load) {
            (false, false) => ShutdownMode::StopEmulator,
            (false, true) => ShutdownMode::StopHost,
            (true, true) => ShutdownMode::RestartHost,
            (true, false) => {
                return Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::InvalidFieldInCdb,
                ));
            }
        };
        log::info!("Shutdown requested: {}", mode);
        self.event = Some(ScsiTargetEvent::Shutdown(mode));
        Ok(ScsiCmdResult::Status(ScsiStatus::Good))
    }

    /// Real time clock page: version 1.0 followed by the date and time
    fn realtime_clock_page(now: &NaiveDateTime) -> Vec<u8> {
        let mut buf = vec![0; 10];
        buf[2] = 0x01;
        buf[3] = 0x00;
        buf[4] = (now.year() - 1900) as u8;
        buf[5] = now.month0() as u8;
        buf[6] = now.day() as u8;
        buf[7] = now.hour() as u8;
        buf[8] = now.minute() as u8;
        // No leap seconds
        buf[9] = now.second().min(59) as u8;
        buf
    }

    fn check_dbd(cdb: &[u8]) -> ScsiResult<()> {
        // Block descriptors cannot be returned
        if cdb[1] & 0x08 == 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInCdb,
            ));
        }
        Ok(())
    }
}

impl PrimaryDevice for HostServices {
    fn device(&self) -> &Device {
        &self.device
    }

    fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    fn inquiry(&self) -> Vec<u8> {
        // Processor device
        self.device.inquiry_data(0x03, 2, false)
    }

    fn mode_pages(&self) -> Option<&dyn ModePageDevice> {
        Some(self)
    }

    fn specific_cmd(&mut self, ctx: &CommandContext) -> ScsiResult<ScsiCmdResult> {
        match ScsiCommand::from_u8(ctx.cdb[0]) {
            Some(ScsiCommand::StartStop) => self.start_stop(ctx.cdb),
            _ => {
                log::warn!("Unsupported host services command {:02X}", ctx.cdb[0]);
                Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::InvalidCommandOperationCode,
                ))
            }
        }
    }

    fn take_event(&mut self) -> Option<ScsiTargetEvent> {
        self.event.take()
    }
}

impl ModePageDevice for HostServices {
    fn supports_save_parameters(&self) -> bool {
        false
    }

    fn set_up_mode_pages(&self, pages: &mut ModePageMap, page: u8, changeable: bool) {
        if page != PAGE_REALTIME_CLOCK && page != PAGE_ALL {
            return;
        }
        let buf = if changeable {
            vec![0; 10]
        } else {
            Self::realtime_clock_page(&Local::now().naive_local())
        };
        pages.insert(PAGE_REALTIME_CLOCK, buf);
    }

    fn mode_sense6(&self, cdb: &[u8]) -> ScsiResult<Vec<u8>> {
        Self::check_dbd(cdb)?;
        let length = cdb[4] as usize;
        let mut buf = vec![0; 4];
        let size = self.add_mode_pages(cdb, &mut buf, 4, length, 255)?;
        buf[0] = (size - 1) as u8;
        buf.truncate(length);
        Ok(buf)
    }

    fn mode_sense10(&self, cdb: &[u8]) -> ScsiResult<Vec<u8>> {
        Self::check_dbd(cdb)?;
        let length = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
        let mut buf = vec![0; 8];
        let size = self.add_mode_pages(cdb, &mut buf, 8, length, 65535)?;
        buf[0..2].copy_from_slice(&((size - 2) as u16).to_be_bytes());
        buf.truncate(length);
        Ok(buf)
    }
}
