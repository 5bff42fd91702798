use std::cell::Cell;

use crate::scsi::device::{CommandContext, Device, PrimaryDevice};
use crate::scsi::mode_page::{ModePageDevice, ModePageMap, PAGE_ALL};
use crate::scsi::{
    Asc, ScsiCmdResult, ScsiError, ScsiResult, ScsiStatus, ScsiTargetEvent, ScsiTargetType,
    SenseKey, ShutdownMode,
};

/// Vendor command: expects cdb[4] bytes of data out
pub const CMD_WRITE_DATA: u8 = 0xC0;
/// Vendor command: raises a shutdown event
pub const CMD_SHUTDOWN: u8 = 0xC1;
/// Vendor command: returns cdb[4] bytes of data in
pub const CMD_READ_DATA: u8 = 0xC2;

/// Device for unit tests with scriptable mode pages and a few vendor commands
pub struct TestDevice {
    device: Device,
    pub pages: ModePageMap,
    pub vendor_pages: ModePageMap,
    pub save: bool,
    pub last_changeable: Cell<Option<bool>>,
    pub received: Vec<Vec<u8>>,
    event: Option<ScsiTargetEvent>,
}

impl TestDevice {
    pub fn new(lun: u8) -> Self {
        let mut device = Device::new(ScsiTargetType::Disk, 0, lun);
        device.set_ready(true);
        Self {
            device,
            pages: ModePageMap::new(),
            vendor_pages: ModePageMap::new(),
            save: false,
            last_changeable: Cell::new(None),
            received: vec![],
            event: None,
        }
    }

    fn copy_pages(src: &ModePageMap, pages: &mut ModePageMap, page: u8) {
        for (&code, data) in src {
            if page == PAGE_ALL || page == code {
                pages.insert(code, data.clone());
            }
        }
    }
}

impl PrimaryDevice for TestDevice {
    fn device(&self) -> &Device {
        &self.device
    }

    fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    fn inquiry(&self) -> Vec<u8> {
        self.device.inquiry_data(0x00, 2, false)
    }

    fn mode_pages(&self) -> Option<&dyn ModePageDevice> {
        Some(self)
    }

    fn specific_cmd(&mut self, ctx: &CommandContext) -> ScsiResult<ScsiCmdResult> {
        match ctx.cdb[0] {
            CMD_WRITE_DATA => match ctx.outdata {
                None => Ok(ScsiCmdResult::DataOut(ctx.cdb[4] as usize)),
                Some(data) => {
                    self.received.push(data.to_vec());
                    Ok(ScsiCmdResult::Status(ScsiStatus::Good))
                }
            },
            CMD_SHUTDOWN => {
                self.event = Some(ScsiTargetEvent::Shutdown(ShutdownMode::StopEmulator));
                Ok(ScsiCmdResult::Status(ScsiStatus::Good))
            }
            CMD_READ_DATA => Ok(ScsiCmdResult::DataIn(vec![0xAA; ctx.cdb[4] as usize])),
            _ => Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidCommandOperationCode,
            )),
        }
    }

    fn take_event(&mut self) -> Option<ScsiTargetEvent> {
        self.event.take()
    }
}

impl ModePageDevice for TestDevice {
    fn supports_save_parameters(&self) -> bool {
        self.save
    }

    fn set_up_mode_pages(&self, pages: &mut ModePageMap, page: u8, changeable: bool) {
        self.last_changeable.set(Some(changeable));
        Self::copy_pages(&self.pages, pages, page);
    }

    fn add_vendor_page(&self, pages: &mut ModePageMap, page: u8, _changeable: bool) {
        Self::copy_pages(&self.vendor_pages, pages, page);
    }

    fn mode_sense6(&self, cdb: &[u8]) -> ScsiResult<Vec<u8>> {
        let length = cdb[4] as usize;
        let mut buf = vec![0; 4];
        let size = self.add_mode_pages(cdb, &mut buf, 4, length, 255)?;
        buf[0] = (size - 1) as u8;
        buf.truncate(length);
        Ok(buf)
    }

    fn mode_sense10(&self, cdb: &[u8]) -> ScsiResult<Vec<u8>> {
        let length = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
        let mut buf = vec![0; 8];
        let size = self.add_mode_pages(cdb, &mut buf, 8, length, 65535)?;
        buf[0..2].copy_from_slice(&((size - 2) as u16).to_be_bytes());
        buf.truncate(length);
        Ok(buf)
    }
}
