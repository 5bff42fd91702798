//! MODE SENSE/MODE SELECT support for devices with mode pages

use std::collections::BTreeMap;

use crate::scsi::device::CommandContext;
use crate::scsi::{Asc, ScsiCmdResult, ScsiCommand, ScsiError, ScsiResult, ScsiStatus, SenseKey};

/// Page code to page contents. Byte 0 and 1 of each page are filled in when
/// the response is assembled.
pub type ModePageMap = BTreeMap<u8, Vec<u8>>;

/// All pages wildcard
pub const PAGE_ALL: u8 = 0x3F;

/// Page control field requesting changeable values
const PC_CHANGEABLE: u8 = 0x40;

pub trait ModePageDevice {
    fn supports_save_parameters(&self) -> bool;

    /// Adds the requested page (or all pages for [`PAGE_ALL`]) to `pages`.
    /// With `changeable` set, pages carry the mask of changeable bits instead
    /// of the current values.
    fn set_up_mode_pages(&self, pages: &mut ModePageMap, page: u8, changeable: bool);

    /// Vendor specific pages
    fn add_vendor_page(&self, _pages: &mut ModePageMap, _page: u8, _changeable: bool) {}

    /// Complete MODE SENSE(6) response, truncated to the allocation length
    fn mode_sense6(&self, cdb: &[u8]) -> ScsiResult<Vec<u8>>;

    /// Complete MODE SENSE(10) response, truncated to the allocation length
    fn mode_sense10(&self, cdb: &[u8]) -> ScsiResult<Vec<u8>>;

    /// Serializes the requested pages into `buf` at `offset`. At most
    /// `max_length - offset` bytes are written, which may end mid-page.
    ///
    /// Returns `offset` plus the untruncated size of all pages, so the
    /// initiator can detect truncation.
    fn add_mode_pages(
        &self,
        cdb: &[u8],
        buf: &mut Vec<u8>,
        offset: usize,
        max_length: usize,
        max_size: usize,
    ) -> ScsiResult<usize> {
        let changeable = (cdb[2] & 0xC0) == PC_CHANGEABLE;
        let page = cdb[2] & 0x3F;

        let mut pages = ModePageMap::new();
        self.set_up_mode_pages(&mut pages, page, changeable);
        self.add_vendor_page(&mut pages, page, changeable);
        pages.retain(|_, data| data.len() >= 2);

        if pages.is_empty() {
            log::trace!("Unsupported mode page {:02X}", page);
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInCdb,
            ));
        }

        let mut result = Vec::with_capacity(pages.values().map(Vec::len).sum());
        // Page 0 goes last
        let ordered = pages
            .iter()
            .filter(|&(&code, _)| code != 0)
            .chain(pages.iter().filter(|&(&code, _)| code == 0));
        for (&code, data) in ordered {
            let start = result.len();
            result.extend_from_slice(data);
            // Page code, PS bit may already be set
            result[start] |= code;
            result[start + 1] = (data.len() - 2) as u8;
        }

        if result.len() > max_size {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::ParameterListLengthError,
            ));
        }

        let size = max_length.saturating_sub(offset).min(result.len());
        if buf.len() < offset + size {
            buf.resize(offset + size, 0);
        }
        buf[offset..offset + size].copy_from_slice(&result[..size]);

        Ok(offset + result.len())
    }

    /// Applies MODE SELECT parameter data. Devices that can save parameters
    /// validate the pages here.
    fn mode_select(
        &self,
        _command: ScsiCommand,
        _cdb: &[u8],
        _data: &[u8],
        _length: usize,
    ) -> ScsiResult<()> {
        if !self.supports_save_parameters() {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidCommandOperationCode,
            ));
        }
        Ok(())
    }

    /// Validates the SP bit, returns the parameter list length to receive
    fn save_parameters_check(&self, cdb: &[u8], length: usize) -> ScsiResult<usize> {
        if !self.supports_save_parameters() && cdb[1] & 0x01 != 0 {
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInCdb,
            ));
        }
        Ok(length)
    }

    fn mode_command(&self, command: ScsiCommand, ctx: &CommandContext) -> ScsiResult<ScsiCmdResult> {
        let cdb = ctx.cdb;
        match command {
            ScsiCommand::ModeSense6 => Ok(ScsiCmdResult::DataIn(self.mode_sense6(cdb)?)),
            ScsiCommand::ModeSense10 => Ok(ScsiCmdResult::DataIn(self.mode_sense10(cdb)?)),
            ScsiCommand::ModeSelect6 | ScsiCommand::ModeSelect10 => {
                if let Some(data) = ctx.outdata {
                    self.mode_select(command, cdb, data, data.len())?;
                    return Ok(ScsiCmdResult::Status(ScsiStatus::Good));
                }

                let length = if command == ScsiCommand::ModeSelect6 {
                    cdb[4] as usize
                } else {
                    u16::from_be_bytes([cdb[7], cdb[8]]) as usize
                };
                Ok(ScsiCmdResult::DataOut(self.save_parameters_check(cdb, length)?))
            }
            _ => Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidCommandOperationCode,
            )),
        }
    }
}
