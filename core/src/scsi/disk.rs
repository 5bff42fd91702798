//! SCSI hard disk drive (block device)

use anyhow::{Context, Result, bail};
#[cfg(feature = "mmap")]
use memmap2::MmapMut;
use num_traits::FromPrimitive;
use std::path::{Path, PathBuf};

use crate::scsi::device::{CommandContext, Device, PrimaryDevice};
use crate::scsi::mode_page::{ModePageDevice, ModePageMap, PAGE_ALL};
use crate::scsi::{
    Asc, ScsiCmdResult, ScsiCommand, ScsiError, ScsiResult, ScsiStatus, ScsiTargetType, SenseKey,
};

pub const DISK_BLOCKSIZE: usize = 512;

/// Supported logical block sizes
pub const BLOCK_SIZES: [usize; 4] = [512, 1024, 2048, 4096];

const PRODUCT: &str = "SCSI HD";

/// Vendor page 0x30 contents, required by Apple's HD SC Setup
const APPLE_DATA: &[u8] = b"APPLE COMPUTER, INC   ";

pub struct ScsiTargetDisk {
    device: Device,

    /// Disk contents
    #[cfg(feature = "mmap")]
    disk: MmapMut,

    #[cfg(not(feature = "mmap"))]
    disk: Vec<u8>,

    /// Path where the image resides, None for images held in memory only
    path: Option<PathBuf>,

    blocksize: usize,

    /// Written since the last flush
    dirty: bool,
}

impl ScsiTargetDisk {
    fn new(id: u8, lun: u8, blocksize: usize) -> Result<Device> {
        if !BLOCK_SIZES.contains(&blocksize) {
            bail!("Invalid block size {}", blocksize);
        }
        let mut device = Device::new(ScsiTargetType::Disk, id, lun);
        device.set_product(PRODUCT)?;
        device.set_protectable(true);
        device.set_stoppable(true);
        device.set_ready(true);
        Ok(device)
    }

    fn check_image_size(len: usize, blocksize: usize, name: &str) -> Result<()> {
        if len == 0 {
            bail!("Cannot load disk image {}: empty", name);
        }
        if !len.is_multiple_of(blocksize) {
            bail!(
                "Cannot load disk image {}: not multiple of {}",
                name,
                blocksize
            );
        }
        Ok(())
    }

    /// Try to load a disk image, given the filename of the image.
    ///
    /// This locks the file on disk and memory maps the file for use by
    /// the emulator for fast access and automatic writes back to disk,
    /// at the discretion of the operating system.
    #[cfg(feature = "mmap")]
    pub fn load_disk(id: u8, lun: u8, filename: &Path, blocksize: usize) -> Result<Self> {
        let device = Self::new(id, lun, blocksize)?;
        let disk = Self::mmap_file(filename, blocksize)?;

        Ok(Self {
            device,
            disk,
            path: Some(filename.to_path_buf()),
            blocksize,
            dirty: false,
        })
    }

    #[cfg(not(feature = "mmap"))]
    pub fn load_disk(id: u8, lun: u8, filename: &Path, blocksize: usize) -> Result<Self> {
        use std::fs;

        let device = Self::new(id, lun, blocksize)?;
        if !Path::new(filename).exists() {
            bail!("File not found: {}", filename.display());
        }

        let disk = fs::read(filename)
            .with_context(|| format!("Failed to open file {}", filename.display()))?;
        Self::check_image_size(disk.len(), blocksize, &filename.display().to_string())?;

        Ok(Self {
            device,
            disk,
            path: Some(filename.to_path_buf()),
            blocksize,
            dirty: false,
        })
    }

    /// Creates a disk backed by memory only
    pub fn from_image(id: u8, lun: u8, image: Vec<u8>, blocksize: usize) -> Result<Self> {
        let device = Self::new(id, lun, blocksize)?;
        Self::check_image_size(image.len(), blocksize, "<memory>")?;

        #[cfg(feature = "mmap")]
        let disk = {
            let mut disk =
                MmapMut::map_anon(image.len()).context("Failed to allocate disk image")?;
            disk.copy_from_slice(&image);
            disk
        };
        #[cfg(not(feature = "mmap"))]
        let disk = image;

        Ok(Self {
            device,
            disk,
            path: None,
            blocksize,
            dirty: false,
        })
    }

    #[cfg(feature = "mmap")]
    fn mmap_file(filename: &Path, blocksize: usize) -> Result<MmapMut> {
        use fs2::FileExt;
        use std::{
            fs::OpenOptions,
            io::{Seek, SeekFrom},
        };
        if !Path::new(filename).exists() {
            bail!("File not found: {}", filename.display());
        }
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(filename)
            .with_context(|| format!("Failed to open {}", filename.display()))?;
        let file_size = f.seek(SeekFrom::End(0))? as usize;
        f.seek(SeekFrom::Start(0))?;
        Self::check_image_size(file_size, blocksize, &filename.display().to_string())?;
        f.try_lock_exclusive()
            .with_context(|| format!("Failed to lock {}", filename.display()))?;
        let mmapped = unsafe {
            use memmap2::MmapOptions;

            MmapOptions::new()
                .len(file_size)
                .map_mut(&f)
                .with_context(|| format!("Failed to mmap file {}", filename.display()))?
        };
        Ok(mmapped)
    }

    pub fn media(&self) -> &[u8] {
        &self.disk
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn blocks(&self) -> usize {
        self.disk.len() / self.blocksize
    }

    /// Start block and block count of a READ/WRITE/VERIFY command
    fn lba_and_count(command: ScsiCommand, cdb: &[u8]) -> (usize, usize) {
        match command {
            ScsiCommand::Read6 | ScsiCommand::Write6 => {
                let lba = u32::from_be_bytes([0, cdb[1] & 0x1F, cdb[2], cdb[3]]) as usize;
                // 0 means 256 blocks
                let count = if cdb[4] == 0 { 256 } else { cdb[4] as usize };
                (lba, count)
            }
            _ => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
                let count = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
                (lba, count)
            }
        }
    }

    fn check_range(&self, lba: usize, count: usize) -> ScsiResult<()> {
        if lba.checked_add(count).is_none_or(|end| end > self.blocks()) {
            log::warn!(
                "Access beyond end of disk: block {} count {} (disk has {} blocks)",
                lba,
                count,
                self.blocks()
            );
            return Err(ScsiError::new(SenseKey::IllegalRequest, Asc::LbaOutOfRange));
        }
        Ok(())
    }

    fn check_writable(&self) -> ScsiResult<()> {
        if self.device.is_protected() {
            return Err(ScsiError::new(SenseKey::DataProtect, Asc::WriteProtected));
        }
        Ok(())
    }

    fn read(&self, lba: usize, count: usize) -> Vec<u8> {
        self.disk[(lba * self.blocksize)..((lba + count) * self.blocksize)].to_vec()
    }

    fn write(&mut self, lba: usize, data: &[u8]) {
        let offset = lba * self.blocksize;
        self.disk[offset..(offset + data.len())].copy_from_slice(data);
        self.dirty = true;
    }

    fn read_cmd(&mut self, command: ScsiCommand, cdb: &[u8]) -> ScsiResult<ScsiCmdResult> {
        self.device.check_ready()?;
        let (lba, count) = Self::lba_and_count(command, cdb);
        self.check_range(lba, count)?;
        if count == 0 {
            return Ok(ScsiCmdResult::Status(ScsiStatus::Good));
        }
        log::trace!("Read block {} count {}", lba, count);
        Ok(ScsiCmdResult::DataIn(self.read(lba, count)))
    }

    fn write_cmd(
        &mut self,
        command: ScsiCommand,
        cdb: &[u8],
        outdata: Option<&[u8]>,
    ) -> ScsiResult<ScsiCmdResult> {
        self.device.check_ready()?;
        self.check_writable()?;
        let (lba, count) = Self::lba_and_count(command, cdb);
        self.check_range(lba, count)?;
        if count == 0 {
            return Ok(ScsiCmdResult::Status(ScsiStatus::Good));
        }

        let Some(data) = outdata else {
            return Ok(ScsiCmdResult::DataOut(count * self.blocksize));
        };
        log::trace!("Write block {} count {}", lba, count);
        self.write(lba, data);
        Ok(ScsiCmdResult::Status(ScsiStatus::Good))
    }

    fn verify_cmd(&mut self, cdb: &[u8], outdata: Option<&[u8]>) -> ScsiResult<ScsiCmdResult> {
        self.device.check_ready()?;
        let (lba, count) = Self::lba_and_count(ScsiCommand::Verify10, cdb);
        self.check_range(lba, count)?;

        // BYTCHK: compare against data sent by the initiator
        if cdb[1] & 0x02 == 0 || count == 0 {
            return Ok(ScsiCmdResult::Status(ScsiStatus::Good));
        }
        let Some(data) = outdata else {
            return Ok(ScsiCmdResult::DataOut(count * self.blocksize));
        };
        if self.read(lba, count) != data {
            return Err(ScsiError::new(
                SenseKey::Miscompare,
                Asc::MiscompareDuringVerify,
            ));
        }
        Ok(ScsiCmdResult::Status(ScsiStatus::Good))
    }

    fn read_capacity(&mut self) -> ScsiResult<ScsiCmdResult> {
        self.device.check_ready()?;
        let last = u32::try_from(self.blocks() - 1).unwrap_or(u32::MAX);

        let mut result = vec![0; 8];
        result[0..4].copy_from_slice(&last.to_be_bytes());
        result[4..8].copy_from_slice(&(self.blocksize as u32).to_be_bytes());
        Ok(ScsiCmdResult::DataIn(result))
    }

    fn start_stop(&mut self, cdb: &[u8]) -> ScsiResult<ScsiCmdResult> {
        let start = cdb[4] & 0x01 != 0;
        let load = cdb[4] & 0x02 != 0;

        if !start {
            if load {
                // Eject
                if self.device.is_locked() || !self.device.is_removable() {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::LoadOrEjectFailed,
                    ));
                }
                self.device.set_ready(false);
            } else {
                self.flush_cache()?;
            }
        }

        if self.device.is_stoppable() {
            self.device.set_stopped(!start);
        }
        Ok(ScsiCmdResult::Status(ScsiStatus::Good))
    }

    fn flush_cache(&mut self) -> ScsiResult<()> {
        self.flush().map_err(|e| {
            log::error!("Flushing disk image failed: {:#}", e);
            ScsiError::new(SenseKey::MediumError, Asc::WriteFault)
        })
    }

    fn add_error_page(pages: &mut ModePageMap, changeable: bool) {
        let mut buf = vec![0; 12];
        if !changeable {
            // DCR, DTE
            buf[2] = 0b1100_0000;
            // Read retry count
            buf[3] = 8;
        }
        pages.insert(0x01, buf);
    }

    fn add_format_page(&self, pages: &mut ModePageMap, changeable: bool) {
        let mut buf = vec![0; 24];

        // Sector size is reported changeable, MODE SELECT accepts the current one
        if changeable {
            buf[12..14].copy_from_slice(&(self.blocksize as u16).to_be_bytes());
            pages.insert(0x03, buf);
            return;
        }

        if self.device.is_ready() {
            // Tracks per zone
            buf[3] = 0x08;
            // Sectors per track
            buf[10..12].copy_from_slice(&25u16.to_be_bytes());
            // Bytes per physical sector
            buf[12..14].copy_from_slice(&(self.blocksize as u16).to_be_bytes());
            // Interleave
            buf[14..16].copy_from_slice(&1u16.to_be_bytes());
            // Track skew factor
            buf[16..18].copy_from_slice(&11u16.to_be_bytes());
            // Cylinder skew factor
            buf[18..20].copy_from_slice(&20u16.to_be_bytes());
        }

        // Hard sectored
        buf[20] = 0x40;
        if self.device.is_removable() {
            buf[20] |= 0x20;
        }
        pages.insert(0x03, buf);
    }

    fn add_drive_page(&self, pages: &mut ModePageMap, changeable: bool) {
        let mut buf = vec![0; 24];

        if !changeable && self.device.is_ready() {
            // 8 heads, 25 sectors per track
            let cylinders = ((self.blocks() >> 3) / 25) as u32;
            buf[2..5].copy_from_slice(&cylinders.to_be_bytes()[1..4]);
            buf[5] = 8;
            // Rotation rate
            buf[20..22].copy_from_slice(&7200u16.to_be_bytes());
        }
        pages.insert(0x04, buf);
    }

    fn add_cache_page(pages: &mut ModePageMap, changeable: bool) {
        let mut buf = vec![0; 12];

        if !changeable {
            // Disable pre-fetch transfer length
            buf[4..6].copy_from_slice(&0xFFFFu16.to_be_bytes());
            // Maximum pre-fetch
            buf[8..10].copy_from_slice(&0xFFFFu16.to_be_bytes());
            // Maximum pre-fetch ceiling
            buf[10..12].copy_from_slice(&0xFFFFu16.to_be_bytes());
        }
        pages.insert(0x08, buf);
    }

    /// Block length from the block descriptor of MODE SELECT parameter data
    fn check_block_descriptor(&self, descriptor: &[u8], long_lba: bool) -> ScsiResult<()> {
        let length = if long_lba {
            if descriptor.len() < 16 {
                return Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::ParameterListLengthError,
                ));
            }
            u32::from_be_bytes([descriptor[12], descriptor[13], descriptor[14], descriptor[15]])
        } else {
            if descriptor.len() < 8 {
                return Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::ParameterListLengthError,
                ));
            }
            u32::from_be_bytes([0, descriptor[5], descriptor[6], descriptor[7]])
        };

        if length as usize != self.blocksize {
            log::warn!(
                "MODE SELECT block length {} does not match {}, use the block size setting to change it",
                length,
                self.blocksize
            );
            return Err(ScsiError::new(
                SenseKey::IllegalRequest,
                Asc::InvalidFieldInParameterList,
            ));
        }
        Ok(())
    }
}

impl PrimaryDevice for ScsiTargetDisk {
    fn device(&self) -> &Device {
        &self.device
    }

    fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    fn inquiry(&self) -> Vec<u8> {
        self.device
            .inquiry_data(0x00, 2, self.device.is_removable())
    }

    fn mode_pages(&self) -> Option<&dyn ModePageDevice> {
        Some(self)
    }

    fn specific_cmd(&mut self, ctx: &CommandContext) -> ScsiResult<ScsiCmdResult> {
        let cdb = ctx.cdb;
        match ScsiCommand::from_u8(cdb[0]) {
            Some(ScsiCommand::Rezero | ScsiCommand::Seek6 | ScsiCommand::Seek10) => {
                self.device.check_ready()?;
                Ok(ScsiCmdResult::Status(ScsiStatus::Good))
            }
            Some(ScsiCommand::FormatUnit) => {
                self.device.check_ready()?;
                // FMTDATA with a defect list is not supported
                if cdb[1] & 0x10 != 0 && cdb[4] != 0 {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::InvalidFieldInCdb,
                    ));
                }
                Ok(ScsiCmdResult::Status(ScsiStatus::Good))
            }
            Some(ScsiCommand::ReassignBlocks) => {
                self.device.check_ready()?;
                Ok(ScsiCmdResult::Status(ScsiStatus::Good))
            }
            Some(cmd @ (ScsiCommand::Read6 | ScsiCommand::Read10)) => self.read_cmd(cmd, cdb),
            Some(cmd @ (ScsiCommand::Write6 | ScsiCommand::Write10)) => {
                self.write_cmd(cmd, cdb, ctx.outdata)
            }
            Some(ScsiCommand::Verify10) => self.verify_cmd(cdb, ctx.outdata),
            Some(ScsiCommand::ReadCapacity10) => self.read_capacity(),
            Some(ScsiCommand::SynchronizeCache10) => {
                self.device.check_ready()?;
                self.flush_cache()?;
                Ok(ScsiCmdResult::Status(ScsiStatus::Good))
            }
            Some(ScsiCommand::StartStop) => self.start_stop(cdb),
            Some(ScsiCommand::PreventAllow) => {
                self.device.check_ready()?;
                if self.device.is_lockable() {
                    self.device.set_locked(cdb[4] & 0x01 != 0);
                }
                Ok(ScsiCmdResult::Status(ScsiStatus::Good))
            }
            _ => {
                log::warn!("Unsupported disk command {:02X}", cdb[0]);
                Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::InvalidCommandOperationCode,
                ))
            }
        }
    }

    #[cfg(feature = "mmap")]
    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.disk.flush().context("Failed to flush disk image")?;
            self.dirty = false;
        }
        Ok(())
    }

    #[cfg(not(feature = "mmap"))]
    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            std::fs::write(path, &self.disk)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        self.dirty = false;
        Ok(())
    }
}

impl ModePageDevice for ScsiTargetDisk {
    fn supports_save_parameters(&self) -> bool {
        true
    }

    fn set_up_mode_pages(&self, pages: &mut ModePageMap, page: u8, changeable: bool) {
        if page == 0x01 || page == PAGE_ALL {
            Self::add_error_page(pages, changeable);
        }
        if page == 0x03 || page == PAGE_ALL {
            self.add_format_page(pages, changeable);
        }
        if page == 0x04 || page == PAGE_ALL {
            self.add_drive_page(pages, changeable);
        }
        if page == 0x08 || page == PAGE_ALL {
            Self::add_cache_page(pages, changeable);
        }
    }

    fn add_vendor_page(&self, pages: &mut ModePageMap, page: u8, changeable: bool) {
        if page != 0x30 && page != PAGE_ALL {
            return;
        }
        let mut buf = vec![0; 30];
        if !changeable {
            let len = APPLE_DATA.len().min(buf.len() - 0x0A);
            buf[0x0A..0x0A + len].copy_from_slice(&APPLE_DATA[..len]);
        }
        pages.insert(0x30, buf);
    }

    fn mode_sense6(&self, cdb: &[u8]) -> ScsiResult<Vec<u8>> {
        let length = cdb[4] as usize;
        let mut buf = vec![0; 4];

        // Device specific parameter
        if self.device.is_protected() {
            buf[2] = 0x80;
        }

        // Block descriptor unless DBD is set
        if cdb[1] & 0x08 == 0 && self.device.is_ready() {
            buf[3] = 8;
            let blocks = self.blocks().min(0xFF_FFFF) as u32;
            buf.extend_from_slice(&blocks.to_be_bytes());
            buf.extend_from_slice(&(self.blocksize as u32).to_be_bytes());
        }

        let offset = buf.len();
        let size = self.add_mode_pages(cdb, &mut buf, offset, length, 255)?;
        buf[0] = (size - 1) as u8;
        buf.truncate(length);
        Ok(buf)
    }

    fn mode_sense10(&self, cdb: &[u8]) -> ScsiResult<Vec<u8>> {
        let length = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
        let mut buf = vec![0; 8];

        if self.device.is_protected() {
            buf[3] = 0x80;
        }

        if cdb[1] & 0x08 == 0 && self.device.is_ready() {
            // LLBAA
            if cdb[1] & 0x10 != 0 {
                // LONGLBA
                buf[4] = 0x01;
                buf[7] = 16;
                buf.extend_from_slice(&(self.blocks() as u64).to_be_bytes());
                buf.extend_from_slice(&[0; 4]);
                buf.extend_from_slice(&(self.blocksize as u32).to_be_bytes());
            } else {
                buf[7] = 8;
                let blocks = u32::try_from(self.blocks()).unwrap_or(u32::MAX);
                buf.extend_from_slice(&blocks.to_be_bytes());
                buf.extend_from_slice(&(self.blocksize as u32).to_be_bytes());
            }
        }

        let offset = buf.len();
        let size = self.add_mode_pages(cdb, &mut buf, offset, length, 65535)?;
        buf[0..2].copy_from_slice(&((size - 2) as u16).to_be_bytes());
        buf.truncate(length);
        Ok(buf)
    }

    fn mode_select(
        &self,
        command: ScsiCommand,
        cdb: &[u8],
        data: &[u8],
        length: usize,
    ) -> ScsiResult<()> {
        let data = &data[..length.min(data.len())];

        // Vendor specific (SCSI-1) parameters are ignored, HD SC Setup sends these
        if cdb[1] & 0x10 == 0 {
            return Ok(());
        }

        let (header_len, descriptor_len, long_lba) = match command {
            ScsiCommand::ModeSelect10 => {
                if data.len() < 8 {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::ParameterListLengthError,
                    ));
                }
                (
                    8,
                    u16::from_be_bytes([data[6], data[7]]) as usize,
                    data[4] & 0x01 != 0,
                )
            }
            _ => {
                if data.len() < 4 {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::ParameterListLengthError,
                    ));
                }
                (4, data[3] as usize, false)
            }
        };

        let mut offset = header_len;
        if descriptor_len > 0 {
            let end = (offset + descriptor_len).min(data.len());
            self.check_block_descriptor(&data[offset..end], long_lba)?;
            offset += descriptor_len;
        }

        while offset < data.len() {
            if offset + 2 > data.len() {
                return Err(ScsiError::new(
                    SenseKey::IllegalRequest,
                    Asc::ParameterListLengthError,
                ));
            }
            let page = data[offset] & 0x3F;
            let size = data[offset + 1] as usize + 2;

            if page == 0x03 {
                // Format device page, the sector size must not change
                if size < 14 || offset + 14 > data.len() {
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::ParameterListLengthError,
                    ));
                }
                let sector_size =
                    u16::from_be_bytes([data[offset + 12], data[offset + 13]]) as usize;
                if sector_size != self.blocksize {
                    log::warn!(
                        "MODE SELECT sector size {} does not match {}, use the block size setting to change it",
                        sector_size,
                        self.blocksize
                    );
                    return Err(ScsiError::new(
                        SenseKey::IllegalRequest,
                        Asc::InvalidFieldInParameterList,
                    ));
                }
            } else {
                log::warn!("Unknown MODE SELECT page code {:02X}", page);
            }

            offset += size;
        }
        Ok(())
    }
}
