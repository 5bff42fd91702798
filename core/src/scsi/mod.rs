//! SCSI controller, devices and associated code

pub mod controller;
pub mod device;
pub mod disk;
pub mod host_services;
pub mod manager;
pub mod mode_page;
#[cfg(test)]
pub mod testdevice;

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest command descriptor block
pub const MAX_CDB_LEN: usize = 16;

/// Length of a command descriptor block, derived from the group code of the
/// operation code
pub const fn scsi_cmd_len(opcode: u8) -> usize {
    match opcode >> 5 {
        0 => 6,
        1 | 2 => 10,
        4 => 16,
        5 => 12,
        // Reserved/vendor specific groups
        _ => 6,
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, FromPrimitive, ToPrimitive, strum::Display)]
/// Status byte sent in the status phase
pub enum ScsiStatus {
    Good = 0x00,
    CheckCondition = 0x02,
    ConditionMet = 0x04,
    Busy = 0x08,
    Intermediate = 0x10,
    IntermediateConditionMet = 0x14,
    ReservationConflict = 0x18,
    CommandTerminated = 0x22,
    QueueFull = 0x28,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, FromPrimitive, ToPrimitive, strum::Display)]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    BlankCheck = 0x08,
    VendorSpecific = 0x09,
    CopyAborted = 0x0A,
    AbortedCommand = 0x0B,
    Equal = 0x0C,
    VolumeOverflow = 0x0D,
    Miscompare = 0x0E,
    Reserved = 0x0F,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, FromPrimitive, ToPrimitive, strum::Display)]
/// Additional sense code
pub enum Asc {
    NoAdditionalSenseInformation = 0x00,
    WriteFault = 0x03,
    ReadFault = 0x11,
    ParameterListLengthError = 0x1A,
    MiscompareDuringVerify = 0x1D,
    InvalidCommandOperationCode = 0x20,
    LbaOutOfRange = 0x21,
    InvalidFieldInCdb = 0x24,
    InvalidLun = 0x25,
    InvalidFieldInParameterList = 0x26,
    WriteProtected = 0x27,
    NotReadyToReadyChange = 0x28,
    PowerOnOrReset = 0x29,
    MediumNotPresent = 0x3A,
    LoadOrEjectFailed = 0x53,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, FromPrimitive, ToPrimitive, strum::Display)]
/// Operation codes handled by the emulated devices
pub enum ScsiCommand {
    TestUnitReady = 0x00,
    Rezero = 0x01,
    RequestSense = 0x03,
    FormatUnit = 0x04,
    ReassignBlocks = 0x07,
    Read6 = 0x08,
    Write6 = 0x0A,
    Seek6 = 0x0B,
    Inquiry = 0x12,
    ModeSelect6 = 0x15,
    Reserve6 = 0x16,
    Release6 = 0x17,
    ModeSense6 = 0x1A,
    StartStop = 0x1B,
    SendDiagnostic = 0x1D,
    PreventAllow = 0x1E,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Seek10 = 0x2B,
    Verify10 = 0x2F,
    SynchronizeCache10 = 0x35,
    ModeSelect10 = 0x55,
    ModeSense10 = 0x5A,
    ReportLuns = 0xA0,
}

/// Failure of a device command, reported to the initiator as status and sense data
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
#[error("{sense_key} / {asc} ({status})")]
pub struct ScsiError {
    pub sense_key: SenseKey,
    pub asc: Asc,
    pub status: ScsiStatus,
}

impl ScsiError {
    /// CHECK CONDITION with the given sense data
    pub fn new(sense_key: SenseKey, asc: Asc) -> Self {
        Self {
            sense_key,
            asc,
            status: ScsiStatus::CheckCondition,
        }
    }

    pub fn with_status(self, status: ScsiStatus) -> Self {
        Self { status, ..self }
    }
}

pub type ScsiResult<T> = std::result::Result<T, ScsiError>;

/// Result of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScsiCmdResult {
    /// Immediately turn to the Status phase
    Status(ScsiStatus),
    /// Returns data to the initiator
    DataIn(Vec<u8>),
    /// Expects data written to target
    DataOut(usize),
}

/// What to do with the emulator once the bus is free again
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum::Display)]
pub enum ShutdownMode {
    /// Terminate the emulator process
    StopEmulator,
    /// Power off the host
    StopHost,
    /// Reboot the host
    RestartHost,
}

/// Events raised by a device during command execution
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScsiTargetEvent {
    Shutdown(ShutdownMode),
}

#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
/// Enumeration of supported emulated SCSI target types (devices)
pub enum ScsiTargetType {
    /// Hard disk
    #[strum(serialize = "SCHD")]
    #[serde(rename = "SCHD", alias = "schd")]
    Disk,
    /// Host services
    #[strum(serialize = "SCHS")]
    #[serde(rename = "SCHS", alias = "schs")]
    HostServices,
}
