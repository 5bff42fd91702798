//! SCSI target emulator core: bus abstraction, controllers and emulated
//! devices

pub mod bus;
pub mod config;
pub mod scsi;
