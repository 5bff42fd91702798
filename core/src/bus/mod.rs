//! SCSI bus abstraction
//!
//! ## Bus phases and transitions
//! ```mermaid
//! stateDiagram-v2
//!     [*] --> BusFree
//!
//!     BusFree --> Selection : SEL asserted, target asserts BSY
//!     Selection --> MessageOut : SEL released, ATN asserted
//!     Selection --> Command : SEL released
//!     MessageOut --> Command : ATN released
//!     Command --> DataIn : I/O asserted
//!     Command --> DataOut : C/D, I/O released
//!     Command --> Status : C/D, I/O asserted
//!     DataIn --> Status
//!     DataOut --> Status
//!     Status --> MessageIn : MSG asserted
//!     MessageIn --> BusFree : Release BSY (End of Command)
//!
//!     StateChange --> BusFree: Reset (Release all signals)
//! ```

pub mod factory;
#[cfg(test)]
pub mod testbus;
pub mod virtualbus;

use std::time::Duration;

use anyhow::Result;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr, strum::Display, Serialize, Deserialize)]
/// SCSI bus phases
pub enum BusPhase {
    BusFree,
    Arbitration,
    Selection,
    Reselection,
    Command,
    /// Target -> Initiator
    DataIn,
    /// Initiator -> Target
    DataOut,
    Status,
    MsgIn,
    MsgOut,
    /// Not yet determined, before the first bus cycle and after a reset
    Reserved,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display)]
/// Role the emulator plays on the bus
pub enum BusMode {
    #[default]
    Target,
    Initiator,
}

bitfield! {
    /// Snapshot of all SCSI bus lines
    #[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BusSignals(pub u32): Debug, FromStorage, IntoStorage, DerefStorage {
        /// MSG, C/D, I/O, phase information bits
        pub phase_bits: u8 @ 6..=8,

        pub bsy: bool @ 0,
        pub sel: bool @ 1,
        pub atn: bool @ 2,
        pub ack: bool @ 3,
        pub rst: bool @ 4,
        pub req: bool @ 5,
        pub io: bool @ 6,
        pub cd: bool @ 7,
        pub msg: bool @ 8,

        /// Data bus
        pub dat: u8 @ 16..=23,
    }
}

impl BusSignals {
    /// Decodes the current bus phase from the line state
    pub fn phase(&self) -> BusPhase {
        if self.sel() {
            return BusPhase::Selection;
        }
        if !self.bsy() {
            return BusPhase::BusFree;
        }

        // Indexed by MSG, C/D, I/O
        match self.phase_bits() {
            0b000 => BusPhase::DataOut,
            0b001 => BusPhase::DataIn,
            0b010 => BusPhase::Command,
            0b011 => BusPhase::Status,
            0b110 => BusPhase::MsgOut,
            0b111 => BusPhase::MsgIn,
            _ => BusPhase::Reserved,
        }
    }
}

/// The bus as seen by a controller.
///
/// All line state is interior-mutable so a single bus can be shared by
/// reference between all controllers. Only one controller drives the bus at a
/// time, which is guaranteed by BSY arbitration on the bus itself rather than
/// by a lock.
pub trait ScsiBus {
    /// Prepares the bus for operation in the given role
    fn init(&self, mode: BusMode) -> Result<()>;

    /// Releases all lines
    fn reset(&self);

    /// Latches a fresh snapshot of all lines, which the getters report from
    fn acquire(&self) -> BusSignals;

    fn get_bsy(&self) -> bool;
    fn set_bsy(&self, val: bool);
    fn get_sel(&self) -> bool;
    fn set_sel(&self, val: bool);
    fn get_atn(&self) -> bool;
    fn set_atn(&self, val: bool);
    fn get_ack(&self) -> bool;
    fn set_ack(&self, val: bool);
    fn get_rst(&self) -> bool;
    fn set_rst(&self, val: bool);
    fn get_msg(&self) -> bool;
    fn set_msg(&self, val: bool);
    fn get_cd(&self) -> bool;
    fn set_cd(&self, val: bool);
    fn get_io(&self) -> bool;
    fn set_io(&self, val: bool);
    fn get_req(&self) -> bool;
    fn set_req(&self, val: bool);
    fn get_dat(&self) -> u8;
    fn set_dat(&self, val: u8);

    /// Receives a command descriptor block. Blocks until the initiator has
    /// sent all bytes for the opcode or aborts. Returns the number of bytes received.
    fn command_handshake(&self, buf: &mut [u8]) -> usize;

    /// Sends bytes to the initiator, returns the number of bytes sent
    fn send_handshake(&self, buf: &[u8]) -> usize;

    /// Receives bytes from the initiator, returns the number of bytes received
    fn receive_handshake(&self, buf: &mut [u8]) -> usize;

    /// Waits up to `timeout` for a selection, returns true if SEL is asserted
    fn poll_select_event(&self, timeout: Duration) -> bool;
}

impl core::fmt::Debug for dyn ScsiBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ScsiBus")
    }
}
