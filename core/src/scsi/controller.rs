//! SCSI target controller: the bus phase state machine of one target ID
//!
//! The status, data and message phase handlers work in two steps. If the
//! controller is not in the phase yet, the handler enters it by driving MSG,
//! C/D and I/O. Once in the phase, the next call performs the transfer of that
//! phase and moves on. The command phase is entered, receives the CDB and
//! dispatches it in a single call.
//!
//! ```mermaid
//! stateDiagram-v2
//!     [*] --> BusFree
//!     BusFree --> Selection : SEL, own ID on DAT, BSY asserted
//!     Selection --> MsgOut : SEL released, ATN
//!     Selection --> Command : SEL released
//!     MsgOut --> Command : ATN released
//!     MsgOut --> MsgIn : extended message (reject)
//!     MsgOut --> BusFree : ABORT, BUS DEVICE RESET
//!     MsgIn --> Command : reply to message out
//!     Command --> DataIn
//!     Command --> DataOut
//!     Command --> Status
//!     DataIn --> Status
//!     DataOut --> Status
//!     Status --> MsgIn : COMMAND COMPLETE
//!     MsgIn --> BusFree
//! ```

use std::collections::BTreeMap;
use std::rc::Rc;

use arrayvec::ArrayVec;
use log::*;
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;

use crate::bus::{BusPhase, ScsiBus};
use crate::scsi::device::{CommandContext, PrimaryDevice};
use crate::scsi::manager::MAX_TARGETS;
use crate::scsi::{
    Asc, MAX_CDB_LEN, ScsiCmdResult, ScsiCommand, ScsiError, ScsiResult, ScsiStatus,
    ScsiTargetEvent, SenseKey, ShutdownMode, scsi_cmd_len,
};

pub const MSG_COMMAND_COMPLETE: u8 = 0x00;
pub const MSG_EXTENDED: u8 = 0x01;
pub const MSG_ABORT: u8 = 0x06;
pub const MSG_REJECT: u8 = 0x07;
pub const MSG_BUS_DEVICE_RESET: u8 = 0x0C;

const MAX_MSG_BYTES: usize = 256;

bitfield! {
    /// IDENTIFY message
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct IdentifyMessage(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub lun: u8 @ 0..=4,
        pub disconnect: bool @ 6,
        pub identify: bool @ 7,
    }
}

pub struct ScsiController {
    target_id: u8,
    bus: Rc<dyn ScsiBus>,
    luns: BTreeMap<u8, Box<dyn PrimaryDevice>>,

    phase: BusPhase,

    /// Command descriptor block of the current command
    cmd: ArrayVec<u8, MAX_CDB_LEN>,

    /// Transfer buffer for data, status and message phases
    buffer: Vec<u8>,
    length: usize,
    offset: usize,

    initiator_id: Option<u8>,
    status: ScsiStatus,

    /// Message sent in the next message in phase
    message: u8,

    /// LUN from an IDENTIFY message, takes precedence over the CDB
    identified_lun: Option<u8>,

    /// Message out phase following selection with ATN
    atn_msg: bool,
    msg_bytes: ArrayVec<u8, MAX_MSG_BYTES>,

    /// Shutdown to perform once the bus is free
    shutdown_mode: Option<ShutdownMode>,
    shutdown_request: Option<ShutdownMode>,
}

impl ScsiController {
    pub fn new(bus: Rc<dyn ScsiBus>, target_id: u8) -> Self {
        debug_assert!(target_id < MAX_TARGETS, "Invalid target ID {}", target_id);
        Self {
            target_id,
            bus,
            luns: BTreeMap::new(),
            phase: BusPhase::BusFree,
            cmd: ArrayVec::new(),
            buffer: vec![],
            length: 0,
            offset: 0,
            initiator_id: None,
            status: ScsiStatus::Good,
            message: MSG_COMMAND_COMPLETE,
            identified_lun: None,
            atn_msg: false,
            msg_bytes: ArrayVec::new(),
            shutdown_mode: None,
            shutdown_request: None,
        }
    }

    pub fn get_target_id(&self) -> u8 {
        self.target_id
    }

    pub fn get_phase(&self) -> BusPhase {
        self.phase
    }

    /// Forces a phase without driving the bus
    pub fn set_phase(&mut self, phase: BusPhase) {
        trace!("Target {} phase: {}", self.target_id, phase);
        self.phase = phase;
    }

    pub fn get_status(&self) -> ScsiStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ScsiStatus) {
        self.status = status;
    }

    pub fn get_length(&self) -> usize {
        self.length
    }

    pub fn set_length(&mut self, length: usize) {
        self.length = length;
    }

    pub fn has_valid_length(&self) -> bool {
        self.length > 0
    }

    pub fn get_offset(&self) -> usize {
        self.offset
    }

    pub fn get_initiator_id(&self) -> Option<u8> {
        self.initiator_id
    }

    pub fn get_cmd(&self) -> &[u8] {
        &self.cmd
    }

    pub fn get_message(&self) -> u8 {
        self.message
    }

    /// Attaches a device at its LUN. Returns false if the LUN is taken.
    pub fn add_device(&mut self, device: Box<dyn PrimaryDevice>) -> bool {
        let lun = device.device().get_lun();
        if self.luns.contains_key(&lun) {
            return false;
        }
        self.luns.insert(lun, device);
        true
    }

    pub fn remove_device(&mut self, lun: u8) -> Option<Box<dyn PrimaryDevice>> {
        self.luns.remove(&lun)
    }

    pub fn has_device_for_lun(&self, lun: u8) -> bool {
        self.luns.contains_key(&lun)
    }

    pub fn device_for_lun(&self, lun: u8) -> Option<&dyn PrimaryDevice> {
        self.luns.get(&lun).map(|d| d.as_ref())
    }

    pub fn device_for_lun_mut(&mut self, lun: u8) -> Option<&mut (dyn PrimaryDevice + 'static)> {
        self.luns.get_mut(&lun).map(|d| d.as_mut())
    }

    pub fn lun_count(&self) -> usize {
        self.luns.len()
    }

    pub fn luns(&self) -> impl Iterator<Item = u8> + '_ {
        self.luns.keys().copied()
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn PrimaryDevice>> {
        self.luns.values_mut()
    }

    /// Shutdown to perform after the current command, once the bus is free
    pub fn schedule_shutdown(&mut self, mode: ShutdownMode) {
        self.shutdown_mode = Some(mode);
    }

    /// Shutdown that became due when the bus was released
    pub fn take_shutdown_request(&mut self) -> Option<ShutdownMode> {
        self.shutdown_request.take()
    }

    /// One quantum of the state machine
    pub fn process(&mut self, initiator_id: Option<u8>) -> BusPhase {
        let signals = self.bus.acquire();
        if signals.rst() {
            warn!("RESET signal received");
            self.reset();
            self.bus_free();
            return self.phase;
        }

        self.initiator_id = initiator_id;

        match self.phase {
            BusPhase::BusFree => self.bus_free(),
            BusPhase::Selection => self.selection(),
            BusPhase::Command => self.command(),
            BusPhase::DataIn => self.data_in(),
            BusPhase::DataOut => self.data_out(),
            BusPhase::Status => self.status(),
            BusPhase::MsgIn => self.msg_in(),
            BusPhase::MsgOut => self.msg_out(),
            BusPhase::Reserved | BusPhase::Arbitration | BusPhase::Reselection => {
                error!("Cannot process phase {}", self.phase);
                self.reset();
                self.bus_free();
            }
        }

        self.phase
    }

    pub fn bus_free(&mut self) {
        if self.phase != BusPhase::BusFree {
            self.set_phase(BusPhase::BusFree);

            self.bus.set_req(false);
            self.bus.set_msg(false);
            self.bus.set_cd(false);
            self.bus.set_io(false);
            self.bus.set_bsy(false);

            if self.shutdown_mode.is_none() {
                self.status = ScsiStatus::Good;
            }
            self.message = MSG_COMMAND_COMPLETE;
            self.atn_msg = false;
            self.identified_lun = None;
            self.length = 0;
            self.offset = 0;

            if let Some(mode) = self.shutdown_mode.take() {
                info!("Shutdown requested: {}", mode);
                self.shutdown_request = Some(mode);
            }
            return;
        }

        if self.bus.get_sel() && !self.bus.get_bsy() {
            self.selection();
        }
    }

    pub fn selection(&mut self) {
        if self.phase != BusPhase::Selection {
            // Another target already responded
            if !self.bus.get_sel() || self.bus.get_bsy() {
                return;
            }

            let selected = 1u8
                .checked_shl(self.target_id.into())
                .is_some_and(|bit| self.bus.get_dat() & bit != 0);
            if !selected || self.luns.is_empty() {
                return;
            }

            trace!(
                "Target {} selected by initiator {:?}",
                self.target_id, self.initiator_id
            );
            self.set_phase(BusPhase::Selection);
            self.bus.set_bsy(true);
            return;
        }

        if !self.bus.get_sel() && self.bus.get_bsy() {
            if self.bus.get_atn() {
                self.msg_out();
            } else {
                self.command();
            }
        }
    }

    pub fn command(&mut self) {
        if self.phase != BusPhase::Command {
            self.set_phase(BusPhase::Command);
            self.bus.set_msg(false);
            self.bus.set_cd(true);
            self.bus.set_io(false);
        }

        self.cmd.clear();
        let mut buf = [0u8; MAX_CDB_LEN];
        let count = self.bus.command_handshake(&mut buf);
        if count == 0 {
            trace!("No command bytes received");
            self.status();
            return;
        }

        let expected = scsi_cmd_len(buf[0]);
        if count < expected {
            warn!(
                "Received {} command bytes, expected {} for {:02X}",
                count, expected, buf[0]
            );
            self.error(
                SenseKey::IllegalRequest,
                Asc::InvalidCommandOperationCode,
                ScsiStatus::CheckCondition,
            );
            return;
        }

        self.cmd.extend(buf[..expected].iter().copied());
        self.length = 0;
        self.execute();
    }

    pub fn execute(&mut self) {
        self.offset = 0;
        self.status = ScsiStatus::Good;

        let Some(&op) = self.cmd.first() else {
            self.error(
                SenseKey::IllegalRequest,
                Asc::InvalidCommandOperationCode,
                ScsiStatus::CheckCondition,
            );
            return;
        };
        let opcode = ScsiCommand::from_u8(op);
        debug!(
            "Target {} command {:?}: {}",
            self.target_id,
            opcode,
            hex::encode(&self.cmd)
        );

        let lun = self.effective_lun();
        let exec_lun = if self.luns.contains_key(&lun) {
            lun
        } else if matches!(
            opcode,
            Some(ScsiCommand::Inquiry | ScsiCommand::RequestSense)
        ) {
            // Reported by LUN 0, which always exists
            0
        } else {
            trace!("Invalid LUN {} for target {}", lun, self.target_id);
            self.error(
                SenseKey::IllegalRequest,
                Asc::InvalidLun,
                ScsiStatus::CheckCondition,
            );
            return;
        };

        let Some(device) = self.luns.get_mut(&exec_lun) else {
            self.error(
                SenseKey::IllegalRequest,
                Asc::InvalidLun,
                ScsiStatus::CheckCondition,
            );
            return;
        };

        // Sense data survives until REQUEST SENSE
        if opcode != Some(ScsiCommand::RequestSense) {
            device.device_mut().clear_sense();
        }

        if !device
            .device()
            .check_reservation(self.initiator_id, &self.cmd)
        {
            self.error(
                SenseKey::NoSense,
                Asc::NoAdditionalSenseInformation,
                ScsiStatus::ReservationConflict,
            );
            return;
        }

        let result = self.run(None);
        self.complete_command(result);
    }

    /// Dispatches the current command to the device
    fn run(&mut self, outdata: Option<&[u8]>) -> ScsiResult<ScsiCmdResult> {
        let lun = self.effective_lun();
        let luns: Vec<u8> = self.luns.keys().copied().collect();
        let exec_lun = if self.luns.contains_key(&lun) { lun } else { 0 };
        let Some(device) = self.luns.get_mut(&exec_lun) else {
            return Err(ScsiError::new(SenseKey::IllegalRequest, Asc::InvalidLun));
        };

        let ctx = CommandContext {
            cdb: &self.cmd,
            outdata,
            lun,
            luns: &luns,
            initiator_id: self.initiator_id,
        };
        let result = device.dispatch(&ctx);

        let mut shutdown = None;
        while let Some(event) = device.take_event() {
            match event {
                ScsiTargetEvent::Shutdown(mode) => shutdown = Some(mode),
            }
        }
        if let Some(mode) = shutdown {
            self.schedule_shutdown(mode);
        }

        result
    }

    fn complete_command(&mut self, result: ScsiResult<ScsiCmdResult>) {
        match result {
            Ok(ScsiCmdResult::Status(s)) => {
                self.status = s;
                self.status();
            }
            Ok(ScsiCmdResult::DataIn(data)) => {
                self.length = data.len();
                self.buffer = data;
                self.data_in();
            }
            Ok(ScsiCmdResult::DataOut(len)) => {
                self.buffer.clear();
                self.buffer.resize(len, 0);
                self.length = len;
                self.data_out();
            }
            Err(e) => {
                debug!("Target {} command failed: {}", self.target_id, e);
                self.error(e.sense_key, e.asc, e.status);
            }
        }
    }

    pub fn status(&mut self) {
        if self.phase != BusPhase::Status {
            self.set_phase(BusPhase::Status);
            self.bus.set_msg(false);
            self.bus.set_cd(true);
            self.bus.set_io(true);

            self.buffer.clear();
            self.buffer.push(self.status as u8);
            self.length = 1;
            self.offset = 0;
            return;
        }

        self.send();
    }

    pub fn data_in(&mut self) {
        if self.phase != BusPhase::DataIn {
            if !self.has_valid_length() {
                self.status();
                return;
            }

            self.set_phase(BusPhase::DataIn);
            self.bus.set_msg(false);
            self.bus.set_cd(false);
            self.bus.set_io(true);
            self.offset = 0;
            return;
        }

        self.send();
    }

    pub fn data_out(&mut self) {
        if self.phase != BusPhase::DataOut {
            if !self.has_valid_length() {
                self.status();
                return;
            }

            self.set_phase(BusPhase::DataOut);
            self.bus.set_msg(false);
            self.bus.set_cd(false);
            self.bus.set_io(false);
            self.offset = 0;
            return;
        }

        self.receive();
    }

    pub fn msg_in(&mut self) {
        if self.phase != BusPhase::MsgIn {
            self.set_phase(BusPhase::MsgIn);
            self.bus.set_msg(true);
            self.bus.set_cd(true);
            self.bus.set_io(true);
            self.length = 0;
            self.offset = 0;
            return;
        }

        if self.bus.send_handshake(&[self.message]) != 1 {
            self.error(
                SenseKey::AbortedCommand,
                Asc::NoAdditionalSenseInformation,
                ScsiStatus::CheckCondition,
            );
            return;
        }

        if self.atn_msg {
            // Reply to a message out, the command follows
            self.atn_msg = false;
            self.command();
        } else {
            self.bus_free();
        }
    }

    pub fn msg_out(&mut self) {
        if self.phase != BusPhase::MsgOut {
            if self.phase == BusPhase::Selection {
                self.atn_msg = true;
                self.msg_bytes.clear();
            }

            self.set_phase(BusPhase::MsgOut);
            self.bus.set_msg(true);
            self.bus.set_cd(true);
            self.bus.set_io(false);

            self.buffer.clear();
            self.buffer.push(0);
            self.length = 1;
            self.offset = 0;
            return;
        }

        self.receive();
    }

    /// Reports an error to the initiator through status and sense data
    pub fn error(&mut self, sense_key: SenseKey, asc: Asc, status: ScsiStatus) {
        let signals = self.bus.acquire();
        if signals.rst() {
            warn!("RESET signal received");
            self.reset();
            self.bus_free();
            return;
        }

        // Already reporting, give up on this command
        if matches!(self.phase, BusPhase::Status | BusPhase::MsgIn) {
            self.bus_free();
            return;
        }

        let mut lun = self.effective_lun();
        if !self.luns.contains_key(&lun) || asc == Asc::InvalidLun {
            lun = 0;
        }

        if sense_key != SenseKey::NoSense || asc != Asc::NoAdditionalSenseInformation {
            debug!(
                "Target {}:{} error: {} / {}",
                self.target_id, lun, sense_key, asc
            );
            if let Some(device) = self.luns.get_mut(&lun) {
                device.device_mut().set_sense(sense_key, asc);
            }
        }

        self.status = status;
        self.message = MSG_COMMAND_COMPLETE;
        self.status();
    }

    pub fn reset(&mut self) {
        self.set_phase(BusPhase::Reserved);
        self.status = ScsiStatus::Good;
        self.message = MSG_COMMAND_COMPLETE;
        self.length = 0;
        self.offset = 0;
        self.cmd.clear();
        self.buffer.clear();
        self.identified_lun = None;
        self.atn_msg = false;
        self.msg_bytes.clear();

        for device in self.luns.values_mut() {
            device.device_mut().reset();
        }

        self.bus.reset();
    }

    /// LUN addressed by the current command
    fn effective_lun(&self) -> u8 {
        self.identified_lun
            .unwrap_or_else(|| self.cmd.get(1).map_or(0, |b| b >> 5))
    }

    fn send(&mut self) {
        if self.offset < self.length {
            let sent = self
                .bus
                .send_handshake(&self.buffer[self.offset..self.length]);
            if sent != self.length - self.offset {
                warn!(
                    "Send handshake in phase {} transferred {} of {} bytes",
                    self.phase,
                    sent,
                    self.length - self.offset
                );
                self.error(
                    SenseKey::AbortedCommand,
                    Asc::NoAdditionalSenseInformation,
                    ScsiStatus::CheckCondition,
                );
                return;
            }
            self.offset += sent;
        }

        match self.phase {
            BusPhase::DataIn => self.status(),
            BusPhase::Status => {
                self.message = MSG_COMMAND_COMPLETE;
                self.msg_in();
            }
            _ => (),
        }
    }

    fn receive(&mut self) {
        if self.offset < self.length {
            let end = self.length;
            let received = self
                .bus
                .receive_handshake(&mut self.buffer[self.offset..end]);
            if received != end - self.offset {
                warn!(
                    "Receive handshake in phase {} transferred {} of {} bytes",
                    self.phase,
                    received,
                    end - self.offset
                );
                self.error(
                    SenseKey::AbortedCommand,
                    Asc::NoAdditionalSenseInformation,
                    ScsiStatus::CheckCondition,
                );
                return;
            }
            self.offset += received;
        }

        match self.phase {
            BusPhase::MsgOut => {
                if self.msg_bytes.try_push(self.buffer[0]).is_err() {
                    error!("Too many message bytes");
                    self.bus_free();
                    return;
                }

                // Initiator has more messages
                if self.bus.acquire().atn() {
                    self.offset = 0;
                    self.length = 1;
                    return;
                }

                self.process_messages();
            }
            BusPhase::DataOut => {
                let data = std::mem::take(&mut self.buffer);
                match self.run(Some(&data[..self.length])) {
                    Ok(ScsiCmdResult::DataOut(_)) => {
                        error!("Device requested data out twice");
                        self.error(
                            SenseKey::AbortedCommand,
                            Asc::NoAdditionalSenseInformation,
                            ScsiStatus::CheckCondition,
                        );
                    }
                    result => self.complete_command(result),
                }
            }
            _ => (),
        }
    }

    fn process_messages(&mut self) {
        let messages = std::mem::take(&mut self.msg_bytes);
        trace!("Target {} messages: {:02X?}", self.target_id, messages);

        for msg in messages {
            match msg {
                MSG_ABORT => {
                    trace!("ABORT message");
                    self.bus_free();
                    return;
                }
                MSG_BUS_DEVICE_RESET => {
                    trace!("BUS DEVICE RESET message");
                    self.reset();
                    self.bus_free();
                    return;
                }
                MSG_EXTENDED => {
                    // No synchronous transfer or wide negotiation
                    trace!("Rejecting extended message");
                    self.message = MSG_REJECT;
                    self.msg_in();
                    return;
                }
                m if IdentifyMessage(m).identify() => {
                    let lun = IdentifyMessage(m).lun();
                    trace!("IDENTIFY for LUN {}", lun);
                    self.identified_lun = Some(lun);
                }
                m => trace!("Ignoring message {:02X}", m),
            }
        }

        self.atn_msg = false;
        self.command();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testbus::{BusCall, Testbus};
    use crate::scsi::testdevice::{CMD_READ_DATA, CMD_SHUTDOWN, CMD_WRITE_DATA, TestDevice};

    fn setup() -> (Rc<Testbus>, ScsiController) {
        let bus = Rc::new(Testbus::new());
        let controller = ScsiController::new(bus.clone(), 0);
        (bus, controller)
    }

    fn setup_with_device() -> (Rc<Testbus>, ScsiController) {
        let (bus, mut controller) = setup();
        assert!(controller.add_device(Box::new(TestDevice::new(0))));
        (bus, controller)
    }

    /// Runs a command from the command phase on, stops once the bus is free
    /// or after the status phase has been entered
    fn run_command(bus: &Testbus, controller: &mut ScsiController, cdb: &[u8]) {
        bus.drive(|s| s.with_bsy(true));
        controller.set_phase(BusPhase::Command);
        bus.set_command(cdb);
        controller.process(Some(7));
    }

    fn sense(controller: &ScsiController, lun: u8) -> (SenseKey, Asc) {
        let d = controller.device_for_lun(lun).unwrap().device();
        (d.get_sense_key(), d.get_asc())
    }

    #[test]
    fn initial_state() {
        let (_bus, controller) = setup();
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
        assert_eq!(controller.get_status(), ScsiStatus::Good);
        assert_eq!(controller.get_target_id(), 0);
        assert!(!controller.has_valid_length());
    }

    #[test]
    fn initiator_id() {
        let (_bus, mut controller) = setup();
        controller.process(Some(2));
        assert_eq!(controller.get_initiator_id(), Some(2));
        controller.process(None);
        assert_eq!(controller.get_initiator_id(), None);
    }

    #[test]
    fn process_reset() {
        for phase in [
            BusPhase::BusFree,
            BusPhase::Selection,
            BusPhase::Command,
            BusPhase::DataIn,
            BusPhase::DataOut,
            BusPhase::Status,
            BusPhase::MsgIn,
            BusPhase::MsgOut,
            BusPhase::Reserved,
        ] {
            let (bus, mut controller) = setup_with_device();
            bus.drive(|s| s.with_rst(true));
            controller.set_phase(phase);
            controller.set_status(ScsiStatus::CheckCondition);

            assert_eq!(controller.process(None), BusPhase::BusFree);
            assert_eq!(controller.get_status(), ScsiStatus::Good);
            assert!(bus.called(BusCall::Reset));
        }
    }

    #[test]
    fn process_reserved() {
        let (bus, mut controller) = setup();
        controller.set_phase(BusPhase::Reserved);
        assert_eq!(controller.process(None), BusPhase::BusFree);
        assert!(bus.called(BusCall::Reset));
        assert!(bus.called(BusCall::SetBsy(false)));
    }

    #[test]
    fn bus_free() {
        let (bus, mut controller) = setup();
        controller.bus_free();
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
        assert!(bus.get_trace().is_empty());

        controller.set_status(ScsiStatus::CheckCondition);
        controller.set_phase(BusPhase::Reserved);
        controller.set_length(5);
        controller.bus_free();
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
        assert_eq!(controller.get_status(), ScsiStatus::Good);
        assert_eq!(controller.get_length(), 0);
        for call in [
            BusCall::SetReq(false),
            BusCall::SetMsg(false),
            BusCall::SetCd(false),
            BusCall::SetIo(false),
            BusCall::SetBsy(false),
        ] {
            assert!(bus.called(call));
        }
        assert_eq!(controller.take_shutdown_request(), None);
    }

    #[test]
    fn bus_free_shutdown() {
        for mode in [
            ShutdownMode::StopEmulator,
            ShutdownMode::StopHost,
            ShutdownMode::RestartHost,
        ] {
            let (_bus, mut controller) = setup();
            controller.schedule_shutdown(mode);
            controller.set_status(ScsiStatus::CheckCondition);
            controller.set_phase(BusPhase::Reserved);
            controller.bus_free();

            // Status not cleared while a shutdown is pending
            assert_eq!(controller.get_status(), ScsiStatus::CheckCondition);
            assert_eq!(controller.take_shutdown_request(), Some(mode));
            assert_eq!(controller.take_shutdown_request(), None);
        }
    }

    #[test]
    fn selection() {
        let (bus, mut controller) = setup();

        // Other target already responded
        controller.set_phase(BusPhase::Reserved);
        bus.drive(|s| s.with_sel(true).with_bsy(true).with_dat(1));
        controller.selection();
        assert_eq!(controller.get_phase(), BusPhase::Reserved);

        bus.drive(|s| s.with_bsy(false).with_dat(0));
        controller.selection();
        assert_eq!(controller.get_phase(), BusPhase::Reserved);

        bus.drive(|s| s.with_dat(1));
        controller.selection();
        assert_eq!(
            controller.get_phase(),
            BusPhase::Reserved,
            "There is no device that can be selected"
        );
        assert!(!bus.called(BusCall::SetBsy(true)));

        controller.add_device(Box::new(TestDevice::new(0)));
        controller.selection();
        assert_eq!(controller.get_phase(), BusPhase::Selection);
        assert!(bus.called(BusCall::SetBsy(true)));

        // Still selecting
        bus.drive(|s| s.with_bsy(true));
        controller.selection();
        assert_eq!(controller.get_phase(), BusPhase::Selection);

        // No CDB from the initiator, straight to status
        bus.drive(|s| s.with_sel(false).with_atn(false));
        controller.selection();
        assert!(bus.called(BusCall::CommandHandshake));
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.get_status(), ScsiStatus::Good);

        controller.set_phase(BusPhase::Selection);
        bus.drive(|s| s.with_atn(true));
        controller.selection();
        assert_eq!(controller.get_phase(), BusPhase::MsgOut);
    }

    #[test]
    fn selection_other_id() {
        let (bus, mut controller) = setup_with_device();
        bus.drive(|s| s.with_sel(true).with_dat(0b0000_0100));
        controller.process(None);
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
        assert!(!bus.called(BusCall::SetBsy(true)));
    }

    #[test]
    #[should_panic]
    fn invalid_target_id() {
        let bus = Rc::new(Testbus::new());
        let _ = ScsiController::new(bus, MAX_TARGETS);
    }

    #[test]
    fn selection_highest_id() {
        let bus = Rc::new(Testbus::new());
        let mut controller = ScsiController::new(bus.clone(), MAX_TARGETS - 1);
        controller.add_device(Box::new(TestDevice::new(0)));
        bus.drive(|s| s.with_sel(true).with_dat(0b1000_0000));
        controller.process(None);
        assert_eq!(controller.get_phase(), BusPhase::Selection);
    }

    #[test]
    fn selection_to_command() {
        let (bus, mut controller) = setup_with_device();

        bus.drive(|s| s.with_sel(true).with_bsy(false).with_atn(false).with_dat(1));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::Selection);

        // TEST UNIT READY is received in the same quantum
        bus.set_command(&[0x00, 0, 0, 0, 0, 0]);
        bus.drive(|s| s.with_sel(false).with_bsy(true).with_dat(0));
        controller.process(Some(7));
        assert!(bus.called(BusCall::SetCd(true)));
        assert_eq!(controller.get_cmd(), &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.get_status(), ScsiStatus::Good);
    }

    #[test]
    fn command_from_reserved() {
        let (bus, mut controller) = setup_with_device();
        controller.set_phase(BusPhase::Reserved);
        controller.command();
        assert_eq!(
            &bus.get_trace()[..4],
            &[
                BusCall::SetMsg(false),
                BusCall::SetCd(true),
                BusCall::SetIo(false),
                BusCall::CommandHandshake
            ]
        );
        assert!(controller.get_cmd().is_empty());
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.get_status(), ScsiStatus::Good);

        // Same call receives and dispatches a queued CDB
        bus.reset_trace();
        controller.set_phase(BusPhase::Reserved);
        bus.set_command(&[CMD_READ_DATA, 0, 0, 0, 2, 0]);
        controller.command();
        assert_eq!(bus.count(BusCall::CommandHandshake), 1);
        assert_eq!(controller.get_cmd(), &[CMD_READ_DATA, 0, 0, 0, 2, 0]);
        assert_eq!(controller.get_phase(), BusPhase::DataIn);
        assert_eq!(controller.get_length(), 2);
    }

    #[test]
    fn command_in_command_phase() {
        let (bus, mut controller) = setup_with_device();
        controller.set_phase(BusPhase::Command);
        bus.set_command(&[0x00, 0, 0, 0, 0, 0]);
        controller.command();
        // Lines are only driven when entering the phase
        assert!(!bus.called(BusCall::SetIo(false)));
        assert!(bus.called(BusCall::CommandHandshake));
        assert_eq!(controller.get_phase(), BusPhase::Status);
    }

    #[test]
    fn command_no_bytes() {
        let (bus, mut controller) = setup_with_device();
        run_command(&bus, &mut controller, &[]);
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.get_status(), ScsiStatus::Good);
        assert_eq!(
            sense(&controller, 0),
            (SenseKey::NoSense, Asc::NoAdditionalSenseInformation)
        );

        // GOOD status, COMMAND COMPLETE
        controller.process(Some(7));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
        assert_eq!(bus.get_sent(), vec![0x00, MSG_COMMAND_COMPLETE]);
    }

    #[test]
    fn command_short() {
        let (bus, mut controller) = setup_with_device();
        // READ(10) is 10 bytes
        run_command(&bus, &mut controller, &[0x28, 0, 0, 0]);
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.get_status(), ScsiStatus::CheckCondition);
        assert_eq!(
            sense(&controller, 0),
            (SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode)
        );
    }

    #[test]
    fn command_cycle() {
        let (bus, mut controller) = setup_with_device();
        run_command(&bus, &mut controller, &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(controller.get_cmd(), &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.get_status(), ScsiStatus::Good);

        bus.drive(|s| s.with_cd(true).with_io(true));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::MsgIn);
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::BusFree);

        // Status GOOD, COMMAND COMPLETE
        assert_eq!(bus.get_sent(), vec![0x00, MSG_COMMAND_COMPLETE]);
    }

    #[test]
    fn data_in_cycle() {
        let (bus, mut controller) = setup_with_device();
        run_command(&bus, &mut controller, &[CMD_READ_DATA, 0, 0, 0, 3, 0]);
        assert_eq!(controller.get_phase(), BusPhase::DataIn);
        assert_eq!(controller.get_length(), 3);
        assert_eq!(controller.get_offset(), 0);

        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(bus.get_sent(), vec![0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn data_out_cycle() {
        let (bus, mut controller) = setup_with_device();
        run_command(&bus, &mut controller, &[CMD_WRITE_DATA, 0, 0, 0, 4, 0]);
        assert_eq!(controller.get_phase(), BusPhase::DataOut);
        assert_eq!(controller.get_length(), 4);

        bus.queue_receive(&[1, 2, 3, 4]);
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.get_status(), ScsiStatus::Good);
        assert!(bus.called(BusCall::Receive(4)));
    }

    #[test]
    fn data_out_short() {
        let (bus, mut controller) = setup_with_device();
        run_command(&bus, &mut controller, &[CMD_WRITE_DATA, 0, 0, 0, 4, 0]);
        bus.queue_receive(&[1, 2]);
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.get_status(), ScsiStatus::CheckCondition);
        assert_eq!(
            sense(&controller, 0),
            (SenseKey::AbortedCommand, Asc::NoAdditionalSenseInformation)
        );
    }

    #[test]
    fn data_in_short() {
        let (bus, mut controller) = setup_with_device();
        run_command(&bus, &mut controller, &[CMD_READ_DATA, 0, 0, 0, 8, 0]);
        bus.set_send_limit(Some(2));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.get_status(), ScsiStatus::CheckCondition);

        // Status byte cannot be sent either, gives up
        bus.set_send_limit(Some(0));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
    }

    #[test]
    fn data_in_out_zero_length() {
        let (bus, mut controller) = setup();
        controller.set_phase(BusPhase::Reserved);
        controller.set_length(0);
        controller.data_in();
        assert_eq!(controller.get_phase(), BusPhase::Status);

        controller.set_phase(BusPhase::Reserved);
        controller.set_length(0);
        controller.data_out();
        assert_eq!(controller.get_phase(), BusPhase::Status);

        bus.reset_trace();
        controller.set_phase(BusPhase::Reserved);
        controller.set_length(1);
        controller.data_in();
        assert_eq!(controller.get_phase(), BusPhase::DataIn);
        assert_eq!(controller.get_offset(), 0);
        assert_eq!(
            bus.get_trace(),
            vec![
                BusCall::SetMsg(false),
                BusCall::SetCd(false),
                BusCall::SetIo(true)
            ]
        );

        bus.reset_trace();
        controller.set_phase(BusPhase::Reserved);
        controller.set_length(1);
        controller.data_out();
        assert_eq!(controller.get_phase(), BusPhase::DataOut);
        assert_eq!(controller.get_offset(), 0);
        assert_eq!(
            bus.get_trace(),
            vec![
                BusCall::SetMsg(false),
                BusCall::SetCd(false),
                BusCall::SetIo(false)
            ]
        );
    }

    #[test]
    fn msg_in_enter() {
        let (bus, mut controller) = setup();
        controller.set_phase(BusPhase::Reserved);
        controller.set_length(4);
        controller.msg_in();
        assert_eq!(controller.get_phase(), BusPhase::MsgIn);
        assert!(!controller.has_valid_length());
        assert_eq!(controller.get_offset(), 0);
        assert_eq!(
            bus.get_trace(),
            vec![
                BusCall::SetMsg(true),
                BusCall::SetCd(true),
                BusCall::SetIo(true)
            ]
        );
    }

    #[test]
    fn msg_out_enter() {
        let (bus, mut controller) = setup();
        controller.set_phase(BusPhase::Reserved);
        controller.msg_out();
        assert_eq!(controller.get_phase(), BusPhase::MsgOut);
        assert_eq!(controller.get_length(), 1);
        assert_eq!(controller.get_offset(), 0);
        assert_eq!(
            bus.get_trace(),
            vec![
                BusCall::SetMsg(true),
                BusCall::SetCd(true),
                BusCall::SetIo(false)
            ]
        );
    }

    #[test]
    fn identify_message() {
        let (bus, mut controller) = setup_with_device();
        let mut lun1 = TestDevice::new(1);
        lun1.device_mut().set_sense(SenseKey::MediumError, Asc::ReadFault);
        controller.add_device(Box::new(lun1));

        controller.set_phase(BusPhase::Selection);
        bus.drive(|s| s.with_bsy(true).with_atn(true));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::MsgOut);

        // IDENTIFY, LUN 1, followed by REQUEST SENSE without LUN in the CDB
        bus.queue_receive(&[0x81]);
        bus.set_command(&[0x03, 0, 0, 0, 18, 0]);
        bus.drive(|s| s.with_atn(false));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::DataIn);
        controller.process(Some(7));
        let sent = bus.get_sent();
        assert_eq!(sent[2], SenseKey::MediumError as u8);
        assert_eq!(sent[12], Asc::ReadFault as u8);
    }

    #[test]
    fn multiple_messages() {
        let (bus, mut controller) = setup_with_device();
        controller.set_phase(BusPhase::Selection);
        bus.drive(|s| s.with_bsy(true).with_atn(true));
        controller.process(Some(7));

        // More bytes follow while ATN stays asserted
        bus.queue_receive(&[0x80, 0x08]);
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::MsgOut);
        assert_eq!(controller.get_length(), 1);
        assert_eq!(controller.get_offset(), 0);

        bus.set_command(&[0x00, 0, 0, 0, 0, 0]);
        bus.drive(|s| s.with_atn(false));
        controller.process(Some(7));
        assert_eq!(controller.get_cmd(), &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(controller.get_phase(), BusPhase::Status);
    }

    #[test]
    fn abort_message() {
        let (bus, mut controller) = setup_with_device();
        controller.set_phase(BusPhase::Selection);
        bus.drive(|s| s.with_bsy(true).with_atn(true));
        controller.process(Some(7));

        bus.queue_receive(&[MSG_ABORT]);
        bus.drive(|s| s.with_atn(false));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
        assert!(!bus.called(BusCall::Reset));
    }

    #[test]
    fn bus_device_reset_message() {
        let (bus, mut controller) = setup_with_device();
        controller.device_for_lun_mut(0).unwrap().device_mut().reserve(Some(3));

        controller.set_phase(BusPhase::Selection);
        bus.drive(|s| s.with_bsy(true).with_atn(true));
        controller.process(Some(7));

        bus.queue_receive(&[MSG_BUS_DEVICE_RESET]);
        bus.drive(|s| s.with_atn(false));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
        assert!(bus.called(BusCall::Reset));
        assert_eq!(
            controller.device_for_lun(0).unwrap().device().get_reservation(),
            crate::scsi::device::Reservation::NotReserved
        );
    }

    #[test]
    fn extended_message_rejected() {
        let (bus, mut controller) = setup_with_device();
        controller.set_phase(BusPhase::Selection);
        bus.drive(|s| s.with_bsy(true).with_atn(true));
        controller.process(Some(7));

        // Synchronous data transfer request
        bus.queue_receive(&[MSG_EXTENDED]);
        bus.drive(|s| s.with_atn(false));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::MsgIn);
        assert_eq!(controller.get_message(), MSG_REJECT);

        // The command follows the reply
        bus.set_command(&[0x00, 0, 0, 0, 0, 0]);
        controller.process(Some(7));
        assert_eq!(bus.get_sent(), vec![MSG_REJECT]);
        assert_eq!(controller.get_phase(), BusPhase::Status);

        // Regular command completion ends in bus free
        controller.process(Some(7));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
    }

    #[test]
    fn error_reset() {
        let (bus, mut controller) = setup();
        bus.drive(|s| s.with_rst(true));
        controller.set_phase(BusPhase::Reserved);
        controller.error(
            SenseKey::AbortedCommand,
            Asc::NoAdditionalSenseInformation,
            ScsiStatus::ReservationConflict,
        );
        assert_eq!(controller.get_status(), ScsiStatus::Good);
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
        assert!(bus.called(BusCall::Reset));
    }

    #[test]
    fn error_reentrancy() {
        for phase in [BusPhase::Status, BusPhase::MsgIn] {
            let (bus, mut controller) = setup();
            controller.set_phase(phase);
            controller.error(
                SenseKey::AbortedCommand,
                Asc::NoAdditionalSenseInformation,
                ScsiStatus::ReservationConflict,
            );
            assert_eq!(controller.get_phase(), BusPhase::BusFree);
            assert!(!bus.called(BusCall::Reset));
        }
    }

    #[test]
    fn error_enters_status() {
        let (bus, mut controller) = setup_with_device();
        controller.set_phase(BusPhase::Reserved);
        controller.error(
            SenseKey::AbortedCommand,
            Asc::NoAdditionalSenseInformation,
            ScsiStatus::ReservationConflict,
        );
        assert_eq!(controller.get_status(), ScsiStatus::ReservationConflict);
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert!(!bus.called(BusCall::Reset));
        assert_eq!(
            sense(&controller, 0),
            (SenseKey::AbortedCommand, Asc::NoAdditionalSenseInformation)
        );
    }

    #[test]
    fn invalid_lun() {
        let (bus, mut controller) = setup_with_device();
        // TEST UNIT READY for LUN 2
        run_command(&bus, &mut controller, &[0x00, 0x40, 0, 0, 0, 0]);
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.get_status(), ScsiStatus::CheckCondition);
        assert_eq!(
            sense(&controller, 0),
            (SenseKey::IllegalRequest, Asc::InvalidLun)
        );
    }

    #[test]
    fn request_sense_non_existing_lun() {
        let (bus, mut controller) = setup_with_device();
        // LUN 4
        run_command(&bus, &mut controller, &[0x03, 0x80, 0, 0, 255, 0]);
        assert_eq!(controller.get_phase(), BusPhase::DataIn);
        assert_eq!(
            controller.get_status(),
            ScsiStatus::Good,
            "Wrong CHECK CONDITION for non-existing LUN"
        );
        assert_eq!(
            sense(&controller, 0),
            (SenseKey::IllegalRequest, Asc::InvalidLun)
        );
    }

    #[test]
    fn sense_cleared_by_next_command() {
        let (bus, mut controller) = setup_with_device();
        controller
            .device_for_lun_mut(0)
            .unwrap()
            .device_mut()
            .set_sense(SenseKey::MediumError, Asc::ReadFault);
        run_command(&bus, &mut controller, &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(
            sense(&controller, 0),
            (SenseKey::NoSense, Asc::NoAdditionalSenseInformation)
        );
    }

    #[test]
    fn reservation_conflict() {
        let (bus, mut controller) = setup_with_device();
        controller
            .device_for_lun_mut(0)
            .unwrap()
            .device_mut()
            .reserve(Some(3));

        run_command(&bus, &mut controller, &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(controller.get_status(), ScsiStatus::ReservationConflict);

        // INQUIRY is always allowed
        let (bus, mut controller) = setup_with_device();
        controller
            .device_for_lun_mut(0)
            .unwrap()
            .device_mut()
            .reserve(Some(3));
        run_command(&bus, &mut controller, &[0x12, 0, 0, 0, 36, 0]);
        assert_eq!(controller.get_phase(), BusPhase::DataIn);
    }

    #[test]
    fn shutdown_event() {
        let (bus, mut controller) = setup_with_device();
        run_command(&bus, &mut controller, &[CMD_SHUTDOWN, 0, 0, 0, 0, 0]);
        assert_eq!(controller.get_phase(), BusPhase::Status);
        assert_eq!(controller.take_shutdown_request(), None);

        controller.process(Some(7));
        controller.process(Some(7));
        assert_eq!(controller.get_phase(), BusPhase::BusFree);
        assert_eq!(
            controller.take_shutdown_request(),
            Some(ShutdownMode::StopEmulator)
        );
    }

    #[test]
    fn device_management() {
        let (_bus, mut controller) = setup();
        assert!(controller.add_device(Box::new(TestDevice::new(0))));
        assert!(!controller.add_device(Box::new(TestDevice::new(0))));
        assert!(controller.add_device(Box::new(TestDevice::new(5))));
        assert_eq!(controller.lun_count(), 2);
        assert_eq!(controller.luns().collect::<Vec<_>>(), vec![0, 5]);
        assert!(controller.has_device_for_lun(5));
        assert!(controller.remove_device(5).is_some());
        assert!(!controller.has_device_for_lun(5));
        assert!(controller.remove_device(5).is_none());
    }

    #[test]
    fn identify_message_fields() {
        let m = IdentifyMessage(0xC3);
        assert!(m.identify());
        assert!(m.disconnect());
        assert_eq!(m.lun(), 3);
    }
}
