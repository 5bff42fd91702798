//! Simulated SCSI bus with a scripted initiator
//!
//! Used on hosts without SCSI hardware. The initiator half of the bus is
//! simulated: it completes selection as soon as the target answers with BSY,
//! feeds queued message, command and data bytes into the handshakes and
//! collects whatever the target sends back, sorted by phase.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};

use super::{BusMode, BusPhase, BusSignals, ScsiBus};
use crate::scsi::scsi_cmd_len;

#[derive(Debug, Default)]
struct VirtualInitiator {
    message_out: VecDeque<u8>,
    command: VecDeque<u8>,
    data_out: VecDeque<u8>,

    data_in: Vec<u8>,
    status: Vec<u8>,
    message_in: Vec<u8>,
}

pub struct VirtualBus {
    mode: Cell<Option<BusMode>>,
    signals: Cell<BusSignals>,
    initiator: RefCell<VirtualInitiator>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self {
            mode: Cell::new(None),
            signals: Cell::new(BusSignals(0)),
            initiator: RefCell::new(VirtualInitiator::default()),
        }
    }

    pub fn get_mode(&self) -> Option<BusMode> {
        self.mode.get()
    }

    fn update(&self, f: impl FnOnce(BusSignals) -> BusSignals) {
        self.signals.set(f(self.signals.get()));
    }

    /// Initiator side: selects a target, optionally identifying the initiator
    /// on the data bus and asking for a message out phase.
    pub fn select(&self, target_id: u8, initiator_id: Option<u8>, atn: bool) {
        let mut dat = 1u8 << target_id;
        if let Some(id) = initiator_id {
            dat |= 1 << id;
        }
        self.update(|s| s.with_dat(dat).with_sel(true).with_atn(atn));
    }

    /// Initiator side: asserts or releases RST
    pub fn drive_rst(&self, val: bool) {
        self.update(|s| s.with_rst(val));
    }

    /// Initiator side: messages sent during message out. ATN is released
    /// after the last byte has been taken.
    pub fn queue_message_out(&self, data: &[u8]) {
        self.initiator.borrow_mut().message_out.extend(data);
    }

    /// Initiator side: command bytes for the command phase
    pub fn queue_command(&self, data: &[u8]) {
        self.initiator.borrow_mut().command.extend(data);
    }

    /// Initiator side: data for the data out phase
    pub fn queue_data_out(&self, data: &[u8]) {
        self.initiator.borrow_mut().data_out.extend(data);
    }

    pub fn take_data_in(&self) -> Vec<u8> {
        std::mem::take(&mut self.initiator.borrow_mut().data_in)
    }

    pub fn take_status(&self) -> Vec<u8> {
        std::mem::take(&mut self.initiator.borrow_mut().status)
    }

    pub fn take_message_in(&self) -> Vec<u8> {
        std::mem::take(&mut self.initiator.borrow_mut().message_in)
    }
}

impl ScsiBus for VirtualBus {
    fn init(&self, mode: BusMode) -> Result<()> {
        if self.mode.get().is_some() {
            bail!("Virtual bus already initialized");
        }
        self.mode.set(Some(mode));
        Ok(())
    }

    fn reset(&self) {
        self.signals.set(BusSignals(0));
        let mut initiator = self.initiator.borrow_mut();
        initiator.message_out.clear();
        initiator.command.clear();
        initiator.data_out.clear();
    }

    fn acquire(&self) -> BusSignals {
        self.signals.get()
    }

    fn get_bsy(&self) -> bool {
        self.signals.get().bsy()
    }

    fn set_bsy(&self, val: bool) {
        self.update(|s| s.with_bsy(val));

        if val && self.signals.get().sel() && self.mode.get() != Some(BusMode::Initiator) {
            // Target responded, the initiator ends the selection
            self.update(|s| s.with_sel(false).with_dat(0));
        }
    }

    fn get_sel(&self) -> bool {
        self.signals.get().sel()
    }

    fn set_sel(&self, val: bool) {
        self.update(|s| s.with_sel(val));
    }

    fn get_atn(&self) -> bool {
        self.signals.get().atn()
    }

    fn set_atn(&self, val: bool) {
        self.update(|s| s.with_atn(val));
    }

    fn get_ack(&self) -> bool {
        self.signals.get().ack()
    }

    fn set_ack(&self, val: bool) {
        self.update(|s| s.with_ack(val));
    }

    fn get_rst(&self) -> bool {
        self.signals.get().rst()
    }

    fn set_rst(&self, val: bool) {
        self.update(|s| s.with_rst(val));
    }

    fn get_msg(&self) -> bool {
        self.signals.get().msg()
    }

    fn set_msg(&self, val: bool) {
        self.update(|s| s.with_msg(val));
    }

    fn get_cd(&self) -> bool {
        self.signals.get().cd()
    }

    fn set_cd(&self, val: bool) {
        self.update(|s| s.with_cd(val));
    }

    fn get_io(&self) -> bool {
        self.signals.get().io()
    }

    fn set_io(&self, val: bool) {
        self.update(|s| s.with_io(val));
    }

    fn get_req(&self) -> bool {
        self.signals.get().req()
    }

    fn set_req(&self, val: bool) {
        self.update(|s| s.with_req(val));
    }

    fn get_dat(&self) -> u8 {
        self.signals.get().dat()
    }

    fn set_dat(&self, val: u8) {
        self.update(|s| s.with_dat(val));
    }

    fn command_handshake(&self, buf: &mut [u8]) -> usize {
        let mut initiator = self.initiator.borrow_mut();
        let Some(&opcode) = initiator.command.front() else {
            return 0;
        };
        let len = scsi_cmd_len(opcode)
            .min(buf.len())
            .min(initiator.command.len());
        for (b, v) in buf.iter_mut().zip(initiator.command.drain(..len)) {
            *b = v;
        }
        len
    }

    fn send_handshake(&self, buf: &[u8]) -> usize {
        let mut initiator = self.initiator.borrow_mut();
        match self.signals.get().phase() {
            BusPhase::DataIn => initiator.data_in.extend_from_slice(buf),
            BusPhase::Status => initiator.status.extend_from_slice(buf),
            BusPhase::MsgIn => initiator.message_in.extend_from_slice(buf),
            phase => {
                log::warn!("Virtual initiator not accepting data in phase {}", phase);
                return 0;
            }
        }
        buf.len()
    }

    fn receive_handshake(&self, buf: &mut [u8]) -> usize {
        let phase = self.signals.get().phase();
        let mut initiator = self.initiator.borrow_mut();
        let source = match phase {
            BusPhase::MsgOut => &mut initiator.message_out,
            BusPhase::DataOut => &mut initiator.data_out,
            phase => {
                log::warn!("Virtual initiator not sending data in phase {}", phase);
                return 0;
            }
        };

        let len = buf.len().min(source.len());
        for (b, v) in buf.iter_mut().zip(source.drain(..len)) {
            *b = v;
        }

        if phase == BusPhase::MsgOut && initiator.message_out.is_empty() {
            drop(initiator);
            self.update(|s| s.with_atn(false));
        }
        len
    }

    fn poll_select_event(&self, timeout: Duration) -> bool {
        if self.get_sel() {
            return true;
        }
        thread::sleep(timeout);
        self.get_sel()
    }
}
