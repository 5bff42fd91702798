use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;

use super::{BusMode, BusSignals, ScsiBus};

/// A bus operation performed by the code under test
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusCall {
    Init(BusMode),
    Reset,
    Acquire,
    SetBsy(bool),
    SetSel(bool),
    SetAtn(bool),
    SetAck(bool),
    SetRst(bool),
    SetMsg(bool),
    SetCd(bool),
    SetIo(bool),
    SetReq(bool),
    SetDat(u8),
    CommandHandshake,
    Send(usize),
    Receive(usize),
}

/// Bus for unit tests.
///
/// Line getters report what the test scripted through [`Testbus::drive`]; setters
/// only record the call. Every operation is traced so tests can check which
/// lines the controller touched.
pub struct Testbus {
    signals: Cell<BusSignals>,
    command: RefCell<Vec<u8>>,
    receive: RefCell<VecDeque<u8>>,
    sent: RefCell<Vec<u8>>,
    send_limit: Cell<Option<usize>>,
    trace: RefCell<Vec<BusCall>>,
}

impl Testbus {
    pub fn new() -> Self {
        Self {
            signals: Cell::new(BusSignals(0)),
            command: RefCell::new(vec![]),
            receive: RefCell::new(VecDeque::new()),
            sent: RefCell::new(vec![]),
            send_limit: Cell::new(None),
            trace: RefCell::new(vec![]),
        }
    }

    /// Changes the line state reported to the code under test
    pub fn drive(&self, f: impl FnOnce(BusSignals) -> BusSignals) {
        self.signals.set(f(self.signals.get()));
    }

    /// Bytes returned by the next command handshake
    pub fn set_command(&self, cmd: &[u8]) {
        *self.command.borrow_mut() = cmd.to_vec();
    }

    /// Bytes returned by subsequent receive handshakes
    pub fn queue_receive(&self, data: &[u8]) {
        self.receive.borrow_mut().extend(data);
    }

    /// Limits the number of bytes the send handshake accepts
    pub fn set_send_limit(&self, limit: Option<usize>) {
        self.send_limit.set(limit);
    }

    pub fn get_sent(&self) -> Vec<u8> {
        self.sent.borrow().clone()
    }

    pub fn get_trace(&self) -> Vec<BusCall> {
        self.trace.borrow().clone()
    }

    pub fn reset_trace(&self) {
        self.trace.borrow_mut().clear();
    }

    pub fn called(&self, call: BusCall) -> bool {
        self.trace.borrow().contains(&call)
    }

    pub fn count(&self, call: BusCall) -> usize {
        self.trace.borrow().iter().filter(|&&c| c == call).count()
    }

    fn record(&self, call: BusCall) {
        self.trace.borrow_mut().push(call);
    }
}

impl ScsiBus for Testbus {
    fn init(&self, mode: BusMode) -> Result<()> {
        self.record(BusCall::Init(mode));
        Ok(())
    }

    fn reset(&self) {
        self.record(BusCall::Reset);
    }

    fn acquire(&self) -> BusSignals {
        self.record(BusCall::Acquire);
        self.signals.get()
    }

    fn get_bsy(&self) -> bool {
        self.signals.get().bsy()
    }

    fn set_bsy(&self, val: bool) {
        self.record(BusCall::SetBsy(val));
    }

    fn get_sel(&self) -> bool {
        self.signals.get().sel()
    }

    fn set_sel(&self, val: bool) {
        self.record(BusCall::SetSel(val));
    }

    fn get_atn(&self) -> bool {
        self.signals.get().atn()
    }

    fn set_atn(&self, val: bool) {
        self.record(BusCall::SetAtn(val));
    }

    fn get_ack(&self) -> bool {
        self.signals.get().ack()
    }

    fn set_ack(&self, val: bool) {
        self.record(BusCall::SetAck(val));
    }

    fn get_rst(&self) -> bool {
        self.signals.get().rst()
    }

    fn set_rst(&self, val: bool) {
        self.record(BusCall::SetRst(val));
    }

    fn get_msg(&self) -> bool {
        self.signals.get().msg()
    }

    fn set_msg(&self, val: bool) {
        self.record(BusCall::SetMsg(val));
    }

    fn get_cd(&self) -> bool {
        self.signals.get().cd()
    }

    fn set_cd(&self, val: bool) {
        self.record(BusCall::SetCd(val));
    }

    fn get_io(&self) -> bool {
        self.signals.get().io()
    }

    fn set_io(&self, val: bool) {
        self.record(BusCall::SetIo(val));
    }

    fn get_req(&self) -> bool {
        self.signals.get().req()
    }

    fn set_req(&self, val: bool) {
        self.record(BusCall::SetReq(val));
    }

    fn get_dat(&self) -> u8 {
        self.signals.get().dat()
    }

    fn set_dat(&self, val: u8) {
        self.record(BusCall::SetDat(val));
    }

    fn command_handshake(&self, buf: &mut [u8]) -> usize {
        self.record(BusCall::CommandHandshake);
        let cmd = self.command.borrow();
        let len = cmd.len().min(buf.len());
        buf[..len].copy_from_slice(&cmd[..len]);
        len
    }

    fn send_handshake(&self, buf: &[u8]) -> usize {
        let len = self.send_limit.get().map_or(buf.len(), |l| l.min(buf.len()));
        self.record(BusCall::Send(buf.len()));
        self.sent.borrow_mut().extend_from_slice(&buf[..len]);
        len
    }

    fn receive_handshake(&self, buf: &mut [u8]) -> usize {
        self.record(BusCall::Receive(buf.len()));
        let mut queue = self.receive.borrow_mut();
        let mut count = 0;
        for b in buf.iter_mut() {
            let Some(v) = queue.pop_front() else {
                break;
            };
            *b = v;
            count += 1;
        }
        count
    }

    fn poll_select_event(&self, _timeout: Duration) -> bool {
        self.signals.get().sel()
    }
}
