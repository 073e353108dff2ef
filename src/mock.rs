//! In-memory HAT that speaks the wire protocol.
//!
//! [`MockHat`] plugs into a [`BusLock`](crate::bus::BusLock) as the bus device
//! and answers request frames the way the firmware does. A cloned
//! [`MockControl`] lets the caller play the analog side: fill the FIFO, fire
//! the trigger, force an overrun. Sample codes count up from 0 so tests can
//! check ordering.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::board::{BoardSpec, ClockSource};
use crate::bus::BusDevice;
use crate::protocol::{
    encode_reply, CMD_AIN_CLOCK_CONFIG_R, CMD_AIN_CLOCK_CONFIG_W, CMD_AIN_SCAN_DATA,
    CMD_AIN_SCAN_START, CMD_AIN_SCAN_STATUS, CMD_AIN_SCAN_STOP, CMD_ID, CMD_TRIGGER_CONFIG_W,
    MSG_START, TX_HEADER_SIZE,
};

const RES_SUCCESS: u8 = 0x00;
const RES_BAD_PROTOCOL: u8 = 0x01;
const RES_BAD_PARAMETER: u8 = 0x02;
const RES_BUSY: u8 = 0x03;

const DEFAULT_FIRMWARE: u16 = 0x0107;
const DEFAULT_FIFO: usize = 1 << 20;

#[derive(Debug)]
struct MockState {
    spec: BoardSpec,
    id: u16,
    firmware: u16,

    running: bool,
    triggered: bool,
    hw_overrun: bool,
    channels: usize,
    /// Samples still to produce in a finite scan.
    remaining: Option<usize>,
    fifo: VecDeque<i64>,
    fifo_capacity: usize,
    next_code: i64,
    max_read: usize,
    /// Samples per channel produced on every status poll.
    auto_per_poll: usize,

    synced: bool,
    clock_source: u8,
    clock_divisor: u16,
    trigger_config: Option<u8>,
    last_start: Vec<u8>,

    reply_latency: u32,
    fail_io: bool,
    forced_status: Option<u8>,
    opcodes: Vec<u8>,
}

impl MockState {
    fn new(spec: BoardSpec) -> Self {
        Self {
            spec,
            id: spec.id,
            firmware: DEFAULT_FIRMWARE,
            running: false,
            triggered: false,
            hw_overrun: false,
            channels: 0,
            remaining: None,
            fifo: VecDeque::new(),
            fifo_capacity: DEFAULT_FIFO,
            next_code: 0,
            max_read: spec.max_samples_per_read,
            auto_per_poll: 0,
            synced: true,
            clock_source: ClockSource::Local as u8,
            clock_divisor: 1,
            trigger_config: None,
            last_start: Vec::new(),
            reply_latency: 0,
            fail_io: false,
            forced_status: None,
            opcodes: Vec::new(),
        }
    }

    fn produce(&mut self, per_channel: usize) -> usize {
        if !self.running || !self.triggered {
            return 0;
        }
        let mut count = per_channel * self.channels;
        if let Some(left) = self.remaining {
            count = count.min(left);
            self.remaining = Some(left - count);
        }
        let span = self.spec.format.max_code() + 1;
        for produced in 0..count {
            if self.fifo.len() >= self.fifo_capacity {
                self.hw_overrun = true;
                self.running = false;
                return produced;
            }
            self.fifo.push_back(self.next_code % span);
            self.next_code += 1;
        }
        if self.remaining == Some(0) {
            self.running = false;
        }
        count
    }

    fn handle(&mut self, opcode: u8, payload: &[u8]) -> Vec<u8> {
        self.opcodes.push(opcode);
        let (status, data) = self.execute(opcode, payload);
        let status = self.forced_status.take().unwrap_or(status);
        encode_reply(opcode, status, &data)
    }

    fn execute(&mut self, opcode: u8, payload: &[u8]) -> (u8, Vec<u8>) {
        match opcode {
            CMD_ID => {
                let mut data = self.id.to_le_bytes().to_vec();
                data.extend_from_slice(&self.firmware.to_le_bytes());
                (RES_SUCCESS, data)
            }
            CMD_AIN_SCAN_START => {
                if self.running {
                    return (RES_BUSY, Vec::new());
                }
                let Some(start) = self.spec.decode_start(payload) else {
                    return (RES_BAD_PARAMETER, Vec::new());
                };
                self.channels = start.channels as usize;
                self.remaining =
                    (start.scan_count > 0).then(|| start.scan_count as usize * self.channels);
                self.running = true;
                self.triggered = !start.ext_trigger;
                self.hw_overrun = false;
                self.fifo.clear();
                self.last_start = payload.to_vec();
                (RES_SUCCESS, Vec::new())
            }
            CMD_AIN_SCAN_STOP => {
                self.running = false;
                (RES_SUCCESS, Vec::new())
            }
            CMD_AIN_SCAN_STATUS => {
                if self.auto_per_poll > 0 {
                    self.produce(self.auto_per_poll);
                }
                let flags = u8::from(self.running)
                    | u8::from(self.hw_overrun) << 1
                    | u8::from(self.triggered) << 2;
                let width = self.spec.status_count_bytes;
                let mut data = vec![flags];
                for count in [self.fifo.len(), self.fifo.len().min(self.max_read)] {
                    data.extend_from_slice(&count.to_le_bytes()[..width]);
                }
                (RES_SUCCESS, data)
            }
            CMD_AIN_SCAN_DATA => {
                let Some(raw) = payload.get(0..2) else {
                    return (RES_BAD_PARAMETER, Vec::new());
                };
                let count = u16::from_le_bytes([raw[0], raw[1]]) as usize;
                if count > self.fifo.len() || count > self.max_read {
                    return (RES_BAD_PARAMETER, Vec::new());
                }
                let width = self.spec.format.bytes as usize;
                let mut data = vec![0u8; count * width];
                for slot in data.chunks_exact_mut(width) {
                    let code = self.fifo.pop_front().unwrap_or(0);
                    self.spec.format.encode(code, slot);
                }
                (RES_SUCCESS, data)
            }
            CMD_AIN_CLOCK_CONFIG_R if self.spec.is_synced() => {
                let flags = self.clock_source | if self.synced { 0x80 } else { 0x00 };
                (RES_SUCCESS, vec![flags, (self.clock_divisor - 1) as u8])
            }
            CMD_AIN_CLOCK_CONFIG_W if self.spec.is_synced() => {
                if self.running {
                    return (RES_BUSY, Vec::new());
                }
                match payload {
                    &[source, divisor] if source <= ClockSource::Slave as u8 => {
                        self.clock_source = source;
                        self.clock_divisor = u16::from(divisor) + 1;
                        (RES_SUCCESS, Vec::new())
                    }
                    _ => (RES_BAD_PARAMETER, Vec::new()),
                }
            }
            CMD_TRIGGER_CONFIG_W if self.spec.is_synced() => {
                self.trigger_config = payload.first().copied();
                (RES_SUCCESS, Vec::new())
            }
            _ => (RES_BAD_PROTOCOL, Vec::new()),
        }
    }
}

/// Simulated board, used as the bus device.
pub struct MockHat {
    state: Arc<Mutex<MockState>>,
    reply: Vec<u8>,
    cursor: usize,
    idle_reads: u32,
}

impl MockHat {
    pub fn new(spec: BoardSpec) -> (MockHat, MockControl) {
        let state = Arc::new(Mutex::new(MockState::new(spec)));
        let hat = MockHat {
            state: Arc::clone(&state),
            reply: Vec::new(),
            cursor: 0,
            idle_reads: 0,
        };
        (hat, MockControl { state })
    }
}

impl BusDevice for MockHat {
    fn send(&mut self, tx: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_io {
            return Err(io::Error::other("simulated bus failure"));
        }
        self.reply.clear();
        self.cursor = 0;
        if tx.len() < TX_HEADER_SIZE || tx[0] != MSG_START {
            // not a request; the device stays silent
            return Ok(());
        }
        let len = u16::from_le_bytes([tx[2], tx[3]]) as usize;
        let Some(payload) = tx.get(TX_HEADER_SIZE..TX_HEADER_SIZE + len) else {
            return Ok(());
        };
        trace!("mock rx opcode {:#04x}", tx[1]);
        self.reply = state.handle(tx[1], payload);
        self.idle_reads = state.reply_latency;
        Ok(())
    }

    fn receive(&mut self, rx: &mut [u8]) -> io::Result<()> {
        if self.state.lock().fail_io {
            return Err(io::Error::other("simulated bus failure"));
        }
        if self.idle_reads > 0 {
            self.idle_reads -= 1;
            rx.fill(0);
            return Ok(());
        }
        for byte in rx.iter_mut() {
            *byte = self.reply.get(self.cursor).copied().unwrap_or(0);
            self.cursor = (self.cursor + 1).min(self.reply.len());
        }
        Ok(())
    }
}

/// Test-side handle onto a [`MockHat`].
#[derive(Clone)]
pub struct MockControl {
    state: Arc<Mutex<MockState>>,
}

impl MockControl {
    /// Convert `per_channel` scans into the device FIFO. Returns the number
    /// of samples added.
    pub fn produce(&self, per_channel: usize) -> usize {
        self.state.lock().produce(per_channel)
    }

    /// Produce `per_channel` scans on every status poll.
    pub fn set_auto_produce(&self, per_channel: usize) {
        self.state.lock().auto_per_poll = per_channel;
    }

    pub fn fire_trigger(&self) {
        self.state.lock().triggered = true;
    }

    pub fn set_hw_overrun(&self) {
        let mut state = self.state.lock();
        state.hw_overrun = true;
        state.running = false;
    }

    pub fn set_fifo_capacity(&self, samples: usize) {
        self.state.lock().fifo_capacity = samples;
    }

    pub fn set_max_read(&self, samples: usize) {
        self.state.lock().max_read = samples;
    }

    pub fn set_id(&self, id: u16) {
        self.state.lock().id = id;
    }

    pub fn set_synced(&self, synced: bool) {
        self.state.lock().synced = synced;
    }

    /// Shared-clock divisor, 1..=256.
    pub fn set_clock_divisor(&self, divisor: u16) {
        self.state.lock().clock_divisor = divisor.clamp(1, 256);
    }

    /// Idle bytes answered before each reply.
    pub fn set_reply_latency(&self, reads: u32) {
        self.state.lock().reply_latency = reads;
    }

    pub fn set_fail_io(&self, fail: bool) {
        self.state.lock().fail_io = fail;
    }

    /// Answer the next request with `status` regardless of outcome.
    pub fn force_next_status(&self, status: u8) {
        self.state.lock().forced_status = Some(status);
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn fifo_len(&self) -> usize {
        self.state.lock().fifo.len()
    }

    pub fn trigger_config(&self) -> Option<u8> {
        self.state.lock().trigger_config
    }

    /// Shared-clock source and divisor as last configured.
    pub fn clock_config(&self) -> (u8, u16) {
        let state = self.state.lock();
        (state.clock_source, state.clock_divisor)
    }

    /// Payload of the most recent accepted start command.
    pub fn last_start(&self) -> Vec<u8> {
        self.state.lock().last_start.clone()
    }

    /// Opcodes received so far, in order.
    pub fn opcodes(&self) -> Vec<u8> {
        self.state.lock().opcodes.clone()
    }

    pub fn count_opcode(&self, opcode: u8) -> usize {
        self.state.lock().opcodes.iter().filter(|&&op| op == opcode).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{InputMode, StartRequest, TriggerMode};
    use crate::bus::transact;
    use crate::errors::HatError;
    use std::time::Duration;

    const T: Duration = Duration::from_millis(50);

    fn start(hat: &mut MockHat, spec: &BoardSpec, count: u32, trigger: bool) {
        let req = StartRequest {
            scan_count: count,
            channels: vec![0, 1],
            rate: 1000.0,
            ext_clock: false,
            trigger: trigger.then_some(TriggerMode::RisingEdge),
            range: 0,
            input_mode: InputMode::SingleEnded,
        };
        transact(hat, CMD_AIN_SCAN_START, &spec.start_payload(&req), 0, T, Duration::ZERO)
            .unwrap();
    }

    #[test]
    fn identifies_as_its_board() {
        let (mut hat, _) = MockHat::new(BoardSpec::MCC172);
        let id = transact(&mut hat, CMD_ID, &[], 4, T, Duration::ZERO).unwrap();
        assert_eq!(id, vec![0x45, 0x01, 0x07, 0x01]);
    }

    #[test]
    fn finite_scan_stops_after_count() {
        let spec = BoardSpec::MCC118;
        let (mut hat, control) = MockHat::new(spec);
        start(&mut hat, &spec, 10, false);
        assert_eq!(control.produce(4), 8);
        assert_eq!(control.produce(100), 12);
        assert!(!control.is_running());
        assert_eq!(control.fifo_len(), 20);
    }

    #[test]
    fn data_comes_out_in_production_order() {
        let spec = BoardSpec::MCC128;
        let (mut hat, control) = MockHat::new(spec);
        start(&mut hat, &spec, 0, false);
        control.produce(3);
        let raw = transact(&mut hat, CMD_AIN_SCAN_DATA, &4u16.to_le_bytes(), 8, T, Duration::ZERO)
            .unwrap();
        let codes: Vec<i64> = raw.chunks_exact(2).map(|c| spec.format.decode(c)).collect();
        assert_eq!(codes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn waits_for_trigger_before_producing() {
        let spec = BoardSpec::MCC118;
        let (mut hat, control) = MockHat::new(spec);
        start(&mut hat, &spec, 0, true);
        assert_eq!(control.produce(5), 0);
        control.fire_trigger();
        assert_eq!(control.produce(5), 10);
    }

    #[test]
    fn full_fifo_overruns() {
        let spec = BoardSpec::MCC118;
        let (mut hat, control) = MockHat::new(spec);
        control.set_fifo_capacity(6);
        start(&mut hat, &spec, 0, false);
        control.produce(5);
        let status = transact(&mut hat, CMD_AIN_SCAN_STATUS, &[], 5, T, Duration::ZERO).unwrap();
        assert_eq!(status[0] & 0x03, 0x02);
    }

    #[test]
    fn oversized_data_request_is_rejected() {
        let spec = BoardSpec::MCC118;
        let (mut hat, _) = MockHat::new(spec);
        let err = transact(&mut hat, CMD_AIN_SCAN_DATA, &8u16.to_le_bytes(), 16, T, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, HatError::BadParameter(_)));
    }

    #[test]
    fn latency_is_absorbed_by_polling() {
        let (mut hat, control) = MockHat::new(BoardSpec::MCC118);
        control.set_reply_latency(25);
        assert!(transact(&mut hat, CMD_ID, &[], 4, T, Duration::ZERO).is_ok());
    }

    #[test]
    fn clock_config_write_sets_the_divisor() {
        let (mut hat, control) = MockHat::new(BoardSpec::MCC172);
        transact(&mut hat, CMD_AIN_CLOCK_CONFIG_W, &[1, 4], 0, T, Duration::ZERO).unwrap();
        assert_eq!(control.clock_config(), (1, 5));
        let reply = transact(&mut hat, CMD_AIN_CLOCK_CONFIG_R, &[], 2, T, Duration::ZERO).unwrap();
        assert_eq!(reply, vec![0x81, 4]);
        let err = transact(&mut hat, CMD_AIN_CLOCK_CONFIG_W, &[3, 0], 0, T, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, HatError::BadParameter(_)));
    }

    #[test]
    fn unknown_opcode_is_undefined() {
        let (mut hat, _) = MockHat::new(BoardSpec::MCC118);
        let err = transact(&mut hat, CMD_AIN_CLOCK_CONFIG_R, &[], 2, T, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, HatError::Undefined(0x01)));
    }
}
