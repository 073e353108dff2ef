//! Background producer that moves samples from the device FIFO to the ring.
//!
//! One thread per active scan. It polls the device status, pulls data in
//! bulk once enough has accumulated, converts it, and appends it to the
//! session ring. Failures never propagate out of the thread; they end up in
//! the shared flags and the log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::board::BoardSpec;
use crate::bus::DeviceLink;
use crate::calibration::{calibrate, ChannelCal};
use crate::errors::Result;
use crate::protocol::{CMD_AIN_SCAN_DATA, CMD_AIN_SCAN_STATUS, CMD_AIN_SCAN_STOP};
use crate::session::ScanShared;

const STATUS_TIMEOUT: Duration = Duration::from_millis(1);
const STATUS_RETRY: Duration = Duration::from_micros(20);
const DATA_TIMEOUT: Duration = Duration::from_millis(40);
const DATA_RETRY: Duration = Duration::from_micros(1);
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_millis(20);

const STATUS_RUNNING: u8 = 0x01;
const STATUS_HW_OVERRUN: u8 = 0x02;
const STATUS_TRIGGERED: u8 = 0x04;

/// Empty polls between reads above which the interval backs off.
const IDLE_POLLS_BEFORE_BACKOFF: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Starting,
    Polling,
    WaitingTrigger,
    Reading,
    Stopping,
    Stopped,
}

/// Device-side scan status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeviceStatus {
    pub running: bool,
    pub hw_overrun: bool,
    pub triggered: bool,
    /// Samples waiting in the device FIFO.
    pub available: usize,
    /// Samples the device can serve in one data request right now.
    pub max_readable: usize,
}

impl DeviceStatus {
    pub fn parse(reply: &[u8], count_bytes: usize) -> Self {
        let field = |index: usize| {
            let start = 1 + index * count_bytes;
            reply[start..start + count_bytes]
                .iter()
                .rev()
                .fold(0usize, |acc, &b| (acc << 8) | usize::from(b))
        };
        let flags = reply[0];
        Self {
            running: flags & STATUS_RUNNING != 0,
            hw_overrun: flags & STATUS_HW_OVERRUN != 0,
            triggered: flags & STATUS_TRIGGERED != 0,
            available: field(0),
            max_readable: field(1),
        }
    }
}

pub(crate) struct ScanWorker {
    pub link: DeviceLink,
    pub spec: BoardSpec,
    pub cals: Vec<ChannelCal>,
    pub calibrate: bool,
    pub scale: bool,
    pub read_threshold: usize,
    pub shared: Arc<Mutex<ScanShared>>,
    pub stop: Arc<AtomicBool>,
    pub poll_min: Duration,
    pub poll_max: Duration,
    pub trigger_poll: Duration,
    /// Channel the next sample belongs to.
    pub cursor: usize,
}

impl ScanWorker {
    pub fn run(mut self, started: Sender<()>) {
        let address = self.link.address();
        let mut state = ThreadState::Starting;
        self.shared.lock().thread_running = true;
        // scan_start only waits for the signal; a closed receiver is harmless
        let _ = started.send(());
        debug!("scan thread on address {address} started");

        let mut interval = self.poll_min;
        let mut idle_polls: u32 = 0;
        let mut device_running = true;

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let status = match self.query_status() {
                Ok(status) => status,
                Err(e) => {
                    warn!("scan status on address {address}: {e}");
                    thread::sleep(interval);
                    continue;
                }
            };
            device_running = status.running;

            if status.hw_overrun {
                warn!("hardware overrun on address {address}");
                let mut shared = self.shared.lock();
                shared.hw_overrun = true;
                shared.running = false;
                break;
            }

            if !status.triggered {
                if !status.running {
                    // stopped before the trigger ever fired
                    break;
                }
                transition(&mut state, ThreadState::WaitingTrigger, address);
                interval = self.trigger_poll;
                thread::sleep(interval);
                continue;
            }
            self.shared.lock().triggered = true;

            let wanted = !status.running
                || status.available >= self.read_threshold
                || status.available > status.max_readable;
            if !wanted {
                transition(&mut state, ThreadState::Polling, address);
                idle_polls += 1;
                thread::sleep(interval);
                continue;
            }

            let mut count = status
                .available
                .min(status.max_readable)
                .min(self.spec.max_samples_per_read);
            count = count.min(self.shared.lock().ring.contiguous_write_space());

            if count > 0 {
                transition(&mut state, ThreadState::Reading, address);
                match self.read_block(count) {
                    Ok(samples) => {
                        let mut shared = self.shared.lock();
                        if let Err(overrun) = shared.ring.write(&samples) {
                            warn!("address {address}: {overrun}");
                            shared.buffer_overrun = true;
                            shared.running = false;
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("scan data on address {address}: {e}");
                        thread::sleep(interval);
                        continue;
                    }
                }

                if idle_polls > IDLE_POLLS_BEFORE_BACKOFF {
                    interval = (interval * 2).min(self.poll_max);
                } else if idle_polls == 0 {
                    interval = (interval / 2).max(self.poll_min);
                }
                idle_polls = 0;
            }

            if !status.running && count == status.available {
                debug!("address {address}: device finished, all samples read");
                break;
            }
            thread::sleep(interval);
        }

        transition(&mut state, ThreadState::Stopping, address);
        if device_running {
            if let Err(e) = self
                .link
                .command(CMD_AIN_SCAN_STOP, &[], 0, STOP_TIMEOUT, Duration::ZERO)
            {
                warn!("stopping scan on address {address}: {e}");
            }
        }

        {
            let mut shared = self.shared.lock();
            shared.running = false;
            shared.thread_running = false;
        }
        transition(&mut state, ThreadState::Stopped, address);
    }

    fn query_status(&self) -> Result<DeviceStatus> {
        let reply = self.link.command(
            CMD_AIN_SCAN_STATUS,
            &[],
            self.spec.status_reply_len(),
            STATUS_TIMEOUT,
            STATUS_RETRY,
        )?;
        Ok(DeviceStatus::parse(&reply, self.spec.status_count_bytes))
    }

    /// Fetch `count` samples and convert them in channel order.
    fn read_block(&mut self, count: usize) -> Result<Vec<f64>> {
        let width = self.spec.format.bytes as usize;
        let raw = self.link.command(
            CMD_AIN_SCAN_DATA,
            &(count as u16).to_le_bytes(),
            count * width,
            DATA_TIMEOUT,
            DATA_RETRY,
        )?;

        let mut samples = Vec::with_capacity(count);
        for chunk in raw.chunks_exact(width) {
            let code = self.spec.format.decode(chunk);
            let cal = &self.cals[self.cursor];
            samples.push(calibrate(code, cal, self.calibrate, self.scale));
            self.cursor = (self.cursor + 1) % self.cals.len();
        }
        Ok(samples)
    }
}

fn transition(state: &mut ThreadState, next: ThreadState, address: u8) {
    if *state != next {
        trace!("scan thread {address}: {state:?} -> {next:?}");
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_byte_counts() {
        let status = DeviceStatus::parse(&[0x05, 0x10, 0x02, 0x00, 0x02], 2);
        assert_eq!(
            status,
            DeviceStatus {
                running: true,
                hw_overrun: false,
                triggered: true,
                available: 0x210,
                max_readable: 0x200,
            }
        );
    }

    #[test]
    fn parses_three_byte_counts() {
        let status = DeviceStatus::parse(&[0x02, 0x01, 0x00, 0x01, 0xFD, 0x07, 0x00], 3);
        assert!(status.hw_overrun);
        assert!(!status.running);
        assert_eq!(status.available, 0x010001);
        assert_eq!(status.max_readable, 0x07FD);
    }
}
