//! Scan options, status flags and the state shared with the scan thread.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::ring::RingBuffer;

bitflags! {
    /// Scan start options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ScanOptions: u32 {
        /// Return calibrated codes instead of volts.
        const NO_SCALE_DATA = 0x01;
        /// Skip the calibration coefficients.
        const NO_CALIBRATE_DATA = 0x02;
        /// Pace conversions from the external clock input.
        const EXT_CLOCK = 0x04;
        /// Hold the scan until the trigger input fires.
        const EXT_TRIGGER = 0x08;
        /// Run until stopped; `samples_per_channel` only sizes the buffer.
        const CONTINUOUS = 0x10;
    }
}

bitflags! {
    /// Scan status reported by `scan_status` and `scan_read`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ScanStatus: u16 {
        /// The device FIFO overflowed.
        const HW_OVERRUN = 0x0001;
        /// The host buffer filled before it was read.
        const BUFFER_OVERRUN = 0x0002;
        const TRIGGERED = 0x0004;
        const RUNNING = 0x0008;
    }
}

impl ScanStatus {
    pub fn is_overrun(&self) -> bool {
        self.intersects(ScanStatus::HW_OVERRUN | ScanStatus::BUFFER_OVERRUN)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("IDLE");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

/// State touched by both the scan thread and callers, behind one mutex.
#[derive(Debug)]
pub(crate) struct ScanShared {
    pub ring: RingBuffer,
    pub running: bool,
    pub triggered: bool,
    pub hw_overrun: bool,
    pub buffer_overrun: bool,
    pub thread_running: bool,
}

impl ScanShared {
    pub fn new(ring: RingBuffer) -> Self {
        Self {
            ring,
            running: true,
            triggered: false,
            hw_overrun: false,
            buffer_overrun: false,
            thread_running: false,
        }
    }

    pub fn status(&self) -> ScanStatus {
        let mut status = ScanStatus::empty();
        status.set(ScanStatus::HW_OVERRUN, self.hw_overrun);
        status.set(ScanStatus::BUFFER_OVERRUN, self.buffer_overrun);
        status.set(ScanStatus::TRIGGERED, self.triggered);
        status.set(ScanStatus::RUNNING, self.running);
        status
    }
}

/// One active scan on one device.
pub(crate) struct ScanSession {
    pub channels: Vec<u8>,
    pub options: ScanOptions,
    /// Samples per channel the ring holds.
    pub capacity: usize,
    pub actual_rate: f64,
    pub shared: Arc<Mutex<ScanShared>>,
    pub stop: Arc<AtomicBool>,
    pub thread: Option<JoinHandle<()>>,
}

impl ScanSession {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Round `count` down to whole scans of `channels`.
pub(crate) fn normalize(count: usize, channels: usize) -> usize {
    if channels == 0 {
        return 0;
    }
    count - count % channels
}

/// Snapshot returned by `scan_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStatusInfo {
    pub status: ScanStatus,
    pub samples_available: usize,
}

/// Outcome of a `scan_read` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRead {
    pub status: ScanStatus,
    /// Samples per channel copied into the destination.
    pub samples_per_channel: usize,
    /// The deadline passed before the request was met.
    pub timed_out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_bits_match_the_library() {
        assert_eq!(ScanOptions::NO_SCALE_DATA.bits(), 0x01);
        assert_eq!(ScanOptions::NO_CALIBRATE_DATA.bits(), 0x02);
        assert_eq!(ScanOptions::EXT_CLOCK.bits(), 0x04);
        assert_eq!(ScanOptions::EXT_TRIGGER.bits(), 0x08);
        assert_eq!(ScanOptions::CONTINUOUS.bits(), 0x10);
        assert_eq!(ScanOptions::default(), ScanOptions::empty());
    }

    #[test]
    fn status_display_lists_flags() {
        assert_eq!(ScanStatus::empty().to_string(), "IDLE");
        assert_eq!(
            (ScanStatus::RUNNING | ScanStatus::TRIGGERED).to_string(),
            "TRIGGERED | RUNNING"
        );
        assert_eq!(ScanStatus::BUFFER_OVERRUN.to_string(), "BUFFER_OVERRUN");
    }

    #[test]
    fn shared_flags_snapshot() {
        let mut shared = ScanShared::new(RingBuffer::try_new(4).unwrap());
        assert_eq!(shared.status(), ScanStatus::RUNNING);
        shared.triggered = true;
        shared.buffer_overrun = true;
        shared.running = false;
        let status = shared.status();
        assert!(status.is_overrun());
        assert!(status.contains(ScanStatus::TRIGGERED));
        assert!(!status.contains(ScanStatus::RUNNING));
    }

    #[test]
    fn normalize_rounds_down_to_whole_scans() {
        assert_eq!(normalize(7, 3), 6);
        assert_eq!(normalize(2, 3), 0);
        assert_eq!(normalize(9, 1), 9);
        assert_eq!(normalize(5, 0), 0);
    }
}
