//! Hardware-paced scan engine for SPI-attached measurement HATs, with
//! optional Python bindings (feature `python`).
//!
//! Up to eight boards share one SPI bus. Each open board runs at most one
//! scan: the device paces conversions into its FIFO, a background thread
//! drains that FIFO into a host ring buffer, and callers read calibrated,
//! scaled samples out of the ring.
//!
//! # Layers
//!
//! 1. [`protocol`] frames requests and parses replies.
//! 2. [`bus`] serializes access across threads and processes and runs one
//!    command/reply transaction. [`spidev`] is the Linux backend; the
//!    `mock` module (feature `mock`) is an in-memory board.
//! 3. [`hat`] opens boards and runs scans on top of [`board`] descriptions,
//!    the [`calibration`] pipeline and the [`ring`] buffer.
//!
//! # Timing
//!
//! Samples carry no timestamps. The scan rate is fixed by the device clock,
//! so sample `i` of a channel was taken at `start + i / scan_sample_rate()`.
//! Overruns are reported in the status flags and end the scan; data up to
//! that point stays readable.

pub mod board;
pub mod bus;
pub mod calibration;
pub mod config;
pub mod errors;
pub mod hat;
pub mod logging;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod protocol;
pub mod ring;
mod scan_thread;
mod session;
pub mod spidev;

#[cfg(feature = "python")]
mod python;

pub use board::{
    BoardSpec, CalibrationTable, ClockSource, DeviceInfo, InputMode, InputRange, TriggerMode,
};
pub use bus::{AddressSelect, BusDevice, BusLock, FileLock, ProcessLock};
pub use config::EngineConfig;
pub use errors::{HatError, Result};
pub use hat::{ClockConfig, Hat, HatContext};
pub use session::{ScanOptions, ScanRead, ScanStatus, ScanStatusInfo};
