//! Linux spidev backend.
//!
//! Talks to `/dev/spidevB.C` with `SPI_IOC_MESSAGE(1)` ioctls. Other board
//! libraries share the bus and may leave it in a different mode, so the mode
//! is checked before every transaction.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::debug;

use crate::bus::BusDevice;
use crate::errors::Result;

// ============================================================================
// ioctl encoding (linux/spi/spidev.h)
// ============================================================================

const SPI_IOC_MAGIC: u32 = b'k' as u32;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: u32) -> u32 {
    (dir << 30) | (size << 16) | (SPI_IOC_MAGIC << 8) | nr
}

const SPI_IOC_RD_MODE: u32 = ioc(IOC_READ, 1, 1);
const SPI_IOC_WR_MODE: u32 = ioc(IOC_WRITE, 1, 1);
const SPI_IOC_WR_BITS_PER_WORD: u32 = ioc(IOC_WRITE, 3, 1);
const SPI_IOC_MESSAGE_1: u32 = ioc(IOC_WRITE, 0, mem::size_of::<SpiIocTransfer>() as u32);

/// CPOL=0, CPHA=1
const SPI_MODE_1: u8 = 0x01;
const BITS_PER_WORD: u8 = 8;
const DEFAULT_SPEED_HZ: u32 = 9_600_000;

/// Clocked out while reading a reply.
const IDLE_BYTE: u8 = 0xFF;

#[repr(C)]
#[derive(Debug, Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

// ============================================================================
// Backend
// ============================================================================

pub struct SpidevBus {
    file: File,
    speed_hz: u32,
    scratch: Vec<u8>,
}

impl SpidevBus {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        let mut bus = Self {
            file,
            speed_hz: DEFAULT_SPEED_HZ,
            scratch: Vec::new(),
        };
        bus.write_u8(SPI_IOC_WR_BITS_PER_WORD, BITS_PER_WORD)?;
        bus.prepare()?;
        debug!("opened {}", path.display());
        Ok(bus)
    }

    fn read_u8(&self, request: u32) -> io::Result<u8> {
        let mut value: u8 = 0;
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, &mut value as *mut u8) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }

    fn write_u8(&self, request: u32, value: u8) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, &value as *const u8) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Full-duplex transfer of `tx.len()` bytes.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(tx.len(), rx.len());
        let xfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz: self.speed_hz,
            bits_per_word: BITS_PER_WORD,
            ..Default::default()
        };
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                SPI_IOC_MESSAGE_1 as _,
                &xfer as *const SpiIocTransfer,
            )
        };
        if ret < 1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl BusDevice for SpidevBus {
    fn prepare(&mut self) -> io::Result<()> {
        if self.read_u8(SPI_IOC_RD_MODE)? != SPI_MODE_1 {
            self.write_u8(SPI_IOC_WR_MODE, SPI_MODE_1)?;
        }
        Ok(())
    }

    fn set_speed(&mut self, hz: u32) {
        self.speed_hz = hz;
    }

    fn send(&mut self, tx: &[u8]) -> io::Result<()> {
        let mut sink = mem::take(&mut self.scratch);
        sink.clear();
        sink.resize(tx.len(), 0);
        let result = self.transfer(tx, &mut sink);
        self.scratch = sink;
        result
    }

    fn receive(&mut self, rx: &mut [u8]) -> io::Result<()> {
        let mut idle = mem::take(&mut self.scratch);
        fill_idle(&mut idle, rx.len());
        let result = self.transfer(&idle, rx);
        self.scratch = idle;
        result
    }
}

fn fill_idle(buf: &mut Vec<u8>, len: usize) {
    buf.clear();
    buf.resize(len, IDLE_BYTE);
}
