//! Shared-bus access: arbitration and the command/reply transaction.
//!
//! Every HAT on the stack shares one SPI bus, and other processes may be
//! driving other HATs at the same time. A transaction is only legal while a
//! [`BusToken`] is held: the token owns the in-process mutex guard around the
//! bus device, the cross-process file lock, and the address selection.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::errors::{HatError, Result};
use crate::protocol::{self, MAX_SPI_TRANSFER, RX_HEADER_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// Interval between attempts on the cross-process lock.
const PROCESS_LOCK_RETRY: Duration = Duration::from_micros(10);

/// Number of HAT addresses the stack can select.
pub const MAX_ADDRESSES: u8 = 8;

// ============================================================================
// Backend Traits
// ============================================================================

/// Raw byte channel to the selected device.
///
/// `send` clocks a request out; `receive` clocks `rx.len()` bytes in while
/// sending idle bytes.
pub trait BusDevice: Send {
    /// Called once per transaction before the request is sent.
    fn prepare(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Clock rate for subsequent transfers. Boards differ in what they accept.
    fn set_speed(&mut self, _hz: u32) {}

    fn send(&mut self, tx: &[u8]) -> io::Result<()>;

    fn receive(&mut self, rx: &mut [u8]) -> io::Result<()>;
}

/// Mutual exclusion with other processes on the same bus.
pub trait ProcessLock: Send + Sync {
    /// Non-blocking attempt. `Ok(false)` means another holder has it.
    fn try_lock(&self) -> Result<bool>;

    fn unlock(&self) -> Result<()>;
}

/// Drives the board address lines.
pub trait AddressSelect: Send + Sync {
    fn select(&self, address: u8) -> Result<()>;

    fn release(&self) {}
}

/// For buses no other process touches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProcessLock;

impl ProcessLock for NoProcessLock {
    fn try_lock(&self) -> Result<bool> {
        Ok(true)
    }

    fn unlock(&self) -> Result<()> {
        Ok(())
    }
}

/// For a single board, or a simulated bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAddressLines;

impl AddressSelect for NoAddressLines {
    fn select(&self, _address: u8) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// File Lock
// ============================================================================

/// Advisory `flock` on a well-known file.
///
/// Each `FileLock` holds its own open file description, so two instances on
/// the same path exclude each other even inside one process.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Open or create the lock file, readable and writable by every user.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;

        // umask strips group/other write on creation
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
            debug!("could not widen permissions on {}: {e}", path.display());
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProcessLock for FileLock {
    fn try_lock(&self) -> Result<bool> {
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
            _ => Err(err.into()),
        }
    }

    fn unlock(&self) -> Result<()> {
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

// ============================================================================
// Bus Lock
// ============================================================================

/// Arbitrates one shared bus between threads and processes.
pub struct BusLock {
    device: Mutex<Box<dyn BusDevice>>,
    process: Box<dyn ProcessLock>,
    address: Box<dyn AddressSelect>,
    timeout: Duration,
}

impl BusLock {
    pub fn new(
        device: impl BusDevice + 'static,
        process: impl ProcessLock + 'static,
        address: impl AddressSelect + 'static,
        timeout: Duration,
    ) -> Self {
        Self {
            device: Mutex::new(Box::new(device)),
            process: Box::new(process),
            address: Box::new(address),
            timeout,
        }
    }

    /// Bus shared only by threads of this process, with no address lines.
    pub fn in_process(device: impl BusDevice + 'static, timeout: Duration) -> Self {
        Self::new(device, NoProcessLock, NoAddressLines, timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Take exclusive use of the bus and select `address`.
    ///
    /// Both lock layers share one deadline; missing it is `LockTimeout`.
    pub fn acquire(&self, address: u8) -> Result<BusToken<'_>> {
        if address >= MAX_ADDRESSES {
            return Err(HatError::bad_param(format!("address {address} out of range")));
        }
        let deadline = Instant::now() + self.timeout;

        let Some(device) = self.device.try_lock_for(self.timeout) else {
            warn!("bus mutex not acquired within {:?}", self.timeout);
            return Err(HatError::LockTimeout);
        };

        loop {
            if self.process.try_lock()? {
                break;
            }
            if Instant::now() >= deadline {
                warn!("process bus lock not acquired within {:?}", self.timeout);
                return Err(HatError::LockTimeout);
            }
            thread::sleep(PROCESS_LOCK_RETRY);
        }

        if let Err(e) = self.address.select(address) {
            if let Err(unlock) = self.process.unlock() {
                warn!("releasing process bus lock: {unlock}");
            }
            return Err(e);
        }

        Ok(BusToken {
            device,
            lock: self,
            address,
        })
    }

    /// Give the bus back. Equivalent to dropping the token.
    pub fn release(token: BusToken<'_>) {
        drop(token);
    }

    /// Acquire, run one transaction, release.
    pub fn transact(
        &self,
        address: u8,
        opcode: u8,
        payload: &[u8],
        reply_len: usize,
        reply_timeout: Duration,
        retry: Duration,
    ) -> Result<Vec<u8>> {
        let mut token = self.acquire(address)?;
        token.transact(opcode, payload, reply_len, reply_timeout, retry)
    }
}

/// Proof of exclusive bus ownership.
///
/// Dropping it releases the address lines, then the process lock, then the
/// in-process mutex.
pub struct BusToken<'a> {
    device: MutexGuard<'a, Box<dyn BusDevice>>,
    lock: &'a BusLock,
    address: u8,
}

impl BusToken<'_> {
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn set_speed(&mut self, hz: u32) {
        self.device.set_speed(hz);
    }

    pub fn transact(
        &mut self,
        opcode: u8,
        payload: &[u8],
        reply_len: usize,
        reply_timeout: Duration,
        retry: Duration,
    ) -> Result<Vec<u8>> {
        transact(
            self.device.as_mut(),
            opcode,
            payload,
            reply_len,
            reply_timeout,
            retry,
        )
    }
}

impl Drop for BusToken<'_> {
    fn drop(&mut self) {
        self.lock.address.release();
        if let Err(e) = self.lock.process.unlock() {
            warn!("releasing process bus lock: {e}");
        }
        // `device` guard drops after this body, releasing the mutex last
    }
}

/// One device's view of a shared bus: its address and clock rate.
#[derive(Clone)]
pub struct DeviceLink {
    bus: Arc<BusLock>,
    address: u8,
    speed_hz: u32,
}

impl DeviceLink {
    pub fn new(bus: Arc<BusLock>, address: u8, speed_hz: u32) -> Self {
        Self {
            bus,
            address,
            speed_hz,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Run one command under the bus lock.
    pub fn command(
        &self,
        opcode: u8,
        payload: &[u8],
        reply_len: usize,
        reply_timeout: Duration,
        retry: Duration,
    ) -> Result<Vec<u8>> {
        let mut token = self.bus.acquire(self.address)?;
        token.set_speed(self.speed_hz);
        token.transact(opcode, payload, reply_len, reply_timeout, retry)
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Send one command and collect its reply.
///
/// The device answers idle bytes (0x00) until the reply is ready, so the
/// first byte is polled until it is nonzero. The remainder is then clocked in
/// `reply_len + 5` bytes at a time until the parser sees a whole frame.
pub fn transact(
    bus: &mut dyn BusDevice,
    opcode: u8,
    payload: &[u8],
    reply_len: usize,
    reply_timeout: Duration,
    retry: Duration,
) -> Result<Vec<u8>> {
    let chunk = reply_len + RX_HEADER_SIZE;
    if chunk >= MAX_SPI_TRANSFER {
        return Err(HatError::bad_param(format!(
            "reply of {reply_len} bytes exceeds one transfer"
        )));
    }
    let frame = protocol::encode_request(opcode, payload)?;

    trace!("tx opcode {opcode:#04x}, {} payload bytes", payload.len());
    bus.prepare()?;
    bus.send(&frame)?;
    let started = Instant::now();
    pause(retry);

    let mut rx = vec![0u8; MAX_SPI_TRANSFER];
    loop {
        bus.receive(&mut rx[..1])?;
        if rx[0] != 0 {
            break;
        }
        if started.elapsed() > reply_timeout {
            trace!("opcode {opcode:#04x}: no reply within {reply_timeout:?}");
            return Err(HatError::Timeout);
        }
        pause(retry);
    }

    let mut filled = 1;
    let reply = loop {
        let end = (filled + chunk).min(MAX_SPI_TRANSFER);
        bus.receive(&mut rx[filled..end])?;
        filled = end;

        if let Some(reply) = protocol::parse_reply(&rx[..filled]) {
            break reply;
        }
        if started.elapsed() > reply_timeout || filled >= MAX_SPI_TRANSFER {
            trace!("opcode {opcode:#04x}: reply incomplete after {filled} bytes");
            return Err(HatError::Timeout);
        }
    };

    if reply.opcode(&rx) != opcode {
        return Err(HatError::bad_param(format!(
            "reply opcode {:#04x} does not match request {opcode:#04x}",
            reply.opcode(&rx)
        )));
    }
    protocol::check_status(reply.status(&rx))?;

    let data = reply.payload(&rx);
    if data.len() < reply_len {
        return Err(HatError::CommsFailure(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short reply: {} of {reply_len} bytes", data.len()),
        )));
    }
    trace!("rx opcode {opcode:#04x}, {} payload bytes", data.len());
    Ok(data[..reply_len].to_vec())
}

fn pause(interval: Duration) {
    if !interval.is_zero() {
        thread::sleep(interval);
    }
}
