//! Device handles and the scan controller.
//!
//! A [`HatContext`] owns the shared bus and the registry of open boards. Each
//! open board is a [`Hat`], shared as `Arc<Hat>`, which runs at most one scan
//! at a time.
//!
//! # Example
//! ```ignore
//! let ctx = HatContext::with_spi(EngineConfig::from_env(), my_gpio_lines)?;
//! let hat = ctx.open(0, device_info)?;
//!
//! hat.scan_start(0b11, 0, 1000.0, ScanOptions::CONTINUOUS)?;
//! let mut buf = vec![0.0; 2000];
//! let read = hat.scan_read(1000, 2.0, &mut buf)?;
//! println!("{} per channel, status {}", read.samples_per_channel, read.status);
//! hat.scan_stop()?;
//! hat.scan_cleanup()?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::board::{
    channels_from_mask, clock_divisor, BoardSpec, CalibrationLayout, CalibrationTable,
    ClockModel, ClockSource, DeviceInfo, InputMode, StartRequest, TriggerMode,
};
use crate::bus::{AddressSelect, BusLock, DeviceLink, FileLock, MAX_ADDRESSES};
use crate::calibration::{lsb_size, ChannelCal, ScaleMode};
use crate::config::EngineConfig;
use crate::errors::{HatError, Result};
use crate::protocol::{
    CMD_AIN_CLOCK_CONFIG_R, CMD_AIN_CLOCK_CONFIG_W, CMD_AIN_SCAN_START, CMD_AIN_SCAN_STOP, CMD_ID,
    CMD_TRIGGER_CONFIG_W,
};
use crate::ring::RingBuffer;
use crate::scan_thread::{ScanWorker, STOP_TIMEOUT};
use crate::session::{normalize, ScanOptions, ScanRead, ScanSession, ScanShared, ScanStatusInfo};
use crate::spidev::SpidevBus;

// ============================================================================
// Constants
// ============================================================================

const ID_TIMEOUT: Duration = Duration::from_millis(20);
const ID_RETRY: Duration = Duration::from_micros(10);
const ID_ATTEMPTS: usize = 2;

const START_TIMEOUT: Duration = Duration::from_millis(20);
const CONFIG_TIMEOUT: Duration = Duration::from_millis(20);
const CLOCK_RETRY: Duration = Duration::from_micros(100);
const CLOCK_READ_RETRY: Duration = Duration::from_micros(10);
const SYNC_POLL: Duration = Duration::from_millis(1);

const CLOCK_SYNCED: u8 = 0x80;
const CLOCK_SOURCE_MASK: u8 = 0x03;

/// Shared-clock state of a synchronized-clock board.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockConfig {
    pub source: ClockSource,
    /// Per-channel rate the clock runs at.
    pub sample_rate: f64,
    /// The clock is locked and scans may start.
    pub synced: bool,
}

// ============================================================================
// Hat
// ============================================================================

/// Host-side settings that feed the next scan.
#[derive(Debug, Clone)]
struct HatSettings {
    calibration: CalibrationTable,
    trigger_mode: TriggerMode,
    trigger_source: ClockSource,
    range: u8,
    input_mode: InputMode,
    /// Volts per engineering unit, per channel.
    sensitivity: Vec<f64>,
}

/// One open board.
pub struct Hat {
    link: DeviceLink,
    spec: BoardSpec,
    config: EngineConfig,
    firmware_version: u16,
    settings: Mutex<HatSettings>,
    scan: Mutex<Option<ScanSession>>,
}

impl Hat {
    /// Verify the board identity and build a handle.
    fn open(link: DeviceLink, spec: BoardSpec, info: DeviceInfo, config: EngineConfig) -> Result<Self> {
        if info.id != spec.id {
            return Err(HatError::InvalidDevice {
                expected: spec.id,
                found: info.id,
            });
        }
        let entries = spec.calibration_entries();
        let table = info.calibration;
        if table.slopes.len() != entries || table.offsets.len() != entries {
            return Err(HatError::bad_param(format!(
                "{} needs {entries} calibration entries",
                spec.name
            )));
        }

        let mut attempt = 0;
        let reply = loop {
            attempt += 1;
            match link.command(CMD_ID, &[], 4, ID_TIMEOUT, ID_RETRY) {
                Ok(reply) => break reply,
                Err(e) if attempt < ID_ATTEMPTS => {
                    debug!("address {}: identify attempt {attempt} failed: {e}", link.address());
                }
                Err(e) => return Err(e),
            }
        };
        let found = u16::from_le_bytes([reply[0], reply[1]]);
        if found != spec.id {
            return Err(HatError::InvalidDevice {
                expected: spec.id,
                found,
            });
        }
        let firmware_version = u16::from_le_bytes([reply[2], reply[3]]);
        info!(
            "{} at address {}, firmware {}.{:02x}",
            spec.name,
            link.address(),
            firmware_version >> 8,
            firmware_version & 0xFF
        );

        Ok(Self {
            link,
            spec,
            config,
            firmware_version,
            settings: Mutex::new(HatSettings {
                calibration: table,
                trigger_mode: TriggerMode::default(),
                trigger_source: ClockSource::default(),
                range: 0,
                input_mode: InputMode::default(),
                sensitivity: vec![1.0; spec.channels as usize],
            }),
            scan: Mutex::new(None),
        })
    }

    pub fn address(&self) -> u8 {
        self.link.address()
    }

    pub fn spec(&self) -> &BoardSpec {
        &self.spec
    }

    /// Firmware version as BCD `major.minor`, e.g. `0x0107`.
    pub fn firmware_version(&self) -> u16 {
        self.firmware_version
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    /// Slope and offset for a calibration entry (a channel or a range,
    /// depending on the board).
    pub fn calibration_coefficient_read(&self, index: usize) -> Result<(f64, f64)> {
        let settings = self.settings.lock();
        let table = &settings.calibration;
        match (table.slopes.get(index), table.offsets.get(index)) {
            (Some(&slope), Some(&offset)) => Ok((slope, offset)),
            _ => Err(HatError::bad_param(format!("calibration index {index} out of range"))),
        }
    }

    /// Replace a calibration entry. Takes effect on the next scan.
    pub fn calibration_coefficient_write(&self, index: usize, slope: f64, offset: f64) -> Result<()> {
        if index >= self.spec.calibration_entries() {
            return Err(HatError::bad_param(format!("calibration index {index} out of range")));
        }
        let _idle = self.idle_slot()?;
        let mut settings = self.settings.lock();
        settings.calibration.slopes[index] = slope;
        settings.calibration.offsets[index] = offset;
        Ok(())
    }

    pub fn trigger_mode_read(&self) -> TriggerMode {
        self.settings.lock().trigger_mode
    }

    pub fn trigger_source_read(&self) -> ClockSource {
        self.settings.lock().trigger_source
    }

    /// Condition for `EXT_TRIGGER` scans. Keeps the current trigger source.
    pub fn trigger_mode(&self, mode: TriggerMode) -> Result<()> {
        let _idle = self.idle_slot()?;
        let source = self.settings.lock().trigger_source;
        self.write_trigger(source, mode)
    }

    /// Trigger source and condition. Only synchronized-clock boards take a
    /// source other than [`ClockSource::Local`].
    pub fn trigger_config(&self, source: ClockSource, mode: TriggerMode) -> Result<()> {
        if source != ClockSource::Local && !self.spec.is_synced() {
            return Err(HatError::bad_param(format!(
                "{} has no shared trigger",
                self.spec.name
            )));
        }
        let _idle = self.idle_slot()?;
        self.write_trigger(source, mode)
    }

    // caller holds the idle scan slot
    fn write_trigger(&self, source: ClockSource, mode: TriggerMode) -> Result<()> {
        if self.spec.is_synced() {
            let config = ((mode as u8) << 2) | source as u8;
            self.link
                .command(CMD_TRIGGER_CONFIG_W, &[config], 0, CONFIG_TIMEOUT, Duration::ZERO)?;
        }
        let mut settings = self.settings.lock();
        settings.trigger_source = source;
        settings.trigger_mode = mode;
        Ok(())
    }

    /// Choose the shared-clock source and the per-channel rate. The rate is
    /// rounded to the nearest supported divisor of the base clock; a
    /// [`ClockSource::Slave`] board ignores it.
    pub fn clock_config_write(&self, source: ClockSource, sample_rate: f64) -> Result<()> {
        let base_rate = self.base_rate()?;
        if sample_rate.is_nan() {
            return Err(HatError::bad_param("sample rate is NaN"));
        }
        let _idle = self.idle_slot()?;
        let divisor = clock_divisor(base_rate, sample_rate);
        self.link.command(
            CMD_AIN_CLOCK_CONFIG_W,
            &[source as u8, (divisor - 1) as u8],
            0,
            CONFIG_TIMEOUT,
            CLOCK_RETRY,
        )?;
        debug!(
            "address {}: clock {source:?} at {:.3} S/s",
            self.address(),
            base_rate / f64::from(divisor)
        );
        Ok(())
    }

    pub fn clock_config_read(&self) -> Result<ClockConfig> {
        let base_rate = self.base_rate()?;
        let reply = self
            .link
            .command(CMD_AIN_CLOCK_CONFIG_R, &[], 2, CONFIG_TIMEOUT, CLOCK_READ_RETRY)?;
        Ok(ClockConfig {
            source: ClockSource::try_from(reply[0] & CLOCK_SOURCE_MASK)?,
            sample_rate: base_rate / (f64::from(reply[1]) + 1.0),
            synced: reply[0] & CLOCK_SYNCED != 0,
        })
    }

    fn base_rate(&self) -> Result<f64> {
        match self.spec.clock {
            ClockModel::Synced { base_rate } => Ok(base_rate),
            _ => Err(HatError::bad_param(format!(
                "{} has no shared clock",
                self.spec.name
            ))),
        }
    }

    /// Sensor sensitivity in mV per engineering unit.
    pub fn sensitivity_read(&self, channel: u8) -> Result<f64> {
        self.check_sensitivity_channel(channel)?;
        Ok(self.settings.lock().sensitivity[channel as usize] * 1000.0)
    }

    /// Set the sensor sensitivity in mV per engineering unit. Scaled data is
    /// then reported in that unit.
    pub fn sensitivity_write(&self, channel: u8, millivolts_per_unit: f64) -> Result<()> {
        self.check_sensitivity_channel(channel)?;
        if !millivolts_per_unit.is_finite() || millivolts_per_unit == 0.0 {
            return Err(HatError::bad_param("sensitivity must be finite and nonzero"));
        }
        let _idle = self.idle_slot()?;
        self.settings.lock().sensitivity[channel as usize] = millivolts_per_unit / 1000.0;
        Ok(())
    }

    pub fn range_read(&self) -> Result<u8> {
        self.check_ranged()?;
        Ok(self.settings.lock().range)
    }

    /// Select the input range by index into the board's range table.
    pub fn range_write(&self, range: u8) -> Result<()> {
        self.check_ranged()?;
        if range as usize >= self.spec.ranges.len() {
            return Err(HatError::bad_param(format!("range {range} out of range")));
        }
        let _idle = self.idle_slot()?;
        self.settings.lock().range = range;
        Ok(())
    }

    pub fn input_mode_read(&self) -> Result<InputMode> {
        self.check_input_mode()?;
        Ok(self.settings.lock().input_mode)
    }

    /// Select single-ended or differential inputs. Differential scans only
    /// take channels 0-3.
    pub fn input_mode_write(&self, mode: InputMode) -> Result<()> {
        self.check_input_mode()?;
        let _idle = self.idle_slot()?;
        self.settings.lock().input_mode = mode;
        Ok(())
    }

    fn check_sensitivity_channel(&self, channel: u8) -> Result<()> {
        if !self.spec.sensitivity_scaled {
            return Err(HatError::bad_param(format!(
                "{} has no sensitivity setting",
                self.spec.name
            )));
        }
        if channel >= self.spec.channels {
            return Err(HatError::bad_param(format!("channel {channel} out of range")));
        }
        Ok(())
    }

    fn check_ranged(&self) -> Result<()> {
        if self.spec.calibration != CalibrationLayout::PerRange {
            return Err(HatError::bad_param(format!(
                "{} has a fixed input range",
                self.spec.name
            )));
        }
        Ok(())
    }

    fn check_input_mode(&self) -> Result<()> {
        if !self.spec.selectable_input_mode {
            return Err(HatError::bad_param(format!(
                "{} has a fixed input mode",
                self.spec.name
            )));
        }
        Ok(())
    }

    /// The scan slot, locked, when no scan is active. Settings writes hold
    /// it until the new value is stored.
    fn idle_slot(&self) -> Result<MutexGuard<'_, Option<ScanSession>>> {
        let slot = self.scan.lock();
        if slot.is_some() {
            return Err(HatError::Busy);
        }
        Ok(slot)
    }

    // ------------------------------------------------------------------------
    // Scan Control
    // ------------------------------------------------------------------------

    /// Start a hardware-paced scan of the channels in `channel_mask`.
    ///
    /// `samples_per_channel` is the scan length, or the minimum buffer size
    /// with `CONTINUOUS`. Synchronized-clock boards ignore `sample_rate` and
    /// run at the configured clock.
    pub fn scan_start(
        &self,
        channel_mask: u8,
        samples_per_channel: u32,
        sample_rate: f64,
        options: ScanOptions,
    ) -> Result<()> {
        let channels = self.validate_start(channel_mask, samples_per_channel, sample_rate, options)?;
        let channel_count = channels.len();
        let continuous = options.contains(ScanOptions::CONTINUOUS);

        // slot released during the clock wait; Busy is checked again below
        drop(self.idle_slot()?);
        let synced_rate = if self.spec.is_synced() {
            Some(self.wait_for_clock_sync()?)
        } else {
            None
        };

        let mut slot = self.idle_slot()?;
        let settings = self.settings.lock().clone();
        if settings.input_mode == InputMode::Differential
            && channel_mask >> settings.input_mode.channel_count(self.spec.channels) != 0
        {
            return Err(HatError::bad_param(format!(
                "channel mask {channel_mask:#04x} reaches past the differential channels"
            )));
        }
        let cals = self.channel_cals(&channels, &settings);

        let (rate, actual_rate) = if let Some(rate) = synced_rate {
            (rate, rate)
        } else if options.contains(ScanOptions::EXT_CLOCK) {
            (sample_rate, sample_rate)
        } else {
            (sample_rate, self.spec.actual_rate(channel_count as u8, sample_rate)?)
        };

        let capacity = self
            .spec
            .buffer_capacity(samples_per_channel as usize, rate, continuous);
        let ring = RingBuffer::try_new(capacity * channel_count).ok_or_else(|| {
            HatError::ResourceUnavailable(format!(
                "cannot allocate {} samples",
                capacity * channel_count
            ))
        })?;
        let read_threshold = self
            .spec
            .read_threshold(channel_count as f64 * rate, channel_count);

        let request = StartRequest {
            scan_count: if continuous { 0 } else { samples_per_channel },
            channels: channels.clone(),
            rate,
            ext_clock: options.contains(ScanOptions::EXT_CLOCK),
            trigger: options
                .contains(ScanOptions::EXT_TRIGGER)
                .then_some(settings.trigger_mode),
            range: settings.range,
            input_mode: settings.input_mode,
        };
        self.link.command(
            CMD_AIN_SCAN_START,
            &self.spec.start_payload(&request),
            0,
            START_TIMEOUT,
            Duration::ZERO,
        )?;

        let shared = Arc::new(Mutex::new(ScanShared::new(ring)));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = ScanWorker {
            link: self.link.clone(),
            spec: self.spec,
            cals,
            calibrate: !options.contains(ScanOptions::NO_CALIBRATE_DATA),
            scale: !options.contains(ScanOptions::NO_SCALE_DATA),
            read_threshold,
            shared: Arc::clone(&shared),
            stop: Arc::clone(&stop),
            poll_min: self.config.poll_min,
            poll_max: self.config.poll_max,
            trigger_poll: self.config.trigger_poll,
            cursor: 0,
        };

        let (started_tx, started_rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("hatscan-{}", self.address()))
            .spawn(move || worker.run(started_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                warn!("address {}: cannot spawn scan thread: {e}", self.address());
                if let Err(stop_err) = self.scan_stop() {
                    warn!("address {}: stop after failed spawn: {stop_err}", self.address());
                }
                return Err(HatError::ResourceUnavailable(format!("scan thread: {e}")));
            }
        };
        if started_rx.recv().is_err() {
            warn!("address {}: scan thread exited before starting", self.address());
        }

        debug!(
            "address {}: scan started on {channels:?} at {actual_rate:.3} S/s, \
             buffer {capacity} samples/ch, threshold {read_threshold}",
            self.address()
        );
        *slot = Some(ScanSession {
            channels,
            options,
            capacity,
            actual_rate,
            shared,
            stop,
            thread: Some(handle),
        });
        Ok(())
    }

    fn validate_start(
        &self,
        channel_mask: u8,
        samples_per_channel: u32,
        sample_rate: f64,
        options: ScanOptions,
    ) -> Result<Vec<u8>> {
        if channel_mask == 0 {
            return Err(HatError::bad_param("channel mask is empty"));
        }
        if self.spec.channels < 8 && channel_mask >> self.spec.channels != 0 {
            return Err(HatError::bad_param(format!(
                "channel mask {channel_mask:#04x} names channels {} lacks",
                self.spec.name
            )));
        }
        if samples_per_channel == 0 && !options.contains(ScanOptions::CONTINUOUS) {
            return Err(HatError::bad_param("finite scan needs samples_per_channel > 0"));
        }
        if options.contains(ScanOptions::EXT_CLOCK) && !self.spec.ext_clock {
            return Err(HatError::bad_param(format!(
                "{} has no external clock input",
                self.spec.name
            )));
        }
        if sample_rate.is_nan() || sample_rate < 0.0 {
            return Err(HatError::bad_param("sample rate must not be negative"));
        }

        let channels = channels_from_mask(channel_mask);
        let internal_clock = !self.spec.is_synced() && !options.contains(ScanOptions::EXT_CLOCK);
        if internal_clock {
            if sample_rate == 0.0 {
                return Err(HatError::bad_param("sample rate must be positive"));
            }
            if channels.len() as f64 * sample_rate > self.spec.max_adc_rate {
                return Err(HatError::bad_param(format!(
                    "{} channels at {sample_rate} S/s exceeds {} S/s",
                    channels.len(),
                    self.spec.max_adc_rate
                )));
            }
        }
        Ok(channels)
    }

    fn channel_cals(&self, channels: &[u8], settings: &HatSettings) -> Vec<ChannelCal> {
        let format = &self.spec.format;
        let range_index = match self.spec.calibration {
            CalibrationLayout::PerChannel => 0,
            CalibrationLayout::PerRange => settings.range as usize,
        };
        let range = self.spec.ranges[range_index];

        channels
            .iter()
            .map(|&channel| {
                let entry = match self.spec.calibration {
                    CalibrationLayout::PerChannel => channel as usize,
                    CalibrationLayout::PerRange => range_index,
                };
                let scale = if self.spec.sensitivity_scaled {
                    ScaleMode::Sensitivity {
                        lsb: lsb_size(format, range.min, range.max),
                        sensitivity: settings.sensitivity[channel as usize],
                    }
                } else {
                    ScaleMode::for_range(format, range.min, range.max)
                };
                ChannelCal {
                    slope: settings.calibration.slopes[entry],
                    offset: settings.calibration.offsets[entry],
                    convention: self.spec.convention,
                    scale,
                }
            })
            .collect()
    }

    /// Poll the shared clock until it reports lock, returning the per-channel
    /// rate it runs at.
    fn wait_for_clock_sync(&self) -> Result<f64> {
        for attempt in 0..self.config.sync_retries {
            let clock = self.clock_config_read()?;
            if clock.synced {
                if attempt > 0 {
                    debug!("address {}: clock synced after {attempt} polls", self.address());
                }
                return Ok(clock.sample_rate);
            }
            thread::sleep(SYNC_POLL);
        }
        warn!(
            "address {}: clock not synced after {} polls",
            self.address(),
            self.config.sync_retries
        );
        Err(HatError::Timeout)
    }

    /// Stop the device scan. Buffered data stays readable.
    pub fn scan_stop(&self) -> Result<()> {
        self.link
            .command(CMD_AIN_SCAN_STOP, &[], 0, STOP_TIMEOUT, Duration::ZERO)?;
        Ok(())
    }

    /// End the scan thread and release the session. No-op without a scan.
    pub fn scan_cleanup(&self) -> Result<()> {
        let mut slot = self.scan.lock();
        let Some(mut session) = slot.take() else {
            return Ok(());
        };
        session.stop.store(true, Ordering::Release);
        if let Some(handle) = session.thread.take() {
            if handle.join().is_err() {
                warn!("address {}: scan thread panicked", self.address());
            }
        }
        debug!("address {}: scan cleaned up", self.address());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Scan Queries
    // ------------------------------------------------------------------------

    pub fn scan_status(&self) -> Result<ScanStatusInfo> {
        let slot = self.scan.lock();
        let session = slot.as_ref().ok_or_else(HatError::no_scan)?;
        let shared = session.shared.lock();
        Ok(ScanStatusInfo {
            status: shared.status(),
            samples_available: shared.ring.depth() / session.channel_count(),
        })
    }

    /// Total samples the scan buffer holds, across all channels.
    pub fn scan_buffer_size(&self) -> Result<usize> {
        let slot = self.scan.lock();
        let session = slot.as_ref().ok_or_else(HatError::no_scan)?;
        Ok(session.capacity * session.channel_count())
    }

    /// Channels in the active scan, 0 without one.
    pub fn scan_channel_count(&self) -> usize {
        self.scan
            .lock()
            .as_ref()
            .map_or(0, ScanSession::channel_count)
    }

    /// Per-channel rate of the active scan.
    pub fn scan_sample_rate(&self) -> Result<f64> {
        let slot = self.scan.lock();
        slot.as_ref()
            .map(|session| session.actual_rate)
            .ok_or_else(HatError::no_scan)
    }

    pub fn scan_options(&self) -> Result<ScanOptions> {
        let slot = self.scan.lock();
        slot.as_ref()
            .map(|session| session.options)
            .ok_or_else(HatError::no_scan)
    }

    /// Rate the hardware would run `channel_count` channels at when asked
    /// for `sample_rate`. Does not touch the device.
    pub fn scan_actual_rate(&self, channel_count: u8, sample_rate: f64) -> Result<f64> {
        self.spec.actual_rate(channel_count, sample_rate)
    }

    // ------------------------------------------------------------------------
    // Read API
    // ------------------------------------------------------------------------

    /// Copy scan data into `dest`, interleaved by channel.
    ///
    /// `samples_per_channel == -1` takes everything buffered right now and
    /// never waits. Otherwise the call waits up to `timeout` seconds
    /// (negative waits indefinitely, 0 not at all). A request still unmet
    /// at the deadline comes back with `timed_out` set and the count of
    /// samples already copied into `dest`.
    pub fn scan_read(&self, samples_per_channel: i64, timeout: f64, dest: &mut [f64]) -> Result<ScanRead> {
        if samples_per_channel < -1 {
            return Err(HatError::bad_param("samples_per_channel must be -1 or more"));
        }
        if timeout.is_nan() {
            return Err(HatError::bad_param("timeout is NaN"));
        }
        let (shared, channel_count) = {
            let slot = self.scan.lock();
            let session = slot.as_ref().ok_or_else(HatError::no_scan)?;
            (Arc::clone(&session.shared), session.channel_count())
        };
        if samples_per_channel > 0 && dest.len() < channel_count {
            return Err(HatError::bad_param("destination holds less than one scan"));
        }

        let drain = samples_per_channel == -1;
        let wanted = if drain {
            normalize(shared.lock().ring.depth(), channel_count)
        } else {
            (samples_per_channel as usize).saturating_mul(channel_count)
        };
        let wanted = wanted.min(normalize(dest.len(), channel_count));

        let deadline = if drain || timeout < 0.0 {
            None
        } else {
            Duration::try_from_secs_f64(timeout)
                .ok()
                .map(|bound| Instant::now() + bound)
        };

        let mut copied = 0;
        let mut timed_out = false;
        let status = loop {
            let (status, finished) = {
                let mut shared = shared.lock();
                let ready = normalize(shared.ring.depth().min(wanted - copied), channel_count);
                if ready > 0 {
                    copied += shared.ring.read(&mut dest[copied..copied + ready]);
                }
                let finished = !shared.thread_running && shared.ring.depth() < channel_count;
                (shared.status(), finished)
            };

            if copied >= wanted || status.is_overrun() || finished || drain {
                break status;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                timed_out = true;
                break status;
            }
            thread::sleep(self.config.read_poll);
        };

        if timed_out {
            debug!(
                "address {}: read timed out with {} of {wanted} samples",
                self.address(),
                copied
            );
        }
        Ok(ScanRead {
            status,
            samples_per_channel: copied / channel_count,
            timed_out,
        })
    }
}

impl Drop for Hat {
    fn drop(&mut self) {
        if let Err(e) = self.scan_cleanup() {
            warn!("address {}: cleanup on drop: {e}", self.address());
        }
    }
}

// ============================================================================
// Context
// ============================================================================

struct OpenHat {
    hat: Arc<Hat>,
    handles: usize,
}

/// Registry of open boards sharing one bus.
pub struct HatContext {
    bus: Arc<BusLock>,
    config: EngineConfig,
    devices: Mutex<HashMap<u8, OpenHat>>,
}

impl HatContext {
    pub fn new(bus: BusLock, config: EngineConfig) -> Self {
        Self {
            bus: Arc::new(bus),
            config,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// The Raspberry Pi bus: spidev, the shared lock file, and the caller's
    /// address lines.
    pub fn with_spi(config: EngineConfig, address: impl AddressSelect + 'static) -> Result<Self> {
        let device = SpidevBus::open(&config.spi_device)?;
        let process = FileLock::open(&config.lock_file)?;
        let bus = BusLock::new(device, process, address, config.lock_timeout);
        Ok(Self::new(bus, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open the board at `address`, choosing the board type from `info.id`.
    pub fn open(&self, address: u8, info: DeviceInfo) -> Result<Arc<Hat>> {
        let spec = BoardSpec::from_id(info.id)
            .ok_or_else(|| HatError::bad_param(format!("unsupported product id {:#06x}", info.id)))?;
        self.open_as(address, spec, info)
    }

    /// Open the board at `address` as `spec`. Opening an address again
    /// returns the same handle.
    pub fn open_as(&self, address: u8, spec: BoardSpec, info: DeviceInfo) -> Result<Arc<Hat>> {
        if address >= MAX_ADDRESSES {
            return Err(HatError::bad_param(format!("address {address} out of range")));
        }
        let mut devices = self.devices.lock();
        if let Some(open) = devices.get_mut(&address) {
            if open.hat.spec.id != spec.id {
                return Err(HatError::InvalidDevice {
                    expected: spec.id,
                    found: open.hat.spec.id,
                });
            }
            open.handles += 1;
            return Ok(Arc::clone(&open.hat));
        }

        let link = DeviceLink::new(Arc::clone(&self.bus), address, spec.spi_speed_hz);
        let hat = Arc::new(Hat::open(link, spec, info, self.config.clone())?);
        devices.insert(
            address,
            OpenHat {
                hat: Arc::clone(&hat),
                handles: 1,
            },
        );
        Ok(hat)
    }

    /// Drop one handle; the last one cleans up any scan.
    pub fn close(&self, address: u8) -> Result<()> {
        let mut devices = self.devices.lock();
        let Some(open) = devices.get_mut(&address) else {
            return Ok(());
        };
        open.handles -= 1;
        if open.handles > 0 {
            return Ok(());
        }
        if let Some(open) = devices.remove(&address) {
            open.hat.scan_cleanup()?;
            debug!("address {address}: closed");
        }
        Ok(())
    }

    pub fn is_open(&self, address: u8) -> bool {
        self.devices.lock().contains_key(&address)
    }

    pub fn get(&self, address: u8) -> Option<Arc<Hat>> {
        self.devices.lock().get(&address).map(|open| Arc::clone(&open.hat))
    }
}

impl Drop for HatContext {
    fn drop(&mut self) {
        for (address, open) in self.devices.lock().drain() {
            if let Err(e) = open.hat.scan_cleanup() {
                warn!("address {address}: cleanup on shutdown: {e}");
            }
        }
    }
}
