//! Python bindings (feature `python`).
//!
//! All `Hat` objects share one context on the Raspberry Pi SPI bus, created
//! on first use from `EngineConfig::from_env()`. Address lines are left to
//! the host; the context drives none.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::board::{
    BoardSpec, CalibrationTable, ClockSource, DeviceInfo, InputMode, TriggerMode, MCC118_ID,
    MCC128_ID, MCC172_ID,
};
use crate::bus::NoAddressLines;
use crate::config::EngineConfig;
use crate::errors::HatError;
use crate::hat::{Hat, HatContext};
use crate::logging;
use crate::session::{ScanOptions, ScanStatus};

static CONTEXT: OnceCell<HatContext> = OnceCell::new();

fn context() -> PyResult<&'static HatContext> {
    CONTEXT
        .get_or_try_init(|| HatContext::with_spi(EngineConfig::from_env(), NoAddressLines))
        .map_err(to_py)
}

fn to_py(err: HatError) -> PyErr {
    let msg = format!("{err} (code {})", err.code());
    match err {
        HatError::BadParameter(_) | HatError::InvalidDevice { .. } => PyValueError::new_err(msg),
        HatError::Timeout | HatError::LockTimeout => PyTimeoutError::new_err(msg),
        HatError::CommsFailure(_) => PyIOError::new_err(msg),
        HatError::Busy | HatError::ResourceUnavailable(_) | HatError::Undefined(_) => {
            PyRuntimeError::new_err(msg)
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Scan state returned by `Hat.scan_status()`.
///
/// Attributes:
///     status: Raw status bits (STATUS_* constants).
///     samples_available: Samples per channel waiting in the scan buffer.
#[pyclass(name = "ScanStatus", frozen)]
#[derive(Clone)]
struct PyScanStatus {
    #[pyo3(get)]
    status: u16,
    #[pyo3(get)]
    samples_available: usize,
}

#[pymethods]
impl PyScanStatus {
    #[getter]
    fn running(&self) -> bool {
        self.flags().contains(ScanStatus::RUNNING)
    }

    #[getter]
    fn hardware_overrun(&self) -> bool {
        self.flags().contains(ScanStatus::HW_OVERRUN)
    }

    #[getter]
    fn buffer_overrun(&self) -> bool {
        self.flags().contains(ScanStatus::BUFFER_OVERRUN)
    }

    #[getter]
    fn triggered(&self) -> bool {
        self.flags().contains(ScanStatus::TRIGGERED)
    }

    fn __repr__(&self) -> String {
        format!(
            "ScanStatus({}, samples_available={})",
            self.flags(),
            self.samples_available
        )
    }
}

impl PyScanStatus {
    fn flags(&self) -> ScanStatus {
        ScanStatus::from_bits_truncate(self.status)
    }
}

/// Data returned by `Hat.scan_read()`.
///
/// Attributes:
///     status: Raw status bits at the end of the read.
///     data: Samples interleaved by channel.
///     samples_per_channel: Whole scans in `data`.
///     timeout: True if the read deadline passed before the request was met.
#[pyclass(name = "ScanResult", frozen)]
#[derive(Clone)]
struct PyScanResult {
    #[pyo3(get)]
    status: u16,
    #[pyo3(get)]
    data: Vec<f64>,
    #[pyo3(get)]
    samples_per_channel: usize,
    #[pyo3(get)]
    timeout: bool,
}

#[pymethods]
impl PyScanResult {
    #[getter]
    fn running(&self) -> bool {
        ScanStatus::from_bits_truncate(self.status).contains(ScanStatus::RUNNING)
    }

    #[getter]
    fn hardware_overrun(&self) -> bool {
        ScanStatus::from_bits_truncate(self.status).contains(ScanStatus::HW_OVERRUN)
    }

    #[getter]
    fn buffer_overrun(&self) -> bool {
        ScanStatus::from_bits_truncate(self.status).contains(ScanStatus::BUFFER_OVERRUN)
    }

    #[getter]
    fn triggered(&self) -> bool {
        ScanStatus::from_bits_truncate(self.status).contains(ScanStatus::TRIGGERED)
    }

    fn __len__(&self) -> usize {
        self.data.len()
    }

    fn __repr__(&self) -> String {
        format!(
            "ScanResult({}, samples_per_channel={}, timeout={})",
            ScanStatus::from_bits_truncate(self.status),
            self.samples_per_channel,
            self.timeout
        )
    }
}

// ============================================================================
// Hat
// ============================================================================

/// One measurement HAT on the SPI bus.
///
/// Example:
///     >>> hat = Hat(0, MCC118_ID, slopes=[1.0] * 8, offsets=[0.0] * 8)
///     >>> hat.scan_start(0b11, 1000, 1000.0)
///     >>> result = hat.scan_read(1000, timeout=2.0)
///     >>> hat.scan_cleanup()
#[pyclass(name = "Hat", frozen)]
struct PyHat {
    inner: Arc<Hat>,
}

#[pymethods]
impl PyHat {
    /// Open the board at `address`.
    ///
    /// Args:
    ///     address: Board address, 0-7.
    ///     product_id: Product ID from the board EEPROM (MCC*_ID constants).
    ///     slopes, offsets: Calibration coefficients from the EEPROM.
    ///         Identity calibration when omitted.
    ///
    /// Raises:
    ///     ValueError: Unknown product or the board answers with another ID.
    ///     TimeoutError: The bus lock or the board did not respond.
    #[new]
    #[pyo3(signature = (address, product_id, slopes=None, offsets=None, serial=None))]
    fn new(
        py: Python<'_>,
        address: u8,
        product_id: u16,
        slopes: Option<Vec<f64>>,
        offsets: Option<Vec<f64>>,
        serial: Option<String>,
    ) -> PyResult<Self> {
        let spec = BoardSpec::from_id(product_id).ok_or_else(|| {
            PyValueError::new_err(format!("unsupported product id {product_id:#06x}"))
        })?;
        let mut calibration = CalibrationTable::identity(spec.calibration_entries());
        if let Some(slopes) = slopes {
            calibration.slopes = slopes;
        }
        if let Some(offsets) = offsets {
            calibration.offsets = offsets;
        }
        calibration.serial = serial.unwrap_or_default();
        let info = DeviceInfo {
            id: product_id,
            calibration,
        };

        let ctx = context()?;
        let inner = py.detach(|| ctx.open(address, info)).map_err(to_py)?;
        Ok(PyHat { inner })
    }

    #[getter]
    fn address(&self) -> u8 {
        self.inner.address()
    }

    #[getter]
    fn product_name(&self) -> &'static str {
        self.inner.spec().name
    }

    /// Firmware version as "major.minor".
    #[getter]
    fn firmware_version(&self) -> String {
        let version = self.inner.firmware_version();
        format!("{}.{:02x}", version >> 8, version & 0xFF)
    }

    /// Start a hardware-paced scan.
    ///
    /// Args:
    ///     channel_mask: Bit per channel to sample.
    ///     samples_per_channel: Scan length, or minimum buffer size with OPTS_CONTINUOUS.
    ///     sample_rate: Per-channel rate in S/s (ignored on synchronized-clock boards).
    ///     options: OR of OPTS_* constants.
    #[pyo3(signature = (channel_mask, samples_per_channel, sample_rate, options=0))]
    fn scan_start(
        &self,
        py: Python<'_>,
        channel_mask: u8,
        samples_per_channel: u32,
        sample_rate: f64,
        options: u32,
    ) -> PyResult<()> {
        let options = ScanOptions::from_bits(options)
            .ok_or_else(|| PyValueError::new_err(format!("unknown option bits {options:#x}")))?;
        let hat = &self.inner;
        py.detach(|| hat.scan_start(channel_mask, samples_per_channel, sample_rate, options))
            .map_err(to_py)
    }

    /// Read scan data.
    ///
    /// Args:
    ///     samples_per_channel: Samples to wait for, or -1 for whatever is buffered.
    ///     timeout: Seconds to wait; negative waits indefinitely.
    ///
    /// Returns:
    ///     ScanResult. On timeout the partial data is returned with `timeout` set.
    #[pyo3(signature = (samples_per_channel=-1, timeout=0.0))]
    fn scan_read(&self, py: Python<'_>, samples_per_channel: i64, timeout: f64) -> PyResult<PyScanResult> {
        let hat = &self.inner;
        let channels = hat.scan_channel_count();
        let len = if samples_per_channel < 0 {
            hat.scan_status().map_err(to_py)?.samples_available * channels
        } else {
            usize::try_from(samples_per_channel)
                .unwrap_or(usize::MAX)
                .saturating_mul(channels)
                .min(hat.scan_buffer_size().map_err(to_py)?)
        };
        let mut data = vec![0.0; len];

        let read = py
            .detach(|| hat.scan_read(samples_per_channel, timeout, &mut data))
            .map_err(to_py)?;
        data.truncate(read.samples_per_channel * channels);
        Ok(PyScanResult {
            status: read.status.bits(),
            data,
            samples_per_channel: read.samples_per_channel,
            timeout: read.timed_out,
        })
    }

    fn scan_status(&self) -> PyResult<PyScanStatus> {
        let info = self.inner.scan_status().map_err(to_py)?;
        Ok(PyScanStatus {
            status: info.status.bits(),
            samples_available: info.samples_available,
        })
    }

    /// Stop the device scan; buffered data stays readable.
    fn scan_stop(&self, py: Python<'_>) -> PyResult<()> {
        let hat = &self.inner;
        py.detach(|| hat.scan_stop()).map_err(to_py)
    }

    /// Release the scan thread and buffer.
    fn scan_cleanup(&self, py: Python<'_>) -> PyResult<()> {
        let hat = &self.inner;
        py.detach(|| hat.scan_cleanup()).map_err(to_py)
    }

    fn scan_buffer_size(&self) -> PyResult<usize> {
        self.inner.scan_buffer_size().map_err(to_py)
    }

    fn scan_channel_count(&self) -> usize {
        self.inner.scan_channel_count()
    }

    fn scan_actual_rate(&self, channel_count: u8, sample_rate: f64) -> PyResult<f64> {
        self.inner
            .scan_actual_rate(channel_count, sample_rate)
            .map_err(to_py)
    }

    /// Set the external trigger condition (TRIG_* constants).
    fn trigger_mode(&self, py: Python<'_>, mode: u8) -> PyResult<()> {
        let mode = TriggerMode::try_from(mode).map_err(to_py)?;
        let hat = &self.inner;
        py.detach(|| hat.trigger_mode(mode)).map_err(to_py)
    }

    /// Set the trigger source (SOURCE_*) and condition (TRIG_*).
    fn trigger_config(&self, py: Python<'_>, source: u8, mode: u8) -> PyResult<()> {
        let source = ClockSource::try_from(source).map_err(to_py)?;
        let mode = TriggerMode::try_from(mode).map_err(to_py)?;
        let hat = &self.inner;
        py.detach(|| hat.trigger_config(source, mode)).map_err(to_py)
    }

    /// Configure the shared sample clock (synchronized-clock boards).
    ///
    /// Args:
    ///     clock_source: SOURCE_* constant.
    ///     sample_rate: Per-channel rate in S/s, rounded to a supported value.
    fn clock_config_write(&self, py: Python<'_>, clock_source: u8, sample_rate: f64) -> PyResult<()> {
        let source = ClockSource::try_from(clock_source).map_err(to_py)?;
        let hat = &self.inner;
        py.detach(|| hat.clock_config_write(source, sample_rate))
            .map_err(to_py)
    }

    /// Returns:
    ///     Dict with `clock_source`, `sample_rate_per_channel` and `synchronized`.
    fn clock_config_read<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let hat = &self.inner;
        let clock = py.detach(|| hat.clock_config_read()).map_err(to_py)?;
        let dict = PyDict::new(py);
        dict.set_item("clock_source", clock.source as u8)?;
        dict.set_item("sample_rate_per_channel", clock.sample_rate)?;
        dict.set_item("synchronized", clock.synced)?;
        Ok(dict)
    }

    /// Returns:
    ///     Dict with `slope` and `offset`.
    fn calibration_coefficient_read<'py>(&self, py: Python<'py>, index: usize) -> PyResult<Bound<'py, PyDict>> {
        let (slope, offset) = self.inner.calibration_coefficient_read(index).map_err(to_py)?;
        let dict = PyDict::new(py);
        dict.set_item("slope", slope)?;
        dict.set_item("offset", offset)?;
        Ok(dict)
    }

    fn calibration_coefficient_write(&self, index: usize, slope: f64, offset: f64) -> PyResult<()> {
        self.inner
            .calibration_coefficient_write(index, slope, offset)
            .map_err(to_py)
    }

    /// Sensor sensitivity in mV per unit (synchronized-clock boards).
    fn sensitivity_read(&self, channel: u8) -> PyResult<f64> {
        self.inner.sensitivity_read(channel).map_err(to_py)
    }

    fn sensitivity_write(&self, channel: u8, value: f64) -> PyResult<()> {
        self.inner.sensitivity_write(channel, value).map_err(to_py)
    }

    /// Input range index (boards with selectable ranges).
    fn range_read(&self) -> PyResult<u8> {
        self.inner.range_read().map_err(to_py)
    }

    fn range_write(&self, range: u8) -> PyResult<()> {
        self.inner.range_write(range).map_err(to_py)
    }

    /// Analog input mode (A_IN_MODE_*), on boards that offer one.
    fn input_mode_read(&self) -> PyResult<u8> {
        self.inner
            .input_mode_read()
            .map(|mode| mode as u8)
            .map_err(to_py)
    }

    fn input_mode_write(&self, mode: u8) -> PyResult<()> {
        let mode = InputMode::try_from(mode).map_err(to_py)?;
        self.inner.input_mode_write(mode).map_err(to_py)
    }

    /// Release this handle. The board closes with its last handle.
    fn close(&self, py: Python<'_>) -> PyResult<()> {
        let ctx = context()?;
        let address = self.inner.address();
        py.detach(|| ctx.close(address)).map_err(to_py)
    }

    fn __repr__(&self) -> String {
        format!(
            "Hat({}, address={})",
            self.inner.spec().name,
            self.inner.address()
        )
    }
}

// ============================================================================
// Module
// ============================================================================

/// Route Rust log records into Python's `logging` at `level` (or from
/// `HATSCAN_LOG` when omitted).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level_str(py, level)
}

/// Drop cached Python loggers after reconfiguring `logging`.
#[pyfunction]
fn reset_logging_cache() {
    logging::reset_python_logging_cache();
}

#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyHat>()?;
    m.add_class::<PyScanStatus>()?;
    m.add_class::<PyScanResult>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(reset_logging_cache, m)?)?;

    m.add("MCC118_ID", MCC118_ID)?;
    m.add("MCC128_ID", MCC128_ID)?;
    m.add("MCC172_ID", MCC172_ID)?;

    m.add("OPTS_DEFAULT", 0u32)?;
    m.add("OPTS_NOSCALEDATA", ScanOptions::NO_SCALE_DATA.bits())?;
    m.add("OPTS_NOCALIBRATEDATA", ScanOptions::NO_CALIBRATE_DATA.bits())?;
    m.add("OPTS_EXTCLOCK", ScanOptions::EXT_CLOCK.bits())?;
    m.add("OPTS_EXTTRIGGER", ScanOptions::EXT_TRIGGER.bits())?;
    m.add("OPTS_CONTINUOUS", ScanOptions::CONTINUOUS.bits())?;

    m.add("STATUS_HW_OVERRUN", ScanStatus::HW_OVERRUN.bits())?;
    m.add("STATUS_BUFFER_OVERRUN", ScanStatus::BUFFER_OVERRUN.bits())?;
    m.add("STATUS_TRIGGERED", ScanStatus::TRIGGERED.bits())?;
    m.add("STATUS_RUNNING", ScanStatus::RUNNING.bits())?;

    m.add("TRIG_RISING_EDGE", TriggerMode::RisingEdge as u8)?;
    m.add("TRIG_FALLING_EDGE", TriggerMode::FallingEdge as u8)?;
    m.add("TRIG_ACTIVE_HIGH", TriggerMode::ActiveHigh as u8)?;
    m.add("TRIG_ACTIVE_LOW", TriggerMode::ActiveLow as u8)?;

    m.add("SOURCE_LOCAL", ClockSource::Local as u8)?;
    m.add("SOURCE_MASTER", ClockSource::Master as u8)?;
    m.add("SOURCE_SLAVE", ClockSource::Slave as u8)?;

    m.add("A_IN_MODE_SE", InputMode::SingleEnded as u8)?;
    m.add("A_IN_MODE_DIFF", InputMode::Differential as u8)?;

    if let Err(e) = logging::init_python_logging(m.py()) {
        e.restore(m.py());
    }
    Ok(())
}
