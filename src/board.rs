//! Per-board parameters for the scanning engine.
//!
//! The engine itself is board-agnostic: everything that differs between
//! products (sample encoding, calibration layout, clocking, start command
//! layout, buffer sizing) lives in a [`BoardSpec`].

use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrateConvention, SampleFormat};
use crate::errors::{HatError, Result};

/// Voltage span of one input range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputRange {
    pub min: f64,
    pub max: f64,
}

/// Which table entry a channel's calibration comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationLayout {
    /// One slope/offset pair per channel.
    PerChannel,
    /// One pair per input range, shared by every channel.
    PerRange,
}

/// How the board paces conversions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockModel {
    /// `timebase / (period + 1)` with a 32-bit period register.
    Period32 { timebase: f64 },
    /// 16-bit period behind a power-of-two prescaler.
    PeriodDivider { timebase: f64 },
    /// Shared ADC clock configured separately. Scans wait for it to lock.
    Synced { base_rate: f64 },
}

/// External trigger condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TriggerMode {
    #[default]
    RisingEdge = 0,
    FallingEdge = 1,
    ActiveHigh = 2,
    ActiveLow = 3,
}

impl TryFrom<u8> for TriggerMode {
    type Error = HatError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TriggerMode::RisingEdge),
            1 => Ok(TriggerMode::FallingEdge),
            2 => Ok(TriggerMode::ActiveHigh),
            3 => Ok(TriggerMode::ActiveLow),
            other => Err(HatError::bad_param(format!("unknown trigger mode {other}"))),
        }
    }
}

/// Where a synchronized-clock board takes its sample clock or trigger from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ClockSource {
    /// Generated on this board and not shared.
    #[default]
    Local = 0,
    /// Generated on this board and driven onto the shared line.
    Master = 1,
    /// Taken from the shared line.
    Slave = 2,
}

impl TryFrom<u8> for ClockSource {
    type Error = HatError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ClockSource::Local),
            1 => Ok(ClockSource::Master),
            2 => Ok(ClockSource::Slave),
            other => Err(HatError::bad_param(format!("unknown source {other}"))),
        }
    }
}

/// Analog input wiring on boards with a selectable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum InputMode {
    #[default]
    SingleEnded = 0,
    /// Channel pairs; only channels 0-3 exist.
    Differential = 1,
}

impl InputMode {
    /// Channels the board exposes in this mode.
    pub fn channel_count(self, single_ended: u8) -> u8 {
        match self {
            InputMode::SingleEnded => single_ended,
            InputMode::Differential => single_ended / 2,
        }
    }
}

impl TryFrom<u8> for InputMode {
    type Error = HatError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(InputMode::SingleEnded),
            1 => Ok(InputMode::Differential),
            other => Err(HatError::bad_param(format!("unknown input mode {other}"))),
        }
    }
}

/// Factory calibration coefficients, as stored on the board's EEPROM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub date: String,
    pub slopes: Vec<f64>,
    pub offsets: Vec<f64>,
}

impl CalibrationTable {
    /// Slope 1, offset 0 for every entry.
    pub fn identity(entries: usize) -> Self {
        Self {
            serial: String::new(),
            date: String::new(),
            slopes: vec![1.0; entries],
            offsets: vec![0.0; entries],
        }
    }
}

/// What the host knows about a board before opening it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: u16,
    pub calibration: CalibrationTable,
}

/// Continuous-mode buffer sizing: the first tier whose rate bound is at least
/// the per-channel rate gives the samples per channel.
pub type BufferTier = (f64, usize);

const MCC118_RANGES: &[InputRange] = &[InputRange {
    min: -10.0,
    max: 10.0,
}];

const MCC128_RANGES: &[InputRange] = &[
    InputRange {
        min: -10.0,
        max: 10.0,
    },
    InputRange {
        min: -5.0,
        max: 5.0,
    },
    InputRange { min: -2.0, max: 2.0 },
    InputRange { min: -1.0, max: 1.0 },
];

const MCC172_RANGES: &[InputRange] = &[InputRange { min: -5.0, max: 5.0 }];

const RATE_TIERS: &[BufferTier] = &[(100.0, 1_000), (10_000.0, 10_000), (100_000.0, 100_000)];

const SYNCED_TIERS: &[BufferTier] = &[(1_024.0, 1_000), (10_240.0, 10_000)];

/// Device product ids.
pub const MCC118_ID: u16 = 0x0142;
pub const MCC128_ID: u16 = 0x0146;
pub const MCC172_ID: u16 = 0x0145;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardSpec {
    pub name: &'static str,
    pub id: u16,
    pub channels: u8,
    pub format: SampleFormat,
    pub ranges: &'static [InputRange],
    pub calibration: CalibrationLayout,
    pub convention: CalibrateConvention,
    /// Scale by a per-channel sensitivity instead of the input range.
    pub sensitivity_scaled: bool,
    /// Inputs can be switched to differential pairs.
    pub selectable_input_mode: bool,
    /// Aggregate conversions per second on the internal clock.
    pub max_adc_rate: f64,
    pub clock: ClockModel,
    pub ext_clock: bool,
    /// Largest single data request the firmware serves.
    pub max_samples_per_read: usize,
    /// Width of each count field in the status reply.
    pub status_count_bytes: usize,
    pub buffer_tiers: &'static [BufferTier],
    /// Samples per channel when the rate is above every tier.
    pub fallback_buffer: usize,
    /// Highest SPI clock the board's firmware tolerates.
    pub spi_speed_hz: u32,
}

impl BoardSpec {
    /// 8-channel 12-bit board.
    pub const MCC118: BoardSpec = BoardSpec {
        name: "MCC 118",
        id: MCC118_ID,
        channels: 8,
        format: SampleFormat::unsigned_le(12, 2),
        ranges: MCC118_RANGES,
        calibration: CalibrationLayout::PerChannel,
        convention: CalibrateConvention::GainThenOffset,
        sensitivity_scaled: false,
        selectable_input_mode: false,
        max_adc_rate: 100_000.0,
        clock: ClockModel::Period32 {
            timebase: 16_000_000.0,
        },
        ext_clock: true,
        max_samples_per_read: 512,
        status_count_bytes: 2,
        buffer_tiers: RATE_TIERS,
        fallback_buffer: 10_000,
        spi_speed_hz: 9_600_000,
    };

    /// 8-channel 16-bit board with selectable ranges.
    pub const MCC128: BoardSpec = BoardSpec {
        name: "MCC 128",
        id: MCC128_ID,
        channels: 8,
        format: SampleFormat::unsigned_le(16, 2).inverted(),
        ranges: MCC128_RANGES,
        calibration: CalibrationLayout::PerRange,
        convention: CalibrateConvention::GainThenOffset,
        sensitivity_scaled: false,
        selectable_input_mode: true,
        max_adc_rate: 100_000.0,
        clock: ClockModel::PeriodDivider {
            timebase: 16_000_000.0,
        },
        ext_clock: true,
        max_samples_per_read: (4096 - 5) / 2,
        status_count_bytes: 3,
        buffer_tiers: RATE_TIERS,
        fallback_buffer: 10_000,
        spi_speed_hz: 18_000_000,
    };

    /// 2-channel 24-bit IEPE board on a shared sample clock.
    pub const MCC172: BoardSpec = BoardSpec {
        name: "MCC 172",
        id: MCC172_ID,
        channels: 2,
        format: SampleFormat::signed_be(24, 3),
        ranges: MCC172_RANGES,
        calibration: CalibrationLayout::PerChannel,
        convention: CalibrateConvention::OffsetThenGain,
        sensitivity_scaled: true,
        selectable_input_mode: false,
        max_adc_rate: 2.0 * 51_200.0,
        clock: ClockModel::Synced { base_rate: 51_200.0 },
        ext_clock: false,
        max_samples_per_read: (4096 - 5) / 3,
        status_count_bytes: 2,
        buffer_tiers: SYNCED_TIERS,
        fallback_buffer: 100_000,
        spi_speed_hz: 18_000_000,
    };

    pub fn from_id(id: u16) -> Option<BoardSpec> {
        [Self::MCC118, Self::MCC128, Self::MCC172]
            .into_iter()
            .find(|spec| spec.id == id)
    }

    /// Entries in the calibration table.
    pub fn calibration_entries(&self) -> usize {
        match self.calibration {
            CalibrationLayout::PerChannel => self.channels as usize,
            CalibrationLayout::PerRange => self.ranges.len(),
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.clock, ClockModel::Synced { .. })
    }

    /// Status reply length: flags byte plus two count fields.
    pub fn status_reply_len(&self) -> usize {
        1 + 2 * self.status_count_bytes
    }

    /// Samples per channel to buffer for a scan.
    pub fn buffer_capacity(&self, samples_per_channel: usize, rate: f64, continuous: bool) -> usize {
        if !continuous {
            return samples_per_channel;
        }
        let tier = self
            .buffer_tiers
            .iter()
            .find(|(bound, _)| rate <= *bound)
            .map(|&(_, size)| size)
            .unwrap_or(self.fallback_buffer);
        tier.max(samples_per_channel)
    }

    /// Device FIFO level at which the scan thread pulls data, aiming for a
    /// read every 100 ms.
    pub fn read_threshold(&self, adc_rate: f64, channel_count: usize) -> usize {
        let raw = if adc_rate == 0.0 || adc_rate > 2560.0 {
            256
        } else {
            (adc_rate / 10.0) as usize
        };
        let clamped = raw.min(self.max_samples_per_read);
        let normalized = clamped - clamped % channel_count;
        normalized.max(channel_count)
    }

    /// Per-channel rate the hardware will actually run at.
    pub fn actual_rate(&self, channel_count: u8, rate: f64) -> Result<f64> {
        if channel_count == 0 || channel_count > self.channels {
            return Err(HatError::bad_param(format!(
                "channel count {channel_count} outside 1..={}",
                self.channels
            )));
        }
        if rate.is_nan() || rate <= 0.0 {
            return Err(HatError::bad_param("sample rate must be positive"));
        }
        match self.clock {
            ClockModel::Period32 { timebase } => {
                if f64::from(channel_count) * rate > self.max_adc_rate {
                    return Err(HatError::bad_param("aggregate rate exceeds the board maximum"));
                }
                let period = period32(timebase, rate);
                Ok(timebase / (f64::from(period) + 1.0))
            }
            ClockModel::PeriodDivider { timebase } => {
                if f64::from(channel_count) * rate > self.max_adc_rate {
                    return Err(HatError::bad_param("aggregate rate exceeds the board maximum"));
                }
                let (period, divider) = period_with_divider(timebase, rate);
                Ok(timebase / (f64::from(divider) + 1.0) / (f64::from(period) + 1.0))
            }
            ClockModel::Synced { base_rate } => Ok(base_rate / f64::from(clock_divisor(base_rate, rate))),
        }
    }

    /// Payload of the scan start command.
    pub fn start_payload(&self, start: &StartRequest) -> Vec<u8> {
        let mut payload = Vec::with_capacity(10 + start.channels.len());
        payload.extend_from_slice(&start.scan_count.to_le_bytes());
        match self.clock {
            ClockModel::Period32 { timebase } => {
                let period = if start.ext_clock {
                    0
                } else {
                    period32(timebase, start.rate)
                };
                payload.extend_from_slice(&period.to_le_bytes());
                payload.push(channel_mask(&start.channels));
                payload.push(match start.trigger {
                    Some(mode) => 0x01 | ((mode as u8) << 1),
                    None => 0,
                });
            }
            ClockModel::PeriodDivider { timebase } => {
                let (period, divider) = if start.ext_clock {
                    (0, 0)
                } else {
                    period_with_divider(timebase, start.rate)
                };
                payload.extend_from_slice(&period.to_le_bytes());
                payload.push(divider);
                let mut opts = (start.channels.len() as u8).saturating_sub(1) & 0x07;
                if let Some(mode) = start.trigger {
                    opts |= 0x08 | ((mode as u8) << 4);
                }
                payload.push(opts);
                for &channel in &start.channels {
                    payload.push(
                        (start.range << 4) | ((start.input_mode as u8) << 3) | (channel & 0x07),
                    );
                }
            }
            ClockModel::Synced { .. } => {
                let mut mask = channel_mask(&start.channels);
                if start.trigger.is_some() {
                    mask |= 0x04;
                }
                payload.push(mask);
                payload.push(0);
            }
        }
        payload
    }

    /// Parse a start payload back into its essentials.
    pub fn decode_start(&self, payload: &[u8]) -> Option<DecodedStart> {
        let scan_count = u32::from_le_bytes(payload.get(0..4)?.try_into().ok()?);
        let (channels, ext_trigger) = match self.clock {
            ClockModel::Period32 { .. } => {
                let mask = *payload.get(8)?;
                (mask.count_ones() as u8, payload.get(9)? & 0x01 != 0)
            }
            ClockModel::PeriodDivider { .. } => {
                let opts = *payload.get(7)?;
                ((opts & 0x07) + 1, opts & 0x08 != 0)
            }
            ClockModel::Synced { .. } => {
                let mask = *payload.get(4)?;
                ((mask & 0x03).count_ones() as u8, mask & 0x04 != 0)
            }
        };
        Some(DecodedStart {
            scan_count,
            channels,
            ext_trigger,
        })
    }
}

/// Everything the board needs to begin a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    /// Samples per channel, 0 for continuous.
    pub scan_count: u32,
    pub channels: Vec<u8>,
    pub rate: f64,
    pub ext_clock: bool,
    pub trigger: Option<TriggerMode>,
    /// Range index, for per-range boards.
    pub range: u8,
    /// Input wiring, for per-range boards.
    pub input_mode: InputMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedStart {
    pub scan_count: u32,
    pub channels: u8,
    pub ext_trigger: bool,
}

/// Channel numbers set in `mask`, ascending.
pub fn channels_from_mask(mask: u8) -> Vec<u8> {
    (0..8).filter(|bit| mask & (1 << bit) != 0).collect()
}

fn channel_mask(channels: &[u8]) -> u8 {
    channels.iter().fold(0u8, |mask, &ch| mask | (1 << ch))
}

fn period32(timebase: f64, rate: f64) -> u32 {
    if rate <= timebase / f64::from(u32::MAX) {
        u32::MAX
    } else {
        ((timebase / rate + 0.5) as u32).saturating_sub(1)
    }
}

/// Smallest power-of-two prescaler that fits the period in 16 bits.
fn period_with_divider(timebase: f64, rate: f64) -> (u16, u8) {
    let mut divider: u32 = 1;
    let mut period;
    loop {
        period = ((timebase / f64::from(divider) / rate + 0.5) as u64).saturating_sub(1);
        if period <= 0xFFFF || divider >= 256 {
            break;
        }
        divider *= 2;
    }
    (period.min(0xFFFF) as u16, (divider - 1) as u8)
}

/// Integer divisor of the shared clock closest to `rate`, within 1..=256.
pub fn clock_divisor(base_rate: f64, rate: f64) -> u16 {
    let rate = rate.max(200.0);
    (base_rate / rate + 0.5).clamp(1.0, 256.0) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(channels: &[u8], rate: f64) -> StartRequest {
        StartRequest {
            scan_count: 1000,
            channels: channels.to_vec(),
            rate,
            ext_clock: false,
            trigger: None,
            range: 0,
            input_mode: InputMode::SingleEnded,
        }
    }

    #[test]
    fn mask_maps_to_ascending_channels() {
        assert_eq!(channels_from_mask(0b1010_0101), vec![0, 2, 5, 7]);
        assert_eq!(channels_from_mask(0x01).len(), 1);
        assert_eq!(channels_from_mask(0xFF).len(), 8);
        assert!(channels_from_mask(0).is_empty());
    }

    #[test]
    fn continuous_capacity_follows_rate_tiers() {
        let spec = BoardSpec::MCC118;
        assert_eq!(spec.buffer_capacity(0, 50.0, true), 1_000);
        assert_eq!(spec.buffer_capacity(0, 1_000.0, true), 10_000);
        assert_eq!(spec.buffer_capacity(0, 50_000.0, true), 100_000);
        assert_eq!(spec.buffer_capacity(0, 200_000.0, true), 10_000);
        assert_eq!(spec.buffer_capacity(25_000, 1_000.0, true), 25_000);
        assert_eq!(spec.buffer_capacity(123, 1_000.0, false), 123);
    }

    #[test]
    fn synced_board_uses_its_own_tiers() {
        let spec = BoardSpec::MCC172;
        assert_eq!(spec.buffer_capacity(0, 1_000.0, true), 1_000);
        assert_eq!(spec.buffer_capacity(0, 5_120.0, true), 10_000);
        assert_eq!(spec.buffer_capacity(0, 51_200.0, true), 100_000);
    }

    #[test]
    fn read_threshold_targets_tenth_of_a_second() {
        let spec = BoardSpec::MCC118;
        assert_eq!(spec.read_threshold(0.0, 3), 255);
        assert_eq!(spec.read_threshold(100_000.0, 2), 256);
        assert_eq!(spec.read_threshold(2_000.0, 2), 200);
        assert_eq!(spec.read_threshold(30.0, 8), 8);
        assert_eq!(spec.read_threshold(1_000.0, 3), 99);
    }

    #[test]
    fn actual_rate_rounds_to_the_timebase() {
        let rate = BoardSpec::MCC118.actual_rate(1, 3_000.0).unwrap();
        assert!((rate - 16e6 / 5333.0).abs() < 1e-9);
        assert!(matches!(
            BoardSpec::MCC118.actual_rate(2, 60_000.0),
            Err(HatError::BadParameter(_))
        ));
        assert!(BoardSpec::MCC118.actual_rate(0, 100.0).is_err());
    }

    #[test]
    fn slow_rates_use_the_prescaler() {
        let (period, divider) = period_with_divider(16e6, 10.0);
        assert!(period <= 0xFFFF);
        assert!(divider > 0);
        let rate = BoardSpec::MCC128.actual_rate(1, 10.0).unwrap();
        assert!((rate - 10.0).abs() / 10.0 < 0.01);
    }

    #[test]
    fn synced_rate_snaps_to_a_divisor() {
        let rate = BoardSpec::MCC172.actual_rate(2, 10_000.0).unwrap();
        assert_eq!(rate, 51_200.0 / 5.0);
    }

    #[test]
    fn mcc118_start_payload_layout() {
        let mut req = request(&[0, 3], 1_000.0);
        req.trigger = Some(TriggerMode::ActiveLow);
        let payload = BoardSpec::MCC118.start_payload(&req);
        assert_eq!(payload.len(), 10);
        assert_eq!(&payload[0..4], &1000u32.to_le_bytes());
        assert_eq!(&payload[4..8], &15_999u32.to_le_bytes());
        assert_eq!(payload[8], 0b1001);
        assert_eq!(payload[9], 0x01 | (3 << 1));
    }

    #[test]
    fn mcc128_start_payload_carries_a_channel_queue() {
        let mut req = request(&[1, 2, 6], 1_000.0);
        req.range = 2;
        req.trigger = Some(TriggerMode::FallingEdge);
        let payload = BoardSpec::MCC128.start_payload(&req);
        assert_eq!(payload.len(), 8 + 3);
        assert_eq!(payload[7], 2 | 0x08 | (1 << 4));
        assert_eq!(&payload[8..], &[0x21, 0x22, 0x26]);
    }

    #[test]
    fn differential_mode_sets_queue_bit_three() {
        let mut req = request(&[0, 3], 1_000.0);
        req.range = 1;
        req.input_mode = InputMode::Differential;
        let payload = BoardSpec::MCC128.start_payload(&req);
        assert_eq!(&payload[8..], &[0x18, 0x1B]);
        assert_eq!(InputMode::Differential.channel_count(8), 4);
        assert!(InputMode::try_from(2).is_err());
    }

    #[test]
    fn start_payload_decodes_for_every_board() {
        for spec in [BoardSpec::MCC118, BoardSpec::MCC128, BoardSpec::MCC172] {
            let mut req = request(&[0, 1], 1_000.0);
            req.trigger = Some(TriggerMode::RisingEdge);
            let decoded = spec.decode_start(&spec.start_payload(&req)).unwrap();
            assert_eq!(
                decoded,
                DecodedStart {
                    scan_count: 1000,
                    channels: 2,
                    ext_trigger: true
                },
                "{}",
                spec.name
            );
        }
    }

    #[test]
    fn lookup_by_product_id() {
        assert_eq!(BoardSpec::from_id(0x0146).map(|s| s.name), Some("MCC 128"));
        assert!(BoardSpec::from_id(0x0001).is_none());
        assert_eq!(BoardSpec::MCC128.calibration_entries(), 4);
        assert_eq!(BoardSpec::MCC172.status_reply_len(), 5);
        assert_eq!(BoardSpec::MCC128.status_reply_len(), 7);
    }

    #[test]
    fn trigger_mode_from_raw() {
        assert_eq!(TriggerMode::try_from(2).unwrap(), TriggerMode::ActiveHigh);
        assert!(TriggerMode::try_from(4).is_err());
        assert_eq!(ClockSource::try_from(1).unwrap(), ClockSource::Master);
        assert!(ClockSource::try_from(3).is_err());
    }
}
