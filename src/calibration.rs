//! Raw ADC code → calibrated sample conversion.
//!
//! Every board sends fixed-width codes. The pipeline is:
//! decode (width, sign, byte order, inversion) → optional linear calibration
//! → optional scaling to volts or engineering units.

/// Wire encoding of one raw sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    /// Significant bits in the code.
    pub bits: u8,
    /// Bytes per sample on the wire.
    pub bytes: u8,
    pub signed: bool,
    /// The device reports `max_code - code`.
    pub inverted: bool,
    pub big_endian: bool,
}

impl SampleFormat {
    pub const fn unsigned_le(bits: u8, bytes: u8) -> Self {
        Self {
            bits,
            bytes,
            signed: false,
            inverted: false,
            big_endian: false,
        }
    }

    pub const fn inverted(mut self) -> Self {
        self.inverted = true;
        self
    }

    pub const fn signed_be(bits: u8, bytes: u8) -> Self {
        Self {
            bits,
            bytes,
            signed: true,
            inverted: false,
            big_endian: true,
        }
    }

    pub fn min_code(&self) -> i64 {
        if self.signed {
            -(1i64 << (self.bits - 1))
        } else {
            0
        }
    }

    pub fn max_code(&self) -> i64 {
        if self.signed {
            (1i64 << (self.bits - 1)) - 1
        } else {
            (1i64 << self.bits) - 1
        }
    }

    /// Decode one sample. `raw` must hold exactly `bytes` bytes.
    pub fn decode(&self, raw: &[u8]) -> i64 {
        let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        let value = if self.big_endian {
            raw.iter().fold(0u64, fold)
        } else {
            raw.iter().rev().fold(0u64, fold)
        };
        let value = value & ((1u64 << self.bits) - 1);

        let code = if self.signed && value & (1u64 << (self.bits - 1)) != 0 {
            value as i64 - (1i64 << self.bits)
        } else {
            value as i64
        };

        if self.inverted {
            self.max_code() - code
        } else {
            code
        }
    }

    /// Inverse of [`decode`](Self::decode); codes outside the range are clamped.
    pub fn encode(&self, code: i64, out: &mut [u8]) {
        let code = code.clamp(self.min_code(), self.max_code());
        let wire = if self.inverted {
            self.max_code() - code
        } else {
            code
        };
        let value = (wire as u64) & ((1u64 << self.bits) - 1);
        let n = self.bytes as usize;
        for (i, slot) in out.iter_mut().take(n).enumerate() {
            let shift = if self.big_endian { 8 * (n - 1 - i) } else { 8 * i };
            *slot = (value >> shift) as u8;
        }
    }
}

/// Order in which slope and offset are applied.
///
/// Both are identity at slope 1, offset 0; a board uses one consistently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrateConvention {
    /// `code * slope + offset`
    GainThenOffset,
    /// `(code - offset) * slope`
    OffsetThenGain,
}

/// Conversion from calibrated codes to output units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleMode {
    /// Volts across a fixed input range: `(v - min_code) * lsb + range_min`.
    Range { lsb: f64, min_code: f64, range_min: f64 },
    /// Sensor units: `v * lsb / sensitivity`, sensitivity in volts per unit.
    Sensitivity { lsb: f64, sensitivity: f64 },
}

impl ScaleMode {
    pub fn for_range(format: &SampleFormat, range_min: f64, range_max: f64) -> Self {
        ScaleMode::Range {
            lsb: lsb_size(format, range_min, range_max),
            min_code: format.min_code() as f64,
            range_min,
        }
    }

    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            ScaleMode::Range {
                lsb,
                min_code,
                range_min,
            } => (value - min_code) * lsb + range_min,
            ScaleMode::Sensitivity { lsb, sensitivity } => value * lsb / sensitivity,
        }
    }
}

/// Voltage represented by one code step.
pub fn lsb_size(format: &SampleFormat, range_min: f64, range_max: f64) -> f64 {
    (range_max - range_min) / ((format.max_code() - format.min_code() + 1) as f64)
}

/// Coefficients applied to every sample of one scanned channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelCal {
    pub slope: f64,
    pub offset: f64,
    pub convention: CalibrateConvention,
    pub scale: ScaleMode,
}

/// Convert one decoded code.
///
/// With both flags off the code passes through unchanged.
pub fn calibrate(code: i64, cal: &ChannelCal, calibrate: bool, scale: bool) -> f64 {
    let mut value = code as f64;
    if calibrate {
        value = match cal.convention {
            CalibrateConvention::GainThenOffset => value * cal.slope + cal.offset,
            CalibrateConvention::OffsetThenGain => (value - cal.offset) * cal.slope,
        };
    }
    if scale {
        value = cal.scale.apply(value);
    }
    value
}
