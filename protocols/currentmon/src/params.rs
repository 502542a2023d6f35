// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Acquisition parameters of the instrument.

/// Samples produced per second on every channel of the data stream.
pub const SAMPLE_RATE: f64 = 125_000.0;

/// Wall-clock duration of one full acquisition window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimebaseSpan {
    Ms10,
    Ms20,
    Ms50,
    Ms100,
    Ms200,
    Ms500,
    S1,
    S2,
    S5,
    S10,
}

impl Default for TimebaseSpan {
    fn default() -> Self {
        Self::Ms100
    }
}

/// The selectable timebase spans, shortest first.
pub const TIMEBASE_SPANS: &[TimebaseSpan] = &[
    TimebaseSpan::Ms10,
    TimebaseSpan::Ms20,
    TimebaseSpan::Ms50,
    TimebaseSpan::Ms100,
    TimebaseSpan::Ms200,
    TimebaseSpan::Ms500,
    TimebaseSpan::S1,
    TimebaseSpan::S2,
    TimebaseSpan::S5,
    TimebaseSpan::S10,
];

impl TimebaseSpan {
    pub fn seconds(&self) -> f64 {
        match self {
            Self::Ms10 => 0.010,
            Self::Ms20 => 0.020,
            Self::Ms50 => 0.050,
            Self::Ms100 => 0.100,
            Self::Ms200 => 0.200,
            Self::Ms500 => 0.500,
            Self::S1 => 1.0,
            Self::S2 => 2.0,
            Self::S5 => 5.0,
            Self::S10 => 10.0,
        }
    }

    /// Number of samples per channel in a window of this span.
    pub fn num_samples(&self) -> usize {
        (SAMPLE_RATE * self.seconds()).round() as usize
    }
}

/// Signal the trigger comparator watches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerSource {
    /// Fire as soon as the window is full.
    None,
    /// Source current.
    Current,
    /// Digital line 0.
    D0,
    /// Digital line 1.
    D1,
    /// Auxiliary analog input.
    A0,
}

impl Default for TriggerSource {
    fn default() -> Self {
        Self::None
    }
}

/// Location of the trigger point inside the window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerPosition {
    Left,
    Center,
    Right,
}

impl Default for TriggerPosition {
    fn default() -> Self {
        Self::Center
    }
}

impl TriggerPosition {
    /// Sample index at which the level comparison runs.
    pub fn index(&self, num_samples: usize) -> usize {
        match self {
            Self::Left => num_samples / 4,
            Self::Center => num_samples / 2,
            Self::Right => num_samples - num_samples / 4,
        }
    }

    /// Time of the first window sample relative to the trigger point.
    pub fn start_time(&self, span_seconds: f64) -> f64 {
        match self {
            Self::Left => -span_seconds / 4.0,
            Self::Center => -span_seconds / 2.0,
            Self::Right => -3.0 * span_seconds / 4.0,
        }
    }
}

/// Edge direction that fires the trigger.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerSlope {
    Rise,
    Fall,
    /// Resolve to rise or fall from the signal state at the start of each
    /// packet.
    Either,
}

impl Default for TriggerSlope {
    fn default() -> Self {
        Self::Rise
    }
}

/// Complete trigger setup.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TriggerConfig {
    pub source: TriggerSource,
    pub position: TriggerPosition,
    pub slope: TriggerSlope,
    /// Comparison level in the unit of the source channel.
    pub level: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            source: Default::default(),
            position: Default::default(),
            slope: Default::default(),
            level: 1.0,
        }
    }
}

/// How completed windows are handed to the consumer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AcquireMode {
    /// Rearm after every consumed window.
    Run,
    /// Fire once per start.
    Single,
    /// Stream every full window without level detection.
    Logger,
}

impl Default for AcquireMode {
    fn default() -> Self {
        Self::Run
    }
}

/// Selectable internal calibration loads.
///
/// Several loads can be engaged at once; the resulting resistances sit in
/// parallel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CalLoad {
    R2k,
    R20k,
    R200k,
    R2m,
}

impl CalLoad {
    fn bit(&self) -> u32 {
        match self {
            Self::R2k => 0x10,
            Self::R20k => 0x20,
            Self::R200k => 0x40,
            Self::R2m => 0x80,
        }
    }

    /// Bit mask engaging the given loads; an empty list disengages all.
    pub fn mask(loads: &[CalLoad]) -> u32 {
        loads.iter().fold(0, |mask, load| mask | load.bit())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn window_sizes() {
        let expected = [
            1_250, 2_500, 6_250, 12_500, 25_000, 62_500, 125_000, 250_000, 625_000, 1_250_000,
        ];
        TIMEBASE_SPANS
            .iter()
            .zip(expected)
            .for_each(|(span, n)| assert_eq!(span.num_samples(), n, "{:?}", span));
    }

    #[test]
    fn trigger_index() {
        assert_eq!(TriggerPosition::Left.index(1250), 312);
        assert_eq!(TriggerPosition::Center.index(1250), 625);
        assert_eq!(TriggerPosition::Right.index(1250), 938);
        assert_eq!(TriggerPosition::Right.index(2500), 1875);
    }

    #[test]
    fn trigger_start_time() {
        assert_eq!(TriggerPosition::Center.start_time(0.010), -0.005);
        assert_eq!(TriggerPosition::Left.start_time(0.010), -0.0025);
        assert_eq!(TriggerPosition::Right.start_time(0.010), -0.0075);
    }

    #[test]
    fn cal_load_mask() {
        assert_eq!(CalLoad::mask(&[]), 0);
        assert_eq!(CalLoad::mask(&[CalLoad::R2k]), 0x10);
        assert_eq!(
            CalLoad::mask(&[CalLoad::R2k, CalLoad::R2m, CalLoad::R200k]),
            0xd0
        );
    }
}
