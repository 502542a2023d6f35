// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Stateful decoding of the sample stream port.
//!
//! Turns raw stream frames into channel vectors for the trigger engine:
//! tracks the packet counter, watches the converter diagnostic, maps the
//! packed digital lines to their presentation voltages and, on affected
//! hardware revisions, runs the peaking-compensation filter over both
//! current channels.

use {
    tracing::{error, info, warn},
    cdc_currentmon_protocols::adc::{AdcPacket, DigitalLevels, LowPassFilter},
    crate::Error,
};

/// Diagnostic value above which the stream health is reported.
const DIAG_NOTICE: u64 = 4096;

/// Diagnostic value above which the stream health is alarming.
const DIAG_ALARM: u64 = 32768;

/// One packet of decoded channels ready for the trigger engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SamplePacket {
    pub count: u64,
    pub i: Vec<f64>,
    pub isnk: Vec<f64>,
    pub a0: Vec<f64>,
    pub d0: Vec<f64>,
    pub d1: Vec<f64>,
}

/// Stateful decoder for the sample stream.
pub struct AdcStream {
    levels: DigitalLevels,
    last_count: Option<u64>,
    counter_gaps: u64,
    filter: Option<(LowPassFilter, LowPassFilter)>,
}

impl Default for AdcStream {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl AdcStream {
    pub fn new(levels: DigitalLevels) -> Self {
        AdcStream {
            levels,
            last_count: None,
            counter_gaps: 0,
            filter: None,
        }
    }

    pub fn levels(&self) -> &DigitalLevels {
        &self.levels
    }

    /// Engage or release the peaking-compensation filter.
    pub fn set_filter(&mut self, enable: bool) {
        if enable == self.filter.is_some() {
            return;
        }
        self.filter = enable.then(|| (Default::default(), Default::default()));
    }

    pub fn filter_enabled(&self) -> bool {
        self.filter.is_some()
    }

    /// Counter discontinuities seen since the last reset.
    pub fn counter_gaps(&self) -> u64 {
        self.counter_gaps
    }

    /// Forget counter and filter history, e.g. across acquisition
    /// stop/start where a counter jump is expected.
    pub fn reset(&mut self) {
        self.last_count = None;
        self.counter_gaps = 0;
        if let Some((i, isnk)) = self.filter.as_mut() {
            i.reset();
            isnk.reset();
        }
    }

    /// Decode one stream frame.
    pub fn ingest(&mut self, frame: &[u8]) -> Result<SamplePacket, Error> {
        let packet = AdcPacket::from_bytes(frame)?;
        Ok(self.process(packet))
    }

    /// Post-process an already parsed packet.
    pub fn process(&mut self, packet: AdcPacket) -> SamplePacket {
        let AdcPacket {
            count,
            diagnostic,
            i,
            isnk,
            a0,
            d01,
        } = packet;

        if let Some(prev) = self.last_count {
            if count != prev.wrapping_add(1) {
                self.counter_gaps += 1;
                error!("sample counter jumped from {} to {}", prev, count);
            }
        }
        self.last_count = Some(count);

        if diagnostic > DIAG_ALARM {
            warn!("converter diagnostic at {}", diagnostic);
        } else if diagnostic > DIAG_NOTICE {
            info!("converter diagnostic at {}", diagnostic);
        }

        let (i, isnk) = match self.filter.as_mut() {
            Some((fi, fs)) => (fi.apply(&i), fs.apply(&isnk)),
            None => (i, isnk),
        };

        let d0 = d01.iter().map(|&b| self.levels.d0(b)).collect();
        let d1 = d01.iter().map(|&b| self.levels.d1(b)).collect();

        SamplePacket {
            count,
            i,
            isnk,
            a0,
            d0,
            d1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn packet(count: u64, i: Vec<f64>, d01: Vec<u8>) -> AdcPacket {
        let n = i.len();
        AdcPacket {
            count,
            diagnostic: 0,
            isnk: i.clone(),
            i,
            a0: vec![0.0; n],
            d01,
        }
    }

    #[test]
    fn counter_gaps_are_counted_not_fatal() {
        let mut stream = AdcStream::default();
        let _ = stream.process(packet(10, vec![0.0], vec![0]));
        let _ = stream.process(packet(11, vec![0.0], vec![0]));
        assert_eq!(stream.counter_gaps(), 0);
        let decoded = stream.process(packet(15, vec![1.0], vec![0]));
        assert_eq!(stream.counter_gaps(), 1);
        assert_eq!(decoded.i, vec![1.0]);

        // The first packet after a reset seeds the counter afresh.
        stream.reset();
        let _ = stream.process(packet(7, vec![0.0], vec![0]));
        assert_eq!(stream.counter_gaps(), 0);
    }

    #[test]
    fn digital_lines_map_to_presentation_voltages() {
        let mut stream = AdcStream::default();
        let decoded = stream.process(packet(0, vec![0.0; 4], vec![0x00, 0x01, 0x02, 0x03]));
        assert_eq!(decoded.d0, vec![20.0, 1020.0, 20.0, 1020.0]);
        assert_eq!(decoded.d1, vec![40.0, 40.0, 1140.0, 1140.0]);
    }

    #[test]
    fn filter_applies_to_both_current_channels() {
        let mut stream = AdcStream::default();
        stream.set_filter(true);
        assert!(stream.filter_enabled());
        let constant = stream.process(packet(0, vec![2.0; 50], vec![0; 50]));
        assert_eq!(constant.i, vec![2.0; 50]);
        assert_eq!(constant.isnk, vec![2.0; 50]);

        let stepped = stream.process(packet(1, vec![3.0; 50], vec![0; 50]));
        assert!(stepped.i[0] < 3.0);
        assert_eq!(stepped.i[2], 3.0);
    }

    #[test]
    fn engaging_the_filter_twice_keeps_its_state() {
        let mut stream = AdcStream::default();
        stream.set_filter(true);
        let _ = stream.process(packet(0, vec![5.0; 50], vec![0; 50]));
        stream.set_filter(true);
        let next = stream.process(packet(1, vec![5.0; 50], vec![0; 50]));
        assert_eq!(next.i, vec![5.0; 50]);
    }
}
