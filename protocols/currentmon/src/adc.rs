// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Sample packets on the data stream port.
//!
//! The firmware streams one CBOR map per packet with 50 samples per
//! channel. Current channels arrive as byte strings of little-endian
//! 32 bit floats scaled such that division by one million yields mA; the
//! auxiliary analog channel is packed little-endian u16, and the two
//! digital lines share one byte per sample.

use super::*;

use minicbor::Decoder;

/// Number of samples per channel in one stream packet.
pub const SAMPLES_PER_PACKET: usize = 50;

/// Raw fields of one decoded sample packet.
#[derive(Debug, Clone, PartialEq)]
pub struct AdcPacket {
    /// Packet counter, incremented by one per packet.
    pub count: u64,
    /// Aggregate converter diagnostic.
    pub diagnostic: u64,
    /// Source current in mA.
    pub i: Vec<f64>,
    /// Sink current in mA.
    pub isnk: Vec<f64>,
    /// Auxiliary analog input in converter counts.
    pub a0: Vec<f64>,
    /// Packed digital line states; bit 0 is D0 and bit 1 is D1.
    pub d01: Vec<u8>,
}

impl AdcPacket {
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let mut d = Decoder::new(data);
        let len = d.map()?.ok_or(Error::NotMap)?;

        let mut count = None;
        let mut diagnostic = None;
        let mut i = None;
        let mut isnk = None;
        let mut a0 = None;
        let mut d01 = None;

        for _ in 0..len {
            match d.str()? {
                "c" => count = Some(d.u64()?),
                "a" => diagnostic = Some(d.u64()?),
                "i" => i = Some(decode_f32_channel("i", d.bytes()?)?),
                "isnk" => isnk = Some(decode_f32_channel("isnk", d.bytes()?)?),
                "a0" => a0 = Some(decode_u16_channel("a0", d.bytes()?)?),
                "d01" => d01 = Some(d.bytes()?.to_vec()),
                _ => d.skip()?,
            }
        }

        let packet = AdcPacket {
            count: count.ok_or(Error::MissingField("c"))?,
            diagnostic: diagnostic.ok_or(Error::MissingField("a"))?,
            i: i.ok_or(Error::MissingField("i"))?,
            isnk: isnk.ok_or(Error::MissingField("isnk"))?,
            a0: a0.ok_or(Error::MissingField("a0"))?,
            d01: d01.ok_or(Error::MissingField("d01"))?,
        };

        let n = packet.i.len();
        if packet.isnk.len() != n || packet.a0.len() != n || packet.d01.len() != n {
            return Err(Error::ChannelMismatch);
        }

        Ok(packet)
    }
}

fn decode_f32_channel(name: &'static str, data: &[u8]) -> Result<Vec<f64>, Error> {
    if data.len() % 4 > 0 {
        return Err(Error::ChannelLength(name, data.len(), 4));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| {
            let raw = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            round6(f64::from(raw) / 1_000_000.0)
        })
        .collect())
}

fn decode_u16_channel(name: &'static str, data: &[u8]) -> Result<Vec<f64>, Error> {
    if data.len() % 2 > 0 {
        return Err(Error::ChannelLength(name, data.len(), 2));
    }
    Ok(data
        .chunks_exact(2)
        .map(|c| f64::from(u16::from_le_bytes([c[0], c[1]])))
        .collect())
}

/// Round to six decimal places for stable downstream formatting.
pub(crate) fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

/// Presentation voltages the digital line states are mapped to.
///
/// These place the lines at convenient heights when plotted next to the
/// analog channels; they do not reflect electrical levels.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DigitalLevels {
    pub d0_low: f64,
    pub d0_high: f64,
    pub d1_low: f64,
    pub d1_high: f64,
}

impl Default for DigitalLevels {
    fn default() -> Self {
        Self {
            d0_low: 20.0,
            d0_high: 1000.0,
            d1_low: 40.0,
            d1_high: 1100.0,
        }
    }
}

impl DigitalLevels {
    /// Presentation value of line D0 in a packed sample.
    pub fn d0(&self, d01: u8) -> f64 {
        f64::from(d01 & 0x1) * self.d0_high + self.d0_low
    }

    /// Presentation value of line D1 in a packed sample.
    pub fn d1(&self, d01: u8) -> f64 {
        f64::from((d01 >> 1) & 0x1) * self.d1_high + self.d1_low
    }

    /// Level a digital trigger compares against.
    pub fn digital_threshold(&self) -> f64 {
        self.d0_high / 2.0
    }
}

/// Weights of the peaking-compensation moving average.
const FILTER_WEIGHTS: [f64; 3] = [0.11, 0.78, 0.11];

/// Three-tap moving average carried across packet boundaries.
///
/// Compensates input stage peaking on affected hardware revisions. The
/// last two raw samples of each packet seed the next one so the response
/// is continuous over the packet stream; the very first packet seeds the
/// carry with its own leading samples.
#[derive(Debug, Default, Clone)]
pub struct LowPassFilter {
    carry: Option<[f64; 2]>,
}

impl LowPassFilter {
    /// Filter one packet worth of samples.
    pub fn apply(&mut self, samples: &[f64]) -> Vec<f64> {
        if samples.len() < 2 {
            return samples.to_vec();
        }

        let carry = self.carry.unwrap_or([samples[0], samples[1]]);
        let mut padded = Vec::with_capacity(samples.len() + 2);
        padded.extend_from_slice(&carry);
        padded.extend_from_slice(samples);

        self.carry = Some([samples[samples.len() - 2], samples[samples.len() - 1]]);

        padded
            .windows(3)
            .map(|w| {
                round6(
                    w[0] * FILTER_WEIGHTS[0] + w[1] * FILTER_WEIGHTS[1] + w[2] * FILTER_WEIGHTS[2],
                )
            })
            .collect()
    }

    /// Forget the carried samples, e.g. across acquisition restarts.
    pub fn reset(&mut self) {
        self.carry = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use minicbor::Encoder;

    pub fn packet_bytes(count: u64, diagnostic: u64, i_ua: &[f32], a0: &[u16], d01: &[u8]) -> Vec<u8> {
        let mut i_bytes = Vec::new();
        i_ua.iter()
            .for_each(|v| i_bytes.extend_from_slice(&v.to_le_bytes()));
        let mut a0_bytes = Vec::new();
        a0.iter()
            .for_each(|v| a0_bytes.extend_from_slice(&v.to_le_bytes()));

        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.map(6).unwrap();
        e.str("c").unwrap();
        e.u64(count).unwrap();
        e.str("a").unwrap();
        e.u64(diagnostic).unwrap();
        e.str("i").unwrap();
        e.bytes(&i_bytes).unwrap();
        e.str("isnk").unwrap();
        e.bytes(&i_bytes).unwrap();
        e.str("a0").unwrap();
        e.bytes(&a0_bytes).unwrap();
        e.str("d01").unwrap();
        e.bytes(d01).unwrap();
        buf
    }

    #[test]
    fn packet_decode() {
        let bytes = packet_bytes(
            42,
            100,
            &[1_000_000.0, 2_500_000.0, -500_000.0],
            &[0, 512, 4095],
            &[0x00, 0x01, 0x03],
        );
        let packet = AdcPacket::from_bytes(&bytes).unwrap();
        assert_eq!(packet.count, 42);
        assert_eq!(packet.diagnostic, 100);
        assert_eq!(packet.i, vec![1.0, 2.5, -0.5]);
        assert_eq!(packet.isnk, packet.i);
        assert_eq!(packet.a0, vec![0.0, 512.0, 4095.0]);
        assert_eq!(packet.d01, vec![0x00, 0x01, 0x03]);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.map(7).unwrap();
        e.str("c").unwrap();
        e.u64(1).unwrap();
        e.str("a").unwrap();
        e.u64(0).unwrap();
        e.str("d0s").unwrap();
        e.bytes(b"LLH").unwrap();
        e.str("i").unwrap();
        e.bytes(&1.0f32.to_le_bytes()).unwrap();
        e.str("isnk").unwrap();
        e.bytes(&1.0f32.to_le_bytes()).unwrap();
        e.str("a0").unwrap();
        e.bytes(&100u16.to_le_bytes()).unwrap();
        e.str("d01").unwrap();
        e.bytes(&[1]).unwrap();
        let packet = AdcPacket::from_bytes(&buf).unwrap();
        assert_eq!(packet.i.len(), 1);
    }

    #[test]
    fn mismatched_channels_are_rejected() {
        let bytes = packet_bytes(0, 0, &[1.0, 2.0], &[1], &[0, 0]);
        assert!(matches!(
            AdcPacket::from_bytes(&bytes),
            Err(Error::ChannelMismatch)
        ));
    }

    #[test]
    fn odd_channel_length_is_rejected() {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.map(1).unwrap();
        e.str("a0").unwrap();
        e.bytes(&[0x01]).unwrap();
        assert!(matches!(
            AdcPacket::from_bytes(&buf),
            Err(Error::ChannelLength("a0", 1, 2))
        ));
    }

    #[test]
    fn digital_levels() {
        let levels = DigitalLevels::default();
        assert_eq!(levels.d0(0x00), 20.0);
        assert_eq!(levels.d0(0x01), 1020.0);
        assert_eq!(levels.d1(0x01), 40.0);
        assert_eq!(levels.d1(0x02), 1140.0);
        assert_eq!(levels.digital_threshold(), 500.0);
    }

    #[test]
    fn filter_passes_constant_input() {
        let mut filter = LowPassFilter::default();
        let samples = vec![1.5; 50];
        assert_eq!(filter.apply(&samples), samples);
        assert_eq!(filter.apply(&samples), samples);
    }

    #[test]
    fn filter_output_length_matches_input() {
        let mut filter = LowPassFilter::default();
        let samples: Vec<f64> = (0..50).map(f64::from).collect();
        assert_eq!(filter.apply(&samples).len(), samples.len());
    }

    #[test]
    fn filter_carries_across_packets() {
        let mut filter = LowPassFilter::default();
        let _ = filter.apply(&[0.0; 50]);
        let stepped = filter.apply(&[1.0; 50]);
        // First two outputs still see the carried zeros.
        assert_eq!(stepped[0], 0.11);
        assert_eq!(stepped[1], round6(0.78 + 0.11));
        assert_eq!(stepped[2], 1.0);
    }
}
