// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Consistent Overhead Byte Stuffing codec.
//!
//! The serial link delimits frames with zero bytes, so frame contents are
//! stuffed as described in Cheshire's paper: the stream becomes a sequence
//! of groups, each prefixed by a one-byte code giving the distance to the
//! next zero. A group of 254 non-zero bytes takes code 0xff and implies no
//! zero; when the phantom terminating zero falls exactly on such a group
//! boundary the final one-byte group is omitted and the receiver infers it.

use super::*;

/// Longest run of non-zero bytes one group can carry.
const MAX_RUN: usize = 254;

/// Stuff a frame so that it contains no zero byte.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / MAX_RUN + 2);
    let mut buf = Vec::with_capacity(data.len() + 1);
    buf.extend_from_slice(data);
    // Phantom zero terminating the final group.
    buf.push(0);

    let mut rest = buf.as_slice();
    while let Some(i) = rest.iter().position(|&b| b == 0) {
        if i >= MAX_RUN {
            out.push(0xff);
            out.extend_from_slice(&rest[..MAX_RUN]);
            rest = &rest[MAX_RUN..];
            if rest == [0] {
                break;
            }
        } else {
            out.push((i + 1) as u8);
            out.extend_from_slice(&rest[..i]);
            rest = &rest[i + 1..];
        }
    }

    out
}

/// Recover a frame from its stuffed form.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.is_empty() {
        return Err(Error::EmptyFrame);
    }

    let mut out = Vec::with_capacity(data.len());
    let mut idx = 0;
    let mut phantom = false;
    while idx < data.len() {
        let code = data[idx] as usize;
        if code == 0 {
            return Err(Error::CobsStrayZero);
        }
        let end = idx + code;
        if end > data.len() {
            return Err(Error::CobsTruncated);
        }
        out.extend_from_slice(&data[idx + 1..end]);
        idx = end;
        if code < 0xff {
            out.push(0);
            phantom = true;
        } else {
            phantom = false;
        }
    }

    if phantom {
        let _ = out.pop();
    }

    Ok(out)
}

/// Stuff a frame and delimit it with zero bytes on both sides.
///
/// The leading zero terminates any partial frame the receiver may hold
/// from an interrupted connection.
pub fn encode_delimited(data: &[u8]) -> Vec<u8> {
    let encoded = encode(data);
    let mut out = Vec::with_capacity(encoded.len() + 2);
    out.push(0);
    out.extend_from_slice(&encoded);
    out.push(0);
    out
}

/// Splits a continuous byte stream into frames and unstuffs each of them.
///
/// Bytes are accumulated across calls so frames may arrive in arbitrary
/// chunks. Empty frames (consecutive delimiters) are ignored and frames
/// that fail to decode are counted but otherwise skipped, which tolerates
/// the trailing garbage some bootloader revisions emit.
#[derive(Default, Debug)]
pub struct Deframer {
    acc: Vec<u8>,
    dropped: u64,
}

impl Deframer {
    /// Feed one chunk, invoking the callback for every decoded frame.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_frame: F)
    where
        F: FnMut(Vec<u8>),
    {
        self.acc.extend_from_slice(chunk);
        while let Some(pos) = self.acc.iter().position(|&b| b == 0) {
            let mut frame: Vec<u8> = self.acc.drain(..=pos).collect();
            let _ = frame.pop();
            if frame.is_empty() {
                continue;
            }
            match decode(&frame) {
                Ok(decoded) => on_frame(decoded),
                Err(_) => self.dropped += 1,
            }
        }
    }

    /// Number of frames skipped because they failed to decode.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn vectors() -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut tcs = vec![
            // From the paper.
            (
                hex("4500002C4C79000040064F37"),
                hex("024501042C4C79010540064F37"),
            ),
            // Empty frame.
            (vec![], vec![0x01]),
            // Single zero byte.
            (vec![0x00], vec![0x01, 0x01]),
            // Frame that ends with a zero.
            (b"123\x00".to_vec(), b"\x04123\x01".to_vec()),
            // Frame with no zero.
            (b"123".to_vec(), b"\x04123".to_vec()),
            // Single byte, no zero.
            (b"1".to_vec(), b"\x021".to_vec()),
            // Zero in the middle.
            (b"123\x00456".to_vec(), b"\x04123\x04456".to_vec()),
            // Only zeros.
            (vec![0x00; 10], vec![0x01; 11]),
        ];

        // One short of the 254 group boundary, without and with a zero.
        let run: Vec<u8> = (1..=253).collect();
        let mut enc = vec![0xfe];
        enc.extend_from_slice(&run);
        tcs.push((run.clone(), enc.clone()));
        let mut with_zero = run.clone();
        with_zero.push(0);
        let mut enc_zero = enc;
        enc_zero.push(0x01);
        tcs.push((with_zero, enc_zero));

        // Exactly at the 254 group boundary, without and with a zero.
        let run: Vec<u8> = (1..=254).collect();
        let mut enc = vec![0xff];
        enc.extend_from_slice(&run);
        tcs.push((run.clone(), enc.clone()));
        let mut with_zero = run.clone();
        with_zero.push(0);
        let mut enc_zero = enc;
        enc_zero.extend_from_slice(&[0x01, 0x01]);
        tcs.push((with_zero, enc_zero));

        // One beyond the 254 group boundary, without and with a zero.
        let mut run: Vec<u8> = (1..=254).collect();
        run.push(0xff);
        let mut enc = vec![0xff];
        enc.extend_from_slice(&run[..254]);
        enc.extend_from_slice(&[0x02, 0xff]);
        tcs.push((run.clone(), enc.clone()));
        let mut with_zero = run;
        with_zero.push(0);
        let mut enc_zero = enc;
        enc_zero.push(0x01);
        tcs.push((with_zero, enc_zero));

        tcs
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn codec_vectors() {
        for (plain, stuffed) in vectors() {
            assert_eq!(encode(&plain), stuffed, "encode {:02x?}", plain);
            assert_eq!(decode(&stuffed).unwrap(), plain, "decode {:02x?}", stuffed);
        }
    }

    #[test]
    fn long_frame_round_trip() {
        let plain: Vec<u8> = b"0123456789".repeat(150);
        let stuffed = encode(&plain);
        assert_eq!(stuffed[0], 0xff);
        assert_eq!(decode(&stuffed).unwrap(), plain);
    }

    #[test]
    fn zeros_round_trip() {
        let mut plain = vec![0u8];
        plain.extend_from_slice(&[b'1'; 254]);
        plain.extend_from_slice(b"\x00123456");
        assert_eq!(decode(&encode(&plain)).unwrap(), plain);
    }

    #[test]
    fn decode_rejects_invalid() {
        assert!(decode(&[]).is_err());
        // Group length runs past the end.
        assert!(decode(&[0x05, b'1', b'2']).is_err());
        // Stray zero inside the frame.
        assert!(decode(&[0x02, b'1', 0x00, 0x01]).is_err());
    }

    #[test]
    fn delimited_frame_is_zero_bounded() {
        let block = encode_delimited(b"123\x00456");
        assert_eq!(block[0], 0);
        assert_eq!(*block.last().unwrap(), 0);
        assert!(!block[1..block.len() - 1].contains(&0));
    }

    #[test]
    fn deframer_reassembles_split_chunks() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_delimited(b"first"));
        stream.extend_from_slice(&encode_delimited(b"second\x00frame"));
        let mut frames = Vec::new();
        let mut deframer = Deframer::default();
        // Hand the stream over one byte at a time.
        for b in stream {
            deframer.feed(&[b], |f| frames.push(f));
        }
        assert_eq!(frames, vec![b"first".to_vec(), b"second\x00frame".to_vec()]);
        assert_eq!(deframer.dropped(), 0);
    }

    #[test]
    fn deframer_tolerates_leading_zeros_and_garbage() {
        let mut stream = vec![0, 0, 0];
        stream.extend_from_slice(&encode_delimited(b"payload"));
        // Up to four bytes of garbage between frames, as some bootloader
        // revisions emit. The garbage forms a bogus frame which must be
        // skipped without disturbing its neighbours.
        stream.extend_from_slice(&[0x09, 0xaa, 0xbb, 0xcc]);
        stream.extend_from_slice(&encode_delimited(b"after"));
        let mut frames = Vec::new();
        let mut deframer = Deframer::default();
        deframer.feed(&stream, |f| frames.push(f));
        assert_eq!(frames, vec![b"payload".to_vec(), b"after".to_vec()]);
        assert_eq!(deframer.dropped(), 1);
    }
}
