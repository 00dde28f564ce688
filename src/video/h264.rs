//! Splits the raw H.264 Annex B byte stream into access units.
//!
//! The drone sends the encoder output as-is, cut into datagrams of at most
//! [`FRAGMENT_SIZE`] bytes. A datagram shorter than that ends the current
//! NAL unit. Parameter sets and other non-picture NAL units are grouped with
//! the slice that follows them; a complete slice closes the access unit.

use bytes::{BufMut, Bytes, BytesMut};

/// Largest video datagram the drone sends.
pub const FRAGMENT_SIZE: usize = 1460;

/// Upper bound on buffered, unassembled data
const MAX_BUFFER_SIZE: usize = 2 * 1024 * 1024;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    SliceNonIdr,
    SliceIdr,
    Sei,
    Sps,
    Pps,
    Aud,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => NalUnitType::SliceNonIdr,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            n => NalUnitType::Other(n),
        }
    }
}

impl NalUnitType {
    pub fn is_slice(&self) -> bool {
        matches!(self, NalUnitType::SliceNonIdr | NalUnitType::SliceIdr)
            || matches!(self, NalUnitType::Other(2..=4))
    }
}

/// Everything needed to decode one picture, in Annex B form (each NAL unit
/// prefixed with a 4-byte start code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Counts every access unit assembled, so gaps in published frames show
    /// where decoding failed.
    pub seq: u64,
    pub keyframe: bool,
    pub data: Bytes,
}

#[derive(Debug, Default)]
pub struct AccessUnitAssembler {
    /// Raw bytes not yet split into NAL units
    buffer: BytesMut,
    /// NAL units collected for the access unit being built
    pending: BytesMut,
    pending_keyframe: bool,
    next_seq: u64,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one datagram and returns every access unit it completed.
    pub fn push(&mut self, datagram: &[u8]) -> Vec<AccessUnit> {
        self.buffer.extend_from_slice(datagram);

        if self.buffer.len() + self.pending.len() > MAX_BUFFER_SIZE {
            warn!(
                "video buffer exceeded {} bytes without a complete frame, resetting",
                MAX_BUFFER_SIZE
            );
            self.reset();
            return Vec::new();
        }

        let mut units = Vec::new();

        while let Some(nal) = self.next_nal(false) {
            self.add_nal(nal, &mut units);
        }

        if datagram.len() < FRAGMENT_SIZE {
            if let Some(nal) = self.next_nal(true) {
                self.add_nal(nal, &mut units);
            }
        }

        units
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending.clear();
        self.pending_keyframe = false;
    }

    fn add_nal(&mut self, nal: Bytes, units: &mut Vec<AccessUnit>) {
        let nal_type = NalUnitType::from(nal[0]);

        self.pending.put_slice(&START_CODE);
        self.pending.put_slice(&nal);

        if nal_type == NalUnitType::SliceIdr {
            self.pending_keyframe = true;
        }

        if nal_type.is_slice() {
            let seq = self.next_seq;
            self.next_seq += 1;

            units.push(AccessUnit {
                seq,
                keyframe: std::mem::take(&mut self.pending_keyframe),
                data: self.pending.split().freeze(),
            });
        }
    }

    /// Takes the next complete NAL unit off the buffer. A NAL unit is
    /// complete once the next start code has arrived, or, with
    /// `to_end`, at the end of the buffer.
    fn next_nal(&mut self, to_end: bool) -> Option<Bytes> {
        loop {
            let start = find_start_code(&self.buffer, 0)?;
            let body = start + start_code_len(&self.buffer, start);

            let end = match find_start_code(&self.buffer, body) {
                Some(end) => end,
                None if to_end && body < self.buffer.len() => self.buffer.len(),
                None => {
                    // keep the partial unit, drop anything before its start
                    let _ = self.buffer.split_to(start);
                    return None;
                }
            };

            let _ = self.buffer.split_to(body);
            let nal = self.buffer.split_to(end - body).freeze();

            // two start codes back to back
            if nal.is_empty() {
                continue;
            }

            return Some(nal);
        }
    }
}

fn find_start_code(buf: &[u8], offset: usize) -> Option<usize> {
    if buf.len() < offset + 3 {
        return None;
    }

    (offset..buf.len() - 2)
        .find(|&i| buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1)
        .map(|i| {
            // prefer the 4-byte form
            if i > offset && buf[i - 1] == 0 {
                i - 1
            } else {
                i
            }
        })
}

fn start_code_len(buf: &[u8], pos: usize) -> usize {
    if buf[pos..].starts_with(&START_CODE) {
        4
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(header: u8, len: usize) -> Vec<u8> {
        let mut v = START_CODE.to_vec();
        v.push(header);
        v.extend(std::iter::repeat(0xAB).take(len));
        v
    }

    #[test]
    fn groups_parameter_sets_with_keyframe() {
        let mut asm = AccessUnitAssembler::new();

        let mut stream = nal(0x67, 10); // sps
        stream.extend(nal(0x68, 4)); // pps
        stream.extend(nal(0x65, 100)); // idr slice

        // short datagram, so the final slice is complete
        let units = asm.push(&stream);

        assert_eq!(units.len(), 1);
        assert!(units[0].keyframe);
        assert_eq!(units[0].seq, 0);
        assert_eq!(units[0].data.len(), stream.len());
        assert_eq!(&units[0].data[..], &stream[..]);
    }

    #[test]
    fn full_size_fragments_wait_for_next_start_code() {
        let mut asm = AccessUnitAssembler::new();

        let slice = nal(0x41, 2 * FRAGMENT_SIZE + 5);
        let (first, rest) = slice.split_at(FRAGMENT_SIZE);
        let (second, tail) = rest.split_at(FRAGMENT_SIZE);

        assert!(asm.push(first).is_empty());
        assert!(asm.push(second).is_empty());

        // short tail fragment ends the slice
        let units = asm.push(tail);
        assert_eq!(units.len(), 1);
        assert!(!units[0].keyframe);
        assert_eq!(&units[0].data[..], &slice[..]);

        let units = asm.push(&nal(0x41, 20));
        assert_eq!(units[0].seq, 1);
    }

    #[test]
    fn accepts_three_byte_start_codes() {
        let mut asm = AccessUnitAssembler::new();

        let mut stream = vec![0, 0, 1, 0x67, 1, 2, 3];
        stream.extend([0, 0, 1, 0x41, 9, 9, 9]);

        let units = asm.push(&stream);
        assert_eq!(units.len(), 1);
        assert_eq!(
            &units[0].data[..],
            &[0, 0, 0, 1, 0x67, 1, 2, 3, 0, 0, 0, 1, 0x41, 9, 9, 9][..]
        );
    }

    #[test]
    fn discards_garbage_before_first_start_code() {
        let mut asm = AccessUnitAssembler::new();

        let mut stream = vec![0xFF, 0x12, 0x34];
        stream.extend(nal(0x41, 8));

        let units = asm.push(&stream);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data[4], 0x41);
    }

    #[test]
    fn overflowing_buffer_resets_and_recovers() {
        let mut asm = AccessUnitAssembler::new();

        // full-size chunks with no start code never complete a unit
        let junk = vec![0xAB; 64 * 1024];
        let mut reset = false;
        for _ in 0..(MAX_BUFFER_SIZE / junk.len() + 1) {
            assert!(asm.push(&junk).is_empty());
            if asm.buffer.is_empty() {
                reset = true;
                break;
            }
        }
        assert!(reset);
        assert!(asm.pending.is_empty());

        let units = asm.push(&nal(0x41, 20));
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].data[..], &nal(0x41, 20)[..]);
    }
}
