//! Reassembly of PSI sections from 188-byte TS packets.
//!
//! One [`SectionReassembler`] watches a single PID. Packets are pushed in
//! arrival order with [`feed`](SectionReassembler::feed); completed,
//! CRC-checked sections accumulate in an internal queue and are consumed
//! one at a time with [`pop_section`](SectionReassembler::pop_section).
//! Appending and popping are serialized by a queue mutex so a producer
//! and a separate consumer can share the reassembler.

use super::{Section, TsPacket};
use bytes::{Bytes, BytesMut};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;

const SECTION_HEADER_LEN: usize = 3;
const STUFFING_BYTE: u8 = 0xFF;

/// Rebuilds PSI sections carried on one PID.
#[derive(Debug)]
pub struct SectionReassembler {
    pid: u16,
    partial: BytesMut,
    /// Total byte length of the in-progress section, 0 while the three
    /// header bytes carrying section_length are still incomplete.
    expected: usize,
    last_cc: Option<u8>,
    /// A payload-unit-start has been seen; continuation packets before
    /// the first one cannot be attributed to any section.
    synced: bool,
    completed: Mutex<VecDeque<Section>>,
}

impl SectionReassembler {
    /// Creates a reassembler for the given PID.
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            partial: BytesMut::new(),
            expected: 0,
            last_cc: None,
            synced: false,
            completed: Mutex::new(VecDeque::new()),
        }
    }

    /// PID this reassembler watches.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Feeds one TS packet. Completed sections are queued for
    /// [`pop_section`](Self::pop_section).
    pub fn feed(&mut self, pkt: &TsPacket<'_>) {
        if pkt.transport_error() || pkt.pid() != self.pid {
            return;
        }
        let Some(payload) = pkt.payload() else {
            return;
        };

        let cc = pkt.continuity_counter();
        if let Some(last) = self.last_cc {
            if cc == last {
                // Duplicate packet
                return;
            }
            if cc != (last + 1) & 0x0F {
                debug!(
                    "pid {}: continuity discontinuity ({} -> {}), dropping partial section",
                    self.pid, last, cc
                );
                self.drop_partial();
            }
        }
        self.last_cc = Some(cc);

        if pkt.payload_unit_start() {
            let pointer = payload[0] as usize;
            if 1 + pointer > payload.len() {
                debug!("pid {}: pointer_field beyond payload", self.pid);
                self.drop_partial();
                return;
            }
            // Bytes before the pointer close the section in progress.
            let (tail, fresh) = payload[1..].split_at(pointer);
            if self.synced && !self.partial.is_empty() {
                self.consume(tail);
            }
            self.drop_partial();
            self.synced = true;
            self.consume(fresh);
        } else if self.synced && !self.partial.is_empty() {
            self.consume(payload);
        }
    }

    /// Pops one completed section, oldest first.
    pub fn pop_section(&self) -> Option<Section> {
        self.completed.lock().pop_front()
    }

    /// Drops any partially reassembled state.
    pub fn reset(&mut self) {
        self.drop_partial();
        self.last_cc = None;
        self.synced = false;
    }

    fn drop_partial(&mut self) {
        self.partial.clear();
        self.expected = 0;
    }

    /// Appends bytes to the in-progress section, emitting every section
    /// completed along the way. Several back-to-back sections in one
    /// payload are handled.
    fn consume(&mut self, mut buf: &[u8]) {
        while !buf.is_empty() {
            if self.partial.is_empty() && buf[0] == STUFFING_BYTE {
                return;
            }
            if self.expected == 0 {
                let need = SECTION_HEADER_LEN - self.partial.len();
                let take = need.min(buf.len());
                self.partial.extend_from_slice(&buf[..take]);
                buf = &buf[take..];
                if self.partial.len() == SECTION_HEADER_LEN {
                    let section_length =
                        ((self.partial[1] as usize & 0x0F) << 8) | self.partial[2] as usize;
                    self.expected = SECTION_HEADER_LEN + section_length;
                }
                continue;
            }
            let need = self.expected - self.partial.len();
            let take = need.min(buf.len());
            self.partial.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.partial.len() == self.expected {
                self.finish();
            }
        }
    }

    fn finish(&mut self) {
        let bytes: Bytes = self.partial.split().freeze();
        self.expected = 0;
        let section = Section::new(self.pid, bytes);
        if section.crc_valid() {
            self.completed.lock().push_back(section);
        } else {
            debug!("pid {}: section with bad CRC dropped", self.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::testutil::{build_section, packetize};
    use crate::psi::TABLE_ID_PAT;

    #[test]
    fn test_single_packet_section() {
        let section = build_section(TABLE_ID_PAT, 1, 0, &[0x00, 0x01, 0xE1, 0x00]);
        let mut reassembler = SectionReassembler::new(0);
        for pkt in packetize(0, &section, 0) {
            reassembler.feed(&TsPacket::parse(&pkt).unwrap());
        }
        let got = reassembler.pop_section().expect("section");
        assert_eq!(got.data(), &section[..]);
        assert_eq!(got.table_id(), TABLE_ID_PAT);
        assert!(got.current_next());
        assert!(reassembler.pop_section().is_none());
    }

    #[test]
    fn test_section_spanning_packets() {
        let body = vec![0xAB; 400];
        let section = build_section(TABLE_ID_PAT, 7, 3, &body);
        let mut reassembler = SectionReassembler::new(0);
        for pkt in packetize(0, &section, 5) {
            reassembler.feed(&TsPacket::parse(&pkt).unwrap());
        }
        let got = reassembler.pop_section().expect("section");
        assert_eq!(got.total_length(), section.len());
        assert_eq!(got.version(), 3);
    }

    #[test]
    fn test_discontinuity_drops_partial() {
        let body = vec![0xAB; 400];
        let section = build_section(TABLE_ID_PAT, 7, 0, &body);
        let packets = packetize(0, &section, 0);
        assert!(packets.len() >= 3);
        let mut reassembler = SectionReassembler::new(0);
        reassembler.feed(&TsPacket::parse(&packets[0]).unwrap());
        // Skip the middle packet: the tail alone must not complete anything.
        reassembler.feed(&TsPacket::parse(&packets[2]).unwrap());
        assert!(reassembler.pop_section().is_none());
    }

    #[test]
    fn test_duplicate_packet_ignored() {
        let section = build_section(TABLE_ID_PAT, 1, 0, &[0x00, 0x01, 0xE1, 0x00]);
        let packets = packetize(0, &section, 0);
        let mut reassembler = SectionReassembler::new(0);
        reassembler.feed(&TsPacket::parse(&packets[0]).unwrap());
        reassembler.feed(&TsPacket::parse(&packets[0]).unwrap());
        assert!(reassembler.pop_section().is_some());
        assert!(reassembler.pop_section().is_none());
    }

    #[test]
    fn test_corrupted_crc_dropped() {
        let mut section = build_section(TABLE_ID_PAT, 1, 0, &[0x00, 0x01, 0xE1, 0x00]);
        let len = section.len();
        section[len - 1] ^= 0xFF;
        let mut reassembler = SectionReassembler::new(0);
        for pkt in packetize(0, &section, 0) {
            reassembler.feed(&TsPacket::parse(&pkt).unwrap());
        }
        assert!(reassembler.pop_section().is_none());
    }

    #[test]
    fn test_two_sections_in_one_payload() {
        let a = build_section(TABLE_ID_PAT, 1, 0, &[0x00, 0x01, 0xE1, 0x00]);
        let b = build_section(TABLE_ID_PAT, 2, 0, &[0x00, 0x02, 0xE2, 0x00]);
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        let mut reassembler = SectionReassembler::new(0);
        for pkt in packetize(0, &joined, 0) {
            reassembler.feed(&TsPacket::parse(&pkt).unwrap());
        }
        let first = reassembler.pop_section().expect("first section");
        let second = reassembler.pop_section().expect("second section");
        assert_eq!(first.table_id_extension(), 1);
        assert_eq!(second.table_id_extension(), 2);
    }
}
