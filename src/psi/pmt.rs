//! Program Map Table decoder and elementary-stream classification.

use super::{Section, TABLE_ID_PMT};
use crate::error::{FanError, Result};

const CA_DESCRIPTOR_TAG: u8 = 0x09;
const ISO639_LANGUAGE_DESCRIPTOR_TAG: u8 = 0x0A;
const AC3_DESCRIPTOR_TAG: u8 = 0x6A;
const EAC3_DESCRIPTOR_TAG: u8 = 0x7A;
const TELETEXT_DESCRIPTOR_TAG: u8 = 0x56;
const SUBTITLING_DESCRIPTOR_TAG: u8 = 0x59;

/// Kind of elementary stream, as relevant to channel fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// MPEG-1/2/4, H.264 or H.265 video
    Video,
    /// MPEG-1/2 audio
    Audio,
    /// AAC audio (ADTS or LATM)
    Aac,
    /// AC-3 audio
    Ac3,
    /// Enhanced AC-3 audio
    Eac3,
    /// DVB subtitles
    Subtitle,
    /// Teletext
    Teletext,
    /// Anything the fan-out does not carry
    Unknown,
}

impl StreamKind {
    /// True for kinds that are enrolled as channel pids.
    pub fn is_relevant(self) -> bool {
        !matches!(self, StreamKind::Unknown)
    }
}

/// One elementary stream listed by the PMT.
#[derive(Debug, Clone)]
pub struct PmtStream {
    /// stream_type field.
    pub stream_type: u8,
    /// Elementary PID.
    pub pid: u16,
    /// Classified kind.
    pub kind: StreamKind,
    /// ISO 639 language code when the descriptor loop carries one.
    pub language: Option<String>,
}

/// Decoded Program Map Table.
#[derive(Debug, Clone)]
pub struct Pmt {
    /// program_number (service id) the PMT describes.
    pub program_number: u16,
    /// Table version.
    pub version: u8,
    /// current_next_indicator.
    pub current: bool,
    /// PID carrying the program clock reference.
    pub pcr_pid: u16,
    /// CA system ids from CA descriptors (program and stream level).
    pub ca_system_ids: Vec<u16>,
    /// ECM pids from CA descriptors.
    pub ecm_pids: Vec<u16>,
    /// Elementary streams in table order.
    pub streams: Vec<PmtStream>,
}

impl Pmt {
    /// Decodes a reassembled PMT section.
    pub fn parse(section: &Section) -> Result<Self> {
        if section.table_id() != TABLE_ID_PMT {
            return Err(FanError::Parse(format!(
                "unexpected PMT table id 0x{:02x}",
                section.table_id()
            )));
        }
        let data = section.data();
        let total = section.total_length();
        if data.len() < 16 || total > data.len() {
            return Err(FanError::Parse("PMT section too short".into()));
        }

        let mut pmt = Pmt {
            program_number: section.table_id_extension(),
            version: section.version(),
            current: section.current_next(),
            pcr_pid: (u16::from(data[8] & 0x1F) << 8) | u16::from(data[9]),
            ca_system_ids: Vec::new(),
            ecm_pids: Vec::new(),
            streams: Vec::new(),
        };

        let program_info_length = ((data[10] as usize & 0x0F) << 8) | data[11] as usize;
        let mut pos = 12;
        if pos + program_info_length > total - 4 {
            return Err(FanError::Parse("PMT program info overruns section".into()));
        }
        pmt.scan_ca_descriptors(&data[pos..pos + program_info_length]);
        pos += program_info_length;

        while pos + 5 <= total - 4 {
            let stream_type = data[pos];
            let pid = (u16::from(data[pos + 1] & 0x1F) << 8) | u16::from(data[pos + 2]);
            let es_info_length = ((data[pos + 3] as usize & 0x0F) << 8) | data[pos + 4] as usize;
            pos += 5;
            if pos + es_info_length > total - 4 {
                return Err(FanError::Parse("PMT ES info overruns section".into()));
            }
            let descriptors = &data[pos..pos + es_info_length];
            pos += es_info_length;

            pmt.scan_ca_descriptors(descriptors);
            pmt.streams.push(PmtStream {
                stream_type,
                pid,
                kind: classify(stream_type, descriptors),
                language: language_of(descriptors),
            });
        }

        Ok(pmt)
    }

    fn scan_ca_descriptors(&mut self, descriptors: &[u8]) {
        for (tag, body) in DescriptorIter::new(descriptors) {
            if tag == CA_DESCRIPTOR_TAG && body.len() >= 4 {
                let ca_system_id = (u16::from(body[0]) << 8) | u16::from(body[1]);
                let ecm_pid = (u16::from(body[2] & 0x1F) << 8) | u16::from(body[3]);
                if !self.ca_system_ids.contains(&ca_system_id) {
                    self.ca_system_ids.push(ca_system_id);
                }
                if !self.ecm_pids.contains(&ecm_pid) {
                    self.ecm_pids.push(ecm_pid);
                }
            }
        }
    }
}

/// Walks a descriptor loop, yielding `(tag, body)` pairs and stopping at
/// the first inconsistent length.
struct DescriptorIter<'a> {
    data: &'a [u8],
}

impl<'a> DescriptorIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 2 {
            return None;
        }
        let tag = self.data[0];
        let len = self.data[1] as usize;
        if 2 + len > self.data.len() {
            self.data = &[];
            return None;
        }
        let body = &self.data[2..2 + len];
        self.data = &self.data[2 + len..];
        Some((tag, body))
    }
}

/// Maps a stream_type (plus its descriptor loop for the private type
/// 0x06) onto a [`StreamKind`].
pub fn classify(stream_type: u8, descriptors: &[u8]) -> StreamKind {
    match stream_type {
        0x01 | 0x02 | 0x10 | 0x1B | 0x24 => StreamKind::Video,
        0x03 | 0x04 => StreamKind::Audio,
        0x0F | 0x11 => StreamKind::Aac,
        0x81 => StreamKind::Ac3,
        0x06 => {
            for (tag, _) in DescriptorIter::new(descriptors) {
                match tag {
                    AC3_DESCRIPTOR_TAG => return StreamKind::Ac3,
                    EAC3_DESCRIPTOR_TAG => return StreamKind::Eac3,
                    TELETEXT_DESCRIPTOR_TAG => return StreamKind::Teletext,
                    SUBTITLING_DESCRIPTOR_TAG => return StreamKind::Subtitle,
                    _ => {}
                }
            }
            StreamKind::Unknown
        }
        _ => StreamKind::Unknown,
    }
}

fn language_of(descriptors: &[u8]) -> Option<String> {
    for (tag, body) in DescriptorIter::new(descriptors) {
        let code = match tag {
            ISO639_LANGUAGE_DESCRIPTOR_TAG if body.len() >= 3 => &body[..3],
            // Teletext and subtitling descriptors lead with a language code
            TELETEXT_DESCRIPTOR_TAG | SUBTITLING_DESCRIPTOR_TAG if body.len() >= 3 => &body[..3],
            _ => continue,
        };
        if code.iter().all(|b| b.is_ascii_alphabetic()) {
            return Some(String::from_utf8_lossy(code).into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::testutil::{build_section, pmt_body};
    use bytes::Bytes;

    fn section_of(bytes: Vec<u8>) -> Section {
        Section::new(256, Bytes::from(bytes))
    }

    #[test]
    fn test_parse_pmt() {
        let body = pmt_body(257, &[(0x02, 257, None), (0x04, 258, Some("fra"))]);
        let pmt = Pmt::parse(&section_of(build_section(TABLE_ID_PMT, 100, 1, &body))).unwrap();
        assert_eq!(pmt.program_number, 100);
        assert_eq!(pmt.pcr_pid, 257);
        assert_eq!(pmt.streams.len(), 2);
        assert_eq!(pmt.streams[0].kind, StreamKind::Video);
        assert_eq!(pmt.streams[0].pid, 257);
        assert_eq!(pmt.streams[1].kind, StreamKind::Audio);
        assert_eq!(pmt.streams[1].language.as_deref(), Some("fra"));
    }

    #[test]
    fn test_parse_pmt_ca_descriptor() {
        // CA descriptor at program level: system id 0x0100, ECM pid 0x0300
        let mut body = Vec::new();
        body.extend_from_slice(&0xE101u16.to_be_bytes()); // PCR PID 0x101
        body.extend_from_slice(&0xF006u16.to_be_bytes()); // program_info_length = 6
        body.extend_from_slice(&[0x09, 0x04, 0x01, 0x00, 0xE3, 0x00]);
        body.push(0x1B); // H.264 video
        body.extend_from_slice(&0xE102u16.to_be_bytes());
        body.extend_from_slice(&0xF000u16.to_be_bytes());

        let pmt = Pmt::parse(&section_of(build_section(TABLE_ID_PMT, 1, 0, &body))).unwrap();
        assert_eq!(pmt.ca_system_ids, vec![0x0100]);
        assert_eq!(pmt.ecm_pids, vec![0x0300]);
        assert_eq!(pmt.streams[0].kind, StreamKind::Video);
    }

    #[test]
    fn test_classify_private_stream() {
        assert_eq!(classify(0x06, &[0x6A, 0x00]), StreamKind::Ac3);
        assert_eq!(classify(0x06, &[0x59, 0x00]), StreamKind::Subtitle);
        assert_eq!(classify(0x06, &[0x56, 0x00]), StreamKind::Teletext);
        assert_eq!(classify(0x06, &[]), StreamKind::Unknown);
        assert_eq!(classify(0xC0, &[]), StreamKind::Unknown);
    }
}
