//! Program Association Table decoder.

use super::{Section, TABLE_ID_PAT};
use crate::error::{FanError, Result};

/// One program announced by the PAT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatEntry {
    /// Program number (the service id).
    pub program_number: u16,
    /// PID of the program's PMT.
    pub pmt_pid: u16,
}

/// Decoded Program Association Table.
#[derive(Debug, Clone)]
pub struct Pat {
    /// transport_stream_id the PAT describes.
    pub transport_stream_id: u16,
    /// Table version.
    pub version: u8,
    /// current_next_indicator; a PAT with this bit clear is not yet
    /// applicable and must be ignored.
    pub current: bool,
    /// Programs in table order, program_number 0 excluded.
    pub entries: Vec<PatEntry>,
    /// NIT PID when the PAT announced one (program_number 0).
    pub nit_pid: Option<u16>,
}

impl Pat {
    /// Decodes a reassembled PAT section.
    pub fn parse(section: &Section) -> Result<Self> {
        if section.table_id() != TABLE_ID_PAT {
            return Err(FanError::Parse(format!(
                "unexpected PAT table id 0x{:02x}",
                section.table_id()
            )));
        }
        let data = section.data();
        let total = section.total_length();
        if data.len() < 12 || total > data.len() {
            return Err(FanError::Parse("PAT section too short".into()));
        }

        let mut pat = Pat {
            transport_stream_id: section.table_id_extension(),
            version: section.version(),
            current: section.current_next(),
            entries: Vec::new(),
            nit_pid: None,
        };

        let mut pos = 8;
        while pos + 4 <= total - 4 {
            let program_number = (u16::from(data[pos]) << 8) | u16::from(data[pos + 1]);
            let pid = (u16::from(data[pos + 2] & 0x1F) << 8) | u16::from(data[pos + 3]);
            if program_number == 0 {
                pat.nit_pid = Some(pid);
            } else {
                pat.entries.push(PatEntry {
                    program_number,
                    pmt_pid: pid,
                });
            }
            pos += 4;
        }

        Ok(pat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::testutil::{build_section, pat_body};
    use bytes::Bytes;

    fn section_of(bytes: Vec<u8>) -> Section {
        Section::new(0, Bytes::from(bytes))
    }

    #[test]
    fn test_parse_pat() {
        let body = pat_body(&[(0, 0x0010), (100, 256), (200, 512)]);
        let pat = Pat::parse(&section_of(build_section(TABLE_ID_PAT, 0x0001, 2, &body))).unwrap();
        assert!(pat.current);
        assert_eq!(pat.transport_stream_id, 1);
        assert_eq!(pat.version, 2);
        assert_eq!(pat.nit_pid, Some(0x0010));
        assert_eq!(
            pat.entries,
            vec![
                PatEntry {
                    program_number: 100,
                    pmt_pid: 256
                },
                PatEntry {
                    program_number: 200,
                    pmt_pid: 512
                },
            ]
        );
    }

    #[test]
    fn test_parse_pat_rejects_other_table() {
        let body = pat_body(&[(100, 256)]);
        let section = section_of(build_section(0x42, 0x0001, 0, &body));
        assert!(Pat::parse(&section).is_err());
    }

    #[test]
    fn test_parse_empty_pat() {
        let pat = Pat::parse(&section_of(build_section(TABLE_ID_PAT, 0x0001, 0, &[]))).unwrap();
        assert!(pat.entries.is_empty());
        assert!(pat.nit_pid.is_none());
    }

    #[test]
    fn test_pat_registry_round_trip() {
        use crate::autoconf::registry::ServiceRegistry;

        let programs = [(100u16, 256u16), (200, 512), (300, 768)];
        let pat =
            Pat::parse(&section_of(build_section(TABLE_ID_PAT, 1, 0, &pat_body(&programs)))).unwrap();

        let mut registry = ServiceRegistry::new();
        for entry in &pat.entries {
            registry.upsert_from_pat(entry.program_number, entry.pmt_pid);
        }
        let recovered: Vec<(u16, u16)> = registry
            .take_sorted()
            .into_iter()
            .map(|s| (s.service_id, s.pmt_pid.unwrap()))
            .collect();
        assert_eq!(recovered, programs);
    }
}
