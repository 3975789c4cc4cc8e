//! ATSC PSIP decoding (A/65 subset).
//!
//! The base PID carries the Master Guide Table and the Virtual Channel
//! Table. Only the VCT matters for service discovery: it names services
//! (7-character UTF-16BE short names) and carries the access_controlled
//! flag standing in for DVB's free_CA_mode. The MGT is decoded just far
//! enough to know which tables the broadcaster announces.

use super::{Section, TABLE_ID_CVCT, TABLE_ID_MGT, TABLE_ID_TVCT};
use crate::error::{FanError, Result};

/// ATSC service_type for digital television.
pub const ATSC_SERVICE_TYPE_TV: u8 = 0x02;
/// ATSC service_type for audio-only services.
pub const ATSC_SERVICE_TYPE_AUDIO: u8 = 0x03;

/// One table announced by the Master Guide Table.
#[derive(Debug, Clone)]
pub struct MgtEntry {
    /// table_type field.
    pub table_type: u16,
    /// PID the table is carried on.
    pub pid: u16,
}

/// Decoded Master Guide Table.
#[derive(Debug, Clone)]
pub struct Mgt {
    /// Announced tables.
    pub entries: Vec<MgtEntry>,
}

impl Mgt {
    /// Decodes a reassembled MGT section.
    pub fn parse(section: &Section) -> Result<Self> {
        if section.table_id() != TABLE_ID_MGT {
            return Err(FanError::Parse(format!(
                "unexpected MGT table id 0x{:02x}",
                section.table_id()
            )));
        }
        let data = section.data();
        let total = section.total_length();
        if data.len() < 15 || total > data.len() {
            return Err(FanError::Parse("MGT section too short".into()));
        }

        let tables_defined = (usize::from(data[9]) << 8) | usize::from(data[10]);
        let mut entries = Vec::new();
        let mut pos = 11;
        for _ in 0..tables_defined {
            if pos + 11 > total - 4 {
                break;
            }
            let table_type = (u16::from(data[pos]) << 8) | u16::from(data[pos + 1]);
            let pid = (u16::from(data[pos + 2] & 0x1F) << 8) | u16::from(data[pos + 3]);
            let descriptors_length =
                ((data[pos + 9] as usize & 0x0F) << 8) | data[pos + 10] as usize;
            entries.push(MgtEntry { table_type, pid });
            pos += 11 + descriptors_length;
        }
        Ok(Mgt { entries })
    }
}

/// One virtual channel from the VCT.
#[derive(Debug, Clone)]
pub struct VctChannel {
    /// 7-character short name, UTF-16BE decoded and NUL-trimmed.
    pub short_name: String,
    /// MPEG program number; 0 for inactive or analog channels.
    pub program_number: u16,
    /// ATSC source id.
    pub source_id: u16,
    /// ATSC service_type (6 bits).
    pub service_type: u8,
    /// access_controlled flag; the ATSC equivalent of free_CA_mode.
    pub access_controlled: bool,
    /// hidden flag.
    pub hidden: bool,
}

/// Decoded Virtual Channel Table (terrestrial or cable).
#[derive(Debug, Clone)]
pub struct Vct {
    /// transport_stream_id the VCT describes.
    pub transport_stream_id: u16,
    /// Channels in table order.
    pub channels: Vec<VctChannel>,
}

impl Vct {
    /// Decodes a reassembled TVCT/CVCT section.
    pub fn parse(section: &Section) -> Result<Self> {
        let table_id = section.table_id();
        if table_id != TABLE_ID_TVCT && table_id != TABLE_ID_CVCT {
            return Err(FanError::Parse(format!(
                "unexpected VCT table id 0x{table_id:02x}"
            )));
        }
        let data = section.data();
        let total = section.total_length();
        if data.len() < 14 || total > data.len() {
            return Err(FanError::Parse("VCT section too short".into()));
        }

        let num_channels = usize::from(data[9]);
        let mut vct = Vct {
            transport_stream_id: section.table_id_extension(),
            channels: Vec::new(),
        };

        // Fixed part of a channel entry: 14 bytes of short name, 4 of
        // major/minor number, modulation, carrier frequency, channel TSID,
        // program_number, flags, source_id, descriptors_length.
        const ENTRY_LEN: usize = 33;
        let mut pos = 10;
        for _ in 0..num_channels {
            if pos + ENTRY_LEN > total - 4 {
                break;
            }
            let units: Vec<u16> = data[pos..pos + 14]
                .chunks_exact(2)
                .map(|pair| (u16::from(pair[0]) << 8) | u16::from(pair[1]))
                .collect();
            let short_name = String::from_utf16_lossy(&units)
                .trim_end_matches('\0')
                .to_string();

            let program_number = (u16::from(data[pos + 25]) << 8) | u16::from(data[pos + 26]);
            let flags = (u16::from(data[pos + 27]) << 8) | u16::from(data[pos + 28]);
            let access_controlled = flags & 0x2000 != 0;
            let hidden = flags & 0x1000 != 0;
            let service_type = (flags & 0x003F) as u8;
            let source_id = (u16::from(data[pos + 29]) << 8) | u16::from(data[pos + 30]);
            let descriptors_length =
                ((data[pos + 31] as usize & 0x03) << 8) | data[pos + 32] as usize;

            vct.channels.push(VctChannel {
                short_name,
                program_number,
                source_id,
                service_type,
                access_controlled,
                hidden,
            });
            pos += ENTRY_LEN + descriptors_length;
        }

        Ok(vct)
    }
}

/// Maps an ATSC service_type onto the DVB service type space used by the
/// stream-worthiness predicate.
pub fn atsc_service_type_to_dvb(service_type: u8) -> u8 {
    match service_type {
        ATSC_SERVICE_TYPE_TV => 0x01,
        ATSC_SERVICE_TYPE_AUDIO => 0x02,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::testutil::build_section;
    use bytes::Bytes;

    fn vct_entry(name: &str, program_number: u16, service_type: u8, scrambled: bool) -> Vec<u8> {
        let mut entry = Vec::new();
        let mut units: Vec<u16> = name.encode_utf16().collect();
        units.resize(7, 0);
        for unit in units {
            entry.extend_from_slice(&unit.to_be_bytes());
        }
        entry.extend_from_slice(&[0xF0, 0x01, 0x00, 0x01]); // major/minor
        entry.push(0x04); // modulation
        entry.extend_from_slice(&[0, 0, 0, 0]); // carrier frequency
        entry.extend_from_slice(&0x0001u16.to_be_bytes()); // channel TSID
        entry.extend_from_slice(&program_number.to_be_bytes());
        let flags: u16 = if scrambled { 0x2000 } else { 0 } | u16::from(service_type);
        entry.extend_from_slice(&flags.to_be_bytes());
        entry.extend_from_slice(&0x0005u16.to_be_bytes()); // source id
        entry.extend_from_slice(&0xFC00u16.to_be_bytes()); // descriptors_length = 0
        entry
    }

    #[test]
    fn test_parse_tvct() {
        let mut body = vec![0x00, 0x02]; // protocol_version, num_channels
        body.extend_from_slice(&vct_entry("WABC", 100, ATSC_SERVICE_TYPE_TV, false));
        body.extend_from_slice(&vct_entry("WXYZ", 200, ATSC_SERVICE_TYPE_AUDIO, true));
        let raw = build_section(TABLE_ID_TVCT, 1, 0, &body);
        assert_eq!(raw[9], 0x02); // num_channels_in_section
        let section = Section::new(0x1FFB, Bytes::from(raw));

        let vct = Vct::parse(&section).unwrap();
        assert_eq!(vct.channels.len(), 2);
        assert_eq!(vct.channels[0].short_name, "WABC");
        assert_eq!(vct.channels[0].program_number, 100);
        assert!(!vct.channels[0].access_controlled);
        assert_eq!(vct.channels[1].short_name, "WXYZ");
        assert!(vct.channels[1].access_controlled);
        assert_eq!(
            atsc_service_type_to_dvb(vct.channels[1].service_type),
            0x02
        );
    }
}
