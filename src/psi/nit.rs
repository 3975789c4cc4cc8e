//! Network Information Table decoder.
//!
//! Only the private logical_channel_descriptor (tag 0x83) is extracted;
//! it maps service ids onto the logical channel numbers later substituted
//! into channel name templates.

use super::{Section, TABLE_ID_NIT};
use crate::error::{FanError, Result};

const LOGICAL_CHANNEL_DESCRIPTOR_TAG: u8 = 0x83;

/// Decoded Network Information Table (actual network).
#[derive(Debug, Clone)]
pub struct Nit {
    /// network_id the table describes.
    pub network_id: u16,
    /// current_next_indicator.
    pub current: bool,
    /// `(service_id, logical_channel_number)` pairs across all transport
    /// streams of the section.
    pub logical_channel_numbers: Vec<(u16, u16)>,
}

impl Nit {
    /// Decodes a reassembled NIT section.
    pub fn parse(section: &Section) -> Result<Self> {
        if section.table_id() != TABLE_ID_NIT {
            return Err(FanError::Parse(format!(
                "unexpected NIT table id 0x{:02x}",
                section.table_id()
            )));
        }
        let data = section.data();
        let total = section.total_length();
        if data.len() < 14 || total > data.len() {
            return Err(FanError::Parse("NIT section too short".into()));
        }

        let mut nit = Nit {
            network_id: section.table_id_extension(),
            current: section.current_next(),
            logical_channel_numbers: Vec::new(),
        };

        let network_descriptors_length = ((data[8] as usize & 0x0F) << 8) | data[9] as usize;
        let mut pos = 10 + network_descriptors_length;
        if pos + 2 > total - 4 {
            return Err(FanError::Parse("NIT network descriptors overrun".into()));
        }
        let ts_loop_length = ((data[pos] as usize & 0x0F) << 8) | data[pos + 1] as usize;
        pos += 2;
        let loop_end = pos + ts_loop_length;
        if loop_end > total - 4 {
            return Err(FanError::Parse("NIT transport stream loop overrun".into()));
        }

        while pos + 6 <= loop_end {
            let descriptors_length = ((data[pos + 4] as usize & 0x0F) << 8) | data[pos + 5] as usize;
            pos += 6;
            if pos + descriptors_length > loop_end {
                break;
            }
            let mut dpos = pos;
            let dend = pos + descriptors_length;
            while dpos + 2 <= dend {
                let tag = data[dpos];
                let dlen = data[dpos + 1] as usize;
                dpos += 2;
                if dpos + dlen > dend {
                    break;
                }
                if tag == LOGICAL_CHANNEL_DESCRIPTOR_TAG {
                    let mut entry = dpos;
                    while entry + 4 <= dpos + dlen {
                        let service_id =
                            (u16::from(data[entry]) << 8) | u16::from(data[entry + 1]);
                        let lcn = ((u16::from(data[entry + 2]) << 8)
                            | u16::from(data[entry + 3]))
                            & 0x03FF;
                        nit.logical_channel_numbers.push((service_id, lcn));
                        entry += 4;
                    }
                }
                dpos += dlen;
            }
            pos += descriptors_length;
        }

        Ok(nit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::testutil::{build_section, nit_body};
    use bytes::Bytes;

    #[test]
    fn test_parse_nit_lcns() {
        let body = nit_body(&[(100, 5), (200, 12)]);
        let section = Section::new(0x10, Bytes::from(build_section(TABLE_ID_NIT, 0x3000, 0, &body)));
        let nit = Nit::parse(&section).unwrap();
        assert_eq!(nit.network_id, 0x3000);
        assert_eq!(nit.logical_channel_numbers, vec![(100, 5), (200, 12)]);
    }

    #[test]
    fn test_parse_nit_without_lcd() {
        let section = Section::new(
            0x10,
            Bytes::from(build_section(TABLE_ID_NIT, 1, 0, &nit_body(&[]))),
        );
        let nit = Nit::parse(&section).unwrap();
        assert!(nit.logical_channel_numbers.is_empty());
    }
}
