//! Service Description Table decoder (EN 300 468) and DVB character set
//! translation.

use super::{Section, MAX_NAME_LEN, TABLE_ID_SDT};
use crate::error::{FanError, Result};

/// The service_descriptor tag carrying type, provider and name.
pub const SERVICE_DESCRIPTOR_TAG: u8 = 0x48;

/// One service described by the SDT.
#[derive(Debug, Clone)]
pub struct SdtService {
    /// Service id (program number).
    pub service_id: u16,
    /// running_status field (4 = running).
    pub running_status: u8,
    /// free_CA_mode bit; set when the service is scrambled.
    pub free_ca: bool,
    /// service_type from the service_descriptor, 0 when absent.
    pub service_type: u8,
    /// Provider name, charset-translated.
    pub provider: String,
    /// Service name, charset-translated.
    pub name: String,
}

/// Decoded Service Description Table (actual transport stream).
#[derive(Debug, Clone)]
pub struct Sdt {
    /// transport_stream_id the SDT describes.
    pub transport_stream_id: u16,
    /// current_next_indicator.
    pub current: bool,
    /// Table version.
    pub version: u8,
    /// Services in table order.
    pub services: Vec<SdtService>,
}

impl Sdt {
    /// Decodes a reassembled SDT section. Only the actual-transport-stream
    /// table (0x42) is accepted; other-stream SDTs are a parse error the
    /// caller drops silently.
    pub fn parse(section: &Section) -> Result<Self> {
        if section.table_id() != TABLE_ID_SDT {
            return Err(FanError::Parse(format!(
                "unexpected SDT table id 0x{:02x}",
                section.table_id()
            )));
        }
        let data = section.data();
        let total = section.total_length();
        if data.len() < 15 || total > data.len() {
            return Err(FanError::Parse("SDT section too short".into()));
        }

        let mut sdt = Sdt {
            transport_stream_id: section.table_id_extension(),
            current: section.current_next(),
            version: section.version(),
            services: Vec::new(),
        };

        // 11 = 8 bytes of generic header + original_network_id + reserved
        let mut pos = 11;
        while pos + 5 <= total - 4 {
            let service_id = (u16::from(data[pos]) << 8) | u16::from(data[pos + 1]);
            let running_status = data[pos + 3] >> 5;
            let free_ca = data[pos + 3] & 0x10 != 0;
            let loop_length = ((data[pos + 3] as usize & 0x0F) << 8) | data[pos + 4] as usize;
            pos += 5;
            if pos + loop_length > total - 4 {
                return Err(FanError::Parse("SDT descriptor loop overruns section".into()));
            }

            let mut service = SdtService {
                service_id,
                running_status,
                free_ca,
                service_type: 0,
                provider: String::new(),
                name: String::new(),
            };

            let mut dpos = pos;
            let dend = pos + loop_length;
            while dpos + 2 <= dend {
                let tag = data[dpos];
                let dlen = data[dpos + 1] as usize;
                dpos += 2;
                if dpos + dlen > dend {
                    break;
                }
                if tag == SERVICE_DESCRIPTOR_TAG && dlen >= 3 {
                    let body = &data[dpos..dpos + dlen];
                    service.service_type = body[0];
                    let provider_len = body[1] as usize;
                    if 2 + provider_len < body.len() {
                        service.provider = decode_text(&body[2..2 + provider_len]);
                        let name_off = 2 + provider_len;
                        let name_len = body[name_off] as usize;
                        if name_off + 1 + name_len <= body.len() {
                            service.name = decode_text(&body[name_off + 1..name_off + 1 + name_len]);
                        }
                    }
                }
                dpos += dlen;
            }

            sdt.services.push(service);
            pos += loop_length;
        }

        Ok(sdt)
    }
}

/// Translates a DVB-coded character string (EN 300 468 annex A) into UTF-8.
///
/// The leading byte selects the character table. Single-byte tables are
/// approximated as Latin-1; control codes 0x80..0x9F are dropped except
/// 0x8A which becomes a space. The result is capped at `MAX_NAME_LEN`
/// bytes.
pub fn decode_text(raw: &[u8]) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let (text, utf16, utf8) = match raw[0] {
        0x01..=0x0B => (&raw[1..], false, false),
        0x10 => (raw.get(3..).unwrap_or(&[]), false, false),
        0x11 => (&raw[1..], true, false),
        0x15 => (&raw[1..], false, true),
        0x1F => (raw.get(2..).unwrap_or(&[]), false, true),
        0x00..=0x1F => (&raw[1..], false, false),
        _ => (raw, false, false),
    };

    let mut out = if utf16 {
        let units: Vec<u16> = text
            .chunks_exact(2)
            .map(|pair| (u16::from(pair[0]) << 8) | u16::from(pair[1]))
            .collect();
        String::from_utf16_lossy(&units)
    } else if utf8 {
        String::from_utf8_lossy(text).into_owned()
    } else {
        // Latin-1 approximation of the default table
        text.iter().map(|&b| char::from(b)).collect()
    };

    out.retain(|c| {
        let code = c as u32;
        !(0x80..=0x9F).contains(&code) || code == 0x8A
    });
    out = out.replace('\u{8A}', " ");

    while out.len() > MAX_NAME_LEN {
        out.pop();
    }
    out
}
