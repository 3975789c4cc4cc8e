//! Helpers for synthesizing PSI sections and TS packets in unit tests.

use crate::psi::TS_PACKET_SIZE;
use crate::utils::Crc32Mpeg2;

/// Builds a complete syntax section with a valid CRC from header fields
/// and a payload body (the bytes after last_section_number).
pub(crate) fn build_section(table_id: u8, id_ext: u16, version: u8, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut out = vec![
        table_id,
        0xB0 | ((section_length >> 8) as u8 & 0x0F),
        section_length as u8,
        (id_ext >> 8) as u8,
        id_ext as u8,
        0xC0 | (version << 1) | 0x01,
        0x00,
        0x00,
    ];
    out.extend_from_slice(body);
    let crc = Crc32Mpeg2::calculate(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// Splits a section into TS packets on the given PID, pointer_field 0,
/// stuffing the tail of the last packet with 0xFF.
pub(crate) fn packetize(pid: u16, section: &[u8], first_cc: u8) -> Vec<[u8; TS_PACKET_SIZE]> {
    let mut packets = Vec::new();
    let mut offset = 0;
    let mut cc = first_cc;
    let mut first = true;
    while offset < section.len() {
        let mut pkt = [0xFFu8; TS_PACKET_SIZE];
        pkt[0] = 0x47;
        pkt[1] = ((pid >> 8) as u8 & 0x1F) | if first { 0x40 } else { 0x00 };
        pkt[2] = pid as u8;
        pkt[3] = 0x10 | (cc & 0x0F);
        let mut pos = 4;
        if first {
            pkt[4] = 0; // pointer_field
            pos = 5;
        }
        let take = (TS_PACKET_SIZE - pos).min(section.len() - offset);
        pkt[pos..pos + take].copy_from_slice(&section[offset..offset + take]);
        offset += take;
        cc = (cc + 1) & 0x0F;
        first = false;
        packets.push(pkt);
    }
    packets
}

/// Builds the body of a PAT from `(program_number, pid)` pairs.
pub(crate) fn pat_body(programs: &[(u16, u16)]) -> Vec<u8> {
    let mut body = Vec::new();
    for &(program_number, pid) in programs {
        body.extend_from_slice(&program_number.to_be_bytes());
        body.extend_from_slice(&(0xE000 | (pid & 0x1FFF)).to_be_bytes());
    }
    body
}

/// Builds the body of an SDT (after original_network_id + reserved) with
/// one service per entry: `(service_id, service_type, free_ca, name)`.
pub(crate) fn sdt_body(services: &[(u16, u8, bool, &str)]) -> Vec<u8> {
    let mut body = vec![0x00, 0x01, 0xFF]; // original_network_id + reserved
    for &(service_id, service_type, free_ca, name) in services {
        let mut descriptor = vec![service_type, 0x00]; // no provider
        descriptor.push(name.len() as u8);
        descriptor.extend_from_slice(name.as_bytes());
        let mut entry = Vec::new();
        entry.extend_from_slice(&service_id.to_be_bytes());
        entry.push(0xFC); // EIT flags
        let loop_len = 2 + descriptor.len();
        let running_free = (4u16 << 13) | if free_ca { 1 << 12 } else { 0 };
        entry.extend_from_slice(&(running_free | loop_len as u16).to_be_bytes());
        entry.push(0x48);
        entry.push(descriptor.len() as u8);
        entry.extend_from_slice(&descriptor);
        body.extend_from_slice(&entry);
    }
    body
}

/// Builds the body of a PMT: PCR PID, no program descriptors, one entry
/// per stream: `(stream_type, pid, language)`.
pub(crate) fn pmt_body(pcr_pid: u16, streams: &[(u8, u16, Option<&str>)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(0xE000 | (pcr_pid & 0x1FFF)).to_be_bytes());
    body.extend_from_slice(&0xF000u16.to_be_bytes()); // program_info_length = 0
    for &(stream_type, pid, language) in streams {
        body.push(stream_type);
        body.extend_from_slice(&(0xE000 | (pid & 0x1FFF)).to_be_bytes());
        let mut descriptors = Vec::new();
        if let Some(lang) = language {
            descriptors.push(0x0A);
            descriptors.push(4);
            descriptors.extend_from_slice(lang.as_bytes());
            descriptors.push(0x00); // audio_type
        }
        body.extend_from_slice(&(0xF000 | descriptors.len() as u16).to_be_bytes());
        body.extend_from_slice(&descriptors);
    }
    body
}

/// Builds the body of a NIT carrying one logical_channel_descriptor with
/// the given `(service_id, lcn)` pairs.
pub(crate) fn nit_body(lcns: &[(u16, u16)]) -> Vec<u8> {
    let mut lcd = Vec::new();
    for &(service_id, lcn) in lcns {
        lcd.extend_from_slice(&service_id.to_be_bytes());
        lcd.extend_from_slice(&(0xFC00 | (lcn & 0x03FF)).to_be_bytes());
    }
    let mut ts_descriptors = vec![0x83, lcd.len() as u8];
    ts_descriptors.extend_from_slice(&lcd);

    let mut ts_entry = Vec::new();
    ts_entry.extend_from_slice(&0x0001u16.to_be_bytes()); // transport_stream_id
    ts_entry.extend_from_slice(&0x0001u16.to_be_bytes()); // original_network_id
    ts_entry.extend_from_slice(&(0xF000 | ts_descriptors.len() as u16).to_be_bytes());
    ts_entry.extend_from_slice(&ts_descriptors);

    let mut body = Vec::new();
    body.extend_from_slice(&0xF000u16.to_be_bytes()); // network_descriptors_length = 0
    body.extend_from_slice(&(0xF000 | ts_entry.len() as u16).to_be_bytes());
    body.extend_from_slice(&ts_entry);
    body
}
