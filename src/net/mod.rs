//! Multicast output sockets and datagram batching.
//!
//! Each channel owns up to two UDP sockets (IPv4 and IPv6). TS packets
//! accumulate seven at a time into one 1316-byte datagram before being
//! sent; the same payload is handed back to the caller for distribution
//! to unicast clients. When RTP framing is enabled the multicast
//! datagrams are prefixed with a 12-byte RTP header while unicast
//! clients keep receiving raw TS.

use crate::error::Result;
use crate::psi::TS_PACKET_SIZE;
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::time::Instant;

/// RTP framing helpers
pub mod rtp;

use rtp::{RtpHeader, RTP_CLOCK_HZ};

/// TS packets batched into one UDP datagram.
pub const PACKETS_PER_DATAGRAM: usize = 7;

/// Opens an IPv4 multicast sender socket. With `auto_join` the socket
/// also joins the group, for switches that only forward joined groups.
pub fn open_multicast_v4(group: Ipv4Addr, ttl: u32, auto_join: bool) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_nonblocking(true)?;
    if auto_join {
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    }
    Ok(socket)
}

/// Opens an IPv6 multicast sender socket.
pub fn open_multicast_v6(group: Ipv6Addr, auto_join: bool) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))?;
    socket.set_nonblocking(true)?;
    if auto_join {
        socket.join_multicast_v6(&group, 0)?;
    }
    Ok(socket)
}

/// Output state of one channel: sockets, batching buffer and RTP state.
#[derive(Debug)]
pub struct ChannelOutput {
    sock4: Option<(UdpSocket, SocketAddr)>,
    sock6: Option<(UdpSocket, SocketAddr)>,
    rtp: Option<RtpHeader>,
    batch: BytesMut,
    packets: usize,
    epoch: Instant,
}

impl ChannelOutput {
    /// Creates the output state; either socket may be absent.
    pub fn new(
        sock4: Option<(UdpSocket, SocketAddrV4)>,
        sock6: Option<(UdpSocket, SocketAddrV6)>,
        rtp: bool,
        ssrc: u32,
    ) -> Self {
        Self {
            sock4: sock4.map(|(s, a)| (s, SocketAddr::V4(a))),
            sock6: sock6.map(|(s, a)| (s, SocketAddr::V6(a))),
            rtp: rtp.then(|| RtpHeader::new(ssrc)),
            batch: BytesMut::with_capacity(PACKETS_PER_DATAGRAM * TS_PACKET_SIZE),
            packets: 0,
            epoch: Instant::now(),
        }
    }

    /// Appends one TS packet; returns the flushed datagram payload (raw
    /// TS, without RTP header) once seven packets are batched.
    pub fn push_packet(&mut self, packet: &[u8]) -> Option<Bytes> {
        self.batch.extend_from_slice(packet);
        self.packets += 1;
        if self.packets >= PACKETS_PER_DATAGRAM {
            return Some(self.flush());
        }
        None
    }

    /// Sends whatever is batched, short datagram included. Returns the
    /// raw TS payload for unicast distribution.
    pub fn flush(&mut self) -> Bytes {
        let payload = self.batch.split().freeze();
        self.packets = 0;
        if payload.is_empty() {
            return payload;
        }
        let wire = match &mut self.rtp {
            Some(rtp) => {
                let elapsed = self.epoch.elapsed();
                let timestamp = (elapsed.as_nanos() as u64 * RTP_CLOCK_HZ / 1_000_000_000) as u32;
                rtp.advance(timestamp);
                let mut framed = BytesMut::with_capacity(rtp::RTP_HEADER_SIZE + payload.len());
                rtp.write_to(&mut framed);
                framed.extend_from_slice(&payload);
                framed.freeze()
            }
            None => payload.clone(),
        };
        for (socket, addr) in self.sock4.iter().chain(self.sock6.iter()) {
            match socket.send_to(&wire, addr) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    debug!("multicast send to {addr} would block, datagram dropped");
                }
                Err(e) => warn!("multicast send to {addr} failed: {e}"),
            }
        }
        payload
    }

    /// True when RTP framing is enabled.
    pub fn rtp_enabled(&self) -> bool {
        self.rtp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batching_seven_packets() {
        let mut output = ChannelOutput::new(None, None, false, 0);
        let packet = [0x47u8; TS_PACKET_SIZE];
        for _ in 0..PACKETS_PER_DATAGRAM - 1 {
            assert!(output.push_packet(&packet).is_none());
        }
        let datagram = output.push_packet(&packet).expect("flush on 7th packet");
        assert_eq!(datagram.len(), PACKETS_PER_DATAGRAM * TS_PACKET_SIZE);
        assert!(output.push_packet(&packet).is_none());
    }

    #[test]
    fn test_short_flush() {
        let mut output = ChannelOutput::new(None, None, false, 0);
        let packet = [0x47u8; TS_PACKET_SIZE];
        output.push_packet(&packet);
        let datagram = output.flush();
        assert_eq!(datagram.len(), TS_PACKET_SIZE);
        assert!(output.flush().is_empty());
    }

    /// Joins `group` for reading; None when the environment offers no
    /// multicast loopback.
    fn multicast_receiver(group: Ipv4Addr) -> Option<UdpSocket> {
        let receiver = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        receiver
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .ok()?;
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .ok()?;
        Some(receiver)
    }

    #[test]
    fn test_multicast_delivery_loopback() {
        // Join the group on a receiver socket, send through a
        // ChannelOutput, and read the datagram back. Skipped silently
        // where the environment offers no multicast loopback.
        let group = Ipv4Addr::new(239, 255, 42, 42);
        let Some(receiver) = multicast_receiver(group) else {
            eprintln!("multicast loopback unavailable, skipping");
            return;
        };
        let port = receiver.local_addr().unwrap().port();

        let sender = open_multicast_v4(group, 1, false).unwrap();
        let _ = sender.set_multicast_loop_v4(true);
        let mut output = ChannelOutput::new(
            Some((sender, SocketAddrV4::new(group, port))),
            None,
            false,
            0,
        );

        let packet = [0x47u8; TS_PACKET_SIZE];
        for _ in 0..PACKETS_PER_DATAGRAM {
            output.push_packet(&packet);
        }

        let mut buf = [0u8; 2048];
        match receiver.recv_from(&mut buf) {
            Ok((len, _)) => {
                assert_eq!(len, PACKETS_PER_DATAGRAM * TS_PACKET_SIZE);
                assert_eq!(buf[0], 0x47);
            }
            Err(e) => eprintln!("multicast loopback unavailable: {e}"),
        }
    }

    #[test]
    fn test_rtp_framing_prefixes_header() {
        let group = Ipv4Addr::new(239, 255, 42, 43);
        let Some(receiver) = multicast_receiver(group) else {
            eprintln!("multicast loopback unavailable, skipping");
            return;
        };
        let port = receiver.local_addr().unwrap().port();

        let sender = open_multicast_v4(group, 1, false).unwrap();
        let _ = sender.set_multicast_loop_v4(true);
        let mut output = ChannelOutput::new(
            Some((sender, SocketAddrV4::new(group, port))),
            None,
            true,
            7,
        );
        assert!(output.rtp_enabled());

        let packet = [0x47u8; TS_PACKET_SIZE];
        let raw = loop {
            if let Some(payload) = output.push_packet(&packet) {
                break payload;
            }
        };
        // The unicast payload stays raw TS.
        assert_eq!(raw.len(), PACKETS_PER_DATAGRAM * TS_PACKET_SIZE);

        let mut buf = [0u8; 2048];
        match receiver.recv_from(&mut buf) {
            Ok((len, _)) => {
                assert_eq!(len, rtp::RTP_HEADER_SIZE + PACKETS_PER_DATAGRAM * TS_PACKET_SIZE);
                assert_eq!(buf[0], 0x80);
                assert_eq!(buf[1], rtp::RTP_PAYLOAD_TYPE_MP2T);
                assert_eq!(buf[12], 0x47);
            }
            Err(e) => eprintln!("multicast loopback unavailable: {e}"),
        }
    }
}
