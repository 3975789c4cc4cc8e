//! Output channels and the published channel table.
//!
//! A [`Channel`] is a discovered service promoted to an output endpoint:
//! rendered name and addresses, the pid set to forward, the sockets to
//! forward on, and the unicast clients currently attached. The
//! [`ChannelTable`] is the publication point between the
//! autoconfiguration engine (writer) and the monitor/streaming readers:
//! they observe either the pre-commit or the post-commit table, never a
//! half-published one.

use crate::net::ChannelOutput;
use crate::psi::SectionReassembler;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

/// Hard cap on the number of output channels.
pub const MAX_CHANNELS: usize = 512;

/// What a forwarded pid carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidKind {
    /// Program Map Table
    Pmt,
    /// Program clock reference
    Pcr,
    /// Video elementary stream
    Video,
    /// MPEG audio elementary stream
    Audio,
    /// AAC audio
    Aac,
    /// AC-3 audio
    Ac3,
    /// Enhanced AC-3 audio
    Eac3,
    /// DVB subtitles
    Subtitle,
    /// Teletext
    Teletext,
    /// Entitlement control messages
    Ecm,
    /// Unclassified
    Unknown,
}

impl PidKind {
    /// Display name used by the JSON/XML monitor endpoints.
    pub fn as_str(self) -> &'static str {
        match self {
            PidKind::Pmt => "PMT",
            PidKind::Pcr => "PCR",
            PidKind::Video => "Video",
            PidKind::Audio => "Audio",
            PidKind::Aac => "Audio (AAC)",
            PidKind::Ac3 => "Audio (AC3)",
            PidKind::Eac3 => "Audio (E-AC3)",
            PidKind::Subtitle => "Subtitling",
            PidKind::Teletext => "Teletext",
            PidKind::Ecm => "ECM",
            PidKind::Unknown => "Unknown",
        }
    }
}

/// One forwarded pid of a channel.
#[derive(Debug, Clone)]
pub struct ChannelPid {
    /// The pid.
    pub pid: u16,
    /// What it carries.
    pub kind: PidKind,
    /// ISO 639 language code, `"---"` when not applicable.
    pub language: String,
    /// Observed scrambling (from the TS scrambling-control bits).
    pub scrambled: bool,
}

impl ChannelPid {
    /// Builds a pid entry with the default language marker.
    pub fn new(pid: u16, kind: PidKind) -> Self {
        Self {
            pid,
            kind,
            language: "---".to_string(),
            scrambled: false,
        }
    }
}

/// Byte and packet counters behind the traffic monitor.
#[derive(Debug, Clone, Default)]
pub struct TrafficCounters {
    /// Packets forwarded since startup.
    pub packets: u64,
    /// Scrambled packets among them.
    pub scrambled_packets: u64,
    /// Bytes forwarded since startup.
    pub bytes: u64,
    /// Rate over the last sampling window, in kilobytes per second.
    pub rate_kbps: f64,
    window_bytes: u64,
}

impl TrafficCounters {
    /// Accounts one forwarded TS packet.
    pub fn account_packet(&mut self, len: usize, scrambled: bool) {
        self.packets += 1;
        self.bytes += len as u64;
        self.window_bytes += len as u64;
        if scrambled {
            self.scrambled_packets += 1;
        }
    }

    /// Closes the sampling window, updating the rate.
    pub fn sample(&mut self, elapsed_secs: f64) {
        if elapsed_secs > 0.0 {
            self.rate_kbps = self.window_bytes as f64 / elapsed_secs / 1024.0;
        }
        self.window_bytes = 0;
    }

    /// Percentage of scrambled packets, 0..=100.
    pub fn scrambled_ratio(&self) -> u8 {
        if self.packets == 0 {
            0
        } else {
            (self.scrambled_packets * 100 / self.packets) as u8
        }
    }
}

/// A service committed to an output endpoint.
#[derive(Debug)]
pub struct Channel {
    /// Service id of the underlying DVB service.
    pub service_id: u16,
    /// PMT pid; always mirrored by `pids[0]`.
    pub pmt_pid: u16,
    /// Service type (EN 300 468 table 81).
    pub channel_type: u8,
    /// Rendered channel name.
    pub name: String,
    /// Logical channel number from the NIT, when stamped.
    pub lcn: Option<u16>,
    /// Rendered IPv4 multicast group.
    pub ipv4: Option<Ipv4Addr>,
    /// Rendered IPv6 multicast group.
    pub ipv6: Option<Ipv6Addr>,
    /// Multicast port.
    pub port: u16,
    /// Per-channel HTTP unicast port.
    pub unicast_port: Option<u16>,
    /// Forwarded pids; `pids[0]` is the PMT pid.
    pub pids: Vec<ChannelPid>,
    /// PCR pid from the PMT.
    pub pcr_pid: Option<u16>,
    /// Version of the last PMT applied.
    pub pmt_version: Option<u8>,
    /// CA system ids from the PMT.
    pub ca_system_ids: Vec<u16>,
    /// The PMT has been read and all pids enrolled.
    pub autoconfigurated: bool,
    /// The channel is up and being streamed.
    pub streamed: bool,
    /// The service is scrambled and handed to the descrambler.
    pub needs_descrambling: bool,
    /// Traffic counters.
    pub traffic: TrafficCounters,
    /// Dispatcher tokens of the unicast clients attached to this
    /// channel.
    pub clients: Vec<usize>,
    /// Reassembler for this channel's PMT pid.
    pub pmt_reassembler: SectionReassembler,
    /// Output sockets and datagram batching state.
    pub output: Option<ChannelOutput>,
}

impl Channel {
    /// Creates a channel around its PMT pid; the pid set starts as
    /// `[pmt_pid]`.
    pub fn new(service_id: u16, pmt_pid: u16, channel_type: u8, name: String) -> Self {
        Self {
            service_id,
            pmt_pid,
            channel_type,
            name,
            lcn: None,
            ipv4: None,
            ipv6: None,
            port: 0,
            unicast_port: None,
            pids: vec![ChannelPid::new(pmt_pid, PidKind::Pmt)],
            pcr_pid: None,
            pmt_version: None,
            ca_system_ids: Vec::new(),
            autoconfigurated: false,
            streamed: true,
            needs_descrambling: false,
            traffic: TrafficCounters::default(),
            clients: Vec::new(),
            pmt_reassembler: SectionReassembler::new(pmt_pid),
            output: None,
        }
    }

    /// True when the channel forwards the given pid.
    pub fn has_pid(&self, pid: u16) -> bool {
        self.pids.iter().any(|p| p.pid == pid)
    }

    /// Marks a pid as observed scrambled or clear.
    pub fn mark_pid_scrambled(&mut self, pid: u16, scrambled: bool) {
        if let Some(entry) = self.pids.iter_mut().find(|p| p.pid == pid) {
            entry.scrambled = scrambled;
        }
    }
}

/// Human-readable service type (EN 300 468 table 81 subset).
pub fn service_type_to_str(service_type: u8) -> &'static str {
    match service_type {
        0x01 => "Television",
        0x02 => "Radio",
        0x0A => "Radio (advanced codec)",
        0x11 => "Television (HD)",
        0x16 => "Television (advanced codec SD)",
        0x19 => "Television (advanced codec HD)",
        0xC0 => "User defined",
        _ => "Unknown",
    }
}

/// Human-readable CA system name for well-known id ranges.
pub fn ca_sys_id_to_str(ca_system_id: u16) -> &'static str {
    match ca_system_id & 0xFF00 {
        0x0100 => "Seca/Mediaguard",
        0x0500 => "Viaccess",
        0x0600 => "Irdeto",
        0x0900 => "Videoguard",
        0x0B00 => "Conax",
        0x0D00 => "Cryptoworks",
        0x0E00 => "PowerVu",
        0x1700 => "Betacrypt",
        0x1800 => "Nagravision",
        0x2600 => "BISS",
        _ => "Unknown",
    }
}

/// The published set of output channels.
///
/// The table is swapped wholesale at the FULL→PIDS commit; readers hold
/// the lock only as long as they enumerate.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: RwLock<Vec<Channel>>,
}

impl ChannelTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replaces the channel set.
    pub fn publish(&self, channels: Vec<Channel>) {
        *self.channels.write() = channels;
    }

    /// Number of published channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// True when no channel is published.
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// Shared read access for enumerating readers.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<Channel>> {
        self.channels.read()
    }

    /// Exclusive access for the streaming plane and the engine.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<Channel>> {
        self.channels.write()
    }

    /// Closes every traffic sampling window.
    pub fn sample_traffic(&self, window_start: Instant, now: Instant) {
        let elapsed = now.duration_since(window_start).as_secs_f64();
        for channel in self.channels.write().iter_mut() {
            channel.traffic.sample(elapsed);
        }
    }
}
