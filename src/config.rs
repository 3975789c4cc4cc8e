//! Typed runtime settings.
//!
//! Configuration-file tokenization happens outside the crate; callers
//! hand already-split `key=value` pairs to [`Config::apply`], which
//! routes them to the autoconfiguration, unicast and multicast setting
//! groups. Every key keeps the name and semantics of the original
//! configuration surface.

use crate::channel::MAX_CHANNELS;
use crate::error::{FanError, Result};
use std::net::IpAddr;

const MAX_IP_TEMPLATE_LEN: usize = 79;
const MAX_PORT_TEMPLATE_LEN: usize = 255;
const MAX_NAME_TEMPLATE_LEN: usize = 254;

/// Autoconfiguration entry mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoconfMode {
    /// No autoconfiguration; channels must be fully preconfigured.
    #[default]
    None,
    /// Channels and their PMT pids are preconfigured; audio/video pids
    /// are discovered.
    Partial,
    /// Everything is discovered from PAT/SDT/PMT/NIT.
    Full,
}

/// Settings of the autoconfiguration engine.
#[derive(Debug, Clone)]
pub struct AutoconfSettings {
    /// Entry mode.
    pub mode: AutoconfMode,
    /// Accept radio services (types 0x02 and 0x0A).
    pub radios: bool,
    /// Accept scrambled services even without a descrambler.
    pub scrambled: bool,
    /// Follow PMT version changes after autoconfiguration.
    pub pid_update: bool,
    /// IPv4 multicast address template.
    pub ip4_template: String,
    /// IPv6 multicast address template.
    pub ip6_template: String,
    /// Per-channel unicast port template; empty disables per-channel
    /// listeners.
    pub unicast_port_template: String,
    /// Multicast port template; empty falls back to the common port.
    pub multicast_port_template: String,
    /// Allow-list of service ids; empty accepts all.
    pub sid_list: Vec<u16>,
    /// Channel name template; empty keeps the service name.
    pub name_template: String,
}

impl Default for AutoconfSettings {
    fn default() -> Self {
        Self {
            mode: AutoconfMode::None,
            radios: false,
            scrambled: false,
            pid_update: true,
            ip4_template: "239.100.%card.%number".to_string(),
            ip6_template: "FF15:4242::%server:%card:%number".to_string(),
            unicast_port_template: String::new(),
            multicast_port_template: String::new(),
            sid_list: Vec::new(),
            name_template: String::new(),
        }
    }
}

impl AutoconfSettings {
    /// Applies one configuration pair; returns false when the key does
    /// not belong to this group.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "autoconfiguration" => {
                self.mode = match value {
                    "none" | "0" => AutoconfMode::None,
                    "partial" | "1" => AutoconfMode::Partial,
                    "full" | "2" => AutoconfMode::Full,
                    other => {
                        return Err(FanError::InvalidData(format!(
                            "bad autoconfiguration mode \"{other}\""
                        )))
                    }
                };
            }
            "autoconf_radios" => self.radios = parse_bool(value)?,
            "autoconf_scrambled" => self.scrambled = parse_bool(value)?,
            "autoconf_pid_update" => self.pid_update = parse_bool(value)?,
            "autoconf_ip4" => {
                self.ip4_template = bounded(value, MAX_IP_TEMPLATE_LEN, key)?;
            }
            "autoconf_ip6" => {
                self.ip6_template = bounded(value, MAX_IP_TEMPLATE_LEN, key)?;
            }
            "autoconf_unicast_start_port" => {
                let start: u16 = value.trim().parse()?;
                self.unicast_port_template = format!("{start} +%number");
            }
            "autoconf_unicast_port" => {
                self.unicast_port_template = bounded(value, MAX_PORT_TEMPLATE_LEN, key)?;
            }
            "autoconf_multicast_port" => {
                self.multicast_port_template = bounded(value, MAX_PORT_TEMPLATE_LEN, key)?;
            }
            "autoconf_sid_list" => {
                self.sid_list.clear();
                for token in value.split_whitespace() {
                    if self.sid_list.len() >= MAX_CHANNELS {
                        break;
                    }
                    self.sid_list.push(token.parse()?);
                }
            }
            "autoconf_name_template" => {
                self.name_template = bounded(value.trim_end(), MAX_NAME_TEMPLATE_LEN, key)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Settings of the HTTP unicast dispatcher.
#[derive(Debug, Clone)]
pub struct UnicastSettings {
    /// Master listener enabled.
    pub enabled: bool,
    /// Bind address for all listeners.
    pub bind_ip: IpAddr,
    /// Master port, an integer or a template over `%card`/`%server`.
    pub port_template: String,
    /// Maximum simultaneous clients; 0 means unbounded.
    pub max_clients: usize,
    /// Seconds of failed sends after which a client is dropped.
    pub consecutive_errors_timeout: u64,
    /// Per-client send backlog cap in bytes; 0 means unbounded.
    pub queue_size: usize,
    /// SO_SNDBUF for client sockets; 0 keeps the OS default.
    pub sendbuf_size: usize,
    /// Drop data on would-block instead of queueing it.
    pub flush_on_eagain: bool,
}

impl Default for UnicastSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            port_template: "4242".to_string(),
            max_clients: 0,
            consecutive_errors_timeout: 5,
            queue_size: 512 * 1024,
            sendbuf_size: 0,
            flush_on_eagain: false,
        }
    }
}

impl UnicastSettings {
    /// Applies one configuration pair; returns false when the key does
    /// not belong to this group.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "unicast" => self.enabled = parse_bool(value)?,
            "ip_http" => {
                if value.len() > 19 {
                    return Err(FanError::InvalidData("ip_http too long".into()));
                }
                self.bind_ip = value
                    .trim()
                    .parse()
                    .map_err(|_| FanError::InvalidData(format!("bad ip_http \"{value}\"")))?;
            }
            "port_http" => self.port_template = bounded(value, MAX_PORT_TEMPLATE_LEN, key)?,
            "unicast_max_clients" => self.max_clients = value.trim().parse()?,
            "unicast_consecutive_errors_timeout" => {
                self.consecutive_errors_timeout = value.trim().parse()?
            }
            "unicast_queue_size" => self.queue_size = value.trim().parse()?,
            "socket_sendbuf_size" => self.sendbuf_size = value.trim().parse()?,
            "flush_on_eagain" => self.flush_on_eagain = parse_bool(value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Settings of the multicast output plane.
#[derive(Debug, Clone)]
pub struct MulticastSettings {
    /// Multicast output enabled.
    pub enabled: bool,
    /// Emit IPv4 groups.
    pub ipv4: bool,
    /// Emit IPv6 groups.
    pub ipv6: bool,
    /// IPv4 multicast TTL.
    pub ttl: u32,
    /// Port used when no port template is configured.
    pub common_port: u16,
    /// Join the group on the sending socket, for switches that only
    /// forward joined groups.
    pub auto_join: bool,
    /// RTP-frame the multicast datagrams.
    pub rtp: bool,
}

impl Default for MulticastSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ipv4: true,
            ipv6: false,
            ttl: 2,
            common_port: 1234,
            auto_join: false,
            rtp: false,
        }
    }
}

impl MulticastSettings {
    /// Applies one configuration pair; returns false when the key does
    /// not belong to this group.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "multicast" => self.enabled = parse_bool(value)?,
            "multicast_ipv4" => self.ipv4 = parse_bool(value)?,
            "multicast_ipv6" => self.ipv6 = parse_bool(value)?,
            "multicast_ttl" => self.ttl = value.trim().parse()?,
            "common_port" => self.common_port = value.trim().parse()?,
            "multicast_auto_join" => self.auto_join = parse_bool(value)?,
            "rtp_header" => self.rtp = parse_bool(value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Complete crate configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Autoconfiguration settings.
    pub autoconf: AutoconfSettings,
    /// Unicast dispatcher settings.
    pub unicast: UnicastSettings,
    /// Multicast output settings.
    pub multicast: MulticastSettings,
    /// DVB adapter number, available to templates as `%card`.
    pub card: u32,
    /// Tuner number, available as `%tuner`.
    pub tuner: u32,
    /// Server id, available as `%server`.
    pub server_id: u32,
    /// The frontend is ATSC; enables PSIP harvesting.
    pub atsc: bool,
}

impl Config {
    /// Routes one `key=value` pair to the setting group that owns it.
    /// Returns false for unknown keys so callers can warn.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        if self.autoconf.apply(key, value)? {
            return Ok(true);
        }
        if self.unicast.apply(key, value)? {
            return Ok(true);
        }
        if self.multicast.apply(key, value)? {
            return Ok(true);
        }
        match key {
            "card" => self.card = value.trim().parse()?,
            "tuner" => self.tuner = value.trim().parse()?,
            "server_id" => self.server_id = value.trim().parse()?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(FanError::InvalidData(format!("bad boolean \"{other}\""))),
    }
}

fn bounded(value: &str, max: usize, key: &str) -> Result<String> {
    if value.len() > max {
        return Err(FanError::InvalidData(format!(
            "{key} longer than {max} characters"
        )));
    }
    Ok(value.to_string())
}
