//! Monitoring endpoints: channel lists, playlists, signal metrics and
//! the XML state dump.
//!
//! Every endpoint renders into a [`ReplyBuilder`] and closes the
//! connection after sending.

use super::reply::ReplyBuilder;
use crate::cam::Descrambler;
use crate::channel::{ca_sys_id_to_str, service_type_to_str, Channel};
use crate::error::Result;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};

const CHANNELS_HTML_START: &str = "<html><head><title>Streamed channels</title></head><body>\
                                   <h1>Streamed channels</h1>\r\n";
const CHANNELS_HTML_END: &str = "</body></html>\r\n";

/// Frontend signal metrics, updated by the tuner integration.
#[derive(Debug, Clone, Default)]
pub struct SignalStats {
    /// Bit error rate.
    pub ber: u32,
    /// Signal strength, driver units.
    pub strength: u32,
    /// Signal-to-noise ratio, driver units.
    pub snr: u32,
    /// Uncorrected block count.
    pub ub: u32,
    /// Continuity errors seen on the transport stream.
    pub ts_discontinuities: u32,
}

/// Static description of the tuner behind the stream, for the XML
/// state.
#[derive(Debug, Clone)]
pub struct TunerStatus {
    /// Adapter number.
    pub card: u32,
    /// Tuner number.
    pub tuner: u32,
    /// Frontend name as reported by the driver.
    pub frontend_name: String,
    /// The frontend is locked.
    pub tuned: bool,
    /// Tuned frequency in kHz.
    pub frequency_khz: u32,
    /// Delivery system label (DVB-T, DVB-S2, ATSC, ...).
    pub system: String,
}

impl Default for TunerStatus {
    fn default() -> Self {
        Self {
            card: 0,
            tuner: 0,
            frontend_name: String::new(),
            tuned: false,
            frequency_khz: 0,
            system: "Unknown".to_string(),
        }
    }
}

/// Connected-client information for the XML state.
#[derive(Debug, Clone)]
pub struct UserInfo {
    /// Dispatcher token of the connection.
    pub token: usize,
    /// Peer address.
    pub peer: SocketAddr,
    /// Channel preset by a per-channel listener, if any.
    pub asked_channel: Option<usize>,
    /// Service id of the bound channel, if streaming.
    pub service_id: Option<u16>,
    /// Name of the bound channel, if streaming.
    pub channel_name: Option<String>,
}

/// Everything the XML state endpoint reports beside the channel table.
pub struct StateContext<'a> {
    /// Signal metrics snapshot.
    pub signal: &'a SignalStats,
    /// Tuner description.
    pub tuner: &'a TunerStatus,
    /// Seconds since startup.
    pub uptime_secs: u64,
    /// Autoconfiguration has finished.
    pub autoconf_done: bool,
    /// Connected clients.
    pub users: &'a [UserInfo],
    /// Descrambler facade.
    pub descrambler: &'a dyn Descrambler,
}

fn json_escape(text: &str) -> String {
    text.chars()
        .flat_map(|c| match c {
            '"' => "\\\"".chars().collect::<Vec<_>>(),
            '\\' => "\\\\".chars().collect(),
            c if (c as u32) < 0x20 => format!("\\u{:04x}", c as u32).chars().collect(),
            c => vec![c],
        })
        .collect()
}

/// `/channels_list.html` — human-readable channel list. With a `Host:`
/// header the unicast links are absolute.
pub fn send_channel_list_html(
    socket: &mut dyn Write,
    channels: &[Channel],
    host: Option<&str>,
) -> Result<()> {
    let mut reply = ReplyBuilder::new();
    write!(reply, "{CHANNELS_HTML_START}")?;
    for (index, channel) in channels.iter().enumerate() {
        if !channel.streamed {
            continue;
        }
        let multicast = channel
            .ipv4
            .map(|ip| format!("{ip}:{}", channel.port))
            .unwrap_or_else(|| "-".to_string());
        match host {
            Some(host) => write!(
                reply,
                "Channel number {} : {}<br>Unicast link : \
                 <a href=\"http://{host}/bysid/{sid}\">http://{host}/bysid/{sid}</a>\
                 <br>Multicast ip : {multicast}<br><br>\r\n",
                index + 1,
                channel.name,
                sid = channel.service_id,
            )?,
            None => write!(
                reply,
                "Channel number {} : \"{}\"<br>Multicast ip : {multicast}<br><br>\r\n",
                index + 1,
                channel.name,
            )?,
        }
    }
    write!(reply, "{CHANNELS_HTML_END}")?;
    reply.send(socket, 200, "text/html")?;
    Ok(())
}

/// `/channels_list.json` — the channel list with pid details.
pub fn send_channel_list_json(socket: &mut dyn Write, channels: &[Channel]) -> Result<()> {
    let mut reply = ReplyBuilder::new();
    write!(reply, "[")?;
    for (index, channel) in channels.iter().enumerate() {
        if index > 0 {
            write!(reply, ",\n")?;
        }
        write!(
            reply,
            "{{\"number\":{}, \"lcn\":{}, \"name\":\"{}\", \"ip_multicast\":\"{}\", \
             \"port_multicast\":{}, \"num_clients\":{}, \"scrambling_ratio\":{}, \"is_up\":{}, ",
            index + 1,
            channel.lcn.unwrap_or(0),
            json_escape(&channel.name),
            channel
                .ipv4
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            channel.port,
            channel.clients.len(),
            channel.traffic.scrambled_ratio(),
            u8::from(channel.streamed),
        )?;
        write!(
            reply,
            "\"pcr_pid\":{}, \"pmt_version\":{}, \"unicast_port\":{}, \"service_id\":{}, \
             \"service_type\":\"{}\", \"pids_num\":{}, \n",
            channel.pcr_pid.unwrap_or(0),
            channel.pmt_version.map(i32::from).unwrap_or(-1),
            channel.unicast_port.unwrap_or(0),
            channel.service_id,
            service_type_to_str(channel.channel_type),
            channel.pids.len(),
        )?;
        write!(reply, "\"pids\":[")?;
        for (pid_index, pid) in channel.pids.iter().enumerate() {
            if pid_index > 0 {
                write!(reply, ",\n")?;
            }
            write!(
                reply,
                "{{\"number\":{}, \"type\":\"{}\", \"language\":\"{}\"}}",
                pid.pid,
                pid.kind.as_str(),
                pid.language,
            )?;
        }
        write!(reply, "]}}")?;
    }
    write!(reply, "]\n")?;
    reply.send(socket, 200, "application/json")?;
    Ok(())
}

/// `/playlist.m3u` and `/playlist_port.m3u` — unicast playlists, either
/// through `/bysid/` URLs on the master port or through the per-channel
/// ports.
pub fn send_playlist_unicast(
    socket: &mut dyn Write,
    channels: &[Channel],
    local_ip: IpAddr,
    master_port: u16,
    per_port: bool,
) -> Result<()> {
    let mut reply = ReplyBuilder::new();
    write!(reply, "#EXTM3U\r\n")?;
    for channel in channels.iter().filter(|c| c.streamed) {
        if !per_port {
            write!(
                reply,
                "#EXTINF:0,{}\r\nhttp://{local_ip}:{master_port}/bysid/{}\r\n",
                channel.name, channel.service_id,
            )?;
        } else if let Some(port) = channel.unicast_port {
            write!(reply, "#EXTINF:0,{}\r\nhttp://{local_ip}:{port}/\r\n", channel.name)?;
        }
    }
    reply.send(socket, 200, "audio/x-mpegurl")?;
    Ok(())
}

/// `/playlist_multicast.m3u` and its `_vlc` variant — multicast
/// playlists, `udp://` or `rtp://` depending on the output framing.
pub fn send_playlist_multicast(
    socket: &mut dyn Write,
    channels: &[Channel],
    rtp: bool,
    vlc: bool,
) -> Result<()> {
    let scheme = if rtp { "rtp" } else { "udp" };
    let at = if vlc { "@" } else { "" };
    let mut reply = ReplyBuilder::new();
    write!(reply, "#EXTM3U\r\n")?;
    for channel in channels.iter().filter(|c| c.streamed) {
        if let Some(ip) = channel.ipv4 {
            write!(
                reply,
                "#EXTINF:0,{}\r\n{scheme}://{at}{ip}:{}\r\n",
                channel.name, channel.port,
            )?;
        }
    }
    reply.send(socket, 200, "audio/x-mpegurl")?;
    Ok(())
}

/// `/monitor/signal_power.json` — frontend signal metrics.
pub fn send_signal_power_json(socket: &mut dyn Write, signal: &SignalStats) -> Result<()> {
    let mut reply = ReplyBuilder::new();
    write!(
        reply,
        "{{\"ber\":{}, \"strength\":{}, \"snr\":{}, \"ub\":{}}}\n",
        signal.ber, signal.strength, signal.snr, signal.ub,
    )?;
    reply.send(socket, 200, "application/json")?;
    Ok(())
}

/// `/monitor/channels_traffic.json` — per-channel traffic. Empty until
/// ten seconds of uptime have produced a meaningful rate.
pub fn send_channel_traffic_json(
    socket: &mut dyn Write,
    channels: &[Channel],
    uptime_secs: u64,
) -> Result<()> {
    let mut reply = ReplyBuilder::new();
    if uptime_secs >= 10 {
        write!(reply, "[")?;
        for (index, channel) in channels.iter().enumerate() {
            if index > 0 {
                write!(reply, ",\n")?;
            }
            write!(
                reply,
                "{{\"number\":{}, \"name\":\"{}\", \"traffic\":{:.2}}}",
                index + 1,
                json_escape(&channel.name),
                channel.traffic.rate_kbps,
            )?;
        }
        write!(reply, "]\n")?;
    }
    reply.send(socket, 200, "application/json")?;
    Ok(())
}

/// `/monitor/state.xml` — the full state dump.
pub fn send_xml_state(
    socket: &mut dyn Write,
    channels: &[Channel],
    ctx: &StateContext<'_>,
) -> Result<()> {
    let mut reply = ReplyBuilder::new();
    write!(reply, "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n")?;
    write!(
        reply,
        "<dvbfan card=\"{}\" frontend=\"{}\">\n",
        ctx.tuner.card, ctx.tuner.tuner
    )?;
    write!(
        reply,
        "\t<global_version><![CDATA[{}]]></global_version>\n",
        env!("CARGO_PKG_VERSION")
    )?;
    write!(reply, "\t<global_pid>{}</global_pid>\n", std::process::id())?;
    write!(reply, "\t<global_uptime>{}</global_uptime>\n", ctx.uptime_secs)?;
    write!(
        reply,
        "\t<frontend_name><![CDATA[{}]]></frontend_name>\n",
        ctx.tuner.frontend_name
    )?;
    write!(reply, "\t<frontend_tuned>{}</frontend_tuned>\n", u8::from(ctx.tuner.tuned))?;
    write!(
        reply,
        "\t<frontend_frequency>{}</frontend_frequency>\n",
        ctx.tuner.frequency_khz
    )?;
    write!(
        reply,
        "\t<frontend_system><![CDATA[{}]]></frontend_system>\n",
        ctx.tuner.system
    )?;
    write!(reply, "\t<frontend_ber>{}</frontend_ber>\n", ctx.signal.ber)?;
    write!(reply, "\t<frontend_signal>{}</frontend_signal>\n", ctx.signal.strength)?;
    write!(reply, "\t<frontend_snr>{}</frontend_snr>\n", ctx.signal.snr)?;
    write!(reply, "\t<frontend_ub>{}</frontend_ub>\n", ctx.signal.ub)?;
    write!(
        reply,
        "\t<ts_discontinuities>{}</ts_discontinuities>\n",
        ctx.signal.ts_discontinuities
    )?;
    write!(reply, "\t<autoconf_end>{}</autoconf_end>\n", u8::from(ctx.autoconf_done))?;
    write!(
        reply,
        "\t<cam_support>{}</cam_support>\n",
        u8::from(ctx.descrambler.available())
    )?;

    for (index, channel) in channels.iter().enumerate() {
        write!(
            reply,
            "\t<channel number=\"{}\" is_up=\"{}\">\n",
            index + 1,
            u8::from(channel.streamed)
        )?;
        write!(reply, "\t\t<lcn>{}</lcn>\n", channel.lcn.unwrap_or(0))?;
        write!(reply, "\t\t<name><![CDATA[{}]]></name>\n", channel.name)?;
        write!(
            reply,
            "\t\t<service_type type=\"{}\"><![CDATA[{}]]></service_type>\n",
            channel.channel_type,
            service_type_to_str(channel.channel_type)
        )?;
        write!(
            reply,
            "\t\t<ip_multicast><![CDATA[{}]]></ip_multicast>\n",
            channel
                .ipv4
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string())
        )?;
        write!(reply, "\t\t<port_multicast>{}</port_multicast>\n", channel.port)?;
        write!(reply, "\t\t<traffic>{:.0}</traffic>\n", channel.traffic.rate_kbps)?;
        write!(
            reply,
            "\t\t<ratio_scrambled>{}</ratio_scrambled>\n",
            channel.traffic.scrambled_ratio()
        )?;
        write!(reply, "\t\t<service_id>{}</service_id>\n", channel.service_id)?;
        write!(reply, "\t\t<pmt_pid>{}</pmt_pid>\n", channel.pmt_pid)?;
        write!(
            reply,
            "\t\t<pmt_version>{}</pmt_version>\n",
            channel.pmt_version.map(i32::from).unwrap_or(-1)
        )?;
        write!(reply, "\t\t<pcr_pid>{}</pcr_pid>\n", channel.pcr_pid.unwrap_or(0))?;
        write!(
            reply,
            "\t\t<unicast_port>{}</unicast_port>\n",
            channel.unicast_port.unwrap_or(0)
        )?;
        write!(reply, "\t\t<ca_sys>\n")?;
        for &ca in &channel.ca_system_ids {
            write!(
                reply,
                "\t\t\t<ca num=\"{ca}\"><![CDATA[{}]]></ca>\n",
                ca_sys_id_to_str(ca)
            )?;
        }
        write!(reply, "\t\t</ca_sys>\n")?;
        write!(reply, "\t\t<pids>\n")?;
        for pid in &channel.pids {
            write!(
                reply,
                "\t\t\t<pid number=\"{}\" language=\"{}\" scrambled=\"{}\"><![CDATA[{}]]></pid>\n",
                pid.pid,
                pid.language,
                u8::from(pid.scrambled),
                pid.kind.as_str()
            )?;
        }
        write!(reply, "\t\t</pids>\n")?;
        write!(reply, "\t</channel>\n")?;
    }

    write!(reply, "\t<users count=\"{}\">\n", ctx.users.len())?;
    for user in ctx.users {
        write!(
            reply,
            "\t<user socket=\"{}\" ip=\"{}\" asked_channel=\"{}\" sid=\"{}\" channel_name=\"{}\">\n",
            user.token,
            user.peer,
            user.asked_channel.map(|c| c as i64).unwrap_or(-1),
            user.service_id.map(i64::from).unwrap_or(-1),
            user.channel_name.as_deref().unwrap_or("NA"),
        )?;
        write!(reply, "\t</user>\n")?;
    }
    write!(reply, "\t</users>\n")?;
    write!(reply, "</dvbfan>\n")?;
    reply.send(socket, 200, "application/xml; charset=UTF-8")?;
    Ok(())
}

/// `/cam/menu.xml` — the conditional-access module menu.
pub fn send_cam_menu(socket: &mut dyn Write, descrambler: &dyn Descrambler) -> Result<()> {
    let mut reply = ReplyBuilder::new();
    write_cam_xml(&mut reply, descrambler.menu_xml(), descrambler)?;
    reply.send(socket, 200, "application/xml; charset=UTF-8")?;
    Ok(())
}

/// `/cam/action.xml?key=K` — relays a menu key press.
pub fn send_cam_action(
    socket: &mut dyn Write,
    descrambler: &dyn Descrambler,
    key: char,
) -> Result<()> {
    let mut reply = ReplyBuilder::new();
    write_cam_xml(&mut reply, descrambler.menu_action(key), descrambler)?;
    reply.send(socket, 200, "application/xml; charset=UTF-8")?;
    Ok(())
}

fn write_cam_xml(
    reply: &mut ReplyBuilder,
    content: Option<String>,
    descrambler: &dyn Descrambler,
) -> Result<()> {
    // UTF-8 byte order mark, kept for parity with CAM menu consumers
    write!(reply, "\u{FEFF}")?;
    write!(reply, "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n")?;
    write!(reply, "<menu>\n")?;
    let datetime = chrono::Local::now().format("%a %b %e %H:%M:%S %Y");
    write!(reply, "\t<datetime><![CDATA[{datetime}]]></datetime>\n")?;
    match content {
        Some(content) => write!(reply, "{content}")?,
        None => {
            let label = if descrambler.available() {
                "No menu to display"
            } else {
                "No CAM support"
            };
            write!(reply, "\t<cammenustring><![CDATA[{label}]]></cammenustring>\n")?;
            write!(reply, "\t<title><![CDATA[{label}]]></title>\n")?;
        }
    }
    write!(reply, "</menu>\n")?;
    Ok(())
}
