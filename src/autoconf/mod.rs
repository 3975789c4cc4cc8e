//! # Service Autoconfiguration
//!
//! The engine harvests PSI/SI tables from the incoming transport stream
//! and turns them into output channels in four stages:
//!
//! 1. **Full** — PAT, SDT (and ATSC VCT) are reassembled and reconciled
//!    in a [`ServiceRegistry`]; once every PAT-listed service is complete
//!    the registry is committed into the [`ChannelTable`].
//! 2. **Pids** — every channel's PMT is read; audio/video/subtitle pids
//!    are enrolled in the demux filter set.
//! 3. **Nit** — the NIT's logical_channel_descriptor stamps channel
//!    numbers into the rendered names.
//! 4. **Done** — steady state; optionally PMT version changes keep
//!    refreshing the pid sets.
//!
//! Each active stage is bounded by [`AUTOCONF_TIMEOUT`]; on expiry the
//! engine advances with whatever it has.

use crate::cam::Descrambler;
use crate::channel::{service_type_to_str, Channel, ChannelPid, ChannelTable, PidKind, MAX_CHANNELS};
use crate::config::{AutoconfMode, Config};
use crate::error::Result;
use crate::filter::{Demux, PidFilterTable};
use crate::psi::pat::Pat;
use crate::psi::pmt::{Pmt, StreamKind};
use crate::psi::psip::{atsc_service_type_to_dvb, Mgt, Vct};
use crate::psi::sdt::Sdt;
use crate::psi::{
    nit::Nit, SectionReassembler, TsPacket, PID_NIT, PID_PAT, PID_PSIP, PID_SDT, TABLE_ID_MGT,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Service registry building block
pub mod registry;

/// Template substitution and expression evaluation
pub mod template;

use registry::ServiceRegistry;
use template::TemplateVars;

/// Timeout applied to each active autoconfiguration stage.
pub const AUTOCONF_TIMEOUT: Duration = Duration::from_secs(10);

/// Stage of the autoconfiguration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoconfState {
    /// Autoconfiguration is off.
    Disabled,
    /// Harvesting PAT/SDT/PSIP into the service registry.
    Full,
    /// Reading the channels' PMTs.
    Pids,
    /// Waiting for the NIT's logical channel numbers.
    Nit,
    /// Finished; the channel table is final.
    Done,
}

/// Where per-channel unicast listeners get registered at commit time.
pub trait ListenerHost {
    /// Opens a listening socket bound to the given channel index.
    fn open_channel_listener(&mut self, channel_index: usize, port: u16) -> Result<()>;
}

/// A host that accepts no per-channel listeners, for multicast-only
/// setups and tests.
#[derive(Debug, Default)]
pub struct NoListeners;

impl ListenerHost for NoListeners {
    fn open_channel_listener(&mut self, _channel_index: usize, _port: u16) -> Result<()> {
        Ok(())
    }
}

struct Inner {
    state: AutoconfState,
    deadline: Option<Instant>,
    pat: SectionReassembler,
    sdt: SectionReassembler,
    psip: SectionReassembler,
    nit: SectionReassembler,
    registry: ServiceRegistry,
    /// Program numbers the latest PAT announced.
    announced: Vec<u16>,
    transport_stream_id: u16,
}

/// The autoconfiguration engine.
pub struct AutoconfEngine {
    config: Config,
    channels: Arc<ChannelTable>,
    filters: Arc<Mutex<PidFilterTable>>,
    descrambler: Arc<dyn Descrambler>,
    done: Arc<AtomicBool>,
    inner: Mutex<Inner>,
}

impl AutoconfEngine {
    /// Creates the engine in its configured entry state. In partial mode
    /// the already-published channels are prepared for PMT reading.
    pub fn new(
        config: Config,
        channels: Arc<ChannelTable>,
        filters: Arc<Mutex<PidFilterTable>>,
        descrambler: Arc<dyn Descrambler>,
    ) -> Self {
        let state = match config.autoconf.mode {
            AutoconfMode::None => AutoconfState::Disabled,
            AutoconfMode::Partial => AutoconfState::Pids,
            AutoconfMode::Full => AutoconfState::Full,
        };
        let deadline =
            (state != AutoconfState::Disabled).then(|| Instant::now() + AUTOCONF_TIMEOUT);
        let engine = Self {
            config,
            channels,
            filters,
            descrambler,
            done: Arc::new(AtomicBool::new(state == AutoconfState::Disabled)),
            inner: Mutex::new(Inner {
                state,
                deadline,
                pat: SectionReassembler::new(PID_PAT),
                sdt: SectionReassembler::new(PID_SDT),
                psip: SectionReassembler::new(PID_PSIP),
                nit: SectionReassembler::new(PID_NIT),
                registry: ServiceRegistry::new(),
                announced: Vec::new(),
                transport_stream_id: 0,
            }),
        };
        if state == AutoconfState::Pids {
            engine.prepare_partial();
        }
        engine
    }

    /// Current stage.
    pub fn state(&self) -> AutoconfState {
        self.inner.lock().state
    }

    /// Shared flag flipped once autoconfiguration finishes; the monitor
    /// endpoints report it.
    pub fn done_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.done)
    }

    /// True while tables are still being harvested.
    pub fn is_active(&self) -> bool {
        matches!(
            self.inner.lock().state,
            AutoconfState::Full | AutoconfState::Pids | AutoconfState::Nit
        )
    }

    /// In partial mode, preconfigured channels with a single pid treat
    /// it as their PMT pid; channels with more are left untouched.
    fn prepare_partial(&self) {
        for channel in self.channels.write().iter_mut() {
            if channel.pids.len() > 1 {
                info!(
                    "autoconfiguration deactivated for channel \"{}\"",
                    channel.name
                );
                channel.autoconfigurated = true;
            } else if let Some(first) = channel.pids.first_mut() {
                first.kind = PidKind::Pmt;
                first.language = "---".to_string();
                channel.pmt_pid = first.pid;
            }
        }
    }

    /// Feeds one TS packet into the state machine.
    pub fn handle_packet(
        &self,
        pkt: &TsPacket<'_>,
        demux: &mut dyn Demux,
        listeners: &mut dyn ListenerHost,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let pid = pkt.pid();
        match inner.state {
            AutoconfState::Full => match pid {
                PID_PAT => {
                    inner.pat.feed(pkt);
                    while inner.state == AutoconfState::Full {
                        let Some(section) = inner.pat.pop_section() else {
                            break;
                        };
                        if self.read_pat(&mut inner, &section) {
                            debug!("service list looks complete, committing channels");
                            self.finish_full(&mut inner, demux, listeners)?;
                        }
                    }
                }
                PID_SDT => {
                    inner.sdt.feed(pkt);
                    while let Some(section) = inner.sdt.pop_section() {
                        Self::read_sdt(&mut inner.registry, &section);
                    }
                }
                PID_PSIP if self.config.atsc => {
                    inner.psip.feed(pkt);
                    while let Some(section) = inner.psip.pop_section() {
                        Self::read_psip(&mut inner.registry, &section);
                    }
                }
                _ => {}
            },
            AutoconfState::Pids => {
                if pid != 0 && self.read_channel_pmts(pid, pkt, false) {
                    self.finish_pids(&mut inner, demux)?;
                }
            }
            AutoconfState::Nit => {
                if pid == PID_NIT {
                    inner.nit.feed(pkt);
                    while inner.state == AutoconfState::Nit {
                        let Some(section) = inner.nit.pop_section() else {
                            break;
                        };
                        match Nit::parse(&section) {
                            Ok(nit) if nit.current && !nit.logical_channel_numbers.is_empty() => {
                                self.stamp_lcns(Some(&nit));
                                self.finalize(&mut inner);
                            }
                            Ok(_) => debug!("NIT without logical channel numbers, waiting"),
                            Err(e) => debug!("NIT dropped: {e}"),
                        }
                    }
                }
            }
            AutoconfState::Done if self.config.autoconf.pid_update => {
                if pid != 0 && self.read_channel_pmts(pid, pkt, true) {
                    let filters = self.filters.lock();
                    if let Err(e) = demux.set_filters(&filters) {
                        warn!("unable to refresh demux filters: {e}");
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Advances past any expired stage deadline.
    pub fn poll_expiry(
        &self,
        now: Instant,
        demux: &mut dyn Demux,
        listeners: &mut dyn ListenerHost,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(deadline) = inner.deadline else {
            return Ok(());
        };
        if now < deadline {
            return Ok(());
        }
        match inner.state {
            AutoconfState::Full => {
                warn!("unable to get all services before the timeout, continuing with a partial list");
                self.finish_full(&mut inner, demux, listeners)?;
            }
            AutoconfState::Pids => {
                warn!("not all channels were configured before the timeout");
                self.finish_pids(&mut inner, demux)?;
            }
            AutoconfState::Nit => {
                warn!("no NIT found before the timeout, finalizing without channel numbers");
                self.stamp_lcns(None);
                self.finalize(&mut inner);
            }
            _ => inner.deadline = None,
        }
        Ok(())
    }

    /// Updates the registry from a PAT section; true when every
    /// announced service is known from both sides.
    fn read_pat(&self, inner: &mut Inner, section: &crate::psi::Section) -> bool {
        let pat = match Pat::parse(section) {
            Ok(pat) => pat,
            Err(e) => {
                debug!("PAT dropped: {e}");
                return false;
            }
        };
        if !pat.current {
            debug!("PAT with current_next_indicator 0 ignored");
            return false;
        }
        inner.transport_stream_id = pat.transport_stream_id;
        inner.announced = pat.entries.iter().map(|e| e.program_number).collect();
        let mut missing = 0;
        for entry in &pat.entries {
            if inner.registry.is_complete(entry.program_number) {
                continue;
            }
            inner
                .registry
                .upsert_from_pat(entry.program_number, entry.pmt_pid);
            if !inner.registry.is_complete(entry.program_number) {
                missing += 1;
            }
        }
        if missing > 0 {
            debug!(
                "PAT read, {missing} of {} services still waiting for the SDT",
                inner.announced.len()
            );
            return false;
        }
        inner.registry.all_complete(&inner.announced)
    }

    fn read_sdt(registry: &mut ServiceRegistry, section: &crate::psi::Section) {
        match Sdt::parse(section) {
            Ok(sdt) if sdt.current => {
                for service in &sdt.services {
                    registry.upsert_from_sdt(
                        service.service_id,
                        &service.name,
                        service.service_type,
                        service.free_ca,
                        service.running_status,
                    );
                }
            }
            Ok(_) => debug!("SDT with current_next_indicator 0 ignored"),
            Err(e) => debug!("SDT dropped: {e}"),
        }
    }

    fn read_psip(registry: &mut ServiceRegistry, section: &crate::psi::Section) {
        if section.table_id() == TABLE_ID_MGT {
            match Mgt::parse(section) {
                Ok(mgt) => debug!("MGT announces {} tables", mgt.entries.len()),
                Err(e) => debug!("MGT dropped: {e}"),
            }
            return;
        }
        match Vct::parse(section) {
            Ok(vct) => {
                for channel in &vct.channels {
                    if channel.program_number == 0 || channel.hidden {
                        continue;
                    }
                    registry.upsert_from_sdt(
                        channel.program_number,
                        &channel.short_name,
                        atsc_service_type_to_dvb(channel.service_type),
                        channel.access_controlled,
                        4,
                    );
                }
            }
            Err(e) => debug!("VCT dropped: {e}"),
        }
    }

    /// FULL → PIDS commit: converts the registry into channels, enrolls
    /// PMT pids, opens sockets and publishes the table.
    fn finish_full(
        &self,
        inner: &mut Inner,
        demux: &mut dyn Demux,
        listeners: &mut dyn ListenerHost,
    ) -> Result<()> {
        let settings = &self.config.autoconf;
        let services = inner.registry.take_sorted();
        let mut channels: Vec<Channel> = Vec::new();
        for service in services {
            if channels.len() >= MAX_CHANNELS {
                warn!("maximum channel number reached, dropping the remaining services");
                break;
            }
            if !settings.sid_list.is_empty() && !settings.sid_list.contains(&service.service_id) {
                info!(
                    "service not in the sid list, skipped: \"{}\" id {}",
                    service.name, service.service_id
                );
                continue;
            }
            let Some(pmt_pid) = service.pmt_pid else {
                info!("service without a PMT pid, skipped: \"{}\"", service.name);
                continue;
            };
            let descrambling = service.free_ca && self.descrambler.can_descramble(service.service_id);
            if service.free_ca && !settings.scrambled && !descrambling {
                info!(
                    "service scrambled and no descrambling available, skipped: \"{}\"",
                    service.name
                );
                continue;
            }
            if !stream_worthy(service.service_type, settings.radios) {
                match service.service_type {
                    0x02 | 0x0A => info!(
                        "radio service skipped (enable autoconf_radios to stream it): \"{}\"",
                        service.name
                    ),
                    0 => {}
                    other => info!(
                        "service type {} ({}) not streamable, skipped: \"{}\"",
                        other,
                        service_type_to_str(other),
                        service.name
                    ),
                }
                continue;
            }

            let index = channels.len();
            let vars = TemplateVars {
                number: index + 1,
                card: self.config.card,
                tuner: self.config.tuner,
                server_id: self.config.server_id,
                sid: service.service_id,
            };
            let name =
                template::render_channel_name(&settings.name_template, &service.name, index + 1);
            info!(
                "new channel: sid {} pmt_pid {} name \"{}\" ({})",
                service.service_id,
                pmt_pid,
                name,
                service_type_to_str(service.service_type)
            );

            let mut channel = Channel::new(service.service_id, pmt_pid, service.service_type, name);
            channel.needs_descrambling = descrambling;

            let port = if settings.multicast_port_template.is_empty() {
                self.config.multicast.common_port
            } else {
                match template::render_port(&settings.multicast_port_template, vars) {
                    Ok(port) => port,
                    Err(e) => {
                        warn!("multicast port template failed, channel skipped: {e}");
                        continue;
                    }
                }
            };
            channel.port = port;

            if self.config.multicast.enabled {
                if self.config.multicast.ipv4 {
                    match template::render_ipv4(&settings.ip4_template, vars) {
                        Ok(addr) => channel.ipv4 = Some(addr),
                        Err(e) => {
                            warn!("IPv4 template failed, channel skipped: {e}");
                            continue;
                        }
                    }
                }
                if self.config.multicast.ipv6 {
                    match template::render_ipv6(&settings.ip6_template, vars) {
                        Ok(addr) => channel.ipv6 = Some(addr),
                        Err(e) => {
                            warn!("IPv6 template failed, channel skipped: {e}");
                            continue;
                        }
                    }
                }
            }

            if self.config.unicast.enabled && !settings.unicast_port_template.is_empty() {
                match template::render_port(&settings.unicast_port_template, vars) {
                    Ok(port) => channel.unicast_port = Some(port),
                    Err(e) => warn!("unicast port template failed for \"{}\": {e}", channel.name),
                }
            }

            channels.push(channel);
        }

        {
            let mut filters = self.filters.lock();
            for channel in &channels {
                filters.ask(channel.pmt_pid);
            }
            if let Err(e) = demux.set_filters(&filters) {
                warn!("cannot apply the new demux filters, some channels will not work: {e}");
            }
        }

        for (index, channel) in channels.iter_mut().enumerate() {
            if self.config.multicast.enabled {
                self.open_channel_output(channel);
            }
            if let Some(port) = channel.unicast_port {
                info!(
                    "opening per-channel HTTP socket {}:{port} for channel {index}",
                    self.config.unicast.bind_ip
                );
                if let Err(e) = listeners.open_channel_listener(index, port) {
                    warn!("cannot open the channel listener on port {port}: {e}");
                    channel.unicast_port = None;
                }
            }
        }

        info!(
            "autoconfiguration step one done on transport stream {}: {} channels; now reading PMTs",
            inner.transport_stream_id,
            channels.len()
        );
        self.channels.publish(channels);
        inner.state = AutoconfState::Pids;
        inner.deadline = Some(Instant::now() + AUTOCONF_TIMEOUT);
        Ok(())
    }

    fn open_channel_output(&self, channel: &mut Channel) {
        let multicast = &self.config.multicast;
        let sock4 = channel.ipv4.and_then(|group| {
            match crate::net::open_multicast_v4(group, multicast.ttl, multicast.auto_join) {
                Ok(socket) => Some((socket, std::net::SocketAddrV4::new(group, channel.port))),
                Err(e) => {
                    warn!("cannot open IPv4 multicast socket for {group}: {e}");
                    None
                }
            }
        });
        let sock6 = channel.ipv6.and_then(|group| {
            match crate::net::open_multicast_v6(group, multicast.auto_join) {
                Ok(socket) => {
                    Some((socket, std::net::SocketAddrV6::new(group, channel.port, 0, 0)))
                }
                Err(e) => {
                    warn!("cannot open IPv6 multicast socket for {group}: {e}");
                    None
                }
            }
        });
        if sock4.is_some() || sock6.is_some() {
            channel.output = Some(crate::net::ChannelOutput::new(
                sock4,
                sock6,
                multicast.rtp,
                u32::from(channel.service_id),
            ));
        }
    }

    /// Feeds a PMT-bearing packet to the matching channels; returns true
    /// when every channel has been (re)configured by it.
    ///
    /// In the steady state (`version_follow`), only a version change
    /// re-applies the PMT.
    fn read_channel_pmts(&self, pid: u16, pkt: &TsPacket<'_>, version_follow: bool) -> bool {
        let mut channels = self.channels.write();
        let mut touched = false;
        for channel in channels.iter_mut() {
            if channel.pmt_pid != pid {
                continue;
            }
            if !version_follow && channel.autoconfigurated {
                continue;
            }
            channel.pmt_reassembler.feed(pkt);
            while let Some(section) = channel.pmt_reassembler.pop_section() {
                let pmt = match Pmt::parse(&section) {
                    Ok(pmt) => pmt,
                    Err(e) => {
                        debug!("PMT dropped: {e}");
                        continue;
                    }
                };
                if !pmt.current || pmt.program_number != channel.service_id {
                    continue;
                }
                if version_follow && channel.pmt_version == Some(pmt.version) {
                    continue;
                }
                if version_follow {
                    info!(
                        "PMT version change ({:?} -> {}) for channel \"{}\", refreshing pids",
                        channel.pmt_version, pmt.version, channel.name
                    );
                }
                let mut filters = self.filters.lock();
                apply_pmt(channel, &pmt, &mut filters);
                let pids: Vec<u16> = channel.pids.iter().map(|p| p.pid).collect();
                info!("pids for channel \"{}\": {:?}", channel.name, pids);
                touched = true;
            }
        }
        touched && channels.iter().all(|c| c.autoconfigurated)
    }

    /// PIDS → NIT transition: re-applies the demux filters now that the
    /// audio/video pids are enrolled.
    fn finish_pids(&self, inner: &mut Inner, demux: &mut dyn Demux) -> Result<()> {
        {
            let filters = self.filters.lock();
            if let Err(e) = demux.set_filters(&filters) {
                warn!("cannot apply the new demux filters, some channels will not work: {e}");
            }
        }
        info!("autoconfiguration almost done, searching for the NIT");
        inner.state = AutoconfState::Nit;
        inner.deadline = Some(Instant::now() + AUTOCONF_TIMEOUT);
        Ok(())
    }

    /// Stamps logical channel numbers (or their absence) into names.
    fn stamp_lcns(&self, nit: Option<&Nit>) {
        let mut channels = self.channels.write();
        if let Some(nit) = nit {
            for &(service_id, lcn) in &nit.logical_channel_numbers {
                for channel in channels.iter_mut() {
                    if channel.service_id == service_id {
                        channel.lcn = Some(lcn);
                    }
                }
            }
        }
        for channel in channels.iter_mut() {
            channel.name = template::stamp_lcn(&channel.name, channel.lcn);
        }
    }

    fn finalize(&self, inner: &mut Inner) {
        inner.state = AutoconfState::Done;
        inner.deadline = None;
        self.done.store(true, Ordering::Release);
        info!("autoconfiguration done");
        for (index, channel) in self.channels.read().iter().enumerate() {
            info!(
                "channel {}: \"{}\" multicast {}:{} unicast port {:?} ({} pids)",
                index + 1,
                channel.name,
                channel
                    .ipv4
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                channel.port,
                channel.unicast_port,
                channel.pids.len()
            );
        }
    }
}

/// The stream-worthiness predicate over service types (EN 300 468
/// table 81 subset).
pub fn stream_worthy(service_type: u8, radios: bool) -> bool {
    matches!(service_type, 0x01 | 0x11 | 0x16 | 0x19 | 0xC0)
        || (radios && matches!(service_type, 0x02 | 0x0A))
}

fn stream_kind_to_pid_kind(kind: StreamKind) -> PidKind {
    match kind {
        StreamKind::Video => PidKind::Video,
        StreamKind::Audio => PidKind::Audio,
        StreamKind::Aac => PidKind::Aac,
        StreamKind::Ac3 => PidKind::Ac3,
        StreamKind::Eac3 => PidKind::Eac3,
        StreamKind::Subtitle => PidKind::Subtitle,
        StreamKind::Teletext => PidKind::Teletext,
        StreamKind::Unknown => PidKind::Unknown,
    }
}

/// Applies a parsed PMT to a channel: refreshes the pid set (keeping
/// `pids[0]` as the PMT pid) and the filter refcounts.
fn apply_pmt(channel: &mut Channel, pmt: &Pmt, filters: &mut PidFilterTable) {
    if channel.pids.is_empty() {
        channel.pids.push(ChannelPid::new(channel.pmt_pid, PidKind::Pmt));
        filters.ask(channel.pmt_pid);
    }
    for old in channel.pids.split_off(1) {
        filters.release(old.pid);
    }
    channel.pcr_pid = Some(pmt.pcr_pid);
    channel.pmt_version = Some(pmt.version);
    channel.ca_system_ids = pmt.ca_system_ids.clone();

    for stream in &pmt.streams {
        if !stream.kind.is_relevant() || channel.has_pid(stream.pid) {
            continue;
        }
        let mut pid = ChannelPid::new(stream.pid, stream_kind_to_pid_kind(stream.kind));
        if let Some(language) = &stream.language {
            pid.language = language.clone();
        }
        filters.ask(pid.pid);
        channel.pids.push(pid);
    }
    if !channel.has_pid(pmt.pcr_pid) {
        filters.ask(pmt.pcr_pid);
        channel.pids.push(ChannelPid::new(pmt.pcr_pid, PidKind::Pcr));
    }
    if channel.needs_descrambling {
        for &ecm in &pmt.ecm_pids {
            if !channel.has_pid(ecm) {
                filters.ask(ecm);
                channel.pids.push(ChannelPid::new(ecm, PidKind::Ecm));
            }
        }
    }
    channel.autoconfigurated = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_worthy_predicate() {
        for accepted in [0x01, 0x11, 0x16, 0x19, 0xC0] {
            assert!(stream_worthy(accepted, false));
        }
        assert!(!stream_worthy(0x02, false));
        assert!(stream_worthy(0x02, true));
        assert!(stream_worthy(0x0A, true));
        assert!(!stream_worthy(0x03, true));
        assert!(!stream_worthy(0x00, true));
    }
}
