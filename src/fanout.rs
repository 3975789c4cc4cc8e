//! Top-level composition of the streaming pipeline.
//!
//! [`Fanout`] wires the autoconfiguration engine, the pid filter table,
//! the channel table and the unicast dispatcher together. The caller
//! owns the packet source (tuner, file, socket): it pushes every
//! 188-byte packet through [`Fanout::handle_ts_packet`] and calls
//! [`Fanout::tick`] from its main loop to run the reactor and the
//! timers.

use crate::autoconf::{AutoconfEngine, AutoconfState};
use crate::cam::Descrambler;
use crate::channel::ChannelTable;
use crate::config::Config;
use crate::error::Result;
use crate::filter::{Demux, PidFilterTable};
use crate::psi::{TsPacket, PID_EIT, PID_NIT, PID_PAT, PID_PSIP, PID_SDT};
use crate::unicast::monitor::{SignalStats, TunerStatus};
use crate::unicast::UnicastDispatcher;
use bytes::Bytes;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll budget of one reactor tick.
const TICK_BUDGET: Duration = Duration::from_millis(100);

/// Traffic sampling interval.
const TRAFFIC_INTERVAL: Duration = Duration::from_secs(1);

/// The assembled streaming pipeline.
pub struct Fanout {
    channels: Arc<ChannelTable>,
    filters: Arc<Mutex<PidFilterTable>>,
    autoconf: AutoconfEngine,
    dispatcher: UnicastDispatcher,
    demux: Box<dyn Demux>,
    signal: Arc<Mutex<SignalStats>>,
    traffic_window: Instant,
}

impl Fanout {
    /// Builds the pipeline: asks the always-needed PSI pids, programs
    /// the demux and binds the unicast master socket.
    pub fn new(
        config: Config,
        mut demux: Box<dyn Demux>,
        descrambler: Arc<dyn Descrambler>,
    ) -> Result<Self> {
        let channels = Arc::new(ChannelTable::new());
        let filters = Arc::new(Mutex::new(PidFilterTable::new()));
        let signal = Arc::new(Mutex::new(SignalStats::default()));

        {
            let mut filters = filters.lock();
            for pid in [PID_PAT, PID_NIT, PID_SDT, PID_EIT] {
                filters.ask(pid);
            }
            if config.atsc {
                filters.ask(PID_PSIP);
            }
            demux.set_filters(&filters)?;
        }

        let autoconf = AutoconfEngine::new(
            config.clone(),
            Arc::clone(&channels),
            Arc::clone(&filters),
            Arc::clone(&descrambler),
        );
        let dispatcher = UnicastDispatcher::new(
            config,
            Arc::clone(&channels),
            Arc::clone(&signal),
            descrambler,
            autoconf.done_flag(),
        )?;

        Ok(Self {
            channels,
            filters,
            autoconf,
            dispatcher,
            demux,
            signal,
            traffic_window: Instant::now(),
        })
    }

    /// The published channel table.
    pub fn channels(&self) -> &Arc<ChannelTable> {
        &self.channels
    }

    /// The demux pid filter table.
    pub fn filters(&self) -> &Arc<Mutex<PidFilterTable>> {
        &self.filters
    }

    /// The signal statistics slot, updated by the tuner integration.
    pub fn signal(&self) -> &Arc<Mutex<SignalStats>> {
        &self.signal
    }

    /// Current autoconfiguration stage.
    pub fn autoconf_state(&self) -> AutoconfState {
        self.autoconf.state()
    }

    /// The unicast dispatcher.
    pub fn dispatcher_mut(&mut self) -> &mut UnicastDispatcher {
        &mut self.dispatcher
    }

    /// Installs the tuner description reported by the XML state.
    pub fn set_tuner_status(&mut self, tuner: TunerStatus) {
        self.dispatcher.set_tuner_status(tuner);
    }

    /// Routes one raw 188-byte TS packet: into the autoconfiguration
    /// engine while tables are harvested, and into the per-channel
    /// fan-out for every channel carrying the pid.
    pub fn handle_ts_packet(&mut self, raw: &[u8]) -> Result<()> {
        if crate::interrupted() {
            return Ok(());
        }
        let pkt = match TsPacket::parse(raw) {
            Ok(pkt) => pkt,
            Err(_) => {
                // Out-of-sync input; account and move on.
                self.signal.lock().ts_discontinuities += 1;
                return Ok(());
            }
        };
        if pkt.transport_error() {
            return Ok(());
        }

        self.autoconf
            .handle_packet(&pkt, self.demux.as_mut(), &mut self.dispatcher)?;

        let pid = pkt.pid();
        let scrambled = pkt.scrambling_control() != 0;
        let mut ready: Vec<(usize, Bytes)> = Vec::new();
        {
            let mut channels = self.channels.write();
            for (index, channel) in channels.iter_mut().enumerate() {
                if !channel.streamed || !channel.has_pid(pid) {
                    continue;
                }
                channel.traffic.account_packet(raw.len(), scrambled);
                channel.mark_pid_scrambled(pid, scrambled);
                if let Some(output) = channel.output.as_mut() {
                    if let Some(datagram) = output.push_packet(raw) {
                        ready.push((index, datagram));
                    }
                } else if !channel.clients.is_empty() {
                    // No multicast output; packets go straight to the
                    // unicast clients.
                    ready.push((index, Bytes::copy_from_slice(raw)));
                }
            }
        }
        for (index, datagram) in ready {
            self.dispatcher.stream_to_clients(index, &datagram);
        }
        Ok(())
    }

    /// One main-loop iteration: runs the reactor with a bounded poll,
    /// advances expired autoconfiguration deadlines and samples traffic.
    pub fn tick(&mut self) -> Result<()> {
        if crate::interrupted() {
            self.shutdown();
            return Ok(());
        }
        self.dispatcher.poll_once(TICK_BUDGET)?;
        self.autoconf
            .poll_expiry(Instant::now(), self.demux.as_mut(), &mut self.dispatcher)?;
        let now = Instant::now();
        if now.duration_since(self.traffic_window) >= TRAFFIC_INTERVAL {
            self.channels.sample_traffic(self.traffic_window, now);
            self.traffic_window = now;
        }
        Ok(())
    }

    /// Flushes the partial datagrams and closes every socket.
    pub fn shutdown(&mut self) {
        info!("shutting down the fan-out");
        {
            let mut channels = self.channels.write();
            for channel in channels.iter_mut() {
                if let Some(output) = channel.output.as_mut() {
                    let _ = output.flush();
                }
                channel.streamed = false;
            }
        }
        self.dispatcher.shutdown();
        if let Err(e) = self.demux.set_filters(&PidFilterTable::new()) {
            warn!("unable to clear the demux filters: {e}");
        }
    }
}
