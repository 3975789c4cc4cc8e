//! # HTTP Unicast Dispatcher
//!
//! A single-threaded reactor over one master listening socket, optional
//! per-channel listening sockets, and the accepted client connections.
//! Clients start in control mode: their HTTP/1.0 request selects either
//! a monitoring endpoint (answered and closed) or a channel, after which
//! the connection streams raw TS until it dies. A connection that landed
//! on a per-channel listener skips request routing entirely.
//!
//! The poll registration and the per-connection state are kept in
//! lockstep by [`FdTable`]; removal is swap-delete, as cheap as the
//! original parallel-array scheme but with the indices encapsulated.

use crate::autoconf::ListenerHost;
use crate::cam::Descrambler;
use crate::channel::ChannelTable;
use crate::config::Config;
use crate::error::{FanError, Result};
use crate::unicast::client::{SendOutcome, UnicastClient};
use crate::unicast::monitor::{SignalStats, StateContext, TunerStatus, UserInfo};
use crate::unicast::reply::{http_404_body, ReplyBuilder, HTTP_501_REPLY, HTTP_503_REPLY, HTTP_STREAM_HEADER};
use bytes::Bytes;
use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-connection client state
pub mod client;

/// Monitoring endpoints
pub mod monitor;

/// HTTP/1.0 reply building
pub mod reply;

const EVENTS_CAPACITY: usize = 256;

/// What a registered file descriptor is.
enum FdKind {
    /// The master listening socket.
    Master(TcpListener),
    /// A per-channel listening socket; accepted connections are
    /// pre-bound to the channel.
    ChannelListener {
        listener: TcpListener,
        channel: usize,
    },
    /// An accepted connection.
    Client(Box<UnicastClient>),
}

struct FdEntry {
    token: Token,
    kind: FdKind,
}

/// Dense table of registered descriptors with stable tokens.
///
/// Entries are removed by swap-with-last; the token-to-index map keeps
/// lookups valid across compaction.
struct FdTable {
    entries: Vec<FdEntry>,
    index: HashMap<Token, usize>,
    next_token: usize,
}

impl FdTable {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            next_token: 0,
        }
    }

    fn insert(&mut self, kind: FdKind) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.index.insert(token, self.entries.len());
        self.entries.push(FdEntry { token, kind });
        token
    }

    fn get_mut(&mut self, token: Token) -> Option<&mut FdKind> {
        let idx = *self.index.get(&token)?;
        Some(&mut self.entries[idx].kind)
    }

    fn remove(&mut self, token: Token) -> Option<FdKind> {
        let idx = self.index.remove(&token)?;
        let entry = self.entries.swap_remove(idx);
        if let Some(moved) = self.entries.get(idx) {
            self.index.insert(moved.token, idx);
        }
        Some(entry.kind)
    }

    fn iter(&self) -> impl Iterator<Item = &FdEntry> {
        self.entries.iter()
    }

    #[cfg(test)]
    fn consistent(&self) -> bool {
        self.index.len() == self.entries.len()
            && self
                .entries
                .iter()
                .enumerate()
                .all(|(idx, entry)| self.index.get(&entry.token) == Some(&idx))
    }
}

enum Action {
    Keep,
    Close,
}

/// The poll-based HTTP unicast reactor.
pub struct UnicastDispatcher {
    poll: Poll,
    events: Events,
    fds: FdTable,
    config: Config,
    channels: Arc<ChannelTable>,
    signal: Arc<Mutex<SignalStats>>,
    tuner: TunerStatus,
    descrambler: Arc<dyn Descrambler>,
    autoconf_done: Arc<AtomicBool>,
    master_addr: Option<SocketAddr>,
    start: Instant,
    client_count: usize,
}

impl UnicastDispatcher {
    /// Creates the reactor, binding the master listener when unicast is
    /// enabled. A master bind failure is fatal.
    pub fn new(
        config: Config,
        channels: Arc<ChannelTable>,
        signal: Arc<Mutex<SignalStats>>,
        descrambler: Arc<dyn Descrambler>,
        autoconf_done: Arc<AtomicBool>,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let mut dispatcher = Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            fds: FdTable::new(),
            channels,
            signal,
            tuner: TunerStatus::default(),
            descrambler,
            autoconf_done,
            master_addr: None,
            start: Instant::now(),
            client_count: 0,
            config,
        };
        if dispatcher.config.unicast.enabled {
            let vars = crate::autoconf::template::TemplateVars {
                number: 0,
                card: dispatcher.config.card,
                tuner: dispatcher.config.tuner,
                server_id: dispatcher.config.server_id,
                sid: 0,
            };
            let port =
                crate::autoconf::template::render_port(&dispatcher.config.unicast.port_template, vars)?;
            let addr = SocketAddr::new(dispatcher.config.unicast.bind_ip, port);
            let mut listener = TcpListener::bind(addr)
                .map_err(|e| FanError::Protocol(format!("cannot bind HTTP socket {addr}: {e}")))?;
            let local = listener.local_addr()?;
            info!("unicast master socket listening on {local}");
            let token = dispatcher.fds.insert(FdKind::Master(listener));
            if let Some(FdKind::Master(l)) = dispatcher.fds.get_mut(token) {
                listener_register(&dispatcher.poll, l, token)?;
            }
            dispatcher.master_addr = Some(local);
        }
        Ok(dispatcher)
    }

    /// Address of the master listener, when unicast is enabled.
    pub fn master_addr(&self) -> Option<SocketAddr> {
        self.master_addr
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.client_count
    }

    /// Installs the tuner description reported by the XML state.
    pub fn set_tuner_status(&mut self, tuner: TunerStatus) {
        self.tuner = tuner;
    }

    /// Runs one reactor tick: polls with the given budget and handles
    /// every ready descriptor.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();
        for (token, readable, writable) in ready {
            match self.fds.get_mut(token) {
                Some(FdKind::Master(_)) | Some(FdKind::ChannelListener { .. }) => {
                    if readable {
                        self.handle_accept(token)?;
                    }
                }
                Some(FdKind::Client(_)) => {
                    if writable {
                        self.handle_client_writable(token);
                    }
                    if readable {
                        self.handle_client_readable(token)?;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    fn handle_accept(&mut self, token: Token) -> Result<()> {
        loop {
            let (accepted, preset) = match self.fds.get_mut(token) {
                Some(FdKind::Master(listener)) => (listener.accept(), None),
                Some(FdKind::ChannelListener { listener, channel }) => {
                    let channel = *channel;
                    (listener.accept(), Some(channel))
                }
                _ => return Ok(()),
            };
            match accepted {
                Ok((stream, peer)) => self.admit_client(stream, peer, preset)?,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!("error when accepting an incoming connection: {e}");
                    return Ok(());
                }
            }
        }
    }

    fn admit_client(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        preset: Option<usize>,
    ) -> Result<()> {
        let max = self.config.unicast.max_clients;
        if max > 0 && self.client_count >= max {
            info!("too many clients connected, 503 to {peer}");
            let mut stream = stream;
            let _ = stream.write(HTTP_503_REPLY);
            return Ok(());
        }
        let mut client = UnicastClient::new(stream, peer);
        client.asked_channel = preset;
        if let Some(channel) = preset {
            debug!("connection on a channel socket, the client will get channel {channel}");
        }
        let token = self.fds.insert(FdKind::Client(Box::new(client)));
        if let Some(FdKind::Client(client)) = self.fds.get_mut(token) {
            self.poll
                .registry()
                .register(&mut client.stream, token, Interest::READABLE)?;
        }
        self.client_count += 1;
        debug!("new client {peer}, {} connected", self.client_count);
        Ok(())
    }

    fn handle_client_readable(&mut self, token: Token) -> Result<()> {
        let mut complete = false;
        let action = {
            let Some(FdKind::Client(client)) = self.fds.get_mut(token) else {
                return Ok(());
            };
            match client.read_request() {
                Ok(0) => Action::Close,
                Ok(_) => {
                    complete = client.request_complete();
                    Action::Keep
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Action::Keep,
                Err(e) => {
                    debug!("recv failed for {}: {e}", client.peer);
                    Action::Close
                }
            }
        };
        if complete {
            return self.handle_request(token);
        }
        if matches!(action, Action::Close) {
            self.close_client(token);
        }
        Ok(())
    }

    fn handle_client_writable(&mut self, token: Token) {
        let result = {
            let Some(FdKind::Client(client)) = self.fds.get_mut(token) else {
                return;
            };
            match client.flush_backlog() {
                Ok(true) => {
                    let reregister = self.poll.registry().reregister(
                        &mut client.stream,
                        token,
                        Interest::READABLE,
                    );
                    reregister.map(|_| Action::Keep)
                }
                Ok(false) => Ok(Action::Keep),
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(Action::Keep) => {}
            _ => self.close_client(token),
        }
    }

    /// Parses and routes a complete HTTP request.
    fn handle_request(&mut self, token: Token) -> Result<()> {
        let (streaming, preset, request) = {
            let Some(FdKind::Client(client)) = self.fds.get_mut(token) else {
                return Ok(());
            };
            let request = client.request().to_vec();
            let preset = client.asked_channel.take();
            client.clear_request();
            (client.is_streaming(), preset, request)
        };
        let text = String::from_utf8_lossy(&request).into_owned();

        if !text.starts_with("GET ") {
            // Unknown method: 501, and only an already-streaming client
            // keeps its connection.
            let method = text.split_whitespace().next().unwrap_or("").to_string();
            info!("unhandled HTTP method \"{method}\", error 501");
            self.write_blob(token, HTTP_501_REPLY);
            if !streaming {
                self.close_client(token);
            }
            return Ok(());
        }

        if streaming {
            // A connection is either control or streaming, never both.
            info!("a channel is already streamed to this client, error 501");
            self.write_blob(token, HTTP_501_REPLY);
            self.close_client(token);
            return Ok(());
        }

        // Connections from a per-channel listener ignore the path.
        if let Some(channel) = preset {
            debug!("channel by socket, number {}", channel + 1);
            let action = self.bind_channel(token, channel);
            if matches!(action, Action::Close) {
                self.close_client(token);
            }
            return Ok(());
        }

        let path = text[4..].split_whitespace().next().unwrap_or("").to_string();
        let host = text
            .lines()
            .find_map(|line| line.strip_prefix("Host: "))
            .map(|h| h.trim_end().to_string());

        let action = self.route(token, &path, host.as_deref())?;
        if matches!(action, Action::Close) {
            self.close_client(token);
        }
        Ok(())
    }

    fn route(&mut self, token: Token, path: &str, host: Option<&str>) -> Result<Action> {
        if let Some(rest) = path.strip_prefix("/bynumber/") {
            return Ok(match rest.parse::<usize>() {
                Ok(number) if number >= 1 && number <= self.channels.len() => {
                    debug!("channel by number, number {number}");
                    self.bind_channel(token, number - 1)
                }
                _ => {
                    info!("channel by number, \"{rest}\" out of range");
                    self.send_404(token)
                }
            });
        }
        if let Some(rest) = path.strip_prefix("/bysid/") {
            let requested: Option<u16> = rest.parse().ok();
            let found = requested.and_then(|sid| {
                self.channels
                    .read()
                    .iter()
                    .position(|channel| channel.service_id == sid)
            });
            return Ok(match found {
                Some(index) => {
                    debug!("channel by service id, number {}", index + 1);
                    self.bind_channel(token, index)
                }
                None => {
                    info!("channel by service id, \"{rest}\" not found");
                    self.send_404(token)
                }
            });
        }
        if path.starts_with("/byname/") {
            // Reserved; name matching rules were never pinned down.
            info!("channel by name requested, not implemented");
            return Ok(self.send_404(token));
        }

        let result = match path {
            "/channels_list.html" => {
                info!("channel list");
                self.with_client_socket(token, |socket, channels, _ctx| {
                    monitor::send_channel_list_html(socket, channels, host)
                })
            }
            "/channels_list.json" => {
                info!("channel list JSON");
                self.with_client_socket(token, |socket, channels, _ctx| {
                    monitor::send_channel_list_json(socket, channels)
                })
            }
            "/playlist.m3u" | "/playlist_port.m3u" => {
                info!("playlist");
                let per_port = path == "/playlist_port.m3u";
                let master_port = self.master_addr.map(|a| a.port()).unwrap_or(0);
                self.with_client_socket(token, |socket, channels, ctx| {
                    monitor::send_playlist_unicast(
                        socket,
                        channels,
                        ctx.local_ip,
                        master_port,
                        per_port,
                    )
                })
            }
            "/playlist_multicast.m3u" | "/playlist_multicast_vlc.m3u" => {
                info!("multicast playlist");
                let vlc = path.ends_with("_vlc.m3u");
                let rtp = self.config.multicast.rtp;
                self.with_client_socket(token, |socket, channels, _ctx| {
                    monitor::send_playlist_multicast(socket, channels, rtp, vlc)
                })
            }
            "/monitor/signal_power.json" => {
                info!("signal power JSON");
                let signal = self.signal.lock().clone();
                self.with_client_socket(token, |socket, _channels, _ctx| {
                    monitor::send_signal_power_json(socket, &signal)
                })
            }
            "/monitor/channels_traffic.json" => {
                info!("channel traffic JSON");
                let uptime = self.start.elapsed().as_secs();
                self.with_client_socket(token, |socket, channels, _ctx| {
                    monitor::send_channel_traffic_json(socket, channels, uptime)
                })
            }
            "/monitor/state.xml" => {
                info!("XML state");
                return Ok(self.send_state_xml(token));
            }
            "/cam/menu.xml" => {
                info!("CAM menu");
                let descrambler = Arc::clone(&self.descrambler);
                self.with_client_socket(token, |socket, _channels, _ctx| {
                    monitor::send_cam_menu(socket, descrambler.as_ref())
                })
            }
            _ if path.starts_with("/cam/action.xml?key=") => {
                info!("CAM action");
                let key = path["/cam/action.xml?key=".len()..]
                    .chars()
                    .next()
                    .unwrap_or('0');
                let descrambler = Arc::clone(&self.descrambler);
                self.with_client_socket(token, |socket, _channels, _ctx| {
                    monitor::send_cam_action(socket, descrambler.as_ref(), key)
                })
            }
            _ => {
                info!("path \"{path}\" not found, error 404");
                return Ok(self.send_404(token));
            }
        };
        if let Err(e) = result {
            debug!("error while sending the reply: {e}");
        }
        Ok(Action::Close)
    }

    /// Extra context handed to monitor closures.
    fn with_client_socket<F>(&mut self, token: Token, body: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write, &[crate::channel::Channel], &MonitorCtx) -> Result<()>,
    {
        let channels = Arc::clone(&self.channels);
        let Some(FdKind::Client(client)) = self.fds.get_mut(token) else {
            return Ok(());
        };
        let ctx = MonitorCtx {
            local_ip: client
                .stream
                .local_addr()
                .map(|a| a.ip())
                .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0])),
        };
        let guard = channels.read();
        body(&mut client.stream, &guard, &ctx)
    }

    fn send_state_xml(&mut self, token: Token) -> Action {
        let users = self.users();
        let signal = self.signal.lock().clone();
        let uptime_secs = self.start.elapsed().as_secs();
        let autoconf_done = self.autoconf_done.load(Ordering::Acquire);
        let descrambler = Arc::clone(&self.descrambler);
        let tuner = self.tuner.clone();
        let channels = Arc::clone(&self.channels);
        let Some(FdKind::Client(client)) = self.fds.get_mut(token) else {
            return Action::Close;
        };
        let ctx = StateContext {
            signal: &signal,
            tuner: &tuner,
            uptime_secs,
            autoconf_done,
            users: &users,
            descrambler: descrambler.as_ref(),
        };
        let guard = channels.read();
        if let Err(e) = monitor::send_xml_state(&mut client.stream, &guard, &ctx) {
            debug!("error while sending the XML state: {e}");
        }
        Action::Close
    }

    /// Binds a control client to a channel and starts streaming.
    fn bind_channel(&mut self, token: Token, index: usize) -> Action {
        if index >= self.channels.len() {
            return self.send_404(token);
        }
        let queue_size = self.config.unicast.queue_size;
        let peer = {
            let Some(FdKind::Client(client)) = self.fds.get_mut(token) else {
                return Action::Close;
            };
            let header = Bytes::from_static(HTTP_STREAM_HEADER.as_bytes());
            if client.send_stream(header, queue_size, false) == SendOutcome::Dead {
                return Action::Close;
            }
            client.channel = Some(index);
            client.peer
        };
        let mut channels = self.channels.write();
        if let Some(channel) = channels.get_mut(index) {
            channel.clients.push(token.0);
            info!("client {peer} now streams channel \"{}\"", channel.name);
        }
        Action::Keep
    }

    fn send_404(&mut self, token: Token) -> Action {
        let Some(FdKind::Client(client)) = self.fds.get_mut(token) else {
            return Action::Close;
        };
        let mut reply = ReplyBuilder::new();
        let _ = write!(reply, "{}", http_404_body());
        if let Err(e) = reply.send(&mut client.stream, 404, "text/html") {
            debug!("error while sending the 404 reply: {e}");
        }
        Action::Close
    }

    fn write_blob(&mut self, token: Token, blob: &[u8]) {
        if let Some(FdKind::Client(client)) = self.fds.get_mut(token) {
            let _ = client.stream.write(blob);
        }
    }

    fn close_client(&mut self, token: Token) {
        if let Some(FdKind::Client(mut client)) = self.fds.remove(token) {
            let _ = self.poll.registry().deregister(&mut client.stream);
            if let Some(index) = client.channel {
                if let Some(channel) = self.channels.write().get_mut(index) {
                    channel.clients.retain(|&t| t != token.0);
                }
            }
            self.client_count -= 1;
            debug!("connection closed, {} clients left", self.client_count);
        }
    }

    /// Distributes one datagram's worth of TS data to the clients of a
    /// channel. Slow clients accumulate backlog and are dropped once
    /// they stay blocked past the configured timeout.
    pub fn stream_to_clients(&mut self, channel_index: usize, data: &Bytes) {
        let tokens: Vec<usize> = {
            let channels = self.channels.read();
            match channels.get(channel_index) {
                Some(channel) => channel.clients.clone(),
                None => return,
            }
        };
        if tokens.is_empty() {
            return;
        }
        let queue_size = self.config.unicast.queue_size;
        let flush_on_eagain = self.config.unicast.flush_on_eagain;
        let timeout = self.config.unicast.consecutive_errors_timeout;
        let now = Instant::now();
        let mut dead = Vec::new();
        for raw in tokens {
            let token = Token(raw);
            let Some(FdKind::Client(client)) = self.fds.get_mut(token) else {
                continue;
            };
            match client.send_stream(data.clone(), queue_size, flush_on_eagain) {
                SendOutcome::Dead => {
                    dead.push(token);
                    continue;
                }
                SendOutcome::Dropped => {
                    debug!("data dropped for slow client {}", client.peer);
                }
                SendOutcome::Queued => {}
            }
            if client.blocked_longer_than(now, timeout) {
                info!(
                    "client {} blocked for more than {timeout}s, closing",
                    client.peer
                );
                dead.push(token);
                continue;
            }
            if client.has_backlog() {
                let _ = self.poll.registry().reregister(
                    &mut client.stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                );
            }
        }
        for token in dead {
            self.close_client(token);
        }
    }

    /// Connected clients as reported by the XML state.
    fn users(&self) -> Vec<UserInfo> {
        let channels = self.channels.read();
        self.fds
            .iter()
            .filter_map(|entry| match &entry.kind {
                FdKind::Client(client) => {
                    let bound = client.channel.and_then(|idx| channels.get(idx));
                    Some(UserInfo {
                        token: entry.token.0,
                        peer: client.peer,
                        asked_channel: client.asked_channel,
                        service_id: bound.map(|c| c.service_id),
                        channel_name: bound.map(|c| c.name.clone()),
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Drains every connection and listener.
    pub fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.fds.iter().map(|entry| entry.token).collect();
        for token in tokens {
            match self.fds.remove(token) {
                Some(FdKind::Client(mut client)) => {
                    let _ = self.poll.registry().deregister(&mut client.stream);
                    self.client_count -= 1;
                }
                Some(FdKind::Master(mut listener))
                | Some(FdKind::ChannelListener { mut listener, .. }) => {
                    let _ = self.poll.registry().deregister(&mut listener);
                }
                None => {}
            }
        }
        self.master_addr = None;
        info!("unicast dispatcher shut down");
    }
}

/// Address information for monitor closures.
struct MonitorCtx {
    local_ip: std::net::IpAddr,
}

impl ListenerHost for UnicastDispatcher {
    fn open_channel_listener(&mut self, channel_index: usize, port: u16) -> Result<()> {
        let addr = SocketAddr::new(self.config.unicast.bind_ip, port);
        let listener = TcpListener::bind(addr)
            .map_err(|e| FanError::Protocol(format!("cannot bind channel socket {addr}: {e}")))?;
        let token = self.fds.insert(FdKind::ChannelListener {
            listener,
            channel: channel_index,
        });
        if let Some(FdKind::ChannelListener { listener, .. }) = self.fds.get_mut(token) {
            listener_register(&self.poll, listener, token)?;
        }
        Ok(())
    }
}

fn listener_register(poll: &Poll, listener: &mut TcpListener, token: Token) -> Result<()> {
    poll.registry()
        .register(listener, token, Interest::READABLE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_table_swap_remove_keeps_index() {
        let mut table = FdTable::new();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let t0 = table.insert(FdKind::Master(TcpListener::from_std(
            listener.try_clone().unwrap(),
        )));
        let t1 = table.insert(FdKind::Master(TcpListener::from_std(
            listener.try_clone().unwrap(),
        )));
        let t2 = table.insert(FdKind::Master(TcpListener::from_std(listener)));
        assert!(table.consistent());

        table.remove(t0);
        assert!(table.consistent());
        assert!(table.get_mut(t0).is_none());
        assert!(table.get_mut(t1).is_some());
        assert!(table.get_mut(t2).is_some());

        table.remove(t2);
        assert!(table.consistent());
        assert!(table.get_mut(t1).is_some());
    }
}
