#![doc(html_root_url = "https://docs.rs/dvbfan/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # dvbfan - DVB Transport Stream Fan-Out
//!
//! `dvbfan` takes a raw MPEG-2 transport stream from a DVB tuner,
//! discovers the services it carries from the PSI/SI tables, and
//! re-emits each service as an independent network stream: IPv4/IPv6
//! multicast (raw TS or RTP-framed) plus per-channel HTTP unicast, with
//! an embedded HTTP/1.0 control and monitoring surface.
//!
//! ## Pipeline
//!
//! ```rust,no_run
//! use dvbfan::{cam, config::Config, fanout::Fanout, filter::NoopDemux};
//!
//! fn main() -> dvbfan::Result<()> {
//!     let mut config = Config::default();
//!     config.apply("autoconfiguration", "full")?;
//!     config.apply("unicast", "1")?;
//!     config.apply("port_http", "4242")?;
//!
//!     let mut fanout = Fanout::new(config, Box::new(NoopDemux), cam::inert())?;
//!
//!     // The packet source (tuner, socket, file) is owned by the caller:
//!     let packet = [0u8; 188];
//!     loop {
//!         fanout.handle_ts_packet(&packet)?;
//!         fanout.tick()?;
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `psi`: TS packet access, PSI section reassembly, table decoders
//!   (PAT, SDT, PMT, NIT, ATSC VCT)
//! - `autoconf`: the service discovery state machine and the name/IP
//!   template engine
//! - `channel`: output channels and the published channel table
//! - `filter`: demux pid filter bookkeeping and the `Demux` trait
//! - `net`: multicast sockets, datagram batching, RTP framing
//! - `unicast`: the poll-based HTTP dispatcher and monitor endpoints
//! - `cam`: the descrambler capability interface
//! - `config`: typed settings and key/value application
//! - `fanout`: top-level composition
//! - `error`: error types and the crate `Result`

use std::sync::atomic::{AtomicBool, Ordering};

/// Service autoconfiguration engine
pub mod autoconf;

/// Descrambler capability interface
pub mod cam;

/// Output channels and the published channel table
pub mod channel;

/// Typed runtime settings
pub mod config;

/// Error types and utilities
pub mod error;

/// Top-level pipeline composition
pub mod fanout;

/// Demux pid filter bookkeeping
pub mod filter;

/// Multicast output and RTP framing
pub mod net;

/// PSI/SI table handling
pub mod psi;

/// HTTP unicast dispatcher and monitoring
pub mod unicast;

/// Common utilities and helper functions
pub mod utils;

pub use error::{FanError, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Requests a cooperative shutdown: the main loop drains clients,
/// closes the sockets and exits. Called from signal handlers and on
/// unrecoverable errors (allocation failure).
pub fn set_interrupted() {
    INTERRUPTED.store(true, Ordering::Release);
}

/// True once a shutdown has been requested.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Acquire)
}
