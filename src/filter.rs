//! Demux pid filter bookkeeping.
//!
//! The tuner hardware only hands over pids that were explicitly asked
//! for. [`PidFilterTable`] tracks, for each of the 8192 possible pids,
//! whether it is asked and how many channels want it; the [`Demux`]
//! trait is the narrow interface to whatever opens and programs the
//! hardware filters.

use crate::error::Result;
use crate::psi::PID_COUNT;
use bitvec::prelude::*;

/// Filter state of a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    /// No channel needs the pid.
    NotAsked,
    /// At least one channel needs the pid.
    Asked,
}

/// Reference-counted set of pids the demux must deliver.
///
/// Invariant: a pid is `Asked` exactly when its reference count is
/// positive.
#[derive(Debug, Clone)]
pub struct PidFilterTable {
    asked: BitVec,
    refcounts: Vec<u16>,
}

impl Default for PidFilterTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PidFilterTable {
    /// Creates a table with every pid unasked.
    pub fn new() -> Self {
        Self {
            asked: bitvec![0; PID_COUNT],
            refcounts: vec![0; PID_COUNT],
        }
    }

    /// Adds one reference to a pid, marking it asked.
    pub fn ask(&mut self, pid: u16) {
        let idx = usize::from(pid & 0x1FFF);
        self.refcounts[idx] = self.refcounts[idx].saturating_add(1);
        self.asked.set(idx, true);
    }

    /// Drops one reference; the pid stops being asked when the count
    /// reaches zero.
    pub fn release(&mut self, pid: u16) {
        let idx = usize::from(pid & 0x1FFF);
        self.refcounts[idx] = self.refcounts[idx].saturating_sub(1);
        if self.refcounts[idx] == 0 {
            self.asked.set(idx, false);
        }
    }

    /// Filter state of a pid.
    pub fn state(&self, pid: u16) -> PidState {
        if self.asked[usize::from(pid & 0x1FFF)] {
            PidState::Asked
        } else {
            PidState::NotAsked
        }
    }

    /// True when the pid is asked.
    pub fn is_asked(&self, pid: u16) -> bool {
        self.state(pid) == PidState::Asked
    }

    /// Number of channels referencing the pid.
    pub fn refcount(&self, pid: u16) -> u16 {
        self.refcounts[usize::from(pid & 0x1FFF)]
    }

    /// All asked pids, ascending.
    pub fn asked_pids(&self) -> Vec<u16> {
        self.asked.iter_ones().map(|idx| idx as u16).collect()
    }

    /// Checks the asked/refcount invariant; meant for tests and debug
    /// assertions.
    pub fn consistent(&self) -> bool {
        (0..PID_COUNT).all(|idx| self.asked[idx] == (self.refcounts[idx] > 0))
    }
}

/// Interface to the tuner's demux filters.
///
/// The streaming plane rebuilds the filter set whenever channel pids
/// change; implementations translate the asked-pid set into hardware
/// filters (and own the file descriptors doing so).
pub trait Demux: Send {
    /// Programs the hardware to deliver exactly the asked pids.
    fn set_filters(&mut self, filters: &PidFilterTable) -> Result<()>;
}

/// A demux that programs nothing, for tests and file playback.
#[derive(Debug, Default)]
pub struct NoopDemux;

impl Demux for NoopDemux {
    fn set_filters(&mut self, _filters: &PidFilterTable) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ask_release_invariant() {
        let mut table = PidFilterTable::new();
        assert_eq!(table.state(256), PidState::NotAsked);

        table.ask(256);
        table.ask(256);
        assert_eq!(table.state(256), PidState::Asked);
        assert_eq!(table.refcount(256), 2);
        assert!(table.consistent());

        table.release(256);
        assert!(table.is_asked(256));
        table.release(256);
        assert_eq!(table.state(256), PidState::NotAsked);
        assert!(table.consistent());
    }

    #[test]
    fn test_release_below_zero_is_harmless() {
        let mut table = PidFilterTable::new();
        table.release(100);
        assert_eq!(table.refcount(100), 0);
        assert!(table.consistent());
    }

    #[test]
    fn test_asked_pids_sorted() {
        let mut table = PidFilterTable::new();
        for pid in [700u16, 0, 256] {
            table.ask(pid);
        }
        assert_eq!(table.asked_pids(), vec![0, 256, 700]);
    }
}
