//! PID filter management for one adapter.
//!
//! Several services on the same multiplex may share PIDs (the PAT PID
//! always, sometimes a PCR carried on a video PID of another service), so
//! the whitelist is reference counted: a PID leaves the hardware filter
//! only when its last user is gone.

use std::collections::HashMap;
use std::io::Read;

use log::{debug, trace};

use crate::error::{DvbError, Result};
use crate::hw::{DemuxIo, SectionRead};

pub struct Demux {
    io: Box<dyn DemuxIo>,
    pid_refs: HashMap<u16, u32>,
    dvr_open: bool,
}

impl Demux {
    pub fn new(io: Box<dyn DemuxIo>) -> Self {
        Demux {
            io,
            pid_refs: HashMap::new(),
            dvr_open: false,
        }
    }

    /// Opens a section filter for `(pid, table_id)`; reads yield complete
    /// sections. Section filters multiplex freely next to the TS tap.
    pub fn open_section_filter(&mut self, pid: u16, table_id: u8) -> Result<Box<dyn SectionRead>> {
        trace!("section filter pid={pid:#06x} table_id={table_id:#04x}");
        self.io.open_section_filter(pid, table_id, 0xFF)
    }

    /// Whitelists every PID in `pids` on the TS tap, bumping refcounts.
    /// On failure the PIDs added by this call are rolled back.
    pub fn select_pids(&mut self, pids: impl IntoIterator<Item = u16>) -> Result<()> {
        let mut added = Vec::new();
        for pid in pids {
            let refs = self.pid_refs.entry(pid).or_insert(0);
            if *refs == 0 {
                if let Err(e) = self.io.add_pid(pid) {
                    self.pid_refs.remove(&pid);
                    for undo in added {
                        self.release_pid(undo);
                    }
                    return Err(e);
                }
                debug!("pid {pid:#06x} added to whitelist");
            }
            *refs += 1;
            added.push(pid);
        }
        Ok(())
    }

    /// Drops one reference per PID; a PID leaves the hardware whitelist
    /// when its count reaches zero. Unknown PIDs are ignored.
    pub fn unselect_pids(&mut self, pids: impl IntoIterator<Item = u16>) {
        for pid in pids {
            self.release_pid(pid);
        }
    }

    fn release_pid(&mut self, pid: u16) {
        if let Some(refs) = self.pid_refs.get_mut(&pid) {
            *refs -= 1;
            if *refs == 0 {
                self.pid_refs.remove(&pid);
                self.io.remove_pid(pid);
                debug!("pid {pid:#06x} removed from whitelist");
            }
        }
    }

    /// Opens the DVR device. At most one TS-passthrough open per adapter.
    pub fn open_dvr(&mut self) -> Result<Box<dyn Read + Send>> {
        if self.dvr_open {
            return Err(DvbError::FilterOpenFailed(
                "dvr already open on this adapter".into(),
            ));
        }
        let reader = self.io.open_dvr()?;
        self.dvr_open = true;
        Ok(reader)
    }

    pub fn close_dvr(&mut self) {
        self.dvr_open = false;
    }

    pub fn dvr_is_open(&self) -> bool {
        self.dvr_open
    }

    pub fn active_pids(&self) -> Vec<u16> {
        let mut pids: Vec<u16> = self.pid_refs.keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockDemux;
    use std::sync::Arc;

    #[test]
    fn shared_pids_are_reference_counted() {
        let mock = MockDemux::new();
        let log = Arc::clone(&mock.log);
        let mut demux = Demux::new(Box::new(mock));

        demux.select_pids([0x000, 0x100, 0x200]).unwrap();
        demux.select_pids([0x000, 0x300]).unwrap(); // PAT PID shared
        assert_eq!(log.lock().added_pids, vec![0x000, 0x100, 0x200, 0x300]);

        demux.unselect_pids([0x000, 0x100, 0x200]);
        // 0x000 still referenced by the second service.
        assert_eq!(log.lock().removed_pids, vec![0x100, 0x200]);
        assert_eq!(demux.active_pids(), vec![0x000, 0x300]);

        demux.unselect_pids([0x000, 0x300]);
        assert_eq!(log.lock().removed_pids, vec![0x100, 0x200, 0x000, 0x300]);
        assert!(demux.active_pids().is_empty());
    }

    #[test]
    fn only_one_dvr_open_at_a_time() {
        let mut demux = Demux::new(Box::new(MockDemux::new()));
        let _dvr = demux.open_dvr().unwrap();
        assert!(demux.dvr_is_open());
        assert!(matches!(
            demux.open_dvr(),
            Err(DvbError::FilterOpenFailed(_))
        ));
        demux.close_dvr();
        assert!(demux.open_dvr().is_ok());
    }

    #[test]
    fn unselect_unknown_pid_is_harmless() {
        let mut demux = Demux::new(Box::new(MockDemux::new()));
        demux.unselect_pids([0x555]);
        assert!(demux.active_pids().is_empty());
    }
}
