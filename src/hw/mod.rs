//! Hardware surface of the DVB stack.
//!
//! The rest of the crate talks to adapters through the traits here: tune a
//! frontend and poll its lock, install section and PID filters, and open
//! the full-TS DVR handle. The Linux DVB API implementation lives in
//! [`linux`]; tests substitute mocks.

use std::io::Read;
use std::time::Duration;

use crate::error::Result;
use crate::model::transponder::{DeliverySystem, FecRate, Modulation};

#[cfg(target_os = "linux")]
pub mod linux;

/// LNB supply voltage, which selects satellite polarization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LnbVoltage {
    V13,
    V18,
    Off,
}

/// Snapshot of the frontend lock state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontendStatus {
    pub has_signal: bool,
    pub has_carrier: bool,
    pub has_lock: bool,
}

/// Raw signal quality readouts for the monitor thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalStats {
    pub signal_strength: u16,
    pub snr: u16,
    pub ber: u32,
}

/// Flattened tuning request handed to the hardware.
///
/// `frequency` is Hz for terrestrial and cable; for satellite it is the
/// intermediate frequency in kHz, after the LNB local-oscillator shift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuneCommand {
    pub system: DeliverySystem,
    pub frequency: u32,
    pub symbol_rate: u32,
    pub modulation: Modulation,
    pub fec: FecRate,
    /// Low-priority code rate; terrestrial only.
    pub fec_lp: FecRate,
    pub bandwidth_hz: u32,
}

/// One tunable frontend device.
pub trait FrontendIo: Send {
    /// Delivery system this frontend can tune.
    fn system(&self) -> DeliverySystem;

    /// Fires the tuning request; lock is polled separately.
    fn tune(&mut self, cmd: &TuneCommand) -> Result<()>;

    fn status(&mut self) -> Result<FrontendStatus>;

    fn signal_stats(&mut self) -> Result<SignalStats>;

    fn set_voltage(&mut self, voltage: LnbVoltage) -> Result<()>;

    /// 22 kHz continuous tone, selecting the LNB high band.
    fn set_tone(&mut self, on: bool) -> Result<()>;

    /// Raw DiSEqC master command bytes.
    fn send_diseqc(&mut self, msg: &[u8]) -> Result<()>;
}

/// A section filter handle; each read yields one complete section.
pub trait SectionRead: Send {
    /// Blocks up to `timeout`; `Ok(None)` means the timeout elapsed.
    fn read_section(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// The demultiplexer device of one adapter.
pub trait DemuxIo: Send {
    fn open_section_filter(
        &mut self,
        pid: u16,
        table_id: u8,
        table_id_mask: u8,
    ) -> Result<Box<dyn SectionRead>>;

    /// Whitelists a PID on the full-TS tap.
    fn add_pid(&mut self, pid: u16) -> Result<()>;

    fn remove_pid(&mut self, pid: u16);

    /// Opens the DVR device delivering all whitelisted PIDs. A read of zero
    /// bytes means "no data right now", never EOF.
    fn open_dvr(&mut self) -> Result<Box<dyn Read + Send>>;
}
