//! Frontend tuning policy: retries, lock polling, LNB switching and the
//! background signal monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::error::{DvbError, Result};
use crate::hw::{FrontendIo, LnbVoltage, TuneCommand};
use crate::model::transponder::{DeliverySystem, FecRate, Modulation, Transponder, TuningParams};

/// LNB local-oscillator configuration. The default is the universal Ku-band
/// LNB: 9.75/10.6 GHz oscillators switched at 11.7 GHz.
#[derive(Debug, Clone)]
pub struct Lnb {
    pub low_oscillator: u64,
    pub high_oscillator: u64,
    pub switch_frequency: u64,
    /// DiSEqC 1.0 committed port, when the LNB sits behind a switch.
    pub committed_port: Option<u8>,
}

impl Default for Lnb {
    fn default() -> Self {
        Lnb {
            low_oscillator: 9_750_000_000,
            high_oscillator: 10_600_000_000,
            switch_frequency: 11_700_000_000,
            committed_port: None,
        }
    }
}

/// Knobs for one tune call.
#[derive(Debug, Clone)]
pub struct TuneOptions {
    /// Lock-poll window per attempt.
    pub timeout: Duration,
    /// Total attempts on transient no-lock.
    pub retries: u32,
    /// Backoff before the second attempt; doubles per retry.
    pub initial_backoff: Duration,
}

impl Default for TuneOptions {
    fn default() -> Self {
        TuneOptions {
            timeout: Duration::from_millis(2000),
            retries: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

/// Outcome of a tune call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneResult {
    Locked,
    NoSignal,
    NoLock,
}

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SEC_SETTLE: Duration = Duration::from_millis(15);

/// One frontend of an adapter, wrapping the raw device with tuning policy.
pub struct Frontend {
    label: String,
    io: Arc<Mutex<Box<dyn FrontendIo>>>,
    lnb: Lnb,
    tuned: Option<Transponder>,
    monitor: Option<SignalMonitor>,
    monitor_interval: Option<Duration>,
}

impl Frontend {
    pub fn new(label: impl Into<String>, io: Box<dyn FrontendIo>) -> Self {
        Frontend {
            label: label.into(),
            io: Arc::new(Mutex::new(io)),
            lnb: Lnb::default(),
            tuned: None,
            monitor: None,
            monitor_interval: Some(Duration::from_secs(1)),
        }
    }

    pub fn with_lnb(mut self, lnb: Lnb) -> Self {
        self.lnb = lnb;
        self
    }

    /// `None` disables the background signal monitor.
    pub fn set_monitor_interval(&mut self, interval: Option<Duration>) {
        self.monitor_interval = interval;
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn system(&self) -> DeliverySystem {
        self.io.lock().system()
    }

    pub fn tuned(&self) -> Option<&Transponder> {
        self.tuned.as_ref()
    }

    pub fn is_tuned_to(&self, transponder: &Transponder) -> bool {
        self.tuned.as_ref() == Some(transponder)
    }

    /// Tunes to `transponder`, polling for lock and retrying with
    /// exponential backoff on transient no-lock.
    pub fn tune(&mut self, transponder: &Transponder, opts: &TuneOptions) -> Result<TuneResult> {
        if self.is_tuned_to(transponder) {
            return Ok(TuneResult::Locked);
        }
        self.stop_monitor();
        self.tuned = None;

        let cmd = self.build_command(transponder)?;
        let mut saw_signal = false;

        for attempt in 1..=opts.retries.max(1) {
            // The backoff is charged against this attempt's lock window,
            // so the whole call stays bounded by timeout * retries.
            let attempt_deadline = Instant::now() + opts.timeout;
            if attempt > 1 {
                let backoff = opts.initial_backoff * 2u32.pow(attempt - 2);
                debug!(
                    "{}: no lock, retrying in {}ms (attempt {attempt}/{})",
                    self.label,
                    backoff.as_millis(),
                    opts.retries
                );
                std::thread::sleep(backoff);
            }

            {
                let mut io = self.io.lock();
                if let TuningParams::Satellite { polarization, .. } = transponder.params() {
                    let high_band = transponder.frequency() >= self.lnb.switch_frequency;
                    lnb_sequence(io.as_mut(), &self.lnb, polarization.is_high_voltage(), high_band)?;
                }
                io.tune(&cmd)?;
            }

            while Instant::now() < attempt_deadline {
                let status = self.io.lock().status()?;
                if status.has_lock {
                    info!("{}: locked on {}", self.label, transponder);
                    self.tuned = Some(transponder.clone());
                    self.start_monitor();
                    return Ok(TuneResult::Locked);
                }
                saw_signal |= status.has_signal;
                let remaining = attempt_deadline.saturating_duration_since(Instant::now());
                std::thread::sleep(LOCK_POLL_INTERVAL.min(remaining));
            }
        }

        let result = if saw_signal {
            TuneResult::NoLock
        } else {
            TuneResult::NoSignal
        };
        debug!("{}: giving up on {} ({result:?})", self.label, transponder);
        Ok(result)
    }

    /// Returns the frontend to idle. The signal monitor is joined before
    /// any frontend state is torn down.
    pub fn release(&mut self) {
        self.stop_monitor();
        if let Some(t) = self.tuned.take() {
            debug!("{}: released (was {t})", self.label);
            if t.system() == DeliverySystem::Satellite {
                if let Err(e) = self.io.lock().set_voltage(LnbVoltage::Off) {
                    warn!("{}: failed to power down LNB: {e}", self.label);
                }
            }
        }
    }

    fn build_command(&self, transponder: &Transponder) -> Result<TuneCommand> {
        let io_system = self.system();
        if io_system != transponder.system() {
            return Err(DvbError::TuneFailed(format!(
                "{} frontend cannot tune {} transponder",
                io_system,
                transponder.system()
            )));
        }
        Ok(match transponder.params() {
            TuningParams::Terrestrial {
                frequency,
                bandwidth,
                modulation,
                code_rate_hp,
                code_rate_lp,
            } => TuneCommand {
                system: DeliverySystem::Terrestrial,
                frequency: *frequency as u32,
                symbol_rate: 0,
                modulation: *modulation,
                fec: *code_rate_hp,
                fec_lp: *code_rate_lp,
                bandwidth_hz: bandwidth.hz(),
            },
            TuningParams::Satellite {
                frequency,
                symbol_rate,
                fec,
                ..
            } => {
                let lo = if *frequency >= self.lnb.switch_frequency {
                    self.lnb.high_oscillator
                } else {
                    self.lnb.low_oscillator
                };
                let intermediate = frequency.abs_diff(lo) / 1000;
                TuneCommand {
                    system: DeliverySystem::Satellite,
                    frequency: intermediate as u32,
                    symbol_rate: *symbol_rate,
                    modulation: Modulation::Qpsk,
                    fec: *fec,
                    fec_lp: FecRate::Auto,
                    bandwidth_hz: 0,
                }
            }
            TuningParams::Cable {
                frequency,
                symbol_rate,
                modulation,
                fec,
            } => TuneCommand {
                system: DeliverySystem::Cable,
                frequency: *frequency as u32,
                symbol_rate: *symbol_rate,
                modulation: *modulation,
                fec: *fec,
                fec_lp: FecRate::Auto,
                bandwidth_hz: 0,
            },
        })
    }

    fn start_monitor(&mut self) {
        let Some(interval) = self.monitor_interval else {
            return;
        };
        if self.monitor.is_some() {
            return;
        }
        self.monitor = SignalMonitor::spawn(self.label.clone(), Arc::clone(&self.io), interval);
    }

    fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop_and_join();
        }
    }
}

impl Drop for Frontend {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

/// Runs the LNB selection sequence: polarization voltage, DiSEqC committed
/// switch, band tone.
fn lnb_sequence(
    io: &mut dyn FrontendIo,
    lnb: &Lnb,
    high_voltage: bool,
    high_band: bool,
) -> Result<()> {
    io.set_voltage(if high_voltage {
        LnbVoltage::V18
    } else {
        LnbVoltage::V13
    })?;
    io.set_tone(false)?;
    std::thread::sleep(SEC_SETTLE);

    if let Some(port) = lnb.committed_port {
        let data = 0xF0
            | ((port & 0x03) << 2)
            | (if high_voltage { 0x02 } else { 0x00 })
            | (if high_band { 0x01 } else { 0x00 });
        io.send_diseqc(&[0xE0, 0x10, 0x38, data])?;
        std::thread::sleep(SEC_SETTLE);
    }

    io.set_tone(high_band)?;
    std::thread::sleep(SEC_SETTLE);
    Ok(())
}

/// Background sampler of signal/SNR/BER for a tuned frontend. Purely
/// observational: it never retunes.
struct SignalMonitor {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl SignalMonitor {
    fn spawn(
        label: String,
        io: Arc<Mutex<Box<dyn FrontendIo>>>,
        interval: Duration,
    ) -> Option<SignalMonitor> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let spawn_label = label.clone();
        let result = std::thread::Builder::new()
            .name(format!("sigmon-{label}"))
            .spawn(move || {
                let label = spawn_label;
                let mut next_sample = Instant::now();
                while !flag.load(Ordering::Relaxed) {
                    if Instant::now() >= next_sample {
                        match io.lock().signal_stats() {
                            Ok(stats) => trace!(
                                "{label}: signal={} snr={} ber={}",
                                stats.signal_strength,
                                stats.snr,
                                stats.ber
                            ),
                            Err(e) => debug!("{label}: signal sample failed: {e}"),
                        }
                        next_sample = Instant::now() + interval;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            });
        match result {
            Ok(handle) => Some(SignalMonitor { stop, handle }),
            Err(e) => {
                warn!("{label}: could not start signal monitor: {e}");
                None
            }
        }
    }

    fn stop_and_join(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::{MockFrontend, TuneBehavior};
    use crate::model::transponder::{Bandwidth, Polarization};

    fn fast_opts() -> TuneOptions {
        TuneOptions {
            timeout: Duration::from_millis(20),
            retries: 2,
            initial_backoff: Duration::from_millis(1),
        }
    }

    fn terrestrial() -> Transponder {
        Transponder::new(TuningParams::Terrestrial {
            frequency: 506_000_000,
            bandwidth: Bandwidth::Mhz8,
            modulation: Modulation::Qam64,
            code_rate_hp: FecRate::Fec2_3,
            code_rate_lp: FecRate::None,
        })
    }

    fn satellite() -> Transponder {
        Transponder::new(TuningParams::Satellite {
            frequency: 11_836_000_000,
            polarization: Polarization::Horizontal,
            symbol_rate: 27_500_000,
            fec: FecRate::Fec3_4,
            orbital: Some("19.2E".to_string()),
        })
    }

    #[test]
    fn tune_locks_and_remembers_transponder() {
        let mock = MockFrontend::new(DeliverySystem::Terrestrial, TuneBehavior::LockImmediately);
        let log = Arc::clone(&mock.log);
        let mut fe = Frontend::new("fe0", Box::new(mock));
        fe.set_monitor_interval(None);

        let t = terrestrial();
        assert_eq!(fe.tune(&t, &fast_opts()).unwrap(), TuneResult::Locked);
        assert!(fe.is_tuned_to(&t));
        {
            let guard = log.lock();
            let cmd = &guard.tune_calls[0];
            assert_eq!(cmd.frequency, 506_000_000);
            assert_eq!(cmd.bandwidth_hz, 8_000_000);
        }

        // Tuning again to the same carrier is a no-op.
        assert_eq!(fe.tune(&t, &fast_opts()).unwrap(), TuneResult::Locked);
        assert_eq!(log.lock().tune_calls.len(), 1);
    }

    #[test]
    fn tune_retries_then_reports_no_lock() {
        let mock = MockFrontend::new(DeliverySystem::Terrestrial, TuneBehavior::NeverLock);
        let log = Arc::clone(&mock.log);
        let mut fe = Frontend::new("fe0", Box::new(mock));
        fe.set_monitor_interval(None);

        assert_eq!(
            fe.tune(&terrestrial(), &fast_opts()).unwrap(),
            TuneResult::NoLock
        );
        assert_eq!(log.lock().tune_calls.len(), 2);
        assert!(fe.tuned().is_none());
    }

    #[test]
    fn default_options_bound_the_unreachable_case() {
        // With stock options an unreachable transponder exhausts all three
        // attempts in timeout * retries: the retry backoffs eat into the
        // attempts' lock windows instead of extending them.
        let mock = MockFrontend::new(DeliverySystem::Terrestrial, TuneBehavior::NeverLock);
        let mut fe = Frontend::new("fe0", Box::new(mock));
        fe.set_monitor_interval(None);

        let opts = TuneOptions::default();
        let started = std::time::Instant::now();
        let result = fe.tune(&terrestrial(), &opts).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result, TuneResult::NoLock);
        let bound = opts.timeout * opts.retries;
        assert!(
            elapsed < bound + Duration::from_millis(200),
            "took {elapsed:?}, bound {bound:?}"
        );
        assert!(elapsed >= bound - Duration::from_millis(200));
    }

    #[test]
    fn tune_reports_no_signal() {
        let mock = MockFrontend::new(DeliverySystem::Terrestrial, TuneBehavior::NoSignal);
        let mut fe = Frontend::new("fe0", Box::new(mock));
        fe.set_monitor_interval(None);
        assert_eq!(
            fe.tune(&terrestrial(), &fast_opts()).unwrap(),
            TuneResult::NoSignal
        );
    }

    #[test]
    fn satellite_tune_runs_lnb_sequence() {
        let mock = MockFrontend::new(DeliverySystem::Satellite, TuneBehavior::LockImmediately);
        let log = Arc::clone(&mock.log);
        let lnb = Lnb {
            committed_port: Some(1),
            ..Lnb::default()
        };
        let mut fe = Frontend::new("fe0", Box::new(mock)).with_lnb(lnb);
        fe.set_monitor_interval(None);

        assert_eq!(fe.tune(&satellite(), &fast_opts()).unwrap(), TuneResult::Locked);

        let log = log.lock();
        // 11.836 GHz is above the 11.7 GHz switch: high band, high LO.
        assert_eq!(log.tune_calls[0].frequency, 1_236_000);
        // Horizontal polarization selects 18V.
        assert_eq!(log.voltages, vec![LnbVoltage::V18]);
        // Tone off for the switch command, then on for the high band.
        assert_eq!(log.tones, vec![false, true]);
        // DiSEqC 1.0 committed port 1, horizontal, high band.
        assert_eq!(log.diseqc[0], vec![0xE0, 0x10, 0x38, 0xF7]);
    }

    #[test]
    fn system_mismatch_is_an_error() {
        let mock = MockFrontend::new(DeliverySystem::Terrestrial, TuneBehavior::LockImmediately);
        let mut fe = Frontend::new("fe0", Box::new(mock));
        fe.set_monitor_interval(None);
        assert!(matches!(
            fe.tune(&satellite(), &fast_opts()),
            Err(DvbError::TuneFailed(_))
        ));
    }

    #[test]
    fn release_joins_monitor_and_clears_state() {
        let mock = MockFrontend::new(DeliverySystem::Terrestrial, TuneBehavior::LockImmediately);
        let log = Arc::clone(&mock.log);
        let mut fe = Frontend::new("fe0", Box::new(mock));
        fe.set_monitor_interval(Some(Duration::from_millis(5)));

        fe.tune(&terrestrial(), &fast_opts()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fe.release();
        assert!(fe.tuned().is_none());
        // Terrestrial release must not touch the LNB supply.
        assert!(log.lock().voltages.is_empty());
    }
}
