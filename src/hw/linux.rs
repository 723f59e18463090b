//! Linux DVB API (v5) implementation of the hardware traits.
//!
//! Device nodes live under `/dev/dvb/adapterN/`. Tuning goes through
//! `FE_SET_PROPERTY`, filters through the demux device, and the full TS
//! through the dvr device opened non-blocking.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{DvbError, Result};
use crate::hw::{
    DemuxIo, FrontendIo, FrontendStatus, LnbVoltage, SectionRead, SignalStats, TuneCommand,
};
use crate::model::transponder::{DeliverySystem, FecRate, Modulation};

// DVB v5 property command ids.
const DTV_TUNE: u32 = 1;
const DTV_CLEAR: u32 = 2;
const DTV_FREQUENCY: u32 = 3;
const DTV_MODULATION: u32 = 4;
const DTV_BANDWIDTH_HZ: u32 = 5;
const DTV_INVERSION: u32 = 6;
const DTV_SYMBOL_RATE: u32 = 8;
const DTV_INNER_FEC: u32 = 9;
const DTV_DELIVERY_SYSTEM: u32 = 17;
const DTV_CODE_RATE_HP: u32 = 36;
const DTV_CODE_RATE_LP: u32 = 37;

// Delivery systems.
const SYS_DVBC_ANNEX_A: u32 = 1;
const SYS_DVBT: u32 = 3;
const SYS_DVBS: u32 = 5;

const INVERSION_AUTO: u32 = 2;

// Frontend status flags.
const FE_HAS_SIGNAL: u32 = 0x01;
const FE_HAS_CARRIER: u32 = 0x02;
const FE_HAS_LOCK: u32 = 0x10;

// SEC control values.
const SEC_VOLTAGE_13: u64 = 0;
const SEC_VOLTAGE_18: u64 = 1;
const SEC_VOLTAGE_OFF: u64 = 2;
const SEC_TONE_ON: u64 = 0;
const SEC_TONE_OFF: u64 = 1;

// Demux constants.
const DMX_FILTER_SIZE: usize = 16;
const DMX_IN_FRONTEND: u32 = 0;
const DMX_OUT_TS_TAP: u32 = 2;
const DMX_PES_OTHER: u32 = 20;
const DMX_IMMEDIATE_START: u32 = 4;

// Kernel struct: dtv_property (76 bytes, packed).
#[repr(C, packed)]
struct DtvProperty {
    cmd: u32,
    reserved: [u32; 3],
    data: u32,
    _padding: [u8; 52], // remaining union space
    result: i32,
}

impl DtvProperty {
    fn new(cmd: u32, data: u32) -> Self {
        DtvProperty {
            cmd,
            reserved: [0; 3],
            data,
            _padding: [0; 52],
            result: 0,
        }
    }
}

#[repr(C)]
struct DtvProperties {
    num: u32,
    props: *mut DtvProperty,
}

#[repr(C)]
struct DvbFrontendInfo {
    name: [u8; 128],
    fe_type: u32,
    frequency_min: u32,
    frequency_max: u32,
    frequency_stepsize: u32,
    frequency_tolerance: u32,
    symbol_rate_min: u32,
    symbol_rate_max: u32,
    symbol_rate_tolerance: u32,
    notifier_delay: u32,
    caps: u32,
}

#[repr(C)]
struct DiseqcMasterCmd {
    msg: [u8; 6],
    msg_len: u8,
}

#[repr(C)]
struct DmxFilter {
    filter: [u8; DMX_FILTER_SIZE],
    mask: [u8; DMX_FILTER_SIZE],
    mode: [u8; DMX_FILTER_SIZE],
}

#[repr(C)]
struct DmxSctFilterParams {
    pid: u16,
    filter: DmxFilter,
    timeout: u32,
    flags: u32,
}

#[repr(C)]
struct DmxPesFilterParams {
    pid: u16,
    input: u32,
    output: u32,
    pes_type: u32,
    flags: u32,
}

nix::ioctl_read!(fe_get_info, b'o', 61, DvbFrontendInfo);
nix::ioctl_write_ptr!(fe_diseqc_send_master_cmd, b'o', 63, DiseqcMasterCmd);
nix::ioctl_write_int!(fe_set_tone, b'o', 66);
nix::ioctl_write_int!(fe_set_voltage, b'o', 67);
nix::ioctl_read!(fe_read_status, b'o', 69, u32);
nix::ioctl_read!(fe_read_ber, b'o', 70, u32);
nix::ioctl_read!(fe_read_signal_strength, b'o', 71, u16);
nix::ioctl_read!(fe_read_snr, b'o', 72, u16);
nix::ioctl_write_ptr!(fe_set_property, b'o', 82, DtvProperties);
nix::ioctl_write_ptr!(dmx_set_filter, b'o', 43, DmxSctFilterParams);
nix::ioctl_write_ptr!(dmx_set_pes_filter, b'o', 44, DmxPesFilterParams);

fn ioerr(e: nix::errno::Errno) -> DvbError {
    DvbError::Io(std::io::Error::from_raw_os_error(e as i32))
}

fn open_nonblocking(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
        .open(path)
        .map_err(|e| DvbError::HardwareUnavailable(format!("{}: {e}", path.display())))
}

fn modulation_value(m: Modulation) -> u32 {
    match m {
        Modulation::Qpsk => 0,
        Modulation::Qam16 => 1,
        Modulation::Qam32 => 2,
        Modulation::Qam64 => 3,
        Modulation::Qam128 => 4,
        Modulation::Qam256 => 5,
        Modulation::Auto => 6,
        Modulation::Psk8 => 9,
    }
}

fn fec_value(f: FecRate) -> u32 {
    match f {
        FecRate::None => 0,
        FecRate::Fec1_2 => 1,
        FecRate::Fec2_3 => 2,
        FecRate::Fec3_4 => 3,
        FecRate::Fec4_5 => 4,
        FecRate::Fec5_6 => 5,
        FecRate::Fec6_7 => 6,
        FecRate::Fec7_8 => 7,
        FecRate::Fec8_9 => 8,
        FecRate::Auto => 9,
    }
}

/// One `/dev/dvb/adapterN/frontendM` device.
pub struct LinuxFrontend {
    file: File,
    system: DeliverySystem,
    path: PathBuf,
}

impl LinuxFrontend {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DvbError::HardwareUnavailable(format!("{}: {e}", path.display())))?;
        let mut info = unsafe { std::mem::zeroed::<DvbFrontendInfo>() };
        unsafe { fe_get_info(file.as_raw_fd(), &mut info) }.map_err(ioerr)?;
        let system = match info.fe_type {
            0 => DeliverySystem::Satellite,
            1 => DeliverySystem::Cable,
            2 => DeliverySystem::Terrestrial,
            other => {
                return Err(DvbError::HardwareUnavailable(format!(
                    "unsupported frontend type {other} on {}",
                    path.display()
                )))
            }
        };
        let name_len = info.name.iter().position(|&b| b == 0).unwrap_or(0);
        info!(
            "frontend {}: {} ({})",
            path.display(),
            String::from_utf8_lossy(&info.name[..name_len]),
            system
        );
        Ok(LinuxFrontend {
            file,
            system,
            path: path.to_path_buf(),
        })
    }

    /// The frontend's reported hardware name, used as the adapter id.
    pub fn hardware_name(&self) -> Result<String> {
        let mut info = unsafe { std::mem::zeroed::<DvbFrontendInfo>() };
        unsafe { fe_get_info(self.file.as_raw_fd(), &mut info) }.map_err(ioerr)?;
        let name_len = info.name.iter().position(|&b| b == 0).unwrap_or(0);
        Ok(String::from_utf8_lossy(&info.name[..name_len]).into_owned())
    }

    fn set_properties(&mut self, props: &mut [DtvProperty]) -> Result<()> {
        let mut wrapper = DtvProperties {
            num: props.len() as u32,
            props: props.as_mut_ptr(),
        };
        unsafe { fe_set_property(self.file.as_raw_fd(), &mut wrapper) }.map_err(ioerr)?;
        Ok(())
    }
}

impl FrontendIo for LinuxFrontend {
    fn system(&self) -> DeliverySystem {
        self.system
    }

    fn tune(&mut self, cmd: &TuneCommand) -> Result<()> {
        self.set_properties(&mut [DtvProperty::new(DTV_CLEAR, 0)])?;
        let mut props = match cmd.system {
            DeliverySystem::Terrestrial => vec![
                DtvProperty::new(DTV_DELIVERY_SYSTEM, SYS_DVBT),
                DtvProperty::new(DTV_FREQUENCY, cmd.frequency),
                DtvProperty::new(DTV_BANDWIDTH_HZ, cmd.bandwidth_hz),
                DtvProperty::new(DTV_MODULATION, modulation_value(cmd.modulation)),
                DtvProperty::new(DTV_CODE_RATE_HP, fec_value(cmd.fec)),
                DtvProperty::new(DTV_CODE_RATE_LP, fec_value(cmd.fec_lp)),
                DtvProperty::new(DTV_INVERSION, INVERSION_AUTO),
            ],
            DeliverySystem::Satellite => vec![
                DtvProperty::new(DTV_DELIVERY_SYSTEM, SYS_DVBS),
                DtvProperty::new(DTV_FREQUENCY, cmd.frequency),
                DtvProperty::new(DTV_SYMBOL_RATE, cmd.symbol_rate),
                DtvProperty::new(DTV_INNER_FEC, fec_value(cmd.fec)),
                DtvProperty::new(DTV_INVERSION, INVERSION_AUTO),
            ],
            DeliverySystem::Cable => vec![
                DtvProperty::new(DTV_DELIVERY_SYSTEM, SYS_DVBC_ANNEX_A),
                DtvProperty::new(DTV_FREQUENCY, cmd.frequency),
                DtvProperty::new(DTV_SYMBOL_RATE, cmd.symbol_rate),
                DtvProperty::new(DTV_MODULATION, modulation_value(cmd.modulation)),
                DtvProperty::new(DTV_INNER_FEC, fec_value(cmd.fec)),
                DtvProperty::new(DTV_INVERSION, INVERSION_AUTO),
            ],
        };
        props.push(DtvProperty::new(DTV_TUNE, 0));
        debug!("tuning {} to {} Hz", self.path.display(), cmd.frequency);
        self.set_properties(&mut props)
    }

    fn status(&mut self) -> Result<FrontendStatus> {
        let mut status: u32 = 0;
        unsafe { fe_read_status(self.file.as_raw_fd(), &mut status) }.map_err(ioerr)?;
        Ok(FrontendStatus {
            has_signal: status & FE_HAS_SIGNAL != 0,
            has_carrier: status & FE_HAS_CARRIER != 0,
            has_lock: status & FE_HAS_LOCK != 0,
        })
    }

    fn signal_stats(&mut self) -> Result<SignalStats> {
        let fd = self.file.as_raw_fd();
        let mut signal_strength: u16 = 0;
        let mut snr: u16 = 0;
        let mut ber: u32 = 0;
        // Not all drivers implement all three readouts; missing ones stay 0.
        let _ = unsafe { fe_read_signal_strength(fd, &mut signal_strength) };
        let _ = unsafe { fe_read_snr(fd, &mut snr) };
        let _ = unsafe { fe_read_ber(fd, &mut ber) };
        Ok(SignalStats {
            signal_strength,
            snr,
            ber,
        })
    }

    fn set_voltage(&mut self, voltage: LnbVoltage) -> Result<()> {
        let value = match voltage {
            LnbVoltage::V13 => SEC_VOLTAGE_13,
            LnbVoltage::V18 => SEC_VOLTAGE_18,
            LnbVoltage::Off => SEC_VOLTAGE_OFF,
        };
        unsafe { fe_set_voltage(self.file.as_raw_fd(), value as _) }.map_err(ioerr)?;
        Ok(())
    }

    fn set_tone(&mut self, on: bool) -> Result<()> {
        let value = if on { SEC_TONE_ON } else { SEC_TONE_OFF };
        unsafe { fe_set_tone(self.file.as_raw_fd(), value as _) }.map_err(ioerr)?;
        Ok(())
    }

    fn send_diseqc(&mut self, msg: &[u8]) -> Result<()> {
        if msg.len() > 6 {
            return Err(DvbError::TuneFailed("DiSEqC message too long".into()));
        }
        let mut cmd = DiseqcMasterCmd {
            msg: [0; 6],
            msg_len: msg.len() as u8,
        };
        cmd.msg[..msg.len()].copy_from_slice(msg);
        unsafe { fe_diseqc_send_master_cmd(self.file.as_raw_fd(), &cmd) }.map_err(ioerr)?;
        Ok(())
    }
}

/// Section filter reading whole sections from the demux device.
struct LinuxSectionFilter {
    file: File,
}

impl SectionRead for LinuxSectionFilter {
    fn read_section(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; 4096];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(buf));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// DVR handle; translates EAGAIN into a zero-byte read so callers can back
/// off without treating it as end of stream.
struct NonBlockingDvr {
    file: File,
}

impl Read for NonBlockingDvr {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// The demux/dvr pair of one adapter.
pub struct LinuxDemux {
    demux_path: PathBuf,
    dvr_path: PathBuf,
    pid_filters: HashMap<u16, File>,
}

impl LinuxDemux {
    pub fn new(adapter_path: &Path) -> Self {
        LinuxDemux {
            demux_path: adapter_path.join("demux0"),
            dvr_path: adapter_path.join("dvr0"),
            pid_filters: HashMap::new(),
        }
    }
}

impl DemuxIo for LinuxDemux {
    fn open_section_filter(
        &mut self,
        pid: u16,
        table_id: u8,
        table_id_mask: u8,
    ) -> Result<Box<dyn SectionRead>> {
        let file = open_nonblocking(&self.demux_path)
            .map_err(|e| DvbError::FilterOpenFailed(e.to_string()))?;
        let mut params = DmxSctFilterParams {
            pid,
            filter: DmxFilter {
                filter: [0; DMX_FILTER_SIZE],
                mask: [0; DMX_FILTER_SIZE],
                mode: [0; DMX_FILTER_SIZE],
            },
            timeout: 0,
            flags: DMX_IMMEDIATE_START,
        };
        params.filter.filter[0] = table_id;
        params.filter.mask[0] = table_id_mask;
        unsafe { dmx_set_filter(file.as_raw_fd(), &params) }
            .map_err(|e| DvbError::FilterOpenFailed(format!("DMX_SET_FILTER: {e}")))?;
        Ok(Box::new(LinuxSectionFilter { file }))
    }

    fn add_pid(&mut self, pid: u16) -> Result<()> {
        if self.pid_filters.contains_key(&pid) {
            return Ok(());
        }
        let file = open_nonblocking(&self.demux_path)
            .map_err(|e| DvbError::FilterOpenFailed(e.to_string()))?;
        let params = DmxPesFilterParams {
            pid,
            input: DMX_IN_FRONTEND,
            output: DMX_OUT_TS_TAP,
            pes_type: DMX_PES_OTHER,
            flags: DMX_IMMEDIATE_START,
        };
        unsafe { dmx_set_pes_filter(file.as_raw_fd(), &params) }
            .map_err(|e| DvbError::FilterOpenFailed(format!("DMX_SET_PES_FILTER: {e}")))?;
        self.pid_filters.insert(pid, file);
        Ok(())
    }

    fn remove_pid(&mut self, pid: u16) {
        // Dropping the filter fd tears the whitelist entry down.
        self.pid_filters.remove(&pid);
    }

    fn open_dvr(&mut self) -> Result<Box<dyn Read + Send>> {
        let file = open_nonblocking(&self.dvr_path)?;
        Ok(Box::new(NonBlockingDvr { file }))
    }
}

/// Probes `/dev/dvb/adapterN`, returning its frontends and demux, or
/// `None` when the adapter does not exist.
pub fn probe_adapter(num: u32) -> Result<Option<(String, Vec<LinuxFrontend>, LinuxDemux)>> {
    let adapter_path = PathBuf::from(format!("/dev/dvb/adapter{num}"));
    if !adapter_path.exists() {
        return Ok(None);
    }
    let mut frontends = Vec::new();
    for m in 0.. {
        let fe_path = adapter_path.join(format!("frontend{m}"));
        if !fe_path.exists() {
            break;
        }
        match LinuxFrontend::open(&fe_path) {
            Ok(fe) => frontends.push(fe),
            Err(e) => warn!("skipping {}: {e}", fe_path.display()),
        }
    }
    if frontends.is_empty() {
        return Ok(None);
    }
    let id = frontends[0]
        .hardware_name()
        .unwrap_or_else(|_| format!("adapter{num}"));
    Ok(Some((id, frontends, LinuxDemux::new(&adapter_path))))
}
