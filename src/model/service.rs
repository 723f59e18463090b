//! Services and their elementary streams.

use std::collections::BTreeSet;

/// Sentinel for "this service announces no usable PCR PID".
pub const INVALID_PCR_PID: u16 = 0x1FFF;

/// DVB service types (EN 300 468 table 87), persisted as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    DigitalTelevision,
    DigitalRadioSound,
    Teletext,
    NvodReference,
    NvodTimeShifted,
    Mosaic,
    FmRadio,
    DvbSrm,
    AdvancedCodecDigitalRadioSound,
    AdvancedCodecMosaic,
    DataBroadcast,
    RcsMap,
    RcsFls,
    DvbMhp,
    Mpeg2HdDigitalTelevision,
    AdvancedCodecSdDigitalTelevision,
    AdvancedCodecSdNvodTimeShifted,
    AdvancedCodecSdNvodReference,
    AdvancedCodecHdDigitalTelevision,
    AdvancedCodecHdNvodTimeShifted,
    AdvancedCodecHdNvodReference,
    AdvancedCodecFrameCompatibleHdTelevision,
    AdvancedCodecFrameCompatibleHdNvodTimeShifted,
    AdvancedCodecFrameCompatibleHdNvodReference,
    Other(u8),
}

impl ServiceType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x01 => ServiceType::DigitalTelevision,
            0x02 => ServiceType::DigitalRadioSound,
            0x03 => ServiceType::Teletext,
            0x04 => ServiceType::NvodReference,
            0x05 => ServiceType::NvodTimeShifted,
            0x06 => ServiceType::Mosaic,
            0x07 => ServiceType::FmRadio,
            0x08 => ServiceType::DvbSrm,
            0x0A => ServiceType::AdvancedCodecDigitalRadioSound,
            0x0B => ServiceType::AdvancedCodecMosaic,
            0x0C => ServiceType::DataBroadcast,
            0x0E => ServiceType::RcsMap,
            0x0F => ServiceType::RcsFls,
            0x10 => ServiceType::DvbMhp,
            0x11 => ServiceType::Mpeg2HdDigitalTelevision,
            0x16 => ServiceType::AdvancedCodecSdDigitalTelevision,
            0x17 => ServiceType::AdvancedCodecSdNvodTimeShifted,
            0x18 => ServiceType::AdvancedCodecSdNvodReference,
            0x19 => ServiceType::AdvancedCodecHdDigitalTelevision,
            0x1A => ServiceType::AdvancedCodecHdNvodTimeShifted,
            0x1B => ServiceType::AdvancedCodecHdNvodReference,
            0x1C => ServiceType::AdvancedCodecFrameCompatibleHdTelevision,
            0x1D => ServiceType::AdvancedCodecFrameCompatibleHdNvodTimeShifted,
            0x1E => ServiceType::AdvancedCodecFrameCompatibleHdNvodReference,
            other => ServiceType::Other(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::DigitalTelevision => "digital-television",
            ServiceType::DigitalRadioSound => "digital-radio-sound",
            ServiceType::Teletext => "teletext",
            ServiceType::NvodReference => "nvod-reference",
            ServiceType::NvodTimeShifted => "nvod-time-shifted",
            ServiceType::Mosaic => "mosaic",
            ServiceType::FmRadio => "fm-radio",
            ServiceType::DvbSrm => "dvb-srm",
            ServiceType::AdvancedCodecDigitalRadioSound => "advanced-codec-digital-radio-sound",
            ServiceType::AdvancedCodecMosaic => "advanced-codec-mosaic",
            ServiceType::DataBroadcast => "data-broadcast",
            ServiceType::RcsMap => "rcs-map",
            ServiceType::RcsFls => "rcs-fls",
            ServiceType::DvbMhp => "dvb-mhp",
            ServiceType::Mpeg2HdDigitalTelevision => "mpeg2-hd-digital-television",
            ServiceType::AdvancedCodecSdDigitalTelevision => {
                "advanced-codec-sd-digital-television"
            }
            ServiceType::AdvancedCodecSdNvodTimeShifted => "advanced-codec-sd-nvod-time-shifted",
            ServiceType::AdvancedCodecSdNvodReference => "advanced-codec-sd-nvod-reference",
            ServiceType::AdvancedCodecHdDigitalTelevision => {
                "advanced-codec-hd-digital-television"
            }
            ServiceType::AdvancedCodecHdNvodTimeShifted => "advanced-codec-hd-nvod-time-shifted",
            ServiceType::AdvancedCodecHdNvodReference => "advanced-codec-hd-nvod-reference",
            ServiceType::AdvancedCodecFrameCompatibleHdTelevision => {
                "advanced-codec-frame-compatible-hd-television"
            }
            ServiceType::AdvancedCodecFrameCompatibleHdNvodTimeShifted => {
                "advanced-codec-frame-compatible-hd-nvod-time-shifted"
            }
            ServiceType::AdvancedCodecFrameCompatibleHdNvodReference => {
                "advanced-codec-frame-compatible-hd-nvod-reference"
            }
            ServiceType::Other(_) => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        // Table-driven reverse lookup over the known codes.
        for code in 0x01..=0x1E {
            let t = ServiceType::from_u8(code);
            if !matches!(t, ServiceType::Other(_)) && t.as_str() == s {
                return Some(t);
            }
        }
        if let Some(hex) = s.strip_prefix("other-0x") {
            return u8::from_str_radix(hex, 16).ok().map(ServiceType::Other);
        }
        None
    }

    /// The string persisted in the catalog; unknown codes keep their value
    /// as `other-0xNN`.
    pub fn persistent(&self) -> String {
        match self {
            ServiceType::Other(code) => format!("other-0x{code:02X}"),
            known => known.as_str().to_string(),
        }
    }

    /// Radio-only services.
    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            ServiceType::DigitalRadioSound
                | ServiceType::FmRadio
                | ServiceType::AdvancedCodecDigitalRadioSound
        )
    }

    /// Standard-definition television services.
    pub fn is_sd_video(&self) -> bool {
        matches!(
            self,
            ServiceType::DigitalTelevision
                | ServiceType::NvodReference
                | ServiceType::NvodTimeShifted
                | ServiceType::AdvancedCodecSdDigitalTelevision
                | ServiceType::AdvancedCodecSdNvodTimeShifted
                | ServiceType::AdvancedCodecSdNvodReference
        )
    }

    /// High-definition television services, 3D frame-compatible included.
    pub fn is_hd_video(&self) -> bool {
        matches!(
            self,
            ServiceType::Mpeg2HdDigitalTelevision
                | ServiceType::AdvancedCodecHdDigitalTelevision
                | ServiceType::AdvancedCodecHdNvodTimeShifted
                | ServiceType::AdvancedCodecHdNvodReference
                | ServiceType::AdvancedCodecFrameCompatibleHdTelevision
                | ServiceType::AdvancedCodecFrameCompatibleHdNvodTimeShifted
                | ServiceType::AdvancedCodecFrameCompatibleHdNvodReference
        )
    }
}

/// SDT running status (EN 300 468 table 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningStatus {
    Undefined,
    NotRunning,
    StartsShortly,
    Pausing,
    Running,
    OffAir,
}

impl RunningStatus {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => RunningStatus::NotRunning,
            2 => RunningStatus::StartsShortly,
            3 => RunningStatus::Pausing,
            4 => RunningStatus::Running,
            5 => RunningStatus::OffAir,
            _ => RunningStatus::Undefined,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunningStatus::Undefined => "undefined",
            RunningStatus::NotRunning => "not-running",
            RunningStatus::StartsShortly => "starts-shortly",
            RunningStatus::Pausing => "pausing",
            RunningStatus::Running => "running",
            RunningStatus::OffAir => "off-air",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "undefined" => Some(RunningStatus::Undefined),
            "not-running" => Some(RunningStatus::NotRunning),
            "starts-shortly" => Some(RunningStatus::StartsShortly),
            "pausing" => Some(RunningStatus::Pausing),
            "running" => Some(RunningStatus::Running),
            "off-air" => Some(RunningStatus::OffAir),
            _ => None,
        }
    }
}

/// One elementary stream inside a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementaryStream {
    pub pid: u16,
    /// Raw stream_type from the PMT (see `psi::pmt::stream_type`).
    pub stream_type: u8,
    /// ISO 639 language code from the ES descriptors, if announced.
    pub language: Option<String>,
    /// Raw ES info descriptor bytes, kept for downstream consumers.
    pub descriptors: Vec<u8>,
}

impl ElementaryStream {
    pub fn is_audio(&self) -> bool {
        crate::psi::pmt::stream_type::is_audio(self.stream_type)
    }

    pub fn is_video(&self) -> bool {
        crate::psi::pmt::stream_type::is_video(self.stream_type)
    }

    pub fn is_sd_video(&self) -> bool {
        crate::psi::pmt::stream_type::is_mpeg_video(self.stream_type)
    }

    pub fn is_hd_video(&self) -> bool {
        crate::psi::pmt::stream_type::is_advanced_video(self.stream_type)
    }
}

/// A logical program multiplexed on one transponder.
///
/// The PID set is kept closed over the PMT PID and every elementary-stream
/// PID; the PCR PID is included unless it is [`INVALID_PCR_PID`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub provider: String,
    pub sid: u16,
    pub pmt_pid: u16,
    pub pcr_pid: u16,
    pub service_type: ServiceType,
    pub status: RunningStatus,
    pub scrambled: bool,
    streams: Vec<ElementaryStream>,
    pids: BTreeSet<u16>,
}

impl Service {
    pub fn new(name: impl Into<String>, sid: u16, pmt_pid: u16) -> Self {
        let mut pids = BTreeSet::new();
        pids.insert(pmt_pid);
        Service {
            name: name.into(),
            provider: String::new(),
            sid,
            pmt_pid,
            pcr_pid: INVALID_PCR_PID,
            service_type: ServiceType::Other(0),
            status: RunningStatus::Undefined,
            scrambled: false,
            streams: Vec::new(),
            pids,
        }
    }

    pub fn add_stream(&mut self, stream: ElementaryStream) {
        self.pids.insert(stream.pid);
        self.streams.push(stream);
    }

    /// Records the PCR PID; the sentinel stays out of the PID set.
    pub fn set_pcr_pid(&mut self, pcr_pid: u16) {
        self.pcr_pid = pcr_pid;
        if pcr_pid != INVALID_PCR_PID {
            self.pids.insert(pcr_pid);
        }
    }

    pub fn streams(&self) -> &[ElementaryStream] {
        &self.streams
    }

    pub fn pids(&self) -> &BTreeSet<u16> {
        &self.pids
    }

    pub fn has_packet_identifier(&self, pid: u16) -> bool {
        self.pids.contains(&pid)
    }

    pub fn first_audio_stream(&self) -> Option<&ElementaryStream> {
        self.streams.iter().find(|s| s.is_audio())
    }

    pub fn first_video_stream(&self) -> Option<&ElementaryStream> {
        self.streams.iter().find(|s| s.is_video())
    }

    pub fn is_audio(&self) -> bool {
        self.service_type.is_audio()
    }

    pub fn is_sd_video(&self) -> bool {
        self.service_type.is_sd_video()
    }

    pub fn is_hd_video(&self) -> bool {
        self.service_type.is_hd_video()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::pmt::stream_type;

    fn video(pid: u16) -> ElementaryStream {
        ElementaryStream {
            pid,
            stream_type: stream_type::MPEG2_VIDEO,
            language: None,
            descriptors: Vec::new(),
        }
    }

    fn audio(pid: u16, lang: &str) -> ElementaryStream {
        ElementaryStream {
            pid,
            stream_type: stream_type::MPEG1_AUDIO,
            language: Some(lang.to_string()),
            descriptors: Vec::new(),
        }
    }

    #[test]
    fn pid_set_stays_closed() {
        let mut svc = Service::new("Channel-A", 101, 256);
        svc.add_stream(video(512));
        svc.add_stream(audio(513, "deu"));
        svc.set_pcr_pid(512);

        assert!(svc.has_packet_identifier(256));
        assert!(svc.has_packet_identifier(512));
        assert!(svc.has_packet_identifier(513));
        assert!(!svc.has_packet_identifier(514));

        // PID-set closure: {pmt_pid} ∪ stream pids ⊆ pids.
        assert!(svc.pids().contains(&svc.pmt_pid));
        for s in svc.streams() {
            assert!(svc.pids().contains(&s.pid));
        }
    }

    #[test]
    fn invalid_pcr_pid_is_not_cached() {
        let mut svc = Service::new("Radio-B", 202, 300);
        svc.set_pcr_pid(INVALID_PCR_PID);
        assert!(!svc.has_packet_identifier(INVALID_PCR_PID));
        assert_eq!(svc.pcr_pid, INVALID_PCR_PID);
    }

    #[test]
    fn stream_accessors() {
        let mut svc = Service::new("Channel-A", 101, 256);
        svc.add_stream(audio(513, "deu"));
        svc.add_stream(video(512));
        assert_eq!(svc.first_audio_stream().unwrap().pid, 513);
        assert_eq!(svc.first_video_stream().unwrap().pid, 512);
    }

    #[test]
    fn service_type_predicates() {
        assert!(ServiceType::DigitalRadioSound.is_audio());
        assert!(ServiceType::DigitalTelevision.is_sd_video());
        assert!(ServiceType::AdvancedCodecHdDigitalTelevision.is_hd_video());
        assert!(!ServiceType::Teletext.is_sd_video());
    }

    #[test]
    fn type_and_status_strings_round_trip() {
        for code in [0x01u8, 0x02, 0x03, 0x07, 0x11, 0x16, 0x19, 0x1C] {
            let t = ServiceType::from_u8(code);
            assert_eq!(ServiceType::from_str(t.as_str()), Some(t));
            assert_eq!(ServiceType::from_str(&t.persistent()), Some(t));
        }
        // Unknown codes keep their value through persistence.
        let exotic = ServiceType::Other(0x86);
        assert_eq!(exotic.persistent(), "other-0x86");
        assert_eq!(ServiceType::from_str(&exotic.persistent()), Some(exotic));
        for v in 0..=5u8 {
            let s = RunningStatus::from_u8(v);
            assert_eq!(RunningStatus::from_str(s.as_str()), Some(s));
        }
    }
}
