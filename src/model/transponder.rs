//! Tunable carriers and their delivery-system parameters.
//!
//! A [`Transponder`] is immutable after construction. Two transponders are
//! equal iff their identity matches: delivery system, frequency, and (for
//! satellite) polarization and orbital position. The remaining parameters
//! are tuning hints, not identity.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Frontend / delivery system classification, persisted as `T`, `S` or `C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliverySystem {
    Terrestrial,
    Satellite,
    Cable,
}

impl DeliverySystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliverySystem::Terrestrial => "T",
            DeliverySystem::Satellite => "S",
            DeliverySystem::Cable => "C",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "T" => Some(DeliverySystem::Terrestrial),
            "S" => Some(DeliverySystem::Satellite),
            "C" => Some(DeliverySystem::Cable),
            _ => None,
        }
    }
}

impl fmt::Display for DeliverySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constellation / modulation scheme, named after the kernel enum values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modulation {
    Qpsk,
    Qam16,
    Qam32,
    Qam64,
    Qam128,
    Qam256,
    Psk8,
    Auto,
}

impl Modulation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modulation::Qpsk => "QPSK",
            Modulation::Qam16 => "QAM_16",
            Modulation::Qam32 => "QAM_32",
            Modulation::Qam64 => "QAM_64",
            Modulation::Qam128 => "QAM_128",
            Modulation::Qam256 => "QAM_256",
            Modulation::Psk8 => "PSK_8",
            Modulation::Auto => "QAM_AUTO",
        }
    }

    /// Accepts both the kernel names (`QAM_64`) and the compact seed-file
    /// names (`QAM64`).
    pub fn from_str(s: &str) -> Option<Self> {
        match s.replace('_', "").to_ascii_uppercase().as_str() {
            "QPSK" => Some(Modulation::Qpsk),
            "QAM16" => Some(Modulation::Qam16),
            "QAM32" => Some(Modulation::Qam32),
            "QAM64" => Some(Modulation::Qam64),
            "QAM128" => Some(Modulation::Qam128),
            "QAM256" => Some(Modulation::Qam256),
            "PSK8" | "8PSK" => Some(Modulation::Psk8),
            "QAMAUTO" | "AUTO" => Some(Modulation::Auto),
            _ => None,
        }
    }
}

/// Inner forward-error-correction code rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FecRate {
    None,
    Fec1_2,
    Fec2_3,
    Fec3_4,
    Fec4_5,
    Fec5_6,
    Fec6_7,
    Fec7_8,
    Fec8_9,
    Auto,
}

impl FecRate {
    pub fn as_str(&self) -> &'static str {
        match self {
            FecRate::None => "FEC_NONE",
            FecRate::Fec1_2 => "FEC_1_2",
            FecRate::Fec2_3 => "FEC_2_3",
            FecRate::Fec3_4 => "FEC_3_4",
            FecRate::Fec4_5 => "FEC_4_5",
            FecRate::Fec5_6 => "FEC_5_6",
            FecRate::Fec6_7 => "FEC_6_7",
            FecRate::Fec7_8 => "FEC_7_8",
            FecRate::Fec8_9 => "FEC_8_9",
            FecRate::Auto => "FEC_AUTO",
        }
    }

    /// Accepts the kernel names (`FEC_2_3`), the seed-file fractions
    /// (`2/3`) and `NONE` / `AUTO`.
    pub fn from_str(s: &str) -> Option<Self> {
        let norm = s
            .trim_start_matches("FEC_")
            .replace('_', "/")
            .to_ascii_uppercase();
        match norm.as_str() {
            "NONE" => Some(FecRate::None),
            "1/2" => Some(FecRate::Fec1_2),
            "2/3" => Some(FecRate::Fec2_3),
            "3/4" => Some(FecRate::Fec3_4),
            "4/5" => Some(FecRate::Fec4_5),
            "5/6" => Some(FecRate::Fec5_6),
            "6/7" => Some(FecRate::Fec6_7),
            "7/8" => Some(FecRate::Fec7_8),
            "8/9" => Some(FecRate::Fec8_9),
            "AUTO" => Some(FecRate::Auto),
            _ => None,
        }
    }
}

/// Channel bandwidth for terrestrial transponders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bandwidth {
    Mhz5,
    Mhz6,
    Mhz7,
    Mhz8,
    Auto,
}

impl Bandwidth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bandwidth::Mhz5 => "BANDWIDTH_5_MHZ",
            Bandwidth::Mhz6 => "BANDWIDTH_6_MHZ",
            Bandwidth::Mhz7 => "BANDWIDTH_7_MHZ",
            Bandwidth::Mhz8 => "BANDWIDTH_8_MHZ",
            Bandwidth::Auto => "BANDWIDTH_AUTO",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s
            .trim_start_matches("BANDWIDTH_")
            .replace("_MHZ", "MHZ")
            .to_ascii_uppercase()
            .as_str()
        {
            "5MHZ" => Some(Bandwidth::Mhz5),
            "6MHZ" => Some(Bandwidth::Mhz6),
            "7MHZ" => Some(Bandwidth::Mhz7),
            "8MHZ" => Some(Bandwidth::Mhz8),
            "AUTO" => Some(Bandwidth::Auto),
            _ => None,
        }
    }

    /// Bandwidth in Hz as the kernel wants it; 0 means auto.
    pub fn hz(&self) -> u32 {
        match self {
            Bandwidth::Mhz5 => 5_000_000,
            Bandwidth::Mhz6 => 6_000_000,
            Bandwidth::Mhz7 => 7_000_000,
            Bandwidth::Mhz8 => 8_000_000,
            Bandwidth::Auto => 0,
        }
    }
}

/// Signal polarization of a satellite transponder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarization {
    Horizontal,
    Vertical,
    CircularLeft,
    CircularRight,
}

impl Polarization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Polarization::Horizontal => "h",
            Polarization::Vertical => "v",
            Polarization::CircularLeft => "l",
            Polarization::CircularRight => "r",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h" => Some(Polarization::Horizontal),
            "v" => Some(Polarization::Vertical),
            "l" => Some(Polarization::CircularLeft),
            "r" => Some(Polarization::CircularRight),
            _ => None,
        }
    }

    /// True for the polarizations selected with 18V LNB supply.
    pub fn is_high_voltage(&self) -> bool {
        matches!(self, Polarization::Horizontal | Polarization::CircularLeft)
    }
}

/// Delivery-system specific tuning parameters. Frequency is always Hz.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TuningParams {
    Terrestrial {
        frequency: u64,
        bandwidth: Bandwidth,
        modulation: Modulation,
        code_rate_hp: FecRate,
        code_rate_lp: FecRate,
    },
    Satellite {
        frequency: u64,
        polarization: Polarization,
        symbol_rate: u32,
        fec: FecRate,
        /// Orbital position such as `19.2E`; `None` for seed entries that
        /// predate the NIT scan.
        orbital: Option<String>,
    },
    Cable {
        frequency: u64,
        symbol_rate: u32,
        modulation: Modulation,
        fec: FecRate,
    },
}

impl TuningParams {
    pub fn system(&self) -> DeliverySystem {
        match self {
            TuningParams::Terrestrial { .. } => DeliverySystem::Terrestrial,
            TuningParams::Satellite { .. } => DeliverySystem::Satellite,
            TuningParams::Cable { .. } => DeliverySystem::Cable,
        }
    }

    pub fn frequency(&self) -> u64 {
        match self {
            TuningParams::Terrestrial { frequency, .. }
            | TuningParams::Satellite { frequency, .. }
            | TuningParams::Cable { frequency, .. } => *frequency,
        }
    }

    pub fn polarization(&self) -> Option<Polarization> {
        match self {
            TuningParams::Satellite { polarization, .. } => Some(*polarization),
            _ => None,
        }
    }

    pub fn orbital(&self) -> Option<&str> {
        match self {
            TuningParams::Satellite { orbital, .. } => orbital.as_deref(),
            _ => None,
        }
    }
}

/// A tunable carrier hosting one multiplex.
#[derive(Debug, Clone)]
pub struct Transponder {
    params: TuningParams,
}

impl Transponder {
    pub fn new(params: TuningParams) -> Self {
        Transponder { params }
    }

    pub fn params(&self) -> &TuningParams {
        &self.params
    }

    pub fn system(&self) -> DeliverySystem {
        self.params.system()
    }

    pub fn frequency(&self) -> u64 {
        self.params.frequency()
    }

    pub fn polarization(&self) -> Option<Polarization> {
        self.params.polarization()
    }

    pub fn orbital(&self) -> Option<&str> {
        self.params.orbital()
    }
}

impl fmt::Display for Transponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.polarization() {
            Some(p) => write!(f, "{}/{}Hz/{}", self.system(), self.frequency(), p.as_str()),
            None => write!(f, "{}/{}Hz", self.system(), self.frequency()),
        }
    }
}

// Identity: (system, frequency, polarization, orbital position).
impl PartialEq for Transponder {
    fn eq(&self, other: &Self) -> bool {
        self.system() == other.system()
            && self.frequency() == other.frequency()
            && self.polarization() == other.polarization()
            && self.orbital() == other.orbital()
    }
}

impl Eq for Transponder {}

impl Hash for Transponder {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.system().hash(state);
        self.frequency().hash(state);
        self.polarization().hash(state);
        self.orbital().hash(state);
    }
}
