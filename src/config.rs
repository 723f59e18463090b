//! TOML configuration file and seed transponder parsing.
//!
//! Seed transponders use the classic initial-tuning line format:
//!
//! ```text
//! # terrestrial: freq(Hz) bandwidth fec_hi fec_lo modulation ...
//! T 506000000 8MHz 2/3 NONE QAM64 8k 1/4 NONE
//! # satellite: freq(kHz) polarization symbol_rate(sym/s) fec
//! S 11836000 h 27500000 3/4
//! # cable: freq(Hz) symbol_rate(sym/s) fec modulation
//! C 346000000 6900000 NONE QAM256
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::device::DeviceConfig;
use crate::error::{DvbError, Result};
use crate::frontend::TuneOptions;
use crate::model::transponder::{
    Bandwidth, DeliverySystem, FecRate, Modulation, Polarization, Transponder, TuningParams,
};
use crate::remux::RemuxConfig;
use crate::scan::ScanOptions;

/// On-disk configuration, merged over the built-in defaults.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub scan: ScanSection,
    #[serde(default)]
    pub remux: RemuxSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceSection {
    pub unscrambled_only: Option<bool>,
    pub max_adapters: Option<u32>,
    pub tune_timeout_ms: Option<u64>,
    pub tune_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanSection {
    pub section_timeout_ms: Option<u64>,
    /// Seed transponder lines per frontend type.
    #[serde(default)]
    pub terrestrial: Vec<String>,
    #[serde(default)]
    pub satellite: Vec<String>,
    #[serde(default)]
    pub cable: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemuxSection {
    pub queue_capacity: Option<usize>,
    pub enqueue_timeout_ms: Option<u64>,
    pub pat_interval: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

impl ConfigFile {
    /// Builds the runtime configuration, file values over defaults.
    pub fn device_config(&self) -> DeviceConfig {
        let mut config = DeviceConfig::default();
        if let Some(v) = self.device.unscrambled_only {
            config.unscrambled_only = v;
        }
        if let Some(v) = self.device.max_adapters {
            config.max_adapters = v;
        }
        let mut tune = TuneOptions::default();
        if let Some(ms) = self.device.tune_timeout_ms {
            tune.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.device.tune_retries {
            tune.retries = n;
        }
        config.tune = tune.clone();

        let mut scan = ScanOptions::default();
        if let Some(ms) = self.scan.section_timeout_ms {
            scan.section_timeout = Duration::from_millis(ms);
        }
        scan.tune = tune;
        config.scan = scan;

        let mut remux = RemuxConfig::default();
        if let Some(v) = self.remux.queue_capacity {
            remux.queue_capacity = v;
        }
        if let Some(ms) = self.remux.enqueue_timeout_ms {
            remux.enqueue_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = self.remux.pat_interval {
            remux.pat_interval = v;
        }
        config.remux = remux;
        config
    }

    /// The seed lines configured for one frontend type.
    pub fn seed_lines(&self, system: DeliverySystem) -> &[String] {
        match system {
            DeliverySystem::Terrestrial => &self.scan.terrestrial,
            DeliverySystem::Satellite => &self.scan.satellite,
            DeliverySystem::Cable => &self.scan.cable,
        }
    }
}

/// Loads and parses the configuration file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str(&contents)
        .map_err(|e| DvbError::CatalogParse(format!("{}: {e}", path.display())))
}

/// Parses a blob of initial-tuning lines for one frontend type. Empty
/// lines and `#` comments are skipped; every other line must carry the
/// matching type tag.
pub fn parse_initial_transponders(
    system: DeliverySystem,
    blob: &str,
) -> Result<Vec<Transponder>> {
    let mut transponders = Vec::new();
    for line in blob.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        transponders.push(parse_seed_line(system, line)?);
    }
    Ok(transponders)
}

fn parse_seed_line(system: DeliverySystem, line: &str) -> Result<Transponder> {
    let bad = |what: &str| DvbError::CatalogParse(format!("seed line \"{line}\": {what}"));
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.is_empty() {
        return Err(bad("empty"));
    }
    if fields[0] != system.as_str() {
        return Err(bad("type tag does not match the frontend type"));
    }

    let number = |i: usize, what: &str| -> Result<u64> {
        fields
            .get(i)
            .ok_or_else(|| bad(what))?
            .parse()
            .map_err(|_| bad(what))
    };

    let params = match system {
        DeliverySystem::Terrestrial => {
            if fields.len() < 6 {
                return Err(bad("expected: T freq bandwidth fec_hi fec_lo modulation"));
            }
            TuningParams::Terrestrial {
                frequency: number(1, "bad frequency")?,
                bandwidth: Bandwidth::from_str(fields[2]).ok_or_else(|| bad("bad bandwidth"))?,
                code_rate_hp: FecRate::from_str(fields[3]).ok_or_else(|| bad("bad fec_hi"))?,
                code_rate_lp: FecRate::from_str(fields[4]).ok_or_else(|| bad("bad fec_lo"))?,
                modulation: Modulation::from_str(fields[5])
                    .ok_or_else(|| bad("bad modulation"))?,
            }
        }
        DeliverySystem::Satellite => {
            if fields.len() < 5 {
                return Err(bad("expected: S freq polarization symbol_rate fec"));
            }
            TuningParams::Satellite {
                frequency: number(1, "bad frequency")? * 1000, // kHz in seed files
                polarization: Polarization::from_str(fields[2])
                    .ok_or_else(|| bad("bad polarization"))?,
                symbol_rate: number(3, "bad symbol rate")? as u32,
                fec: FecRate::from_str(fields[4]).ok_or_else(|| bad("bad fec"))?,
                orbital: None,
            }
        }
        DeliverySystem::Cable => {
            if fields.len() < 5 {
                return Err(bad("expected: C freq symbol_rate fec modulation"));
            }
            TuningParams::Cable {
                frequency: number(1, "bad frequency")?,
                symbol_rate: number(2, "bad symbol rate")? as u32,
                fec: FecRate::from_str(fields[3]).ok_or_else(|| bad("bad fec"))?,
                modulation: Modulation::from_str(fields[4])
                    .ok_or_else(|| bad("bad modulation"))?,
            }
        }
    };
    Ok(Transponder::new(params))
}
