//! NIT (Network Information Table) parsing.
//!
//! The transport-stream loop carries delivery-system descriptors from which
//! the scanner constructs new transponders to visit.

use log::debug;

use crate::error::DvbError;
use crate::model::transponder::{
    Bandwidth, FecRate, Modulation, Polarization, TuningParams,
};
use crate::psi::section::Section;
use crate::psi::{decode_dvb_string, descriptor_tag, table_id};

/// One transport stream announced by the NIT.
#[derive(Debug, Clone)]
pub struct NitTransport {
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    /// Tuning parameters from the first delivery-system descriptor; later
    /// duplicates in the same loop are ignored.
    pub tuning: Option<TuningParams>,
}

/// Parsed Network Information Table.
#[derive(Debug, Clone, Default)]
pub struct NitTable {
    pub network_id: u16,
    pub version_number: u8,
    pub network_name: Option<String>,
    pub transports: Vec<NitTransport>,
}

impl NitTable {
    /// Parses a NIT from a validated section.
    pub fn parse(section: &Section) -> Result<Self, DvbError> {
        if section.header.table_id != table_id::NIT_ACTUAL
            && section.header.table_id != table_id::NIT_OTHER
        {
            return Err(DvbError::SectionParse("not a NIT section"));
        }
        let data = &section.payload;
        if data.len() < 4 {
            return Err(DvbError::SectionParse("NIT too short"));
        }

        let mut nit = NitTable {
            network_id: section.header.table_id_extension,
            version_number: section.header.version_number,
            network_name: None,
            transports: Vec::new(),
        };

        let network_desc_length = (usize::from(data[0] & 0x0F) << 8) | usize::from(data[1]);
        if 2 + network_desc_length + 2 > data.len() {
            return Err(DvbError::SectionParse("NIT descriptor overflow"));
        }
        nit.network_name = parse_network_name(&data[2..2 + network_desc_length]);

        let loop_start = 2 + network_desc_length + 2;
        let mut offset = loop_start;
        while offset + 6 <= data.len() {
            let transport_stream_id = u16::from(data[offset]) << 8 | u16::from(data[offset + 1]);
            let original_network_id =
                u16::from(data[offset + 2]) << 8 | u16::from(data[offset + 3]);
            let desc_length =
                (usize::from(data[offset + 4] & 0x0F) << 8) | usize::from(data[offset + 5]);
            offset += 6;
            if offset + desc_length > data.len() {
                break;
            }
            let tuning = parse_delivery_descriptors(&data[offset..offset + desc_length]);
            offset += desc_length;

            nit.transports.push(NitTransport {
                transport_stream_id,
                original_network_id,
                tuning,
            });
        }
        Ok(nit)
    }
}

fn parse_network_name(data: &[u8]) -> Option<String> {
    let mut offset = 0;
    while offset + 2 <= data.len() {
        let tag = data[offset];
        let length = data[offset + 1] as usize;
        if offset + 2 + length > data.len() {
            return None;
        }
        if tag == descriptor_tag::NETWORK_NAME && length > 0 {
            return Some(decode_dvb_string(&data[offset + 2..offset + 2 + length]));
        }
        offset += 2 + length;
    }
    None
}

/// Walks a descriptor loop; the first delivery-system descriptor wins.
fn parse_delivery_descriptors(data: &[u8]) -> Option<TuningParams> {
    let mut offset = 0;
    while offset + 2 <= data.len() {
        let tag = data[offset];
        let length = data[offset + 1] as usize;
        if offset + 2 + length > data.len() {
            return None;
        }
        let body = &data[offset + 2..offset + 2 + length];
        let parsed = match tag {
            descriptor_tag::TERRESTRIAL_DELIVERY => parse_terrestrial(body),
            descriptor_tag::SATELLITE_DELIVERY => parse_satellite(body),
            descriptor_tag::CABLE_DELIVERY => parse_cable(body),
            _ => None,
        };
        if let Some(params) = parsed {
            return Some(params);
        }
        offset += 2 + length;
    }
    None
}

fn parse_terrestrial(d: &[u8]) -> Option<TuningParams> {
    if d.len() < 7 {
        debug!("terrestrial delivery descriptor too short");
        return None;
    }
    let centre = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
    let bandwidth = match d[4] >> 5 {
        0 => Bandwidth::Mhz8,
        1 => Bandwidth::Mhz7,
        2 => Bandwidth::Mhz6,
        3 => Bandwidth::Mhz5,
        _ => Bandwidth::Auto,
    };
    let modulation = match d[5] >> 6 {
        0 => Modulation::Qpsk,
        1 => Modulation::Qam16,
        2 => Modulation::Qam64,
        _ => Modulation::Auto,
    };
    let code_rate_hp = terrestrial_code_rate(d[5] & 0x07);
    let code_rate_lp = terrestrial_code_rate(d[6] >> 5);
    Some(TuningParams::Terrestrial {
        frequency: u64::from(centre) * 10,
        bandwidth,
        modulation,
        code_rate_hp,
        code_rate_lp,
    })
}

fn terrestrial_code_rate(v: u8) -> FecRate {
    match v {
        0 => FecRate::Fec1_2,
        1 => FecRate::Fec2_3,
        2 => FecRate::Fec3_4,
        3 => FecRate::Fec5_6,
        4 => FecRate::Fec7_8,
        _ => FecRate::Auto,
    }
}

fn parse_satellite(d: &[u8]) -> Option<TuningParams> {
    if d.len() < 11 {
        debug!("satellite delivery descriptor too short");
        return None;
    }
    // Frequency: 8 BCD digits in 10 kHz units.
    let frequency = bcd(&d[0..4]) * 10_000;
    // Orbital position: 4 BCD digits in 0.1 degree units.
    let position = bcd(&d[4..6]);
    let east = d[6] & 0x80 != 0;
    let orbital = format!(
        "{}.{}{}",
        position / 10,
        position % 10,
        if east { 'E' } else { 'W' }
    );
    let polarization = match (d[6] >> 5) & 0x03 {
        0 => Polarization::Horizontal,
        1 => Polarization::Vertical,
        2 => Polarization::CircularLeft,
        _ => Polarization::CircularRight,
    };
    // Symbol rate: 7 BCD digits in 100 sym/s units; last nibble is FEC.
    let symbol_rate = (bcd(&d[7..11]) / 10) * 100;
    let fec = match d[10] & 0x0F {
        1 => FecRate::Fec1_2,
        2 => FecRate::Fec2_3,
        3 => FecRate::Fec3_4,
        4 => FecRate::Fec5_6,
        5 => FecRate::Fec7_8,
        6 => FecRate::Fec8_9,
        8 => FecRate::Fec4_5,
        15 => FecRate::None,
        _ => FecRate::Auto,
    };
    Some(TuningParams::Satellite {
        frequency,
        polarization,
        symbol_rate: symbol_rate as u32,
        fec,
        orbital: Some(orbital),
    })
}

fn parse_cable(d: &[u8]) -> Option<TuningParams> {
    if d.len() < 11 {
        debug!("cable delivery descriptor too short");
        return None;
    }
    // Frequency: 8 BCD digits in 100 Hz units.
    let frequency = bcd(&d[0..4]) * 100;
    let modulation = match d[6] {
        1 => Modulation::Qam16,
        2 => Modulation::Qam32,
        3 => Modulation::Qam64,
        4 => Modulation::Qam128,
        5 => Modulation::Qam256,
        _ => Modulation::Auto,
    };
    let symbol_rate = (bcd(&d[7..11]) / 10) * 100;
    let fec = match d[10] & 0x0F {
        1 => FecRate::Fec1_2,
        2 => FecRate::Fec2_3,
        3 => FecRate::Fec3_4,
        4 => FecRate::Fec5_6,
        5 => FecRate::Fec7_8,
        6 => FecRate::Fec8_9,
        15 => FecRate::None,
        _ => FecRate::Auto,
    };
    Some(TuningParams::Cable {
        frequency,
        symbol_rate: symbol_rate as u32,
        modulation,
        fec,
    })
}

/// Folds packed BCD digits into a number.
fn bcd(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |acc, &b| {
        acc * 100 + u64::from(b >> 4) * 10 + u64::from(b & 0x0F)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::section::test_util::build_section;

    fn descriptor(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut d = vec![tag, body.len() as u8];
        d.extend_from_slice(body);
        d
    }

    fn build_nit(network_descriptors: &[u8], transports: &[(u16, u16, Vec<u8>)]) -> NitTable {
        let mut payload = vec![
            0xF0 | ((network_descriptors.len() >> 8) as u8 & 0x0F),
            network_descriptors.len() as u8,
        ];
        payload.extend_from_slice(network_descriptors);
        let mut loop_bytes = Vec::new();
        for (tsid, onid, descs) in transports {
            loop_bytes.push((tsid >> 8) as u8);
            loop_bytes.push(*tsid as u8);
            loop_bytes.push((onid >> 8) as u8);
            loop_bytes.push(*onid as u8);
            loop_bytes.push(0xF0 | ((descs.len() >> 8) as u8 & 0x0F));
            loop_bytes.push(descs.len() as u8);
            loop_bytes.extend_from_slice(descs);
        }
        payload.push(0xF0 | ((loop_bytes.len() >> 8) as u8 & 0x0F));
        payload.push(loop_bytes.len() as u8);
        payload.extend_from_slice(&loop_bytes);

        let raw = build_section(table_id::NIT_ACTUAL, 0x3001, 0, &payload);
        NitTable::parse(&Section::parse(&raw).unwrap()).unwrap()
    }

    #[test]
    fn parse_network_name_and_terrestrial_transport() {
        // 506 MHz = 50_600_000 * 10 Hz; 8 MHz; QAM64; HP 2/3; LP 1/2.
        let freq = 50_600_000u32.to_be_bytes();
        let terrestrial = [
            freq[0], freq[1], freq[2], freq[3],
            0x00,                 // 8 MHz
            (2 << 6) | 0x01,      // QAM64, HP 2/3
            0x00,                 // LP 1/2
        ];
        let nit = build_nit(
            &descriptor(descriptor_tag::NETWORK_NAME, b"TestNet"),
            &[(0x1001, 0x2001, descriptor(descriptor_tag::TERRESTRIAL_DELIVERY, &terrestrial))],
        );

        assert_eq!(nit.network_id, 0x3001);
        assert_eq!(nit.network_name.as_deref(), Some("TestNet"));
        assert_eq!(nit.transports.len(), 1);
        let t = &nit.transports[0];
        assert_eq!(t.transport_stream_id, 0x1001);
        match t.tuning.as_ref().unwrap() {
            TuningParams::Terrestrial {
                frequency,
                bandwidth,
                modulation,
                code_rate_hp,
                ..
            } => {
                assert_eq!(*frequency, 506_000_000);
                assert_eq!(*bandwidth, Bandwidth::Mhz8);
                assert_eq!(*modulation, Modulation::Qam64);
                assert_eq!(*code_rate_hp, FecRate::Fec2_3);
            }
            other => panic!("unexpected tuning {other:?}"),
        }
    }

    #[test]
    fn parse_satellite_transport() {
        // 11.836 GHz as BCD 01183600 (10 kHz units), orbital 19.2E,
        // horizontal, symbol rate 27500 ksym/s as BCD 0275000, FEC 3/4.
        let satellite = [
            0x01, 0x18, 0x36, 0x00, // frequency
            0x01, 0x92, // orbital position
            0x80, // east, horizontal
            0x02, 0x75, 0x00, 0x03, // symbol rate + FEC 3/4
        ];
        let nit = build_nit(
            &[],
            &[(0x0044, 0x0001, descriptor(descriptor_tag::SATELLITE_DELIVERY, &satellite))],
        );
        match nit.transports[0].tuning.as_ref().unwrap() {
            TuningParams::Satellite {
                frequency,
                polarization,
                symbol_rate,
                fec,
                orbital,
            } => {
                assert_eq!(*frequency, 11_836_000_000);
                assert_eq!(*polarization, Polarization::Horizontal);
                assert_eq!(*symbol_rate, 27_500_000);
                assert_eq!(*fec, FecRate::Fec3_4);
                assert_eq!(orbital.as_deref(), Some("19.2E"));
            }
            other => panic!("unexpected tuning {other:?}"),
        }
    }

    #[test]
    fn first_delivery_descriptor_wins() {
        let freq_a = 50_600_000u32.to_be_bytes();
        let freq_b = 52_200_000u32.to_be_bytes();
        let mk = |f: [u8; 4]| {
            descriptor(
                descriptor_tag::TERRESTRIAL_DELIVERY,
                &[f[0], f[1], f[2], f[3], 0x00, 0x80, 0x00],
            )
        };
        let mut both = mk(freq_a);
        both.extend(mk(freq_b));
        let nit = build_nit(&[], &[(1, 1, both)]);
        assert_eq!(nit.transports[0].tuning.as_ref().unwrap().frequency(), 506_000_000);
    }

    #[test]
    fn transport_without_delivery_descriptor() {
        let nit = build_nit(&[], &[(9, 9, descriptor(0x41, &[0, 1, 0x01]))]);
        assert_eq!(nit.transports.len(), 1);
        assert!(nit.transports[0].tuning.is_none());
    }

    #[test]
    fn bcd_folds_digits() {
        assert_eq!(bcd(&[0x12, 0x34]), 1234);
        assert_eq!(bcd(&[0x01, 0x18, 0x36, 0x00]), 1_183_600);
    }
}
