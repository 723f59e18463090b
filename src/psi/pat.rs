//! PAT (Program Association Table) parsing and synthesis.
//!
//! The parse side feeds the scanner; the emit side manufactures the
//! single-program PAT the remultiplexer injects into every served stream.

use bytes::Bytes;

use crate::error::DvbError;
use crate::psi::section::{finish_section, Section};
use crate::psi::{packet, pid, table_id};

/// One program entry in the PAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid: u16,
}

/// Parsed Program Association Table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatTable {
    pub transport_stream_id: u16,
    pub version_number: u8,
    pub programs: Vec<PatEntry>,
    /// PID announced for program_number 0.
    pub nit_pid: Option<u16>,
}

impl PatTable {
    /// Parses a PAT from a validated section.
    pub fn parse(section: &Section) -> Result<Self, DvbError> {
        if section.header.table_id != table_id::PAT {
            return Err(DvbError::SectionParse("not a PAT section"));
        }
        let mut pat = PatTable {
            transport_stream_id: section.header.table_id_extension,
            version_number: section.header.version_number,
            programs: Vec::new(),
            nit_pid: None,
        };
        let data = &section.payload;
        let mut offset = 0;
        while offset + 4 <= data.len() {
            let program_number = u16::from(data[offset]) << 8 | u16::from(data[offset + 1]);
            let entry_pid =
                u16::from(data[offset + 2] & 0x1F) << 8 | u16::from(data[offset + 3]);
            if program_number == 0 {
                pat.nit_pid = Some(entry_pid);
            } else {
                pat.programs.push(PatEntry {
                    program_number,
                    pmt_pid: entry_pid,
                });
            }
            offset += 4;
        }
        Ok(pat)
    }

    pub fn pmt_pid_of(&self, program_number: u16) -> Option<u16> {
        self.programs
            .iter()
            .find(|p| p.program_number == program_number)
            .map(|p| p.pmt_pid)
    }
}

/// Builds a complete PAT section announcing the given programs.
pub fn build_section(transport_stream_id: u16, version: u8, programs: &[PatEntry]) -> Vec<u8> {
    let section_length = 5 + programs.len() * 4 + 4;
    let mut body = vec![
        table_id::PAT,
        0xB0 | ((section_length >> 8) as u8 & 0x0F),
        section_length as u8,
        (transport_stream_id >> 8) as u8,
        transport_stream_id as u8,
        0xC0 | ((version & 0x1F) << 1) | 0x01, // current_next = 1
        0x00,
        0x00,
    ];
    for p in programs {
        body.push((p.program_number >> 8) as u8);
        body.push(p.program_number as u8);
        body.push(0xE0 | ((p.pmt_pid >> 8) as u8 & 0x1F));
        body.push(p.pmt_pid as u8);
    }
    finish_section(body)
}

/// Manufactures the single-program PAT packet injected per service: PID 0,
/// payload_unit_start set, one program `(sid -> pmt_pid)`, caller-cycled
/// continuity counter.
pub fn synthesize_pat_packet(sid: u16, pmt_pid: u16, continuity_counter: u8) -> Bytes {
    let section = build_section(
        sid,
        0,
        &[PatEntry {
            program_number: sid,
            pmt_pid,
        }],
    );
    packet::wrap_section(pid::PAT, continuity_counter, &section)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::section::test_util::build_section as build_raw;
    use crate::psi::TsPacket;

    #[test]
    fn parse_extracts_programs_and_nit() {
        let payload = [
            0x00, 0x00, 0xE0, 0x10, // program 0 -> NIT on 0x10
            0x00, 0x65, 0xE1, 0x00, // program 101 -> PMT on 0x100
            0x00, 0x66, 0xE1, 0x10, // program 102 -> PMT on 0x110
        ];
        let raw = build_raw(table_id::PAT, 0x7FE1, 2, &payload);
        let section = Section::parse(&raw).unwrap();
        let pat = PatTable::parse(&section).unwrap();

        assert_eq!(pat.transport_stream_id, 0x7FE1);
        assert_eq!(pat.version_number, 2);
        assert_eq!(pat.nit_pid, Some(0x10));
        assert_eq!(pat.programs.len(), 2);
        assert_eq!(pat.pmt_pid_of(101), Some(0x100));
        assert_eq!(pat.pmt_pid_of(102), Some(0x110));
        assert_eq!(pat.pmt_pid_of(103), None);
    }

    #[test]
    fn parse_rejects_wrong_table() {
        let raw = build_raw(table_id::PMT, 1, 0, &[0; 4]);
        let section = Section::parse(&raw).unwrap();
        assert!(PatTable::parse(&section).is_err());
    }

    #[test]
    fn synthesized_pat_announces_exactly_one_program() {
        let packet = synthesize_pat_packet(101, 0x100, 9);
        let pkt = TsPacket::parse(&packet).unwrap();
        assert_eq!(pkt.header.pid, pid::PAT);
        assert!(pkt.header.payload_unit_start);
        assert_eq!(pkt.header.continuity_counter, 9);

        // Pointer byte, then a section that parses with a correct CRC.
        let pointer = pkt.payload[0] as usize;
        let section = Section::parse(&pkt.payload[1 + pointer..]).unwrap();
        let pat = PatTable::parse(&section).unwrap();
        assert_eq!(pat.programs.len(), 1);
        assert_eq!(pat.programs[0].program_number, 101);
        assert_eq!(pat.programs[0].pmt_pid, 0x100);
        assert_eq!(pat.nit_pid, None);
    }

    #[test]
    fn build_parse_round_trip() {
        let programs = [
            PatEntry {
                program_number: 7,
                pmt_pid: 0x20,
            },
            PatEntry {
                program_number: 8,
                pmt_pid: 0x21,
            },
        ];
        let raw = build_section(42, 1, &programs);
        let pat = PatTable::parse(&Section::parse(&raw).unwrap()).unwrap();
        assert_eq!(pat.transport_stream_id, 42);
        assert_eq!(pat.programs, programs.to_vec());
    }
}
