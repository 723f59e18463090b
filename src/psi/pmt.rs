//! PMT (Program Map Table) parsing.

use crate::error::DvbError;
use crate::psi::section::Section;
use crate::psi::{descriptor_tag, table_id};

/// Stream type codes used by DVB multiplexes.
pub mod stream_type {
    pub const MPEG1_VIDEO: u8 = 0x01;
    pub const MPEG2_VIDEO: u8 = 0x02;
    pub const MPEG1_AUDIO: u8 = 0x03;
    pub const MPEG2_AUDIO: u8 = 0x04;
    pub const PRIVATE_SECTIONS: u8 = 0x05;
    /// Teletext, DVB subtitles and AC-3 ride in PES private data.
    pub const PES_PRIVATE_DATA: u8 = 0x06;
    pub const ADTS_AUDIO: u8 = 0x0F;
    pub const LATM_AUDIO: u8 = 0x11;
    pub const H264_VIDEO: u8 = 0x1B;
    pub const H265_VIDEO: u8 = 0x24;

    pub fn is_video(t: u8) -> bool {
        is_mpeg_video(t) || is_advanced_video(t)
    }

    pub fn is_mpeg_video(t: u8) -> bool {
        matches!(t, MPEG1_VIDEO | MPEG2_VIDEO)
    }

    pub fn is_advanced_video(t: u8) -> bool {
        matches!(t, H264_VIDEO | H265_VIDEO)
    }

    pub fn is_audio(t: u8) -> bool {
        matches!(t, MPEG1_AUDIO | MPEG2_AUDIO | ADTS_AUDIO | LATM_AUDIO)
    }
}

/// One elementary stream announced by a PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub elementary_pid: u16,
    /// Raw ES info descriptor loop.
    pub descriptors: Vec<u8>,
}

impl PmtStream {
    /// ISO 639 language code from the ES descriptors, if announced.
    pub fn language(&self) -> Option<String> {
        let mut offset = 0;
        let data = &self.descriptors;
        while offset + 2 <= data.len() {
            let tag = data[offset];
            let length = data[offset + 1] as usize;
            if offset + 2 + length > data.len() {
                break;
            }
            if tag == descriptor_tag::ISO_639_LANGUAGE && length >= 3 {
                let code = &data[offset + 2..offset + 5];
                if code.iter().all(|b| b.is_ascii_alphabetic()) {
                    return Some(code.iter().map(|&b| b as char).collect());
                }
            }
            offset += 2 + length;
        }
        None
    }
}

/// Parsed Program Map Table.
#[derive(Debug, Clone, Default)]
pub struct PmtTable {
    pub program_number: u16,
    pub version_number: u8,
    pub pcr_pid: u16,
    /// Raw program info descriptor loop.
    pub program_info: Vec<u8>,
    pub streams: Vec<PmtStream>,
}

impl PmtTable {
    /// Parses a PMT from a validated section.
    pub fn parse(section: &Section) -> Result<Self, DvbError> {
        if section.header.table_id != table_id::PMT {
            return Err(DvbError::SectionParse("not a PMT section"));
        }
        let data = &section.payload;
        if data.len() < 4 {
            return Err(DvbError::SectionParse("PMT too short"));
        }

        let pcr_pid = u16::from(data[0] & 0x1F) << 8 | u16::from(data[1]);
        let program_info_length = (usize::from(data[2] & 0x0F) << 8) | usize::from(data[3]);
        if data.len() < 4 + program_info_length {
            return Err(DvbError::SectionParse("PMT program info overflow"));
        }

        let mut pmt = PmtTable {
            program_number: section.header.table_id_extension,
            version_number: section.header.version_number,
            pcr_pid,
            program_info: data[4..4 + program_info_length].to_vec(),
            streams: Vec::new(),
        };

        let mut offset = 4 + program_info_length;
        while offset + 5 <= data.len() {
            let stream_type = data[offset];
            let elementary_pid =
                u16::from(data[offset + 1] & 0x1F) << 8 | u16::from(data[offset + 2]);
            let es_info_length =
                (usize::from(data[offset + 3] & 0x0F) << 8) | usize::from(data[offset + 4]);
            offset += 5;
            if offset + es_info_length > data.len() {
                break;
            }
            pmt.streams.push(PmtStream {
                stream_type,
                elementary_pid,
                descriptors: data[offset..offset + es_info_length].to_vec(),
            });
            offset += es_info_length;
        }
        Ok(pmt)
    }

    pub fn video_pids(&self) -> Vec<u16> {
        self.streams
            .iter()
            .filter(|s| stream_type::is_video(s.stream_type))
            .map(|s| s.elementary_pid)
            .collect()
    }

    pub fn audio_pids(&self) -> Vec<u16> {
        self.streams
            .iter()
            .filter(|s| stream_type::is_audio(s.stream_type))
            .map(|s| s.elementary_pid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::section::test_util::build_section;

    fn parse(payload: &[u8], program: u16) -> PmtTable {
        let raw = build_section(table_id::PMT, program, 1, payload);
        PmtTable::parse(&Section::parse(&raw).unwrap()).unwrap()
    }

    #[test]
    fn parse_streams_and_pcr() {
        let payload = [
            0xE2, 0x00, // PCR PID 0x200
            0xF0, 0x00, // no program info
            0x02, 0xE2, 0x00, 0xF0, 0x00, // MPEG-2 video on 0x200
            0x03, 0xE2, 0x01, 0xF0, 0x06, // MPEG-1 audio on 0x201
            0x0A, 0x04, b'd', b'e', b'u', 0x00, // ISO 639 "deu"
        ];
        let pmt = parse(&payload, 101);
        assert_eq!(pmt.program_number, 101);
        assert_eq!(pmt.pcr_pid, 0x200);
        assert_eq!(pmt.streams.len(), 2);
        assert_eq!(pmt.video_pids(), vec![0x200]);
        assert_eq!(pmt.audio_pids(), vec![0x201]);
        assert_eq!(pmt.streams[1].language(), Some("deu".to_string()));
        assert_eq!(pmt.streams[0].language(), None);
    }

    #[test]
    fn parse_keeps_program_info() {
        let payload = [
            0xE1, 0x00, // PCR PID
            0xF0, 0x04, 0x09, 0x02, 0xAA, 0xBB, // CA descriptor blob
            0x1B, 0xE3, 0x00, 0xF0, 0x00, // H.264 video
        ];
        let pmt = parse(&payload, 7);
        assert_eq!(pmt.program_info, vec![0x09, 0x02, 0xAA, 0xBB]);
        assert_eq!(pmt.streams[0].stream_type, stream_type::H264_VIDEO);
    }

    #[test]
    fn truncated_es_loop_stops_cleanly() {
        let payload = [
            0xE1, 0x00, 0xF0, 0x00, //
            0x02, 0xE2, 0x00, 0xF3, 0xFF, // claims a huge ES info length
        ];
        let pmt = parse(&payload, 7);
        assert!(pmt.streams.is_empty());
    }

    #[test]
    fn stream_type_predicates() {
        assert!(stream_type::is_video(stream_type::MPEG2_VIDEO));
        assert!(stream_type::is_advanced_video(stream_type::H265_VIDEO));
        assert!(stream_type::is_audio(stream_type::ADTS_AUDIO));
        assert!(!stream_type::is_audio(stream_type::PES_PRIVATE_DATA));
    }
}
