//! SDT (Service Description Table) parsing.

use crate::error::DvbError;
use crate::psi::section::Section;
use crate::psi::{decode_dvb_string, descriptor_tag, table_id};

/// Service descriptor payload (tag 0x48).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service_type: u8,
    pub provider_name: String,
    pub service_name: String,
}

/// One service entry of the SDT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdtService {
    pub service_id: u16,
    pub eit_schedule: bool,
    pub eit_present_following: bool,
    pub running_status: u8,
    pub free_ca: bool,
    pub descriptor: Option<ServiceDescriptor>,
}

/// Parsed Service Description Table (actual transport stream).
#[derive(Debug, Clone, Default)]
pub struct SdtTable {
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub version_number: u8,
    pub services: Vec<SdtService>,
}

impl SdtTable {
    /// Parses an SDT from a validated section.
    pub fn parse(section: &Section) -> Result<Self, DvbError> {
        if section.header.table_id != table_id::SDT_ACTUAL
            && section.header.table_id != table_id::SDT_OTHER
        {
            return Err(DvbError::SectionParse("not an SDT section"));
        }
        let data = &section.payload;
        if data.len() < 3 {
            return Err(DvbError::SectionParse("SDT too short"));
        }

        let mut sdt = SdtTable {
            transport_stream_id: section.header.table_id_extension,
            original_network_id: u16::from(data[0]) << 8 | u16::from(data[1]),
            version_number: section.header.version_number,
            services: Vec::new(),
        };

        let mut offset = 3;
        while offset + 5 <= data.len() {
            let service_id = u16::from(data[offset]) << 8 | u16::from(data[offset + 1]);
            let flags = data[offset + 2];
            let running_status = (data[offset + 3] >> 5) & 0x07;
            let free_ca = data[offset + 3] & 0x10 != 0;
            let loop_length =
                (usize::from(data[offset + 3] & 0x0F) << 8) | usize::from(data[offset + 4]);
            offset += 5;
            if offset + loop_length > data.len() {
                break;
            }
            let descriptor = parse_service_descriptor(&data[offset..offset + loop_length]);
            offset += loop_length;

            sdt.services.push(SdtService {
                service_id,
                eit_schedule: flags & 0x02 != 0,
                eit_present_following: flags & 0x01 != 0,
                running_status,
                free_ca,
                descriptor,
            });
        }
        Ok(sdt)
    }

    pub fn find_service(&self, service_id: u16) -> Option<&SdtService> {
        self.services.iter().find(|s| s.service_id == service_id)
    }
}

fn parse_service_descriptor(data: &[u8]) -> Option<ServiceDescriptor> {
    let mut offset = 0;
    while offset + 2 <= data.len() {
        let tag = data[offset];
        let length = data[offset + 1] as usize;
        if offset + 2 + length > data.len() {
            return None;
        }
        if tag == descriptor_tag::SERVICE && length >= 3 {
            let d = &data[offset + 2..offset + 2 + length];
            let service_type = d[0];
            let provider_len = d[1] as usize;
            if 2 + provider_len + 1 > d.len() {
                return None;
            }
            let provider_name = decode_dvb_string(&d[2..2 + provider_len]);
            let name_len = d[2 + provider_len] as usize;
            let name_start = 2 + provider_len + 1;
            if name_start + name_len > d.len() {
                return None;
            }
            let service_name = decode_dvb_string(&d[name_start..name_start + name_len]);
            return Some(ServiceDescriptor {
                service_type,
                provider_name,
                service_name,
            });
        }
        offset += 2 + length;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::section::test_util::build_section;

    fn service_entry(sid: u16, running: u8, free_ca: bool, descriptor: &[u8]) -> Vec<u8> {
        let mut e = vec![
            (sid >> 8) as u8,
            sid as u8,
            0x01, // EIT present/following
            ((running & 0x07) << 5)
                | (if free_ca { 0x10 } else { 0x00 })
                | ((descriptor.len() >> 8) as u8 & 0x0F),
            descriptor.len() as u8,
        ];
        e.extend_from_slice(descriptor);
        e
    }

    fn service_descriptor(service_type: u8, provider: &str, name: &str) -> Vec<u8> {
        let mut d = vec![
            descriptor_tag::SERVICE,
            (3 + provider.len() + name.len()) as u8,
            service_type,
            provider.len() as u8,
        ];
        d.extend_from_slice(provider.as_bytes());
        d.push(name.len() as u8);
        d.extend_from_slice(name.as_bytes());
        d
    }

    #[test]
    fn parse_named_services() {
        let mut payload = vec![0x7F, 0xE0, 0xFF]; // original_network_id + reserved
        payload.extend(service_entry(
            101,
            4,
            false,
            &service_descriptor(0x01, "Provider", "Channel-A"),
        ));
        payload.extend(service_entry(
            102,
            1,
            true,
            &service_descriptor(0x02, "Provider", "Radio-B"),
        ));

        let raw = build_section(table_id::SDT_ACTUAL, 0x7FE1, 0, &payload);
        let sdt = SdtTable::parse(&Section::parse(&raw).unwrap()).unwrap();

        assert_eq!(sdt.transport_stream_id, 0x7FE1);
        assert_eq!(sdt.original_network_id, 0x7FE0);
        assert_eq!(sdt.services.len(), 2);

        let a = sdt.find_service(101).unwrap();
        assert_eq!(a.running_status, 4);
        assert!(!a.free_ca);
        assert!(a.eit_present_following);
        let d = a.descriptor.as_ref().unwrap();
        assert_eq!(d.service_type, 0x01);
        assert_eq!(d.service_name, "Channel-A");
        assert_eq!(d.provider_name, "Provider");

        let b = sdt.find_service(102).unwrap();
        assert!(b.free_ca);
        assert_eq!(b.descriptor.as_ref().unwrap().service_name, "Radio-B");
    }

    #[test]
    fn entry_without_service_descriptor() {
        let mut payload = vec![0x00, 0x01, 0xFF];
        payload.extend(service_entry(7, 0, false, &[]));
        let raw = build_section(table_id::SDT_ACTUAL, 1, 0, &payload);
        let sdt = SdtTable::parse(&Section::parse(&raw).unwrap()).unwrap();
        assert_eq!(sdt.services.len(), 1);
        assert!(sdt.services[0].descriptor.is_none());
    }

    #[test]
    fn rejects_wrong_table_id() {
        let raw = build_section(table_id::PAT, 1, 0, &[0, 0, 0]);
        assert!(SdtTable::parse(&Section::parse(&raw).unwrap()).is_err());
    }
}
