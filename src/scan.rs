//! Network scan: walk seed transponders, collect PSI tables, build the
//! service catalog.
//!
//! Transponders announced by the NIT are appended to the work queue, so a
//! single seed can unfold into the whole network. Per-transponder failures
//! are recorded and skipped; a dead carrier never aborts the scan.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::demux::Demux;
use crate::error::Result;
use crate::frontend::{Frontend, TuneOptions, TuneResult};
use crate::model::catalog::Catalog;
use crate::model::service::{ElementaryStream, RunningStatus, Service, ServiceType};
use crate::model::transponder::Transponder;
use crate::psi::nit::NitTable;
use crate::psi::pat::PatTable;
use crate::psi::pmt::PmtTable;
use crate::psi::sdt::{SdtService, SdtTable};
use crate::psi::section::Section;
use crate::psi::{pid, table_id};

/// Scan tuning knobs.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long to wait for each table's sections.
    pub section_timeout: Duration,
    pub tune: TuneOptions,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            section_timeout: Duration::from_millis(2000),
            tune: TuneOptions::default(),
        }
    }
}

/// Counters reported after a scan pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanSummary {
    pub transponders_visited: usize,
    pub transponders_locked: usize,
    pub transponders_failed: usize,
    pub services_found: usize,
}

/// Scans every transponder reachable from `seeds` on one frontend,
/// upserting discovered services into `catalog`. `notify` fires once per
/// service as it is found.
pub fn scan_frontend(
    adapter_id: &str,
    frontend_num: u32,
    frontend: &mut Frontend,
    demux: &mut Demux,
    seeds: &[Transponder],
    catalog: &mut Catalog,
    opts: &ScanOptions,
    mut notify: impl FnMut(&Service),
) -> ScanSummary {
    let mut summary = ScanSummary::default();
    let mut queue: VecDeque<Transponder> = seeds.iter().cloned().collect();
    let mut visited: HashSet<Transponder> = HashSet::new();

    while let Some(transponder) = queue.pop_front() {
        if visited.contains(&transponder) {
            continue;
        }
        visited.insert(transponder.clone());
        summary.transponders_visited += 1;

        match frontend.tune(&transponder, &opts.tune) {
            Ok(TuneResult::Locked) => {}
            Ok(other) => {
                debug!("scan: {transponder}: {other:?}, skipping");
                summary.transponders_failed += 1;
                frontend.release();
                continue;
            }
            Err(e) => {
                warn!("scan: {transponder}: tune failed: {e}");
                summary.transponders_failed += 1;
                frontend.release();
                continue;
            }
        }
        summary.transponders_locked += 1;

        match scan_transponder(demux, opts) {
            Ok(found) => {
                for discovered in found.new_transponders {
                    if !visited.contains(&discovered) && !queue.contains(&discovered) {
                        debug!("scan: NIT announced {discovered}");
                        queue.push_back(discovered);
                    }
                }
                if !found.services.is_empty() {
                    let tid =
                        catalog.insert_transponder(adapter_id, frontend_num, transponder.clone());
                    for service in found.services {
                        info!(
                            "scan: found \"{}\" (sid {}) on {transponder}",
                            service.name, service.sid
                        );
                        notify(&service);
                        summary.services_found += 1;
                        catalog.add_service(tid, service);
                    }
                }
            }
            Err(e) => {
                warn!("scan: {transponder}: {e}");
                summary.transponders_failed += 1;
            }
        }
        frontend.release();
    }

    info!(
        "scan: {} visited, {} locked, {} failed, {} services",
        summary.transponders_visited,
        summary.transponders_locked,
        summary.transponders_failed,
        summary.services_found
    );
    summary
}

struct TransponderScan {
    services: Vec<Service>,
    new_transponders: Vec<Transponder>,
}

/// Collects PAT, SDT, NIT and the per-program PMTs of one tuned
/// transponder. Section filters are closed on return.
fn scan_transponder(demux: &mut Demux, opts: &ScanOptions) -> Result<TransponderScan> {
    let pat_sections = read_table(demux, pid::PAT, table_id::PAT, opts.section_timeout)?;
    if pat_sections.is_empty() {
        return Err(crate::error::DvbError::SectionParse("no PAT received"));
    }
    let mut programs: Vec<(u16, u16)> = Vec::new();
    for section in &pat_sections {
        match PatTable::parse(section) {
            Ok(pat) => {
                for entry in pat.programs {
                    programs.push((entry.program_number, entry.pmt_pid));
                }
            }
            Err(e) => debug!("scan: dropped PAT section: {e}"),
        }
    }

    let mut sdt_services: HashMap<u16, SdtService> = HashMap::new();
    for section in read_table(demux, pid::SDT, table_id::SDT_ACTUAL, opts.section_timeout)? {
        match SdtTable::parse(&section) {
            Ok(sdt) => {
                for service in sdt.services {
                    sdt_services.entry(service.service_id).or_insert(service);
                }
            }
            Err(e) => debug!("scan: dropped SDT section: {e}"),
        }
    }

    let mut new_transponders = Vec::new();
    for section in read_table(demux, pid::NIT, table_id::NIT_ACTUAL, opts.section_timeout)? {
        match NitTable::parse(&section) {
            Ok(nit) => {
                for transport in nit.transports {
                    if let Some(params) = transport.tuning {
                        let discovered = Transponder::new(params);
                        if !new_transponders.contains(&discovered) {
                            new_transponders.push(discovered);
                        }
                    }
                }
            }
            Err(e) => debug!("scan: dropped NIT section: {e}"),
        }
    }

    let mut services = Vec::new();
    for (program_number, pmt_pid) in programs {
        let pmt = match read_pmt(demux, pmt_pid, program_number, opts.section_timeout) {
            Some(pmt) => pmt,
            None => {
                debug!("scan: no PMT for program {program_number} on pid {pmt_pid:#06x}");
                continue;
            }
        };
        // Only services the SDT names end up in the catalog.
        let Some(sdt) = sdt_services.get(&program_number) else {
            debug!("scan: program {program_number} has no SDT entry, skipping");
            continue;
        };
        let Some(descriptor) = &sdt.descriptor else {
            debug!("scan: program {program_number} has no service descriptor, skipping");
            continue;
        };
        if descriptor.service_name.is_empty() {
            debug!("scan: program {program_number} has an empty name, skipping");
            continue;
        }

        let mut service = Service::new(&descriptor.service_name, program_number, pmt_pid);
        service.provider = descriptor.provider_name.clone();
        service.service_type = ServiceType::from_u8(descriptor.service_type);
        service.status = RunningStatus::from_u8(sdt.running_status);
        service.scrambled = sdt.free_ca;
        service.set_pcr_pid(pmt.pcr_pid);
        for stream in &pmt.streams {
            service.add_stream(ElementaryStream {
                pid: stream.elementary_pid,
                stream_type: stream.stream_type,
                language: stream.language(),
                descriptors: stream.descriptors.clone(),
            });
        }
        services.push(service);
    }

    Ok(TransponderScan {
        services,
        new_transponders,
    })
}

/// Reads sections of one table until the section set is complete or the
/// timeout elapses. Malformed sections are dropped with a diagnostic.
fn read_table(
    demux: &mut Demux,
    pid: u16,
    table_id: u8,
    timeout: Duration,
) -> Result<Vec<Section>> {
    let mut filter = demux.open_section_filter(pid, table_id)?;
    let deadline = Instant::now() + timeout;
    let mut sections: HashMap<u8, Section> = HashMap::new();
    let mut last_section = 0u8;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match filter.read_section(remaining)? {
            None => break,
            Some(raw) => match Section::parse(&raw) {
                Ok(section) if section.header.table_id == table_id => {
                    last_section = last_section.max(section.header.last_section_number);
                    sections.insert(section.header.section_number, section);
                    if sections.len() > usize::from(last_section) {
                        break;
                    }
                }
                Ok(section) => {
                    debug!(
                        "scan: unexpected table {:#04x} on pid {pid:#06x}",
                        section.header.table_id
                    );
                }
                Err(e) => debug!("scan: dropped malformed section on pid {pid:#06x}: {e}"),
            },
        }
    }

    let mut ordered: Vec<(u8, Section)> = sections.into_iter().collect();
    ordered.sort_by_key(|(n, _)| *n);
    Ok(ordered.into_iter().map(|(_, s)| s).collect())
}

/// Reads the PMT of one program, matching on the program number.
fn read_pmt(demux: &mut Demux, pmt_pid: u16, program_number: u16, timeout: Duration) -> Option<PmtTable> {
    let sections = match read_table(demux, pmt_pid, table_id::PMT, timeout) {
        Ok(sections) => sections,
        Err(e) => {
            debug!("scan: PMT filter on pid {pmt_pid:#06x} failed: {e}");
            return None;
        }
    };
    sections
        .iter()
        .filter(|s| s.header.table_id_extension == program_number)
        .find_map(|s| PmtTable::parse(s).ok())
}
