//! The top-level coordinator.
//!
//! A [`DvbDevice`] owns the adapters, the scanned catalog and the map of
//! streams currently served. It is an explicitly constructed value, not a
//! process-wide singleton; the external file server holds it behind an
//! `Arc` and calls [`get_stream`](DvbDevice::get_stream) /
//! [`free_stream`](DvbDevice::free_stream) from its worker threads.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::adapter::Adapter;
use crate::config;
use crate::error::{DvbError, Result};
use crate::frontend::{TuneOptions, TuneResult};
use crate::model::catalog::Catalog;
use crate::model::service::Service;
use crate::model::transponder::{DeliverySystem, Transponder};
use crate::psi::pid;
use crate::remux::stream::ServiceStream;
use crate::remux::{Remux, RemuxConfig};
use crate::scan::{scan_frontend, ScanOptions, ScanSummary};

/// Device-wide policy and subsystem configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Refuse scrambled services when picking a transponder.
    pub unscrambled_only: bool,
    /// Upper bound for the adapter probe.
    pub max_adapters: u32,
    pub tune: TuneOptions,
    pub scan: ScanOptions,
    pub remux: RemuxConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            unscrambled_only: true,
            max_adapters: 8,
            tune: TuneOptions::default(),
            scan: ScanOptions::default(),
            remux: RemuxConfig::default(),
        }
    }
}

/// Raw access to a served stream's byte queue, for consumers that bypass
/// `io::Read`.
pub struct ByteQueueHandle {
    pub(crate) id: u64,
    pub(crate) sid: u16,
    pub queue: Arc<crate::remux::queue::ByteQueue>,
}

struct ActiveMux {
    transponder: Transponder,
    remux: Arc<Remux>,
    /// Streams currently served from this mux.
    services: u32,
    /// False while the mux is being brought up or torn down; selection
    /// skips it.
    ready: bool,
}

struct StreamEntry {
    key: (usize, usize),
    sid: u16,
    pids: Vec<u16>,
}

#[derive(Default)]
struct ActiveState {
    muxes: HashMap<(usize, usize), ActiveMux>,
    streams: HashMap<u64, StreamEntry>,
}

pub struct DvbDevice {
    config: DeviceConfig,
    adapters: Vec<Adapter>,
    catalog: RwLock<Catalog>,
    seeds: Mutex<HashMap<DeliverySystem, Vec<Transponder>>>,
    active: Mutex<ActiveState>,
}

impl DvbDevice {
    pub fn new(config: DeviceConfig) -> Self {
        Self::with_adapters(config, Vec::new())
    }

    /// Builds a device over an explicit adapter list; hardware probing
    /// goes through [`detect_adapters`](Self::detect_adapters) instead.
    pub fn with_adapters(config: DeviceConfig, adapters: Vec<Adapter>) -> Self {
        DvbDevice {
            config,
            adapters,
            catalog: RwLock::new(Catalog::new()),
            seeds: Mutex::new(HashMap::new()),
            active: Mutex::new(ActiveState::default()),
        }
    }

    /// Probes the hardware and replaces the adapter list.
    #[cfg(target_os = "linux")]
    pub fn detect_adapters(&mut self) {
        self.adapters = Adapter::detect_all(self.config.max_adapters);
        info!("detected {} adapter(s)", self.adapters.len());
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    /// Registers seed transponders for one frontend type from the classic
    /// initial-tuning line format. Returns how many were added.
    pub fn add_initial_transponders(&self, system: DeliverySystem, blob: &str) -> Result<usize> {
        let transponders = config::parse_initial_transponders(system, blob)?;
        let count = transponders.len();
        self.seeds.lock().entry(system).or_default().extend(transponders);
        debug!("registered {count} seed transponder(s) for {system}");
        Ok(count)
    }

    /// Walks the network from the registered seeds and replaces the
    /// catalog with the scan result. `notify` fires once per discovered
    /// service, e.g. for a CLI progress display.
    pub fn scan(&self, mut notify: impl FnMut(&Service)) -> ScanSummary {
        let seeds = self.seeds.lock().clone();
        let mut catalog = Catalog::new();
        let mut total = ScanSummary::default();
        let mut scanned: Vec<DeliverySystem> = Vec::new();

        for adapter in &self.adapters {
            for (frontend_num, frontend) in adapter.frontends().iter().enumerate() {
                let mut frontend = frontend.lock();
                let system = frontend.system();
                // One pass per delivery system; a second frontend of the
                // same type would only revisit the same carriers.
                if scanned.contains(&system) {
                    continue;
                }
                let Some(seed_list) = seeds.get(&system) else {
                    continue;
                };
                if seed_list.is_empty() {
                    continue;
                }
                scanned.push(system);

                let mut demux = adapter.demux().lock();
                let summary = scan_frontend(
                    &adapter.id,
                    frontend_num as u32,
                    &mut frontend,
                    &mut demux,
                    seed_list,
                    &mut catalog,
                    &self.config.scan,
                    &mut notify,
                );
                total.transponders_visited += summary.transponders_visited;
                total.transponders_locked += summary.transponders_locked;
                total.transponders_failed += summary.transponders_failed;
                total.services_found += summary.services_found;
            }
        }

        *self.catalog.write() = catalog;
        total
    }

    /// Replaces the catalog, e.g. with a previously persisted scan.
    pub fn set_catalog(&self, catalog: Catalog) {
        *self.catalog.write() = catalog;
    }

    /// Loads the catalog from its XML form. Errors abort startup.
    pub fn read_xml(&self, xml: &str) -> Result<()> {
        self.set_catalog(Catalog::from_xml(xml)?);
        Ok(())
    }

    /// Serializes the catalog to its XML form.
    pub fn write_xml(&self) -> Result<String> {
        self.catalog.read().to_xml()
    }

    /// Runs `f` against the current catalog.
    pub fn with_catalog<R>(&self, f: impl FnOnce(&Catalog) -> R) -> R {
        f(&self.catalog.read())
    }

    /// Acquires a readable single-program TS stream for a named service.
    ///
    /// Walks the service's transponders in scan order, skipping scrambled
    /// entries under the unscrambled-only policy and frontends that are
    /// busy with other services. Failures surface as a clean error so the
    /// caller can fail the client request.
    pub fn get_stream(&self, service_name: &str) -> Result<ServiceStream> {
        let catalog = self.catalog.read();
        let tids = catalog.transponders_for(service_name);
        if tids.is_empty() {
            return Err(DvbError::ServiceNotFound(service_name.to_string()));
        }

        let mut last_error = DvbError::NoFreeFrontend(service_name.to_string());
        for &tid in tids {
            let entry = catalog.transponder(tid);
            let Some((_, service)) = catalog.service_on(tid, service_name) else {
                continue;
            };
            if service.scrambled && self.config.unscrambled_only {
                debug!(
                    "skipping scrambled instance of \"{service_name}\" on {}",
                    entry.transponder
                );
                continue;
            }
            let transponder = entry.transponder.clone();
            let service = service.clone();
            match self.open_stream_on(&transponder, &service) {
                Ok(stream) => {
                    info!(
                        "serving \"{service_name}\" (sid {}) from {transponder}",
                        service.sid
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("cannot serve \"{service_name}\" from {transponder}: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Releases a stream previously returned by
    /// [`get_stream`](Self::get_stream). When the last stream on a
    /// transponder goes away, the remux is stopped, the DVR closed and the
    /// frontend released. Idempotent.
    pub fn free_stream(&self, stream: ServiceStream) {
        self.release_stream(stream.id(), stream.sid());
    }

    /// [`get_stream`](Self::get_stream), but exposing the raw byte queue.
    pub fn get_byte_queue(&self, service_name: &str) -> Result<ByteQueueHandle> {
        let stream = self.get_stream(service_name)?;
        Ok(ByteQueueHandle {
            id: stream.id(),
            sid: stream.sid(),
            queue: stream.byte_queue(),
        })
    }

    pub fn free_byte_queue(&self, handle: ByteQueueHandle) {
        self.release_stream(handle.id, handle.sid);
    }

    /// Streams currently being served.
    pub fn active_stream_count(&self) -> usize {
        self.active.lock().streams.len()
    }

    /// Releases every active stream, stopping remuxes and returning all
    /// frontends to idle. Safe to call with clients still blocked in
    /// reads; they observe end-of-stream.
    pub fn close(&self) {
        let ids: Vec<(u64, u16)> = self
            .active
            .lock()
            .streams
            .iter()
            .map(|(&id, e)| (id, e.sid))
            .collect();
        for (id, sid) in ids {
            self.release_stream(id, sid);
        }
    }

    fn open_stream_on(&self, transponder: &Transponder, service: &Service) -> Result<ServiceStream> {
        // Fast path: the transponder is already up on some frontend.
        {
            let mut active = self.active.lock();
            let shared = active
                .muxes
                .iter()
                .find(|(_, m)| m.ready && m.transponder == *transponder)
                .map(|(&key, _)| key);
            if let Some(key) = shared {
                return self.attach_locked(&mut active, key, service);
            }

            // Otherwise reserve a free frontend of the right type.
            let Some(key) = self.select_free_frontend(&active, transponder) else {
                return Err(DvbError::NoFreeFrontend(service.name.clone()));
            };
            active.muxes.insert(
                key,
                ActiveMux {
                    transponder: transponder.clone(),
                    remux: Arc::new(Remux::new(self.config.remux.clone())),
                    services: 0,
                    ready: false,
                },
            );
            drop(active);

            if let Err(e) = self.bring_up(key, transponder) {
                let mut active = self.active.lock();
                active.muxes.remove(&key);
                return Err(e);
            }

            let mut active = self.active.lock();
            match active.muxes.get_mut(&key) {
                Some(mux) => mux.ready = true,
                None => return Err(DvbError::NoFreeFrontend(service.name.clone())),
            }
            self.attach_locked(&mut active, key, service)
        }
    }

    /// Finds a frontend matching the transponder's system that is neither
    /// serving another transponder nor mid-transition. Never steals.
    fn select_free_frontend(
        &self,
        active: &ActiveState,
        transponder: &Transponder,
    ) -> Option<(usize, usize)> {
        for (ai, adapter) in self.adapters.iter().enumerate() {
            for (fi, frontend) in adapter.frontends().iter().enumerate() {
                if frontend.lock().system() != transponder.system() {
                    continue;
                }
                if active.muxes.contains_key(&(ai, fi)) {
                    continue;
                }
                return Some((ai, fi));
            }
        }
        None
    }

    /// Tunes the reserved frontend, whitelists nothing yet, and starts the
    /// remux on a freshly opened DVR.
    fn bring_up(&self, key: (usize, usize), transponder: &Transponder) -> Result<()> {
        let (ai, fi) = key;
        let adapter = &self.adapters[ai];

        {
            let mut frontend = adapter.frontends()[fi].lock();
            match frontend.tune(transponder, &self.config.tune)? {
                TuneResult::Locked => {}
                other => {
                    return Err(DvbError::TuneFailed(format!(
                        "{transponder}: {other:?}"
                    )));
                }
            }
        }

        let dvr = {
            let mut demux = adapter.demux().lock();
            match demux.open_dvr() {
                Ok(dvr) => dvr,
                Err(e) => {
                    adapter.frontends()[fi].lock().release();
                    return Err(e);
                }
            }
        };

        let active = self.active.lock();
        if let Some(mux) = active.muxes.get(&key) {
            mux.remux.start(dvr);
        }
        Ok(())
    }

    /// Attaches a service to an up mux and records the stream. Called with
    /// the active-state lock held.
    fn attach_locked(
        &self,
        active: &mut ActiveState,
        key: (usize, usize),
        service: &Service,
    ) -> Result<ServiceStream> {
        let pids: Vec<u16> = std::iter::once(pid::PAT)
            .chain(service.pids().iter().copied())
            .collect();
        self.adapters[key.0]
            .demux()
            .lock()
            .select_pids(pids.iter().copied())?;

        let mux = match active.muxes.get_mut(&key) {
            Some(mux) => mux,
            None => {
                self.adapters[key.0]
                    .demux()
                    .lock()
                    .unselect_pids(pids.iter().copied());
                return Err(DvbError::NoFreeFrontend(service.name.clone()));
            }
        };
        let stream = mux.remux.attach(service);
        mux.services += 1;
        active.streams.insert(
            stream.id(),
            StreamEntry {
                key,
                sid: service.sid,
                pids,
            },
        );
        Ok(stream)
    }

    fn release_stream(&self, id: u64, sid: u16) {
        let mut active = self.active.lock();
        let Some(entry) = active.streams.remove(&id) else {
            return; // already freed
        };
        let key = entry.key;

        if let Some(mux) = active.muxes.get_mut(&key) {
            mux.remux.detach_ids(sid, id);
            mux.services = mux.services.saturating_sub(1);
        }
        self.adapters[key.0]
            .demux()
            .lock()
            .unselect_pids(entry.pids.iter().copied());

        let teardown = match active.muxes.get_mut(&key) {
            Some(mux) if mux.services == 0 => {
                // Keep the slot reserved while tearing down outside the lock.
                mux.ready = false;
                Some(Arc::clone(&mux.remux))
            }
            _ => None,
        };
        drop(active);

        if let Some(remux) = teardown {
            debug!("last stream on adapter {} frontend {} gone, tearing down", key.0, key.1);
            remux.stop();
            remux.wait();
            remux.flush();
            let adapter = &self.adapters[key.0];
            adapter.demux().lock().close_dvr();
            adapter.frontends()[key.1].lock().release();
            self.active.lock().muxes.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::time::{Duration, Instant};

    use crate::demux::Demux;
    use crate::frontend::Frontend;
    use crate::hw::mock::{MockDemux, MockFrontend, TuneBehavior};
    use crate::model::service::{ElementaryStream, RunningStatus, ServiceType};
    use crate::model::transponder::{Bandwidth, FecRate, Modulation, TuningParams};
    use crate::psi::pmt::stream_type;
    use crate::psi::{pat::PatTable, section::Section, TsPacket, SYNC_BYTE, TS_PACKET_SIZE};

    fn fast_config() -> DeviceConfig {
        DeviceConfig {
            unscrambled_only: true,
            max_adapters: 1,
            tune: TuneOptions {
                timeout: Duration::from_millis(10),
                retries: 1,
                initial_backoff: Duration::from_millis(1),
            },
            scan: ScanOptions {
                section_timeout: Duration::from_millis(20),
                tune: TuneOptions {
                    timeout: Duration::from_millis(10),
                    retries: 1,
                    initial_backoff: Duration::from_millis(1),
                },
            },
            remux: RemuxConfig {
                queue_capacity: 1024,
                enqueue_timeout: Duration::from_millis(5),
                pat_interval: 40,
                empty_read_backoff: Duration::from_millis(1),
                empty_read_limit: 10,
            },
        }
    }

    fn terrestrial(frequency: u64) -> Transponder {
        Transponder::new(TuningParams::Terrestrial {
            frequency,
            bandwidth: Bandwidth::Mhz8,
            modulation: Modulation::Qam64,
            code_rate_hp: FecRate::Fec2_3,
            code_rate_lp: FecRate::None,
        })
    }

    fn data_packet(pid: u16, cc: u8) -> Vec<u8> {
        let mut p = vec![SYNC_BYTE, ((pid >> 8) as u8) & 0x1F, pid as u8, 0x10 | (cc & 0x0F)];
        p.resize(TS_PACKET_SIZE, 0x00);
        p
    }

    fn channel_a() -> Service {
        let mut svc = Service::new("Channel-A", 101, 256);
        svc.service_type = ServiceType::DigitalTelevision;
        svc.status = RunningStatus::Running;
        svc.add_stream(ElementaryStream {
            pid: 512,
            stream_type: stream_type::MPEG2_VIDEO,
            language: None,
            descriptors: Vec::new(),
        });
        svc.add_stream(ElementaryStream {
            pid: 513,
            stream_type: stream_type::MPEG1_AUDIO,
            language: None,
            descriptors: Vec::new(),
        });
        svc
    }

    /// One adapter with one locking terrestrial frontend and a repeating
    /// DVR full of Channel-A packets.
    fn device_with_channel_a(
        scrambled_first: bool,
    ) -> (DvbDevice, std::sync::Arc<parking_lot::Mutex<crate::hw::mock::FrontendLog>>, std::sync::Arc<parking_lot::Mutex<crate::hw::mock::DemuxLog>>) {
        let frontend_mock =
            MockFrontend::new(DeliverySystem::Terrestrial, TuneBehavior::LockImmediately);
        let frontend_log = std::sync::Arc::clone(&frontend_mock.log);
        let mut frontend = Frontend::new("fe0", Box::new(frontend_mock));
        frontend.set_monitor_interval(None);

        let mut demux_mock = MockDemux::new();
        let mut dvr = Vec::new();
        for i in 0..8u8 {
            dvr.extend(data_packet(512, i));
            dvr.extend(data_packet(513, i));
        }
        demux_mock.set_dvr_data(dvr, true);
        let demux_log = std::sync::Arc::clone(&demux_mock.log);

        let adapter = Adapter::new(0, "mock0", vec![frontend], Demux::new(Box::new(demux_mock)));
        let device = DvbDevice::with_adapters(fast_config(), vec![adapter]);

        let mut catalog = Catalog::new();
        if scrambled_first {
            let t1 = catalog.insert_transponder("mock0", 0, terrestrial(506_000_000));
            let mut scrambled = channel_a();
            scrambled.scrambled = true;
            catalog.add_service(t1, scrambled);
            let t2 = catalog.insert_transponder("mock0", 0, terrestrial(522_000_000));
            catalog.add_service(t2, channel_a());
        } else {
            let t1 = catalog.insert_transponder("mock0", 0, terrestrial(506_000_000));
            catalog.add_service(t1, channel_a());
        }
        device.set_catalog(catalog);
        (device, frontend_log, demux_log)
    }

    #[test]
    fn unknown_service_is_a_clean_error() {
        let (device, _, _) = device_with_channel_a(false);
        assert!(matches!(
            device.get_stream("Nope"),
            Err(DvbError::ServiceNotFound(_))
        ));
    }

    #[test]
    fn stream_starts_with_service_pat() {
        let (device, frontend_log, _) = device_with_channel_a(false);
        let mut stream = device.get_stream("Channel-A").unwrap();

        let mut packet = [0u8; TS_PACKET_SIZE];
        let mut got = 0;
        while got < TS_PACKET_SIZE {
            let n = stream.read(&mut packet[got..]).unwrap();
            assert!(n > 0, "premature end of stream");
            got += n;
        }
        let pkt = TsPacket::parse(&packet).unwrap();
        assert_eq!(pkt.header.pid, crate::psi::pid::PAT);
        let pointer = pkt.payload[0] as usize;
        let pat = PatTable::parse(&Section::parse(&pkt.payload[1 + pointer..]).unwrap()).unwrap();
        assert_eq!(pat.programs.len(), 1);
        assert_eq!(pat.programs[0].program_number, 101);
        assert_eq!(pat.programs[0].pmt_pid, 256);

        assert_eq!(frontend_log.lock().tune_calls.len(), 1);
        device.free_stream(stream);
    }

    #[test]
    fn fan_out_opens_one_dvr_and_shares_the_frontend() {
        let (device, frontend_log, demux_log) = device_with_channel_a(false);
        let first = device.get_stream("Channel-A").unwrap();
        let second = device.get_stream("Channel-A").unwrap();

        assert_eq!(demux_log.lock().dvr_opens, 1);
        assert_eq!(frontend_log.lock().tune_calls.len(), 1);
        assert_eq!(device.active_stream_count(), 2);

        device.free_stream(first);
        // The mux survives the first free.
        assert_eq!(device.active_stream_count(), 1);
        assert!(device.adapters()[0].demux().lock().dvr_is_open());

        device.free_stream(second);
        assert_eq!(device.active_stream_count(), 0);
        assert!(!device.adapters()[0].demux().lock().dvr_is_open());
        assert!(device.adapters()[0].frontends()[0].lock().tuned().is_none());
    }

    #[test]
    fn unscrambled_policy_skips_the_scrambled_transponder() {
        let (device, frontend_log, _) = device_with_channel_a(true);
        let stream = device.get_stream("Channel-A").unwrap();
        // The first (scrambled) transponder at 506 MHz was skipped.
        assert_eq!(frontend_log.lock().tune_calls[0].frequency, 522_000_000);
        device.free_stream(stream);
    }

    #[test]
    fn free_stream_delivers_eos_promptly() {
        let (device, _, _) = device_with_channel_a(false);
        let handle = device.get_byte_queue("Channel-A").unwrap();
        let queue = std::sync::Arc::clone(&handle.queue);

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                if queue.read(&mut buf) == 0 {
                    return Instant::now();
                }
            }
        });
        std::thread::sleep(Duration::from_millis(30));

        let freed_at = Instant::now();
        device.free_byte_queue(handle);
        let eos_at = reader.join().unwrap();
        assert!(
            eos_at.duration_since(freed_at) < Duration::from_millis(250),
            "EOS took too long after free"
        );
    }

    #[test]
    fn close_releases_everything() {
        let (device, _, _) = device_with_channel_a(false);
        let _first = device.get_stream("Channel-A").unwrap();
        let _second = device.get_stream("Channel-A").unwrap();
        device.close();
        assert_eq!(device.active_stream_count(), 0);
        assert!(!device.adapters()[0].demux().lock().dvr_is_open());
        assert!(device.adapters()[0].frontends()[0].lock().tuned().is_none());
    }

    #[test]
    fn free_stream_is_idempotent_via_ids() {
        let (device, _, _) = device_with_channel_a(false);
        let stream = device.get_stream("Channel-A").unwrap();
        let (id, sid) = (stream.id(), stream.sid());
        device.free_stream(stream);
        // A second release of the same ids is a no-op.
        device.release_stream(id, sid);
        assert_eq!(device.active_stream_count(), 0);
    }

    #[test]
    fn busy_frontend_is_not_stolen() {
        let (device, _, _) = device_with_channel_a(false);
        // Second catalog entry on a different transponder, same frontend.
        let mut catalog = Catalog::new();
        let t1 = catalog.insert_transponder("mock0", 0, terrestrial(506_000_000));
        catalog.add_service(t1, channel_a());
        let t2 = catalog.insert_transponder("mock0", 0, terrestrial(522_000_000));
        let mut other = Service::new("Channel-B", 202, 300);
        other.add_stream(ElementaryStream {
            pid: 600,
            stream_type: stream_type::MPEG2_VIDEO,
            language: None,
            descriptors: Vec::new(),
        });
        catalog.add_service(t2, other);
        device.set_catalog(catalog);

        let stream = device.get_stream("Channel-A").unwrap();
        // Channel-B needs the only frontend, which has an active service.
        assert!(matches!(
            device.get_stream("Channel-B"),
            Err(DvbError::NoFreeFrontend(_))
        ));
        device.free_stream(stream);
        // Once freed, the frontend can be retuned.
        let stream_b = device.get_stream("Channel-B").unwrap();
        device.free_stream(stream_b);
    }

    #[test]
    fn scan_populates_catalog_end_to_end() {
        use crate::psi::section::test_util::build_section;
        use crate::psi::{descriptor_tag, pid, table_id};

        let frontend_mock =
            MockFrontend::new(DeliverySystem::Terrestrial, TuneBehavior::LockImmediately);
        let mut frontend = Frontend::new("fe0", Box::new(frontend_mock));
        frontend.set_monitor_interval(None);

        let mut demux_mock = MockDemux::new();
        demux_mock.queue_section(
            pid::PAT,
            table_id::PAT,
            build_section(table_id::PAT, 1, 0, &[0x00, 0x65, 0xE1, 0x00]),
        );
        let mut sdt_payload = vec![0x00, 0x01, 0xFF];
        let descriptor = {
            let mut d = vec![descriptor_tag::SERVICE, 0, 0x01, 4];
            d.extend_from_slice(b"Prov");
            d.push(9);
            d.extend_from_slice(b"Channel-A");
            d[1] = (d.len() - 2) as u8;
            d
        };
        sdt_payload.extend_from_slice(&[0x00, 0x65, 0x01, 4 << 5, descriptor.len() as u8]);
        sdt_payload.extend_from_slice(&descriptor);
        demux_mock.queue_section(
            pid::SDT,
            table_id::SDT_ACTUAL,
            build_section(table_id::SDT_ACTUAL, 1, 0, &sdt_payload),
        );
        demux_mock.queue_section(
            0x100,
            table_id::PMT,
            build_section(
                table_id::PMT,
                0x65,
                0,
                &[0xE2, 0x00, 0xF0, 0x00, 0x02, 0xE2, 0x00, 0xF0, 0x00],
            ),
        );

        let adapter = Adapter::new(0, "mock0", vec![frontend], Demux::new(Box::new(demux_mock)));
        let device = DvbDevice::with_adapters(fast_config(), vec![adapter]);
        device
            .add_initial_transponders(
                DeliverySystem::Terrestrial,
                "T 506000000 8MHz 2/3 NONE QAM64",
            )
            .unwrap();

        let mut notified = Vec::new();
        let summary = device.scan(|s| notified.push(s.name.clone()));
        assert_eq!(summary.services_found, 1);
        assert_eq!(notified, vec!["Channel-A"]);
        assert_eq!(
            device.with_catalog(|c| c.transponders_for("Channel-A").len()),
            1
        );

        // And the scan result survives an XML round trip.
        let xml = device.write_xml().unwrap();
        let reloaded = Catalog::from_xml(&xml).unwrap();
        assert_eq!(device.with_catalog(|c| c.clone()), reloaded);
    }
}
